//! Seams for the remote-desktop protocol client and the screenshot
//! compositor. Both live outside this crate; the server only relays
//! instruction streams and PNG bytes.

use tokio::sync::mpsc;

use collabvm_proto::{RemoteInstruction, VmSettings};

/// Batches of instructions emitted by a VM's remote-desktop client, tagged
/// with the VM id. The server broadcasts each batch to the VM's channel and
/// feeds it to the recording controller.
pub type InstructionSink = mpsc::UnboundedSender<(u32, Vec<RemoteInstruction>)>;

/// Handle to one VM's remote-desktop connection.
pub trait RemoteDesktop: Send {
    fn start(&mut self);
    fn stop(&mut self);
    /// Forward an input instruction from the current turn holder.
    fn send_input(&mut self, instruction: &RemoteInstruction);
    /// Render the current display as a PNG, downscaled to fit the bounds.
    fn screenshot(&self, max_width: u32, max_height: u32) -> Option<Vec<u8>>;
    /// Instructions that reproduce the current display from scratch. Written
    /// to recordings at keyframe boundaries so playback can resume there.
    fn snapshot_instructions(&self) -> Vec<RemoteInstruction>;
}

pub trait RemoteDesktopFactory: Send + Sync {
    fn create(
        &self,
        vm_id: u32,
        settings: &VmSettings,
        instructions: InstructionSink,
    ) -> Box<dyn RemoteDesktop>;
}

/// Replays a recorded instruction stream into an off-screen display.
pub trait Compositor: Send {
    fn apply(&mut self, instruction: &RemoteInstruction);
    fn render_png(&self, max_width: u32, max_height: u32) -> Option<Vec<u8>>;
}

pub trait CompositorFactory: Send + Sync {
    fn create(&self) -> Box<dyn Compositor>;
}

/// A remote desktop that never produces output. Stands in when no protocol
/// client library is linked, and in tests.
pub struct NullRemoteDesktop;

impl RemoteDesktop for NullRemoteDesktop {
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn send_input(&mut self, _instruction: &RemoteInstruction) {}
    fn screenshot(&self, _max_width: u32, _max_height: u32) -> Option<Vec<u8>> {
        None
    }
    fn snapshot_instructions(&self) -> Vec<RemoteInstruction> {
        Vec::new()
    }
}

pub struct NullRemoteDesktopFactory;

impl RemoteDesktopFactory for NullRemoteDesktopFactory {
    fn create(
        &self,
        _vm_id: u32,
        _settings: &VmSettings,
        _instructions: InstructionSink,
    ) -> Box<dyn RemoteDesktop> {
        Box::new(NullRemoteDesktop)
    }
}

/// Tracks only the virtual clock and renders nothing.
pub struct NullCompositor;

impl Compositor for NullCompositor {
    fn apply(&mut self, _instruction: &RemoteInstruction) {}
    fn render_png(&self, _max_width: u32, _max_height: u32) -> Option<Vec<u8>> {
        None
    }
}

pub struct NullCompositorFactory;

impl CompositorFactory for NullCompositorFactory {
    fn create(&self) -> Box<dyn Compositor> {
        Box::new(NullCompositor)
    }
}
