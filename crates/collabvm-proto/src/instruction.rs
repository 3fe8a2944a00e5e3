use serde::{Deserialize, Serialize};

/// One instruction of the remote-desktop stream.
///
/// The server relays these verbatim between the remote-desktop client
/// library and connected users, and the recording subsystem filters them by
/// kind before writing them to disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteInstruction {
    /// Display synchronization point carrying the frame timestamp in
    /// milliseconds. Playback uses these to advance its virtual clock.
    Sync(u64),
    /// A chunk of encoded audio.
    Audio(Vec<u8>),
    Mouse { x: i32, y: i32, buttons: u32 },
    Key { keysym: u32, pressed: bool },
    /// Any other display-level operation (draw, img, copy, ...).
    Display { opcode: String, args: Vec<String> },
}

impl RemoteInstruction {
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            RemoteInstruction::Mouse { .. } | RemoteInstruction::Key { .. }
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, RemoteInstruction::Audio(_))
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, RemoteInstruction::Sync(_))
    }
}
