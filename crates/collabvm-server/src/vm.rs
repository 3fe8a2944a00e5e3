//! Admin VMs and the registry that publishes their metadata to list
//! viewers.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use collabvm_proto::constants::MAX_VM_DESCRIPTION_LEN;
use collabvm_proto::messages::TurnInfo;
use collabvm_proto::{
    AdminVmInfo, RemoteInstruction, ServerMessage, VmInfo, VmSettingUpdate, VmSettings,
};

use crate::channel::UserChannel;
use crate::guard::Guard;
use crate::recording::{RecordingController, RecordingEvent};
use crate::remote::RemoteDesktop;
use crate::session::{shared_frame, Connection, ConnectionId};
use crate::turn::TurnController;

pub const THUMBNAIL_WIDTH: u32 = 400;
pub const THUMBNAIL_HEIGHT: u32 = 300;

/// Everything one VM owns: its settings, channel, turn controller,
/// recording controller, and the handle to its remote-desktop client. Lives
/// behind its own guard so VMs never block each other.
pub struct AdminVm {
    pub id: u32,
    pub settings: VmSettings,
    pub channel: UserChannel,
    pub turn: TurnController,
    pub recording: RecordingController,
    pub remote: Box<dyn RemoteDesktop>,
    pub running: bool,
}

/// The staging record each VM fills during a registry update pass.
pub struct StagedVmInfo {
    pub admin: AdminVmInfo,
    pub public: Option<VmInfo>,
    pub thumbnail: Option<Vec<u8>>,
}

impl AdminVm {
    pub fn new(
        id: u32,
        settings: VmSettings,
        remote: Box<dyn RemoteDesktop>,
        recordings_dir: PathBuf,
    ) -> Self {
        let turn_time = Duration::from_secs(u64::from(settings.turn_time.max(1)));
        Self {
            id,
            settings,
            channel: UserChannel::new(id),
            turn: TurnController::new(turn_time),
            recording: RecordingController::new(id, recordings_dir),
            remote,
            running: false,
        }
    }

    pub fn apply_modifications(&mut self, modifications: &[VmSettingUpdate]) {
        for update in modifications {
            self.settings.apply(update);
        }
        self.turn
            .set_turn_time(Duration::from_secs(u64::from(self.settings.turn_time.max(1))));
    }

    pub fn start(&mut self, now_ms: u64) -> Vec<RecordingEvent> {
        if self.running {
            return Vec::new();
        }
        tracing::info!(vm_id = self.id, name = %self.settings.name, "starting VM");
        self.remote.start();
        self.running = true;
        self.recording.start(now_ms)
    }

    pub fn stop(&mut self, now_ms: u64) -> Vec<RecordingEvent> {
        if !self.running {
            return Vec::new();
        }
        tracing::info!(vm_id = self.id, "stopping VM");
        let events = self.recording.stop(now_ms);
        self.remote.stop();
        self.running = false;
        events
    }

    /// Restart the remote-desktop client; an in-progress recording keeps
    /// running across the restart.
    pub fn restart(&mut self) {
        if !self.running {
            return;
        }
        tracing::info!(vm_id = self.id, "restarting VM");
        self.remote.stop();
        self.remote.start();
    }

    /// Fill a staging record for the registry's list rebuild. Public info
    /// and a thumbnail are published only while the VM runs.
    pub fn produce_info(&self) -> StagedVmInfo {
        let online_count = self.channel.user_count() as u32;
        StagedVmInfo {
            admin: AdminVmInfo {
                id: self.id,
                name: self.settings.name.clone(),
                running: self.running,
                online_count,
            },
            public: self.running.then(|| VmInfo {
                id: self.id,
                name: self.settings.name.clone(),
                description: self.settings.description.clone(),
                online_count,
                turns_enabled: self.settings.turns_enabled,
            }),
            thumbnail: if self.running {
                self.remote.screenshot(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)
            } else {
                None
            },
        }
    }

    pub fn turn_info(&self) -> TurnInfo {
        let username_of = |id: ConnectionId| {
            self.channel
                .get_user(id)
                .map(|user| user.username.clone())
        };
        TurnInfo {
            channel: self.id,
            holder: self.turn.holder().and_then(username_of),
            queue: self.turn.queue().filter_map(username_of).collect(),
            millis_remaining: self.turn.millis_remaining(),
            paused: self.turn.is_paused(),
        }
    }

    pub fn broadcast_turn_info(&self) {
        self.channel
            .broadcast_message(&ServerMessage::TurnInfo(self.turn_info()));
    }

    /// Forward an input instruction if `from` currently holds the turn.
    pub fn forward_input(&mut self, from: ConnectionId, instruction: &RemoteInstruction) {
        if self.turn.holder() == Some(from) && self.running {
            self.remote.send_input(instruction);
        }
    }
}

pub fn validate_vm_modification(update: &VmSettingUpdate) -> bool {
    match update {
        VmSettingUpdate::TurnTime(t) => *t > 0,
        VmSettingUpdate::Description(d) => d.chars().count() <= MAX_VM_DESCRIPTION_LEN,
        _ => true,
    }
}

/// An immutable published list. Every mutation copies the entries forward
/// into a freshly encoded frame; frames handed out earlier stay untouched,
/// which is what lets broadcasts snapshot without locking.
pub struct PublishedList<T: Clone> {
    entries: Vec<T>,
    frame: Bytes,
    generation: u64,
    build: fn(Vec<T>) -> ServerMessage,
}

impl<T: Clone> PublishedList<T> {
    pub fn new(build: fn(Vec<T>) -> ServerMessage) -> Self {
        let mut list = Self {
            entries: Vec::new(),
            frame: Bytes::new(),
            generation: 0,
            build,
        };
        list.republish();
        list
    }

    pub fn message(&self) -> Bytes {
        self.frame.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn contains(&self, predicate: impl Fn(&T) -> bool) -> bool {
        self.entries.iter().any(predicate)
    }

    pub fn add(&mut self, entry: T) {
        self.entries.push(entry);
        self.republish();
    }

    pub fn remove_first(&mut self, predicate: impl Fn(&T) -> bool) {
        if let Some(pos) = self.entries.iter().position(predicate) {
            self.entries.remove(pos);
            self.republish();
        }
    }

    pub fn update_element(&mut self, predicate: impl Fn(&T) -> bool, entry: T) {
        for slot in self.entries.iter_mut().filter(|slot| predicate(slot)) {
            *slot = entry.clone();
        }
        self.republish();
    }

    pub fn reset(&mut self, entries: Vec<T>) {
        self.entries = entries;
        self.republish();
    }

    fn republish(&mut self) {
        let message = (self.build)(self.entries.clone());
        self.frame = shared_frame(&message).unwrap_or_default();
        self.generation += 1;
    }
}

struct VmEntry {
    vm: Arc<Guard<AdminVm>>,
    /// Whether the public list currently carries an entry for this VM.
    has_vm_info: bool,
}

/// The map of VM id to VM plus the two published lists and their viewer
/// subscriptions. All mutation happens under the registry's guard.
pub struct VmRegistry {
    vms: BTreeMap<u32, VmEntry>,
    vm_list_viewers: HashMap<ConnectionId, Arc<Connection>>,
    admin_vm_list_viewers: HashMap<ConnectionId, Arc<Connection>>,
    public_list: PublishedList<VmInfo>,
    admin_list: PublishedList<AdminVmInfo>,
    thumbnails: BTreeMap<u32, Bytes>,
    update_in_flight: bool,
}

impl Default for VmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl VmRegistry {
    pub fn new() -> Self {
        Self {
            vms: BTreeMap::new(),
            vm_list_viewers: HashMap::new(),
            admin_vm_list_viewers: HashMap::new(),
            public_list: PublishedList::new(ServerMessage::VmList),
            admin_list: PublishedList::new(ServerMessage::AdminVmList),
            thumbnails: BTreeMap::new(),
            update_in_flight: false,
        }
    }

    pub fn insert_vm(&mut self, id: u32, vm: Arc<Guard<AdminVm>>) {
        self.vms.insert(
            id,
            VmEntry {
                vm,
                has_vm_info: false,
            },
        );
    }

    pub fn get_vm(&self, id: u32) -> Option<Arc<Guard<AdminVm>>> {
        self.vms.get(&id).map(|entry| Arc::clone(&entry.vm))
    }

    pub fn vm_ids(&self) -> Vec<u32> {
        self.vms.keys().copied().collect()
    }

    pub fn all_vms(&self) -> Vec<(u32, Arc<Guard<AdminVm>>)> {
        self.vms
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.vm)))
            .collect()
    }

    /// Remove a VM from the registry and both published lists. The caller
    /// stops the VM and clears its channel.
    pub fn remove_vm(&mut self, id: u32) -> Option<Arc<Guard<AdminVm>>> {
        let entry = self.vms.remove(&id)?;
        self.admin_list.remove_first(|info| info.id == id);
        if entry.has_vm_info {
            self.public_list.remove_first(|info| info.id == id);
        }
        self.thumbnails.remove(&id);
        Some(entry.vm)
    }

    pub fn admin_list_message(&self) -> Bytes {
        self.admin_list.message()
    }

    pub fn public_list_message(&self) -> Bytes {
        self.public_list.message()
    }

    /// Subscribe a viewer and hand back the current list plus thumbnails.
    pub fn add_vm_list_viewer(&mut self, conn: Arc<Connection>) -> Vec<Bytes> {
        let mut frames = vec![self.public_list.message()];
        frames.extend(self.thumbnails.values().cloned());
        self.vm_list_viewers.insert(conn.id, conn);
        frames
    }

    pub fn remove_vm_list_viewer(&mut self, id: ConnectionId) {
        self.vm_list_viewers.remove(&id);
    }

    pub fn add_admin_vm_list_viewer(&mut self, conn: Arc<Connection>) -> Bytes {
        self.admin_vm_list_viewers.insert(conn.id, conn);
        self.admin_list.message()
    }

    pub fn remove_admin_vm_list_viewer(&mut self, id: ConnectionId) {
        self.admin_vm_list_viewers.remove(&id);
    }

    pub fn broadcast_to_vm_list_viewers(&self, frames: &[Bytes]) {
        for viewer in self.vm_list_viewers.values() {
            for frame in frames {
                viewer.queue_frame(frame.clone());
            }
        }
    }

    pub fn broadcast_to_admin_viewers(&self, frame: Bytes, exclude: Option<ConnectionId>) {
        for viewer in self.admin_vm_list_viewers.values() {
            if Some(viewer.id) == exclude {
                continue;
            }
            viewer.queue_frame(frame.clone());
        }
    }

    /// Begin a bulk info refresh. `None` while one is already pending.
    pub fn begin_bulk_update(&mut self) -> Option<Vec<(u32, Arc<Guard<AdminVm>>)>> {
        if self.update_in_flight {
            return None;
        }
        self.update_in_flight = true;
        Some(self.all_vms())
    }

    /// All staging records returned: rebuild both lists, refresh the
    /// thumbnail cache, and broadcast the fresh snapshots.
    pub fn finish_bulk_update(&mut self, staged: Vec<(u32, StagedVmInfo)>) {
        self.update_in_flight = false;

        let mut admin_entries = Vec::with_capacity(staged.len());
        let mut public_entries = Vec::new();
        for (vm_id, info) in staged {
            if let Some(entry) = self.vms.get_mut(&vm_id) {
                entry.has_vm_info = info.public.is_some();
            } else {
                // Deleted while the update was in flight.
                continue;
            }
            if let Some(png) = info.thumbnail {
                if let Some(frame) =
                    shared_frame(&ServerMessage::VmThumbnail { id: vm_id, png })
                {
                    self.thumbnails.insert(vm_id, frame);
                }
            }
            if let Some(public) = info.public {
                public_entries.push(public);
            }
            admin_entries.push(info.admin);
        }
        admin_entries.sort_by_key(|info| info.id);
        public_entries.sort_by_key(|info| info.id);
        self.admin_list.reset(admin_entries);
        self.public_list.reset(public_entries);

        let mut frames = vec![self.public_list.message()];
        frames.extend(self.thumbnails.values().cloned());
        self.broadcast_to_vm_list_viewers(&frames);
        self.broadcast_to_admin_viewers(self.admin_list.message(), None);
    }

    /// Fast path for a single VM: edit the published entries in place and
    /// broadcast. Skipped while a bulk update is pending, which will rebuild
    /// everything anyway.
    pub fn apply_single_update(&mut self, vm_id: u32, info: StagedVmInfo) {
        if self.update_in_flight {
            return;
        }
        if !self.vms.contains_key(&vm_id) {
            return;
        }

        if self.admin_list.contains(|i| i.id == vm_id) {
            self.admin_list.update_element(|i| i.id == vm_id, info.admin);
        } else {
            self.admin_list.add(info.admin);
        }
        self.broadcast_to_admin_viewers(self.admin_list.message(), None);

        let entry = self.vms.get_mut(&vm_id).unwrap();
        let had_info = entry.has_vm_info;
        match (had_info, info.public) {
            (true, Some(public)) => {
                self.public_list.update_element(|i| i.id == vm_id, public);
            }
            (true, None) => {
                entry.has_vm_info = false;
                self.public_list.remove_first(|i| i.id == vm_id);
            }
            (false, Some(public)) => {
                entry.has_vm_info = true;
                self.public_list.add(public);
            }
            (false, None) => return,
        }
        let mut frames = vec![self.public_list.message()];
        if let Some(png) = info.thumbnail {
            if let Some(frame) = shared_frame(&ServerMessage::VmThumbnail { id: vm_id, png }) {
                self.thumbnails.insert(vm_id, frame.clone());
                frames.push(frame);
            }
        }
        self.broadcast_to_vm_list_viewers(&frames);
    }
}
