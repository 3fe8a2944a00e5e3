//! Server façade: owns every guard, wires the subsystems together, and
//! drives the periodic VM-info refresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use collabvm_proto::{RemoteInstruction, ServerMessage, ServerSettings};
use collabvm_store::Database;

use crate::auth::{AcceptAllCaptcha, CaptchaGate, CaptchaVerifier, RejectAllTotp, TotpValidator};
use crate::channel::UserChannel;
use crate::config::ServerConfig;
use crate::guard::Guard;
use crate::recording::RecordingEvent;
use crate::registry::{GuestMap, IpData, IpMap, SessionMap};
use crate::remote::{
    CompositorFactory, NullCompositorFactory, NullRemoteDesktopFactory, RemoteDesktopFactory,
};
use crate::session::{Connection, ConnectionId};
use crate::settings::SettingsStore;
use crate::turn::ArmTimer;
use crate::vm::{AdminVm, VmRegistry};

pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

type InstructionBatch = (u32, Vec<RemoteInstruction>);

/// External collaborators injected at construction.
pub struct ServerDeps {
    pub captcha: Box<dyn CaptchaVerifier>,
    pub totp: Box<dyn TotpValidator>,
    pub remotes: Box<dyn RemoteDesktopFactory>,
    pub compositors: Arc<dyn CompositorFactory>,
}

impl Default for ServerDeps {
    fn default() -> Self {
        Self {
            captcha: Box::new(AcceptAllCaptcha),
            totp: Box::new(RejectAllTotp),
            remotes: Box::new(NullRemoteDesktopFactory),
            compositors: Arc::new(NullCompositorFactory),
        }
    }
}

pub struct CollabVmServer {
    pub config: ServerConfig,
    pub(crate) db: Guard<Database>,
    pub(crate) settings: Guard<SettingsStore>,
    pub(crate) sessions: Guard<SessionMap>,
    pub(crate) guests: Guard<GuestMap>,
    pub(crate) ip_data: Guard<IpMap>,
    pub(crate) vms: Guard<VmRegistry>,
    pub(crate) global_channel: Guard<UserChannel>,
    pub(crate) captcha: CaptchaGate,
    pub(crate) totp: Box<dyn TotpValidator>,
    pub(crate) compositors: Arc<dyn CompositorFactory>,
    pub(crate) remotes: Box<dyn RemoteDesktopFactory>,
    pub(crate) instruction_tx: mpsc::UnboundedSender<InstructionBatch>,
    instruction_rx: Guard<Option<mpsc::UnboundedReceiver<InstructionBatch>>>,
    next_connection_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl CollabVmServer {
    pub async fn new(config: ServerConfig, deps: ServerDeps) -> crate::error::Result<Arc<Self>> {
        let database = Database::open_at(&config.database_path)?;
        let settings = database.load_server_settings()?;
        let stored_vms = database.read_all_vm_settings()?;

        let (instruction_tx, instruction_rx) = mpsc::unbounded_channel();
        let mut registry = VmRegistry::new();
        for (vm_id, vm_settings) in stored_vms {
            let remote = deps
                .remotes
                .create(vm_id, &vm_settings, instruction_tx.clone());
            let vm = AdminVm::new(
                vm_id,
                vm_settings,
                remote,
                config.recordings_path.clone(),
            );
            registry.insert_vm(vm_id, Arc::new(Guard::new(vm)));
        }
        tracing::info!(vm_count = registry.vm_ids().len(), "loaded VMs from store");

        let captcha = CaptchaGate::new(deps.captcha);
        captcha.set_settings(settings.captcha.clone()).await;

        let (shutdown_tx, _) = watch::channel(false);
        let server = Arc::new(Self {
            config,
            db: Guard::new(database),
            settings: Guard::new(SettingsStore::new(settings.clone())),
            sessions: Guard::new(HashMap::new()),
            guests: Guard::new(HashMap::new()),
            ip_data: Guard::new(HashMap::new()),
            vms: Guard::new(registry),
            global_channel: Guard::new(UserChannel::new(
                collabvm_proto::constants::GLOBAL_CHANNEL_ID,
            )),
            captcha,
            totp: deps.totp,
            compositors: deps.compositors,
            remotes: deps.remotes,
            instruction_tx,
            instruction_rx: Guard::new(Some(instruction_rx)),
            next_connection_id: AtomicU64::new(1),
            shutdown_tx,
        });

        server.propagate_recording_settings(&settings).await;
        Ok(server)
    }

    /// Auto-start VMs, publish the initial lists, and spawn the background
    /// tasks: the instruction pump and the periodic VM-info refresh.
    pub async fn start(self: &Arc<Self>) {
        if self.config.auto_start_vms {
            for (vm_id, vm) in self.vms.dispatch(|r| r.all_vms()).await {
                let events = vm
                    .dispatch(|vm| {
                        if vm.settings.auto_start {
                            vm.start(now_ms())
                        } else {
                            Vec::new()
                        }
                    })
                    .await;
                self.process_recording_events(vm_id, events).await;
            }
        }
        self.update_vm_info_list().await;

        if let Some(rx) = self.instruction_rx.dispatch(|slot| slot.take()).await {
            let server = Arc::clone(self);
            tokio::spawn(async move { server.instruction_pump(rx).await });
        }

        let server = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.vm_info_update_frequency);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.update_vm_info_list().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Cancel the refresh timer and stop every VM, persisting recording
    /// stop times.
    pub async fn stop(self: &Arc<Self>) {
        self.shutdown_tx.send_replace(true);
        for (vm_id, vm) in self.vms.dispatch(|r| r.all_vms()).await {
            let events = vm.dispatch(|vm| vm.stop(now_ms())).await;
            self.process_recording_events(vm_id, events).await;
        }
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn get_vm(&self, vm_id: u32) -> Option<Arc<Guard<AdminVm>>> {
        self.vms.dispatch(move |r| r.get_vm(vm_id)).await
    }

    /// Per-IP admission check, run before the connection exists. Increments
    /// the IP's open-connection count; over the limit the increment is
    /// undone and the transport closes the socket without a session.
    pub async fn pre_connect(&self, ip: std::net::IpAddr) -> bool {
        let settings = self.settings.dispatch(|s| s.snapshot()).await;
        let ip_bytes = crate::session::ip_to_bytes(ip);
        let ip_entry = self
            .ip_data
            .dispatch(move |map| {
                Arc::clone(
                    map.entry(ip_bytes)
                        .or_insert_with(|| Arc::new(Guard::new(IpData::default()))),
                )
            })
            .await;
        ip_entry
            .dispatch(move |data| {
                data.connections += 1;
                if settings.max_connections_enabled
                    && data.connections > settings.max_connections
                {
                    data.connections -= 1;
                    return false;
                }
                true
            })
            .await
    }

    /// Create the connection object once admission passed. The captcha
    /// requirement is seeded from the current settings snapshot.
    pub async fn register_connection(
        &self,
        ip: std::net::IpAddr,
    ) -> (Arc<Connection>, mpsc::Receiver<bytes::Bytes>) {
        let captcha_required = self
            .settings
            .dispatch(|s| s.snapshot().captcha_required)
            .await;
        let id = self.next_connection_id();
        tracing::debug!(connection = id, ip = %ip, "connection registered");
        Connection::new(id, ip, captcha_required)
    }

    /// Remove a disconnecting client from every collection it appears in.
    pub async fn disconnect(self: &Arc<Self>, conn: &Arc<Connection>) {
        conn.close();
        let (username, session_id, connected_vm, in_global, viewing_vm_list, viewing_config) =
            conn.state
                .dispatch(|s| {
                    (
                        std::mem::take(&mut s.username),
                        s.session_id.take(),
                        std::mem::replace(&mut s.connected_vm, 0),
                        std::mem::replace(&mut s.in_global_chat, false),
                        std::mem::replace(&mut s.viewing_vm_list, false),
                        std::mem::replace(&mut s.viewing_server_config, false),
                    )
                })
                .await;
        tracing::debug!(connection = conn.id, username = %username, "disconnect");

        let conn_id = conn.id;
        if viewing_vm_list || viewing_config {
            self.vms
                .dispatch(move |r| {
                    if viewing_vm_list {
                        r.remove_vm_list_viewer(conn_id);
                    }
                    if viewing_config {
                        r.remove_admin_vm_list_viewer(conn_id);
                    }
                })
                .await;
        }

        if !username.is_empty() {
            let key = crate::session::guest_key(&username);
            self.guests
                .dispatch(move |guests| {
                    if guests.get(&key).is_some_and(|c| c.id == conn_id) {
                        guests.remove(&key);
                    }
                })
                .await;
        }

        if let Some(session_id) = session_id {
            self.sessions
                .dispatch(move |sessions| {
                    if sessions.get(&session_id).is_some_and(|c| c.id == conn_id) {
                        sessions.remove(&session_id);
                    }
                })
                .await;
        }

        if connected_vm != 0 {
            if let Some(vm) = self.get_vm(connected_vm).await {
                let cmd = vm
                    .dispatch(move |vm| {
                        vm.channel.remove_user(conn_id);
                        let (changed, cmd) = vm.turn.remove(conn_id);
                        if changed {
                            vm.broadcast_turn_info();
                        }
                        cmd
                    })
                    .await;
                if let Some(cmd) = cmd {
                    self.spawn_turn_timer(connected_vm, cmd);
                }
            }
        }
        if in_global {
            self.global_channel
                .dispatch(move |channel| {
                    channel.remove_user(conn_id);
                })
                .await;
        }

        let ip_bytes = conn.ip_bytes;
        let ip_entry = self
            .ip_data
            .dispatch(move |map| map.get(&ip_bytes).cloned())
            .await;
        if let Some(ip_entry) = ip_entry {
            ip_entry
                .dispatch(|data| {
                    data.connections = data.connections.saturating_sub(1);
                })
                .await;
        }
    }

    /// Reconfigure dependents after a settings swap: the captcha gate and
    /// every VM's recording controller.
    pub(crate) async fn apply_settings(
        self: &Arc<Self>,
        new: &ServerSettings,
        old: Option<&ServerSettings>,
    ) {
        self.captcha.set_settings(new.captcha.clone()).await;
        if old.map_or(true, |old| old.recordings != new.recordings) {
            self.propagate_recording_settings(new).await;
        }
    }

    async fn propagate_recording_settings(self: &Arc<Self>, settings: &ServerSettings) {
        let recordings = settings.recordings;
        for (vm_id, vm) in self.vms.dispatch(|r| r.all_vms()).await {
            let events = vm
                .dispatch(move |vm| vm.recording.set_settings(recordings, now_ms()))
                .await;
            self.process_recording_events(vm_id, events).await;
        }
    }

    /// Bulk refresh: fan a staging request out to every VM, then rebuild
    /// the published lists and broadcast them once all records returned.
    pub(crate) async fn update_vm_info_list(self: &Arc<Self>) {
        let Some(vms) = self.vms.dispatch(|r| r.begin_bulk_update()).await else {
            // An update is already pending.
            return;
        };
        let mut staged = Vec::with_capacity(vms.len());
        for (vm_id, vm) in vms {
            staged.push((vm_id, vm.dispatch(|vm| vm.produce_info()).await));
        }
        self.vms
            .dispatch(move |r| r.finish_bulk_update(staged))
            .await;
    }

    /// Single-VM fast path after a config change.
    pub(crate) async fn update_single_vm_info(self: &Arc<Self>, vm_id: u32) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let staged = vm.dispatch(|vm| vm.produce_info()).await;
        self.vms
            .dispatch(move |r| r.apply_single_update(vm_id, staged))
            .await;
    }

    pub(crate) fn spawn_turn_timer(self: &Arc<Self>, vm_id: u32, cmd: ArmTimer) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(cmd.duration).await;
            server.turn_expired(vm_id, cmd.epoch).await;
        });
    }

    fn turn_expired(self: Arc<Self>, vm_id: u32, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(vm) = self.get_vm(vm_id).await else {
                return;
            };
            let cmd = vm
                .dispatch(move |vm| {
                    if !vm.turn.is_current_epoch(epoch) {
                        return None;
                    }
                    let cmd = vm.turn.end_turn(None);
                    vm.broadcast_turn_info();
                    cmd
                })
                .await;
            if let Some(cmd) = cmd {
                self.spawn_turn_timer(vm_id, cmd);
            }
        })
    }

    /// Perform the side effects a recording mutation asked for: persist
    /// start/stop times, spawn roll-over and keyframe timers, and flush
    /// display snapshots after keyframes.
    pub(crate) fn process_recording_events(
        self: &Arc<Self>,
        vm_id: u32,
        events: Vec<RecordingEvent>,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            for event in events {
                match event {
                    RecordingEvent::Started { path, at_ms } => {
                        let result = self
                            .db
                            .dispatch(move |db| db.set_recording_start(vm_id, &path, at_ms))
                            .await;
                        if let Err(err) = result {
                            tracing::error!(vm_id, error = %err, "failed to index recording start");
                        }
                    }
                    RecordingEvent::Stopped { path, at_ms } => {
                        let result = self
                            .db
                            .dispatch(move |db| db.set_recording_stop(vm_id, &path, at_ms))
                            .await;
                        if let Err(err) = result {
                            tracing::error!(vm_id, error = %err, "failed to index recording stop");
                        }
                    }
                    RecordingEvent::ArmStopTimer(cmd) => {
                        let server = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep(cmd.duration).await;
                            server.recording_rollover_fired(vm_id, cmd.epoch).await;
                        });
                    }
                    RecordingEvent::ArmKeyframeTimer(cmd) => {
                        let server = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep(cmd.duration).await;
                            server.recording_keyframe_fired(vm_id, cmd.epoch).await;
                        });
                    }
                    RecordingEvent::KeyframeFlush => {
                        if let Some(vm) = self.get_vm(vm_id).await {
                            vm.dispatch(|vm| {
                                for instruction in vm.remote.snapshot_instructions() {
                                    vm.recording
                                        .write_message(&ServerMessage::Instruction(instruction));
                                }
                            })
                            .await;
                        }
                    }
                }
            }
        })
    }

    fn recording_rollover_fired(self: Arc<Self>, vm_id: u32, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(vm) = self.get_vm(vm_id).await else {
                return;
            };
            let events = vm
                .dispatch(move |vm| vm.recording.stop_timer_fired(epoch, now_ms()))
                .await;
            self.process_recording_events(vm_id, events).await;
        })
    }

    fn recording_keyframe_fired(self: Arc<Self>, vm_id: u32, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(vm) = self.get_vm(vm_id).await else {
                return;
            };
            let events = vm
                .dispatch(move |vm| vm.recording.keyframe(epoch, now_ms()))
                .await;
            self.process_recording_events(vm_id, events).await;
        })
    }

    /// Relay instruction batches from remote-desktop clients: broadcast to
    /// the VM's channel and append to its recording.
    async fn instruction_pump(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<InstructionBatch>,
    ) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                batch = rx.recv() => {
                    let Some((vm_id, instructions)) = batch else {
                        break;
                    };
                    let Some(vm) = self.get_vm(vm_id).await else {
                        continue;
                    };
                    vm.dispatch(move |vm| {
                        for instruction in instructions {
                            let message = ServerMessage::Instruction(instruction);
                            vm.recording.write_message(&message);
                            vm.channel.broadcast_message(&message);
                        }
                    })
                    .await;
                }
                _ = shutdown.changed() => {
                    if *self.shutdown_tx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Fire-and-forget execution of the configured ban command with
    /// `IP_ADDRESS` set to the banned address.
    pub(crate) fn execute_ban_command(command: &str, ip_address: &str) {
        tracing::info!(ip = %ip_address, "executing ban-ip command");
        let result = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("IP_ADDRESS", ip_address)
            .spawn();
        if let Err(err) = result {
            tracing::error!(error = %err, "failed to spawn ban-ip command");
        }
    }
}
