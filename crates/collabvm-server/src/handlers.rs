//! Message dispatch: validation, rate limits, and routing of every client
//! message variant to the guarded collections that own its state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;

use collabvm_proto::constants::{
    CHAT_RATE_LIMIT, GLOBAL_CHANNEL_ID, GUEST_NUMBER_RANGE, MAX_CHAT_MESSAGE_LEN,
    MAX_PASSWORD_LEN, TOTP_KEY_LEN, USERNAME_CHANGE_RATE_LIMIT,
};
use collabvm_proto::messages::{
    ChatDestination, ChatMessageRecord, ChatMessageResult, ConnectResult, ConnectSuccess,
    InviteEntry, LoginResult, RegisterResult, Session,
};
use collabvm_proto::validation::validate_username;
use collabvm_proto::{
    ClientMessage, InviteId, IpBytes, RemoteInstruction, ServerMessage, ServerSettingUpdate,
    UserType, VmSettingUpdate, VmSettings,
};
use collabvm_store::{CreateAccountOutcome, LoginOutcome};

use crate::channel::{ChannelUser, UserChannel};
use crate::guard::Guard;
use crate::playback::render_file_previews;
use crate::server::{now_ms, CollabVmServer};
use crate::session::{guest_key, ip_bytes_to_string, Connection, DirectChat};
use crate::vm::{validate_vm_modification, AdminVm};

/// Flags sampled once per message; individual handlers re-read state they
/// mutate.
struct MessageContext {
    is_admin: bool,
    is_logged_in: bool,
    captcha_required: bool,
    connected_vm: u32,
}

impl CollabVmServer {
    pub async fn handle_message(self: &Arc<Self>, conn: &Arc<Connection>, message: ClientMessage) {
        let ctx = conn
            .state
            .dispatch(|s| MessageContext {
                is_admin: s.is_admin,
                is_logged_in: s.is_logged_in,
                captcha_required: s.captcha_required,
                connected_vm: s.connected_vm,
            })
            .await;

        match message {
            ClientMessage::ConnectToChannel(channel_id) => {
                self.handle_connect_to_channel(conn, &ctx, channel_id).await;
            }
            ClientMessage::ChatMessage { destination, text } => {
                self.handle_chat_message(conn, &ctx, destination, text).await;
            }
            ClientMessage::TurnRequest => {
                if ctx.connected_vm != 0 && !ctx.captcha_required {
                    self.handle_turn_request(conn, ctx.connected_vm).await;
                }
            }
            ClientMessage::Vote(voted_yes) => {
                if ctx.connected_vm != 0 && !ctx.captcha_required {
                    self.handle_vote(conn, ctx.connected_vm, voted_yes).await;
                }
            }
            ClientMessage::Instruction(instruction) => {
                if ctx.connected_vm != 0 && !ctx.captcha_required {
                    self.handle_instruction(conn, ctx.connected_vm, instruction)
                        .await;
                }
            }
            ClientMessage::ChangeUsername(new_username) => {
                self.handle_change_username(conn, &ctx, new_username).await;
            }
            ClientMessage::ChangePassword {
                old_password,
                new_password,
            } => {
                self.handle_change_password(conn, &ctx, old_password, new_password)
                    .await;
            }
            ClientMessage::Login {
                username,
                password,
                captcha_token,
            } => {
                self.handle_login(conn, username, password, captcha_token)
                    .await;
            }
            ClientMessage::TwoFactorResponse(code) => {
                self.handle_two_factor(conn, code).await;
            }
            ClientMessage::Register {
                username,
                password,
                totp_key,
                invite_id,
                captcha_token,
            } => {
                self.handle_register(conn, username, password, totp_key, invite_id, captcha_token)
                    .await;
            }
            ClientMessage::CaptchaCompleted(token) => {
                let valid = self.captcha.verify(&token, &conn.ip.to_string()).await;
                conn.state.dispatch(move |s| s.captcha_required = !valid).await;
            }
            ClientMessage::VmListRequest => {
                self.handle_vm_list_request(conn).await;
            }
            ClientMessage::ServerConfigRequest => {
                if ctx.is_admin {
                    self.handle_server_config_request(conn).await;
                }
            }
            ClientMessage::ServerConfigModifications(updates) => {
                if ctx.is_admin {
                    self.handle_server_config_modifications(conn, updates).await;
                }
            }
            ClientMessage::ServerConfigHidden => {
                self.leave_server_config(conn).await;
            }
            ClientMessage::CreateVm(modifications) => {
                if ctx.is_admin {
                    self.handle_create_vm(conn, modifications).await;
                }
            }
            ClientMessage::ReadVms => {
                if ctx.is_admin {
                    let frame = self.vms.dispatch(|r| r.admin_list_message()).await;
                    conn.queue_frame(frame);
                }
            }
            ClientMessage::ReadVmConfig(vm_id) => {
                if ctx.is_admin {
                    if let Some(vm) = self.get_vm(vm_id).await {
                        let settings = vm.dispatch(|vm| vm.settings.clone()).await;
                        conn.queue_message(&ServerMessage::VmConfig(settings));
                    }
                }
            }
            ClientMessage::UpdateVmConfig { id, modifications } => {
                if ctx.is_admin {
                    self.handle_update_vm_config(conn, id, modifications).await;
                }
            }
            ClientMessage::DeleteVm(vm_id) => {
                if ctx.is_admin {
                    self.handle_delete_vm(conn, vm_id).await;
                }
            }
            ClientMessage::StartVms(ids) => {
                if ctx.is_admin {
                    for vm_id in ids {
                        if let Some(vm) = self.get_vm(vm_id).await {
                            let events = vm.dispatch(|vm| vm.start(now_ms())).await;
                            self.process_recording_events(vm_id, events).await;
                        }
                    }
                }
            }
            ClientMessage::StopVms(ids) => {
                if ctx.is_admin {
                    for vm_id in ids {
                        if let Some(vm) = self.get_vm(vm_id).await {
                            let events = vm.dispatch(|vm| vm.stop(now_ms())).await;
                            self.process_recording_events(vm_id, events).await;
                        }
                    }
                }
            }
            ClientMessage::RestartVms(ids) => {
                if ctx.is_admin {
                    for vm_id in ids {
                        if let Some(vm) = self.get_vm(vm_id).await {
                            vm.dispatch(|vm| vm.restart()).await;
                        }
                    }
                }
            }
            ClientMessage::CreateInvite {
                name,
                username,
                admin,
            } => {
                if ctx.is_admin {
                    let result = self
                        .db
                        .dispatch(move |db| db.create_invite(&name, &username, admin))
                        .await;
                    let id = result.unwrap_or_else(|err| {
                        tracing::error!(error = %err, "failed to create invite");
                        None
                    });
                    conn.queue_message(&ServerMessage::CreateInviteResult(id));
                }
            }
            ClientMessage::ReadInvites => {
                if ctx.is_admin {
                    let invites = self
                        .db
                        .dispatch(|db| db.read_invites())
                        .await
                        .unwrap_or_default();
                    let entries = invites
                        .into_iter()
                        .map(|invite| InviteEntry {
                            id: invite.id,
                            name: invite.name,
                        })
                        .collect();
                    conn.queue_message(&ServerMessage::ReadInvitesResponse(entries));
                }
            }
            ClientMessage::UpdateInvite {
                id,
                username,
                admin,
            } => {
                if ctx.is_admin {
                    let updated = self
                        .db
                        .dispatch(move |db| db.update_invite(&id, &username, admin))
                        .await
                        .unwrap_or(false);
                    conn.queue_message(&ServerMessage::UpdateInviteResult(updated));
                }
            }
            ClientMessage::DeleteInvite(id) => {
                if ctx.is_admin {
                    let _ = self.db.dispatch(move |db| db.delete_invite(&id)).await;
                }
            }
            ClientMessage::ValidateInvite(id) => {
                let username = self
                    .db
                    .dispatch(move |db| db.validate_invite(&id))
                    .await
                    .unwrap_or(None);
                conn.queue_message(&ServerMessage::InviteValidationResponse {
                    is_valid: username.is_some(),
                    username: username.unwrap_or_default(),
                });
            }
            ClientMessage::CreateReservedUsername(username) => {
                if ctx.is_admin {
                    let _ = self
                        .db
                        .dispatch(move |db| db.create_reserved_username(&username))
                        .await;
                }
            }
            ClientMessage::ReadReservedUsernames => {
                if ctx.is_admin {
                    let usernames = self
                        .db
                        .dispatch(|db| db.read_reserved_usernames())
                        .await
                        .unwrap_or_default();
                    conn.queue_message(&ServerMessage::ReadReservedUsernamesResponse(usernames));
                }
            }
            ClientMessage::DeleteReservedUsername(username) => {
                if ctx.is_admin {
                    let _ = self
                        .db
                        .dispatch(move |db| db.delete_reserved_username(&username))
                        .await;
                }
            }
            ClientMessage::BanIp(ip) => {
                if ctx.is_admin {
                    self.handle_ban_ip(ip).await;
                }
            }
            ClientMessage::SendCaptcha { username, channel } => {
                if ctx.is_admin {
                    if let Some(target) = self.find_user_in_channel(&username, channel).await {
                        target.state.dispatch(|s| s.captcha_required = true).await;
                        target.queue_message(&ServerMessage::CaptchaRequired(true));
                    }
                }
            }
            ClientMessage::KickUser { username, channel } => {
                if ctx.is_admin {
                    if let Some(target) = self.find_user_in_channel(&username, channel).await {
                        target.close();
                    }
                }
            }
            ClientMessage::PauseTurnTimer => {
                if ctx.is_admin && ctx.connected_vm != 0 {
                    if let Some(vm) = self.get_vm(ctx.connected_vm).await {
                        vm.dispatch(|vm| {
                            if vm.turn.pause() {
                                vm.broadcast_turn_info();
                            }
                        })
                        .await;
                    }
                }
            }
            ClientMessage::ResumeTurnTimer => {
                if ctx.is_admin && ctx.connected_vm != 0 {
                    if let Some(vm) = self.get_vm(ctx.connected_vm).await {
                        let cmd = vm
                            .dispatch(|vm| {
                                let cmd = vm.turn.resume();
                                if cmd.is_some() {
                                    vm.broadcast_turn_info();
                                }
                                cmd
                            })
                            .await;
                        if let Some(cmd) = cmd {
                            self.spawn_turn_timer(ctx.connected_vm, cmd);
                        }
                    }
                }
            }
            ClientMessage::EndTurn => {
                if ctx.connected_vm != 0 {
                    if let Some(vm) = self.get_vm(ctx.connected_vm).await {
                        let conn_id = conn.id;
                        let cmd = vm
                            .dispatch(move |vm| {
                                let cmd = vm.turn.end_turn(Some(conn_id));
                                vm.broadcast_turn_info();
                                cmd
                            })
                            .await;
                        if let Some(cmd) = cmd {
                            self.spawn_turn_timer(ctx.connected_vm, cmd);
                        }
                    }
                }
            }
            ClientMessage::RecordingPreviewRequest {
                vm_id,
                start_time,
                stop_time,
                time_interval,
                width,
                height,
            } => {
                if ctx.is_admin {
                    let server = Arc::clone(self);
                    let conn = Arc::clone(conn);
                    tokio::spawn(async move {
                        server
                            .send_recording_previews(
                                conn,
                                vm_id,
                                start_time,
                                stop_time,
                                time_interval,
                                width,
                                height,
                            )
                            .await;
                    });
                }
            }
        }
    }

    async fn handle_connect_to_channel(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        ctx: &MessageContext,
        channel_id: u32,
    ) {
        let username = conn.state.dispatch(|s| s.username.clone()).await;
        let username = if username.is_empty() {
            self.generate_guest_username(conn).await
        } else {
            username
        };

        self.leave_vm_list(conn).await;

        let captcha_required = ctx.captcha_required;
        let user_type = conn.state.dispatch(|s| s.user_type()).await;

        if channel_id == GLOBAL_CHANNEL_ID {
            let already = conn
                .state
                .dispatch(|s| std::mem::replace(&mut s.in_global_chat, true))
                .await;
            if already {
                return;
            }
            let joiner = Arc::clone(conn);
            self.global_channel
                .dispatch(move |channel| {
                    join_channel(channel, joiner, username, user_type, captcha_required);
                })
                .await;
            return;
        }

        let Some(vm) = self.get_vm(channel_id).await else {
            conn.queue_message(&ServerMessage::ConnectResponse(ConnectResult::Fail));
            return;
        };
        let is_logged_in = ctx.is_logged_in;
        let allowed = vm
            .dispatch(move |vm| !(vm.settings.disallow_guests && !is_logged_in))
            .await;
        if !allowed {
            conn.queue_message(&ServerMessage::ConnectResponse(ConnectResult::Fail));
            return;
        }

        let previous_vm = conn
            .state
            .dispatch(move |s| std::mem::replace(&mut s.connected_vm, channel_id))
            .await;
        if previous_vm != 0 {
            self.leave_vm_channel(conn, previous_vm).await;
        }

        let joiner = Arc::clone(conn);
        vm.dispatch(move |vm| {
            join_channel(&mut vm.channel, joiner.clone(), username, user_type, captcha_required);
            joiner.queue_message(&ServerMessage::TurnInfo(vm.turn_info()));
        })
        .await;
    }

    async fn leave_vm_channel(self: &Arc<Self>, conn: &Arc<Connection>, vm_id: u32) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let conn_id = conn.id;
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
            self.spawn_turn_timer(vm_id, cmd);
        }
    }

    /// Allocate a `guest<N>` username, incrementing N until the insert into
    /// the guest table succeeds.
    async fn generate_guest_username(self: &Arc<Self>, conn: &Arc<Connection>) -> String {
        let holder = Arc::clone(conn);
        let username = self
            .guests
            .dispatch(move |guests| {
                let mut num = rand::thread_rng().gen_range(GUEST_NUMBER_RANGE);
                let username = loop {
                    let username = format!("guest{num}");
                    if !guests.contains_key(&guest_key(&username)) {
                        break username;
                    }
                    num += 1;
                };
                guests.insert(guest_key(&username), holder);
                username
            })
            .await;
        let assigned = username.clone();
        conn.state.dispatch(move |s| s.username = assigned).await;
        username
    }

    async fn handle_chat_message(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        ctx: &MessageContext,
        destination: ChatDestination,
        text: String,
    ) {
        if ctx.captcha_required {
            return;
        }
        let length = text.chars().count();
        if length == 0 || length > MAX_CHAT_MESSAGE_LEN {
            return;
        }
        let now = Instant::now();
        let sender = conn
            .state
            .dispatch(move |s| {
                if s.username.is_empty() {
                    return None;
                }
                if s.last_chat_message
                    .is_some_and(|last| now.duration_since(last) < CHAT_RATE_LIMIT)
                {
                    return None;
                }
                s.last_chat_message = Some(now);
                Some((s.username.clone(), s.user_type()))
            })
            .await;
        let Some((username, user_type)) = sender else {
            return;
        };

        match destination {
            ChatDestination::Vm(channel_id) if channel_id == GLOBAL_CHANNEL_ID => {
                self.global_channel
                    .dispatch(move |channel| {
                        let record =
                            channel
                                .chat_room_mut()
                                .add_user_message(&username, user_type, &text);
                        channel.broadcast_message(&ServerMessage::ChatMessage {
                            channel: GLOBAL_CHANNEL_ID,
                            message: record,
                        });
                    })
                    .await;
            }
            ChatDestination::Vm(channel_id) => {
                let Some(vm) = self.get_vm(channel_id).await else {
                    return;
                };
                vm.dispatch(move |vm| {
                    let record =
                        vm.channel
                            .chat_room_mut()
                            .add_user_message(&username, user_type, &text);
                    vm.channel.broadcast_message(&ServerMessage::ChatMessage {
                        channel: channel_id,
                        message: record,
                    });
                })
                .await;
            }
            ChatDestination::Direct(room_id) => {
                let peer = conn
                    .state
                    .dispatch(move |s| {
                        s.chat_rooms
                            .get(&room_id)
                            .map(|room| (room.peer.clone(), room.remote_id))
                    })
                    .await;
                let Some((peer, remote_id)) = peer else {
                    return;
                };
                if remote_id == 0 {
                    return;
                }
                let Some(peer) = peer.upgrade() else {
                    return;
                };
                peer.queue_message(&ServerMessage::ChatMessage {
                    channel: remote_id,
                    message: ChatMessageRecord {
                        sender: username,
                        user_type,
                        text,
                        timestamp: now_ms(),
                    },
                });
            }
            ChatDestination::NewDirect(recipient_name) => {
                self.handle_new_direct_chat(conn, recipient_name, username, user_type, text)
                    .await;
            }
        }
    }

    async fn handle_new_direct_chat(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        recipient_name: String,
        username: String,
        user_type: UserType,
        text: String,
    ) {
        let recipient = self
            .guests
            .dispatch(move |guests| guests.get(&guest_key(&recipient_name)).cloned())
            .await;
        let Some(recipient) = recipient else {
            conn.queue_message(&ServerMessage::ChatMessageResponse(
                ChatMessageResult::UserNotFound,
            ));
            return;
        };
        if recipient.id == conn.id {
            return;
        }

        enum SenderSetup {
            Existing(u32),
            Created(u32),
            Full,
        }
        let peer_for_lookup = recipient.id;
        let recipient_handle = Arc::clone(&recipient);
        let setup = conn
            .state
            .dispatch(move |s| {
                let existing = s.chat_rooms.iter().find_map(|(id, room)| {
                    room.peer
                        .upgrade()
                        .filter(|peer| peer.id == peer_for_lookup)
                        .map(|_| *id)
                });
                if let Some(id) = existing {
                    return SenderSetup::Existing(id);
                }
                if s.chat_rooms_full() {
                    return SenderSetup::Full;
                }
                let id = s.allocate_chat_room_id();
                s.chat_rooms.insert(
                    id,
                    DirectChat {
                        peer: Arc::downgrade(&recipient_handle),
                        remote_id: 0,
                    },
                );
                SenderSetup::Created(id)
            })
            .await;

        let sender_room_id = match setup {
            SenderSetup::Existing(id) => {
                conn.queue_message(&ServerMessage::NewChatChannel {
                    channel: id,
                    message: None,
                });
                return;
            }
            SenderSetup::Full => {
                conn.queue_message(&ServerMessage::ChatMessageResponse(
                    ChatMessageResult::UserChatLimit,
                ));
                return;
            }
            SenderSetup::Created(id) => id,
        };

        enum PeerSetup {
            Room(u32),
            Full,
        }
        let sender_handle = Arc::clone(conn);
        let sender_conn_id = conn.id;
        let peer_setup = recipient
            .state
            .dispatch(move |s| {
                let existing = s.chat_rooms.iter_mut().find_map(|(id, room)| {
                    room.peer
                        .upgrade()
                        .filter(|peer| peer.id == sender_conn_id)
                        .map(|_| (*id, room))
                });
                if let Some((id, room)) = existing {
                    if room.remote_id == 0 {
                        room.remote_id = sender_room_id;
                    }
                    return PeerSetup::Room(id);
                }
                if s.chat_rooms_full() {
                    return PeerSetup::Full;
                }
                let id = s.allocate_chat_room_id();
                s.chat_rooms.insert(
                    id,
                    DirectChat {
                        peer: Arc::downgrade(&sender_handle),
                        remote_id: sender_room_id,
                    },
                );
                PeerSetup::Room(id)
            })
            .await;

        match peer_setup {
            PeerSetup::Full => {
                conn.state
                    .dispatch(move |s| {
                        s.chat_rooms.remove(&sender_room_id);
                    })
                    .await;
                conn.queue_message(&ServerMessage::ChatMessageResponse(
                    ChatMessageResult::RecipientChatLimit,
                ));
            }
            PeerSetup::Room(peer_room_id) => {
                conn.state
                    .dispatch(move |s| {
                        if let Some(room) = s.chat_rooms.get_mut(&sender_room_id) {
                            room.remote_id = peer_room_id;
                        }
                    })
                    .await;
                let record = ChatMessageRecord {
                    sender: username,
                    user_type,
                    text,
                    timestamp: now_ms(),
                };
                conn.queue_message(&ServerMessage::NewChatChannel {
                    channel: sender_room_id,
                    message: Some(record.clone()),
                });
                recipient.queue_message(&ServerMessage::NewChatChannel {
                    channel: peer_room_id,
                    message: Some(record),
                });
            }
        }
    }

    async fn handle_change_username(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        ctx: &MessageContext,
        new_username: String,
    ) {
        if ctx.captcha_required || ctx.is_logged_in {
            // Registered users can't change their usernames.
            return;
        }
        if !validate_username(&new_username) {
            return;
        }
        let now = Instant::now();
        let current = conn
            .state
            .dispatch({
                let new_username = new_username.clone();
                move |s| {
                    if s.last_username_change
                        .is_some_and(|last| now.duration_since(last) < USERNAME_CHANGE_RATE_LIMIT)
                    {
                        return None;
                    }
                    if s.username == new_username {
                        return None;
                    }
                    s.last_username_change = Some(now);
                    Some(s.username.clone())
                }
            })
            .await;
        let Some(current_username) = current else {
            return;
        };

        // Names reserved or registered in the database can never enter the
        // guest table.
        let unavailable = self
            .db
            .dispatch({
                let name = new_username.clone();
                move |db| {
                    let reserved = db.is_username_reserved(&name).unwrap_or(false);
                    let registered = db.get_user(&name).ok().flatten().is_some();
                    reserved || registered
                }
            })
            .await;
        if unavailable {
            conn.queue_message(&ServerMessage::UsernameTaken);
            return;
        }

        let conn_id = conn.id;
        let holder = Arc::clone(conn);
        let taken = self
            .guests
            .dispatch({
                let new_username = new_username.clone();
                move |guests| {
                    let new_key = guest_key(&new_username);
                    if guests
                        .get(&new_key)
                        .is_some_and(|existing| existing.id != conn_id)
                    {
                        return true;
                    }
                    let old_key = guest_key(&current_username);
                    if old_key != new_key {
                        guests.remove(&old_key);
                    }
                    guests.insert(new_key, holder);
                    false
                }
            })
            .await;
        if taken {
            conn.queue_message(&ServerMessage::UsernameTaken);
            return;
        }
        self.set_user_data(conn, new_username).await;
    }

    /// Swap the connection's username and broadcast the change to every
    /// channel it is in. Returns the previous username.
    pub(crate) async fn set_user_data(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        new_username: String,
    ) -> String {
        let (old_username, connected_vm, in_global, user_type) = conn
            .state
            .dispatch({
                let new_username = new_username.clone();
                move |s| {
                    let old = std::mem::replace(&mut s.username, new_username);
                    (old, s.connected_vm, s.in_global_chat, s.user_type())
                }
            })
            .await;
        if old_username.is_empty() || (connected_vm == 0 && !in_global) {
            return old_username;
        }

        let conn_id = conn.id;
        let update = {
            let old_username = old_username.clone();
            let new_username = new_username.clone();
            move |channel: &mut UserChannel| {
                let Some(user) = channel.get_user_mut(conn_id) else {
                    return;
                };
                user.username = new_username.clone();
                user.user_type = user_type;
                channel.broadcast_message(&ServerMessage::ChangeUsername {
                    old_username: old_username.clone(),
                    new_username: new_username.clone(),
                });
            }
        };
        if connected_vm != 0 {
            if let Some(vm) = self.get_vm(connected_vm).await {
                let update = update.clone();
                vm.dispatch(move |vm| update(&mut vm.channel)).await;
            }
        }
        if in_global {
            self.global_channel.dispatch(update).await;
        }
        old_username
    }

    async fn handle_login(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        username: String,
        password: String,
        captcha_token: String,
    ) {
        if !self.captcha.verify(&captcha_token, &conn.ip.to_string()).await {
            conn.queue_message(&ServerMessage::LoginResponse(LoginResult::InvalidCaptchaToken));
            return;
        }
        let outcome = self
            .db
            .dispatch({
                let username = username.clone();
                move |db| db.login(&username, &password)
            })
            .await;
        let response = match outcome {
            Ok(LoginOutcome::Success) => match self.create_session(conn, &username).await {
                Some(session) => LoginResult::Success(session),
                None => LoginResult::InvalidUsername,
            },
            Ok(LoginOutcome::TwoFactorRequired(key)) => {
                conn.state
                    .dispatch(move |s| s.pending_totp = Some((username, key)))
                    .await;
                LoginResult::TwoFactorRequired
            }
            Ok(LoginOutcome::InvalidUsername) => LoginResult::InvalidUsername,
            Ok(LoginOutcome::InvalidPassword) => LoginResult::InvalidPassword,
            Ok(LoginOutcome::AccountDisabled) => LoginResult::AccountDisabled,
            Err(err) => {
                tracing::error!(error = %err, "login query failed");
                LoginResult::InvalidUsername
            }
        };
        conn.queue_message(&ServerMessage::LoginResponse(response));
    }

    async fn handle_two_factor(self: &Arc<Self>, conn: &Arc<Connection>, code: u32) {
        let pending = conn.state.dispatch(|s| s.pending_totp.take()).await;
        let Some((username, key)) = pending else {
            return;
        };
        let response = if self.totp.validate(&key, code) {
            match self.create_session(conn, &username).await {
                Some(session) => LoginResult::Success(session),
                None => LoginResult::InvalidUsername,
            }
        } else {
            LoginResult::InvalidPassword
        };
        conn.queue_message(&ServerMessage::LoginResponse(response));
    }

    /// Adopt the canonical username and admin flag from the store, install
    /// the fresh session id, and invalidate the previous session's holder.
    pub(crate) async fn create_session(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        username: &str,
    ) -> Option<Session> {
        let ip = conn.ip_bytes;
        let handoff = self
            .db
            .dispatch({
                let username = username.to_string();
                move |db| db.create_session(&username, &ip)
            })
            .await;
        let handoff = match handoff {
            Ok(Some(handoff)) => handoff,
            Ok(None) => return None,
            Err(err) => {
                tracing::error!(error = %err, "session creation failed");
                return None;
            }
        };

        let is_admin = handoff.is_admin;
        let new_session_id = handoff.new_session_id;
        conn.state
            .dispatch(move |s| {
                s.is_logged_in = true;
                s.is_admin = is_admin;
                s.session_id = Some(new_session_id);
            })
            .await;

        let old_username = self.set_user_data(conn, handoff.username.clone()).await;
        let conn_id = conn.id;
        let holder = Arc::clone(conn);
        self.guests
            .dispatch({
                let canonical = handoff.username.clone();
                move |guests| {
                    if !old_username.is_empty() {
                        let old_key = guest_key(&old_username);
                        if guests.get(&old_key).is_some_and(|c| c.id == conn_id) {
                            guests.remove(&old_key);
                        }
                    }
                    guests.insert(guest_key(&canonical), holder);
                }
            })
            .await;

        let session_holder = Arc::clone(conn);
        let old_session_id = handoff.old_session_id;
        let invalidated = self
            .sessions
            .dispatch(move |sessions| {
                let invalidated = old_session_id.and_then(|id| sessions.remove(&id));
                sessions.insert(new_session_id, session_holder);
                invalidated
            })
            .await;
        if let Some(invalidated) = invalidated {
            if invalidated.id != conn.id {
                invalidated.queue_message(&ServerMessage::SessionExpired);
                invalidated.close();
            }
        }

        Some(Session {
            session_id: new_session_id,
            username: handoff.username,
            is_admin,
        })
    }

    async fn handle_register(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        username: String,
        password: String,
        totp_key: Option<Vec<u8>>,
        invite_id: Option<InviteId>,
        captcha_token: String,
    ) {
        let valid_username = if let Some(invite) = invite_id {
            // Captchas are not required for invites.
            let pinned = self
                .db
                .dispatch(move |db| db.validate_invite(&invite))
                .await
                .unwrap_or(None);
            let Some(pinned) = pinned else {
                conn.queue_message(&ServerMessage::RegistrationResponse(
                    RegisterResult::InviteInvalid,
                ));
                return;
            };
            // Exactly one of the invite and the request provides the name.
            if pinned.is_empty() == username.is_empty() {
                conn.queue_message(&ServerMessage::RegistrationResponse(
                    RegisterResult::InviteInvalid,
                ));
                return;
            }
            let chosen = if pinned.is_empty() { username } else { pinned };
            if !validate_username(&chosen) {
                conn.queue_message(&ServerMessage::RegistrationResponse(
                    RegisterResult::UsernameInvalid,
                ));
                return;
            }
            chosen
        } else {
            let allow = self
                .settings
                .dispatch(|s| s.snapshot().allow_account_registration)
                .await;
            if !allow {
                return;
            }
            if !self.captcha.verify(&captcha_token, &conn.ip.to_string()).await {
                conn.queue_message(&ServerMessage::RegistrationResponse(
                    RegisterResult::InvalidCaptchaToken,
                ));
                return;
            }
            if !validate_username(&username) {
                conn.queue_message(&ServerMessage::RegistrationResponse(
                    RegisterResult::UsernameInvalid,
                ));
                return;
            }
            username
        };

        if password.len() > MAX_PASSWORD_LEN {
            conn.queue_message(&ServerMessage::RegistrationResponse(
                RegisterResult::PasswordInvalid,
            ));
            return;
        }
        if totp_key.as_ref().is_some_and(|key| key.len() != TOTP_KEY_LEN) {
            conn.queue_message(&ServerMessage::RegistrationResponse(
                RegisterResult::TotpError,
            ));
            return;
        }

        let ip = conn.ip_bytes;
        let outcome = self
            .db
            .dispatch({
                let username = valid_username.clone();
                move |db| {
                    db.create_account(
                        &username,
                        &password,
                        totp_key.as_deref(),
                        invite_id.as_ref().map(|id| id.0.as_slice()),
                        &ip,
                    )
                }
            })
            .await;
        let response = match outcome {
            Ok(CreateAccountOutcome::Created { .. }) => {
                match self.create_session(conn, &valid_username).await {
                    Some(session) => RegisterResult::Success(session),
                    None => RegisterResult::UsernameInvalid,
                }
            }
            Ok(CreateAccountOutcome::UsernameTaken) => RegisterResult::UsernameTaken,
            Ok(CreateAccountOutcome::InviteInvalid) => RegisterResult::InviteInvalid,
            Err(err) => {
                tracing::error!(error = %err, "account creation failed");
                RegisterResult::UsernameInvalid
            }
        };
        conn.queue_message(&ServerMessage::RegistrationResponse(response));
    }

    async fn handle_change_password(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        ctx: &MessageContext,
        old_password: String,
        new_password: String,
    ) {
        if !ctx.is_logged_in {
            return;
        }
        let username = conn.state.dispatch(|s| s.username.clone()).await;
        let success = self
            .db
            .dispatch(move |db| db.change_password(&username, &old_password, &new_password))
            .await
            .unwrap_or(false);
        conn.queue_message(&ServerMessage::ChangePasswordResponse(success));
    }

    async fn handle_vm_list_request(self: &Arc<Self>, conn: &Arc<Connection>) {
        let first = conn
            .state
            .dispatch(|s| !std::mem::replace(&mut s.viewing_vm_list, true))
            .await;
        if !first {
            return;
        }
        let viewer = Arc::clone(conn);
        let frames = self
            .vms
            .dispatch(move |r| r.add_vm_list_viewer(viewer))
            .await;
        for frame in frames {
            conn.queue_frame(frame);
        }
    }

    async fn handle_server_config_request(self: &Arc<Self>, conn: &Arc<Connection>) {
        let snapshot = self.settings.dispatch(|s| s.snapshot()).await;
        conn.queue_message(&ServerMessage::ServerConfig((*snapshot).clone()));

        let first = conn
            .state
            .dispatch(|s| !std::mem::replace(&mut s.viewing_server_config, true))
            .await;
        if first {
            let viewer = Arc::clone(conn);
            let frame = self
                .vms
                .dispatch(move |r| r.add_admin_vm_list_viewer(viewer))
                .await;
            conn.queue_frame(frame);
        }
    }

    async fn handle_server_config_modifications(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        updates: Vec<ServerSettingUpdate>,
    ) {
        let (new, old) = self
            .settings
            .dispatch(move |s| s.update(&updates))
            .await;
        let persisted = self
            .db
            .dispatch({
                let new = (*new).clone();
                move |db| db.save_server_settings(&new)
            })
            .await;
        if let Err(err) = persisted {
            tracing::error!(error = %err, "failed to persist server settings");
        }
        self.apply_settings(&new, Some(&old)).await;

        // Broadcast the new config to the other admins viewing the panel.
        if let Some(frame) =
            crate::session::shared_frame(&ServerMessage::ServerConfig((*new).clone()))
        {
            let sender = conn.id;
            self.vms
                .dispatch(move |r| r.broadcast_to_admin_viewers(frame, Some(sender)))
                .await;
        }
    }

    pub(crate) async fn leave_server_config(self: &Arc<Self>, conn: &Arc<Connection>) {
        let was_viewing = conn
            .state
            .dispatch(|s| std::mem::replace(&mut s.viewing_server_config, false))
            .await;
        if !was_viewing {
            return;
        }
        let conn_id = conn.id;
        self.vms
            .dispatch(move |r| r.remove_admin_vm_list_viewer(conn_id))
            .await;
    }

    pub(crate) async fn leave_vm_list(self: &Arc<Self>, conn: &Arc<Connection>) {
        let was_viewing = conn
            .state
            .dispatch(|s| std::mem::replace(&mut s.viewing_vm_list, false))
            .await;
        if !was_viewing {
            return;
        }
        let conn_id = conn.id;
        self.vms
            .dispatch(move |r| r.remove_vm_list_viewer(conn_id))
            .await;
    }

    async fn handle_create_vm(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        modifications: Vec<VmSettingUpdate>,
    ) {
        if !modifications.iter().all(validate_vm_modification) {
            return;
        }
        let vm_id = match self.db.dispatch(|db| db.new_vm_id()).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, "failed to allocate VM id");
                return;
            }
        };
        let mut settings = VmSettings::default();
        for update in &modifications {
            settings.apply(update);
        }
        if let Err(err) = self
            .db
            .dispatch({
                let settings = settings.clone();
                move |db| db.create_vm(vm_id, &settings)
            })
            .await
        {
            tracing::error!(vm_id, error = %err, "failed to persist VM");
            return;
        }

        let remote = self
            .remotes
            .create(vm_id, &settings, self.instruction_tx.clone());
        let vm = AdminVm::new(vm_id, settings, remote, self.config.recordings_path.clone());
        self.vms
            .dispatch(move |r| r.insert_vm(vm_id, Arc::new(Guard::new(vm))))
            .await;

        conn.queue_message(&ServerMessage::CreateVmResponse(vm_id));
        self.update_single_vm_info(vm_id).await;
        let frame = self.vms.dispatch(|r| r.admin_list_message()).await;
        conn.queue_frame(frame);
    }

    async fn handle_update_vm_config(
        self: &Arc<Self>,
        _conn: &Arc<Connection>,
        vm_id: u32,
        modifications: Vec<VmSettingUpdate>,
    ) {
        if !modifications.iter().all(validate_vm_modification) {
            return;
        }
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let settings = vm
            .dispatch(move |vm| {
                vm.apply_modifications(&modifications);
                vm.settings.clone()
            })
            .await;
        if let Err(err) = self
            .db
            .dispatch(move |db| db.update_vm_settings(vm_id, &settings))
            .await
        {
            tracing::error!(vm_id, error = %err, "failed to persist VM settings");
        }
        self.update_single_vm_info(vm_id).await;
    }

    async fn handle_delete_vm(self: &Arc<Self>, conn: &Arc<Connection>, vm_id: u32) {
        let removed = self.vms.dispatch(move |r| r.remove_vm(vm_id)).await;
        let Some(vm) = removed else {
            return;
        };
        let events = vm
            .dispatch(|vm| {
                let events = vm.stop(now_ms());
                vm.channel.clear();
                events
            })
            .await;
        self.process_recording_events(vm_id, events).await;
        if let Err(err) = self.db.dispatch(move |db| db.delete_vm(vm_id)).await {
            tracing::error!(vm_id, error = %err, "failed to delete VM from store");
        }
        let frame = self.vms.dispatch(|r| r.admin_list_message()).await;
        conn.queue_frame(frame);
    }

    async fn handle_turn_request(self: &Arc<Self>, conn: &Arc<Connection>, vm_id: u32) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let conn_id = conn.id;
        let cmd = vm
            .dispatch(move |vm| {
                if !vm.settings.turns_enabled {
                    return None;
                }
                let cmd = vm.turn.request_turn(conn_id);
                vm.broadcast_turn_info();
                cmd
            })
            .await;
        if let Some(cmd) = cmd {
            self.spawn_turn_timer(vm_id, cmd);
        }
    }

    async fn handle_vote(self: &Arc<Self>, conn: &Arc<Connection>, vm_id: u32, voted_yes: bool) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let conn_id = conn.id;
        vm.dispatch(move |vm| {
            let Some(user) = vm.channel.get_user_mut(conn_id) else {
                return;
            };
            user.vote = Some(voted_yes);
            let (yes, no) = vm.channel.vote_tally();
            vm.channel.broadcast_message(&ServerMessage::VoteStatus {
                channel: vm.id,
                yes,
                no,
            });
        })
        .await;
    }

    async fn handle_instruction(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        vm_id: u32,
        instruction: RemoteInstruction,
    ) {
        let Some(vm) = self.get_vm(vm_id).await else {
            return;
        };
        let conn_id = conn.id;
        vm.dispatch(move |vm| vm.forward_input(conn_id, &instruction))
            .await;
    }

    async fn handle_ban_ip(self: &Arc<Self>, ip: IpBytes) {
        let command = self
            .settings
            .dispatch(|s| s.snapshot().ban_ip_command.clone())
            .await;
        if command.is_empty() {
            return;
        }
        Self::execute_ban_command(&command, &ip_bytes_to_string(&ip));
    }

    async fn find_user_in_channel(
        self: &Arc<Self>,
        username: &str,
        channel_id: u32,
    ) -> Option<Arc<Connection>> {
        if channel_id == GLOBAL_CHANNEL_ID {
            let username = username.to_string();
            return self
                .global_channel
                .dispatch(move |channel| {
                    channel
                        .find_by_username(&username)
                        .map(|user| Arc::clone(&user.conn))
                })
                .await;
        }
        let vm = self.get_vm(channel_id).await?;
        let username = username.to_string();
        vm.dispatch(move |vm| {
            vm.channel
                .find_by_username(&username)
                .map(|user| Arc::clone(&user.conn))
        })
        .await
    }

    /// Walk the files covering the requested range and stream thumbnail
    /// previews back to the requesting admin, ending with a boolean result.
    #[allow(clippy::too_many_arguments)]
    async fn send_recording_previews(
        self: Arc<Self>,
        conn: Arc<Connection>,
        vm_id: u32,
        start_time: u64,
        stop_time: u64,
        time_interval: u64,
        width: u32,
        height: u32,
    ) {
        if start_time == 0 || stop_time == 0 {
            conn.queue_message(&ServerMessage::RecordingPlaybackResult(false));
            return;
        }

        let mut timestamp = start_time;
        let mut ok = true;
        while timestamp < stop_time {
            let lookup = self
                .db
                .dispatch(move |db| db.find_recording(vm_id, timestamp))
                .await;
            let entry = match lookup {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    ok = false;
                    break;
                }
                Err(err) => {
                    tracing::error!(vm_id, error = %err, "recording lookup failed");
                    ok = false;
                    break;
                }
            };

            let path = PathBuf::from(&entry.file_path);
            let compositors = Arc::clone(&self.compositors);
            let rendered = tokio::task::spawn_blocking(move || {
                let mut frames = Vec::new();
                let next = render_file_previews(
                    &path,
                    timestamp,
                    stop_time,
                    time_interval,
                    width,
                    height,
                    compositors.as_ref(),
                    &mut |frame| frames.push(frame),
                )?;
                Ok::<_, std::io::Error>((frames, next))
            })
            .await;

            match rendered {
                Ok(Ok((frames, next))) => {
                    for frame in frames {
                        conn.queue_message(&ServerMessage::RecordingPlaybackPreview {
                            vm_id,
                            timestamp: frame.timestamp,
                            png: frame.png,
                        });
                    }
                    if next <= timestamp {
                        break;
                    }
                    timestamp = next;
                }
                Ok(Err(err)) => {
                    // Errors mid-file advance to the next covering file.
                    tracing::warn!(vm_id, path = %entry.file_path, error = %err,
                        "recording preview failed, skipping file");
                    match entry.stop_time.filter(|stop| *stop > timestamp) {
                        Some(stop) => timestamp = stop,
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(vm_id, error = %err, "preview task panicked");
                    ok = false;
                    break;
                }
            }
        }
        conn.queue_message(&ServerMessage::RecordingPlaybackResult(ok));
    }
}

/// Send the connect-response carrying history, then add the user to the
/// channel's member set.
fn join_channel(
    channel: &mut UserChannel,
    joiner: Arc<Connection>,
    username: String,
    user_type: UserType,
    captcha_required: bool,
) {
    let success = ConnectSuccess {
        channel: channel.id(),
        username: username.clone(),
        captcha_required,
        history: channel.chat_room().history(),
    };
    joiner.queue_message(&ServerMessage::ConnectResponse(ConnectResult::Success(
        success,
    )));
    let ip = joiner.ip_bytes;
    channel.add_user(ChannelUser {
        conn: joiner,
        username,
        user_type,
        ip,
        vote: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::config::ServerConfig;
    use crate::server::ServerDeps;

    struct TestClient {
        conn: Arc<Connection>,
        rx: mpsc::Receiver<Bytes>,
    }

    impl TestClient {
        async fn send(&self, server: &Arc<CollabVmServer>, message: ClientMessage) {
            server.handle_message(&self.conn, message).await;
        }

        async fn recv(&mut self) -> ServerMessage {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("connection queue closed");
            ServerMessage::from_bytes(&frame).unwrap()
        }

        async fn recv_until<T>(&mut self, mut pick: impl FnMut(ServerMessage) -> Option<T>) -> T {
            loop {
                if let Some(found) = pick(self.recv().await) {
                    return found;
                }
            }
        }

        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(ServerMessage::from_bytes(&frame).unwrap());
            }
            out
        }
    }

    async fn test_server() -> (Arc<CollabVmServer>, TempDir) {
        test_server_with(ServerDeps::default()).await
    }

    async fn test_server_with(deps: ServerDeps) -> (Arc<CollabVmServer>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: dir.path().join("test.db"),
            recordings_path: dir.path().join("recordings"),
            auto_start_vms: false,
            ..ServerConfig::default()
        };
        let server = CollabVmServer::new(config, deps).await.unwrap();
        // Most scenarios need an account, so open registration up front.
        server
            .settings
            .dispatch(|s| s.update(&[ServerSettingUpdate::AllowAccountRegistration(true)]))
            .await;
        (server, dir)
    }

    async fn connect_client(server: &Arc<CollabVmServer>) -> TestClient {
        let (conn, rx) = server
            .register_connection("127.0.0.1".parse().unwrap())
            .await;
        TestClient { conn, rx }
    }

    async fn register(server: &Arc<CollabVmServer>, client: &mut TestClient, name: &str) -> Session {
        client
            .send(
                server,
                ClientMessage::Register {
                    username: name.to_string(),
                    password: "hunter22".to_string(),
                    totp_key: None,
                    invite_id: None,
                    captcha_token: String::new(),
                },
            )
            .await;
        client
            .recv_until(|m| match m {
                ServerMessage::RegistrationResponse(RegisterResult::Success(session)) => {
                    Some(session)
                }
                ServerMessage::RegistrationResponse(other) => {
                    panic!("registration failed: {other:?}")
                }
                _ => None,
            })
            .await
    }

    async fn create_vm(server: &Arc<CollabVmServer>, admin: &mut TestClient, name: &str) -> u32 {
        admin
            .send(
                server,
                ClientMessage::CreateVm(vec![VmSettingUpdate::Name(name.to_string())]),
            )
            .await;
        admin
            .recv_until(|m| match m {
                ServerMessage::CreateVmResponse(id) => Some(id),
                _ => None,
            })
            .await
    }

    async fn turn_holder(server: &Arc<CollabVmServer>, vm_id: u32) -> Option<u64> {
        server
            .get_vm(vm_id)
            .await
            .unwrap()
            .dispatch(|vm| vm.turn.holder())
            .await
    }

    #[tokio::test]
    async fn s1_guest_join_and_chat() {
        let (server, _dir) = test_server().await;
        let mut alice = connect_client(&server).await;
        let mut bob = connect_client(&server).await;

        alice
            .send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;
        let success = alice
            .recv_until(|m| match m {
                ServerMessage::ConnectResponse(ConnectResult::Success(s)) => Some(s),
                _ => None,
            })
            .await;
        assert!(success.username.starts_with("guest"));
        assert!(success.history.is_empty());
        assert!(!success.captcha_required);
        let guest_name = success.username;

        bob.send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;
        bob.recv_until(|m| match m {
            ServerMessage::ConnectResponse(_) => Some(()),
            _ => None,
        })
        .await;

        alice
            .send(
                &server,
                ClientMessage::ChatMessage {
                    destination: ChatDestination::Vm(GLOBAL_CHANNEL_ID),
                    text: "hi".to_string(),
                },
            )
            .await;

        for client in [&mut alice, &mut bob] {
            let record = client
                .recv_until(|m| match m {
                    ServerMessage::ChatMessage { channel: 0, message } => Some(message),
                    _ => None,
                })
                .await;
            assert_eq!(record.sender, guest_name);
            assert_eq!(record.text, "hi");
            assert_eq!(record.user_type, UserType::Guest);
        }
    }

    #[tokio::test]
    async fn guest_table_tracks_live_connections() {
        let (server, _dir) = test_server().await;
        let mut alice = connect_client(&server).await;
        alice
            .send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;
        let username = alice
            .recv_until(|m| match m {
                ServerMessage::ConnectResponse(ConnectResult::Success(s)) => Some(s.username),
                _ => None,
            })
            .await;

        let conn_id = alice.conn.id;
        let key = guest_key(&username);
        let held = server
            .guests
            .dispatch({
                let key = key.clone();
                move |g| g.get(&key).map(|c| c.id)
            })
            .await;
        assert_eq!(held, Some(conn_id));

        server.disconnect(&alice.conn).await;
        let held = server.guests.dispatch(move |g| g.contains_key(&key)).await;
        assert!(!held);
    }

    #[tokio::test]
    async fn change_username_swaps_and_rejects_collisions() {
        let (server, _dir) = test_server().await;
        let mut alice = connect_client(&server).await;
        alice
            .send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;
        let old_name = alice
            .recv_until(|m| match m {
                ServerMessage::ConnectResponse(ConnectResult::Success(s)) => Some(s.username),
                _ => None,
            })
            .await;

        alice
            .send(
                &server,
                ClientMessage::ChangeUsername("Fancy Name".to_string()),
            )
            .await;
        let change = alice
            .recv_until(|m| match m {
                ServerMessage::ChangeUsername {
                    old_username,
                    new_username,
                } => Some((old_username, new_username)),
                _ => None,
            })
            .await;
        assert_eq!(change, (old_name.clone(), "Fancy Name".to_string()));

        let freed = server
            .guests
            .dispatch(move |g| !g.contains_key(&guest_key(&old_name)))
            .await;
        assert!(freed);

        // A second connection cannot take the same name, case-insensitively.
        let mut bob = connect_client(&server).await;
        bob.send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;
        bob.send(
            &server,
            ClientMessage::ChangeUsername("fancy name".to_string()),
        )
        .await;
        bob.recv_until(|m| match m {
            ServerMessage::UsernameTaken => Some(()),
            _ => None,
        })
        .await;
    }

    #[tokio::test]
    async fn s2_turn_handoff_is_fifo() {
        let (server, _dir) = test_server().await;
        let mut admin = connect_client(&server).await;
        register(&server, &mut admin, "root").await;
        let vm_id = create_vm(&server, &mut admin, "Test VM").await;

        let mut a = connect_client(&server).await;
        let mut b = connect_client(&server).await;
        for client in [&mut a, &mut b] {
            client
                .send(&server, ClientMessage::ConnectToChannel(vm_id))
                .await;
            client
                .recv_until(|m| match m {
                    ServerMessage::ConnectResponse(ConnectResult::Success(_)) => Some(()),
                    ServerMessage::ConnectResponse(ConnectResult::Fail) => {
                        panic!("join rejected")
                    }
                    _ => None,
                })
                .await;
        }

        a.send(&server, ClientMessage::TurnRequest).await;
        b.send(&server, ClientMessage::TurnRequest).await;
        assert_eq!(turn_holder(&server, vm_id).await, Some(a.conn.id));

        a.send(&server, ClientMessage::EndTurn).await;
        assert_eq!(turn_holder(&server, vm_id).await, Some(b.conn.id));

        // The handoff is visible to channel members.
        let info = a
            .recv_until(|m| match m {
                ServerMessage::TurnInfo(info) if info.holder.is_some() => Some(info),
                _ => None,
            })
            .await;
        assert_eq!(info.channel, vm_id);

        // A disconnecting holder frees the turn for the next requester.
        server.disconnect(&b.conn).await;
        assert_eq!(turn_holder(&server, vm_id).await, None);
        a.send(&server, ClientMessage::TurnRequest).await;
        assert_eq!(turn_holder(&server, vm_id).await, Some(a.conn.id));
    }

    #[tokio::test]
    async fn chat_rate_limit_drops_rapid_messages() {
        let (server, _dir) = test_server().await;
        let mut alice = connect_client(&server).await;
        let mut bob = connect_client(&server).await;
        for client in [&mut alice, &mut bob] {
            client
                .send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
                .await;
        }
        bob.recv_until(|m| match m {
            ServerMessage::ConnectResponse(_) => Some(()),
            _ => None,
        })
        .await;

        for text in ["first", "second"] {
            alice
                .send(
                    &server,
                    ClientMessage::ChatMessage {
                        destination: ChatDestination::Vm(GLOBAL_CHANNEL_ID),
                        text: text.to_string(),
                    },
                )
                .await;
        }

        let chats: Vec<_> = bob
            .drain()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::ChatMessage { .. }))
            .collect();
        assert_eq!(chats.len(), 1, "rate limit should drop the second message");
    }

    #[tokio::test]
    async fn s4_max_connections_per_ip() {
        let (server, _dir) = test_server().await;
        server
            .settings
            .dispatch(|s| {
                s.update(&[
                    ServerSettingUpdate::MaxConnectionsEnabled(true),
                    ServerSettingUpdate::MaxConnections(2),
                ])
            })
            .await;

        let ip: std::net::IpAddr = "10.1.2.3".parse().unwrap();
        assert!(server.pre_connect(ip).await);
        assert!(server.pre_connect(ip).await);
        assert!(!server.pre_connect(ip).await);

        // Another address is unaffected.
        assert!(server.pre_connect("10.9.9.9".parse().unwrap()).await);

        // A disconnect frees a slot.
        let (conn, _rx) = server.register_connection(ip).await;
        server.disconnect(&conn).await;
        assert!(server.pre_connect(ip).await);
    }

    #[tokio::test]
    async fn s5_invite_registration() {
        let (server, _dir) = test_server().await;
        let mut admin = connect_client(&server).await;
        register(&server, &mut admin, "root").await;

        admin
            .send(
                &server,
                ClientMessage::CreateInvite {
                    name: "friends".to_string(),
                    username: "alice".to_string(),
                    admin: false,
                },
            )
            .await;
        let invite_id = admin
            .recv_until(|m| match m {
                ServerMessage::CreateInviteResult(id) => Some(id.expect("invite created")),
                _ => None,
            })
            .await;

        let mut invitee = connect_client(&server).await;
        invitee
            .send(
                &server,
                ClientMessage::Register {
                    username: String::new(),
                    password: "pw-alice".to_string(),
                    totp_key: None,
                    invite_id: Some(invite_id),
                    captcha_token: String::new(),
                },
            )
            .await;
        let session = invitee
            .recv_until(|m| match m {
                ServerMessage::RegistrationResponse(RegisterResult::Success(s)) => Some(s),
                _ => None,
            })
            .await;
        assert_eq!(session.username, "alice");
        assert!(!session.is_admin);

        // The invite is spent.
        let mut freeloader = connect_client(&server).await;
        freeloader
            .send(
                &server,
                ClientMessage::Register {
                    username: String::new(),
                    password: "pw".to_string(),
                    totp_key: None,
                    invite_id: Some(invite_id),
                    captcha_token: String::new(),
                },
            )
            .await;
        freeloader
            .recv_until(|m| match m {
                ServerMessage::RegistrationResponse(RegisterResult::InviteInvalid) => Some(()),
                ServerMessage::RegistrationResponse(other) => panic!("unexpected: {other:?}"),
                _ => None,
            })
            .await;
    }

    #[tokio::test]
    async fn s3_config_broadcast_reaches_other_admins_only() {
        let (server, _dir) = test_server().await;
        let mut admin_x = connect_client(&server).await;
        register(&server, &mut admin_x, "root").await;

        // Second admin joins through an admin invite.
        admin_x
            .send(
                &server,
                ClientMessage::CreateInvite {
                    name: "staff".to_string(),
                    username: String::new(),
                    admin: true,
                },
            )
            .await;
        let invite_id = admin_x
            .recv_until(|m| match m {
                ServerMessage::CreateInviteResult(id) => Some(id.unwrap()),
                _ => None,
            })
            .await;
        let mut admin_y = connect_client(&server).await;
        admin_y
            .send(
                &server,
                ClientMessage::Register {
                    username: "deputy".to_string(),
                    password: "pw".to_string(),
                    totp_key: None,
                    invite_id: Some(invite_id),
                    captcha_token: String::new(),
                },
            )
            .await;
        let session = admin_y
            .recv_until(|m| match m {
                ServerMessage::RegistrationResponse(RegisterResult::Success(s)) => Some(s),
                _ => None,
            })
            .await;
        assert!(session.is_admin);

        for admin in [&mut admin_x, &mut admin_y] {
            admin.send(&server, ClientMessage::ServerConfigRequest).await;
            admin
                .recv_until(|m| match m {
                    ServerMessage::ServerConfig(_) => Some(()),
                    _ => None,
                })
                .await;
        }
        let mut guest = connect_client(&server).await;
        guest
            .send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;

        admin_x
            .send(
                &server,
                ClientMessage::ServerConfigModifications(vec![
                    ServerSettingUpdate::MaxConnections(5),
                ]),
            )
            .await;

        let settings = admin_y
            .recv_until(|m| match m {
                ServerMessage::ServerConfig(settings) => Some(settings),
                _ => None,
            })
            .await;
        assert_eq!(settings.max_connections, 5);

        // The modifying admin is excluded, and non-admins see nothing.
        assert!(!admin_x
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::ServerConfig(_))));
        assert!(!guest
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::ServerConfig(_))));

        // The change is persisted.
        let stored = server
            .db
            .dispatch(|db| db.load_server_settings())
            .await
            .unwrap();
        assert_eq!(stored.max_connections, 5);
    }

    #[tokio::test]
    async fn connection_is_in_at_most_one_vm_channel() {
        let (server, _dir) = test_server().await;
        let mut admin = connect_client(&server).await;
        register(&server, &mut admin, "root").await;
        let vm1 = create_vm(&server, &mut admin, "one").await;
        let vm2 = create_vm(&server, &mut admin, "two").await;

        let mut user = connect_client(&server).await;
        user.send(&server, ClientMessage::ConnectToChannel(vm1)).await;
        user.send(&server, ClientMessage::ConnectToChannel(vm2)).await;
        // Global chat membership is independent of the VM channel.
        user.send(&server, ClientMessage::ConnectToChannel(GLOBAL_CHANNEL_ID))
            .await;

        let conn_id = user.conn.id;
        let in_vm1 = server
            .get_vm(vm1)
            .await
            .unwrap()
            .dispatch(move |vm| vm.channel.contains(conn_id))
            .await;
        let in_vm2 = server
            .get_vm(vm2)
            .await
            .unwrap()
            .dispatch(move |vm| vm.channel.contains(conn_id))
            .await;
        let in_global = server
            .global_channel
            .dispatch(move |channel| channel.contains(conn_id))
            .await;
        assert!(!in_vm1);
        assert!(in_vm2);
        assert!(in_global);
    }

    #[tokio::test]
    async fn two_factor_login_validates_stashed_secret() {
        let (server, _dir) = test_server_with(ServerDeps {
            totp: Box::new(crate::auth::AcceptAllTotp),
            ..ServerDeps::default()
        })
        .await;

        let mut setup = connect_client(&server).await;
        setup
            .send(
                &server,
                ClientMessage::Register {
                    username: "alice".to_string(),
                    password: "pw".to_string(),
                    totp_key: Some(vec![7u8; TOTP_KEY_LEN]),
                    invite_id: None,
                    captcha_token: String::new(),
                },
            )
            .await;
        setup
            .recv_until(|m| match m {
                ServerMessage::RegistrationResponse(RegisterResult::Success(_)) => Some(()),
                _ => None,
            })
            .await;

        let mut client = connect_client(&server).await;
        client
            .send(
                &server,
                ClientMessage::Login {
                    username: "alice".to_string(),
                    password: "pw".to_string(),
                    captcha_token: String::new(),
                },
            )
            .await;
        client
            .recv_until(|m| match m {
                ServerMessage::LoginResponse(LoginResult::TwoFactorRequired) => Some(()),
                ServerMessage::LoginResponse(other) => panic!("unexpected: {other:?}"),
                _ => None,
            })
            .await;

        client
            .send(&server, ClientMessage::TwoFactorResponse(123_456))
            .await;
        let result = client
            .recv_until(|m| match m {
                ServerMessage::LoginResponse(r) => Some(r),
                _ => None,
            })
            .await;
        assert!(matches!(result, LoginResult::Success(_)));

        // A stray response with no pending login is ignored.
        client
            .send(&server, ClientMessage::TwoFactorResponse(1))
            .await;
        assert!(client.drain().is_empty());
    }

    #[tokio::test]
    async fn relogin_invalidates_previous_session() {
        let (server, _dir) = test_server().await;
        let mut first = connect_client(&server).await;
        register(&server, &mut first, "root").await;

        let mut second = connect_client(&server).await;
        second
            .send(
                &server,
                ClientMessage::Login {
                    username: "root".to_string(),
                    password: "hunter22".to_string(),
                    captcha_token: String::new(),
                },
            )
            .await;
        let result = second
            .recv_until(|m| match m {
                ServerMessage::LoginResponse(r) => Some(r),
                _ => None,
            })
            .await;
        assert!(matches!(result, LoginResult::Success(_)));

        first
            .recv_until(|m| match m {
                ServerMessage::SessionExpired => Some(()),
                _ => None,
            })
            .await;
        assert!(first.conn.is_closed());
    }

    #[tokio::test]
    async fn guests_are_rejected_from_guarded_vms() {
        let (server, _dir) = test_server().await;
        let mut admin = connect_client(&server).await;
        register(&server, &mut admin, "root").await;
        admin
            .send(
                &server,
                ClientMessage::CreateVm(vec![
                    VmSettingUpdate::Name("members only".to_string()),
                    VmSettingUpdate::DisallowGuests(true),
                ]),
            )
            .await;
        let vm_id = admin
            .recv_until(|m| match m {
                ServerMessage::CreateVmResponse(id) => Some(id),
                _ => None,
            })
            .await;

        let mut guest = connect_client(&server).await;
        guest
            .send(&server, ClientMessage::ConnectToChannel(vm_id))
            .await;
        guest
            .recv_until(|m| match m {
                ServerMessage::ConnectResponse(ConnectResult::Fail) => Some(()),
                ServerMessage::ConnectResponse(ConnectResult::Success(_)) => {
                    panic!("guest should have been rejected")
                }
                _ => None,
            })
            .await;
    }
}
