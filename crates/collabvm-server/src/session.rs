//! Per-connection state and the outbound send queue.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Weak;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use collabvm_proto::constants::MAX_PRIVATE_CHAT_ROOMS;
use collabvm_proto::{IpBytes, ServerMessage, SessionId, UserType};

use crate::guard::Guard;

/// Stable identifier of a live connection. Collections key on this rather
/// than on addresses so a handle can be removed from everywhere on
/// disconnect.
pub type ConnectionId = u64;

/// Bound of the outbound frame queue. A connection that falls this far
/// behind is closed rather than buffered without limit.
pub const SEND_QUEUE_LIMIT: usize = 256;

/// One live client. Shared by reference from the session map, the guest
/// table, channel user sets, turn queues, and viewer lists.
pub struct Connection {
    pub id: ConnectionId,
    pub ip: IpAddr,
    pub ip_bytes: IpBytes,
    pub state: Guard<SessionState>,
    outbound: mpsc::Sender<Bytes>,
    closed_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        ip: IpAddr,
        captcha_required: bool,
    ) -> (std::sync::Arc<Self>, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(SEND_QUEUE_LIMIT);
        let (closed_tx, _) = watch::channel(false);
        let conn = std::sync::Arc::new(Self {
            id,
            ip,
            ip_bytes: ip_to_bytes(ip),
            state: Guard::new(SessionState::new(captcha_required)),
            outbound,
            closed_tx,
        });
        (conn, rx)
    }

    /// Append an already-encoded frame to the send queue. Frames preserve
    /// enqueue order; a full queue closes the connection.
    pub fn queue_frame(&self, frame: Bytes) {
        if *self.closed_tx.borrow() {
            return;
        }
        if let Err(err) = self.outbound.try_send(frame) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    tracing::warn!(connection = self.id, "send queue overflow, closing");
                    self.close();
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    pub fn queue_message(&self, message: &ServerMessage) {
        if let Some(frame) = shared_frame(message) {
            self.queue_frame(frame);
        }
    }

    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Encode a message once; the resulting frame is shared by reference count
/// across every recipient's send queue.
pub fn shared_frame(message: &ServerMessage) -> Option<Bytes> {
    match message.to_bytes() {
        Ok(bytes) => Some(Bytes::from(bytes)),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode server message");
            None
        }
    }
}

/// A private chat slot: the peer and the peer's mirror id for this room.
pub struct DirectChat {
    pub peer: Weak<Connection>,
    /// The peer's local id for the same room; 0 until the peer confirms.
    pub remote_id: u32,
}

/// Everything about a connection that changes after accept. Mutated only
/// through the connection's guard.
pub struct SessionState {
    pub username: String,
    pub session_id: Option<SessionId>,
    pub is_logged_in: bool,
    pub is_admin: bool,
    pub captcha_required: bool,
    pub viewing_server_config: bool,
    pub viewing_vm_list: bool,
    pub in_global_chat: bool,
    /// VM channel this connection is in; 0 means none.
    pub connected_vm: u32,
    pub last_chat_message: Option<Instant>,
    pub last_username_change: Option<Instant>,
    pub chat_rooms: HashMap<u32, DirectChat>,
    next_chat_room_id: u32,
    /// (username, totp key) stashed between login-request and
    /// two-factor-response.
    pub pending_totp: Option<(String, Vec<u8>)>,
}

impl SessionState {
    fn new(captcha_required: bool) -> Self {
        Self {
            username: String::new(),
            session_id: None,
            is_logged_in: false,
            is_admin: false,
            captcha_required,
            viewing_server_config: false,
            viewing_vm_list: false,
            in_global_chat: false,
            connected_vm: 0,
            last_chat_message: None,
            last_username_change: None,
            chat_rooms: HashMap::new(),
            next_chat_room_id: 1,
            pending_totp: None,
        }
    }

    pub fn user_type(&self) -> UserType {
        if self.is_admin {
            UserType::Admin
        } else if self.is_logged_in {
            UserType::Regular
        } else {
            UserType::Guest
        }
    }

    pub fn chat_rooms_full(&self) -> bool {
        self.chat_rooms.len() >= MAX_PRIVATE_CHAT_ROOMS
    }

    pub fn allocate_chat_room_id(&mut self) -> u32 {
        let id = self.next_chat_room_id;
        self.next_chat_room_id += 1;
        id
    }
}

pub fn ip_to_bytes(ip: IpAddr) -> IpBytes {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Canonical IPv6 textual form, as handed to the ban-ip command.
pub fn ip_bytes_to_string(bytes: &IpBytes) -> String {
    std::net::Ipv6Addr::from(*bytes).to_string()
}

/// Case-insensitive key for the guest username table.
pub fn guest_key(username: &str) -> String {
    username.to_lowercase()
}
