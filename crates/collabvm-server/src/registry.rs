//! Session, guest-username, and per-IP tables. Three independent guarded
//! maps; each is a field of the server and never locked together.

use std::collections::HashMap;
use std::sync::Arc;

use collabvm_proto::{IpBytes, SessionId};

use crate::guard::Guard;
use crate::session::Connection;

/// Data associated with a client IP address, used for spam prevention.
#[derive(Default)]
pub struct IpData {
    /// The number of open connections from the IP.
    pub connections: u32,
}

/// Session id to connection. A session's entry is replaced when the same
/// account logs in again, invalidating the prior holder.
pub type SessionMap = HashMap<SessionId, Arc<Connection>>;

/// Case-insensitive username to connection; keys are lowercased with
/// [`guest_key`](crate::session::guest_key). Each live connection appears
/// at most once.
pub type GuestMap = HashMap<String, Arc<Connection>>;

/// IP bytes to per-IP record. Entries are guarded individually so admission
/// checks for different addresses never serialize against each other.
pub type IpMap = HashMap<IpBytes, Arc<Guard<IpData>>>;
