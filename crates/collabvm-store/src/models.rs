use collabvm_proto::{InviteId, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub password_hash: Vec<u8>,
    pub password_salt: Vec<u8>,
    pub totp_key: Option<Vec<u8>>,
    pub session_id: Option<SessionId>,
    /// Unix seconds.
    pub registration_date: u64,
    pub registration_ip: [u8; 16],
    pub last_active_ip: [u8; 16],
    pub last_login: u64,
    pub last_failed_login: Option<u64>,
    pub last_online: u64,
    pub failed_logins: u32,
    pub is_admin: bool,
    pub is_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInvite {
    pub id: InviteId,
    /// Username the invite is pinned to; empty means the invitee picks one.
    pub username: String,
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingEntry {
    pub vm_id: u32,
    /// Unix milliseconds.
    pub start_time: Option<u64>,
    pub stop_time: Option<u64>,
    pub file_path: String,
}
