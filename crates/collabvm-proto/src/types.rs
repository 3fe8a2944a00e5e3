use serde::{Deserialize, Serialize};

use crate::constants::{INVITE_ID_LEN, SESSION_ID_LEN};

/// Canonical IPv6 byte form of a client address (IPv4 is mapped).
pub type IpBytes = [u8; 16];

// Opaque session token handed to a client after login or registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; SESSION_ID_LEN]);

impl SessionId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SESSION_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InviteId(pub [u8; INVITE_ID_LEN]);

impl InviteId {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; INVITE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UserType {
    Guest,
    Regular,
    Admin,
}

impl UserType {
    pub fn is_admin(&self) -> bool {
        matches!(self, UserType::Admin)
    }
}

/// Public VM metadata shown to list viewers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmInfo {
    pub id: u32,
    pub name: String,
    pub description: String,
    pub online_count: u32,
    pub turns_enabled: bool,
}

/// Superset of [`VmInfo`] visible only to admins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminVmInfo {
    pub id: u32,
    pub name: String,
    pub running: bool,
    pub online_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmSettings {
    pub name: String,
    pub description: String,
    pub turns_enabled: bool,
    /// Turn length in seconds.
    pub turn_time: u32,
    pub disallow_guests: bool,
    pub auto_start: bool,
    pub protocol: VmProtocol,
    pub start_command: String,
    pub stop_command: String,
    pub remote_parameters: Vec<(String, String)>,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            turns_enabled: true,
            turn_time: 30,
            disallow_guests: false,
            auto_start: false,
            protocol: VmProtocol::Vnc,
            start_command: String::new(),
            stop_command: String::new(),
            remote_parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmProtocol {
    Vnc,
    Rdp,
}

/// Single-field update applied to a [`VmSettings`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmSettingUpdate {
    Name(String),
    Description(String),
    TurnsEnabled(bool),
    TurnTime(u32),
    DisallowGuests(bool),
    AutoStart(bool),
    Protocol(VmProtocol),
    StartCommand(String),
    StopCommand(String),
    RemoteParameters(Vec<(String, String)>),
}

impl VmSettings {
    pub fn apply(&mut self, update: &VmSettingUpdate) {
        match update {
            VmSettingUpdate::Name(v) => self.name = v.clone(),
            VmSettingUpdate::Description(v) => self.description = v.clone(),
            VmSettingUpdate::TurnsEnabled(v) => self.turns_enabled = *v,
            VmSettingUpdate::TurnTime(v) => self.turn_time = *v,
            VmSettingUpdate::DisallowGuests(v) => self.disallow_guests = *v,
            VmSettingUpdate::AutoStart(v) => self.auto_start = *v,
            VmSettingUpdate::Protocol(v) => self.protocol = *v,
            VmSettingUpdate::StartCommand(v) => self.start_command = v.clone(),
            VmSettingUpdate::StopCommand(v) => self.stop_command = v.clone(),
            VmSettingUpdate::RemoteParameters(v) => self.remote_parameters = v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaptchaSettings {
    pub enabled: bool,
    pub https: bool,
    pub url_host: String,
    pub url_port: u16,
    pub url_path: String,
    pub post_params: String,
    pub valid_json_variable_name: String,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            https: true,
            url_host: String::new(),
            url_port: 443,
            url_path: String::new(),
            post_params: String::new(),
            valid_json_variable_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordingSettings {
    /// Length of one recording file in minutes; 0 disables recording.
    pub file_duration: u32,
    /// Interval between keyframes in seconds; 0 disables keyframes.
    pub keyframe_interval: u32,
    pub capture_display: bool,
    pub capture_input: bool,
    pub capture_audio: bool,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            file_duration: 0,
            keyframe_interval: 0,
            capture_display: true,
            capture_input: true,
            capture_audio: true,
        }
    }
}

/// Server-wide configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ServerSettings {
    pub captcha: CaptchaSettings,
    pub max_connections_enabled: bool,
    pub max_connections: u32,
    pub captcha_required: bool,
    pub allow_account_registration: bool,
    pub ban_ip_command: String,
    pub recordings: RecordingSettings,
}

/// Single-field update applied to a [`ServerSettings`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerSettingUpdate {
    Captcha(CaptchaSettings),
    MaxConnectionsEnabled(bool),
    MaxConnections(u32),
    CaptchaRequired(bool),
    AllowAccountRegistration(bool),
    BanIpCommand(String),
    Recordings(RecordingSettings),
}

impl ServerSettings {
    pub fn apply(&mut self, update: &ServerSettingUpdate) {
        match update {
            ServerSettingUpdate::Captcha(v) => self.captcha = v.clone(),
            ServerSettingUpdate::MaxConnectionsEnabled(v) => self.max_connections_enabled = *v,
            ServerSettingUpdate::MaxConnections(v) => self.max_connections = *v,
            ServerSettingUpdate::CaptchaRequired(v) => self.captcha_required = *v,
            ServerSettingUpdate::AllowAccountRegistration(v) => {
                self.allow_account_registration = *v
            }
            ServerSettingUpdate::BanIpCommand(v) => self.ban_ip_command = v.clone(),
            ServerSettingUpdate::Recordings(v) => self.recordings = *v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_hex_roundtrip() {
        let id = SessionId([0xAB; 16]);
        assert_eq!(id.to_hex().len(), 32);
        assert!(SessionId::from_slice(&[0u8; 15]).is_none());
        assert!(SessionId::from_slice(&[0u8; 16]).is_some());
    }

    #[test]
    fn settings_apply_is_element_wise() {
        let mut settings = ServerSettings::default();
        settings.apply(&ServerSettingUpdate::MaxConnections(5));
        settings.apply(&ServerSettingUpdate::MaxConnectionsEnabled(true));
        assert_eq!(settings.max_connections, 5);
        assert!(settings.max_connections_enabled);
        // Untouched fields keep their defaults.
        assert!(!settings.captcha_required);
    }
}
