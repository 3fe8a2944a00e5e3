use serde::{Deserialize, Serialize};

use crate::constants::MAX_GUEST_FRAME_LEN;
use crate::error::{ProtoError, Result};
use crate::instruction::RemoteInstruction;
use crate::types::{
    AdminVmInfo, InviteId, IpBytes, ServerSettingUpdate, ServerSettings, SessionId, UserType,
    VmInfo, VmSettingUpdate, VmSettings,
};

/// Where a chat message is addressed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatDestination {
    /// Open a new direct chat with the named user.
    NewDirect(String),
    /// An existing direct chat, by the sender's local chat-room id.
    Direct(u32),
    /// A channel: the global chat (id 0) or a VM channel.
    Vm(u32),
}

/// Client-to-server message union.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientMessage {
    ConnectToChannel(u32),
    ChatMessage {
        destination: ChatDestination,
        text: String,
    },
    TurnRequest,
    Vote(bool),
    Instruction(RemoteInstruction),
    ChangeUsername(String),
    ChangePassword {
        old_password: String,
        new_password: String,
    },
    Login {
        username: String,
        password: String,
        captcha_token: String,
    },
    TwoFactorResponse(u32),
    Register {
        username: String,
        password: String,
        totp_key: Option<Vec<u8>>,
        invite_id: Option<InviteId>,
        captcha_token: String,
    },
    CaptchaCompleted(String),
    VmListRequest,
    ServerConfigRequest,
    ServerConfigModifications(Vec<ServerSettingUpdate>),
    ServerConfigHidden,
    CreateVm(Vec<VmSettingUpdate>),
    ReadVms,
    ReadVmConfig(u32),
    UpdateVmConfig {
        id: u32,
        modifications: Vec<VmSettingUpdate>,
    },
    DeleteVm(u32),
    StartVms(Vec<u32>),
    StopVms(Vec<u32>),
    RestartVms(Vec<u32>),
    CreateInvite {
        name: String,
        username: String,
        admin: bool,
    },
    ReadInvites,
    UpdateInvite {
        id: InviteId,
        username: String,
        admin: bool,
    },
    DeleteInvite(InviteId),
    ValidateInvite(InviteId),
    CreateReservedUsername(String),
    ReadReservedUsernames,
    DeleteReservedUsername(String),
    BanIp(IpBytes),
    SendCaptcha {
        username: String,
        channel: u32,
    },
    KickUser {
        username: String,
        channel: u32,
    },
    PauseTurnTimer,
    ResumeTurnTimer,
    EndTurn,
    RecordingPreviewRequest {
        vm_id: u32,
        start_time: u64,
        stop_time: u64,
        /// Milliseconds between thumbnails; 0 means one per keyframe.
        time_interval: u64,
        width: u32,
        height: u32,
    },
}

/// One entry of a chat room's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageRecord {
    pub sender: String,
    pub user_type: UserType,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectSuccess {
    pub channel: u32,
    pub username: String,
    pub captcha_required: bool,
    pub history: Vec<ChatMessageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectResult {
    Success(ConnectSuccess),
    Fail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatMessageResult {
    UserNotFound,
    UserChatLimit,
    RecipientChatLimit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: SessionId,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LoginResult {
    Success(Session),
    InvalidUsername,
    InvalidPassword,
    AccountDisabled,
    TwoFactorRequired,
    InvalidCaptchaToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RegisterResult {
    Success(Session),
    UsernameTaken,
    UsernameInvalid,
    PasswordInvalid,
    TotpError,
    InviteInvalid,
    InvalidCaptchaToken,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserListEntry {
    pub username: String,
    pub user_type: UserType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminUserListEntry {
    pub username: String,
    pub user_type: UserType,
    pub ip_address: IpBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InviteEntry {
    pub id: InviteId,
    pub name: String,
}

/// Current turn state of one VM channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnInfo {
    pub channel: u32,
    pub holder: Option<String>,
    pub queue: Vec<String>,
    pub millis_remaining: u64,
    pub paused: bool,
}

/// Server-to-client message union.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerMessage {
    ConnectResponse(ConnectResult),
    ChatMessage {
        channel: u32,
        message: ChatMessageRecord,
    },
    ChatMessageResponse(ChatMessageResult),
    /// Confirms a direct chat; `message` is present when the peer opened it.
    NewChatChannel {
        channel: u32,
        message: Option<ChatMessageRecord>,
    },
    UsernameTaken,
    ChangeUsername {
        old_username: String,
        new_username: String,
    },
    UserList {
        channel: u32,
        users: Vec<UserListEntry>,
    },
    AdminUserList {
        channel: u32,
        users: Vec<AdminUserListEntry>,
    },
    UserListAdd {
        channel: u32,
        user: UserListEntry,
    },
    AdminUserListAdd {
        channel: u32,
        user: AdminUserListEntry,
    },
    UserListRemove {
        channel: u32,
        username: String,
    },
    LoginResponse(LoginResult),
    RegistrationResponse(RegisterResult),
    CaptchaRequired(bool),
    ChangePasswordResponse(bool),
    SessionExpired,
    VmList(Vec<VmInfo>),
    AdminVmList(Vec<AdminVmInfo>),
    VmThumbnail {
        id: u32,
        png: Vec<u8>,
    },
    CreateVmResponse(u32),
    VmConfig(VmSettings),
    ServerConfig(ServerSettings),
    CreateInviteResult(Option<InviteId>),
    ReadInvitesResponse(Vec<InviteEntry>),
    UpdateInviteResult(bool),
    InviteValidationResponse {
        is_valid: bool,
        username: String,
    },
    ReadReservedUsernamesResponse(Vec<String>),
    TurnInfo(TurnInfo),
    VoteStatus {
        channel: u32,
        yes: u32,
        no: u32,
    },
    Instruction(RemoteInstruction),
    RecordingPlaybackPreview {
        vm_id: u32,
        timestamp: u64,
        png: Vec<u8>,
    },
    RecordingPlaybackResult(bool),
}

impl ClientMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(ProtoError::from)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(ProtoError::from)
    }

    /// Decode under the non-admin receive-buffer limit.
    pub fn from_bytes_bounded(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_GUEST_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge {
                len: data.len(),
                max: MAX_GUEST_FRAME_LEN,
            });
        }
        Self::from_bytes(data)
    }
}

impl ServerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(ProtoError::from)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(ProtoError::from)
    }

    /// Read one message from a stream of concatenated frames.
    pub fn read_from<R: std::io::Read>(reader: &mut R) -> Result<Self> {
        bincode::deserialize_from(reader).map_err(ProtoError::from)
    }

    /// Append this message to a stream of concatenated frames.
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        bincode::serialize_into(writer, self).map_err(ProtoError::from)
    }
}
