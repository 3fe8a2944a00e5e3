use std::time::Duration;

/// Channel id of the global chat; VM channels use their VM id.
pub const GLOBAL_CHANNEL_ID: u32 = 0;

/// Largest frame a non-admin connection may send.
pub const MAX_GUEST_FRAME_LEN: usize = 1024;

/// Maximum length of a chat message in characters.
pub const MAX_CHAT_MESSAGE_LEN: usize = 100;

/// Number of messages retained in each chat room's history ring.
pub const CHAT_HISTORY_LEN: usize = 25;

/// Maximum number of private chat rooms per connection.
pub const MAX_PRIVATE_CHAT_ROOMS: usize = 10;

/// Minimum delay between chat messages from one connection.
pub const CHAT_RATE_LIMIT: Duration = Duration::from_secs(1);

/// Minimum delay between username changes from one connection.
pub const USERNAME_CHANGE_RATE_LIMIT: Duration = Duration::from_secs(10);

/// Maximum length of a VM description.
pub const MAX_VM_DESCRIPTION_LEN: usize = 200;

/// Maximum accepted password length.
pub const MAX_PASSWORD_LEN: usize = 160;

pub const SESSION_ID_LEN: usize = 16;
pub const INVITE_ID_LEN: usize = 32;
pub const TOTP_KEY_LEN: usize = 20;

/// Inclusive range guest numbers are drawn from.
pub const GUEST_NUMBER_RANGE: std::ops::RangeInclusive<u32> = 1_000..=99_999;
