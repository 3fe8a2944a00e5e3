//! Account storage: registration, login, password changes, and sessions.

use argon2::Argon2;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};

use collabvm_proto::constants::SESSION_ID_LEN;
use collabvm_proto::SessionId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;

pub const PASSWORD_HASH_LEN: usize = 32;
pub const PASSWORD_SALT_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateAccountOutcome {
    Created { is_admin: bool },
    UsernameTaken,
    InviteInvalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    InvalidUsername,
    InvalidPassword,
    AccountDisabled,
    /// Carries the TOTP key the caller must validate the next message against.
    TwoFactorRequired(Vec<u8>),
}

/// Result of [`Database::create_session`]: the canonical username, the admin
/// flag, the session id that was replaced (if any), and the new session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandoff {
    pub username: String,
    pub is_admin: bool,
    pub old_session_id: Option<SessionId>,
    pub new_session_id: SessionId,
}

pub fn hash_password(password: &str, salt: &[u8]) -> Result<Vec<u8>> {
    let mut hash = vec![0u8; PASSWORD_HASH_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut hash)
        .map_err(|e| StoreError::PasswordHash(e.to_string()))?;
    Ok(hash)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Database {
    /// Create an account, either through an invite or open registration.
    ///
    /// With an invite id the invite is consumed atomically and the new
    /// account inherits its admin flag. Without one, the username must be
    /// free across accounts, reserved names, and pinned invites; the first
    /// account ever created becomes an admin.
    pub fn create_account(
        &self,
        username: &str,
        password: &str,
        totp_key: Option<&[u8]>,
        invite_id: Option<&[u8]>,
        ip: &[u8; 16],
    ) -> Result<CreateAccountOutcome> {
        let is_admin = if let Some(invite_id) = invite_id {
            let consumed = self.conn().execute(
                "UPDATE user_invites SET accepted = 1 WHERE id = ?1 AND accepted = 0",
                params![invite_id],
            )?;
            if consumed == 0 {
                return Ok(CreateAccountOutcome::InviteInvalid);
            }
            self.conn().query_row(
                "SELECT is_admin FROM user_invites WHERE id = ?1",
                params![invite_id],
                |row| row.get(0),
            )?
        } else {
            let taken: bool = self.conn().query_row(
                "SELECT COUNT(*) > 0 FROM (
                     SELECT 1 FROM users WHERE username = ?1
                     UNION SELECT 1 FROM reserved_usernames WHERE username = ?1
                     UNION SELECT 1 FROM user_invites WHERE username = ?1)",
                params![username],
                |row| row.get(0),
            )?;
            if taken {
                return Ok(CreateAccountOutcome::UsernameTaken);
            }
            self.conn()
                .query_row("SELECT COUNT(*) = 0 FROM users", [], |row| row.get(0))?
        };

        let salt = random_bytes(PASSWORD_SALT_LEN);
        let hash = hash_password(password, &salt)?;
        let now = now_secs();
        let insert = self.conn().execute(
            "INSERT INTO users (
                 username, password_hash, password_salt, totp_key,
                 registration_date, registration_ip, last_active_ip,
                 last_login, last_online, is_admin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?5, ?5, ?7)",
            params![username, hash, salt, totp_key, now, ip.as_slice(), is_admin],
        );
        match insert {
            Ok(_) => Ok(CreateAccountOutcome::Created { is_admin }),
            // The username was registered after the first check.
            Err(err) if is_constraint_violation(&err) => Ok(CreateAccountOutcome::UsernameTaken),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                "SELECT id, username, password_hash, password_salt, totp_key,
                        session_id, registration_date, registration_ip,
                        last_active_ip, last_login, last_failed_login,
                        last_online, failed_logins, is_admin, is_disabled
                 FROM users WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<LoginOutcome> {
        let Some(user) = self.get_user(username)? else {
            return Ok(LoginOutcome::InvalidUsername);
        };
        if user.is_disabled {
            return Ok(LoginOutcome::AccountDisabled);
        }
        let hash = hash_password(password, &user.password_salt)?;
        if hash != user.password_hash {
            self.conn().execute(
                "UPDATE users SET failed_logins = failed_logins + 1,
                                  last_failed_login = ?1
                 WHERE id = ?2",
                params![now_secs(), user.id],
            )?;
            return Ok(LoginOutcome::InvalidPassword);
        }
        match user.totp_key {
            Some(key) if !key.is_empty() => Ok(LoginOutcome::TwoFactorRequired(key)),
            _ => Ok(LoginOutcome::Success),
        }
    }

    /// Issue a fresh session id for `username`, replacing any existing one.
    ///
    /// Returns `None` for unknown or disabled accounts.
    pub fn create_session(
        &self,
        username: &str,
        ip: &[u8; 16],
    ) -> Result<Option<SessionHandoff>> {
        let Some(user) = self.get_user(username)? else {
            return Ok(None);
        };
        if user.is_disabled {
            return Ok(None);
        }

        loop {
            let new_session_id = SessionId(
                random_bytes(SESSION_ID_LEN)
                    .try_into()
                    .expect("fixed length"),
            );
            let update = self.conn().execute(
                "UPDATE users SET session_id = ?1, last_login = ?2,
                                  last_active_ip = ?3
                 WHERE id = ?4",
                params![
                    new_session_id.0.as_slice(),
                    now_secs(),
                    ip.as_slice(),
                    user.id
                ],
            );
            match update {
                Ok(_) => {
                    return Ok(Some(SessionHandoff {
                        username: user.username,
                        is_admin: user.is_admin,
                        old_session_id: user.session_id,
                        new_session_id,
                    }));
                }
                // Session id collision: generate another one and try again.
                Err(err) if is_constraint_violation(&err) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn change_password(
        &self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<bool> {
        let Some(user) = self.get_user(username)? else {
            return Ok(false);
        };
        let old_hash = hash_password(old_password, &user.password_salt)?;
        if old_hash != user.password_hash {
            return Ok(false);
        }
        let new_hash = hash_password(new_password, &user.password_salt)?;
        self.conn().execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![new_hash, user.id],
        )?;
        Ok(true)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let session_id: Option<Vec<u8>> = row.get(5)?;
    let registration_ip: Vec<u8> = row.get(7)?;
    let last_active_ip: Vec<u8> = row.get(8)?;
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        password_salt: row.get(3)?,
        totp_key: row.get(4)?,
        session_id: session_id.as_deref().and_then(SessionId::from_slice),
        registration_date: row.get::<_, i64>(6)? as u64,
        registration_ip: ip_bytes(&registration_ip),
        last_active_ip: ip_bytes(&last_active_ip),
        last_login: row.get::<_, i64>(9)? as u64,
        last_failed_login: row.get::<_, Option<i64>>(10)?.map(|t| t as u64),
        last_online: row.get::<_, i64>(11)? as u64,
        failed_logins: row.get(12)?,
        is_admin: row.get(13)?,
        is_disabled: row.get(14)?,
    })
}

fn ip_bytes(bytes: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let len = bytes.len().min(16);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}
