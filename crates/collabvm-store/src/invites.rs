use rand::RngCore;
use rusqlite::{params, OptionalExtension};

use collabvm_proto::constants::INVITE_ID_LEN;
use collabvm_proto::InviteId;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::UserInvite;

impl Database {
    /// Create an invite, optionally pinned to a username. Returns `None`
    /// when the pinned username is already registered.
    pub fn create_invite(
        &self,
        invite_name: &str,
        username: &str,
        is_admin: bool,
    ) -> Result<Option<InviteId>> {
        if !username.is_empty() {
            let taken: bool = self.conn().query_row(
                "SELECT COUNT(*) > 0 FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )?;
            if taken {
                return Ok(None);
            }
        }

        loop {
            let mut id = [0u8; INVITE_ID_LEN];
            rand::thread_rng().fill_bytes(&mut id);
            let insert = self.conn().execute(
                "INSERT INTO user_invites (id, username, invite_name, is_admin)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    id.as_slice(),
                    if username.is_empty() { None } else { Some(username) },
                    invite_name,
                    is_admin
                ],
            );
            match insert {
                Ok(_) => return Ok(Some(InviteId(id))),
                Err(rusqlite::Error::SqliteFailure(e, ref msg))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    // Id collision: retry. Username collision: give up.
                    if msg.as_deref().is_some_and(|m| m.contains("username")) {
                        return Ok(None);
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn read_invites(&self) -> Result<Vec<UserInvite>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, username, invite_name, is_admin FROM user_invites ORDER BY invite_name",
        )?;
        let rows = stmt.query_map([], row_to_invite)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn update_invite(&self, id: &InviteId, username: &str, is_admin: bool) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE user_invites SET username = ?1, is_admin = ?2 WHERE id = ?3",
            params![
                if username.is_empty() { None } else { Some(username) },
                is_admin,
                id.0.as_slice()
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn delete_invite(&self, id: &InviteId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM user_invites WHERE id = ?1",
            params![id.0.as_slice()],
        )?;
        Ok(affected > 0)
    }

    /// Check an unaccepted invite and return its pinned username (empty when
    /// the invitee may choose their own). `None` means the invite is invalid.
    pub fn validate_invite(&self, id: &InviteId) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT username FROM user_invites WHERE id = ?1 AND accepted = 0",
                params![id.0.as_slice()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(|found| found.map(|username| username.unwrap_or_default()))
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_invite(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserInvite> {
    let id: Vec<u8> = row.get(0)?;
    let username: Option<String> = row.get(1)?;
    Ok(UserInvite {
        id: InviteId::from_slice(&id).unwrap_or(InviteId([0u8; INVITE_ID_LEN])),
        username: username.unwrap_or_default(),
        name: row.get(2)?,
        is_admin: row.get(3)?,
    })
}
