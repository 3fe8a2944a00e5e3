//! Server-wide settings persistence: a single bincode blob row. A fresh
//! database is seeded with defaults so the first load always succeeds.

use rusqlite::{params, OptionalExtension};

use collabvm_proto::ServerSettings;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub(crate) fn seed_defaults(&self) -> Result<()> {
        let existing: Option<i64> = self
            .conn()
            .query_row("SELECT id FROM server_config WHERE id = 0", [], |row| {
                row.get(0)
            })
            .optional()?;
        if existing.is_none() {
            tracing::info!("a new database has been created, writing default settings");
            self.save_server_settings(&ServerSettings::default())?;
        }
        Ok(())
    }

    pub fn load_server_settings(&self) -> Result<ServerSettings> {
        let blob: Option<Vec<u8>> = self
            .conn()
            .query_row("SELECT setting FROM server_config WHERE id = 0", [], |row| {
                row.get(0)
            })
            .optional()?;
        match blob {
            Some(blob) => match bincode::deserialize(&blob) {
                Ok(settings) => Ok(settings),
                Err(err) => {
                    tracing::warn!(error = %err, "server settings blob was invalid, using defaults");
                    let defaults = ServerSettings::default();
                    self.save_server_settings(&defaults)?;
                    Ok(defaults)
                }
            },
            None => Ok(ServerSettings::default()),
        }
    }

    pub fn save_server_settings(&self, settings: &ServerSettings) -> Result<()> {
        let blob = bincode::serialize(settings)?;
        self.conn().execute(
            "INSERT INTO server_config (id, setting) VALUES (0, ?1)
             ON CONFLICT(id) DO UPDATE SET setting = ?1",
            params![blob],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collabvm_proto::ServerSettingUpdate;

    #[test]
    fn fresh_database_has_default_settings() {
        let db = Database::open_in_memory().unwrap();
        let settings = db.load_server_settings().unwrap();
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.db");

        {
            let db = Database::open_at(&path).unwrap();
            let mut settings = db.load_server_settings().unwrap();
            settings.apply(&ServerSettingUpdate::MaxConnections(5));
            settings.apply(&ServerSettingUpdate::MaxConnectionsEnabled(true));
            db.save_server_settings(&settings).unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let settings = db.load_server_settings().unwrap();
        assert_eq!(settings.max_connections, 5);
        assert!(settings.max_connections_enabled);
    }
}
