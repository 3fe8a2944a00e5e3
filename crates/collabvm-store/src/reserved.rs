use rusqlite::params;

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    pub fn create_reserved_username(&self, username: &str) -> Result<bool> {
        match self.conn().execute(
            "INSERT INTO reserved_usernames (username) VALUES (?1)",
            params![username],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn read_reserved_usernames(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT username FROM reserved_usernames ORDER BY username")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn delete_reserved_username(&self, username: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reserved_usernames WHERE username = ?1",
            params![username],
        )?;
        Ok(affected > 0)
    }

    /// Case-insensitive check used before a live connection may claim a name.
    pub fn is_username_reserved(&self, username: &str) -> Result<bool> {
        self.conn()
            .query_row(
                "SELECT COUNT(*) > 0 FROM reserved_usernames WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(StoreError::Sqlite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_usernames_are_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.create_reserved_username("Staff").unwrap());
        assert!(!db.create_reserved_username("staff").unwrap());
        assert!(db.is_username_reserved("STAFF").unwrap());

        assert_eq!(db.read_reserved_usernames().unwrap(), vec!["Staff"]);
        assert!(db.delete_reserved_username("staff").unwrap());
        assert!(!db.is_username_reserved("staff").unwrap());
    }
}
