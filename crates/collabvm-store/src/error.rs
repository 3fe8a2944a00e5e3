use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    #[error("Corrupt settings blob: {0}")]
    SettingsBlob(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
