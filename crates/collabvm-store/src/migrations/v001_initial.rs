//! v001 -- Initial schema creation.
//!
//! Creates the six core tables: `users`, `user_invites`,
//! `reserved_usernames`, `server_config`, `vm_config`, and `recordings`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Accounts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    username            TEXT NOT NULL UNIQUE COLLATE NOCASE,
    password_hash       BLOB NOT NULL,
    password_salt       BLOB NOT NULL,
    totp_key            BLOB,                     -- 20 bytes when 2FA is enabled
    session_id          BLOB UNIQUE,              -- 16 bytes, current session
    registration_date   INTEGER NOT NULL,         -- unix seconds
    registration_ip     BLOB NOT NULL,            -- 16-byte IPv6 form
    last_active_ip      BLOB NOT NULL,
    last_login          INTEGER NOT NULL,
    last_failed_login   INTEGER,
    last_online         INTEGER NOT NULL,
    failed_logins       INTEGER NOT NULL DEFAULT 0,
    is_admin            INTEGER NOT NULL DEFAULT 0,
    is_disabled         INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Invites
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_invites (
    id          BLOB PRIMARY KEY NOT NULL,        -- 32 random bytes
    username    TEXT UNIQUE COLLATE NOCASE,       -- optional pinned username
    invite_name TEXT NOT NULL,
    is_admin    INTEGER NOT NULL DEFAULT 0,
    accepted    INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Usernames guests may never take
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS reserved_usernames (
    username TEXT PRIMARY KEY NOT NULL COLLATE NOCASE
);

-- ----------------------------------------------------------------
-- Server and per-VM configuration (bincode blobs)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS server_config (
    id      INTEGER PRIMARY KEY CHECK (id = 0),   -- single row
    setting BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS vm_config (
    vm_id   INTEGER PRIMARY KEY NOT NULL,
    setting BLOB NOT NULL
);

-- ----------------------------------------------------------------
-- Recording index
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS recordings (
    vm_id      INTEGER NOT NULL,
    start_time INTEGER,                           -- unix milliseconds
    stop_time  INTEGER,
    file_path  TEXT NOT NULL UNIQUE,

    PRIMARY KEY (vm_id, start_time)
);

CREATE INDEX IF NOT EXISTS idx_recordings_vm_time
    ON recordings(vm_id, start_time, stop_time);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
