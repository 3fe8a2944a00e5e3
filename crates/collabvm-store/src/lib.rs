pub mod database;
pub mod invites;
pub mod migrations;
pub mod models;
pub mod recordings;
pub mod reserved;
pub mod server_config;
pub mod users;
pub mod vm_config;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
pub use users::{CreateAccountOutcome, LoginOutcome, SessionHandoff};
