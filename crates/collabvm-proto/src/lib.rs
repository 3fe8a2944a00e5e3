pub mod constants;
pub mod instruction;
pub mod messages;
pub mod recording;
pub mod types;
pub mod validation;

mod error;

pub use error::ProtoError;
pub use instruction::RemoteInstruction;
pub use messages::{ClientMessage, ServerMessage};
pub use types::*;
