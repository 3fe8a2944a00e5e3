use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtoError>;
