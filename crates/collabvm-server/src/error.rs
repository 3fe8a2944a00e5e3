use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    #[allow(dead_code)]
    Proto(#[from] collabvm_proto::ProtoError),

    #[error("Store error: {0}")]
    Store(#[from] collabvm_store::StoreError),

    #[error("IO error: {0}")]
    #[allow(dead_code)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
