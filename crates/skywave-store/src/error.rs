use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user name {0:?} is already registered")]
    NameTaken(String),

    #[error("no such user: {0}")]
    UnknownUser(u32),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}
