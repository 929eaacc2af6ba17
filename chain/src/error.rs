use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("store failure: {0}")]
    Store(String),

    #[error("processor rejected operation: {0}")]
    Rejected(String),
}
