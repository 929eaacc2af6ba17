use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Proto(#[from] mist_proto::ProtoError),

    #[error("network error: {0}")]
    Network(#[from] mist_network::NetworkError),

    #[error("chain error: {0}")]
    Chain(#[from] mist_chain::ChainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown timeout")]
    ShutdownTimeout,
}
