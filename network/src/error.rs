use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("peer store error: {0}")]
    Store(String),

    #[error("unknown peer {0}")]
    UnknownPeer(std::net::SocketAddr),
}
