use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(usize),

    #[error("varint is overlong or overflows")]
    BadVarint,

    #[error("unexpected message {got} in connection state {state}")]
    UnexpectedMessage { got: &'static str, state: &'static str },

    #[error("peer authentication failed")]
    AuthFailed,

    #[error("secure channel error: {0}")]
    SChannel(#[from] mist_crypto::SChannelError),
}

impl From<bincode::Error> for ProtoError {
    fn from(e: bincode::Error) -> Self {
        ProtoError::Malformed(e.to_string())
    }
}
