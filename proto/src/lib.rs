//! Wire protocol: message set, framing, login flags, and the connection
//! handshake state machine.
//!
//! Every message on the wire is a frame: a 1-byte tag, a varint payload
//! length, and a bincode-encoded payload. Once the secure channel is
//! established, whole frames are additionally sealed with the session cipher.

pub mod codec;
pub mod error;
pub mod flags;
pub mod handshake;
pub mod messages;

pub use codec::{decode_frame, encode_frame, MAX_FRAME_SIZE};
pub use error::ProtoError;
pub use flags::{login_flags, ByeReason, IdType};
pub use handshake::{ConnState, Handshake};
pub use messages::NodeMsg;

/// Current protocol version, exchanged during login.
pub const PROTOCOL_VERSION: u32 = 1;
