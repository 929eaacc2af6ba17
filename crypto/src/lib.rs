//! Cryptographic primitives for the mist node: Blake2b digests, Ed25519
//! identity signatures, and the X25519 + ChaCha20-Poly1305 secure channel.

pub mod hash;
pub mod schannel;
pub mod sign;

pub use hash::{blake2b_256, blake2b_256_multi};
pub use schannel::{derive_session_key, ChannelKeys, FrameCipher, SChannelError};
pub use sign::{generate_keypair, keypair_from_seed, sign_message, verify_signature};
