//! Peer secure channel: X25519 ephemeral key agreement and per-frame
//! ChaCha20-Poly1305 sealing.
//!
//! Both sides generate an ephemeral X25519 key, exchange public halves in the
//! clear, and derive the session key from the Diffie-Hellman shared secret.
//! Every frame after the exchange is sealed with a direction-separated
//! counter nonce, so neither replay nor cross-direction reflection decrypts.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::hash::blake2b_256_multi;

/// Domain separator mixed into the session key derivation.
const SCHANNEL_CONTEXT: &[u8] = b"mist-schannel-v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SChannelError {
    #[error("frame authentication failed")]
    BadSeal,
    #[error("frame counter exhausted")]
    CounterExhausted,
}

/// One side's ephemeral channel keys.
pub struct ChannelKeys {
    secret: StaticSecret,
    public: [u8; 32],
}

impl ChannelKeys {
    /// Generate a fresh ephemeral key pair from the system random source.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic construction for tests.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Complete the key agreement against the remote ephemeral public key.
    pub fn agree(&self, remote_public: &[u8; 32]) -> [u8; 32] {
        let remote = X25519Public::from(*remote_public);
        let shared = self.secret.diffie_hellman(&remote);
        derive_session_key(shared.as_bytes())
    }
}

/// Derive the symmetric session key from the raw DH shared secret.
pub fn derive_session_key(shared: &[u8; 32]) -> [u8; 32] {
    blake2b_256_multi(&[shared, SCHANNEL_CONTEXT])
}

/// The channel-binding transcript both peers sign during authentication:
/// hash of both ephemeral public keys in initiator-first order.
pub fn channel_binding(initiator_eph: &[u8; 32], responder_eph: &[u8; 32]) -> [u8; 32] {
    blake2b_256_multi(&[initiator_eph, responder_eph, SCHANNEL_CONTEXT])
}

/// Seals and opens frames on an established channel.
///
/// Nonces are the direction byte, three zero bytes, and a little-endian
/// frame counter; the initiator seals on direction 0 and opens on
/// direction 1, the responder the reverse.
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
    send_dir: u8,
    send_ctr: u64,
    recv_ctr: u64,
}

impl FrameCipher {
    pub fn new(session_key: &[u8; 32], initiator: bool) -> Self {
        let cipher = ChaCha20Poly1305::new_from_slice(session_key).expect("32-byte key");
        Self {
            cipher,
            send_dir: if initiator { 0 } else { 1 },
            send_ctr: 0,
            recv_ctr: 0,
        }
    }

    fn nonce(dir: u8, ctr: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[0] = dir;
        bytes[4..12].copy_from_slice(&ctr.to_le_bytes());
        Nonce::from(bytes)
    }

    /// Seal an outbound frame.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SChannelError> {
        let ctr = self.send_ctr;
        self.send_ctr = ctr.checked_add(1).ok_or(SChannelError::CounterExhausted)?;
        let nonce = Self::nonce(self.send_dir, ctr);
        self.cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SChannelError::BadSeal)
    }

    /// Open an inbound frame. The receive counter advances only on success,
    /// so one corrupt frame does not desynchronize the channel state before
    /// the peer is dropped.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, SChannelError> {
        let nonce = Self::nonce(self.send_dir ^ 1, self.recv_ctr);
        let plain = self
            .cipher
            .decrypt(&nonce, ciphertext)
            .map_err(|_| SChannelError::BadSeal)?;
        self.recv_ctr += 1;
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (FrameCipher, FrameCipher) {
        let a = ChannelKeys::from_seed([1u8; 32]);
        let b = ChannelKeys::from_seed([2u8; 32]);
        let ka = a.agree(&b.public());
        let kb = b.agree(&a.public());
        assert_eq!(ka, kb);
        (FrameCipher::new(&ka, true), FrameCipher::new(&kb, false))
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        pair();
    }

    #[test]
    fn seal_open_roundtrip_both_directions() {
        let (mut init, mut resp) = pair();

        let sealed = init.seal(b"ping").unwrap();
        assert_eq!(resp.open(&sealed).unwrap(), b"ping");

        let sealed = resp.seal(b"pong").unwrap();
        assert_eq!(init.open(&sealed).unwrap(), b"pong");
    }

    #[test]
    fn frames_must_arrive_in_order() {
        let (mut init, mut resp) = pair();
        let first = init.seal(b"one").unwrap();
        let second = init.seal(b"two").unwrap();

        // Delivering the second frame first fails the counter nonce.
        assert_eq!(resp.open(&second), Err(SChannelError::BadSeal));
        assert_eq!(resp.open(&first).unwrap(), b"one");
        assert_eq!(resp.open(&second).unwrap(), b"two");
    }

    #[test]
    fn tampered_frame_rejected() {
        let (mut init, mut resp) = pair();
        let mut sealed = init.seal(b"payload").unwrap();
        sealed[0] ^= 0xFF;
        assert_eq!(resp.open(&sealed), Err(SChannelError::BadSeal));
    }

    #[test]
    fn reflection_does_not_decrypt() {
        let (mut init, _) = pair();
        let sealed = init.seal(b"echo").unwrap();
        // The initiator opening its own frame uses the opposite direction
        // nonce and must fail.
        assert_eq!(init.open(&sealed), Err(SChannelError::BadSeal));
    }

    #[test]
    fn channel_binding_is_order_sensitive() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_ne!(channel_binding(&a, &b), channel_binding(&b, &a));
    }
}
