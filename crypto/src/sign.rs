//! Ed25519 identity key generation, signing, and verification.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use mist_types::{KeyPair, PrivateKey, PublicKey, Signature};

/// Generate a new Ed25519 key pair from the system random source.
pub fn generate_keypair() -> KeyPair {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    keypair_from_seed(&seed)
}

/// Derive the deterministic key pair for a 32-byte seed.
pub fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    let signing_key = SigningKey::from_bytes(seed);
    KeyPair {
        public: PublicKey(signing_key.verifying_key().to_bytes()),
        private: PrivateKey(*seed),
    }
}

/// Sign a message with a private key, returning the signature.
pub fn sign_message(message: &[u8], private_key: &PrivateKey) -> Signature {
    let signing_key = SigningKey::from_bytes(&private_key.0);
    let sig = signing_key.sign(message);
    Signature(sig.to_bytes())
}

/// Verify a signature against a message and public key.
///
/// Returns `true` if the signature is valid, `false` otherwise.
/// Also rejects non-canonical signatures (malleability protection).
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };
    let dalek_sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    verifying_key.verify(message, &dalek_sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = keypair_from_seed(&[7u8; 32]);
        let sig = sign_message(b"hello peer", &kp.private);
        assert!(verify_signature(b"hello peer", &sig, &kp.public));
    }

    #[test]
    fn wrong_message_rejected() {
        let kp = keypair_from_seed(&[7u8; 32]);
        let sig = sign_message(b"hello peer", &kp.private);
        assert!(!verify_signature(b"hello pear", &sig, &kp.public));
    }

    #[test]
    fn wrong_key_rejected() {
        let kp = keypair_from_seed(&[7u8; 32]);
        let other = keypair_from_seed(&[8u8; 32]);
        let sig = sign_message(b"hello peer", &kp.private);
        assert!(!verify_signature(b"hello peer", &sig, &other.public));
    }

    #[test]
    fn seed_is_deterministic() {
        let a = keypair_from_seed(&[1u8; 32]);
        let b = keypair_from_seed(&[1u8; 32]);
        assert_eq!(a.public, b.public);
    }
}
