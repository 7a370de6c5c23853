//! Key material and signatures.
//!
//! The engine is independent of the concrete signature scheme: it only
//! ever handles the [`KeyPair`], [`PublicKey`] and [`Signature`] wrappers
//! defined here. A new scheme is a new [`KeyType`] variant; nothing above
//! this module changes.

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;

/// Supported signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Ed25519 single signatures.
    Ed25519,
}

/// A signing keypair held by this replica.
#[derive(Clone)]
pub enum KeyPair {
    Ed25519(ed25519_dalek::SigningKey),
}

/// A replica's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicKey {
    Ed25519([u8; 32]),
}

/// A signature over a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Ed25519([u8; 64]),
}

impl KeyPair {
    /// Generate a fresh keypair from the system RNG.
    pub fn generate(key_type: KeyType) -> Self {
        match key_type {
            KeyType::Ed25519 => KeyPair::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng)),
        }
    }

    /// Derive a keypair deterministically from a 32-byte seed.
    ///
    /// Deterministic keys keep test setups reproducible.
    pub fn from_seed(key_type: KeyType, seed: &[u8; 32]) -> Self {
        match key_type {
            KeyType::Ed25519 => KeyPair::Ed25519(ed25519_dalek::SigningKey::from_bytes(seed)),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        match self {
            KeyPair::Ed25519(sk) => Signature::Ed25519(sk.sign(message).to_bytes()),
        }
    }

    /// The public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        match self {
            KeyPair::Ed25519(sk) => PublicKey::Ed25519(sk.verifying_key().to_bytes()),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPair::Ed25519(_) => f.write_str("KeyPair::Ed25519(..)"),
        }
    }
}

impl PublicKey {
    /// Verify a signature over a message.
    ///
    /// Returns false for malformed keys or scheme mismatches as well as
    /// for honest verification failures; the caller only ever drops the
    /// input either way.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        match (self, signature) {
            (PublicKey::Ed25519(pk), Signature::Ed25519(sig)) => {
                let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(pk) else {
                    return false;
                };
                let sig = ed25519_dalek::Signature::from_bytes(sig);
                key.verify(message, &sig).is_ok()
            }
        }
    }

    /// Scheme of this key.
    pub fn key_type(&self) -> KeyType {
        match self {
            PublicKey::Ed25519(_) => KeyType::Ed25519,
        }
    }
}

impl Signature {
    /// Raw signature bytes as laid out on the wire.
    pub fn to_bytes(self) -> [u8; 64] {
        match self {
            Signature::Ed25519(bytes) => bytes,
        }
    }

    /// Rebuild a signature from wire bytes.
    pub fn from_bytes(key_type: KeyType, bytes: [u8; 64]) -> Self {
        match key_type {
            KeyType::Ed25519 => Signature::Ed25519(bytes),
        }
    }
}
