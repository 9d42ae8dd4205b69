// src/error.rs
// Crate-level error types for peerns.
//
// One thiserror enum per subsystem, folded into `PeerNsError` at the crate
// boundary so callers that don't care about the distinction can use `?`
// against a single type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("the runtime lacks secure crypto primitives")]
    Unavailable,
    #[error("invalid key encoding: {0}")]
    InvalidKey(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("AEAD encryption failed")]
    EncryptFailed,
    #[error("AEAD decryption failed (wrong key or tampered ciphertext)")]
    DecryptFailed,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("endpoint '{0}' is already claimed")]
    AlreadyTaken(String),
    #[error("endpoint '{0}' is unreachable")]
    Unreachable(String),
    #[error("channel closed")]
    Closed,
    #[error("signaling transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("namespace level {0} exceeds MAX_LEVEL")]
    LevelExhausted(u8),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum ContactStoreError {
    #[error("no contact with persistent id '{0}'")]
    NotFound(String),
    #[error("public key is already recorded for this contact and cannot change")]
    PublicKeyImmutable,
    #[error("persistence backend error: {0}")]
    Persistence(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no shared key established with this contact")]
    NoSharedKey,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("connect retries exhausted for '{0}'")]
    RetriesExhausted(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
}

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("signature on rendezvous exchange did not verify")]
    InvalidExchange,
}

#[derive(Debug, Error)]
pub enum PeerNsError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    ContactStore(#[from] ContactStoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T, E = PeerNsError> = std::result::Result<T, E>;
