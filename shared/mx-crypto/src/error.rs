//! Crypto error types.

use thiserror::Error;

/// Errors from the cryptographic engine.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A stored pickle could not be decoded, usually because the pickle
    /// key is wrong or the blob is corrupted. Distinct from "not found".
    #[error("Invalid pickle: {0}")]
    Pickle(#[from] vodozemac::PickleError),

    /// A public key or session key could not be parsed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// An inbound session could not be established from a pre-key message.
    #[error("Session creation failed: {0}")]
    SessionCreation(String),

    /// A ciphertext could not be decrypted.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Crypto result type.
pub type Result<T> = std::result::Result<T, CryptoError>;
