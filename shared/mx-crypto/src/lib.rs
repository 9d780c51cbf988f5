//! E2EE Cryptography Primitives
//!
//! End-to-end encryption building blocks using vodozemac (Olm/Megolm).
//!
//! - **Olm**: Double Ratchet for pairwise encrypted sessions
//! - **Megolm**: Efficient group encryption for rooms
//!
//! Everything that touches ratchet state lives behind the wrapper types
//! in [`olm`] and [`megolm`]; callers only ever see base64 strings and
//! encrypted pickles, never raw key material.

pub mod error;
pub mod megolm;
pub mod olm;

pub use error::{CryptoError, Result};

/// Re-export vodozemac types that are commonly needed.
pub mod types {
    pub use vodozemac::Curve25519PublicKey;
    pub use vodozemac::Ed25519PublicKey;
    pub use vodozemac::Ed25519Signature;
    pub use vodozemac::KeyId;
}
