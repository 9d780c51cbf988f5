//! Olm Session Management
//!
//! Double Ratchet protocol for pairwise encrypted communication.

use serde::{Deserialize, Serialize};
use vodozemac::olm::{Account, AccountPickle, Session, SessionConfig, SessionPickle};
use vodozemac::Curve25519PublicKey;

use crate::{CryptoError, Result};

pub use vodozemac::olm::OlmMessage;

/// Public identity keys of an account, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    /// Ed25519 signing key (the device fingerprint).
    pub ed25519: String,
    /// Curve25519 key used for session establishment.
    pub curve25519: String,
}

/// The local device's long-term Olm account.
///
/// Holds the identity key pair and the pool of one-time keys. The
/// private halves never leave the underlying vodozemac account; they
/// are only ever exported as an encrypted pickle via [`Self::serialize`].
pub struct OlmAccount {
    inner: Account,
}

impl OlmAccount {
    /// Create a brand-new account with fresh identity keys.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Account::new(),
        }
    }

    /// Public identity keys, base64 encoded.
    #[must_use]
    pub fn identity_keys(&self) -> IdentityKeyPair {
        IdentityKeyPair {
            ed25519: self.inner.ed25519_key().to_base64(),
            curve25519: self.inner.curve25519_key().to_base64(),
        }
    }

    /// The Curve25519 identity key.
    #[must_use]
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    /// Maximum number of one-time keys the engine can hold at once.
    #[must_use]
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate `count` new one-time keys.
    ///
    /// Once the pool is full the engine starts discarding keys, oldest
    /// first.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        let _ = self.inner.generate_one_time_keys(count);
    }

    /// Unpublished one-time keys as `(key_id, key)` base64 pairs.
    ///
    /// Sorted by key id. Key ids are monotonically increasing counters
    /// encoded as fixed-width base64, so this order matches generation
    /// order within and across calls.
    #[must_use]
    pub fn one_time_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .inner
            .one_time_keys()
            .into_iter()
            .map(|(key_id, key)| (key_id.to_base64(), key.to_base64()))
            .collect();
        keys.sort();
        keys
    }

    /// Mark the current one-time keys as published so they are not
    /// offered again.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign a message with the Ed25519 identity key, returning the
    /// base64 signature.
    #[must_use]
    pub fn sign(&self, message: &str) -> String {
        self.inner.sign(message).to_base64()
    }

    /// Start an outbound session to a peer device from its identity key
    /// and a claimed one-time key.
    #[must_use]
    pub fn create_outbound_session(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> OlmSession {
        let session =
            self.inner
                .create_outbound_session(SessionConfig::version_2(), identity_key, one_time_key);
        OlmSession { inner: session }
    }

    /// Establish an inbound session from a pre-key message.
    ///
    /// Consumes the one-time key the peer claimed; the account must be
    /// re-persisted afterwards. Returns the new session together with
    /// the decrypted payload of the pre-key message.
    pub fn create_inbound_session(
        &mut self,
        their_identity_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> Result<(OlmSession, String)> {
        let pre_key_message = match message {
            OlmMessage::PreKey(m) => m,
            OlmMessage::Normal(_) => {
                return Err(CryptoError::SessionCreation(
                    "expected a pre-key message".to_string(),
                ))
            }
        };
        let result = self
            .inner
            .create_inbound_session(their_identity_key, pre_key_message)
            .map_err(|e| CryptoError::SessionCreation(e.to_string()))?;
        let plaintext = String::from_utf8(result.plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("payload is not UTF-8: {e}")))?;
        Ok((
            OlmSession {
                inner: result.session,
            },
            plaintext,
        ))
    }

    /// Export the account as a pickle encrypted with `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    /// Restore an account from an encrypted pickle.
    pub fn deserialize(pickle: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickle = AccountPickle::from_encrypted(pickle, pickle_key)?;
        Ok(Self {
            inner: Account::from(pickle),
        })
    }
}

impl Default for OlmAccount {
    fn default() -> Self {
        Self::new()
    }
}

/// A pairwise ratchet session with one specific remote device.
pub struct OlmSession {
    inner: Session,
}

impl OlmSession {
    /// Globally unique session id.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Encrypt a message, advancing the ratchet.
    pub fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        self.inner.encrypt(plaintext)
    }

    /// Decrypt a message, advancing the ratchet.
    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<String> {
        let plaintext = self
            .inner
            .decrypt(message)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("payload is not UTF-8: {e}")))
    }

    /// Export the session as a pickle encrypted with `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    /// Restore a session from an encrypted pickle.
    pub fn deserialize(pickle: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickle = SessionPickle::from_encrypted(pickle, pickle_key)?;
        Ok(Self {
            inner: Session::from(pickle),
        })
    }
}
