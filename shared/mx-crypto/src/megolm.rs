//! Megolm Session Management
//!
//! Group ratchet for one-to-many encryption within a room: a single
//! encrypting (outbound) owner, many decrypting (inbound) holders.

use vodozemac::megolm::{
    GroupSession as VodozemacGroupSession, GroupSessionPickle, InboundGroupSession,
    InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::{CryptoError, Result};

/// The encrypting side of a group session.
///
/// Rotation bookkeeping (age, message count, shared devices) lives with
/// the caller; this type only carries the ratchet itself.
pub struct GroupSession {
    inner: VodozemacGroupSession,
}

impl GroupSession {
    /// Create a new group session with a fresh ratchet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: VodozemacGroupSession::new(SessionConfig::version_1()),
        }
    }

    /// Globally unique session id.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// The exportable session key, base64 encoded.
    ///
    /// Handing this to a peer lets them decrypt everything encrypted
    /// from the current ratchet index onwards; it cannot be revoked.
    #[must_use]
    pub fn session_key(&self) -> String {
        self.inner.session_key().to_base64()
    }

    /// Current ratchet index.
    #[must_use]
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// Encrypt a message, advancing the ratchet. Returns base64
    /// ciphertext.
    pub fn encrypt(&mut self, plaintext: &str) -> String {
        self.inner.encrypt(plaintext).to_base64()
    }

    /// Export the session as a pickle encrypted with `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    /// Restore a session from an encrypted pickle.
    pub fn deserialize(pickle: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickle = GroupSessionPickle::from_encrypted(pickle, pickle_key)?;
        Ok(Self {
            inner: VodozemacGroupSession::from(pickle),
        })
    }
}

impl Default for GroupSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The decrypting side of a group session, held once per sender device
/// per room.
pub struct MegolmInboundSession {
    inner: InboundGroupSession,
}

impl MegolmInboundSession {
    /// Create an inbound session from a base64 session key received
    /// from the sender.
    pub fn new(session_key: &str) -> Result<Self> {
        let session_key = SessionKey::from_base64(session_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid megolm session key: {e}")))?;
        Ok(Self {
            inner: InboundGroupSession::new(&session_key, SessionConfig::version_1()),
        })
    }

    /// Globally unique session id; matches the outbound side.
    #[must_use]
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// Earliest ratchet index this session can decrypt.
    #[must_use]
    pub fn first_known_index(&self) -> u32 {
        self.inner.first_known_index()
    }

    /// Decrypt a base64 ciphertext, returning the plaintext and its
    /// ratchet index (for replay detection by the caller).
    pub fn decrypt(&mut self, ciphertext: &str) -> Result<(String, u32)> {
        let message = MegolmMessage::from_base64(ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("malformed message: {e}")))?;
        let decrypted = self
            .inner
            .decrypt(&message)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        let plaintext = String::from_utf8(decrypted.plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("payload is not UTF-8: {e}")))?;
        Ok((plaintext, decrypted.message_index))
    }

    /// Export the session as a pickle encrypted with `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.inner.pickle().encrypt(pickle_key)
    }

    /// Restore a session from an encrypted pickle.
    pub fn deserialize(pickle: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickle = InboundGroupSessionPickle::from_encrypted(pickle, pickle_key)?;
        Ok(Self {
            inner: InboundGroupSession::from(pickle),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PICKLE_KEY: [u8; 32] = [0u8; 32];

    #[test]
    fn test_group_encrypt_decrypt() {
        let mut outbound = GroupSession::new();
        assert_eq!(outbound.message_index(), 0);

        let mut inbound = MegolmInboundSession::new(&outbound.session_key()).unwrap();
        assert_eq!(inbound.session_id(), outbound.session_id());
        assert_eq!(inbound.first_known_index(), 0);

        let ciphertext = outbound.encrypt("hello room");
        assert_eq!(outbound.message_index(), 1);

        let (plaintext, index) = inbound.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, "hello room");
        assert_eq!(index, 0);
    }

    #[test]
    fn test_late_joiner_cannot_read_history() {
        let mut outbound = GroupSession::new();
        let early = outbound.encrypt("before the join");

        // A key exported after the first message starts at index 1.
        let mut inbound = MegolmInboundSession::new(&outbound.session_key()).unwrap();
        assert_eq!(inbound.first_known_index(), 1);
        assert!(inbound.decrypt(&early).is_err());

        let late = outbound.encrypt("after the join");
        assert_eq!(inbound.decrypt(&late).unwrap().0, "after the join");
    }

    #[test]
    fn test_group_session_pickle_roundtrip() {
        let mut outbound = GroupSession::new();
        let mut inbound = MegolmInboundSession::new(&outbound.session_key()).unwrap();

        let pickle = outbound.serialize(&PICKLE_KEY);
        let mut restored = GroupSession::deserialize(&pickle, &PICKLE_KEY).unwrap();
        assert_eq!(restored.session_id(), outbound.session_id());

        let ciphertext = restored.encrypt("from the restored ratchet");
        assert_eq!(
            inbound.decrypt(&ciphertext).unwrap().0,
            "from the restored ratchet"
        );

        let inbound_pickle = inbound.serialize(&PICKLE_KEY);
        let restored_inbound =
            MegolmInboundSession::deserialize(&inbound_pickle, &PICKLE_KEY).unwrap();
        assert_eq!(restored_inbound.session_id(), inbound.session_id());
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(MegolmInboundSession::new("not a session key").is_err());

        let mut outbound = GroupSession::new();
        let mut inbound = MegolmInboundSession::new(&outbound.session_key()).unwrap();
        let _ = outbound.encrypt("real message");
        assert!(inbound.decrypt("not a ciphertext").is_err());
    }
}
