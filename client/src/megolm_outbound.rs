//! Outbound group session with rotation bookkeeping.
//!
//! Wraps the raw group ratchet with the metadata a client needs to
//! decide when a session has outlived its welcome: how old it is, how
//! many messages it has encrypted and which devices hold its key.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use mx_crypto::megolm::GroupSession;

/// Default maximum number of messages before rotation.
pub const DEFAULT_MAX_MESSAGES: u64 = 100;

/// Default maximum session age before rotation.
#[must_use]
pub fn default_max_age() -> Duration {
    Duration::days(7)
}

/// Lifecycle state of an outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created but nothing encrypted yet.
    Fresh,
    /// In active use, within its limits.
    Active,
    /// Past its age or message limit; must be replaced before further
    /// encryption.
    NeedsRotation,
}

/// An outbound group session for a single room.
///
/// Rotation is evaluated, never enforced: callers check [`Self::status`]
/// and replace the session themselves, since rotation also means
/// re-sharing a key with every device in the room.
pub struct MegolmOutboundSession {
    session: GroupSession,
    /// Device ids this session's key has been shared with.
    pub devices: HashSet<String>,
    max_age: Duration,
    max_messages: u64,
    creation_time: DateTime<Utc>,
    message_count: u64,
}

impl MegolmOutboundSession {
    /// Create a session with the default rotation limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(default_max_age(), DEFAULT_MAX_MESSAGES)
    }

    /// Create a session with explicit rotation limits.
    #[must_use]
    pub fn with_limits(max_age: Duration, max_messages: u64) -> Self {
        Self {
            session: GroupSession::new(),
            devices: HashSet::new(),
            max_age,
            max_messages,
            creation_time: Utc::now(),
            message_count: 0,
        }
    }

    /// Rehydrate a session from stored state.
    pub fn from_parts(
        session: GroupSession,
        devices: HashSet<String>,
        max_age: Duration,
        max_messages: u64,
        creation_time: DateTime<Utc>,
        message_count: u64,
    ) -> Self {
        Self {
            session,
            devices,
            max_age,
            max_messages,
            creation_time,
            message_count,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// The exportable session key at the current ratchet index.
    #[must_use]
    pub fn session_key(&self) -> String {
        self.session.session_key()
    }

    /// Encrypt a message, advancing the ratchet and the message count.
    pub fn encrypt(&mut self, plaintext: &str) -> String {
        let ciphertext = self.session.encrypt(plaintext);
        self.message_count += 1;
        ciphertext
    }

    /// Record that one device now holds this session's key.
    pub fn add_device(&mut self, device_id: &str) {
        self.devices.insert(device_id.to_string());
    }

    /// Record a batch of devices that now hold this session's key.
    pub fn add_devices(&mut self, device_ids: &HashSet<String>) {
        self.devices.extend(device_ids.iter().cloned());
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    #[must_use]
    pub fn max_messages(&self) -> u64 {
        self.max_messages
    }

    #[must_use]
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    #[must_use]
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Current lifecycle state.
    ///
    /// A session needs rotation once it reaches either limit; the
    /// limits themselves are inclusive.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        if self.message_count >= self.max_messages
            || Utc::now() - self.creation_time >= self.max_age
        {
            SessionStatus::NeedsRotation
        } else if self.message_count == 0 {
            SessionStatus::Fresh
        } else {
            SessionStatus::Active
        }
    }

    #[must_use]
    pub fn should_rotate(&self) -> bool {
        self.status() == SessionStatus::NeedsRotation
    }

    /// Export the inner ratchet as a pickle encrypted with `pickle_key`.
    #[must_use]
    pub fn serialize(&self, pickle_key: &[u8; 32]) -> String {
        self.session.serialize(pickle_key)
    }
}

impl Default for MegolmOutboundSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_then_active() {
        let mut session = MegolmOutboundSession::new();
        assert_eq!(session.status(), SessionStatus::Fresh);
        assert!(!session.should_rotate());

        let _ = session.encrypt("first");
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(session.message_count(), 1);
    }

    #[test]
    fn test_message_limit_is_inclusive() {
        let mut session = MegolmOutboundSession::with_limits(Duration::days(7), 3);
        let _ = session.encrypt("one");
        let _ = session.encrypt("two");
        assert_eq!(session.status(), SessionStatus::Active);

        let _ = session.encrypt("three");
        assert_eq!(session.status(), SessionStatus::NeedsRotation);
        assert!(session.should_rotate());
    }

    #[test]
    fn test_age_limit_is_inclusive() {
        let session = MegolmOutboundSession::from_parts(
            mx_crypto::megolm::GroupSession::new(),
            HashSet::new(),
            Duration::hours(1),
            100,
            Utc::now() - Duration::hours(1),
            1,
        );
        assert_eq!(session.status(), SessionStatus::NeedsRotation);
    }

    #[test]
    fn test_zero_message_limit_rotates_immediately() {
        let session = MegolmOutboundSession::with_limits(Duration::days(7), 0);
        assert_eq!(session.status(), SessionStatus::NeedsRotation);
    }

    #[test]
    fn test_shared_devices_grow_monotonically() {
        let mut session = MegolmOutboundSession::new();
        session.add_device("DEVICE_A");

        let batch: HashSet<String> = ["DEVICE_A", "DEVICE_B"]
            .iter()
            .map(ToString::to_string)
            .collect();
        session.add_devices(&batch);

        assert_eq!(session.devices.len(), 2);
        assert!(session.devices.contains("DEVICE_A"));
        assert!(session.devices.contains("DEVICE_B"));
    }

    #[test]
    fn test_session_key_ratchets_forward() {
        let mut session = MegolmOutboundSession::new();
        let before = session.session_key();
        let _ = session.encrypt("advance");
        assert_ne!(session.session_key(), before);
    }
}
