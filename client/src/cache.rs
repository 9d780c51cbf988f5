//! In-memory working set of sessions and device keys.
//!
//! These caches are the hot path between the store and the device
//! manager: loaded once at startup, then kept in sync with the store as
//! sessions are created and advanced.

use std::collections::HashMap;

use mx_crypto::megolm::MegolmInboundSession;
use mx_crypto::olm::OlmSession;

/// Public identity keys of one remote device, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKeys {
    /// Ed25519 fingerprint key.
    pub ed25519: String,
    /// Curve25519 session-establishment key.
    pub curve25519: String,
}

/// Known identity keys, indexed by user id then device id.
#[derive(Debug, Default)]
pub struct DeviceKeyCache {
    keys: HashMap<String, HashMap<String, DeviceKeys>>,
}

impl DeviceKeyCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user_id: &str, device_id: &str, keys: DeviceKeys) {
        self.keys
            .entry(user_id.to_string())
            .or_default()
            .insert(device_id.to_string(), keys);
    }

    #[must_use]
    pub fn get(&self, user_id: &str, device_id: &str) -> Option<&DeviceKeys> {
        self.keys.get(user_id)?.get(device_id)
    }

    /// All known devices of one user.
    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<&HashMap<String, DeviceKeys>> {
        self.keys.get(user_id)
    }

    /// Merge another cache into this one, device by device.
    ///
    /// Existing devices are overwritten with the incoming keys, devices
    /// absent from `other` are kept.
    pub fn merge(&mut self, other: DeviceKeyCache) {
        for (user_id, devices) in other.keys {
            self.keys.entry(user_id).or_default().extend(devices);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HashMap<String, DeviceKeys>)> {
        self.keys.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Olm sessions indexed by the peer's Curve25519 identity key.
///
/// Several sessions can coexist with the same peer (both sides may
/// start one concurrently). They are kept oldest first; the newest is
/// preferred for encryption.
#[derive(Default)]
pub struct SessionCache {
    sessions: HashMap<String, Vec<OlmSession>>,
}

impl SessionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, curve_key: &str, session: OlmSession) {
        self.sessions
            .entry(curve_key.to_string())
            .or_default()
            .push(session);
    }

    /// Append a batch of sessions for one peer, keeping existing ones.
    pub fn extend(&mut self, curve_key: &str, sessions: Vec<OlmSession>) {
        self.sessions
            .entry(curve_key.to_string())
            .or_default()
            .extend(sessions);
    }

    #[must_use]
    pub fn get(&self, curve_key: &str) -> Option<&Vec<OlmSession>> {
        self.sessions.get(curve_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<OlmSession>)> {
        self.sessions.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Inbound group sessions indexed by room id, sender key and session id.
#[derive(Default)]
pub struct InboundGroupCache {
    sessions: HashMap<String, HashMap<String, HashMap<String, MegolmInboundSession>>>,
}

impl InboundGroupCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, room_id: &str, sender_key: &str, session: MegolmInboundSession) {
        self.sessions
            .entry(room_id.to_string())
            .or_default()
            .entry(sender_key.to_string())
            .or_default()
            .insert(session.session_id(), session);
    }

    #[must_use]
    pub fn get(
        &self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
    ) -> Option<&MegolmInboundSession> {
        self.sessions.get(room_id)?.get(sender_key)?.get(session_id)
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (&String, &HashMap<String, HashMap<String, MegolmInboundSession>>)>
    {
        self.sessions.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
