//! The local E2EE device.
//!
//! [`OlmDevice`] owns the Olm account and drives the key lifecycle:
//! publishing identity keys, keeping the server's one-time key pool
//! topped up, establishing pairwise Olm sessions and managing group
//! sessions per room. Persistence goes through a [`CryptoStore`], key
//! uploads through a [`KeyTransport`].

use std::collections::{HashMap, HashSet};
use std::error::Error as StdError;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use mx_crypto::megolm::MegolmInboundSession;
use mx_crypto::olm::{IdentityKeyPair, OlmAccount, OlmMessage};
use mx_crypto::types::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::cache::DeviceKeyCache;
use crate::canonical::map_to_canonical_json;
use crate::megolm_outbound::{default_max_age, MegolmOutboundSession, DEFAULT_MAX_MESSAGES};
use crate::store::CryptoStore;

/// Olm algorithm identifier for pairwise messages.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Megolm algorithm identifier for room messages.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Algorithms this device supports, in the order they are advertised.
pub const ALGORITHMS: [&str; 2] = [OLM_ALGORITHM, MEGOLM_ALGORITHM];

const SIGNED_CURVE25519: &str = "signed_curve25519";
const CURVE25519: &str = "curve25519";

/// One-time key counts per key flavor.
pub type KeyCounts = HashMap<String, u64>;

/// A failure reported by the key upload transport.
///
/// Opaque to this layer; it is carried through unmodified so the caller
/// can get at the underlying cause.
#[derive(Debug, Error)]
#[error("Transport failure: {0}")]
pub struct TransportError(#[from] pub Box<dyn StdError + Send + Sync>);

/// Server-side key publication interface.
pub trait KeyTransport {
    /// Publish identity keys and/or one-time keys, returning the
    /// server's current one-time key counts. Calling with neither
    /// argument only queries the counts.
    fn upload_keys(
        &self,
        device_keys: Option<&Value>,
        one_time_keys: Option<&Value>,
    ) -> std::result::Result<KeyCounts, TransportError>;
}

impl<T: KeyTransport + ?Sized> KeyTransport for &T {
    fn upload_keys(
        &self,
        device_keys: Option<&Value>,
        one_time_keys: Option<&Value>,
    ) -> std::result::Result<KeyCounts, TransportError> {
        (**self).upload_keys(device_keys, one_time_keys)
    }
}

/// Device-level errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] mx_crypto::CryptoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{name} must be between 0 and 1, got {value}")]
    InvalidProportion { name: &'static str, value: f64 },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No Olm session with key {0}")]
    SessionNotFound(String),

    #[error("No outbound group session for room {0}")]
    GroupSessionNotFound(String),

    #[error("No inbound group session {0}")]
    InboundGroupSessionNotFound(String),

    #[error("Outbound group session for room {0} has reached its limits and must be rotated")]
    NeedsRotation(String),
}

/// Device result type.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Tunables for key replenishment and group session rotation.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Fraction of one-time keys uploaded as signed keys, in `[0, 1]`.
    pub signed_keys_proportion: f64,
    /// Replenish a key flavor once the server count drops below this
    /// fraction of its target, in `[0, 1]`.
    pub keys_threshold: f64,
    /// Maximum age of an outbound group session.
    pub megolm_max_age: chrono::Duration,
    /// Maximum number of messages per outbound group session.
    pub megolm_max_messages: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            signed_keys_proportion: 1.0,
            keys_threshold: 0.1,
            megolm_max_age: default_max_age(),
            megolm_max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

/// The local device's E2EE state machine.
pub struct OlmDevice<S: CryptoStore, T: KeyTransport> {
    store: S,
    transport: T,
    user_id: String,
    device_id: String,
    account: OlmAccount,
    /// How many one-time keys of each flavor the server should hold.
    target_counts: KeyCounts,
    /// Latest counts reported by the server; empty means unknown.
    server_counts: KeyCounts,
    device_keys: DeviceKeyCache,
    config: DeviceConfig,
}

impl<S: CryptoStore, T: KeyTransport> OlmDevice<S, T> {
    /// Load the device's account from the store, or create and persist
    /// a fresh one on first use.
    pub fn new(
        store: S,
        transport: T,
        user_id: &str,
        device_id: &str,
        config: DeviceConfig,
    ) -> Result<Self> {
        for (name, value) in [
            ("signed_keys_proportion", config.signed_keys_proportion),
            ("keys_threshold", config.keys_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DeviceError::InvalidProportion { name, value });
            }
        }

        let account = match store.get_account()? {
            Some(account) => account,
            None => {
                let account = OlmAccount::new();
                store.save_account(&account)?;
                info!(user_id, device_id, "Created a new Olm account");
                account
            }
        };

        // Keep half of the engine's capacity on the server, split
        // between the two flavors by the configured proportion.
        let capacity = account.max_one_time_keys() as f64 / 2.0;
        let signed_target = (config.signed_keys_proportion * capacity).round() as u64;
        let unsigned_target = ((1.0 - config.signed_keys_proportion) * capacity).round() as u64;
        let mut target_counts = KeyCounts::new();
        if signed_target > 0 {
            target_counts.insert(SIGNED_CURVE25519.to_string(), signed_target);
        }
        if unsigned_target > 0 {
            target_counts.insert(CURVE25519.to_string(), unsigned_target);
        }

        let device_keys = store.load_device_keys()?;

        Ok(Self {
            store,
            transport,
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            account,
            target_counts,
            server_counts: KeyCounts::new(),
            device_keys,
            config,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Public identity keys of this device.
    #[must_use]
    pub fn identity_keys(&self) -> IdentityKeyPair {
        self.account.identity_keys()
    }

    #[must_use]
    pub fn target_counts(&self) -> &KeyCounts {
        &self.target_counts
    }

    #[must_use]
    pub fn max_one_time_keys(&self) -> usize {
        self.account.max_one_time_keys()
    }

    /// Known identity keys of remote devices.
    #[must_use]
    pub fn device_keys(&self) -> &DeviceKeyCache {
        &self.device_keys
    }

    /// Record freshly fetched device keys, both in memory and in the
    /// store.
    pub fn add_device_keys(&mut self, keys: DeviceKeyCache) -> Result<()> {
        self.store.save_device_keys(&keys)?;
        self.device_keys.merge(keys);
        Ok(())
    }

    /// Sign a JSON object with this device's Ed25519 key.
    ///
    /// The signature covers the canonical form of the payload without
    /// its `signatures` and `unsigned` members. Both are carried over
    /// into the result, with this device's signature added under
    /// `signatures.<user_id>.ed25519:<device_id>`; signatures from
    /// other parties are preserved.
    #[must_use]
    pub fn sign_json(&self, payload: &Map<String, Value>) -> Map<String, Value> {
        let mut signed = payload.clone();
        let signatures = signed.remove("signatures");
        let unsigned = signed.remove("unsigned");

        let signature = self.account.sign(&map_to_canonical_json(&signed));

        let mut signatures = match signatures {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let user_entry = signatures
            .entry(self.user_id.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(user_signatures) = user_entry {
            user_signatures.insert(
                format!("ed25519:{}", self.device_id),
                Value::String(signature),
            );
        }
        signed.insert("signatures".to_string(), Value::Object(signatures));
        if let Some(unsigned) = unsigned {
            signed.insert("unsigned".to_string(), unsigned);
        }
        signed
    }

    /// Publish this device's identity keys.
    pub fn upload_identity_keys(&mut self) -> Result<()> {
        let identity = self.account.identity_keys();
        let mut keys = Map::new();
        keys.insert(
            format!("ed25519:{}", self.device_id),
            Value::String(identity.ed25519),
        );
        keys.insert(
            format!("curve25519:{}", self.device_id),
            Value::String(identity.curve25519),
        );

        let mut payload = Map::new();
        payload.insert("user_id".to_string(), Value::String(self.user_id.clone()));
        payload.insert(
            "device_id".to_string(),
            Value::String(self.device_id.clone()),
        );
        payload.insert("algorithms".to_string(), json!(ALGORITHMS));
        payload.insert("keys".to_string(), Value::Object(keys));
        let signed = self.sign_json(&payload);

        self.server_counts = self
            .transport
            .upload_keys(Some(&Value::Object(signed)), None)?;
        info!(user_id = %self.user_id, device_id = %self.device_id, "Uploaded identity keys");
        Ok(())
    }

    /// Top up the server's one-time key pool to the target counts.
    ///
    /// Queries the current counts first when they are unknown or
    /// `force_update` is set. Returns how many keys of each flavor were
    /// uploaded; empty when the pool was already full.
    pub fn upload_one_time_keys(&mut self, force_update: bool) -> Result<KeyCounts> {
        if force_update || self.server_counts.is_empty() {
            self.server_counts = self.transport.upload_keys(None, None)?;
        }

        let missing_of = |flavor: &str, targets: &KeyCounts, server: &KeyCounts| {
            let target = targets.get(flavor).copied().unwrap_or(0);
            target.saturating_sub(server.get(flavor).copied().unwrap_or(0))
        };
        let signed_missing = missing_of(SIGNED_CURVE25519, &self.target_counts, &self.server_counts);
        let unsigned_missing = missing_of(CURVE25519, &self.target_counts, &self.server_counts);
        if signed_missing == 0 && unsigned_missing == 0 {
            return Ok(KeyCounts::new());
        }

        self.account
            .generate_one_time_keys((signed_missing + unsigned_missing) as usize);

        // Key ids sort in generation order, so the first `signed_missing`
        // keys become the signed flavor.
        let mut one_time_keys = Map::new();
        for (i, (key_id, key)) in self.account.one_time_keys().into_iter().enumerate() {
            if (i as u64) < signed_missing {
                let mut key_payload = Map::new();
                key_payload.insert("key".to_string(), Value::String(key));
                one_time_keys.insert(
                    format!("{SIGNED_CURVE25519}:{key_id}"),
                    Value::Object(self.sign_json(&key_payload)),
                );
            } else {
                one_time_keys.insert(format!("{CURVE25519}:{key_id}"), Value::String(key));
            }
        }

        self.server_counts = self
            .transport
            .upload_keys(None, Some(&Value::Object(one_time_keys)))?;

        // The keys are on the server now; retire them locally and
        // persist the account so they are never offered again.
        self.account.mark_keys_as_published();
        self.store.save_account(&self.account)?;

        let mut uploaded = KeyCounts::new();
        if signed_missing > 0 {
            uploaded.insert(SIGNED_CURVE25519.to_string(), signed_missing);
        }
        if unsigned_missing > 0 {
            uploaded.insert(CURVE25519.to_string(), unsigned_missing);
        }
        info!(?uploaded, "Uploaded one-time keys");
        Ok(uploaded)
    }

    /// Take note of the one-time key counts reported by the server and
    /// replenish if a flavor dropped below its threshold.
    pub fn update_one_time_key_counts(&mut self, counts: &KeyCounts) -> Result<KeyCounts> {
        self.server_counts = counts.clone();
        if self.should_upload_one_time_keys() {
            self.upload_one_time_keys(false)
        } else {
            Ok(KeyCounts::new())
        }
    }

    fn should_upload_one_time_keys(&self) -> bool {
        if self.server_counts.is_empty() {
            return true;
        }
        self.target_counts.iter().any(|(flavor, target)| {
            let have = self.server_counts.get(flavor).copied().unwrap_or(0);
            (have as f64) < (*target as f64) * self.config.keys_threshold
        })
    }

    /// Establish an outbound Olm session with a remote device from its
    /// identity key and a claimed one-time key. Returns the session id.
    pub fn start_olm_session(
        &mut self,
        identity_key: &str,
        one_time_key: &str,
    ) -> Result<String> {
        let identity = parse_curve_key(identity_key)?;
        let one_time = parse_curve_key(one_time_key)?;
        let session = self.account.create_outbound_session(identity, one_time);
        let session_id = session.session_id();
        self.store.save_olm_session(identity_key, &session)?;
        debug!(session_id = %session_id, "Started outbound Olm session");
        Ok(session_id)
    }

    /// Encrypt a pairwise message for the device behind `identity_key`,
    /// using the newest session with it.
    pub fn olm_encrypt(&mut self, identity_key: &str, plaintext: &str) -> Result<OlmMessage> {
        let mut sessions = self
            .store
            .get_olm_sessions(identity_key)?
            .ok_or_else(|| DeviceError::SessionNotFound(identity_key.to_string()))?;
        let Some(session) = sessions.last_mut() else {
            return Err(DeviceError::SessionNotFound(identity_key.to_string()));
        };
        let message = session.encrypt(plaintext);
        self.store.save_olm_session(identity_key, session)?;
        Ok(message)
    }

    /// Decrypt a pairwise message from the device behind `sender_key`.
    ///
    /// Tries known sessions newest first. A pre-key message that no
    /// session accepts establishes a new inbound session, consuming one
    /// of our one-time keys.
    pub fn olm_decrypt(&mut self, sender_key: &str, message: &OlmMessage) -> Result<String> {
        if let Some(mut sessions) = self.store.get_olm_sessions(sender_key)? {
            for session in sessions.iter_mut().rev() {
                if let Ok(plaintext) = session.decrypt(message) {
                    self.store.save_olm_session(sender_key, session)?;
                    return Ok(plaintext);
                }
            }
        }

        if matches!(message, OlmMessage::PreKey(_)) {
            let identity = parse_curve_key(sender_key)?;
            let (session, plaintext) = self.account.create_inbound_session(identity, message)?;
            // The one-time key the sender claimed is consumed.
            self.store.save_account(&self.account)?;
            self.store.save_olm_session(sender_key, &session)?;
            debug!(session_id = %session.session_id(), "Established inbound Olm session");
            return Ok(plaintext);
        }

        Err(DeviceError::SessionNotFound(sender_key.to_string()))
    }

    /// Make sure the room has a usable outbound group session.
    ///
    /// Creates one if absent and replaces one past its limits. Returns
    /// the new session key when a session was created, so the caller
    /// can share it with the room's devices; `None` when the existing
    /// session is still usable.
    pub fn megolm_ensure_outbound_session(&mut self, room_id: &str) -> Result<Option<String>> {
        if let Some(session) = self.store.get_outbound_session(room_id)? {
            if !session.should_rotate() {
                return Ok(None);
            }
            self.store.remove_outbound_session(room_id)?;
            debug!(room_id, "Rotating outbound group session");
        }

        let session = MegolmOutboundSession::with_limits(
            self.config.megolm_max_age,
            self.config.megolm_max_messages,
        );
        let session_key = session.session_key();
        self.store.save_outbound_session(room_id, &session)?;
        debug!(room_id, session_id = %session.session_id(), "Created outbound group session");
        Ok(Some(session_key))
    }

    /// Record the devices the room's current session key was shared
    /// with.
    pub fn megolm_share_devices(&mut self, room_id: &str, devices: &HashSet<String>) -> Result<()> {
        if self.store.get_outbound_session(room_id)?.is_none() {
            return Err(DeviceError::GroupSessionNotFound(room_id.to_string()));
        }
        self.store.save_outbound_session_devices(room_id, devices)?;
        Ok(())
    }

    /// Encrypt a room message with the room's outbound group session.
    pub fn megolm_encrypt(&mut self, room_id: &str, plaintext: &str) -> Result<String> {
        let mut session = self
            .store
            .get_outbound_session(room_id)?
            .ok_or_else(|| DeviceError::GroupSessionNotFound(room_id.to_string()))?;
        if session.should_rotate() {
            return Err(DeviceError::NeedsRotation(room_id.to_string()));
        }
        let ciphertext = session.encrypt(plaintext);
        self.store.save_outbound_session(room_id, &session)?;
        Ok(ciphertext)
    }

    /// Add an inbound group session from a session key received over a
    /// pairwise channel. Returns `false` if the session was already
    /// known.
    pub fn megolm_add_inbound_session(
        &mut self,
        room_id: &str,
        sender_key: &str,
        session_key: &str,
    ) -> Result<bool> {
        let session = MegolmInboundSession::new(session_key)?;
        if self.store.get_inbound_session(&session.session_id())?.is_some() {
            return Ok(false);
        }
        self.store
            .save_inbound_session(room_id, sender_key, &session)?;
        Ok(true)
    }

    /// Decrypt a room message, returning the plaintext and its ratchet
    /// index.
    pub fn megolm_decrypt(
        &mut self,
        room_id: &str,
        sender_key: &str,
        session_id: &str,
        ciphertext: &str,
    ) -> Result<(String, u32)> {
        let mut session = self
            .store
            .get_inbound_session(session_id)?
            .ok_or_else(|| DeviceError::InboundGroupSessionNotFound(session_id.to_string()))?;
        let decrypted = session.decrypt(ciphertext)?;
        self.store
            .save_inbound_session(room_id, sender_key, &session)?;
        Ok(decrypted)
    }
}

/// Check a JSON object's signature against a known Ed25519 key.
///
/// Never errors: a missing signature, a malformed key and a failed
/// check all come back as `false`. The payload is not modified.
#[must_use]
pub fn verify_json(
    payload: &Map<String, Value>,
    signing_key: &str,
    user_id: &str,
    device_id: &str,
) -> bool {
    let Some(Value::Object(signatures)) = payload.get("signatures") else {
        return false;
    };
    let Some(Value::Object(user_signatures)) = signatures.get(user_id) else {
        return false;
    };
    let Some(Value::String(signature)) = user_signatures.get(&format!("ed25519:{device_id}"))
    else {
        return false;
    };
    let Ok(key) = Ed25519PublicKey::from_base64(signing_key) else {
        return false;
    };
    let Ok(signature) = Ed25519Signature::from_base64(signature) else {
        return false;
    };

    let mut to_verify = payload.clone();
    to_verify.remove("signatures");
    to_verify.remove("unsigned");
    let canonical = map_to_canonical_json(&to_verify);
    key.verify(canonical.as_bytes(), &signature).is_ok()
}

fn parse_curve_key(key: &str) -> Result<Curve25519PublicKey> {
    Curve25519PublicKey::from_base64(key).map_err(|e| DeviceError::InvalidKey(e.to_string()))
}
