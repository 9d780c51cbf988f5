//! Client-side E2EE session and key-lifecycle management.
//!
//! Sits between a messaging client and the [`mx_crypto`] engine:
//! [`device::OlmDevice`] owns the local account and drives key upload,
//! replenishment and session establishment; [`store`] persists every
//! piece of ratchet state across restarts; [`cache`] holds the working
//! set in memory.

pub mod cache;
pub mod canonical;
pub mod device;
pub mod megolm_outbound;
pub mod store;

pub use cache::{DeviceKeyCache, DeviceKeys, InboundGroupCache, SessionCache};
pub use device::{
    verify_json, DeviceConfig, DeviceError, KeyCounts, KeyTransport, OlmDevice, TransportError,
};
pub use megolm_outbound::{MegolmOutboundSession, SessionStatus};
pub use store::{CryptoStore, NullStore, SqliteStore, StoreError};
