//! Persistent storage for E2EE state.
//!
//! Everything a device must survive a restart with lives here: the Olm
//! account, pairwise sessions, group sessions in both directions, known
//! device keys and the set of tracked users. Ratchet state is stored as
//! pickles encrypted with the store's pickle key, so the database never
//! holds raw key material.
//!
//! All rows are scoped by the local `device_id` and hang off the
//! `accounts` table via `ON DELETE CASCADE`, so [`CryptoStore::remove_account`]
//! wipes the device's entire E2EE state in one statement.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use mx_crypto::megolm::{GroupSession, MegolmInboundSession};
use mx_crypto::olm::{OlmAccount, OlmSession};

use crate::cache::{DeviceKeyCache, DeviceKeys, InboundGroupCache, SessionCache};
use crate::megolm_outbound::MegolmOutboundSession;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored pickle could not be decoded. The row exists but is
    /// unreadable, which is a hard error rather than "not found".
    #[error("Crypto error: {0}")]
    Crypto(#[from] mx_crypto::CryptoError),

    #[error("Corrupted store: {0}")]
    Corrupted(String),
}

/// Store result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence interface for E2EE state.
///
/// Lookups for absent rows return `Ok(None)` (or an empty collection);
/// errors are reserved for rows that exist but cannot be read back.
pub trait CryptoStore {
    fn save_account(&self, account: &OlmAccount) -> Result<()>;
    fn get_account(&self) -> Result<Option<OlmAccount>>;
    /// Delete the account and, through cascading, every other row of
    /// this device.
    fn remove_account(&self) -> Result<()>;

    fn save_olm_session(&self, curve_key: &str, session: &OlmSession) -> Result<()>;
    fn save_olm_sessions(&self, sessions: &SessionCache) -> Result<()>;
    /// Sessions with one peer, oldest first. `None` when there are none.
    fn get_olm_sessions(&self, curve_key: &str) -> Result<Option<Vec<OlmSession>>>;
    fn load_olm_sessions(&self) -> Result<SessionCache>;

    fn save_inbound_session(
        &self,
        room_id: &str,
        sender_key: &str,
        session: &MegolmInboundSession,
    ) -> Result<()>;
    fn save_inbound_sessions(&self, sessions: &InboundGroupCache) -> Result<()>;
    /// Look up an inbound session by its globally unique id. The room
    /// and sender key are write-side metadata only.
    fn get_inbound_session(&self, session_id: &str) -> Result<Option<MegolmInboundSession>>;
    fn load_inbound_sessions(&self) -> Result<InboundGroupCache>;

    fn save_outbound_session(&self, room_id: &str, session: &MegolmOutboundSession) -> Result<()>;
    fn get_outbound_session(&self, room_id: &str) -> Result<Option<MegolmOutboundSession>>;
    fn load_outbound_sessions(&self) -> Result<HashMap<String, MegolmOutboundSession>>;
    fn remove_outbound_session(&self, room_id: &str) -> Result<()>;
    /// Record additional devices the room's session key was shared
    /// with. Additive; existing rows are kept.
    fn save_outbound_session_devices(&self, room_id: &str, devices: &HashSet<String>)
        -> Result<()>;

    fn save_device_keys(&self, keys: &DeviceKeyCache) -> Result<()>;
    /// Fetch keys for specific devices. An empty device list means
    /// every known device of that user.
    fn get_device_keys(&self, query: &HashMap<String, Vec<String>>) -> Result<DeviceKeyCache>;
    fn load_device_keys(&self) -> Result<DeviceKeyCache>;

    fn save_tracked_users(&self, user_ids: &[String]) -> Result<()>;
    fn remove_tracked_users(&self, user_ids: &[String]) -> Result<()>;
    fn load_tracked_users(&self) -> Result<HashSet<String>>;

    fn save_sync_token(&self, token: &str) -> Result<()>;
    fn get_sync_token(&self) -> Result<Option<String>>;
}

/// SQLite-backed store.
///
/// Wraps a single connection. `Connection` is `Send` but not `Sync`,
/// so each worker opens its own handle against the same database file
/// instead of sharing one.
pub struct SqliteStore {
    conn: Connection,
    device_id: String,
    pickle_key: Zeroizing<[u8; 32]>,
}

impl SqliteStore {
    /// Open (and if necessary create) the database at `path`, scoped to
    /// `device_id`.
    pub fn open(path: impl AsRef<Path>, device_id: &str, pickle_key: [u8; 32]) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            device_id: device_id.to_string(),
            pickle_key: Zeroizing::new(pickle_key),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store, mainly for tests.
    pub fn open_in_memory(device_id: &str, pickle_key: [u8; 32]) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn,
            device_id: device_id.to_string(),
            pickle_key: Zeroizing::new(pickle_key),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA foreign_keys = ON;

             CREATE TABLE IF NOT EXISTS accounts (
                 device_id TEXT PRIMARY KEY NOT NULL,
                 account TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS olm_sessions (
                 device_id TEXT NOT NULL,
                 session_id TEXT PRIMARY KEY NOT NULL,
                 curve_key TEXT NOT NULL,
                 session TEXT NOT NULL,
                 FOREIGN KEY (device_id) REFERENCES accounts (device_id)
                     ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS megolm_inbound_sessions (
                 device_id TEXT NOT NULL,
                 session_id TEXT PRIMARY KEY NOT NULL,
                 room_id TEXT NOT NULL,
                 curve_key TEXT NOT NULL,
                 session TEXT NOT NULL,
                 FOREIGN KEY (device_id) REFERENCES accounts (device_id)
                     ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS megolm_outbound_sessions (
                 device_id TEXT NOT NULL,
                 room_id TEXT NOT NULL,
                 session TEXT NOT NULL,
                 max_age_s INTEGER NOT NULL,
                 max_messages INTEGER NOT NULL,
                 creation_time INTEGER NOT NULL,
                 message_count INTEGER NOT NULL,
                 PRIMARY KEY (device_id, room_id),
                 FOREIGN KEY (device_id) REFERENCES accounts (device_id)
                     ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS megolm_outbound_devices (
                 device_id TEXT NOT NULL,
                 room_id TEXT NOT NULL,
                 user_device_id TEXT NOT NULL,
                 UNIQUE (device_id, room_id, user_device_id),
                 FOREIGN KEY (device_id, room_id)
                     REFERENCES megolm_outbound_sessions (device_id, room_id)
                     ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS device_keys (
                 device_id TEXT NOT NULL,
                 user_id TEXT NOT NULL,
                 user_device_id TEXT NOT NULL,
                 ed_key TEXT NOT NULL,
                 curve_key TEXT NOT NULL,
                 PRIMARY KEY (device_id, user_id, user_device_id),
                 FOREIGN KEY (device_id) REFERENCES accounts (device_id)
                     ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS tracked_users (
                 device_id TEXT NOT NULL,
                 user_id TEXT NOT NULL,
                 UNIQUE (device_id, user_id),
                 FOREIGN KEY (device_id) REFERENCES accounts (device_id)
                     ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS sync_tokens (
                 device_id TEXT PRIMARY KEY NOT NULL,
                 token TEXT NOT NULL,
                 FOREIGN KEY (device_id) REFERENCES accounts (device_id)
                     ON DELETE CASCADE
             );",
        )?;
        debug!(device_id = %self.device_id, "Crypto store ready");
        Ok(())
    }

    fn outbound_devices(&self, room_id: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_device_id FROM megolm_outbound_devices
             WHERE device_id = ?1 AND room_id = ?2",
        )?;
        let rows = stmt.query_map(params![self.device_id, room_id], |row| row.get(0))?;
        let mut devices = HashSet::new();
        for row in rows {
            devices.insert(row?);
        }
        Ok(devices)
    }

    fn outbound_from_row(
        &self,
        pickle: &str,
        max_age_s: i64,
        max_messages: i64,
        creation_time: i64,
        message_count: i64,
        devices: HashSet<String>,
    ) -> Result<MegolmOutboundSession> {
        let session = GroupSession::deserialize(pickle, &self.pickle_key)?;
        let creation_time = DateTime::<Utc>::from_timestamp(creation_time, 0)
            .ok_or_else(|| StoreError::Corrupted("invalid creation time".to_string()))?;
        let max_messages = u64::try_from(max_messages)
            .map_err(|_| StoreError::Corrupted("negative message limit".to_string()))?;
        let message_count = u64::try_from(message_count)
            .map_err(|_| StoreError::Corrupted("negative message count".to_string()))?;
        Ok(MegolmOutboundSession::from_parts(
            session,
            devices,
            Duration::seconds(max_age_s),
            max_messages,
            creation_time,
            message_count,
        ))
    }
}

impl CryptoStore for SqliteStore {
    fn save_account(&self, account: &OlmAccount) -> Result<()> {
        let pickle = account.serialize(&self.pickle_key);
        self.conn.execute(
            "INSERT OR IGNORE INTO accounts (device_id, account) VALUES (?1, ?2)",
            params![self.device_id, pickle],
        )?;
        self.conn.execute(
            "UPDATE accounts SET account = ?2 WHERE device_id = ?1",
            params![self.device_id, pickle],
        )?;
        Ok(())
    }

    fn get_account(&self) -> Result<Option<OlmAccount>> {
        let pickle: Option<String> = self
            .conn
            .query_row(
                "SELECT account FROM accounts WHERE device_id = ?1",
                params![self.device_id],
                |row| row.get(0),
            )
            .optional()?;
        match pickle {
            Some(pickle) => Ok(Some(OlmAccount::deserialize(&pickle, &self.pickle_key)?)),
            None => Ok(None),
        }
    }

    fn remove_account(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM accounts WHERE device_id = ?1",
            params![self.device_id],
        )?;
        debug!(device_id = %self.device_id, "Removed account and all dependent state");
        Ok(())
    }

    fn save_olm_session(&self, curve_key: &str, session: &OlmSession) -> Result<()> {
        let pickle = session.serialize(&self.pickle_key);
        self.conn.execute(
            "REPLACE INTO olm_sessions (device_id, session_id, curve_key, session)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.device_id, session.session_id(), curve_key, pickle],
        )?;
        Ok(())
    }

    fn save_olm_sessions(&self, sessions: &SessionCache) -> Result<()> {
        for (curve_key, peer_sessions) in sessions.iter() {
            for session in peer_sessions {
                self.save_olm_session(curve_key, session)?;
            }
        }
        Ok(())
    }

    fn get_olm_sessions(&self, curve_key: &str) -> Result<Option<Vec<OlmSession>>> {
        let mut stmt = self.conn.prepare(
            "SELECT session FROM olm_sessions
             WHERE device_id = ?1 AND curve_key = ?2 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![self.device_id, curve_key], |row| {
            row.get::<_, String>(0)
        })?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(OlmSession::deserialize(&row?, &self.pickle_key)?);
        }
        if sessions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(sessions))
        }
    }

    fn load_olm_sessions(&self) -> Result<SessionCache> {
        let mut stmt = self.conn.prepare(
            "SELECT curve_key, session FROM olm_sessions
             WHERE device_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![self.device_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut cache = SessionCache::new();
        for row in rows {
            let (curve_key, pickle) = row?;
            cache.add(&curve_key, OlmSession::deserialize(&pickle, &self.pickle_key)?);
        }
        Ok(cache)
    }

    fn save_inbound_session(
        &self,
        room_id: &str,
        sender_key: &str,
        session: &MegolmInboundSession,
    ) -> Result<()> {
        let pickle = session.serialize(&self.pickle_key);
        self.conn.execute(
            "REPLACE INTO megolm_inbound_sessions
             (device_id, session_id, room_id, curve_key, session)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.device_id,
                session.session_id(),
                room_id,
                sender_key,
                pickle
            ],
        )?;
        Ok(())
    }

    fn save_inbound_sessions(&self, sessions: &InboundGroupCache) -> Result<()> {
        for (room_id, senders) in sessions.iter() {
            for (sender_key, room_sessions) in senders {
                for session in room_sessions.values() {
                    self.save_inbound_session(room_id, sender_key, session)?;
                }
            }
        }
        Ok(())
    }

    fn get_inbound_session(&self, session_id: &str) -> Result<Option<MegolmInboundSession>> {
        let pickle: Option<String> = self
            .conn
            .query_row(
                "SELECT session FROM megolm_inbound_sessions
                 WHERE device_id = ?1 AND session_id = ?2",
                params![self.device_id, session_id],
                |row| row.get(0),
            )
            .optional()?;
        match pickle {
            Some(pickle) => Ok(Some(MegolmInboundSession::deserialize(
                &pickle,
                &self.pickle_key,
            )?)),
            None => Ok(None),
        }
    }

    fn load_inbound_sessions(&self) -> Result<InboundGroupCache> {
        let mut stmt = self.conn.prepare(
            "SELECT room_id, curve_key, session FROM megolm_inbound_sessions
             WHERE device_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut cache = InboundGroupCache::new();
        for row in rows {
            let (room_id, sender_key, pickle) = row?;
            let session = MegolmInboundSession::deserialize(&pickle, &self.pickle_key)?;
            cache.insert(&room_id, &sender_key, session);
        }
        Ok(cache)
    }

    fn save_outbound_session(&self, room_id: &str, session: &MegolmOutboundSession) -> Result<()> {
        let pickle = session.serialize(&self.pickle_key);
        self.conn.execute(
            "INSERT OR IGNORE INTO megolm_outbound_sessions
             (device_id, room_id, session, max_age_s, max_messages, creation_time, message_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.device_id,
                room_id,
                pickle,
                session.max_age().num_seconds(),
                session.max_messages() as i64,
                session.creation_time().timestamp(),
                session.message_count() as i64,
            ],
        )?;
        // Limits and creation time are immutable for the lifetime of a
        // session, only the ratchet and the message count advance.
        self.conn.execute(
            "UPDATE megolm_outbound_sessions SET session = ?3, message_count = ?4
             WHERE device_id = ?1 AND room_id = ?2",
            params![
                self.device_id,
                room_id,
                pickle,
                session.message_count() as i64
            ],
        )?;
        Ok(())
    }

    fn get_outbound_session(&self, room_id: &str) -> Result<Option<MegolmOutboundSession>> {
        let row: Option<(String, i64, i64, i64, i64)> = self
            .conn
            .query_row(
                "SELECT session, max_age_s, max_messages, creation_time, message_count
                 FROM megolm_outbound_sessions WHERE device_id = ?1 AND room_id = ?2",
                params![self.device_id, room_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((pickle, max_age_s, max_messages, creation_time, message_count)) = row else {
            return Ok(None);
        };
        let devices = self.outbound_devices(room_id)?;
        Ok(Some(self.outbound_from_row(
            &pickle,
            max_age_s,
            max_messages,
            creation_time,
            message_count,
            devices,
        )?))
    }

    fn load_outbound_sessions(&self) -> Result<HashMap<String, MegolmOutboundSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT room_id, session, max_age_s, max_messages, creation_time, message_count
             FROM megolm_outbound_sessions WHERE device_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut sessions = HashMap::new();
        for row in rows {
            let (room_id, pickle, max_age_s, max_messages, creation_time, message_count) = row?;
            let devices = self.outbound_devices(&room_id)?;
            let session = self.outbound_from_row(
                &pickle,
                max_age_s,
                max_messages,
                creation_time,
                message_count,
                devices,
            )?;
            sessions.insert(room_id, session);
        }
        Ok(sessions)
    }

    fn remove_outbound_session(&self, room_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM megolm_outbound_sessions WHERE device_id = ?1 AND room_id = ?2",
            params![self.device_id, room_id],
        )?;
        Ok(())
    }

    fn save_outbound_session_devices(
        &self,
        room_id: &str,
        devices: &HashSet<String>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO megolm_outbound_devices
             (device_id, room_id, user_device_id) VALUES (?1, ?2, ?3)",
        )?;
        for device in devices {
            stmt.execute(params![self.device_id, room_id, device])?;
        }
        Ok(())
    }

    fn save_device_keys(&self, keys: &DeviceKeyCache) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "REPLACE INTO device_keys (device_id, user_id, user_device_id, ed_key, curve_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (user_id, devices) in keys.iter() {
            for (user_device_id, device_keys) in devices {
                stmt.execute(params![
                    self.device_id,
                    user_id,
                    user_device_id,
                    device_keys.ed25519,
                    device_keys.curve25519,
                ])?;
            }
        }
        Ok(())
    }

    fn get_device_keys(&self, query: &HashMap<String, Vec<String>>) -> Result<DeviceKeyCache> {
        let mut cache = DeviceKeyCache::new();
        let mut all_stmt = self.conn.prepare(
            "SELECT user_device_id, ed_key, curve_key FROM device_keys
             WHERE device_id = ?1 AND user_id = ?2",
        )?;
        let mut one_stmt = self.conn.prepare(
            "SELECT ed_key, curve_key FROM device_keys
             WHERE device_id = ?1 AND user_id = ?2 AND user_device_id = ?3",
        )?;
        for (user_id, devices) in query {
            if devices.is_empty() {
                let rows = all_stmt.query_map(params![self.device_id, user_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                for row in rows {
                    let (user_device_id, ed25519, curve25519) = row?;
                    cache.insert(user_id, &user_device_id, DeviceKeys { ed25519, curve25519 });
                }
            } else {
                for user_device_id in devices {
                    let row: Option<(String, String)> = one_stmt
                        .query_row(params![self.device_id, user_id, user_device_id], |row| {
                            Ok((row.get(0)?, row.get(1)?))
                        })
                        .optional()?;
                    if let Some((ed25519, curve25519)) = row {
                        cache.insert(user_id, user_device_id, DeviceKeys { ed25519, curve25519 });
                    }
                }
            }
        }
        Ok(cache)
    }

    fn load_device_keys(&self) -> Result<DeviceKeyCache> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, user_device_id, ed_key, curve_key FROM device_keys
             WHERE device_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.device_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut cache = DeviceKeyCache::new();
        for row in rows {
            let (user_id, user_device_id, ed25519, curve25519) = row?;
            cache.insert(&user_id, &user_device_id, DeviceKeys { ed25519, curve25519 });
        }
        Ok(cache)
    }

    fn save_tracked_users(&self, user_ids: &[String]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO tracked_users (device_id, user_id) VALUES (?1, ?2)",
        )?;
        for user_id in user_ids {
            stmt.execute(params![self.device_id, user_id])?;
        }
        Ok(())
    }

    fn remove_tracked_users(&self, user_ids: &[String]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("DELETE FROM tracked_users WHERE device_id = ?1 AND user_id = ?2")?;
        for user_id in user_ids {
            stmt.execute(params![self.device_id, user_id])?;
        }
        Ok(())
    }

    fn load_tracked_users(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM tracked_users WHERE device_id = ?1")?;
        let rows = stmt.query_map(params![self.device_id], |row| row.get(0))?;
        let mut users = HashSet::new();
        for row in rows {
            users.insert(row?);
        }
        Ok(users)
    }

    fn save_sync_token(&self, token: &str) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO sync_tokens (device_id, token) VALUES (?1, ?2)",
            params![self.device_id, token],
        )?;
        Ok(())
    }

    fn get_sync_token(&self) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT token FROM sync_tokens WHERE device_id = ?1",
                params![self.device_id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

/// A store that persists nothing.
///
/// For ephemeral devices that should leave no trace: every save
/// succeeds and is discarded, every lookup comes back empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl CryptoStore for NullStore {
    fn save_account(&self, _account: &OlmAccount) -> Result<()> {
        Ok(())
    }
    fn get_account(&self) -> Result<Option<OlmAccount>> {
        Ok(None)
    }
    fn remove_account(&self) -> Result<()> {
        Ok(())
    }

    fn save_olm_session(&self, _curve_key: &str, _session: &OlmSession) -> Result<()> {
        Ok(())
    }
    fn save_olm_sessions(&self, _sessions: &SessionCache) -> Result<()> {
        Ok(())
    }
    fn get_olm_sessions(&self, _curve_key: &str) -> Result<Option<Vec<OlmSession>>> {
        Ok(None)
    }
    fn load_olm_sessions(&self) -> Result<SessionCache> {
        Ok(SessionCache::new())
    }

    fn save_inbound_session(
        &self,
        _room_id: &str,
        _sender_key: &str,
        _session: &MegolmInboundSession,
    ) -> Result<()> {
        Ok(())
    }
    fn save_inbound_sessions(&self, _sessions: &InboundGroupCache) -> Result<()> {
        Ok(())
    }
    fn get_inbound_session(&self, _session_id: &str) -> Result<Option<MegolmInboundSession>> {
        Ok(None)
    }
    fn load_inbound_sessions(&self) -> Result<InboundGroupCache> {
        Ok(InboundGroupCache::new())
    }

    fn save_outbound_session(
        &self,
        _room_id: &str,
        _session: &MegolmOutboundSession,
    ) -> Result<()> {
        Ok(())
    }
    fn get_outbound_session(&self, _room_id: &str) -> Result<Option<MegolmOutboundSession>> {
        Ok(None)
    }
    fn load_outbound_sessions(&self) -> Result<HashMap<String, MegolmOutboundSession>> {
        Ok(HashMap::new())
    }
    fn remove_outbound_session(&self, _room_id: &str) -> Result<()> {
        Ok(())
    }
    fn save_outbound_session_devices(
        &self,
        _room_id: &str,
        _devices: &HashSet<String>,
    ) -> Result<()> {
        Ok(())
    }

    fn save_device_keys(&self, _keys: &DeviceKeyCache) -> Result<()> {
        Ok(())
    }
    fn get_device_keys(&self, _query: &HashMap<String, Vec<String>>) -> Result<DeviceKeyCache> {
        Ok(DeviceKeyCache::new())
    }
    fn load_device_keys(&self) -> Result<DeviceKeyCache> {
        Ok(DeviceKeyCache::new())
    }

    fn save_tracked_users(&self, _user_ids: &[String]) -> Result<()> {
        Ok(())
    }
    fn remove_tracked_users(&self, _user_ids: &[String]) -> Result<()> {
        Ok(())
    }
    fn load_tracked_users(&self) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    fn save_sync_token(&self, _token: &str) -> Result<()> {
        Ok(())
    }
    fn get_sync_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use mx_crypto::types::Curve25519PublicKey;
    use tempfile::tempdir;

    use super::*;

    const PICKLE_KEY: [u8; 32] = [7u8; 32];
    const DEVICE_ID: &str = "TESTDEVICE";

    fn store_with_account() -> (SqliteStore, OlmAccount) {
        let store = SqliteStore::open_in_memory(DEVICE_ID, PICKLE_KEY).unwrap();
        let account = OlmAccount::new();
        store.save_account(&account).unwrap();
        (store, account)
    }

    fn new_olm_session() -> (String, OlmSession) {
        let alice = OlmAccount::new();
        let mut bob = OlmAccount::new();
        bob.generate_one_time_keys(1);
        let (_, otk) = bob.one_time_keys().pop().unwrap();
        let otk = Curve25519PublicKey::from_base64(&otk).unwrap();
        let session = alice.create_outbound_session(bob.curve25519_key(), otk);
        (bob.identity_keys().curve25519, session)
    }

    #[test]
    fn test_account_roundtrip_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crypto.db");

        let account = OlmAccount::new();
        let identity = account.identity_keys();
        {
            let store = SqliteStore::open(&path, DEVICE_ID, PICKLE_KEY).unwrap();
            assert!(store.get_account().unwrap().is_none());
            store.save_account(&account).unwrap();
        }

        let store = SqliteStore::open(&path, DEVICE_ID, PICKLE_KEY).unwrap();
        let restored = store.get_account().unwrap().unwrap();
        assert_eq!(restored.identity_keys(), identity);
    }

    #[test]
    fn test_account_scoped_by_device_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crypto.db");

        let store = SqliteStore::open(&path, DEVICE_ID, PICKLE_KEY).unwrap();
        store.save_account(&OlmAccount::new()).unwrap();

        let other = SqliteStore::open(&path, "OTHERDEVICE", PICKLE_KEY).unwrap();
        assert!(other.get_account().unwrap().is_none());
    }

    #[test]
    fn test_wrong_pickle_key_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crypto.db");

        let store = SqliteStore::open(&path, DEVICE_ID, PICKLE_KEY).unwrap();
        store.save_account(&OlmAccount::new()).unwrap();

        let wrong = SqliteStore::open(&path, DEVICE_ID, [9u8; 32]).unwrap();
        assert!(matches!(
            wrong.get_account(),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn test_olm_session_save_is_idempotent() {
        let (store, _) = store_with_account();
        let (curve_key, session) = new_olm_session();

        store.save_olm_session(&curve_key, &session).unwrap();
        store.save_olm_session(&curve_key, &session).unwrap();

        let sessions = store.get_olm_sessions(&curve_key).unwrap().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id(), session.session_id());
    }

    #[test]
    fn test_olm_sessions_ordered_oldest_first() {
        let (store, _) = store_with_account();
        let (curve_key, first) = new_olm_session();
        let (_, second) = new_olm_session();

        store.save_olm_session(&curve_key, &first).unwrap();
        store.save_olm_session(&curve_key, &second).unwrap();

        let sessions = store.get_olm_sessions(&curve_key).unwrap().unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id(), first.session_id());
        assert_eq!(sessions[1].session_id(), second.session_id());

        assert!(store.get_olm_sessions("unknown-peer").unwrap().is_none());

        let cache = store.load_olm_sessions().unwrap();
        assert_eq!(cache.get(&curve_key).unwrap().len(), 2);
    }

    #[test]
    fn test_inbound_session_roundtrip() {
        let (store, _) = store_with_account();
        let outbound = GroupSession::new();
        let inbound = MegolmInboundSession::new(&outbound.session_key()).unwrap();
        let session_id = inbound.session_id();

        store
            .save_inbound_session("!room:example.org", "sender-key", &inbound)
            .unwrap();

        // The session id is globally unique; lookup needs nothing else.
        let restored = store.get_inbound_session(&session_id).unwrap().unwrap();
        assert_eq!(restored.session_id(), session_id);

        assert!(store.get_inbound_session("unknown-session").unwrap().is_none());

        let cache = store.load_inbound_sessions().unwrap();
        assert!(cache
            .get("!room:example.org", "sender-key", &session_id)
            .is_some());
    }

    #[test]
    fn test_outbound_session_roundtrip() {
        let (store, _) = store_with_account();
        let room = "!room:example.org";

        let mut session = MegolmOutboundSession::with_limits(Duration::days(2), 50);
        session.add_device("PEERDEVICE");
        store.save_outbound_session(room, &session).unwrap();
        store
            .save_outbound_session_devices(room, &session.devices)
            .unwrap();

        let restored = store.get_outbound_session(room).unwrap().unwrap();
        assert_eq!(restored.session_id(), session.session_id());
        assert_eq!(restored.max_age(), Duration::days(2));
        assert_eq!(restored.max_messages(), 50);
        assert_eq!(restored.message_count(), 0);
        assert!(restored.devices.contains("PEERDEVICE"));

        // A later save persists ratchet advancement.
        let _ = session.encrypt("advance");
        store.save_outbound_session(room, &session).unwrap();
        let restored = store.get_outbound_session(room).unwrap().unwrap();
        assert_eq!(restored.message_count(), 1);

        let all = store.load_outbound_sessions().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.contains_key(room));
    }

    #[test]
    fn test_outbound_device_rows_are_additive() {
        let (store, _) = store_with_account();
        let room = "!room:example.org";
        let session = MegolmOutboundSession::new();
        store.save_outbound_session(room, &session).unwrap();

        let first: HashSet<String> = [String::from("A")].into();
        let second: HashSet<String> = [String::from("A"), String::from("B")].into();
        store.save_outbound_session_devices(room, &first).unwrap();
        store.save_outbound_session_devices(room, &second).unwrap();

        let restored = store.get_outbound_session(room).unwrap().unwrap();
        assert_eq!(restored.devices, second);
    }

    #[test]
    fn test_remove_outbound_session_cascades_devices() {
        let (store, _) = store_with_account();
        let room = "!room:example.org";
        let session = MegolmOutboundSession::new();
        store.save_outbound_session(room, &session).unwrap();
        store
            .save_outbound_session_devices(room, &[String::from("A")].into())
            .unwrap();

        store.remove_outbound_session(room).unwrap();
        assert!(store.get_outbound_session(room).unwrap().is_none());

        // A replacement session starts with no shared devices.
        let replacement = MegolmOutboundSession::new();
        store.save_outbound_session(room, &replacement).unwrap();
        let restored = store.get_outbound_session(room).unwrap().unwrap();
        assert!(restored.devices.is_empty());
    }

    #[test]
    fn test_device_keys_selective_fetch() {
        let (store, _) = store_with_account();
        let mut cache = DeviceKeyCache::new();
        cache.insert(
            "@alice:example.org",
            "PHONE",
            DeviceKeys {
                ed25519: "ed-phone".into(),
                curve25519: "curve-phone".into(),
            },
        );
        cache.insert(
            "@alice:example.org",
            "LAPTOP",
            DeviceKeys {
                ed25519: "ed-laptop".into(),
                curve25519: "curve-laptop".into(),
            },
        );
        cache.insert(
            "@bob:example.org",
            "TABLET",
            DeviceKeys {
                ed25519: "ed-tablet".into(),
                curve25519: "curve-tablet".into(),
            },
        );
        store.save_device_keys(&cache).unwrap();

        // Empty device list means every device of that user.
        let mut query = HashMap::new();
        query.insert("@alice:example.org".to_string(), Vec::new());
        let result = store.get_device_keys(&query).unwrap();
        assert_eq!(result.user("@alice:example.org").unwrap().len(), 2);
        assert!(result.user("@bob:example.org").is_none());

        let mut query = HashMap::new();
        query.insert(
            "@alice:example.org".to_string(),
            vec!["PHONE".to_string(), "MISSING".to_string()],
        );
        let result = store.get_device_keys(&query).unwrap();
        let alice = result.user("@alice:example.org").unwrap();
        assert_eq!(alice.len(), 1);
        assert!(alice.contains_key("PHONE"));

        let all = store.load_device_keys().unwrap();
        assert_eq!(all.user("@bob:example.org").unwrap().len(), 1);
    }

    #[test]
    fn test_tracked_users() {
        let (store, _) = store_with_account();
        store
            .save_tracked_users(&["@alice:example.org".to_string(), "@bob:example.org".to_string()])
            .unwrap();
        store
            .save_tracked_users(&["@alice:example.org".to_string()])
            .unwrap();

        let users = store.load_tracked_users().unwrap();
        assert_eq!(users.len(), 2);

        store
            .remove_tracked_users(&["@alice:example.org".to_string()])
            .unwrap();
        let users = store.load_tracked_users().unwrap();
        assert_eq!(users.len(), 1);
        assert!(users.contains("@bob:example.org"));
    }

    #[test]
    fn test_sync_token_last_write_wins() {
        let (store, _) = store_with_account();
        assert!(store.get_sync_token().unwrap().is_none());

        store.save_sync_token("s_1").unwrap();
        store.save_sync_token("s_2").unwrap();
        assert_eq!(store.get_sync_token().unwrap().as_deref(), Some("s_2"));
    }

    #[test]
    fn test_remove_account_wipes_everything() {
        let (store, _) = store_with_account();
        let (curve_key, session) = new_olm_session();
        store.save_olm_session(&curve_key, &session).unwrap();
        store
            .save_outbound_session("!room:example.org", &MegolmOutboundSession::new())
            .unwrap();
        let outbound = GroupSession::new();
        let inbound = MegolmInboundSession::new(&outbound.session_key()).unwrap();
        let inbound_id = inbound.session_id();
        store
            .save_inbound_session("!room:example.org", "sender-key", &inbound)
            .unwrap();
        let mut keys = DeviceKeyCache::new();
        keys.insert(
            "@alice:example.org",
            "PHONE",
            DeviceKeys {
                ed25519: "ed".into(),
                curve25519: "curve".into(),
            },
        );
        store.save_device_keys(&keys).unwrap();
        store.save_sync_token("s_1").unwrap();
        store
            .save_tracked_users(&["@alice:example.org".to_string()])
            .unwrap();

        store.remove_account().unwrap();

        assert!(store.get_account().unwrap().is_none());
        assert!(store.get_olm_sessions(&curve_key).unwrap().is_none());
        assert!(store
            .get_outbound_session("!room:example.org")
            .unwrap()
            .is_none());
        assert!(store.get_inbound_session(&inbound_id).unwrap().is_none());
        assert!(store.load_device_keys().unwrap().is_empty());
        assert!(store.get_sync_token().unwrap().is_none());
        assert!(store.load_tracked_users().unwrap().is_empty());
    }

    #[test]
    fn test_null_store_persists_nothing() {
        let store = NullStore;
        let account = OlmAccount::new();
        store.save_account(&account).unwrap();
        assert!(store.get_account().unwrap().is_none());
        assert!(store.load_olm_sessions().unwrap().is_empty());
        assert!(store.load_outbound_sessions().unwrap().is_empty());
        assert!(store.load_tracked_users().unwrap().is_empty());
        assert!(store.get_sync_token().unwrap().is_none());
    }
}
