//! Session-bound authorization.
//!
//! A capability with a valid signature is still rejected unless its subject
//! holds an active session: sessions are the revocation lever for bearer
//! links that cannot themselves be recalled. One active session per subject;
//! `start` overwrites any prior one. Absence of a session is a signal, not
//! an error.
//!
//! The backing store is a trait seam — an external cache in production,
//! an in-memory map in tests, a JSON file for the CLI glue.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::SESSION_TTL_SECS;
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Key-value backing store for sessions, keyed by subject id.
pub trait SessionStore: Send + Sync {
    fn put(&self, subject_id: u64, record: SessionRecord) -> Result<(), EngineError>;
    fn get(&self, subject_id: u64) -> Result<Option<SessionRecord>, EngineError>;
    fn remove(&self, subject_id: u64) -> Result<(), EngineError>;
}

/// Session semantics on top of a [`SessionStore`].
pub struct SessionGuard {
    store: Arc<dyn SessionStore>,
    ttl_secs: i64,
}

impl SessionGuard {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            ttl_secs: SESSION_TTL_SECS,
        }
    }

    pub fn with_ttl(store: Arc<dyn SessionStore>, ttl_secs: i64) -> Self {
        Self { store, ttl_secs }
    }

    /// Start a session for `subject_id`, overwriting any prior one.
    /// Returns the opaque session token.
    pub fn start(&self, subject_id: u64) -> Result<String, EngineError> {
        let token = Uuid::new_v4().to_string();
        let record = SessionRecord {
            token: token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(self.ttl_secs),
        };
        self.store.put(subject_id, record)?;
        Ok(token)
    }

    /// Existence check only. The token value is not re-validated against the
    /// capability; session and capability are independent proofs.
    pub fn check(&self, subject_id: u64) -> Result<bool, EngineError> {
        match self.store.get(subject_id)? {
            Some(record) if record.is_live(Utc::now()) => Ok(true),
            Some(_) => {
                // expired entry: drop it so the store does not accumulate
                self.store.remove(subject_id)?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Immediate deletion, idempotent.
    pub fn revoke(&self, subject_id: u64) -> Result<(), EngineError> {
        self.store.remove(subject_id)
    }
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<u64, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&self, subject_id: u64, record: SessionRecord) -> Result<(), EngineError> {
        self.entries.write().insert(subject_id, record);
        Ok(())
    }

    fn get(&self, subject_id: u64) -> Result<Option<SessionRecord>, EngineError> {
        Ok(self.entries.read().get(&subject_id).cloned())
    }

    fn remove(&self, subject_id: u64) -> Result<(), EngineError> {
        self.entries.write().remove(&subject_id);
        Ok(())
    }
}

/// JSON-file store so CLI invocations share session state across processes.
/// Expired entries are pruned on load; writes go through a temp file and
/// rename so a crash cannot leave a torn session map.
pub struct FileSessionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<HashMap<u64, SessionRecord>, EngineError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read(&self.path)?;
        let mut map: HashMap<u64, SessionRecord> = serde_json::from_slice(&raw)?;
        let now = Utc::now();
        map.retain(|_, record| record.is_live(now));
        Ok(map)
    }

    fn save(&self, map: &HashMap<u64, SessionRecord>) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn put(&self, subject_id: u64, record: SessionRecord) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        map.insert(subject_id, record);
        self.save(&map)
    }

    fn get(&self, subject_id: u64) -> Result<Option<SessionRecord>, EngineError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(&subject_id))
    }

    fn remove(&self, subject_id: u64) -> Result<(), EngineError> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        map.remove(&subject_id);
        self.save(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_check_revoke_cycle() {
        let guard = SessionGuard::new(Arc::new(MemorySessionStore::new()));
        assert!(!guard.check(42).unwrap());
        let token = guard.start(42).unwrap();
        assert!(!token.is_empty());
        assert!(guard.check(42).unwrap());
        guard.revoke(42).unwrap();
        assert!(!guard.check(42).unwrap());
        // revoke is idempotent
        guard.revoke(42).unwrap();
    }

    #[test]
    fn start_overwrites_prior_session() {
        let store = Arc::new(MemorySessionStore::new());
        let guard = SessionGuard::new(store.clone());
        let first = guard.start(7).unwrap();
        let second = guard.start(7).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.get(7).unwrap().unwrap().token, second);
    }

    #[test]
    fn expired_session_reads_as_absent() {
        let store = Arc::new(MemorySessionStore::new());
        let guard = SessionGuard::with_ttl(store.clone(), -1);
        guard.start(9).unwrap();
        assert!(!guard.check(9).unwrap());
        // lazily pruned
        assert!(store.get(9).unwrap().is_none());
    }

    #[test]
    fn file_store_round_trips_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let guard = SessionGuard::new(Arc::new(FileSessionStore::new(path.clone())));
            guard.start(42).unwrap();
        }
        let guard = SessionGuard::new(Arc::new(FileSessionStore::new(path)));
        assert!(guard.check(42).unwrap());
        guard.revoke(42).unwrap();
        assert!(!guard.check(42).unwrap());
    }
}
