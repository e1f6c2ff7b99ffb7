//! Bypass store
//!
//! Temporary per-user overrides that suspend every rule of a user until they
//! expire. A user has at most one bypass; granting a new one replaces it.

use crate::enforcement::persist::{MemoryPersistence, Persistence};
use crate::enforcement::{Bypass, BypassDuration, EnforcementResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Store for active and recently expired bypasses
#[derive(Clone)]
pub struct BypassStore {
    records: Arc<DashMap<u64, Bypass>>,
    backend: Arc<dyn Persistence<Bypass>>,
    write_lock: Arc<Mutex<()>>,
}

impl Default for BypassStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for BypassStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassStore")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl BypassStore {
    /// Create an empty store over `backend` without reading it
    pub fn new(backend: Arc<dyn Persistence<Bypass>>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence))
    }

    /// Load stored bypasses
    ///
    /// Should several rows exist for one user, the one expiring last wins.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read
    pub async fn load(backend: Arc<dyn Persistence<Bypass>>) -> EnforcementResult<Self> {
        let store = Self::new(backend);
        for bypass in store.backend.load().await? {
            let newer = store
                .records
                .get(&bypass.user_id)
                .is_none_or(|existing| existing.expires_at < bypass.expires_at);
            if newer {
                store.records.insert(bypass.user_id, bypass);
            }
        }
        info!(bypasses = store.records.len(), "Bypass store loaded");
        Ok(store)
    }

    /// The user's bypass if it has not expired at `now`
    #[must_use]
    pub fn get_active(&self, user_id: u64, now: DateTime<Utc>) -> Option<Bypass> {
        self.records
            .get(&user_id)
            .filter(|entry| entry.is_active_at(now))
            .map(|entry| entry.value().clone())
    }

    /// Grant a bypass of `minutes`, replacing any existing one for the user
    ///
    /// # Errors
    /// Returns `InvalidBypassDuration` for durations outside 15/30/60/120/240,
    /// or a storage error if the backend write fails.
    pub async fn grant(
        &self,
        user_id: u64,
        minutes: u32,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> EnforcementResult<Bypass> {
        let duration = BypassDuration::try_from(minutes)?;
        let bypass = Bypass::new(user_id, duration, created_by, now);
        self.records.insert(user_id, bypass.clone());
        self.persist().await?;
        Ok(bypass)
    }

    /// Remove the user's bypass, returning it if one existed
    ///
    /// # Errors
    /// Returns an error if the backend write fails
    pub async fn cancel(&self, user_id: u64) -> EnforcementResult<Option<Bypass>> {
        let removed = self.records.remove(&user_id).map(|(_, bypass)| bypass);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// All bypasses still active at `now`, soonest expiry first
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Bypass> {
        let mut active: Vec<Bypass> = self
            .records
            .iter()
            .filter(|entry| entry.is_active_at(now))
            .map(|entry| entry.value().clone())
            .collect();
        active.sort_by_key(|bypass| (bypass.expires_at, bypass.user_id));
        active
    }

    /// Drop bypasses that expired at or before `now`
    ///
    /// # Errors
    /// Returns an error if the backend write fails
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> EnforcementResult<usize> {
        let before = self.records.len();
        self.records.retain(|_, bypass| bypass.is_active_at(now));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            self.persist().await?;
        }
        Ok(purged)
    }

    async fn persist(&self) -> EnforcementResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut records: Vec<Bypass> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|bypass| bypass.user_id);
        self.backend.save(&records).await
    }
}
