//! Applied-state tracker
//!
//! Holds the enforcement loop's belief about which (user, rule) filters are
//! live on the remote service. The belief is never read back from the remote
//! side; it is written through to a persistence backend so a restart resumes
//! from the same state.

use crate::enforcement::persist::{MemoryPersistence, Persistence};
use crate::enforcement::{AppliedRestriction, EnforcementResult, EnforcementState, PairKey};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Tracker of restrictions currently pushed to the remote service
#[derive(Clone)]
pub struct AppliedStateTracker {
    records: Arc<DashMap<PairKey, AppliedRestriction>>,
    backend: Arc<dyn Persistence<AppliedRestriction>>,
    /// Serializes backend writes so the latest snapshot always lands last
    write_lock: Arc<Mutex<()>>,
}

impl Default for AppliedStateTracker {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for AppliedStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppliedStateTracker")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl AppliedStateTracker {
    /// Create an empty tracker over `backend` without reading it
    pub fn new(backend: Arc<dyn Persistence<AppliedRestriction>>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            backend,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a tracker that lives only as long as the process
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence))
    }

    /// Rebuild the tracker from durable storage
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read
    pub async fn load(backend: Arc<dyn Persistence<AppliedRestriction>>) -> EnforcementResult<Self> {
        let tracker = Self::new(backend);
        for record in tracker.backend.load().await? {
            tracker.records.insert(record.key(), record);
        }
        info!(
            restrictions = tracker.records.len(),
            "Applied-state tracker loaded"
        );
        Ok(tracker)
    }

    #[must_use]
    pub fn is_applied(&self, key: PairKey) -> bool {
        self.records.contains_key(&key)
    }

    #[must_use]
    pub fn state(&self, key: PairKey) -> EnforcementState {
        if self.is_applied(key) {
            EnforcementState::Applied
        } else {
            EnforcementState::NotApplied
        }
    }

    #[must_use]
    pub fn get(&self, key: PairKey) -> Option<AppliedRestriction> {
        self.records.get(&key).map(|entry| entry.value().clone())
    }

    /// Record that `record`'s filter is now live, replacing any previous record
    ///
    /// # Errors
    /// Returns an error if the backend write fails; the in-memory belief is
    /// updated regardless since the remote call already happened.
    pub async fn mark_applied(&self, record: AppliedRestriction) -> EnforcementResult<()> {
        self.records.insert(record.key(), record);
        self.persist().await
    }

    /// Forget the pair, returning the record it had
    ///
    /// # Errors
    /// Returns an error if the backend write fails
    pub async fn clear(&self, key: PairKey) -> EnforcementResult<Option<AppliedRestriction>> {
        let removed = self.records.remove(&key).map(|(_, record)| record);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Forget every pair of one user
    ///
    /// # Errors
    /// Returns an error if the backend write fails
    pub async fn clear_user(&self, user_id: u64) -> EnforcementResult<Vec<AppliedRestriction>> {
        let keys: Vec<PairKey> = self
            .records
            .iter()
            .filter(|entry| entry.key().user_id == user_id)
            .map(|entry| *entry.key())
            .collect();

        let removed: Vec<AppliedRestriction> = keys
            .into_iter()
            .filter_map(|key| self.records.remove(&key).map(|(_, record)| record))
            .collect();

        if !removed.is_empty() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Records of one user, ordered by rule id
    #[must_use]
    pub fn for_user(&self, user_id: u64) -> Vec<AppliedRestriction> {
        let mut records: Vec<AppliedRestriction> = self
            .records
            .iter()
            .filter(|entry| entry.key().user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.rule_id);
        records
    }

    /// All records, ordered by pair
    #[must_use]
    pub fn all(&self) -> Vec<AppliedRestriction> {
        let mut records: Vec<AppliedRestriction> =
            self.records.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by_key(AppliedRestriction::key);
        records
    }

    /// Users with at least one applied record
    #[must_use]
    pub fn user_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.records.iter().map(|entry| entry.key().user_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn persist(&self) -> EnforcementResult<()> {
        let _guard = self.write_lock.lock().await;
        let records = self.all();
        self.backend.save(&records).await
    }
}
