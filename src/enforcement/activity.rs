//! Activity log
//!
//! Append-only audit trail of enforcement transitions and manual actions,
//! shared with the dashboards that render it.

use crate::enforcement::EnforcementResult;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Kind of activity entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivityAction {
    #[display("rule_applied")]
    RuleApplied,
    #[display("restriction_lifted")]
    RestrictionLifted,
    #[display("bypass_granted")]
    BypassGranted,
    #[display("bypass_cancelled")]
    BypassCancelled,
    /// Kinds written by other collaborators, such as `rule_created` or `user_sync`
    #[display("{_0}")]
    Other(String),
}

impl From<String> for ActivityAction {
    fn from(value: String) -> Self {
        match value.as_str() {
            "rule_applied" => Self::RuleApplied,
            "restriction_lifted" => Self::RestrictionLifted,
            "bypass_granted" => Self::BypassGranted,
            "bypass_cancelled" => Self::BypassCancelled,
            _ => Self::Other(value),
        }
    }
}

impl From<ActivityAction> for String {
    fn from(value: ActivityAction) -> Self {
        value.to_string()
    }
}

/// One row of the activity log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<String>,
    pub action: ActivityAction,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        username: impl Into<String>,
        rule_name: Option<String>,
        action: ActivityAction,
        details: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.into(),
            rule_name,
            action,
            details: details.into(),
            created_at,
        }
    }
}

/// Destination for activity entries
#[async_trait::async_trait]
pub trait ActivitySink: Send + Sync {
    /// Append one entry
    async fn append(&self, entry: ActivityEntry) -> EnforcementResult<()>;
}

/// Activity log kept in memory
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
}

impl MemoryActivityLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry appended so far
    #[must_use]
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Entries of one kind
    #[must_use]
    pub fn of_kind(&self, action: &ActivityAction) -> Vec<ActivityEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| &entry.action == action)
            .collect()
    }
}

#[async_trait::async_trait]
impl ActivitySink for MemoryActivityLog {
    async fn append(&self, entry: ActivityEntry) -> EnforcementResult<()> {
        self.entries
            .lock()
            .map_err(|e| crate::enforcement::EnforcementError::Other(e.to_string()))?
            .push(entry);
        Ok(())
    }
}

/// Activity log appended to a YAML sequence file
///
/// Each append writes one sequence item, so the file stays a valid YAML list
/// without being rewritten.
#[derive(Debug)]
pub struct YamlActivityLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl YamlActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read back every entry in the file
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed
    pub async fn read_all(&self) -> EnforcementResult<Vec<ActivityEntry>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl ActivitySink for YamlActivityLog {
    async fn append(&self, entry: ActivityEntry) -> EnforcementResult<()> {
        let chunk = serde_yaml::to_string(&[entry])?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
