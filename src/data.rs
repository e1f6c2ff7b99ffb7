use crate::enforcement::persist::{Persistence, YamlFile};
use crate::enforcement::{EnforcementError, EnforcementResult, RatingPolicy, Schedule};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{Display, Formatter},
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::debug;

/// Setting holding the media-server admin token
pub const ADMIN_TOKEN_KEY: &str = "admin_token";
/// Setting holding the IANA timezone rules are evaluated in
pub const TIMEZONE_KEY: &str = "timezone";
/// Timezone used when neither the setting nor the environment names one
pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

const RULES_FILE: &str = "rules.yaml";
const USERS_FILE: &str = "users.yaml";
const ASSIGNMENTS_FILE: &str = "assignments.yaml";
const SETTINGS_FILE: &str = "settings.yaml";

const fn default_true() -> bool {
    true
}

/// Time-windowed rating restriction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: u64,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub ratings: RatingPolicy,
    // Labels are stored for the dashboards; enforcement ignores them
    #[serde(default)]
    pub include_labels: Vec<String>,
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Media-server account managed by the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    /// Account id on the remote service
    pub remote_id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_home: bool,
    #[serde(default)]
    pub is_restricted: bool,
    #[serde(default)]
    pub deactivated: bool,
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.username, self.id)
    }
}

/// Rule assigned to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Assignment {
    pub user_id: u64,
    pub rule_id: u64,
}

impl Assignment {
    #[must_use]
    pub const fn new(user_id: u64, rule_id: u64) -> Self {
        Self { user_id, rule_id }
    }
}

/// Point-in-time copy of the store used for one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct DataSnapshot {
    pub rules: HashMap<u64, Rule>,
    pub users: HashMap<u64, User>,
    pub assignments: BTreeSet<Assignment>,
}

impl DataSnapshot {
    /// Rule ids assigned to `user_id`
    #[must_use]
    pub fn rules_for(&self, user_id: u64) -> BTreeSet<u64> {
        self.assignments
            .iter()
            .filter(|a| a.user_id == user_id)
            .map(|a| a.rule_id)
            .collect()
    }

    /// Users with at least one assignment
    #[must_use]
    pub fn assigned_users(&self) -> BTreeSet<u64> {
        self.assignments.iter().map(|a| a.user_id).collect()
    }
}

/// Shared handle to the rule, user and settings store
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

impl Default for Data {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("dir", &self.dir)
            .field("rules", &self.rules.len())
            .field("users", &self.users.len())
            .field("assignments", &self.assignments.len())
            .finish()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    /// Create a store that is not backed by any directory
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(DataInner::new(None)))
    }

    /// Load the store from `dir`
    ///
    /// Missing files are treated as empty collections.
    ///
    /// # Errors
    /// Returns an error if a file exists but cannot be read or parsed
    pub async fn load(dir: impl Into<PathBuf>) -> EnforcementResult<Self> {
        let data = Self(Arc::new(DataInner::new(Some(dir.into()))));
        data.refresh().await?;
        Ok(data)
    }

    /// Re-read every collection from the data directory
    ///
    /// Rows present in the files are replaced in place and rows missing from
    /// them are dropped, so a concurrent reader never sees a surviving row
    /// disappear. A store without a directory is left untouched.
    ///
    /// # Errors
    /// Returns an error if a file cannot be read or parsed; the store keeps
    /// its previous contents in that case.
    pub async fn refresh(&self) -> EnforcementResult<()> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(());
        };
        // Held across read and apply so an assignment saved meanwhile is not dropped
        let _guard = self.write_lock.lock().await;

        let rules = YamlFile::<Rule>::new(dir.join(RULES_FILE)).load().await?;
        let users = YamlFile::<User>::new(dir.join(USERS_FILE)).load().await?;
        let assignments = YamlFile::<Assignment>::new(dir.join(ASSIGNMENTS_FILE))
            .load()
            .await?;
        let settings = read_settings(&dir.join(SETTINGS_FILE)).await?;

        let rule_ids: BTreeSet<u64> = rules.iter().map(|r| r.id).collect();
        self.rules.retain(|id, _| rule_ids.contains(id));
        for rule in rules {
            self.rules.insert(rule.id, rule);
        }

        let user_ids: BTreeSet<u64> = users.iter().map(|u| u.id).collect();
        self.users.retain(|id, _| user_ids.contains(id));
        for user in users {
            self.users.insert(user.id, user);
        }

        let assignments: BTreeSet<Assignment> = assignments.into_iter().collect();
        self.assignments.retain(|a| assignments.contains(a));
        for assignment in assignments {
            self.assignments.insert(assignment);
        }

        self.settings.retain(|key, _| settings.contains_key(key));
        for (key, value) in settings {
            self.settings.insert(key, value);
        }

        debug!(
            rules = self.rules.len(),
            users = self.users.len(),
            assignments = self.assignments.len(),
            "Data store refreshed"
        );
        Ok(())
    }

    /// Copy the current rows for one reconciliation pass
    #[must_use]
    pub fn snapshot(&self) -> DataSnapshot {
        DataSnapshot {
            rules: self
                .rules
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
            users: self
                .users
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect(),
            assignments: self.assignments.iter().map(|a| *a).collect(),
        }
    }

    #[must_use]
    pub fn get_rule(&self, id: u64) -> Option<Rule> {
        self.rules.get(&id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn get_user(&self, id: u64) -> Option<User> {
        self.users.get(&id).map(|entry| entry.value().clone())
    }

    pub fn upsert_rule(&self, rule: Rule) {
        self.rules.insert(rule.id, rule);
    }

    pub fn upsert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Look up a setting, falling back to the environment variable `env_key`
    #[must_use]
    pub fn setting(&self, key: &str, env_key: &str) -> Option<String> {
        self.settings
            .get(key)
            .map(|entry| entry.value().trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                std::env::var(env_key)
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    pub fn set_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        self.settings.insert(key.into(), value.into());
    }

    /// Admin token for the remote account API
    #[must_use]
    pub fn admin_token(&self) -> Option<String> {
        self.setting(ADMIN_TOKEN_KEY, "PLEX_ADMIN_TOKEN")
    }

    /// IANA timezone name rule windows are evaluated in
    #[must_use]
    pub fn timezone(&self) -> String {
        self.setting(TIMEZONE_KEY, "TIMEZONE")
            .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string())
    }

    /// Assign a rule to a user, returning false if it already was
    ///
    /// # Errors
    /// Returns `UserNotFound` or `RuleNotFound` for unknown ids, or a storage
    /// error if the assignments file cannot be written.
    pub async fn assign(&self, user_id: u64, rule_id: u64) -> EnforcementResult<bool> {
        if !self.users.contains_key(&user_id) {
            return Err(EnforcementError::UserNotFound(user_id));
        }
        if !self.rules.contains_key(&rule_id) {
            return Err(EnforcementError::RuleNotFound(rule_id));
        }

        let _guard = self.write_lock.lock().await;
        let added = self.assignments.insert(Assignment::new(user_id, rule_id));
        if added {
            self.save_assignments().await?;
        }
        Ok(added)
    }

    /// Remove an assignment, returning false if there was none
    ///
    /// # Errors
    /// Returns an error if the assignments file cannot be written
    pub async fn unassign(&self, user_id: u64, rule_id: u64) -> EnforcementResult<bool> {
        let _guard = self.write_lock.lock().await;
        let removed = self
            .assignments
            .remove(&Assignment::new(user_id, rule_id))
            .is_some();
        if removed {
            self.save_assignments().await?;
        }
        Ok(removed)
    }

    async fn save_assignments(&self) -> EnforcementResult<()> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(());
        };
        let assignments: Vec<Assignment> = self
            .assignments
            .iter()
            .map(|a| *a)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        YamlFile::<Assignment>::new(dir.join(ASSIGNMENTS_FILE))
            .save(&assignments)
            .await
    }
}

async fn read_settings(path: &Path) -> EnforcementResult<BTreeMap<String, String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
        Ok(content) => Ok(serde_yaml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Rules, users, assignments and settings shared with the CRUD dashboards
pub struct DataInner {
    // Map of rule id -> rule
    pub rules: DashMap<u64, Rule>,
    // Map of user id -> user
    pub users: DashMap<u64, User>,
    pub assignments: DashSet<Assignment>,
    // Runtime settings such as the admin token and timezone
    pub settings: DashMap<String, String>,
    // Directory the collections are read from, if any
    pub dir: Option<PathBuf>,
    // Serializes file refreshes against assignment writes
    write_lock: Mutex<()>,
}

impl DataInner {
    #[must_use]
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            rules: DashMap::new(),
            users: DashMap::new(),
            assignments: DashSet::new(),
            settings: DashMap::new(),
            dir,
            write_lock: Mutex::new(()),
        }
    }
}
