//! Enforcement records and pair state
//!
//! This module defines the persisted records the enforcement loop keeps about
//! restrictions it has pushed and bypasses that suspend them.

use chrono::{DateTime, Duration, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one (user, rule) assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[display("{user_id}:{rule_id}")]
pub struct PairKey {
    pub user_id: u64,
    pub rule_id: u64,
}

impl PairKey {
    #[must_use]
    pub const fn new(user_id: u64, rule_id: u64) -> Self {
        Self { user_id, rule_id }
    }
}

/// Enforcement state of a (user, rule) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, Serialize, Deserialize)]
pub enum EnforcementState {
    /// No filter is believed to be live for this pair
    #[default]
    #[display("Not applied")]
    NotApplied,
    /// The pair's filter was pushed to the remote account
    #[display("Applied")]
    Applied,
}

/// Record of a restriction the loop believes is live on the remote service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRestriction {
    pub user_id: u64,
    pub rule_id: u64,
    /// Remote account the filter was pushed to
    pub remote_id: String,
    /// Username at the time of application
    pub username: String,
    /// Rule name at the time of application
    pub rule_name: String,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRestriction {
    /// Create a new applied-restriction record
    pub fn new(
        key: PairKey,
        remote_id: impl Into<String>,
        username: impl Into<String>,
        rule_name: impl Into<String>,
        applied_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: key.user_id,
            rule_id: key.rule_id,
            remote_id: remote_id.into(),
            username: username.into(),
            rule_name: rule_name.into(),
            applied_at,
        }
    }

    #[must_use]
    pub const fn key(&self) -> PairKey {
        PairKey::new(self.user_id, self.rule_id)
    }
}

/// Temporary suspension of all enforcement for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bypass {
    pub id: String,
    pub user_id: u64,
    pub minutes: u32,
    pub expires_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Bypass {
    /// Create a bypass starting at `now`
    pub fn new(
        user_id: u64,
        duration: BypassDuration,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let minutes = duration.minutes();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            minutes,
            expires_at: now + Duration::minutes(i64::from(minutes)),
            created_by: created_by.into(),
            created_at: now,
        }
    }

    /// Whether the bypass still suspends enforcement at `now`
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Durations a bypass may be granted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassDuration {
    QuarterHour,
    HalfHour,
    OneHour,
    TwoHours,
    FourHours,
}

impl BypassDuration {
    #[must_use]
    pub const fn minutes(self) -> u32 {
        match self {
            Self::QuarterHour => 15,
            Self::HalfHour => 30,
            Self::OneHour => 60,
            Self::TwoHours => 120,
            Self::FourHours => 240,
        }
    }

    /// Label used in activity entries
    #[must_use]
    pub fn label(self) -> String {
        let minutes = self.minutes();
        if minutes >= 60 {
            format!("{} hour(s)", minutes / 60)
        } else {
            format!("{minutes} minutes")
        }
    }
}

impl TryFrom<u32> for BypassDuration {
    type Error = super::EnforcementError;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        match minutes {
            15 => Ok(Self::QuarterHour),
            30 => Ok(Self::HalfHour),
            60 => Ok(Self::OneHour),
            120 => Ok(Self::TwoHours),
            240 => Ok(Self::FourHours),
            other => Err(super::EnforcementError::InvalidBypassDuration(other)),
        }
    }
}
