//! Rule enforcement for Rating Warden
//!
//! This module holds the reconciliation loop that keeps media-server content
//! filters in line with the configured rule windows, together with the pure
//! evaluators and stores it is built from.

pub mod activity;
mod bypass;
pub mod client;
mod error;
pub mod filter;
pub mod persist;
mod record;
pub mod schedule;
mod service;
mod tracker;

pub use activity::{ActivityAction, ActivityEntry, ActivitySink, MemoryActivityLog, YamlActivityLog};
pub use bypass::BypassStore;
pub use client::{PlexRestrictionClient, RestrictionClient};
pub use error::{EnforcementError, EnforcementResult};
pub use filter::{CompiledFilters, FilterExpr, RatingPolicy};
pub use record::{AppliedRestriction, Bypass, BypassDuration, EnforcementState, PairKey};
pub use schedule::{CivilTime, DaySet, Schedule, TimeOfDay, Weekday};
pub use service::{
    ActiveRestriction, DEFAULT_MAX_CONCURRENCY, Desired, EnforcementHandle, EnforcementService,
    LiftReason, TickReport, UserReport, desired_state,
};
pub use tracker::AppliedStateTracker;

/// Request type for the enforcement loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementCheckRequest {
    /// Run a full tick regardless of the timer
    CheckAll,
    /// Reconcile a single user
    CheckUser { user_id: u64 },
    /// Shutdown the enforcement loop
    Shutdown,
}
