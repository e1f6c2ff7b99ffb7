//! Enforcement service
//!
//! Runs the reconciliation loop: every tick it decides, for each assigned
//! (user, rule) pair, whether the rule should be live on the remote account,
//! compares that with the applied-state tracker and pushes or clears filters
//! for the pairs that differ. Manual actions (bypasses, immediate
//! assignment) go through the same per-user reconciliation.

use crate::data::{Data, DataSnapshot, Rule, User};
use crate::enforcement::activity::{ActivityAction, ActivityEntry, ActivitySink};
use crate::enforcement::client::RestrictionClient;
use crate::enforcement::schedule::{self, CivilTime, parse_timezone};
use crate::enforcement::{
    AppliedRestriction, AppliedStateTracker, Bypass, BypassDuration, BypassStore,
    EnforcementCheckRequest, EnforcementError, EnforcementResult, PairKey,
};
use crate::logging::{log_action_end, log_action_error, log_action_start};
use crate::{ENFORCER_TARGET, ERROR_TARGET};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use derive_more::Display;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default number of users reconciled at once
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Why a pair should not be enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LiftReason {
    #[display("Rule unassigned")]
    Unassigned,
    #[display("User no longer exists")]
    UserRemoved,
    #[display("Rule no longer exists")]
    RuleRemoved,
    #[display("Admin users are not restricted")]
    AdminExempt,
    #[display("User deactivated")]
    Deactivated,
    #[display("Rule disabled")]
    RuleDisabled,
    #[display("Bypass active")]
    BypassActive,
    #[display("Rule time window ended")]
    WindowEnded,
}

/// Desired state of one pair for the current tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desired<'a> {
    Enforce(&'a User, &'a Rule),
    Release(LiftReason),
}

/// Decide whether a pair should be live at `at`
#[must_use]
pub fn desired_state<'a>(
    user: Option<&'a User>,
    rule: Option<&'a Rule>,
    assigned: bool,
    bypassed: bool,
    at: &CivilTime,
) -> Desired<'a> {
    let reason = match (user, rule) {
        _ if !assigned => LiftReason::Unassigned,
        (None, _) => LiftReason::UserRemoved,
        (_, None) => LiftReason::RuleRemoved,
        (Some(user), _) if user.is_admin => LiftReason::AdminExempt,
        (Some(user), _) if user.deactivated => LiftReason::Deactivated,
        (_, Some(rule)) if !rule.is_active => LiftReason::RuleDisabled,
        _ if bypassed => LiftReason::BypassActive,
        (Some(user), Some(rule)) => {
            if schedule::is_active(rule, at) {
                return Desired::Enforce(user, rule);
            }
            LiftReason::WindowEnded
        }
    };
    Desired::Release(reason)
}

/// What caused an apply, appended to the activity detail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Tick,
    RuleAssigned,
    BypassCancelled,
    OverlapLifted,
    PriorityOrder,
}

impl Trigger {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Tick => "",
            Self::RuleAssigned => " (rule assigned, applied immediately)",
            Self::BypassCancelled => " (bypass cancelled, re-applied immediately)",
            Self::OverlapLifted => " (re-applied after overlapping restriction lifted)",
            Self::PriorityOrder => " (re-applied to keep higher priority rule in effect)",
        }
    }

    /// Pushes of pairs the tracker already holds as applied
    const fn is_repush(self) -> bool {
        matches!(self, Self::OverlapLifted | Self::PriorityOrder)
    }
}

/// Settings resolved once per tick
#[derive(Debug, Clone)]
struct TickContext {
    token: String,
    civil: CivilTime,
    now: DateTime<Utc>,
}

/// Outcome of reconciling one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserReport {
    pub applied: usize,
    pub lifted: usize,
    pub failed: usize,
}

/// Outcome of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub users: usize,
    pub applied: usize,
    pub lifted: usize,
    pub failed: usize,
    pub purged_bypasses: usize,
    /// Set when the tick was skipped before touching any user
    pub skipped: Option<String>,
}

impl TickReport {
    fn absorb(&mut self, user: UserReport) {
        self.applied += user.applied;
        self.lifted += user.lifted;
        self.failed += user.failed;
    }

    /// True when the tick changed nothing and hit no failures
    #[must_use]
    pub const fn is_quiet(&self) -> bool {
        self.applied == 0 && self.lifted == 0 && self.failed == 0
    }
}

/// Row of the active-restrictions view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRestriction {
    pub user_id: u64,
    pub username: String,
    pub rule_id: u64,
    pub rule_name: String,
    pub priority: i32,
    pub minutes_remaining: u16,
    pub bypassed: bool,
    pub applied: bool,
}

/// Per-user async locks so ticks and manual actions never interleave on one account
#[derive(Debug, Clone, Default)]
struct UserLocks(Arc<DashMap<u64, Arc<Mutex<()>>>>);

impl UserLocks {
    async fn lock(&self, user_id: u64) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(&self.0.entry(user_id).or_default());
        lock.lock_owned().await
    }
}

/// Service for enforcement operations
#[derive(Clone)]
pub struct EnforcementService {
    data: Data,
    tracker: AppliedStateTracker,
    bypasses: BypassStore,
    activity: Arc<dyn ActivitySink>,
    client: Arc<dyn RestrictionClient>,
    locks: UserLocks,
    max_concurrency: usize,
    /// Sender into the running loop, set by [`EnforcementService::start`]
    tx: Option<Sender<EnforcementCheckRequest>>,
}

impl std::fmt::Debug for EnforcementService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnforcementService")
            .field("data", &self.data)
            .field("tracker", &self.tracker)
            .field("bypasses", &self.bypasses)
            .field("max_concurrency", &self.max_concurrency)
            .field("running", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

impl EnforcementService {
    /// Create a service with in-memory tracker and bypass store
    pub fn new(
        data: Data,
        client: Arc<dyn RestrictionClient>,
        activity: Arc<dyn ActivitySink>,
    ) -> Self {
        Self {
            data,
            tracker: AppliedStateTracker::in_memory(),
            bypasses: BypassStore::in_memory(),
            activity,
            client,
            locks: UserLocks::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            tx: None,
        }
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: AppliedStateTracker) -> Self {
        self.tracker = tracker;
        self
    }

    #[must_use]
    pub fn with_bypasses(mut self, bypasses: BypassStore) -> Self {
        self.bypasses = bypasses;
        self
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    #[must_use]
    pub const fn tracker(&self) -> &AppliedStateTracker {
        &self.tracker
    }

    #[must_use]
    pub const fn bypasses(&self) -> &BypassStore {
        &self.bypasses
    }

    #[must_use]
    pub const fn data(&self) -> &Data {
        &self.data
    }

    fn context(&self, now: DateTime<Utc>) -> EnforcementResult<TickContext> {
        let token = self
            .data
            .admin_token()
            .ok_or_else(|| EnforcementError::Config("No admin token configured".to_string()))?;
        let tz = parse_timezone(&self.data.timezone())?;
        Ok(TickContext {
            token,
            civil: CivilTime::resolve(now, tz),
            now,
        })
    }

    /// Run one full reconciliation pass at `now`
    ///
    /// Never fails: configuration problems skip the tick and per-user
    /// failures are logged and counted.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        if let Err(e) = self.data.refresh().await {
            warn!(target: ENFORCER_TARGET, error = %e, "Data refresh failed, using previous rows");
        }

        let ctx = match self.context(now) {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                warn!(target: ENFORCER_TARGET, error = %e, "Skipping enforcement tick");
                report.skipped = Some(e.to_string());
                return report;
            }
        };

        let snapshot = Arc::new(self.data.snapshot());
        let mut users = snapshot.assigned_users();
        users.extend(self.tracker.user_ids());
        report.users = users.len();
        debug!(target: ENFORCER_TARGET, users = report.users, at = %ctx.civil, "Enforcement tick");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for user_id in users {
            let service = self.clone();
            let snapshot = Arc::clone(&snapshot);
            let ctx = Arc::clone(&ctx);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                service
                    .reconcile_user(user_id, &snapshot, &ctx, Trigger::Tick)
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(user_report) => report.absorb(user_report),
                Err(e) => {
                    error!(target: ERROR_TARGET, error = %e, "User reconciliation task failed");
                    report.failed += 1;
                }
            }
        }

        match self.bypasses.purge_expired(now).await {
            Ok(purged) => report.purged_bypasses = purged,
            Err(e) => error!(target: ERROR_TARGET, error = %e, "Failed to purge expired bypasses"),
        }

        if report.is_quiet() {
            debug!(target: ENFORCER_TARGET, users = report.users, "Enforcement tick finished");
        } else {
            info!(
                target: ENFORCER_TARGET,
                users = report.users,
                applied = report.applied,
                lifted = report.lifted,
                failed = report.failed,
                "Enforcement tick finished"
            );
        }
        report
    }

    /// Reconcile a single user at `now` using the rows already in memory
    ///
    /// # Errors
    /// Returns a configuration error if no token or a bad timezone is set
    pub async fn check_user(&self, user_id: u64, now: DateTime<Utc>) -> EnforcementResult<UserReport> {
        self.check_user_with(user_id, now, Trigger::Tick).await
    }

    async fn check_user_with(
        &self,
        user_id: u64,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> EnforcementResult<UserReport> {
        let ctx = self.context(now)?;
        let snapshot = self.data.snapshot();
        Ok(self.reconcile_user(user_id, &snapshot, &ctx, trigger).await)
    }

    async fn reconcile_user(
        &self,
        user_id: u64,
        snapshot: &DataSnapshot,
        ctx: &TickContext,
        trigger: Trigger,
    ) -> UserReport {
        let _guard = self.locks.lock(user_id).await;
        let mut report = UserReport::default();

        let user = snapshot.users.get(&user_id);
        let bypassed = self.bypasses.get_active(user_id, ctx.now).is_some();
        let assigned = snapshot.rules_for(user_id);

        let mut rule_ids: BTreeSet<u64> = assigned.clone();
        rule_ids.extend(self.tracker.for_user(user_id).iter().map(|r| r.rule_id));

        let mut lifts = Vec::new();
        let mut pushes: Vec<(&User, &Rule, Trigger)> = Vec::new();
        let mut held: Vec<(&User, &Rule)> = Vec::new();

        for rule_id in rule_ids {
            let key = PairKey::new(user_id, rule_id);
            let desired = desired_state(
                user,
                snapshot.rules.get(&rule_id),
                assigned.contains(&rule_id),
                bypassed,
                &ctx.civil,
            );
            match (desired, self.tracker.get(key)) {
                (Desired::Release(reason), Some(record)) => lifts.push((record, reason)),
                (Desired::Release(_), None) => {}
                (Desired::Enforce(user, rule), None) => pushes.push((user, rule, trigger)),
                (Desired::Enforce(user, rule), Some(_)) => held.push((user, rule)),
            }
        }

        let mut lifted_any = false;
        for (record, reason) in lifts {
            if self.lift(&record, reason, ctx).await {
                lifted_any = true;
                report.lifted += 1;
            } else {
                report.failed += 1;
            }
        }

        // The remote filter is per account, so the last write wins. Re-push
        // held rules that a clear wiped out or that outrank a new push.
        if !held.is_empty() && (lifted_any || !pushes.is_empty()) {
            let lowest_new = pushes
                .iter()
                .map(|(_, rule, _)| (rule.priority, rule.id))
                .min();
            for (user, rule) in held {
                if lifted_any {
                    pushes.push((user, rule, Trigger::OverlapLifted));
                } else if lowest_new.is_some_and(|lowest| (rule.priority, rule.id) > lowest) {
                    pushes.push((user, rule, Trigger::PriorityOrder));
                }
            }
        }

        pushes.sort_by_key(|(_, rule, _)| (rule.priority, rule.id));
        for (user, rule, trigger) in pushes {
            match self.apply(user, rule, trigger, ctx).await {
                Some(true) => report.applied += 1,
                Some(false) => {
                    report.failed += 1;
                    if trigger.is_repush() {
                        self.forget_overwritten(user, rule).await;
                    }
                }
                None => {}
            }
        }

        report
    }

    /// Push `rule`'s filters to `user`; `None` when the rule restricts nothing
    async fn apply(&self, user: &User, rule: &Rule, trigger: Trigger, ctx: &TickContext) -> Option<bool> {
        let filters = rule.ratings.compile();
        if filters.is_empty() {
            debug!(
                target: ENFORCER_TARGET,
                user = %user.username,
                rule = %rule.name,
                "Rule has no ratings, nothing to apply"
            );
            return None;
        }

        if let Err(e) = self
            .client
            .apply_filter(&user.remote_id, &filters, &ctx.token)
            .await
        {
            error!(
                target: ERROR_TARGET,
                user = %user.username,
                rule = %rule.name,
                error = %e,
                "Failed to apply restriction"
            );
            return Some(false);
        }

        let key = PairKey::new(user.id, rule.id);
        let record = AppliedRestriction::new(key, &user.remote_id, &user.username, &rule.name, ctx.now);
        if let Err(e) = self.tracker.mark_applied(record).await {
            error!(target: ERROR_TARGET, pair = %key, error = %e, "Failed to persist applied state");
        }

        info!(
            target: ENFORCER_TARGET,
            user = %user.username,
            rule = %rule.name,
            movie = %filters.movie,
            tv = %filters.tv,
            "Restriction applied"
        );
        self.record(ActivityEntry::new(
            &user.username,
            Some(rule.name.clone()),
            ActivityAction::RuleApplied,
            format!("{}{}", rule.ratings.describe(), trigger.suffix()),
            ctx.now,
        ))
        .await;
        Some(true)
    }

    /// Drop the applied record of a held pair whose filter is no longer on
    /// the account, so the next pass pushes it as a fresh apply
    async fn forget_overwritten(&self, user: &User, rule: &Rule) {
        let key = PairKey::new(user.id, rule.id);
        if let Err(e) = self.tracker.clear(key).await {
            error!(target: ERROR_TARGET, pair = %key, error = %e, "Failed to persist applied state");
            return;
        }
        warn!(
            target: ENFORCER_TARGET,
            user = %user.username,
            rule = %rule.name,
            "Re-push failed, restriction will be applied on next tick"
        );
    }

    /// Clear the account behind `record`, returning whether it succeeded
    async fn lift(&self, record: &AppliedRestriction, reason: LiftReason, ctx: &TickContext) -> bool {
        if let Err(e) = self.client.clear_filter(&record.remote_id, &ctx.token).await {
            error!(
                target: ERROR_TARGET,
                user = %record.username,
                rule = %record.rule_name,
                error = %e,
                "Failed to lift restriction"
            );
            return false;
        }

        if let Err(e) = self.tracker.clear(record.key()).await {
            error!(target: ERROR_TARGET, pair = %record.key(), error = %e, "Failed to persist applied state");
        }

        info!(
            target: ENFORCER_TARGET,
            user = %record.username,
            rule = %record.rule_name,
            reason = %reason,
            "Restriction lifted"
        );
        self.record(ActivityEntry::new(
            &record.username,
            Some(record.rule_name.clone()),
            ActivityAction::RestrictionLifted,
            reason.to_string(),
            ctx.now,
        ))
        .await;
        true
    }

    async fn record(&self, entry: ActivityEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.activity.append(entry).await {
            error!(target: ERROR_TARGET, action = %action, error = %e, "Failed to record activity");
        }
    }

    /// Grant a bypass and lift the user's restrictions right away
    ///
    /// If the remote clear fails the applied records are kept and the next
    /// tick lifts them, since a bypassed user is never enforced.
    ///
    /// # Errors
    /// Returns `UserNotFound`, `InvalidBypassDuration`, or a storage error
    /// from the bypass store.
    pub async fn grant_bypass(
        &self,
        user_id: u64,
        minutes: u32,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> EnforcementResult<Bypass> {
        let started = log_action_start("grant_bypass", user_id);
        let result = self.grant_bypass_inner(user_id, minutes, created_by, now).await;
        match &result {
            Ok(_) => log_action_end("grant_bypass", user_id, started),
            Err(e) => log_action_error("grant_bypass", user_id, e),
        }
        result
    }

    async fn grant_bypass_inner(
        &self,
        user_id: u64,
        minutes: u32,
        created_by: &str,
        now: DateTime<Utc>,
    ) -> EnforcementResult<Bypass> {
        let user = self
            .data
            .get_user(user_id)
            .ok_or(EnforcementError::UserNotFound(user_id))?;
        let duration = BypassDuration::try_from(minutes)?;

        let _guard = self.locks.lock(user_id).await;
        let bypass = self
            .bypasses
            .grant(user_id, duration.minutes(), created_by, now)
            .await?;

        self.record(ActivityEntry::new(
            &user.username,
            None,
            ActivityAction::BypassGranted,
            format!("Bypass granted for {} by {created_by}", duration.label()),
            now,
        ))
        .await;

        let Some(token) = self.data.admin_token() else {
            warn!(target: ENFORCER_TARGET, user = %user.username, "No admin token, restrictions lift on next tick");
            return Ok(bypass);
        };

        match self.client.clear_filter(&user.remote_id, &token).await {
            Ok(()) => {
                let cleared = self.tracker.clear_user(user_id).await?;
                info!(
                    target: ENFORCER_TARGET,
                    user = %user.username,
                    cleared = cleared.len(),
                    "Restrictions cleared for bypass"
                );
            }
            Err(e) => {
                warn!(
                    target: ENFORCER_TARGET,
                    user = %user.username,
                    error = %e,
                    "Bypass clear failed, restrictions lift on next tick"
                );
            }
        }
        Ok(bypass)
    }

    /// Cancel a user's bypass and re-apply any open rule window at once
    ///
    /// # Errors
    /// Returns a storage error if the bypass store cannot be written
    pub async fn cancel_bypass(&self, user_id: u64, now: DateTime<Utc>) -> EnforcementResult<Option<Bypass>> {
        let started = log_action_start("cancel_bypass", user_id);

        let removed = {
            let _guard = self.locks.lock(user_id).await;
            match self.bypasses.cancel(user_id).await {
                Ok(removed) => removed,
                Err(e) => {
                    log_action_error("cancel_bypass", user_id, &e);
                    return Err(e);
                }
            }
        };

        if removed.is_some() {
            let username = self
                .data
                .get_user(user_id)
                .map_or_else(|| user_id.to_string(), |u| u.username);
            self.record(ActivityEntry::new(
                username,
                None,
                ActivityAction::BypassCancelled,
                "Bypass cancelled",
                now,
            ))
            .await;
        }

        self.reconcile_now(user_id, now, Trigger::BypassCancelled).await;
        log_action_end("cancel_bypass", user_id, started);
        Ok(removed)
    }

    /// Assign a rule and enforce it immediately if its window is open
    ///
    /// # Errors
    /// Returns `UserNotFound`/`RuleNotFound` for unknown ids, or a storage error
    pub async fn assign_rule(&self, user_id: u64, rule_id: u64, now: DateTime<Utc>) -> EnforcementResult<()> {
        let started = log_action_start("assign_rule", user_id);
        if let Err(e) = self.data.assign(user_id, rule_id).await {
            log_action_error("assign_rule", user_id, &e);
            return Err(e);
        }
        self.reconcile_now(user_id, now, Trigger::RuleAssigned).await;
        log_action_end("assign_rule", user_id, started);
        Ok(())
    }

    /// Remove an assignment and lift its restriction immediately
    ///
    /// # Errors
    /// Returns a storage error if the assignments cannot be written
    pub async fn unassign_rule(&self, user_id: u64, rule_id: u64, now: DateTime<Utc>) -> EnforcementResult<()> {
        let started = log_action_start("unassign_rule", user_id);
        if let Err(e) = self.data.unassign(user_id, rule_id).await {
            log_action_error("unassign_rule", user_id, &e);
            return Err(e);
        }
        self.reconcile_now(user_id, now, Trigger::Tick).await;
        log_action_end("unassign_rule", user_id, started);
        Ok(())
    }

    async fn reconcile_now(&self, user_id: u64, now: DateTime<Utc>, trigger: Trigger) {
        if let Err(e) = self.check_user_with(user_id, now, trigger).await {
            warn!(
                target: ENFORCER_TARGET,
                user_id,
                error = %e,
                "Immediate reconciliation skipped, next tick will catch up"
            );
        }
    }

    /// Pairs whose rule window is open at `now`
    ///
    /// # Errors
    /// Returns a configuration error if the timezone is unknown
    pub fn active_restrictions(&self, now: DateTime<Utc>) -> EnforcementResult<Vec<ActiveRestriction>> {
        let civil = CivilTime::resolve(now, parse_timezone(&self.data.timezone())?);
        let snapshot = self.data.snapshot();

        let mut rows: Vec<ActiveRestriction> = snapshot
            .assignments
            .iter()
            .filter_map(|a| {
                let user = snapshot.users.get(&a.user_id)?;
                let rule = snapshot.rules.get(&a.rule_id)?;
                let open = !user.is_admin && rule.is_active && schedule::is_active(rule, &civil);
                open.then(|| ActiveRestriction {
                    user_id: user.id,
                    username: user.username.clone(),
                    rule_id: rule.id,
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    minutes_remaining: rule.schedule.minutes_remaining(&civil),
                    bypassed: self.bypasses.get_active(user.id, now).is_some(),
                    applied: self.tracker.is_applied(PairKey::new(user.id, rule.id)),
                })
            })
            .collect();

        rows.sort_by(|a, b| {
            a.username
                .cmp(&b.username)
                .then(b.priority.cmp(&a.priority))
                .then(a.rule_id.cmp(&b.rule_id))
        });
        Ok(rows)
    }

    /// Ask the running loop to reconcile one user
    ///
    /// # Errors
    /// Returns an error if the loop is not running
    pub async fn request_user_check(&self, user_id: u64) -> EnforcementResult<()> {
        self.send(EnforcementCheckRequest::CheckUser { user_id }).await
    }

    /// Ask the running loop for a full tick
    ///
    /// # Errors
    /// Returns an error if the loop is not running
    pub async fn request_check_all(&self) -> EnforcementResult<()> {
        self.send(EnforcementCheckRequest::CheckAll).await
    }

    async fn send(&self, request: EnforcementCheckRequest) -> EnforcementResult<()> {
        let Some(tx) = &self.tx else {
            return Err(EnforcementError::Other(
                "Enforcement loop is not running".to_string(),
            ));
        };
        tx.send(request).await.map_err(|e| {
            error!(target: ERROR_TARGET, error = %e, "Failed to send enforcement request");
            EnforcementError::Other(format!("Failed to send enforcement request: {e}"))
        })
    }

    /// Spawn the enforcement loop, ticking every `period`
    #[must_use]
    pub fn start(mut self, period: Duration) -> EnforcementHandle {
        let (tx, rx) = mpsc::channel::<EnforcementCheckRequest>(100);
        self.tx = Some(tx.clone());
        let task = tokio::spawn(self.clone().enforcement_task(rx, period));
        EnforcementHandle {
            service: self,
            tx,
            task,
        }
    }

    async fn enforcement_task(self, mut rx: Receiver<EnforcementCheckRequest>, period: Duration) {
        info!(
            target: ENFORCER_TARGET,
            interval_secs = period.as_secs(),
            "Starting enforcement loop"
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(EnforcementCheckRequest::CheckAll) => {
                        debug!(target: ENFORCER_TARGET, "Received request to check all users");
                        self.run_tick(Utc::now()).await;
                    }
                    Some(EnforcementCheckRequest::CheckUser { user_id }) => {
                        debug!(target: ENFORCER_TARGET, user_id, "Received request to check user");
                        if let Err(e) = self.check_user(user_id, Utc::now()).await {
                            warn!(target: ENFORCER_TARGET, user_id, error = %e, "User check skipped");
                        }
                    }
                    Some(EnforcementCheckRequest::Shutdown) | None => {
                        info!(target: ENFORCER_TARGET, "Received shutdown request for enforcement loop");
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.run_tick(Utc::now()).await;
                }
            }
        }

        info!(target: ENFORCER_TARGET, "Enforcement loop shut down");
    }
}

/// Handle to a running enforcement loop
#[derive(Debug)]
pub struct EnforcementHandle {
    service: EnforcementService,
    tx: Sender<EnforcementCheckRequest>,
    task: JoinHandle<()>,
}

impl EnforcementHandle {
    /// Service connected to the running loop
    #[must_use]
    pub const fn service(&self) -> &EnforcementService {
        &self.service
    }

    /// Stop the loop after the current tick and wait for it
    ///
    /// # Errors
    /// Returns an error if the loop task panicked
    pub async fn shutdown(self) -> EnforcementResult<()> {
        // A closed channel means the loop already stopped
        let _ = self.tx.send(EnforcementCheckRequest::Shutdown).await;
        self.task
            .await
            .map_err(|e| EnforcementError::Other(format!("Enforcement loop failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::activity::MemoryActivityLog;
    use crate::enforcement::client::MockRestrictionClient;
    use crate::enforcement::schedule::{DaySet, Schedule, TimeOfDay};
    use crate::enforcement::{CompiledFilters, EnforcementState, RatingPolicy};
    use chrono::TimeZone;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Apply { remote_id: String, movie: String, tv: String },
        Clear { remote_id: String },
    }

    #[derive(Debug, Default)]
    struct RecordingClient {
        calls: StdMutex<Vec<Call>>,
        fail: AtomicBool,
        fail_apply: AtomicBool,
    }

    impl RecordingClient {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn reset(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Fail only apply calls, clears keep succeeding
        fn set_apply_failing(&self, fail: bool) {
            self.fail_apply.store(fail, Ordering::SeqCst);
        }

        fn outcome(&self, remote_id: &str, failing: bool) -> EnforcementResult<()> {
            if failing || self.fail.load(Ordering::SeqCst) {
                Err(EnforcementError::RemoteStatus {
                    status: 503,
                    account: remote_id.to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl RestrictionClient for RecordingClient {
        async fn apply_filter(
            &self,
            remote_id: &str,
            filters: &CompiledFilters,
            _token: &str,
        ) -> EnforcementResult<()> {
            self.calls.lock().unwrap().push(Call::Apply {
                remote_id: remote_id.to_string(),
                movie: filters.movie.to_string(),
                tv: filters.tv.to_string(),
            });
            self.outcome(remote_id, self.fail_apply.load(Ordering::SeqCst))
        }

        async fn clear_filter(&self, remote_id: &str, _token: &str) -> EnforcementResult<()> {
            self.calls.lock().unwrap().push(Call::Clear {
                remote_id: remote_id.to_string(),
            });
            self.outcome(remote_id, false)
        }
    }

    struct Fixture {
        service: EnforcementService,
        client: Arc<RecordingClient>,
        log: Arc<MemoryActivityLog>,
    }

    /// Monday 2024-01-01 at `hour:minute` UTC
    fn monday(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, minute, 0).unwrap()
    }

    fn window(start: &str, end: &str) -> Schedule {
        Schedule::new(DaySet::All, start.parse().unwrap(), end.parse().unwrap())
    }

    fn bedtime() -> Rule {
        Rule {
            id: 1,
            name: "Bedtime".to_string(),
            is_active: true,
            schedule: window("20:00", "06:00"),
            ratings: RatingPolicy {
                movie_blocked: "R,NC-17".to_string(),
                tv_blocked: "TV-MA".to_string(),
                ..Default::default()
            },
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
            priority: 0,
        }
    }

    fn kid() -> User {
        User {
            id: 10,
            remote_id: "8812".to_string(),
            username: "kid".to_string(),
            email: None,
            is_admin: false,
            is_home: true,
            is_restricted: true,
            deactivated: false,
        }
    }

    fn data_with(users: Vec<User>, rules: Vec<Rule>, assignments: &[(u64, u64)]) -> Data {
        let data = Data::new();
        data.set_setting(crate::data::ADMIN_TOKEN_KEY, "tok");
        data.set_setting(crate::data::TIMEZONE_KEY, "UTC");
        for user in users {
            data.upsert_user(user);
        }
        for rule in rules {
            data.upsert_rule(rule);
        }
        for (user_id, rule_id) in assignments {
            data.assignments
                .insert(crate::data::Assignment::new(*user_id, *rule_id));
        }
        data
    }

    fn fixture(data: Data) -> Fixture {
        let client = Arc::new(RecordingClient::default());
        let log = Arc::new(MemoryActivityLog::new());
        let service = EnforcementService::new(data, client.clone(), log.clone());
        Fixture { service, client, log }
    }

    fn default_fixture() -> Fixture {
        fixture(data_with(vec![kid()], vec![bedtime()], &[(10, 1)]))
    }

    #[tokio::test]
    async fn test_end_to_end_apply_then_lift() {
        let f = default_fixture();
        let key = PairKey::new(10, 1);

        let report = f.service.run_tick(monday(21, 0)).await;
        assert_eq!(report.applied, 1);
        assert_eq!(
            f.client.calls(),
            vec![Call::Apply {
                remote_id: "8812".to_string(),
                movie: "contentRating!=R,NC-17,TV-MA".to_string(),
                tv: "contentRating!=TV-MA".to_string(),
            }]
        );
        let applied = f.log.of_kind(&ActivityAction::RuleApplied);
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].details, "Movies blocked: R,NC-17,TV-MA | TV blocked: TV-MA");
        assert_eq!(f.service.tracker().state(key), EnforcementState::Applied);

        f.client.reset();
        let report = f.service.run_tick(Utc.with_ymd_and_hms(2024, 1, 2, 7, 0, 0).unwrap()).await;
        assert_eq!(report.lifted, 1);
        assert_eq!(
            f.client.calls(),
            vec![Call::Clear {
                remote_id: "8812".to_string()
            }]
        );
        let lifted = f.log.of_kind(&ActivityAction::RestrictionLifted);
        assert_eq!(lifted.len(), 1);
        assert_eq!(lifted[0].details, "Rule time window ended");
        assert_eq!(f.service.tracker().state(key), EnforcementState::NotApplied);
    }

    #[tokio::test]
    async fn test_steady_state_is_idempotent() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;
        let calls = f.client.calls().len();
        let entries = f.log.entries().len();

        let report = f.service.run_tick(monday(22, 0)).await;
        assert!(report.is_quiet());
        assert_eq!(f.client.calls().len(), calls);
        assert_eq!(f.log.entries().len(), entries);

        // Same for pairs that stay not applied
        let f = default_fixture();
        f.service.run_tick(monday(12, 0)).await;
        f.service.run_tick(monday(13, 0)).await;
        assert!(f.client.calls().is_empty());
        assert!(f.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_bypass_suppresses_apply() {
        let f = default_fixture();
        f.service.bypasses().grant(10, 60, "admin", monday(20, 30)).await.unwrap();

        f.service.run_tick(monday(21, 0)).await;
        assert!(f.client.calls().is_empty());
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 1)));
    }

    #[tokio::test]
    async fn test_bypass_lifts_applied_pair_on_tick() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;
        f.client.reset();

        // Granted directly in the store so the next tick does the lifting
        f.service.bypasses().grant(10, 30, "admin", monday(21, 5)).await.unwrap();
        f.service.run_tick(monday(21, 10)).await;

        assert_eq!(f.client.calls(), vec![Call::Clear { remote_id: "8812".to_string() }]);
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 1)));
        assert_eq!(
            f.log.of_kind(&ActivityAction::RestrictionLifted)[0].details,
            "Bypass active"
        );

        // Bypass expires, rule comes back
        f.client.reset();
        f.service.run_tick(monday(21, 40)).await;
        assert!(matches!(f.client.calls()[..], [Call::Apply { .. }]));
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));
    }

    #[tokio::test]
    async fn test_admin_is_never_enforced() {
        let admin = User {
            is_admin: true,
            ..kid()
        };
        let f = fixture(data_with(vec![admin], vec![bedtime()], &[(10, 1)]));

        for hour in [20, 21, 23] {
            f.service.run_tick(monday(hour, 0)).await;
        }
        assert!(f.client.calls().is_empty());
        assert!(f.service.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_failed_apply_is_retried() {
        let f = default_fixture();
        f.client.set_failing(true);

        let report = f.service.run_tick(monday(21, 0)).await;
        assert_eq!(report.failed, 1);
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 1)));
        assert!(f.log.entries().is_empty());

        f.client.set_failing(false);
        let report = f.service.run_tick(monday(21, 1)).await;
        assert_eq!(report.applied, 1);
        assert_eq!(f.client.calls().len(), 2);
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));
    }

    #[tokio::test]
    async fn test_failed_clear_stays_applied() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;

        f.client.set_failing(true);
        f.service.run_tick(monday(12, 0)).await;
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));

        f.client.set_failing(false);
        f.service.run_tick(monday(12, 1)).await;
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 1)));
    }

    #[tokio::test]
    async fn test_missing_token_skips_tick() {
        let f = default_fixture();
        f.service.data().settings.remove(crate::data::ADMIN_TOKEN_KEY);

        // Only meaningful when the environment fallback is unset
        if std::env::var("PLEX_ADMIN_TOKEN").is_err() {
            let report = f.service.run_tick(monday(21, 0)).await;
            assert!(report.skipped.is_some());
            assert!(f.client.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn test_bad_timezone_skips_tick() {
        let f = default_fixture();
        f.service.data().set_setting(crate::data::TIMEZONE_KEY, "Mars/Olympus");

        let report = f.service.run_tick(monday(21, 0)).await;
        assert!(report.skipped.unwrap().contains("Mars/Olympus"));
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_or_removed_rule_is_lifted() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;

        f.service.data().upsert_rule(Rule {
            is_active: false,
            ..bedtime()
        });
        f.service.run_tick(monday(21, 1)).await;
        assert_eq!(
            f.log.of_kind(&ActivityAction::RestrictionLifted)[0].details,
            "Rule disabled"
        );

        f.service.data().upsert_rule(bedtime());
        f.service.run_tick(monday(21, 2)).await;
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));

        f.service.data().rules.remove(&1);
        f.service.run_tick(monday(21, 3)).await;
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 1)));
        assert_eq!(
            f.log.of_kind(&ActivityAction::RestrictionLifted)[1].details,
            "Rule no longer exists"
        );
    }

    #[tokio::test]
    async fn test_rule_without_ratings_is_not_applied() {
        let rule = Rule {
            ratings: RatingPolicy::default(),
            ..bedtime()
        };
        let f = fixture(data_with(vec![kid()], vec![rule], &[(10, 1)]));

        let report = f.service.run_tick(monday(21, 0)).await;
        assert!(report.is_quiet());
        assert!(f.client.calls().is_empty());
        assert!(f.log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_rules_apply_in_priority_order() {
        let evening = Rule {
            id: 2,
            name: "Evening".to_string(),
            schedule: window("18:00", "22:00"),
            ratings: RatingPolicy {
                tv_blocked: "TV-14".to_string(),
                ..Default::default()
            },
            priority: 5,
            ..bedtime()
        };
        let f = fixture(data_with(
            vec![kid()],
            vec![bedtime(), evening],
            &[(10, 1), (10, 2)],
        ));

        f.service.run_tick(monday(21, 0)).await;
        let calls = f.client.calls();
        assert_eq!(calls.len(), 2);
        // Highest priority written last
        assert!(matches!(&calls[1], Call::Apply { tv, .. } if tv == "contentRating!=TV-14"));

        // Evening ends: its clear wipes the account, so bedtime is re-pushed
        f.client.reset();
        f.service.run_tick(monday(22, 30)).await;
        let calls = f.client.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], Call::Clear { .. }));
        assert!(matches!(&calls[1], Call::Apply { movie, .. } if movie == "contentRating!=R,NC-17,TV-MA"));
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 2)));

        let reapplied = f.log.of_kind(&ActivityAction::RuleApplied);
        assert!(reapplied.last().unwrap().details.ends_with("(re-applied after overlapping restriction lifted)"));
    }

    #[tokio::test]
    async fn test_failed_overlap_repush_is_retried() {
        let evening = Rule {
            id: 2,
            name: "Evening".to_string(),
            schedule: window("18:00", "22:00"),
            ratings: RatingPolicy {
                tv_blocked: "TV-14".to_string(),
                ..Default::default()
            },
            priority: 5,
            ..bedtime()
        };
        let f = fixture(data_with(
            vec![kid()],
            vec![bedtime(), evening],
            &[(10, 1), (10, 2)],
        ));
        f.service.run_tick(monday(21, 0)).await;

        // Evening's clear goes through, bedtime's re-push does not
        f.client.set_apply_failing(true);
        let report = f.service.run_tick(monday(22, 30)).await;
        assert_eq!(report.lifted, 1);
        assert_eq!(report.failed, 1);
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 1)));
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 2)));

        f.client.set_apply_failing(false);
        f.client.reset();
        let report = f.service.run_tick(monday(22, 31)).await;
        assert_eq!(report.applied, 1);
        assert!(matches!(
            &f.client.calls()[..],
            [Call::Apply { movie, .. }] if movie == "contentRating!=R,NC-17,TV-MA"
        ));
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));

        f.client.reset();
        assert!(f.service.run_tick(monday(23, 0)).await.is_quiet());
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_priority_repush_is_retried() {
        let strict = Rule {
            id: 2,
            name: "Strict".to_string(),
            schedule: window("00:00", "23:59"),
            ratings: RatingPolicy {
                movie_allowed: "G".to_string(),
                ..Default::default()
            },
            priority: 9,
            ..bedtime()
        };
        let f = fixture(data_with(
            vec![kid()],
            vec![bedtime(), strict],
            &[(10, 1), (10, 2)],
        ));
        f.service.run_tick(monday(12, 0)).await;
        assert!(f.service.tracker().is_applied(PairKey::new(10, 2)));

        // Bedtime opens below strict, both pushes fail
        f.client.set_apply_failing(true);
        let report = f.service.run_tick(monday(21, 0)).await;
        assert_eq!(report.failed, 2);
        assert!(!f.service.tracker().is_applied(PairKey::new(10, 2)));

        f.client.set_apply_failing(false);
        f.client.reset();
        let report = f.service.run_tick(monday(21, 1)).await;
        assert_eq!(report.applied, 2);
        let calls = f.client.calls();
        assert!(matches!(&calls[0], Call::Apply { movie, .. } if movie == "contentRating!=R,NC-17,TV-MA"));
        assert!(matches!(&calls[1], Call::Apply { movie, .. } if movie == "contentRating=G"));
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));
        assert!(f.service.tracker().is_applied(PairKey::new(10, 2)));
    }

    #[tokio::test]
    async fn test_new_lower_priority_rule_keeps_higher_on_top() {
        let strict = Rule {
            id: 2,
            name: "Strict".to_string(),
            schedule: window("00:00", "23:59"),
            ratings: RatingPolicy {
                movie_allowed: "G".to_string(),
                ..Default::default()
            },
            priority: 9,
            ..bedtime()
        };
        let f = fixture(data_with(
            vec![kid()],
            vec![bedtime(), strict],
            &[(10, 1), (10, 2)],
        ));

        f.service.run_tick(monday(12, 0)).await;
        assert_eq!(f.client.calls().len(), 1);

        f.client.reset();
        f.service.run_tick(monday(21, 0)).await;
        let calls = f.client.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[1], Call::Apply { movie, .. } if movie == "contentRating=G"));
    }

    #[tokio::test]
    async fn test_unknown_user_pair_is_cleaned_up() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;

        f.service.data().users.remove(&10);
        f.service.run_tick(monday(21, 1)).await;
        assert!(f.service.tracker().is_empty());
        assert_eq!(
            f.log.of_kind(&ActivityAction::RestrictionLifted)[0].details,
            "User no longer exists"
        );
    }

    #[tokio::test]
    async fn test_grant_bypass_clears_immediately() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;
        f.client.reset();

        let bypass = f.service.grant_bypass(10, 30, "admin", monday(21, 5)).await.unwrap();
        assert_eq!(bypass.minutes, 30);
        assert_eq!(f.client.calls(), vec![Call::Clear { remote_id: "8812".to_string() }]);
        assert!(f.service.tracker().is_empty());

        let granted = f.log.of_kind(&ActivityAction::BypassGranted);
        assert_eq!(granted[0].details, "Bypass granted for 30 minutes by admin");

        // Following tick has nothing to do
        f.client.reset();
        f.service.run_tick(monday(21, 10)).await;
        assert!(f.client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_grant_bypass_failed_clear_converges_on_tick() {
        let f = default_fixture();
        f.service.run_tick(monday(21, 0)).await;

        f.client.set_failing(true);
        f.service.grant_bypass(10, 15, "admin", monday(21, 5)).await.unwrap();
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));

        f.client.set_failing(false);
        f.service.run_tick(monday(21, 6)).await;
        assert!(f.service.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_grant_bypass_rejects_invalid_duration() {
        let f = default_fixture();
        let result = f.service.grant_bypass(10, 45, "admin", monday(21, 0)).await;
        assert!(matches!(result, Err(EnforcementError::InvalidBypassDuration(45))));
        assert!(f.log.entries().is_empty());

        let result = f.service.grant_bypass(99, 30, "admin", monday(21, 0)).await;
        assert!(matches!(result, Err(EnforcementError::UserNotFound(99))));
    }

    #[tokio::test]
    async fn test_cancel_bypass_reapplies_immediately() {
        let f = default_fixture();
        f.service.grant_bypass(10, 60, "admin", monday(21, 0)).await.unwrap();
        f.client.reset();

        let removed = f.service.cancel_bypass(10, monday(21, 10)).await.unwrap();
        assert!(removed.is_some());
        assert!(matches!(f.client.calls()[..], [Call::Apply { .. }]));
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));

        let applied = f.log.of_kind(&ActivityAction::RuleApplied);
        assert!(applied[0].details.ends_with("(bypass cancelled, re-applied immediately)"));
        assert_eq!(f.log.of_kind(&ActivityAction::BypassCancelled).len(), 1);

        // Nothing to cancel the second time
        assert!(f.service.cancel_bypass(10, monday(21, 11)).await.unwrap().is_none());
        assert_eq!(f.log.of_kind(&ActivityAction::BypassCancelled).len(), 1);
    }

    #[tokio::test]
    async fn test_assign_and_unassign_act_immediately() {
        let f = fixture(data_with(vec![kid()], vec![bedtime()], &[]));

        f.service.assign_rule(10, 1, monday(21, 0)).await.unwrap();
        assert!(f.service.tracker().is_applied(PairKey::new(10, 1)));
        let applied = f.log.of_kind(&ActivityAction::RuleApplied);
        assert!(applied[0].details.ends_with("(rule assigned, applied immediately)"));

        f.service.unassign_rule(10, 1, monday(21, 5)).await.unwrap();
        assert!(f.service.tracker().is_empty());
        assert_eq!(
            f.log.of_kind(&ActivityAction::RestrictionLifted)[0].details,
            "Rule unassigned"
        );

        let result = f.service.assign_rule(10, 99, monday(21, 5)).await;
        assert!(matches!(result, Err(EnforcementError::RuleNotFound(99))));
    }

    #[tokio::test]
    async fn test_active_restrictions_view() {
        let weekend = Rule {
            id: 3,
            name: "Weekend".to_string(),
            schedule: Schedule::new(
                DaySet::of(&[crate::enforcement::schedule::Weekday::Sat]),
                TimeOfDay::from_hm(0, 0).unwrap(),
                TimeOfDay::from_hm(23, 0).unwrap(),
            ),
            ..bedtime()
        };
        let late = Rule {
            id: 2,
            name: "Late".to_string(),
            priority: 3,
            ..bedtime()
        };
        let f = fixture(data_with(
            vec![kid()],
            vec![bedtime(), late, weekend],
            &[(10, 1), (10, 2), (10, 3)],
        ));
        f.service.bypasses().grant(10, 15, "admin", monday(21, 0)).await.unwrap();

        let rows = f.service.active_restrictions(monday(21, 0)).unwrap();
        let ids: Vec<u64> = rows.iter().map(|r| r.rule_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(rows[0].minutes_remaining, 9 * 60);
        assert!(rows[0].bypassed);
        assert!(!rows[0].applied);
    }

    #[test]
    fn test_desired_state_reasons() {
        let at = CivilTime::resolve(monday(21, 0), chrono_tz::Tz::UTC);
        let user = kid();
        let rule = bedtime();

        assert!(matches!(
            desired_state(Some(&user), Some(&rule), true, false, &at),
            Desired::Enforce(..)
        ));
        assert_eq!(
            desired_state(Some(&user), Some(&rule), false, false, &at),
            Desired::Release(LiftReason::Unassigned)
        );
        assert_eq!(
            desired_state(Some(&user), Some(&rule), true, true, &at),
            Desired::Release(LiftReason::BypassActive)
        );
        let gone = User {
            deactivated: true,
            ..kid()
        };
        assert_eq!(
            desired_state(Some(&gone), Some(&rule), true, false, &at),
            Desired::Release(LiftReason::Deactivated)
        );
        let noon = CivilTime::resolve(monday(12, 0), chrono_tz::Tz::UTC);
        assert_eq!(
            desired_state(Some(&user), Some(&rule), true, false, &noon),
            Desired::Release(LiftReason::WindowEnded)
        );
    }

    #[tokio::test]
    async fn test_mock_client_call_counts() {
        let mut mock = MockRestrictionClient::new();
        mock.expect_apply_filter()
            .withf(|remote_id, filters, token| {
                remote_id.to_string() == "8812" && token.to_string() == "tok" && !filters.is_empty()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        mock.expect_clear_filter().times(0);

        let data = data_with(vec![kid()], vec![bedtime()], &[(10, 1)]);
        let service = EnforcementService::new(data, Arc::new(mock), Arc::new(MemoryActivityLog::new()));

        service.run_tick(monday(21, 0)).await;
        service.run_tick(monday(21, 1)).await;
        service.run_tick(monday(23, 59)).await;
    }

    #[tokio::test]
    async fn test_many_users_are_reconciled() {
        let users: Vec<User> = (0..12)
            .map(|i| User {
                id: 100 + i,
                remote_id: format!("r{i}"),
                username: format!("kid{i}"),
                ..kid()
            })
            .collect();
        let assignments: Vec<(u64, u64)> = (0..12).map(|i| (100 + i, 1)).collect();
        let f = fixture(data_with(users, vec![bedtime()], &assignments));
        let service = f.service.clone().with_max_concurrency(3);

        let report = service.run_tick(monday(21, 0)).await;
        assert_eq!(report.users, 12);
        assert_eq!(report.applied, 12);
        assert_eq!(service.tracker().len(), 12);
    }

    #[tokio::test]
    async fn test_loop_handles_requests_and_shutdown() {
        let f = default_fixture();
        let handle = f.service.clone().start(Duration::from_secs(3600));

        handle.service().request_check_all().await.unwrap();
        handle.service().request_user_check(10).await.unwrap();
        handle.shutdown().await.unwrap();

        assert!(f.service.request_user_check(10).await.is_err());
    }
}
