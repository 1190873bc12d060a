//! Per-entity quotas.
//!
//! Each [`BudgetAccount`] holds a period limit, a per-action limit and the
//! balance left in the current period. [`BudgetTracker::check_and_deduct`]
//! runs as one store update: reset if a period boundary passed, check both
//! limits, deduct, record usage. Two concurrent deductions against the same
//! account are serialized by the store, so the balance never goes negative.
//!
//! Period boundaries come from [`ResetPolicy`] and are computed lazily on
//! access; nothing needs to run at midnight.

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoOpSink};
use crate::clock::Clock;
use crate::error::{Error, ReasonCode, Result, Verdict};
use crate::identity::EntityId;
use crate::store::BudgetStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Default budget period: one day.
pub const DEFAULT_PERIOD_SECS: u64 = 86_400;

/// Default usage history retention: seven days.
pub const DEFAULT_HISTORY_RETENTION_SECS: i64 = 7 * 86_400;

/// Default utilization alert thresholds, in percent.
pub const DEFAULT_ALERT_THRESHOLDS: [u8; 3] = [80, 90, 100];

/// Undrained alerts kept in memory; the oldest are dropped beyond this.
pub const DEFAULT_PENDING_ALERT_LIMIT: usize = 1024;

/// When an account's balance returns to its period limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Boundaries at whole multiples of the period since the Unix epoch. A
    /// one-day period resets at UTC midnight.
    FixedUtc { period_secs: u64 },
    /// Boundaries at whole multiples of the period since account creation.
    Rolling { period_secs: u64 },
}

impl Default for ResetPolicy {
    fn default() -> Self {
        ResetPolicy::FixedUtc {
            period_secs: DEFAULT_PERIOD_SECS,
        }
    }
}

impl ResetPolicy {
    pub fn period_secs(&self) -> u64 {
        match self {
            ResetPolicy::FixedUtc { period_secs } | ResetPolicy::Rolling { period_secs } => {
                *period_secs
            }
        }
    }

    fn period_ms(&self) -> i64 {
        i64::try_from(self.period_secs().max(1))
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000)
    }

    /// Start of the first period for an account created at `now`.
    pub fn initial_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            ResetPolicy::FixedUtc { .. } => {
                let ms = now.timestamp_millis();
                let aligned = ms - ms.rem_euclid(self.period_ms());
                DateTime::from_timestamp_millis(aligned).unwrap_or(now)
            }
            ResetPolicy::Rolling { .. } => now,
        }
    }

    /// Start of the period containing `now`, for an account whose current
    /// period began at `current`. Never moves backwards.
    pub fn period_start(&self, current: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        if now <= current {
            return current;
        }
        let next = match self {
            ResetPolicy::FixedUtc { .. } => self.initial_start(now),
            ResetPolicy::Rolling { .. } => {
                let period = self.period_ms();
                let elapsed = (now - current).num_milliseconds();
                let whole = elapsed - elapsed.rem_euclid(period);
                current + Duration::milliseconds(whole)
            }
        };
        next.max(current)
    }
}

/// One deduction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub at: DateTime<Utc>,
    pub amount: u64,
    pub balance_after: u64,
}

/// Quota state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAccount {
    pub entity: EntityId,
    pub period_limit: u64,
    pub per_action_limit: u64,
    pub available: u64,
    pub period_start: DateTime<Utc>,
    pub history: VecDeque<UsageEntry>,
    /// Alert thresholds already fired this period.
    pub fired_alerts: BTreeSet<u8>,
}

impl BudgetAccount {
    pub fn used(&self) -> u64 {
        self.period_limit.saturating_sub(self.available)
    }

    /// Move to the period containing `now`, restoring the balance if a
    /// boundary passed. Returns true on reset.
    fn roll(&mut self, policy: &ResetPolicy, now: DateTime<Utc>) -> bool {
        let start = policy.period_start(self.period_start, now);
        if start == self.period_start {
            return false;
        }
        self.period_start = start;
        self.available = self.period_limit;
        self.fired_alerts.clear();
        true
    }

    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.history.len();
        while self.history.front().is_some_and(|e| e.at < cutoff) {
            self.history.pop_front();
        }
        before - self.history.len()
    }

    /// Thresholds newly crossed by the current utilization.
    fn crossed(&mut self, thresholds: &[u8]) -> Vec<u8> {
        let used = u128::from(self.used());
        let limit = u128::from(self.period_limit);
        let mut crossed = Vec::new();
        for &t in thresholds {
            if used * 100 >= u128::from(t) * limit && self.fired_alerts.insert(t) {
                crossed.push(t);
            }
        }
        crossed
    }
}

/// Result of a successful deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Deduction {
    pub amount: u64,
    pub remaining: u64,
    pub period_start: DateTime<Utc>,
}

/// A utilization threshold crossing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetAlert {
    pub entity: EntityId,
    /// Percent of the period limit.
    pub threshold: u8,
    pub used: u64,
    pub limit: u64,
    pub at: DateTime<Utc>,
}

/// Tracks and enforces budgets.
#[derive(Debug)]
pub struct BudgetTracker {
    store: Arc<dyn BudgetStore>,
    clock: Arc<dyn Clock>,
    policy: ResetPolicy,
    defaults: Option<(u64, u64)>,
    retention: Duration,
    thresholds: Vec<u8>,
    alerts: Mutex<VecDeque<BudgetAlert>>,
    alert_limit: usize,
    audit: Arc<dyn AuditSink>,
}

impl BudgetTracker {
    pub fn new(store: Arc<dyn BudgetStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            policy: ResetPolicy::default(),
            defaults: None,
            retention: Duration::seconds(DEFAULT_HISTORY_RETENTION_SECS),
            thresholds: DEFAULT_ALERT_THRESHOLDS.to_vec(),
            alerts: Mutex::new(VecDeque::new()),
            alert_limit: DEFAULT_PENDING_ALERT_LIMIT,
            audit: Arc::new(NoOpSink),
        }
    }

    pub fn with_reset_policy(mut self, policy: ResetPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create accounts on first use with these limits.
    pub fn with_default_limits(mut self, period_limit: u64, per_action_limit: u64) -> Self {
        self.defaults = Some((period_limit, per_action_limit));
        self
    }

    pub fn with_history_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_alert_thresholds(mut self, thresholds: Vec<u8>) -> Self {
        let mut thresholds = thresholds;
        thresholds.sort_unstable();
        thresholds.dedup();
        self.thresholds = thresholds;
        self
    }

    /// Cap on undrained alerts. Every alert still reaches the audit sink.
    pub fn with_pending_alert_limit(mut self, limit: usize) -> Self {
        self.alert_limit = limit;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.policy
    }

    pub fn create_account(
        &self,
        entity: &EntityId,
        period_limit: u64,
        per_action_limit: u64,
    ) -> Result<BudgetAccount> {
        let account = self.new_account(entity, period_limit, per_action_limit)?;
        if !self.store.insert(account.clone())? {
            return Err(Error::DuplicateAccount(entity.to_string()));
        }
        self.created(&account);
        Ok(account)
    }

    fn new_account(
        &self,
        entity: &EntityId,
        period_limit: u64,
        per_action_limit: u64,
    ) -> Result<BudgetAccount> {
        if period_limit == 0 || per_action_limit == 0 {
            return Err(Error::InvalidLimits("limits must be positive".into()));
        }
        if per_action_limit > period_limit {
            return Err(Error::InvalidLimits(format!(
                "per-action limit {} exceeds period limit {}",
                per_action_limit, period_limit
            )));
        }
        Ok(BudgetAccount {
            entity: entity.clone(),
            period_limit,
            per_action_limit,
            available: period_limit,
            period_start: self.policy.initial_start(self.clock.now()),
            history: VecDeque::new(),
            fired_alerts: BTreeSet::new(),
        })
    }

    fn created(&self, account: &BudgetAccount) {
        info!(
            entity = %account.entity,
            period_limit = account.period_limit,
            per_action_limit = account.per_action_limit,
            "Budget account created"
        );
        self.audit.event(
            AuditEvent::new(
                AuditEventType::BudgetAccountCreated,
                account.entity.as_str(),
                self.clock.now(),
            )
            .with_details(format!(
                "period limit {}, per-action limit {}",
                account.period_limit, account.per_action_limit
            )),
        );
    }

    /// Create the account from the configured defaults if it is missing.
    fn ensure_account(&self, entity: &EntityId) -> Result<()> {
        let Some((period_limit, per_action_limit)) = self.defaults else {
            return Ok(());
        };
        if self.store.get(entity)?.is_some() {
            return Ok(());
        }
        let account = self.new_account(entity, period_limit, per_action_limit)?;
        if self.store.insert(account.clone())? {
            self.created(&account);
        }
        Ok(())
    }

    /// Atomically check both limits and deduct `amount`.
    pub fn check_and_deduct(&self, entity: &EntityId, amount: u64) -> Result<Verdict<Deduction>> {
        if amount == 0 {
            return Err(Error::InvalidAmount("amount must be positive".into()));
        }
        self.ensure_account(entity)?;

        let now = self.clock.now();
        let cutoff = now - self.retention;
        let policy = self.policy;
        let thresholds = &self.thresholds;
        let mut outcome: Verdict<Deduction> = Err(ReasonCode::BudgetExceeded);
        let mut crossed = Vec::new();
        let mut limits = (0, 0);

        let found = self.store.update(entity, &mut |account: &mut BudgetAccount| {
            if account.roll(&policy, now) {
                debug!(entity = %account.entity, period_start = %account.period_start, "Budget period reset");
            }
            account.prune(cutoff);

            if amount > account.per_action_limit || amount > account.available {
                outcome = Err(ReasonCode::BudgetExceeded);
                limits = (account.per_action_limit, account.available);
                return Ok(());
            }

            account.available -= amount;
            account.history.push_back(UsageEntry {
                at: now,
                amount,
                balance_after: account.available,
            });
            crossed = account
                .crossed(thresholds)
                .into_iter()
                .map(|t| (t, account.used(), account.period_limit))
                .collect();
            outcome = Ok(Deduction {
                amount,
                remaining: account.available,
                period_start: account.period_start,
            });
            Ok(())
        })?;

        if !found {
            return Err(Error::UnknownAccount(entity.to_string()));
        }

        match &outcome {
            Ok(d) => debug!(entity = %entity, amount, remaining = d.remaining, "Budget deducted"),
            Err(_) => debug!(
                entity = %entity,
                amount,
                per_action_limit = limits.0,
                available = limits.1,
                "Budget exceeded"
            ),
        }
        for (threshold, used, limit) in crossed {
            self.alert(BudgetAlert {
                entity: entity.clone(),
                threshold,
                used,
                limit,
                at: now,
            });
        }
        Ok(outcome)
    }

    fn alert(&self, alert: BudgetAlert) {
        warn!(
            entity = %alert.entity,
            threshold = alert.threshold,
            used = alert.used,
            limit = alert.limit,
            "Budget utilization threshold crossed"
        );
        self.audit.event(
            AuditEvent::new(AuditEventType::BudgetAlert, alert.entity.as_str(), alert.at)
                .with_details(format!(
                    "{}% ({} of {})",
                    alert.threshold, alert.used, alert.limit
                )),
        );
        if let Ok(mut alerts) = self.alerts.lock() {
            if self.alert_limit == 0 {
                return;
            }
            while alerts.len() >= self.alert_limit {
                alerts.pop_front();
            }
            alerts.push_back(alert);
        }
    }

    /// Balance left in the current period.
    pub fn remaining(&self, entity: &EntityId) -> Result<u64> {
        let now = self.clock.now();
        let policy = self.policy;
        let mut remaining = 0;
        let found = self.store.update(entity, &mut |account: &mut BudgetAccount| {
            account.roll(&policy, now);
            remaining = account.available;
            Ok(())
        })?;
        match (found, self.defaults) {
            (true, _) => Ok(remaining),
            (false, Some((period_limit, _))) => Ok(period_limit),
            (false, None) => Err(Error::UnknownAccount(entity.to_string())),
        }
    }

    /// Apply a due reset now. Returns true if one happened.
    pub fn reset_if_new_period(&self, entity: &EntityId) -> Result<bool> {
        let now = self.clock.now();
        let policy = self.policy;
        let mut reset = false;
        let found = self.store.update(entity, &mut |account: &mut BudgetAccount| {
            reset = account.roll(&policy, now);
            Ok(())
        })?;
        if !found {
            return Err(Error::UnknownAccount(entity.to_string()));
        }
        if reset {
            info!(entity = %entity, "Budget period reset");
        }
        Ok(reset)
    }

    pub fn account(&self, entity: &EntityId) -> Result<Option<BudgetAccount>> {
        self.store.get(entity)
    }

    /// Retained usage entries, oldest first.
    pub fn history(&self, entity: &EntityId) -> Result<Vec<UsageEntry>> {
        self.store
            .get(entity)?
            .map(|a| a.history.into_iter().collect())
            .ok_or_else(|| Error::UnknownAccount(entity.to_string()))
    }

    /// Thresholds fired in the current period.
    pub fn alerts(&self, entity: &EntityId) -> Result<Vec<u8>> {
        self.store
            .get(entity)?
            .map(|a| a.fired_alerts.into_iter().collect())
            .ok_or_else(|| Error::UnknownAccount(entity.to_string()))
    }

    /// Take the alerts raised since the last drain, oldest first. At most
    /// the pending limit are kept between drains.
    pub fn drain_alerts(&self) -> Vec<BudgetAlert> {
        self.alerts
            .lock()
            .map(|mut a| a.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drop usage entries older than the retention window, across all
    /// accounts. Returns the number dropped.
    pub fn prune_history(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.retention;
        let mut removed = 0;
        for entity in self.store.entities()? {
            self.store.update(&entity, &mut |account: &mut BudgetAccount| {
                removed += account.prune(cutoff);
                Ok(())
            })?;
        }
        if removed > 0 {
            info!(removed, "Pruned budget usage history");
        }
        Ok(removed)
    }
}
