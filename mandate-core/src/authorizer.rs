//! Authorization orchestrator.
//!
//! [`Authorizer::authorize`] runs the checks of one request in a fixed order
//! and stops at the first failure:
//!
//! ```text
//! Received -> RevocationChecked -> TimestampValidated -> ReplayChecked
//!          -> SignatureVerified -> WitnessesVerified -> ResourceAuthorized
//!          -> BudgetDeducted -> Allowed
//! ```
//!
//! Any state can end in `Denied(reason)`. Budget is deducted last and only
//! after every other check passed. The nonce is consumed before the
//! signatures are checked and is never handed back.
//!
//! Operational faults (a poisoned store, an unencodable payload) never turn
//! into an allow. They deny with the reason code of the check that failed.

use crate::audit::{AuditSink, AuthorizationRecord, TracingSink};
use crate::budget::BudgetTracker;
use crate::clock::{truncate_millis, Clock, SystemClock};
use crate::config::EngineConfig;
use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::delegation::Delegation;
use crate::error::{Error, ReasonCode, Result, Verdict};
use crate::keys::{verify_at, KeyResolver};
use crate::nonce::NonceTracker;
use crate::payload::{CanonicalMap, ContentHash, Signable, PROOF_DOMAIN};
use crate::resource::{AccessLevel, ResourceConstraintEngine, ResourcePattern};
use crate::revocation::RevocationRegistry;
use crate::store::{MemoryBudgetStore, MemoryNonceStore, MemoryRevocationStore};
use crate::timestamp::{TimestampContext, TimestampValidator};
use crate::witness::{WitnessAttestation, WitnessEnforcer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// States a request passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStage {
    Received,
    RevocationChecked,
    TimestampValidated,
    ReplayChecked,
    SignatureVerified,
    WitnessesVerified,
    ResourceAuthorized,
    BudgetDeducted,
    Allowed,
}

/// The checks, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    Revocation,
    Timestamp,
    Replay,
    Signature,
    Witnesses,
    Resource,
    Budget,
}

impl Check {
    pub const ORDER: [Check; 7] = [
        Check::Revocation,
        Check::Timestamp,
        Check::Replay,
        Check::Signature,
        Check::Witnesses,
        Check::Resource,
        Check::Budget,
    ];

    /// State reached when this check passes.
    pub fn completes(self) -> AuthStage {
        match self {
            Check::Revocation => AuthStage::RevocationChecked,
            Check::Timestamp => AuthStage::TimestampValidated,
            Check::Replay => AuthStage::ReplayChecked,
            Check::Signature => AuthStage::SignatureVerified,
            Check::Witnesses => AuthStage::WitnessesVerified,
            Check::Resource => AuthStage::ResourceAuthorized,
            Check::Budget => AuthStage::BudgetDeducted,
        }
    }

    /// Reason reported when this check is interrupted by an operational fault.
    pub fn fail_closed(self) -> ReasonCode {
        match self {
            Check::Revocation => ReasonCode::RevokedCredential,
            Check::Timestamp => ReasonCode::ExpiredTimestamp,
            Check::Replay => ReasonCode::UnknownNonce,
            Check::Signature => ReasonCode::SignatureInvalid,
            Check::Witnesses => ReasonCode::InsufficientWitnesses,
            Check::Resource => ReasonCode::ResourceDenied,
            Check::Budget => ReasonCode::BudgetExceeded,
        }
    }
}

/// The action a delegatee asks to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub level: AccessLevel,
    /// Budget units charged on success. Zero skips the budget check.
    pub cost: u64,
    /// When the delegatee made the request.
    pub timestamp: DateTime<Utc>,
}

impl Action {
    pub fn new(name: impl Into<String>, level: AccessLevel, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            level,
            cost: 0,
            timestamp: truncate_millis(timestamp),
        }
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
}

/// What the delegatee signs to prove it holds the delegated key.
///
/// Binds the delegation, the action, the resource and the nonce, so a proof
/// cannot be lifted onto another request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOfPossession {
    pub delegation_hash: ContentHash,
    pub action: String,
    pub resource: String,
    pub level: AccessLevel,
    pub cost: u64,
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
}

impl Signable for ProofOfPossession {
    const DOMAIN: &'static str = PROOF_DOMAIN;

    fn canonical_fields(&self) -> Result<CanonicalMap> {
        CanonicalMap::new()
            .field(0, serde_bytes::Bytes::new(self.delegation_hash.as_bytes()))?
            .field(1, &self.action)?
            .field(2, &self.resource)?
            .field(3, self.level.as_str())?
            .field(4, &self.cost)?
            .field(5, &self.nonce)?
            .field(6, &self.timestamp.timestamp_millis())
    }
}

impl ProofOfPossession {
    pub fn new(delegation: &Delegation, action: &Action, resource: &str, nonce: &str) -> Result<Self> {
        Ok(Self {
            delegation_hash: delegation.content_hash()?,
            action: action.name.clone(),
            resource: resource.to_string(),
            level: action.level,
            cost: action.cost,
            nonce: nonce.to_string(),
            timestamp: truncate_millis(action.timestamp),
        })
    }

    pub fn sign(&self, key: &SigningKey) -> Result<Signature> {
        Ok(key.sign(&self.signing_bytes()?))
    }

    pub fn verify(&self, key: &PublicKey, signature: &Signature) -> Result<()> {
        key.verify(&self.signing_bytes()?, signature)
    }
}

/// Everything one `authorize` call needs, in owned form.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub delegation: Delegation,
    pub action: Action,
    pub resource: String,
    pub proof: Signature,
    pub nonce: String,
    pub attestations: Vec<WitnessAttestation>,
}

/// Outcome of an authorization request.
#[derive(Debug, Clone)]
pub enum Decision {
    Allowed { record: AuthorizationRecord },
    Denied { reason: ReasonCode, record: AuthorizationRecord },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { reason, .. } => Some(*reason),
        }
    }

    pub fn record(&self) -> &AuthorizationRecord {
        match self {
            Decision::Allowed { record } | Decision::Denied { record, .. } => record,
        }
    }
}

/// Per-request working state.
struct Pending<'a> {
    delegation: &'a Delegation,
    action: &'a Action,
    resource: &'a str,
    proof: &'a Signature,
    nonce: &'a str,
    attestations: &'a [WitnessAttestation],
    hash: Option<ContentHash>,
    detail: Option<String>,
    remaining: Option<u64>,
}

impl Pending<'_> {
    fn hash(&mut self) -> Result<ContentHash> {
        match self.hash {
            Some(hash) => Ok(hash),
            None => {
                let hash = self.delegation.content_hash()?;
                self.hash = Some(hash);
                Ok(hash)
            }
        }
    }

    fn deny<T>(&mut self, reason: ReasonCode, detail: impl Into<String>) -> Result<Verdict<T>> {
        self.detail = Some(detail.into());
        Ok(Err(reason))
    }
}

/// Builder for [`Authorizer`].
#[derive(Debug, Default)]
pub struct AuthorizerBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    keys: Option<Arc<dyn KeyResolver>>,
    nonces: Option<Arc<NonceTracker>>,
    revocations: Option<Arc<RevocationRegistry>>,
    witnesses: Option<Arc<WitnessEnforcer>>,
    budgets: Option<Arc<BudgetTracker>>,
    global_denies: Vec<ResourcePattern>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl AuthorizerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Default: [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Identity registry used for delegator, delegatee and witness keys.
    ///
    /// Required.
    pub fn key_resolver(mut self, keys: Arc<dyn KeyResolver>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn nonces(mut self, nonces: Arc<NonceTracker>) -> Self {
        self.nonces = Some(nonces);
        self
    }

    pub fn revocations(mut self, revocations: Arc<RevocationRegistry>) -> Self {
        self.revocations = Some(revocations);
        self
    }

    pub fn witnesses(mut self, witnesses: Arc<WitnessEnforcer>) -> Self {
        self.witnesses = Some(witnesses);
        self
    }

    pub fn budgets(mut self, budgets: Arc<BudgetTracker>) -> Self {
        self.budgets = Some(budgets);
        self
    }

    /// Deny `pattern` for every delegation, on top of `resources.global_denies`.
    pub fn global_deny(mut self, pattern: &str) -> Result<Self> {
        self.global_denies.push(ResourcePattern::deny(pattern)?);
        Ok(self)
    }

    /// Default: [`TracingSink`].
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate the configuration and assemble the authorizer.
    ///
    /// Components not supplied are built from the configuration over
    /// in-memory stores.
    pub fn build(self) -> Result<Authorizer> {
        let config = self.config;
        config.ensure_valid()?;

        let keys = self
            .keys
            .ok_or_else(|| Error::Config("a key resolver is required".into()))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingSink));

        let timestamps = TimestampValidator::new(clock.clone())
            .with_clock_skew(config.clock_skew())
            .with_max_age(config.max_age());

        let nonces = match self.nonces {
            Some(nonces) => nonces,
            None => Arc::new(
                NonceTracker::new(Arc::new(MemoryNonceStore::new()), clock.clone())
                    .with_ttl(config.nonce_ttl()),
            ),
        };

        let revocations = match self.revocations {
            Some(revocations) => revocations,
            None => Arc::new(
                RevocationRegistry::new(
                    Arc::new(MemoryRevocationStore::new()),
                    keys.clone(),
                    clock.clone(),
                )
                .with_timestamp_validator(timestamps.clone())
                .with_audit_sink(audit.clone()),
            ),
        };

        let witnesses = match self.witnesses {
            Some(witnesses) => witnesses,
            None => {
                let mut enforcer = WitnessEnforcer::new(keys.clone(), clock.clone())
                    .with_default_trust(config.witnesses.default_trust)?
                    .with_audit_sink(audit.clone());
                if let Some(max_age) = config.attestation_max_age() {
                    enforcer = enforcer.with_freshness(
                        TimestampValidator::new(clock.clone())
                            .with_clock_skew(config.clock_skew())
                            .with_max_age(max_age),
                    );
                }
                Arc::new(enforcer)
            }
        };

        let budgets = match self.budgets {
            Some(budgets) => budgets,
            None => {
                let mut tracker =
                    BudgetTracker::new(Arc::new(MemoryBudgetStore::new()), clock.clone())
                        .with_reset_policy(config.budget.reset)
                        .with_history_retention(config.history_retention())
                        .with_alert_thresholds(config.budget.alert_thresholds.clone())
                        .with_audit_sink(audit.clone());
                if let Some((period, per_action)) = config.budget.default_limits() {
                    tracker = tracker.with_default_limits(period, per_action);
                }
                Arc::new(tracker)
            }
        };

        let mut global_denies = config.resources.compile_denies()?;
        global_denies.extend(self.global_denies);

        debug!(
            global_denies = global_denies.len(),
            clock_skew_secs = config.timestamps.clock_skew_secs,
            max_age_secs = config.timestamps.max_age_secs,
            "Authorizer built"
        );

        Ok(Authorizer {
            clock,
            timestamps,
            keys,
            nonces,
            revocations,
            witnesses,
            budgets,
            global_denies,
            audit,
        })
    }
}

/// Composes every check into one fail-closed decision.
///
/// Stateless per call; all state lives in the shared registries, so one
/// instance can serve many threads behind an `Arc`.
#[derive(Debug)]
pub struct Authorizer {
    clock: Arc<dyn Clock>,
    timestamps: TimestampValidator,
    keys: Arc<dyn KeyResolver>,
    nonces: Arc<NonceTracker>,
    revocations: Arc<RevocationRegistry>,
    witnesses: Arc<WitnessEnforcer>,
    budgets: Arc<BudgetTracker>,
    global_denies: Vec<ResourcePattern>,
    audit: Arc<dyn AuditSink>,
}

impl Authorizer {
    pub fn builder() -> AuthorizerBuilder {
        AuthorizerBuilder::new()
    }

    pub fn nonces(&self) -> &Arc<NonceTracker> {
        &self.nonces
    }

    pub fn revocations(&self) -> &Arc<RevocationRegistry> {
        &self.revocations
    }

    pub fn witnesses(&self) -> &Arc<WitnessEnforcer> {
        &self.witnesses
    }

    pub fn budgets(&self) -> &Arc<BudgetTracker> {
        &self.budgets
    }

    pub fn global_denies(&self) -> &[ResourcePattern] {
        &self.global_denies
    }

    pub fn authorize_request(&self, request: &AuthorizationRequest) -> Decision {
        self.authorize(
            &request.delegation,
            &request.action,
            &request.resource,
            &request.proof,
            &request.nonce,
            &request.attestations,
        )
    }

    /// Decide whether `action` on `resource` may proceed under `delegation`.
    ///
    /// `proof` is the delegatee's signature over the request's
    /// [`ProofOfPossession`].
    pub fn authorize(
        &self,
        delegation: &Delegation,
        action: &Action,
        resource: &str,
        proof: &Signature,
        nonce: &str,
        attestations: &[WitnessAttestation],
    ) -> Decision {
        let started = Instant::now();
        let mut pending = Pending {
            delegation,
            action,
            resource,
            proof,
            nonce,
            attestations,
            hash: None,
            detail: None,
            remaining: None,
        };

        let mut reached = AuthStage::Received;
        let mut failure = None;
        for check in Check::ORDER {
            match self.run(check, &mut pending) {
                Ok(Ok(())) => {
                    debug!(delegation = %delegation.id(), check = ?check, "Check passed");
                    reached = check.completes();
                }
                Ok(Err(reason)) => {
                    failure = Some((check, reason));
                    break;
                }
                Err(e) => {
                    warn!(
                        delegation = %delegation.id(),
                        check = ?check,
                        error = %e,
                        "Check failed with an operational error, denying"
                    );
                    pending.detail = Some(e.to_string());
                    failure = Some((check, check.fail_closed()));
                    break;
                }
            }
        }
        if failure.is_none() {
            reached = AuthStage::Allowed;
        }

        let record = self.record(&pending, failure, reached, started);
        self.audit.authorization(&record);

        match failure {
            None => {
                info!(
                    delegation = %delegation.id(),
                    delegatee = %delegation.delegatee(),
                    action = %action.name,
                    resource,
                    "Authorization allowed"
                );
                Decision::Allowed { record }
            }
            Some((check, reason)) => {
                if reason.is_terminal() || reason == ReasonCode::ReplayDetected {
                    warn!(
                        delegation = %delegation.id(),
                        delegatee = %delegation.delegatee(),
                        check = ?check,
                        %reason,
                        detail = ?record.detail,
                        "Authorization denied"
                    );
                } else {
                    info!(
                        delegation = %delegation.id(),
                        delegatee = %delegation.delegatee(),
                        check = ?check,
                        %reason,
                        detail = ?record.detail,
                        "Authorization denied"
                    );
                }
                Decision::Denied { reason, record }
            }
        }
    }

    fn run(&self, check: Check, p: &mut Pending<'_>) -> Result<Verdict> {
        match check {
            Check::Revocation => self.check_revocation(p),
            Check::Timestamp => self.check_timestamps(p),
            Check::Replay => self.check_nonce(p),
            Check::Signature => self.check_signatures(p),
            Check::Witnesses => self.check_witnesses(p),
            Check::Resource => self.check_resource(p),
            Check::Budget => self.check_budget(p),
        }
    }

    fn check_revocation(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        let hash = p.hash()?;
        if self.revocations.is_revoked_hash(&hash)? {
            return p.deny(ReasonCode::RevokedCredential, "delegation has been revoked");
        }
        Ok(Ok(()))
    }

    fn check_timestamps(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        if let Err(reason) = self
            .timestamps
            .validate(p.delegation.issued_at(), TimestampContext::Delegation)
        {
            return p.deny(reason, "delegation issued in the future");
        }
        if p.delegation.is_expired_at(self.clock.now()) {
            return p.deny(
                ReasonCode::ExpiredTimestamp,
                format!("delegation expired at {}", p.delegation.expires_at()),
            );
        }
        if let Err(reason) = self
            .timestamps
            .validate(p.action.timestamp, TimestampContext::Request)
        {
            return p.deny(reason, format!("request timestamp {} out of bounds", p.action.timestamp));
        }
        Ok(Ok(()))
    }

    fn check_nonce(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        match self
            .nonces
            .verify_and_consume(p.delegation.delegatee(), p.nonce)?
        {
            Ok(()) => Ok(Ok(())),
            Err(reason) => p.deny(reason, "nonce rejected"),
        }
    }

    fn check_signatures(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        if let Err(reason) = p.delegation.verify_signature(self.keys.as_ref())? {
            return p.deny(reason, "delegator signature");
        }

        let proof = ProofOfPossession {
            delegation_hash: p.hash()?,
            action: p.action.name.clone(),
            resource: p.resource.to_string(),
            level: p.action.level,
            cost: p.action.cost,
            nonce: p.nonce.to_string(),
            timestamp: truncate_millis(p.action.timestamp),
        };
        let verdict = verify_at(
            self.keys.as_ref(),
            p.delegation.delegatee(),
            &proof.signing_bytes()?,
            p.proof,
            p.action.timestamp,
        )?;
        match verdict {
            Ok(_) => Ok(Ok(())),
            Err(reason) => p.deny(reason, "proof of possession"),
        }
    }

    fn check_witnesses(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        let Some(policy) = p.delegation.witness_policy() else {
            return Ok(Ok(()));
        };
        let hash = p.hash()?;
        match self.witnesses.verify_quorum(&hash, p.attestations, policy)? {
            Ok(report) => {
                debug!(
                    witnesses = report.witnesses.len(),
                    aggregate = report.aggregate_trust,
                    "Witness quorum met"
                );
                Ok(Ok(()))
            }
            Err(reason) => p.deny(reason, "witness quorum not met"),
        }
    }

    fn check_resource(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        let engine = ResourceConstraintEngine::for_delegation(p.delegation, &self.global_denies)?;
        match engine.is_authorized(p.resource, p.action.level) {
            Ok(_) => Ok(Ok(())),
            Err(reason) => p.deny(
                reason,
                format!("{} access to {} not granted", p.action.level, p.resource),
            ),
        }
    }

    fn check_budget(&self, p: &mut Pending<'_>) -> Result<Verdict> {
        if p.action.cost == 0 {
            return Ok(Ok(()));
        }
        match self
            .budgets
            .check_and_deduct(p.delegation.delegatee(), p.action.cost)?
        {
            Ok(deduction) => {
                p.remaining = Some(deduction.remaining);
                Ok(Ok(()))
            }
            Err(reason) => p.deny(reason, format!("cost {} over budget", p.action.cost)),
        }
    }

    fn record(
        &self,
        p: &Pending<'_>,
        failure: Option<(Check, ReasonCode)>,
        reached: AuthStage,
        started: Instant,
    ) -> AuthorizationRecord {
        AuthorizationRecord {
            id: format!("auth_{}", uuid::Uuid::now_v7().simple()),
            timestamp: self.clock.now(),
            delegation_id: p.delegation.id().to_string(),
            delegation_hash: p.hash.map(|h| h.to_hex()),
            delegator: p.delegation.delegator().clone(),
            delegatee: p.delegation.delegatee().clone(),
            action: p.action.name.clone(),
            resource: p.resource.to_string(),
            decision: if failure.is_none() { "allow" } else { "deny" },
            reason: failure.map(|(_, reason)| reason),
            failed_check: failure.map(|(check, _)| check),
            reached,
            detail: p.detail.clone(),
            remaining_budget: p.remaining,
            latency_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
        }
    }
}
