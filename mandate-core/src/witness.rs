//! Multi-party witness quorums.
//!
//! A witness attests to a content hash by signing it. A delegation that
//! carries a [`WitnessPolicy`] is only honored when enough distinct,
//! registered, sufficiently trusted witnesses have attested to its hash.
//!
//! Each witness has a role with a fixed weight; its contribution to the
//! aggregate is `trust * weight`:
//!
//! | Role | Weight |
//! |------|--------|
//! | Authority | 1.5 |
//! | Peer | 1.0 |
//! | Observer | 0.5 |
//!
//! Trust lives in `[0, 1]` and moves with recorded outcomes, see
//! [`WitnessEnforcer::record_outcome`].

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoOpSink};
use crate::clock::{truncate_millis, Clock};
use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::error::{Error, ReasonCode, Result, Verdict};
use crate::identity::EntityId;
use crate::keys::KeyResolver;
use crate::payload::{CanonicalMap, ContentHash, Signable, ATTESTATION_DOMAIN};
use crate::timestamp::{TimestampContext, TimestampValidator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Trust given to a witness registered without an explicit value.
pub const DEFAULT_INITIAL_TRUST: f64 = 0.5;

/// Outcomes kept per witness.
pub const OUTCOME_HISTORY: usize = 100;

/// Outcomes the success rate is computed over.
pub const SUCCESS_WINDOW: usize = 20;

const TRUST_DECAY: f64 = 0.8;
const AGGREGATE_EPSILON: f64 = 1e-9;

/// Closed set of witness roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WitnessRole {
    Observer,
    Peer,
    Authority,
}

impl WitnessRole {
    pub fn weight(self) -> f64 {
        match self {
            WitnessRole::Authority => 1.5,
            WitnessRole::Peer => 1.0,
            WitnessRole::Observer => 0.5,
        }
    }
}

/// Quorum requirement carried by a delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WitnessPolicy {
    /// Distinct counted witnesses required.
    pub min_witnesses: usize,
    /// Trust every counted witness must have.
    pub min_trust: f64,
    /// Required sum of `trust * weight`.
    pub min_aggregate: f64,
    pub required_roles: BTreeSet<WitnessRole>,
    pub required_witnesses: BTreeSet<EntityId>,
}

impl Default for WitnessPolicy {
    fn default() -> Self {
        Self {
            min_witnesses: 1,
            min_trust: 0.0,
            min_aggregate: 0.0,
            required_roles: BTreeSet::new(),
            required_witnesses: BTreeSet::new(),
        }
    }
}

impl WitnessPolicy {
    pub fn new(min_witnesses: usize, min_trust: f64, min_aggregate: f64) -> Self {
        Self {
            min_witnesses,
            min_trust,
            min_aggregate,
            ..Self::default()
        }
    }

    /// Thresholds must be finite and non-negative, with `min_trust` at
    /// most 1.
    pub fn validate(&self) -> Result<()> {
        if !(self.min_trust.is_finite() && (0.0..=1.0).contains(&self.min_trust)) {
            return Err(Error::Validation(format!(
                "witness min_trust {} outside [0, 1]",
                self.min_trust
            )));
        }
        if !(self.min_aggregate.is_finite() && self.min_aggregate >= 0.0) {
            return Err(Error::Validation(format!(
                "witness min_aggregate {} must be finite and non-negative",
                self.min_aggregate
            )));
        }
        Ok(())
    }

    pub fn require_role(mut self, role: WitnessRole) -> Self {
        self.required_roles.insert(role);
        self
    }

    pub fn require_witness(mut self, witness: impl Into<EntityId>) -> Self {
        self.required_witnesses.insert(witness.into());
        self
    }
}

/// A witness's signed confirmation of a content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessAttestation {
    pub witness: EntityId,
    pub role: WitnessRole,
    pub content_hash: ContentHash,
    pub timestamp: DateTime<Utc>,
    pub signature: Signature,
}

impl Signable for WitnessAttestation {
    const DOMAIN: &'static str = ATTESTATION_DOMAIN;

    fn canonical_fields(&self) -> Result<CanonicalMap> {
        CanonicalMap::new()
            .field(0, &self.witness)?
            .field(1, &self.role)?
            .field(2, serde_bytes::Bytes::new(self.content_hash.as_bytes()))?
            .field(3, &self.timestamp.timestamp_millis())
    }
}

/// Read-only trust lookup.
pub trait TrustSource: Send + Sync + Debug {
    /// Trust of `witness` in `[0, 1]`, or `None` if unknown.
    fn trust(&self, witness: &EntityId) -> Option<f64>;
}

/// Outcome of a satisfied quorum.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuorumReport {
    /// Counted witnesses, in attestation order.
    pub witnesses: Vec<EntityId>,
    pub aggregate_trust: f64,
    pub roles: BTreeSet<WitnessRole>,
}

/// Reputation snapshot of one witness.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WitnessReputation {
    pub witness: EntityId,
    pub role: WitnessRole,
    pub trust: f64,
    /// Quorums this witness was counted in.
    pub verifications: u64,
    /// Recorded outcomes retained.
    pub outcomes: usize,
    /// Success rate over the most recent outcomes, 1.0 when none.
    pub success_rate: f64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct WitnessEntry {
    role: WitnessRole,
    trust: f64,
    outcomes: VecDeque<bool>,
    verifications: u64,
    registered_at: DateTime<Utc>,
}

impl WitnessEntry {
    fn success_rate(&self) -> f64 {
        let recent = self.outcomes.iter().rev().take(SUCCESS_WINDOW);
        let (total, good) = recent.fold((0usize, 0usize), |(t, g), ok| (t + 1, g + usize::from(*ok)));
        if total == 0 {
            1.0
        } else {
            good as f64 / total as f64
        }
    }
}

struct Counted<'a> {
    attestation: &'a WitnessAttestation,
    key: PublicKey,
    trust: f64,
}

fn checked_trust(trust: f64) -> Result<f64> {
    if !trust.is_finite() {
        return Err(Error::InvalidTrust(trust));
    }
    Ok(trust.clamp(0.0, 1.0))
}

/// Registers witnesses and verifies quorums.
#[derive(Debug)]
pub struct WitnessEnforcer {
    witnesses: RwLock<HashMap<EntityId, WitnessEntry>>,
    keys: Arc<dyn KeyResolver>,
    clock: Arc<dyn Clock>,
    external_trust: Option<Arc<dyn TrustSource>>,
    freshness: Option<TimestampValidator>,
    default_trust: f64,
    audit: Arc<dyn AuditSink>,
}

impl WitnessEnforcer {
    pub fn new(keys: Arc<dyn KeyResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            witnesses: RwLock::new(HashMap::new()),
            keys,
            clock,
            external_trust: None,
            freshness: None,
            default_trust: DEFAULT_INITIAL_TRUST,
            audit: Arc::new(NoOpSink),
        }
    }

    /// Take trust values from an external reputation service. Witnesses it
    /// does not know fall back to the local value.
    pub fn with_trust_source(mut self, source: Arc<dyn TrustSource>) -> Self {
        self.external_trust = Some(source);
        self
    }

    /// Only count attestations that pass `validator` as
    /// [`TimestampContext::Attestation`].
    pub fn with_freshness(mut self, validator: TimestampValidator) -> Self {
        self.freshness = Some(validator);
        self
    }

    /// Trust given by [`register_witness_default`](Self::register_witness_default).
    pub fn with_default_trust(mut self, trust: f64) -> Result<Self> {
        self.default_trust = checked_trust(trust)?;
        Ok(self)
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Register a witness at the default trust level.
    pub fn register_witness_default(&self, witness: &EntityId, role: WitnessRole) -> Result<()> {
        self.register_witness_with_role(witness, role, self.default_trust)
    }

    /// Register a peer witness.
    pub fn register_witness(&self, witness: &EntityId, initial_trust: f64) -> Result<()> {
        self.register_witness_with_role(witness, WitnessRole::Peer, initial_trust)
    }

    pub fn register_witness_with_role(
        &self,
        witness: &EntityId,
        role: WitnessRole,
        initial_trust: f64,
    ) -> Result<()> {
        let trust = checked_trust(initial_trust)?;
        let now = self.clock.now();
        {
            let mut witnesses = self
                .witnesses
                .write()
                .map_err(|_| Error::StorePoisoned("witnesses"))?;
            if witnesses.contains_key(witness) {
                return Err(Error::DuplicateWitness(witness.to_string()));
            }
            witnesses.insert(
                witness.clone(),
                WitnessEntry {
                    role,
                    trust,
                    outcomes: VecDeque::new(),
                    verifications: 0,
                    registered_at: now,
                },
            );
        }

        info!(witness = %witness, role = ?role, trust, "Registered witness");
        self.audit.event(
            AuditEvent::new(AuditEventType::WitnessRegistered, witness.as_str(), now)
                .with_details(format!("role {:?}, trust {:.3}", role, trust)),
        );
        Ok(())
    }

    /// Sign an attestation over `content_hash` as `witness`.
    pub fn attest(
        &self,
        content_hash: &ContentHash,
        witness: &EntityId,
        key: &SigningKey,
    ) -> Result<WitnessAttestation> {
        let role = self.entry(witness)?.role;
        let mut attestation = WitnessAttestation {
            witness: witness.clone(),
            role,
            content_hash: *content_hash,
            timestamp: truncate_millis(self.clock.now()),
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        attestation.signature = key.sign(&attestation.signing_bytes()?);
        debug!(witness = %witness, hash = %content_hash, "Attestation signed");
        Ok(attestation)
    }

    /// Check that `attestations` satisfy `policy` for `content_hash`.
    ///
    /// Attestations over other hashes and repeat attestations by the same
    /// witness are ignored. Unregistered witnesses and witnesses without a
    /// current key are not counted. A forged or mis-roled attestation fails
    /// the whole quorum, and so does a policy with unusable thresholds.
    pub fn verify_quorum(
        &self,
        content_hash: &ContentHash,
        attestations: &[WitnessAttestation],
        policy: &WitnessPolicy,
    ) -> Result<Verdict<QuorumReport>> {
        if let Err(e) = policy.validate() {
            warn!(hash = %content_hash, error = %e, "Rejecting malformed witness policy");
            return Ok(Err(ReasonCode::InsufficientWitnesses));
        }

        let mut seen: HashSet<EntityId> = HashSet::new();
        let distinct: Vec<&WitnessAttestation> = attestations
            .iter()
            .filter(|a| a.content_hash == *content_hash)
            .filter(|a| seen.insert(a.witness.clone()))
            .collect();

        let mut counted: Vec<Counted<'_>> = Vec::with_capacity(distinct.len());
        {
            let witnesses = self
                .witnesses
                .read()
                .map_err(|_| Error::StorePoisoned("witnesses"))?;
            for attestation in distinct {
                let Some(entry) = witnesses.get(&attestation.witness) else {
                    debug!(witness = %attestation.witness, "Attestation from unregistered witness");
                    continue;
                };
                if entry.role != attestation.role {
                    warn!(
                        witness = %attestation.witness,
                        registered = ?entry.role,
                        claimed = ?attestation.role,
                        "Witness claimed a role it does not hold"
                    );
                    return Ok(Err(ReasonCode::SignatureInvalid));
                }
                if let Some(validator) = &self.freshness {
                    if let Err(reason) =
                        validator.validate(attestation.timestamp, TimestampContext::Attestation)
                    {
                        debug!(witness = %attestation.witness, %reason, "Stale attestation");
                        continue;
                    }
                }
                let Some(key) = self.keys.current_key(&attestation.witness)? else {
                    debug!(witness = %attestation.witness, "Witness has no current key");
                    continue;
                };
                counted.push(Counted {
                    attestation,
                    key: key.public_key,
                    trust: self.effective_trust(&attestation.witness, entry),
                });
            }
        }

        // Each attestation goes through the same strict check as any other
        // signature.
        for c in &counted {
            let message = c.attestation.signing_bytes()?;
            if let Err(e) = c.key.verify(&message, &c.attestation.signature) {
                warn!(
                    hash = %content_hash,
                    witness = %c.attestation.witness,
                    error = %e,
                    "Witness signature verification failed"
                );
                return Ok(Err(ReasonCode::SignatureInvalid));
            }
        }

        if counted.len() < policy.min_witnesses {
            debug!(
                counted = counted.len(),
                required = policy.min_witnesses,
                "Not enough distinct witnesses"
            );
            return Ok(Err(ReasonCode::InsufficientWitnesses));
        }

        let roles: BTreeSet<WitnessRole> = counted.iter().map(|c| c.attestation.role).collect();
        if let Some(missing) = policy.required_roles.iter().find(|r| !roles.contains(r)) {
            debug!(role = ?missing, "Required witness role missing");
            return Ok(Err(ReasonCode::InsufficientWitnesses));
        }
        if let Some(missing) = policy
            .required_witnesses
            .iter()
            .find(|w| !counted.iter().any(|c| c.attestation.witness == **w))
        {
            debug!(witness = %missing, "Required witness missing");
            return Ok(Err(ReasonCode::InsufficientWitnesses));
        }

        if let Some(low) = counted.iter().find(|c| c.trust < policy.min_trust) {
            debug!(
                witness = %low.attestation.witness,
                trust = low.trust,
                min = policy.min_trust,
                "Witness trust below minimum"
            );
            return Ok(Err(ReasonCode::WitnessTrustTooLow));
        }

        let aggregate: f64 = counted
            .iter()
            .map(|c| c.trust * c.attestation.role.weight())
            .sum();
        if aggregate + AGGREGATE_EPSILON < policy.min_aggregate {
            debug!(aggregate, min = policy.min_aggregate, "Aggregate trust below minimum");
            return Ok(Err(ReasonCode::WitnessTrustTooLow));
        }

        let ids: Vec<EntityId> = counted
            .iter()
            .map(|c| c.attestation.witness.clone())
            .collect();
        {
            let mut witnesses = self
                .witnesses
                .write()
                .map_err(|_| Error::StorePoisoned("witnesses"))?;
            for id in &ids {
                if let Some(entry) = witnesses.get_mut(id) {
                    entry.verifications += 1;
                }
            }
        }

        Ok(Ok(QuorumReport {
            witnesses: ids,
            aggregate_trust: aggregate,
            roles,
        }))
    }

    /// Shift a witness's trust by `delta`, clamped to `[0, 1]`.
    pub fn adjust_trust(&self, witness: &EntityId, delta: f64) -> Result<f64> {
        if !delta.is_finite() {
            return Err(Error::InvalidTrust(delta));
        }
        let (before, after) = self.modify(witness, |entry| {
            entry.trust = (entry.trust + delta).clamp(0.0, 1.0);
        })?;
        self.trust_changed(witness, before, after, "manual adjustment");
        Ok(after)
    }

    /// Record whether the witness's last attestation turned out correct.
    ///
    /// Trust becomes `0.8 * trust + 0.2 * success_rate`, the rate taken over
    /// the last 20 outcomes.
    pub fn record_outcome(&self, witness: &EntityId, correct: bool) -> Result<f64> {
        let (before, after) = self.modify(witness, |entry| {
            entry.outcomes.push_back(correct);
            while entry.outcomes.len() > OUTCOME_HISTORY {
                entry.outcomes.pop_front();
            }
            let rate = entry.success_rate();
            entry.trust = (TRUST_DECAY * entry.trust + (1.0 - TRUST_DECAY) * rate).clamp(0.0, 1.0);
        })?;
        if (before - after).abs() > f64::EPSILON {
            self.trust_changed(witness, before, after, if correct { "correct" } else { "incorrect" });
        }
        Ok(after)
    }

    /// Trust of a registered witness, external source first.
    pub fn trust(&self, witness: &EntityId) -> Result<f64> {
        let witnesses = self
            .witnesses
            .read()
            .map_err(|_| Error::StorePoisoned("witnesses"))?;
        let entry = witnesses
            .get(witness)
            .ok_or_else(|| Error::UnknownWitness(witness.to_string()))?;
        Ok(self.effective_trust(witness, entry))
    }

    pub fn reputation(&self, witness: &EntityId) -> Result<WitnessReputation> {
        let entry = self.entry(witness)?;
        Ok(WitnessReputation {
            witness: witness.clone(),
            role: entry.role,
            trust: entry.trust,
            verifications: entry.verifications,
            outcomes: entry.outcomes.len(),
            success_rate: entry.success_rate(),
            registered_at: entry.registered_at,
        })
    }

    /// Witnesses at or above `min_trust` counted in at least
    /// `min_verifications` quorums, sorted by id.
    pub fn trusted_witnesses(&self, min_trust: f64, min_verifications: u64) -> Result<Vec<EntityId>> {
        let witnesses = self
            .witnesses
            .read()
            .map_err(|_| Error::StorePoisoned("witnesses"))?;
        let mut ids: Vec<EntityId> = witnesses
            .iter()
            .filter(|(id, e)| {
                self.effective_trust(id, e) >= min_trust && e.verifications >= min_verifications
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self
            .witnesses
            .read()
            .map_err(|_| Error::StorePoisoned("witnesses"))?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn effective_trust(&self, witness: &EntityId, entry: &WitnessEntry) -> f64 {
        self.external_trust
            .as_ref()
            .and_then(|source| source.trust(witness))
            .filter(|t| t.is_finite())
            .unwrap_or(entry.trust)
            .clamp(0.0, 1.0)
    }

    fn entry(&self, witness: &EntityId) -> Result<WitnessEntry> {
        self.witnesses
            .read()
            .map_err(|_| Error::StorePoisoned("witnesses"))?
            .get(witness)
            .cloned()
            .ok_or_else(|| Error::UnknownWitness(witness.to_string()))
    }

    fn modify(&self, witness: &EntityId, f: impl FnOnce(&mut WitnessEntry)) -> Result<(f64, f64)> {
        let mut witnesses = self
            .witnesses
            .write()
            .map_err(|_| Error::StorePoisoned("witnesses"))?;
        let entry = witnesses
            .get_mut(witness)
            .ok_or_else(|| Error::UnknownWitness(witness.to_string()))?;
        let before = entry.trust;
        f(entry);
        Ok((before, entry.trust))
    }

    fn trust_changed(&self, witness: &EntityId, before: f64, after: f64, cause: &str) {
        debug!(witness = %witness, before, after, cause, "Witness trust changed");
        self.audit.event(
            AuditEvent::new(
                AuditEventType::WitnessTrustAdjusted,
                witness.as_str(),
                self.clock.now(),
            )
            .with_details(format!("{:.3} -> {:.3} ({})", before, after, cause)),
        );
    }
}

impl TrustSource for WitnessEnforcer {
    fn trust(&self, witness: &EntityId) -> Option<f64> {
        WitnessEnforcer::trust(self, witness).ok()
    }
}
