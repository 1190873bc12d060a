//! Delegation revocation.
//!
//! A [`RevocationRecord`] permanently invalidates one delegation, identified
//! by its content hash. Records are signed. A revocation is accepted only
//! when it is signed by:
//!
//! - the delegator, with the key currently active for it, or
//! - a registered emergency authority.
//!
//! Non-revocable delegations accept only emergency revocations.
//!
//! Revoking is idempotent: the first accepted record wins and later attempts
//! get it back as [`RevocationOutcome::AlreadyRevoked`]. Records are never
//! purged.

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoOpSink};
use crate::clock::{truncate_millis, Clock};
use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::delegation::{Delegation, DelegationId};
use crate::error::{Error, Result};
use crate::identity::EntityId;
use crate::keys::KeyResolver;
use crate::payload::{CanonicalMap, ContentHash, Signable, REVOCATION_DOMAIN};
use crate::store::RevocationStore;
use crate::timestamp::{TimestampContext, TimestampValidator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// A signed, permanent invalidation of a delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub delegation_hash: ContentHash,
    pub delegation_id: DelegationId,
    pub revoker: EntityId,
    pub revoker_key: PublicKey,
    /// Delegator key version, absent for emergency revocations.
    pub revoker_key_version: Option<u32>,
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
    pub emergency: bool,
    pub signature: Signature,
}

impl Signable for RevocationRecord {
    const DOMAIN: &'static str = REVOCATION_DOMAIN;

    fn canonical_fields(&self) -> Result<CanonicalMap> {
        CanonicalMap::new()
            .field(0, serde_bytes::Bytes::new(self.delegation_hash.as_bytes()))?
            .field(1, &self.delegation_id)?
            .field(2, &self.revoker)?
            .field(3, serde_bytes::Bytes::new(&self.revoker_key.to_bytes()))?
            .optional(4, self.revoker_key_version.as_ref())?
            .field(5, &self.reason)?
            .field(6, &self.revoked_at.timestamp_millis())?
            .field(7, &self.emergency)
    }
}

impl RevocationRecord {
    /// Build and sign a record for `delegation`.
    pub fn sign(
        delegation: &Delegation,
        revoker: EntityId,
        revoker_key_version: Option<u32>,
        reason: impl Into<String>,
        revoked_at: DateTime<Utc>,
        emergency: bool,
        key: &SigningKey,
    ) -> Result<Self> {
        let mut record = Self {
            delegation_hash: delegation.content_hash()?,
            delegation_id: delegation.id().clone(),
            revoker,
            revoker_key: key.public_key(),
            revoker_key_version,
            reason: reason.into(),
            revoked_at: truncate_millis(revoked_at),
            emergency,
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        record.signature = key.sign(&record.signing_bytes()?);
        Ok(record)
    }

    pub fn verify_signature(&self) -> Result<()> {
        self.revoker_key
            .verify(&self.signing_bytes()?, &self.signature)
            .map_err(|_| Error::SignatureInvalid("revocation record signature invalid".into()))
    }
}

/// Result of a revocation attempt that was authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationOutcome {
    /// This call stored the record.
    Revoked(RevocationRecord),
    /// An earlier record exists and is returned unchanged.
    AlreadyRevoked(RevocationRecord),
}

impl RevocationOutcome {
    pub fn record(&self) -> &RevocationRecord {
        match self {
            RevocationOutcome::Revoked(r) | RevocationOutcome::AlreadyRevoked(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, RevocationOutcome::Revoked(_))
    }
}

/// Stores and answers for delegation revocations.
#[derive(Debug)]
pub struct RevocationRegistry {
    store: Arc<dyn RevocationStore>,
    keys: Arc<dyn KeyResolver>,
    clock: Arc<dyn Clock>,
    timestamps: TimestampValidator,
    emergency: RwLock<HashMap<PublicKey, EntityId>>,
    audit: Arc<dyn AuditSink>,
}

impl RevocationRegistry {
    pub fn new(
        store: Arc<dyn RevocationStore>,
        keys: Arc<dyn KeyResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            keys,
            timestamps: TimestampValidator::new(clock.clone()),
            clock,
            emergency: RwLock::new(HashMap::new()),
            audit: Arc::new(NoOpSink),
        }
    }

    /// Bounds applied to the timestamps of externally signed records.
    pub fn with_timestamp_validator(mut self, validator: TimestampValidator) -> Self {
        self.timestamps = validator;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Allow `key` to revoke any delegation, revocable or not.
    pub fn add_emergency_authority(&self, authority: &EntityId, key: PublicKey) -> Result<()> {
        let fingerprint = key.fingerprint();
        self.emergency
            .write()
            .map_err(|_| Error::StorePoisoned("emergency authorities"))?
            .insert(key, authority.clone());
        info!(authority = %authority, key = %fingerprint, "Emergency revocation authority added");
        Ok(())
    }

    fn emergency_authority(&self, key: &PublicKey) -> Result<Option<EntityId>> {
        Ok(self
            .emergency
            .read()
            .map_err(|_| Error::StorePoisoned("emergency authorities"))?
            .get(key)
            .cloned())
    }

    /// Revoke `delegation`, signing the record with `signer`.
    ///
    /// `signer` must be the delegator's current key or an emergency
    /// authority key.
    pub fn revoke(
        &self,
        delegation: &Delegation,
        signer: &SigningKey,
        reason: &str,
    ) -> Result<RevocationOutcome> {
        let public = signer.public_key();
        let now = self.clock.now();

        let delegator_key = self.keys.current_key(delegation.delegator())?;
        let record = match delegator_key {
            Some(current) if current.public_key == public => RevocationRecord::sign(
                delegation,
                delegation.delegator().clone(),
                Some(current.version),
                reason,
                now,
                false,
                signer,
            )?,
            _ => match self.emergency_authority(&public)? {
                Some(authority) => {
                    RevocationRecord::sign(delegation, authority, None, reason, now, true, signer)?
                }
                None => {
                    self.rejected(delegation, &public, "signer is neither delegator nor emergency authority");
                    return Err(Error::UnauthorizedRevoker(public.fingerprint()));
                }
            },
        };

        self.accept(record, delegation)
    }

    /// Accept a record signed elsewhere. Its timestamp must be fresh.
    pub fn revoke_signed(
        &self,
        record: RevocationRecord,
        delegation: &Delegation,
    ) -> Result<RevocationOutcome> {
        if let Err(reason) = self
            .timestamps
            .validate(record.revoked_at, TimestampContext::Revocation)
        {
            self.rejected(delegation, &record.revoker_key, reason.name());
            return Err(Error::Validation(format!(
                "revocation timestamp rejected: {}",
                reason
            )));
        }
        self.accept(record, delegation)
    }

    fn accept(&self, record: RevocationRecord, delegation: &Delegation) -> Result<RevocationOutcome> {
        if let Err(e) = self.authorize(&record, delegation) {
            self.rejected(delegation, &record.revoker_key, &e.to_string());
            return Err(e);
        }

        match self.store.insert_if_absent(record.clone())? {
            Some(existing) => {
                debug!(delegation = %delegation.id(), "Delegation already revoked");
                Ok(RevocationOutcome::AlreadyRevoked(existing))
            }
            None => {
                info!(
                    delegation = %delegation.id(),
                    hash = %record.delegation_hash,
                    revoker = %record.revoker,
                    emergency = record.emergency,
                    reason = %record.reason,
                    "Delegation revoked"
                );
                let mut event = AuditEvent::new(
                    AuditEventType::DelegationRevoked,
                    record.revoker.as_str(),
                    record.revoked_at,
                )
                .with_subject(delegation.id().as_str())
                .with_key(&record.revoker_key)
                .with_details(&record.reason)
                .with_related(record.delegation_hash.to_hex());
                if record.emergency {
                    event = event.with_related("emergency");
                }
                self.audit.event(event);
                Ok(RevocationOutcome::Revoked(record))
            }
        }
    }

    fn authorize(&self, record: &RevocationRecord, delegation: &Delegation) -> Result<()> {
        let expected = delegation.content_hash()?;
        if record.delegation_hash != expected {
            return Err(Error::RevocationTargetMismatch {
                expected: expected.to_hex(),
                actual: record.delegation_hash.to_hex(),
            });
        }

        record.verify_signature()?;

        if record.emergency {
            return match self.emergency_authority(&record.revoker_key)? {
                Some(authority) if authority == record.revoker => Ok(()),
                _ => Err(Error::UnauthorizedRevoker(record.revoker.to_string())),
            };
        }

        if record.revoker != *delegation.delegator() {
            return Err(Error::UnauthorizedRevoker(record.revoker.to_string()));
        }
        match self.keys.current_key(delegation.delegator())? {
            Some(current) if current.public_key == record.revoker_key => {}
            _ => return Err(Error::UnauthorizedRevoker(record.revoker.to_string())),
        }
        if !delegation.is_revocable() {
            return Err(Error::NotRevocable(delegation.id().to_string()));
        }
        Ok(())
    }

    fn rejected(&self, delegation: &Delegation, key: &PublicKey, why: &str) {
        warn!(
            delegation = %delegation.id(),
            key = %key.fingerprint(),
            reason = why,
            "Revocation rejected"
        );
        self.audit.event(
            AuditEvent::new(
                AuditEventType::RevocationRejected,
                key.fingerprint(),
                self.clock.now(),
            )
            .with_subject(delegation.id().as_str())
            .with_key(key)
            .with_details(why),
        );
    }

    pub fn is_revoked(&self, delegation: &Delegation) -> Result<bool> {
        self.is_revoked_hash(&delegation.content_hash()?)
    }

    pub fn is_revoked_hash(&self, hash: &ContentHash) -> Result<bool> {
        self.store.contains(hash)
    }

    pub fn record(&self, hash: &ContentHash) -> Result<Option<RevocationRecord>> {
        self.store.get(hash)
    }

    /// Every record, for audit export.
    pub fn records(&self) -> Result<Vec<RevocationRecord>> {
        self.store.all()
    }

    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::clock::ManualClock;
    use crate::keys::KeyRotationManager;
    use crate::resource::AccessLevel;
    use crate::store::{MemoryKeyStore, MemoryRevocationStore};
    use chrono::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        keys: Arc<KeyRotationManager>,
        registry: RevocationRegistry,
        sink: Arc<MemorySink>,
        alice_key: SigningKey,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::epoch());
        let keys = Arc::new(KeyRotationManager::new(
            Arc::new(MemoryKeyStore::new()),
            clock.clone(),
        ));
        let alice_key = SigningKey::generate();
        keys.register_initial_key(&EntityId::from("alice"), alice_key.clone())
            .unwrap();
        let sink = Arc::new(MemorySink::new());
        let registry = RevocationRegistry::new(
            Arc::new(MemoryRevocationStore::new()),
            keys.clone(),
            clock.clone(),
        )
        .with_audit_sink(sink.clone());
        Fixture {
            clock,
            keys,
            registry,
            sink,
            alice_key,
        }
    }

    fn delegation(f: &Fixture, revocable: bool) -> Delegation {
        Delegation::builder()
            .delegator("alice")
            .delegatee("agent")
            .allow("docs/*")
            .level(AccessLevel::Read)
            .ttl(Duration::hours(1))
            .revocable(revocable)
            .sign(&f.keys)
            .unwrap()
    }

    #[test]
    fn test_delegator_revokes() {
        let f = fixture();
        let d = delegation(&f, true);
        assert!(!f.registry.is_revoked(&d).unwrap());

        let outcome = f.registry.revoke(&d, &f.alice_key, "done").unwrap();
        assert!(outcome.is_new());
        assert_eq!(outcome.record().revoker_key_version, Some(1));
        assert!(f.registry.is_revoked(&d).unwrap());
        assert_eq!(f.registry.len().unwrap(), 1);
        assert_eq!(
            f.sink.events()[0].event_type,
            AuditEventType::DelegationRevoked
        );
    }

    #[test]
    fn test_revocation_is_idempotent() {
        let f = fixture();
        let d = delegation(&f, true);
        let first = f.registry.revoke(&d, &f.alice_key, "first").unwrap();

        f.clock.advance(Duration::seconds(10));
        let second = f.registry.revoke(&d, &f.alice_key, "second").unwrap();

        assert!(!second.is_new());
        assert_eq!(second.record(), first.record());
        assert_eq!(second.record().reason, "first");
        assert_eq!(f.registry.len().unwrap(), 1);
    }

    #[test]
    fn test_stranger_cannot_revoke() {
        let f = fixture();
        let d = delegation(&f, true);
        let err = f
            .registry
            .revoke(&d, &SigningKey::generate(), "nope")
            .unwrap_err();
        assert!(matches!(err, Error::UnauthorizedRevoker(_)));
        assert!(!f.registry.is_revoked(&d).unwrap());
        assert_eq!(
            f.sink.events()[0].event_type,
            AuditEventType::RevocationRejected
        );
    }

    #[test]
    fn test_superseded_delegator_key_cannot_revoke() {
        let f = fixture();
        let d = delegation(&f, true);
        let new_key = SigningKey::generate();
        f.keys
            .rotate_key(&EntityId::from("alice"), new_key.clone(), "scheduled")
            .unwrap();

        assert!(f.registry.revoke(&d, &f.alice_key, "old key").is_err());
        assert!(f.registry.revoke(&d, &new_key, "new key").unwrap().is_new());
    }

    #[test]
    fn test_non_revocable_requires_emergency_authority() {
        let f = fixture();
        let d = delegation(&f, false);
        assert!(matches!(
            f.registry.revoke(&d, &f.alice_key, "try"),
            Err(Error::NotRevocable(_))
        ));

        let sec = SigningKey::generate();
        f.registry
            .add_emergency_authority(&EntityId::from("security"), sec.public_key())
            .unwrap();
        let outcome = f.registry.revoke(&d, &sec, "incident").unwrap();
        assert!(outcome.record().emergency);
        assert_eq!(outcome.record().revoker, EntityId::from("security"));
        assert!(f.registry.is_revoked(&d).unwrap());
    }

    #[test]
    fn test_revoke_signed_checks_target_and_freshness() {
        let f = fixture();
        let d1 = delegation(&f, true);
        let d2 = delegation(&f, true);

        let record = RevocationRecord::sign(
            &d1,
            EntityId::from("alice"),
            Some(1),
            "wrong target",
            f.clock.now(),
            false,
            &f.alice_key,
        )
        .unwrap();
        assert!(matches!(
            f.registry.revoke_signed(record.clone(), &d2),
            Err(Error::RevocationTargetMismatch { .. })
        ));

        f.clock.advance(Duration::minutes(10));
        assert!(matches!(
            f.registry.revoke_signed(record, &d1),
            Err(Error::Validation(_))
        ));
        assert!(!f.registry.is_revoked(&d1).unwrap());
    }

    #[test]
    fn test_revoke_signed_rejects_tampered_record() {
        let f = fixture();
        let d = delegation(&f, true);
        let mut record = RevocationRecord::sign(
            &d,
            EntityId::from("alice"),
            Some(1),
            "ok",
            f.clock.now(),
            false,
            &f.alice_key,
        )
        .unwrap();
        record.reason = "edited".into();
        assert!(matches!(
            f.registry.revoke_signed(record, &d),
            Err(Error::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_claimed_emergency_without_authority_rejected() {
        let f = fixture();
        let d = delegation(&f, false);
        let record = RevocationRecord::sign(
            &d,
            EntityId::from("alice"),
            None,
            "pretend",
            f.clock.now(),
            true,
            &f.alice_key,
        )
        .unwrap();
        assert!(matches!(
            f.registry.revoke_signed(record, &d),
            Err(Error::UnauthorizedRevoker(_))
        ));
    }
}
