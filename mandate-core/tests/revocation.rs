//! Revocation registry behavior through the public API.

use chrono::Duration;
use mandate::store::{MemoryKeyStore, MemoryRevocationStore};
use mandate::{
    AuditEventType, Clock, Delegation, EntityId, Error, KeyRotationManager, ManualClock, MemorySink,
    RevocationRecord, RevocationRegistry, SigningKey,
};
use std::sync::Arc;

struct Setup {
    clock: Arc<ManualClock>,
    keys: Arc<KeyRotationManager>,
    registry: RevocationRegistry,
    sink: Arc<MemorySink>,
    delegator: EntityId,
    delegator_key: SigningKey,
}

fn setup() -> Setup {
    let clock = Arc::new(ManualClock::epoch());
    let keys = Arc::new(KeyRotationManager::new(
        Arc::new(MemoryKeyStore::new()),
        clock.clone(),
    ));
    let delegator = EntityId::from("ops-lead");
    let delegator_key = SigningKey::generate();
    keys.register_initial_key(&delegator, delegator_key.clone())
        .unwrap();

    let sink = Arc::new(MemorySink::new());
    let registry = RevocationRegistry::new(
        Arc::new(MemoryRevocationStore::new()),
        keys.clone(),
        clock.clone(),
    )
    .with_audit_sink(sink.clone());

    Setup {
        clock,
        keys,
        registry,
        sink,
        delegator,
        delegator_key,
    }
}

fn delegation(s: &Setup, revocable: bool) -> Delegation {
    Delegation::builder()
        .delegator(s.delegator.clone())
        .delegatee("deploy-bot")
        .allow("cluster:staging/**")
        .revocable(revocable)
        .ttl(Duration::hours(4))
        .sign(&s.keys)
        .unwrap()
}

#[test]
fn test_revocation_is_idempotent() {
    let s = setup();
    let d = delegation(&s, true);

    let first = s.registry.revoke(&d, &s.delegator_key, "rotated out").unwrap();
    assert!(first.is_new());
    assert!(s.registry.is_revoked(&d).unwrap());

    s.clock.advance(Duration::minutes(5));
    let second = s.registry.revoke(&d, &s.delegator_key, "again").unwrap();
    assert!(!second.is_new());
    assert_eq!(second.record(), first.record());
    assert!(s.registry.is_revoked(&d).unwrap());
    assert_eq!(s.registry.len().unwrap(), 1);
}

#[test]
fn test_only_delegator_can_revoke() {
    let s = setup();
    let d = delegation(&s, true);
    let stranger = SigningKey::generate();

    assert!(matches!(
        s.registry.revoke(&d, &stranger, "not mine"),
        Err(Error::UnauthorizedRevoker(_))
    ));
    assert!(!s.registry.is_revoked(&d).unwrap());

    let rejected = s
        .sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == AuditEventType::RevocationRejected)
        .count();
    assert_eq!(rejected, 1);
}

#[test]
fn test_forged_record_for_delegator_rejected() {
    let s = setup();
    let d = delegation(&s, true);
    let forger = SigningKey::generate();

    // Claims to come from the delegator but is signed by another key.
    let record = RevocationRecord::sign(
        &d,
        s.delegator.clone(),
        Some(1),
        "forged",
        s.clock.now(),
        false,
        &forger,
    )
    .unwrap();
    assert!(matches!(
        s.registry.revoke_signed(record, &d),
        Err(Error::UnauthorizedRevoker(_))
    ));
    assert!(!s.registry.is_revoked(&d).unwrap());
}

#[test]
fn test_emergency_authority_overrides_non_revocable() {
    let s = setup();
    let d = delegation(&s, false);

    assert!(matches!(
        s.registry.revoke(&d, &s.delegator_key, "changed my mind"),
        Err(Error::NotRevocable(_))
    ));

    let security = EntityId::from("security-team");
    let security_key = SigningKey::generate();
    s.registry
        .add_emergency_authority(&security, security_key.public_key())
        .unwrap();

    let outcome = s.registry.revoke(&d, &security_key, "key compromise").unwrap();
    assert!(outcome.record().emergency);
    assert_eq!(outcome.record().revoker, security);
    assert!(s.registry.is_revoked(&d).unwrap());
}

#[test]
fn test_stale_signed_record_rejected() {
    let s = setup();
    let d = delegation(&s, true);
    let record = RevocationRecord::sign(
        &d,
        s.delegator.clone(),
        Some(1),
        "late",
        s.clock.now(),
        false,
        &s.delegator_key,
    )
    .unwrap();

    s.clock.advance(Duration::hours(1));
    assert!(matches!(
        s.registry.revoke_signed(record, &d),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_record_lookup_by_hash() {
    use mandate::Signable;

    let s = setup();
    let d = delegation(&s, true);
    let other = delegation(&s, true);
    s.registry.revoke(&d, &s.delegator_key, "done").unwrap();

    let hash = d.content_hash().unwrap();
    assert!(s.registry.is_revoked_hash(&hash).unwrap());
    assert_eq!(s.registry.record(&hash).unwrap().unwrap().reason, "done");
    assert!(!s.registry.is_revoked(&other).unwrap());
}

#[test]
fn test_revocation_survives_key_rotation() {
    let s = setup();
    let d = delegation(&s, true);
    s.registry.revoke(&d, &s.delegator_key, "handover").unwrap();

    s.clock.advance(Duration::days(1));
    s.keys
        .rotate_key(&s.delegator, SigningKey::generate(), "scheduled")
        .unwrap();
    s.clock.advance(Duration::days(400));

    assert!(s.registry.is_revoked(&d).unwrap());
    assert_eq!(s.registry.records().unwrap().len(), 1);
}
