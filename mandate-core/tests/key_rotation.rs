//! Key validity at signing time across rotations and revocations.

use chrono::Duration;
use mandate::store::MemoryKeyStore;
use mandate::{
    AccessLevel, Action, Authorizer, Clock, Delegation, EngineConfig, EntityId, Error, KeyRotationManager,
    KeyStatus, ManualClock, ProofOfPossession, ReasonCode, SigningKey,
};
use std::sync::Arc;

fn manager() -> (Arc<ManualClock>, Arc<KeyRotationManager>) {
    let clock = Arc::new(ManualClock::epoch());
    let keys = Arc::new(
        KeyRotationManager::new(Arc::new(MemoryKeyStore::new()), clock.clone())
            .with_overlap(Duration::days(30)),
    );
    (clock, keys)
}

#[test]
fn test_old_signature_verifies_at_signing_time() {
    let (clock, keys) = manager();
    let entity = EntityId::from("issuer");
    keys.register_initial_key(&entity, SigningKey::generate())
        .unwrap();

    let signed_at = clock.now();
    let (signature, version) = keys.sign(&entity, b"grant").unwrap();
    assert_eq!(version, 1);

    clock.advance(Duration::days(1));
    assert_eq!(
        keys.rotate_key(&entity, SigningKey::generate(), "scheduled")
            .unwrap(),
        2
    );

    // Well past the overlap: version 1 no longer verifies anything current.
    clock.advance(Duration::days(60));
    assert_eq!(keys.status(&entity, 1).unwrap(), KeyStatus::Expired);

    assert_eq!(
        keys.verify(&entity, b"grant", &signature, signed_at).unwrap(),
        Ok(1)
    );
    assert_eq!(
        keys.verify(&entity, b"grant", &signature, clock.now()).unwrap(),
        Err(ReasonCode::SignatureInvalid)
    );
}

#[test]
fn test_overlap_window_boundaries() {
    let (clock, keys) = manager();
    let entity = EntityId::from("issuer");
    let old_key = SigningKey::generate();
    keys.register_initial_key(&entity, old_key.clone()).unwrap();

    clock.advance(Duration::days(1));
    let rotated_at = clock.now();
    keys.rotate_key(&entity, SigningKey::generate(), "scheduled")
        .unwrap();

    let v1 = &keys.key_history(&entity).unwrap()[0];
    assert_eq!(v1.valid_until, Some(rotated_at + Duration::days(30)));
    assert_eq!(v1.superseded_by, Some(2));

    // Only the new version signs.
    let (_, version) = keys.sign(&entity, b"new data").unwrap();
    assert_eq!(version, 2);

    // A stale client still signing with v1 is accepted until the overlap
    // closes, then rejected.
    let stale = old_key.sign(b"late");
    assert_eq!(
        keys.verify(&entity, b"late", &stale, rotated_at - Duration::hours(1))
            .unwrap(),
        Ok(1)
    );
    assert_eq!(
        keys.verify(&entity, b"late", &stale, rotated_at + Duration::days(1))
            .unwrap(),
        Ok(1)
    );
    assert_eq!(
        keys.verify(&entity, b"late", &stale, rotated_at + Duration::days(31))
            .unwrap(),
        Err(ReasonCode::SignatureInvalid)
    );
}

#[test]
fn test_revoked_version_never_verifies() {
    let (clock, keys) = manager();
    let entity = EntityId::from("issuer");
    keys.register_initial_key(&entity, SigningKey::generate())
        .unwrap();
    let signed_at = clock.now();
    let (signature, _) = keys.sign(&entity, b"grant").unwrap();

    clock.advance(Duration::days(1));
    keys.rotate_key(&entity, SigningKey::generate(), "compromise suspected")
        .unwrap();
    keys.revoke_key(&entity, 1, "confirmed compromise").unwrap();

    assert_eq!(keys.status(&entity, 1).unwrap(), KeyStatus::Revoked);
    assert_eq!(
        keys.verify(&entity, b"grant", &signature, signed_at).unwrap(),
        Err(ReasonCode::KeyNotValidAtTimestamp)
    );
    assert!(matches!(
        keys.revoke_key(&entity, 1, "again"),
        Err(Error::KeyRevoked { .. })
    ));
}

#[test]
fn test_revoking_current_key_stops_signing() {
    let (_, keys) = manager();
    let entity = EntityId::from("issuer");
    keys.register_initial_key(&entity, SigningKey::generate())
        .unwrap();
    keys.revoke_key(&entity, 1, "lost device").unwrap();

    assert!(matches!(
        keys.sign(&entity, b"anything"),
        Err(Error::NoActiveKey(_))
    ));
}

#[test]
fn test_rotation_chain_is_certified() {
    let (clock, keys) = manager();
    let entity = EntityId::from("issuer");
    keys.register_initial_key(&entity, SigningKey::generate())
        .unwrap();
    for _ in 0..3 {
        clock.advance(Duration::days(7));
        keys.rotate_key(&entity, SigningKey::generate(), "weekly")
            .unwrap();
    }

    assert_eq!(keys.current_version(&entity).unwrap(), 4);
    assert_eq!(keys.rotation_certificates(&entity).unwrap().len(), 3);
    assert_eq!(keys.verify_rotation_chain(&entity).unwrap(), Ok(()));

    let cert = keys.rotation_certificate(&entity, 3).unwrap().unwrap();
    assert_eq!(cert.previous_version, 2);
    assert!(cert
        .verify(&keys.public_key(&entity, 2).unwrap())
        .is_ok());
}

#[test]
fn test_key_reuse_rejected() {
    let (_, keys) = manager();
    let entity = EntityId::from("issuer");
    let key = SigningKey::generate();
    keys.register_initial_key(&entity, key.clone()).unwrap();

    assert!(matches!(
        keys.rotate_key(&entity, key, "oops"),
        Err(Error::KeyReuse(_))
    ));
}

#[test]
fn test_delegation_outlives_delegator_rotation() {
    let (clock, keys) = manager();
    let delegator = EntityId::from("issuer");
    let agent = EntityId::from("agent");
    let agent_key = SigningKey::generate();
    keys.register_initial_key(&delegator, SigningKey::generate())
        .unwrap();
    keys.register_initial_key(&agent, agent_key.clone()).unwrap();

    let authorizer = Authorizer::builder()
        .config(EngineConfig::default())
        .clock(clock.clone())
        .key_resolver(keys.clone())
        .build()
        .unwrap();

    let delegation = Delegation::builder()
        .delegator(delegator.clone())
        .delegatee(agent.clone())
        .allow("files/**")
        .ttl(Duration::days(90))
        .sign(&keys)
        .unwrap();
    assert_eq!(delegation.key_version(), 1);

    clock.advance(Duration::days(1));
    keys.rotate_key(&delegator, SigningKey::generate(), "scheduled")
        .unwrap();
    clock.advance(Duration::days(45));

    let nonce = authorizer.nonces().issue(&agent).unwrap();
    let action = Action::new("read", AccessLevel::Read, clock.now());
    let proof = ProofOfPossession::new(&delegation, &action, "files/report.pdf", nonce.as_str())
        .unwrap()
        .sign(&agent_key)
        .unwrap();

    let decision = authorizer.authorize(
        &delegation,
        &action,
        "files/report.pdf",
        &proof,
        nonce.as_str(),
        &[],
    );
    assert!(decision.is_allowed(), "{:?}", decision.reason());

    // Emergency revoke of the signing version kills the delegation.
    keys.revoke_key(&delegator, 1, "compromise").unwrap();
    let nonce = authorizer.nonces().issue(&agent).unwrap();
    let proof = ProofOfPossession::new(&delegation, &action, "files/report.pdf", nonce.as_str())
        .unwrap()
        .sign(&agent_key)
        .unwrap();
    let decision = authorizer.authorize(
        &delegation,
        &action,
        "files/report.pdf",
        &proof,
        nonce.as_str(),
        &[],
    );
    assert_eq!(decision.reason(), Some(ReasonCode::KeyNotValidAtTimestamp));
}
