//! Nonce tracker replay protection.

use chrono::Duration;
use mandate::store::MemoryNonceStore;
use mandate::{Clock, EntityId, ManualClock, NonceTracker, ReasonCode};
use std::sync::Arc;
use std::thread;

fn tracker() -> (Arc<ManualClock>, NonceTracker) {
    let clock = Arc::new(ManualClock::epoch());
    let tracker = NonceTracker::new(Arc::new(MemoryNonceStore::new()), clock.clone())
        .with_ttl(Duration::seconds(300));
    (clock, tracker)
}

#[test]
fn test_second_presentation_is_replay() {
    let (_, t) = tracker();
    let owner = EntityId::from("agent");
    let nonce = t.issue(&owner).unwrap();

    assert_eq!(t.verify_and_consume(&owner, nonce.as_str()).unwrap(), Ok(()));
    assert_eq!(
        t.verify_and_consume(&owner, nonce.as_str()).unwrap(),
        Err(ReasonCode::ReplayDetected)
    );
    assert_eq!(
        t.verify_and_consume(&owner, nonce.as_str()).unwrap(),
        Err(ReasonCode::ReplayDetected)
    );
}

#[test]
fn test_unknown_and_foreign_nonces() {
    let (_, t) = tracker();
    let owner = EntityId::from("agent");
    let thief = EntityId::from("thief");
    let nonce = t.issue(&owner).unwrap();

    assert_eq!(
        t.verify_and_consume(&owner, "never-issued").unwrap(),
        Err(ReasonCode::UnknownNonce)
    );
    assert_eq!(
        t.verify_and_consume(&thief, nonce.as_str()).unwrap(),
        Err(ReasonCode::UnknownNonce)
    );
    // The failed theft did not burn it.
    assert_eq!(t.verify_and_consume(&owner, nonce.as_str()).unwrap(), Ok(()));
}

#[test]
fn test_expired_nonce_is_unknown() {
    let (clock, t) = tracker();
    let owner = EntityId::from("agent");
    let nonce = t.issue(&owner).unwrap();
    assert_eq!(nonce.expires_at, clock.now() + Duration::seconds(300));

    clock.advance(Duration::seconds(300));
    assert_eq!(
        t.verify_and_consume(&owner, nonce.as_str()).unwrap(),
        Err(ReasonCode::UnknownNonce)
    );
}

#[test]
fn test_purge_keeps_live_tombstones() {
    let (clock, t) = tracker();
    let owner = EntityId::from("agent");
    let used = t.issue(&owner).unwrap();
    t.verify_and_consume(&owner, used.as_str()).unwrap().unwrap();

    clock.advance(Duration::seconds(200));
    let fresh = t.issue(&owner).unwrap();
    assert_eq!(t.purge_expired().unwrap(), 0);

    // The consumed nonce still reports a replay while inside its TTL.
    assert_eq!(
        t.verify_and_consume(&owner, used.as_str()).unwrap(),
        Err(ReasonCode::ReplayDetected)
    );

    clock.advance(Duration::seconds(150));
    assert_eq!(t.purge_expired().unwrap(), 1);
    assert_eq!(t.tracked().unwrap(), 1);
    assert_eq!(t.verify_and_consume(&owner, fresh.as_str()).unwrap(), Ok(()));
}

#[test]
fn test_concurrent_consumption_succeeds_once() {
    let (_, t) = tracker();
    let t = Arc::new(t);
    let owner = EntityId::from("agent");
    let nonce = t.issue(&owner).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let t = t.clone();
            let owner = owner.clone();
            let value = nonce.value.clone();
            thread::spawn(move || t.verify_and_consume(&owner, &value).unwrap())
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .filter(|o| o.is_err())
        .all(|o| *o == Err(ReasonCode::ReplayDetected)));
}

#[test]
fn test_issued_nonces_are_distinct() {
    let (_, t) = tracker();
    let owner = EntityId::from("agent");
    let mut seen = std::collections::HashSet::new();
    for _ in 0..256 {
        assert!(seen.insert(t.issue(&owner).unwrap().value));
    }
    assert_eq!(t.tracked().unwrap(), 256);
}
