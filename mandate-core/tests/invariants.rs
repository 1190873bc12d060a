//! Property-based tests for the engine's safety invariants.
//!
//! 1. Budget conservation: the balance never goes negative and equals the
//!    limit minus every accepted deduction
//! 2. Deny precedence: a matching deny pattern wins over any allow
//! 3. Replay: each nonce is consumed at most once
//! 4. Canonical payloads: any change to a signed field changes the hash
//! 5. Clock skew: the future bound is exact

use chrono::Duration;
use mandate::store::{MemoryBudgetStore, MemoryKeyStore, MemoryNonceStore};
use mandate::{
    AccessLevel, BudgetTracker, Clock, Delegation, EntityId, KeyRotationManager, ManualClock,
    NonceTracker, ReasonCode, ResourceConstraintEngine, Signable, SigningKey, TimestampContext,
    TimestampValidator,
};
use proptest::prelude::*;
use std::sync::Arc;

// ============================================================================
// Strategies
// ============================================================================

fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z0-9_-]{1,10}"
}

fn arb_resource() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_segment(), 1..5)
}

fn arb_level() -> impl Strategy<Value = AccessLevel> {
    prop_oneof![
        Just(AccessLevel::Read),
        Just(AccessLevel::Write),
        Just(AccessLevel::Admin),
    ]
}

// ============================================================================
// Invariant 1: Budget conservation
// ============================================================================

proptest! {
    #[test]
    fn budget_balance_is_conserved(amounts in prop::collection::vec(1u64..200, 1..60)) {
        let clock = Arc::new(ManualClock::epoch());
        let tracker = BudgetTracker::new(Arc::new(MemoryBudgetStore::new()), clock);
        let entity = EntityId::from("agent");
        tracker.create_account(&entity, 1000, 100).unwrap();

        let mut spent = 0u64;
        for amount in amounts {
            match tracker.check_and_deduct(&entity, amount).unwrap() {
                Ok(deduction) => {
                    prop_assert!(amount <= 100);
                    spent += amount;
                    prop_assert_eq!(deduction.remaining, 1000 - spent);
                }
                Err(reason) => {
                    prop_assert_eq!(reason, ReasonCode::BudgetExceeded);
                    prop_assert!(amount > 100 || amount > 1000 - spent);
                }
            }
        }

        prop_assert!(spent <= 1000);
        prop_assert_eq!(tracker.remaining(&entity).unwrap(), 1000 - spent);
    }
}

// ============================================================================
// Invariant 2: Deny precedence
// ============================================================================

proptest! {
    #[test]
    fn deny_overrides_any_allow(
        segments in arb_resource(),
        level in arb_level(),
    ) {
        let resource = segments.join("/");
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed("**", AccessLevel::Admin).unwrap();
        engine.add_allowed(&resource, AccessLevel::Admin).unwrap();
        engine.add_denied(&resource).unwrap();

        prop_assert_eq!(
            engine.is_authorized(&resource, level),
            Err(ReasonCode::ResourceDenied)
        );
    }

    #[test]
    fn granted_level_never_exceeded(
        segments in arb_resource(),
        granted in arb_level(),
        requested in arb_level(),
    ) {
        let resource = segments.join("/");
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed(&resource, granted).unwrap();

        let verdict = engine.is_authorized(&resource, requested);
        prop_assert_eq!(verdict.is_ok(), requested <= granted);
    }

    #[test]
    fn unmatched_resource_is_denied(
        allowed in arb_resource(),
        requested in arb_resource(),
    ) {
        prop_assume!(allowed != requested);
        let mut engine = ResourceConstraintEngine::new();
        engine.add_allowed(&allowed.join("/"), AccessLevel::Admin).unwrap();

        prop_assert_eq!(
            engine.is_authorized(&requested.join("/"), AccessLevel::Read),
            Err(ReasonCode::ResourceDenied)
        );
    }
}

// ============================================================================
// Invariant 3: Replay
// ============================================================================

proptest! {
    #[test]
    fn nonce_consumed_at_most_once(
        issued in 1usize..8,
        attempts in prop::collection::vec(0usize..8, 1..40),
    ) {
        let clock = Arc::new(ManualClock::epoch());
        let tracker = NonceTracker::new(Arc::new(MemoryNonceStore::new()), clock);
        let owner = EntityId::from("agent");
        let nonces: Vec<_> = (0..issued).map(|_| tracker.issue(&owner).unwrap()).collect();
        let mut used = vec![false; issued];

        for i in attempts {
            let i = i % issued;
            let verdict = tracker.verify_and_consume(&owner, nonces[i].as_str()).unwrap();
            if used[i] {
                prop_assert_eq!(verdict, Err(ReasonCode::ReplayDetected));
            } else {
                prop_assert_eq!(verdict, Ok(()));
                used[i] = true;
            }
        }
    }
}

// ============================================================================
// Invariant 4: Canonical payloads
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn delegation_hash_tracks_signed_fields(
        allow in arb_resource(),
        other in arb_resource(),
        ttl_secs in 60i64..86_400,
    ) {
        prop_assume!(allow != other);
        let clock = Arc::new(ManualClock::epoch());
        let keys = KeyRotationManager::new(Arc::new(MemoryKeyStore::new()), clock.clone());
        let issuer = EntityId::from("issuer");
        keys.register_initial_key(&issuer, SigningKey::generate()).unwrap();

        let delegation = Delegation::builder()
            .delegator(issuer.clone())
            .delegatee("agent")
            .allow(allow.join("/"))
            .ttl(Duration::seconds(ttl_secs))
            .sign(&keys)
            .unwrap();
        prop_assert_eq!(delegation.verify_signature(&keys).unwrap(), Ok(1));

        // The same delegation survives transport unchanged.
        let decoded = Delegation::from_bytes(&delegation.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(
            decoded.content_hash().unwrap(),
            delegation.content_hash().unwrap()
        );

        // A different scope is a different payload.
        let rescoped = Delegation::builder()
            .delegator(issuer)
            .delegatee("agent")
            .allow(other.join("/"))
            .issued_at(delegation.issued_at())
            .expires_at(delegation.expires_at())
            .sign(&keys)
            .unwrap();
        prop_assert_ne!(
            rescoped.content_hash().unwrap(),
            delegation.content_hash().unwrap()
        );
    }
}

// ============================================================================
// Invariant 5: Clock skew
// ============================================================================

proptest! {
    #[test]
    fn future_bound_is_exact(skew_secs in 0i64..600, offset_secs in 0i64..1200) {
        let clock = Arc::new(ManualClock::epoch());
        let validator = TimestampValidator::new(clock.clone())
            .with_clock_skew(Duration::seconds(skew_secs));

        let ts = clock.now() + Duration::seconds(offset_secs);
        let verdict = validator.validate(ts, TimestampContext::Request);
        if offset_secs <= skew_secs {
            prop_assert_eq!(verdict, Ok(()));
        } else {
            prop_assert_eq!(verdict, Err(ReasonCode::FutureTimestamp));
        }
    }
}
