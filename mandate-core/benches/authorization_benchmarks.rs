//! Benchmarks for the authorization pipeline and its hot components.

use chrono::Duration;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mandate::store::MemoryKeyStore;
use mandate::{
    AccessLevel, Action, AuthorizationRequest, Authorizer, Delegation, EngineConfig, EntityId,
    KeyRotationManager, ManualClock, ProofOfPossession, ResourceConstraintEngine, Signable,
    SigningKey,
};
use std::sync::Arc;

struct Fixture {
    clock: Arc<ManualClock>,
    keys: Arc<KeyRotationManager>,
    authorizer: Authorizer,
    agent: EntityId,
    agent_key: SigningKey,
    delegation: Delegation,
}

fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::epoch());
    let keys = Arc::new(KeyRotationManager::new(
        Arc::new(MemoryKeyStore::new()),
        clock.clone(),
    ));
    let issuer = EntityId::from("issuer");
    let agent = EntityId::from("agent");
    let agent_key = SigningKey::generate();
    keys.register_initial_key(&issuer, SigningKey::generate())
        .unwrap();
    keys.register_initial_key(&agent, agent_key.clone()).unwrap();

    let config = EngineConfig::from_yaml(
        "budget:\n  default_period_limit: 1000000000\n  default_per_action_limit: 10\n",
    )
    .unwrap();
    let authorizer = Authorizer::builder()
        .config(config)
        .clock(clock.clone())
        .key_resolver(keys.clone())
        .build()
        .unwrap();

    let delegation = Delegation::builder()
        .delegator(issuer)
        .delegatee(agent.clone())
        .allow("org:acme/*/read")
        .allow("org:acme/reports/**")
        .deny("org:acme/secrets/*")
        .level(AccessLevel::Write)
        .ttl(Duration::days(1))
        .sign(&keys)
        .unwrap();

    Fixture {
        clock,
        keys,
        authorizer,
        agent,
        agent_key,
        delegation,
    }
}

fn request(f: &Fixture, resource: &str, cost: u64) -> AuthorizationRequest {
    let nonce = f.authorizer.nonces().issue(&f.agent).unwrap();
    let action = Action::new("read", AccessLevel::Read, f.clock.now()).with_cost(cost);
    let proof = ProofOfPossession::new(&f.delegation, &action, resource, nonce.as_str())
        .unwrap()
        .sign(&f.agent_key)
        .unwrap();
    AuthorizationRequest {
        delegation: f.delegation.clone(),
        action,
        resource: resource.to_string(),
        proof,
        nonce: nonce.value,
        attestations: Vec::new(),
    }
}

fn benchmark_authorize(c: &mut Criterion) {
    let f = fixture();

    c.bench_function("authorize_allow", |b| {
        b.iter_batched(
            || request(&f, "org:acme/reports/q3", 1),
            |req| {
                let decision = f.authorizer.authorize_request(black_box(&req));
                assert!(decision.is_allowed());
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("authorize_deny_resource", |b| {
        b.iter_batched(
            || request(&f, "org:acme/secrets/read", 1),
            |req| {
                let decision = f.authorizer.authorize_request(black_box(&req));
                assert!(!decision.is_allowed());
            },
            BatchSize::SmallInput,
        )
    });

    let replayed = request(&f, "org:acme/reports/q3", 0);
    f.authorizer.authorize_request(&replayed);
    c.bench_function("authorize_deny_replay", |b| {
        b.iter(|| {
            let decision = f.authorizer.authorize_request(black_box(&replayed));
            assert!(!decision.is_allowed());
        })
    });
}

fn benchmark_delegation(c: &mut Criterion) {
    let f = fixture();

    c.bench_function("delegation_sign", |b| {
        b.iter(|| {
            Delegation::builder()
                .delegator("issuer")
                .delegatee("agent")
                .allow("org:acme/reports/**")
                .ttl(Duration::hours(1))
                .sign(black_box(&f.keys))
                .unwrap()
        })
    });

    c.bench_function("delegation_verify", |b| {
        b.iter(|| {
            f.delegation
                .verify_signature(black_box(f.keys.as_ref()))
                .unwrap()
        })
    });

    c.bench_function("delegation_content_hash", |b| {
        b.iter(|| black_box(&f.delegation).content_hash().unwrap())
    });

    let bytes = f.delegation.to_bytes().unwrap();
    c.bench_function("delegation_decode", |b| {
        b.iter(|| Delegation::from_bytes(black_box(&bytes)).unwrap())
    });
}

fn benchmark_resource_matching(c: &mut Criterion) {
    let mut engine = ResourceConstraintEngine::new();
    for team in ["eng", "ops", "finance", "legal", "sales"] {
        engine
            .add_allowed(&format!("org:acme/{}/**", team), AccessLevel::Read)
            .unwrap();
        engine
            .add_allowed(&format!("org:acme/{}/shared/*", team), AccessLevel::Write)
            .unwrap();
    }
    engine.add_denied("org:acme/*/secrets/**").unwrap();

    c.bench_function("resource_allow_recursive", |b| {
        b.iter(|| {
            engine
                .is_authorized(black_box("org:acme/ops/runbooks/db/restore"), AccessLevel::Read)
                .unwrap()
        })
    });

    c.bench_function("resource_deny_first", |b| {
        b.iter(|| {
            engine
                .is_authorized(black_box("org:acme/eng/secrets/prod/key"), AccessLevel::Read)
                .unwrap_err()
        })
    });
}

criterion_group!(
    benches,
    benchmark_authorize,
    benchmark_delegation,
    benchmark_resource_matching,
);

criterion_main!(benches);
