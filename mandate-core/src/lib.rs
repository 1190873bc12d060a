//! # Mandate Core
//!
//! Delegated-action authorization engine.
//!
//! An identity (the delegator) grants another (the delegatee) a signed,
//! scoped, time-bounded [`Delegation`]. Every action the delegatee performs
//! under it goes through [`Authorizer::authorize`], which composes seven
//! checks into one fail-closed [`Decision`]:
//!
//! 1. **Revocation**: the delegation has not been revoked
//! 2. **Timestamps**: the delegation is current and the request is fresh
//! 3. **Replay**: the request's nonce is consumed exactly once
//! 4. **Signatures**: the delegator signed with a key valid at issue time,
//!    and the delegatee proved possession of its key for this request
//! 5. **Witnesses**: a trust-weighted quorum attested the delegation
//! 6. **Resource scope**: deny patterns first, then least-privilege allows
//! 7. **Budget**: the action's cost fits the delegatee's period quota
//!
//! ## Example
//!
//! ```rust,ignore
//! use mandate::{Action, AccessLevel, Authorizer, Delegation, ProofOfPossession};
//!
//! let authorizer = Authorizer::builder()
//!     .config(EngineConfig::from_file("mandate.yaml")?)
//!     .key_resolver(keys.clone())
//!     .build()?;
//!
//! let delegation = Delegation::builder()
//!     .delegator("alice")
//!     .delegatee("agent-7")
//!     .allow("org:acme/reports/**")
//!     .level(AccessLevel::Read)
//!     .ttl(chrono::Duration::hours(8))
//!     .sign(&keys)?;
//!
//! // On the delegatee's side
//! let nonce = authorizer.nonces().issue(delegation.delegatee())?;
//! let action = Action::new("export", AccessLevel::Read, Utc::now()).with_cost(10);
//! let proof = ProofOfPossession::new(&delegation, &action, "org:acme/reports/q3", nonce.as_str())?
//!     .sign(&agent_key)?;
//!
//! let decision = authorizer.authorize(
//!     &delegation, &action, "org:acme/reports/q3", &proof, nonce.as_str(), &[],
//! );
//! ```

pub mod audit;
pub mod authorizer;
pub mod budget;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod identity;
pub mod keys;
pub mod nonce;
pub mod payload;
pub mod resource;
pub mod revocation;
pub mod store;
pub mod sweeper;
pub mod timestamp;
pub mod witness;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditEventType, AuditSink, AuthorizationRecord, MemorySink, NoOpSink, TracingSink};
pub use authorizer::{
    Action, AuthStage, AuthorizationRequest, Authorizer, AuthorizerBuilder, Check, Decision,
    ProofOfPossession,
};
pub use budget::{BudgetAccount, BudgetAlert, BudgetTracker, Deduction, ResetPolicy, UsageEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigValidationError, EngineConfig};
pub use crypto::{PublicKey, Signature, SigningKey};
pub use delegation::{Delegation, DelegationBuilder, DelegationId};
pub use error::{Error, ReasonCode, Result, Verdict};
pub use identity::EntityId;
pub use keys::{KeyResolver, KeyRotationManager, KeyStatus, KeyVersion, RotationCertificate};
pub use nonce::{Nonce, NonceTracker};
pub use payload::{ContentHash, Signable};
pub use resource::{AccessLevel, Polarity, ResourceConstraintEngine, ResourcePattern};
pub use revocation::{RevocationOutcome, RevocationRecord, RevocationRegistry};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
pub use timestamp::{TimestampContext, TimestampValidator};
pub use witness::{
    QuorumReport, TrustSource, WitnessAttestation, WitnessEnforcer, WitnessPolicy,
    WitnessReputation, WitnessRole,
};

/// Context string for Ed25519 signatures (prevents cross-protocol attacks).
///
/// All signatures are computed over: `SIGNATURE_CONTEXT || payload`
pub const SIGNATURE_CONTEXT: &[u8] = b"mandate-sig-v1";
