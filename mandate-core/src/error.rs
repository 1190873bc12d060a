//! Error types for Mandate.
//!
//! Two layers live here:
//!
//! - [`ReasonCode`]: the closed set of authorization outcomes. A denial is an
//!   ordinary result, never a fault, and every component reports it as a
//!   [`Verdict`].
//! - [`Error`]: operational faults (unknown entity, bad pattern, poisoned
//!   store). The authorizer never lets one of these turn into an allow: a
//!   fault during a check denies with that check's fail-closed reason
//!   (see [`Check::fail_closed`](crate::authorizer::Check::fail_closed)).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for Mandate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a single authorization check.
///
/// `Ok` carries whatever the check learned (the key version that verified,
/// the granted access level, the post-deduction balance); `Err` carries the
/// denial reason.
pub type Verdict<T = ()> = std::result::Result<T, ReasonCode>;

/// Canonical denial reasons.
///
/// Code ranges:
/// - 1100-1199: Signature and key errors
/// - 1300-1399: Temporal validation errors
/// - 1500-1599: Resource scope errors
/// - 1600-1699: Replay errors
/// - 1700-1799: Witness errors
/// - 1800-1899: Revocation errors
/// - 1900-1999: Budget errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u16)]
pub enum ReasonCode {
    // Signature and key errors (1100-1199)
    SignatureInvalid = 1100,
    KeyNotValidAtTimestamp = 1101,

    // Temporal validation errors (1300-1399)
    ExpiredTimestamp = 1300,
    FutureTimestamp = 1301,

    // Resource scope errors (1500-1599)
    ResourceDenied = 1500,

    // Replay errors (1600-1699)
    ReplayDetected = 1600,
    UnknownNonce = 1601,

    // Witness errors (1700-1799)
    InsufficientWitnesses = 1700,
    WitnessTrustTooLow = 1701,

    // Revocation errors (1800-1899)
    RevokedCredential = 1800,

    // Budget errors (1900-1999)
    BudgetExceeded = 1900,
}

impl ReasonCode {
    /// Every reason code, in code order.
    pub const ALL: [ReasonCode; 11] = [
        Self::SignatureInvalid,
        Self::KeyNotValidAtTimestamp,
        Self::ExpiredTimestamp,
        Self::FutureTimestamp,
        Self::ResourceDenied,
        Self::ReplayDetected,
        Self::UnknownNonce,
        Self::InsufficientWitnesses,
        Self::WitnessTrustTooLow,
        Self::RevokedCredential,
        Self::BudgetExceeded,
    ];

    /// Get the numeric code value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Get machine-readable name (kebab-case).
    pub fn name(self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature-invalid",
            Self::KeyNotValidAtTimestamp => "key-not-valid-at-timestamp",
            Self::ExpiredTimestamp => "expired-timestamp",
            Self::FutureTimestamp => "future-timestamp",
            Self::ResourceDenied => "resource-denied",
            Self::ReplayDetected => "replay-detected",
            Self::UnknownNonce => "unknown-nonce",
            Self::InsufficientWitnesses => "insufficient-witnesses",
            Self::WitnessTrustTooLow => "witness-trust-too-low",
            Self::RevokedCredential => "revoked-credential",
            Self::BudgetExceeded => "budget-exceeded",
        }
    }

    /// Get human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::SignatureInvalid => "Signature verification failed",
            Self::KeyNotValidAtTimestamp => "No valid signing key at the signature timestamp",
            Self::ExpiredTimestamp => "Timestamp is older than the allowed age",
            Self::FutureTimestamp => "Timestamp is beyond the allowed clock skew",
            Self::ResourceDenied => "Resource is outside the delegated scope",
            Self::ReplayDetected => "Nonce has already been consumed",
            Self::UnknownNonce => "Nonce is unknown or expired",
            Self::InsufficientWitnesses => "Witness quorum not met",
            Self::WitnessTrustTooLow => "Witness trust below policy threshold",
            Self::RevokedCredential => "Delegation has been revoked",
            Self::BudgetExceeded => "Budget limit exceeded",
        }
    }

    /// Terminal reasons mean the delegation itself is unusable; a new one
    /// must be issued.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RevokedCredential | Self::SignatureInvalid)
    }

    /// Recoverable reasons can be cleared by the caller without re-issuing
    /// credentials (wait for the budget period, fetch a fresh nonce, re-sign
    /// with a current timestamp).
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::BudgetExceeded
                | Self::ExpiredTimestamp
                | Self::FutureTimestamp
                | Self::UnknownNonce
                | Self::ReplayDetected
        )
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::error::Error for ReasonCode {}

/// Operational errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Identity and Key Errors
    // =========================================================================
    /// Entity has no registered keys.
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    /// Entity is already registered.
    #[error("entity already registered: {0}")]
    DuplicateEntity(String),

    /// Requested key version does not exist.
    #[error("unknown key version {version} for entity {entity}")]
    UnknownKeyVersion { entity: String, version: u32 },

    /// Key version was already revoked.
    #[error("key version {version} for entity {entity} is revoked")]
    KeyRevoked { entity: String, version: u32 },

    /// Entity has no active key able to sign.
    #[error("no active signing key for entity {0}")]
    NoActiveKey(String),

    /// New key reuses public key material already in the entity's history.
    #[error("key reuse rejected for entity {0}")]
    KeyReuse(String),

    // =========================================================================
    // Signature Errors
    // =========================================================================
    /// Signature verification failed.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Cryptographic operation failed.
    #[error("cryptographic error: {0}")]
    CryptoError(String),

    // =========================================================================
    // Revocation Errors
    // =========================================================================
    /// Revoker is neither the delegator nor an emergency authority.
    #[error("unauthorized revoker: {0}")]
    UnauthorizedRevoker(String),

    /// Delegation was issued as non-revocable and the revoker is not an
    /// emergency authority.
    #[error("delegation {0} is not revocable by its delegator")]
    NotRevocable(String),

    /// Revocation record does not target the given delegation.
    #[error("revocation target mismatch: expected {expected}, got {actual}")]
    RevocationTargetMismatch { expected: String, actual: String },

    // =========================================================================
    // Witness Errors
    // =========================================================================
    /// Witness is not registered.
    #[error("unknown witness: {0}")]
    UnknownWitness(String),

    /// Witness is already registered.
    #[error("witness already registered: {0}")]
    DuplicateWitness(String),

    /// Trust value outside [0, 1] or not finite.
    #[error("invalid trust value: {0}")]
    InvalidTrust(f64),

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Invalid pattern syntax.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Unrecognized access level name.
    #[error("invalid access level: {0}")]
    InvalidAccessLevel(String),

    // =========================================================================
    // Budget Errors
    // =========================================================================
    /// No budget account and no default limits to create one.
    #[error("unknown budget account: {0}")]
    UnknownAccount(String),

    /// Budget account already exists.
    #[error("budget account already exists: {0}")]
    DuplicateAccount(String),

    /// Budget limits are inconsistent.
    #[error("invalid budget limits: {0}")]
    InvalidLimits(String),

    /// A budget amount was zero.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    // =========================================================================
    // Nonce Errors
    // =========================================================================
    /// Freshly generated nonce collided with a live one.
    #[error("nonce collision")]
    NonceCollision,

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Serialization failed.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Canonical payload structure is invalid.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // =========================================================================
    // Configuration and Store Errors
    // =========================================================================
    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Component wiring is invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// A store lock was poisoned by a panicking holder.
    #[error("store poisoned: {0}")]
    StorePoisoned(&'static str),
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Error::DeserializationError(e.to_string())
    }
}

impl From<ciborium::value::Error> for Error {
    fn from(e: ciborium::value::Error) -> Self {
        Error::InvalidPayload(e.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::SignatureInvalid(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
