//! Signed grants of limited authority.
//!
//! A [`Delegation`] lets a delegatee act for a delegator within a resource
//! scope, at a permission level, until it expires or is revoked. It is
//! signed by the delegator's current key; the key version is part of the
//! signed payload.
//!
//! Wire format: CBOR `[payload, signature]`, where `payload` is the
//! canonical envelope from [`crate::payload`]. Decoding re-encodes the
//! payload and rejects anything that is not byte-identical, so a decoded
//! delegation always hashes to what its delegator signed.

use crate::clock::truncate_millis;
use crate::crypto::{Signature, SigningKey};
use crate::error::{Error, Result, Verdict};
use crate::identity::EntityId;
use crate::keys::{verify_at, KeyResolver, KeyRotationManager};
use crate::payload::{CanonicalMap, Signable, DELEGATION_DOMAIN};
use crate::resource::{AccessLevel, ResourcePattern};
use crate::witness::WitnessPolicy;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

const DELEGATION_ID_PREFIX: &str = "mnd_dlg_";

/// Unique delegation identifier: `mnd_dlg_` followed by a UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DelegationId(String);

impl<'de> Deserialize<'de> for DelegationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        DelegationId::from_string(s).map_err(serde::de::Error::custom)
    }
}

impl DelegationId {
    /// Generate a new time-ordered ID.
    pub fn new() -> Self {
        Self(format!("{}{}", DELEGATION_ID_PREFIX, Uuid::now_v7().simple()))
    }

    pub fn from_string(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if !s.starts_with(DELEGATION_ID_PREFIX) {
            return Err(Error::Validation(format!(
                "delegation ID must start with '{}', got: {}",
                DELEGATION_ID_PREFIX,
                s.get(..20).unwrap_or(&s)
            )));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DelegationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signed delegation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    id: DelegationId,
    delegator: EntityId,
    delegatee: EntityId,
    allow: BTreeSet<String>,
    deny: BTreeSet<String>,
    level: AccessLevel,
    witnesses: Option<WitnessPolicy>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revocable: bool,
    key_version: u32,
    signature: Signature,
}

impl Signable for Delegation {
    const DOMAIN: &'static str = DELEGATION_DOMAIN;

    fn canonical_fields(&self) -> Result<CanonicalMap> {
        CanonicalMap::new()
            .field(0, &self.id)?
            .field(1, &self.delegator)?
            .field(2, &self.delegatee)?
            .field(3, &self.allow)?
            .field(4, &self.deny)?
            .field(5, &self.level)?
            .optional(6, self.witnesses.as_ref())?
            .field(7, &self.issued_at.timestamp_millis())?
            .field(8, &self.expires_at.timestamp_millis())?
            .field(9, &self.revocable)?
            .field(10, &self.key_version)
    }
}

impl Delegation {
    pub fn builder() -> DelegationBuilder {
        DelegationBuilder::new()
    }

    pub fn id(&self) -> &DelegationId {
        &self.id
    }

    pub fn delegator(&self) -> &EntityId {
        &self.delegator
    }

    pub fn delegatee(&self) -> &EntityId {
        &self.delegatee
    }

    /// Allowed resource patterns, granted at [`Self::level`].
    pub fn allow(&self) -> &BTreeSet<String> {
        &self.allow
    }

    /// Denied resource patterns; they win over any allow.
    pub fn deny(&self) -> &BTreeSet<String> {
        &self.deny
    }

    pub fn level(&self) -> AccessLevel {
        self.level
    }

    pub fn witness_policy(&self) -> Option<&WitnessPolicy> {
        self.witnesses.as_ref()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_revocable(&self) -> bool {
        self.revocable
    }

    /// Version of the delegator's key that signed this delegation.
    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Verify the delegator's signature with the key that was valid when the
    /// delegation was issued. Returns the verifying key version.
    pub fn verify_signature(&self, keys: &dyn KeyResolver) -> Result<Verdict<u32>> {
        let verdict = verify_at(
            keys,
            &self.delegator,
            &self.signing_bytes()?,
            &self.signature,
            self.issued_at,
        )?;
        if let Err(reason) = verdict {
            debug!(
                delegation = %self.id,
                delegator = %self.delegator,
                issued_at = %self.issued_at,
                %reason,
                "Delegator signature rejected"
            );
        }
        Ok(verdict)
    }

    /// Encode for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = self.signing_bytes()?;
        let signature = self.signature.to_bytes();
        let mut out = Vec::new();
        ciborium::ser::into_writer(
            &(
                serde_bytes::Bytes::new(&payload),
                serde_bytes::Bytes::new(&signature),
            ),
            &mut out,
        )?;
        Ok(out)
    }

    /// Decode from transport. The signature is not verified here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (payload, signature): (serde_bytes::ByteBuf, serde_bytes::ByteBuf) =
            ciborium::de::from_reader(bytes)?;
        let signature: [u8; 64] = signature
            .into_vec()
            .try_into()
            .map_err(|_| Error::InvalidPayload("signature must be 64 bytes".into()))?;

        let mut map = CanonicalMap::decode(&payload, DELEGATION_DOMAIN)?;
        let delegation = Self {
            id: map.take(0)?,
            delegator: map.take(1)?,
            delegatee: map.take(2)?,
            allow: map.take(3)?,
            deny: map.take(4)?,
            level: map.take(5)?,
            witnesses: map.take_optional(6)?,
            issued_at: from_millis(map.take(7)?)?,
            expires_at: from_millis(map.take(8)?)?,
            revocable: map.take(9)?,
            key_version: map.take(10)?,
            signature: Signature::from_bytes(&signature),
        };
        map.finish()?;

        if delegation.signing_bytes()? != payload.as_slice() {
            return Err(Error::InvalidPayload(
                "delegation payload is not canonically encoded".into(),
            ));
        }
        Ok(delegation)
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::InvalidPayload(format!("timestamp out of range: {}", ms)))
}

/// Builder for delegations.
#[derive(Debug, Clone)]
pub struct DelegationBuilder {
    delegator: Option<EntityId>,
    delegatee: Option<EntityId>,
    allow: BTreeSet<String>,
    deny: BTreeSet<String>,
    level: AccessLevel,
    witnesses: Option<WitnessPolicy>,
    issued_at: Option<DateTime<Utc>>,
    ttl: Option<Duration>,
    expires_at: Option<DateTime<Utc>>,
    revocable: bool,
}

impl DelegationBuilder {
    pub fn new() -> Self {
        Self {
            delegator: None,
            delegatee: None,
            allow: BTreeSet::new(),
            deny: BTreeSet::new(),
            level: AccessLevel::Read,
            witnesses: None,
            issued_at: None,
            ttl: None,
            expires_at: None,
            revocable: true,
        }
    }

    pub fn delegator(mut self, delegator: impl Into<EntityId>) -> Self {
        self.delegator = Some(delegator.into());
        self
    }

    pub fn delegatee(mut self, delegatee: impl Into<EntityId>) -> Self {
        self.delegatee = Some(delegatee.into());
        self
    }

    /// Add an allowed resource pattern.
    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.allow.insert(pattern.into());
        self
    }

    /// Add a denied resource pattern.
    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.deny.insert(pattern.into());
        self
    }

    pub fn level(mut self, level: AccessLevel) -> Self {
        self.level = level;
        self
    }

    /// Require a witness quorum over the delegation hash.
    pub fn witnesses(mut self, policy: WitnessPolicy) -> Self {
        self.witnesses = Some(policy);
        self
    }

    /// Issue time. Defaults to the signing time.
    pub fn issued_at(mut self, at: DateTime<Utc>) -> Self {
        self.issued_at = Some(at);
        self
    }

    /// Lifetime from the issue time.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Non-revocable delegations can only be revoked by an emergency
    /// authority.
    pub fn revocable(mut self, revocable: bool) -> Self {
        self.revocable = revocable;
        self
    }

    /// Sign with the delegator's current key held by `keys`.
    pub fn sign(self, keys: &KeyRotationManager) -> Result<Delegation> {
        let delegator = self
            .delegator
            .clone()
            .ok_or_else(|| Error::Validation("delegator is required".into()))?;
        let version = keys.current_version(&delegator)?;
        let issued_at = self.issued_at.unwrap_or_else(|| keys.clock().now());
        let mut delegation = self.unsigned(issued_at, version)?;

        let (signature, signed_with) = keys.sign(&delegator, &delegation.signing_bytes()?)?;
        if signed_with != version {
            return Err(Error::Validation(format!(
                "key for {} rotated during signing ({} -> {})",
                delegator, version, signed_with
            )));
        }
        delegation.signature = signature;
        Ok(delegation)
    }

    /// Sign with an explicit key, recording `key_version` as its version.
    pub fn sign_with(self, key: &SigningKey, key_version: u32) -> Result<Delegation> {
        let issued_at = self.issued_at.unwrap_or_else(Utc::now);
        let mut delegation = self.unsigned(issued_at, key_version)?;
        delegation.signature = key.sign(&delegation.signing_bytes()?);
        Ok(delegation)
    }

    fn unsigned(self, issued_at: DateTime<Utc>, key_version: u32) -> Result<Delegation> {
        let delegator = self
            .delegator
            .ok_or_else(|| Error::Validation("delegator is required".into()))?;
        let delegatee = self
            .delegatee
            .ok_or_else(|| Error::Validation("delegatee is required".into()))?;

        let issued_at = truncate_millis(issued_at);
        let expires_at = match (self.expires_at, self.ttl) {
            (Some(at), _) => truncate_millis(at),
            (None, Some(ttl)) => issued_at + ttl,
            (None, None) => return Err(Error::Validation("ttl or expires_at is required".into())),
        };
        if expires_at <= issued_at {
            return Err(Error::Validation(format!(
                "delegation expires ({}) before it is issued ({})",
                expires_at, issued_at
            )));
        }

        for pattern in &self.allow {
            ResourcePattern::allow(pattern, self.level)?;
        }
        for pattern in &self.deny {
            ResourcePattern::deny(pattern)?;
        }
        if let Some(policy) = &self.witnesses {
            policy.validate()?;
        }

        Ok(Delegation {
            id: DelegationId::new(),
            delegator,
            delegatee,
            allow: self.allow,
            deny: self.deny,
            level: self.level,
            witnesses: self.witnesses,
            issued_at,
            expires_at,
            revocable: self.revocable,
            key_version,
            signature: Signature::from_bytes(&[0u8; 64]),
        })
    }
}

impl Default for DelegationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
