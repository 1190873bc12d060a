//! Versioned signing keys with rotation overlap windows.
//!
//! Each entity owns a [`KeyRing`]: an append-only list of [`KeyVersion`]s.
//!
//! ## Rotation
//!
//! ```text
//! v1 [valid_from ─────────────── valid_until)        overlap: verify only
//! v2                [valid_from ──────────────── ...  current: signs
//!                   ^ rotate_key
//! ```
//!
//! - Only the current version signs new data.
//! - A superseded version stays valid for verification until the overlap
//!   window closes.
//! - `verify(.., at)` accepts any version that was valid at `at`. Old
//!   signatures on old delegations keep verifying after rotation.
//! - `revoke_key` takes a version out of service for signing and
//!   verification at once, regardless of any overlap window.
//!
//! Every rotation performed while the outgoing private key is held produces
//! a [`RotationCertificate`] signed by that outgoing key.

use crate::audit::{AuditEvent, AuditEventType, AuditSink, NoOpSink};
use crate::clock::{truncate_millis, Clock};
use crate::config::EngineConfig;
use crate::crypto::{PublicKey, Signature, SigningKey};
use crate::error::{Error, ReasonCode, Result, Verdict};
use crate::identity::EntityId;
use crate::payload::{CanonicalMap, Signable, ROTATION_DOMAIN};
use crate::store::KeyStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default window during which a superseded key still verifies.
pub const DEFAULT_OVERLAP_DAYS: i64 = 30;

/// Default retention of expired or revoked versions before pruning.
pub const DEFAULT_CLEANUP_GRACE_DAYS: i64 = 90;

/// Lifecycle state of a key version at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Current version; signs and verifies.
    Active,
    /// Superseded but inside the overlap window; verifies only.
    Overlapping,
    /// Overlap window closed.
    Expired,
    /// Emergency-revoked.
    Revoked,
}

/// A signing key valid for a bounded interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    pub entity: EntityId,
    pub version: u32,
    pub public_key: PublicKey,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub rotation_reason: Option<String>,
    pub superseded_by: Option<u32>,
}

impl KeyVersion {
    fn new(entity: &EntityId, version: u32, public_key: PublicKey, from: DateTime<Utc>) -> Self {
        Self {
            entity: entity.clone(),
            version,
            public_key,
            valid_from: from,
            valid_until: None,
            revoked_at: None,
            revocation_reason: None,
            rotation_reason: None,
            superseded_by: None,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// True when this version may verify a signature made at `at`.
    ///
    /// A revoked version is never valid, whatever `at` is.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        !self.is_revoked()
            && at >= self.valid_from
            && self.valid_until.map_or(true, |until| at < until)
    }

    pub fn status(&self, now: DateTime<Utc>) -> KeyStatus {
        if self.is_revoked() {
            return KeyStatus::Revoked;
        }
        match self.valid_until {
            None => KeyStatus::Active,
            Some(until) if now < until => KeyStatus::Overlapping,
            Some(_) => KeyStatus::Expired,
        }
    }
}

/// Proof that a rotation was authorized by the outgoing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationCertificate {
    pub entity: EntityId,
    pub previous_version: u32,
    pub new_version: u32,
    pub new_public_key: PublicKey,
    pub reason: String,
    pub rotated_at: DateTime<Utc>,
    pub signature: Signature,
}

impl Signable for RotationCertificate {
    const DOMAIN: &'static str = ROTATION_DOMAIN;

    fn canonical_fields(&self) -> Result<CanonicalMap> {
        CanonicalMap::new()
            .field(0, &self.entity)?
            .field(1, &self.previous_version)?
            .field(2, &self.new_version)?
            .field(3, &self.new_public_key)?
            .field(4, &self.reason)?
            .field(5, &self.rotated_at.timestamp_millis())
    }
}

impl RotationCertificate {
    /// Verify the certificate against the outgoing version's public key.
    pub fn verify(&self, previous_key: &PublicKey) -> Result<()> {
        previous_key.verify(&self.signing_bytes()?, &self.signature)
    }
}

/// All key versions of one entity, plus the current private key if this
/// process holds it.
///
/// Version numbers only ever grow: `last_version` survives pruning, and the
/// public keys of pruned versions stay in `retired` so they can never be
/// rotated back in.
#[derive(Debug, Clone)]
pub struct KeyRing {
    entity: EntityId,
    versions: Vec<KeyVersion>,
    last_version: u32,
    retired: Vec<PublicKey>,
    signer: Option<(u32, SigningKey)>,
    certificates: Vec<RotationCertificate>,
}

impl KeyRing {
    fn new(first: KeyVersion, signer: Option<SigningKey>) -> Self {
        let version = first.version;
        Self {
            entity: first.entity.clone(),
            versions: vec![first],
            last_version: version,
            retired: Vec::new(),
            signer: signer.map(|key| (version, key)),
            certificates: Vec::new(),
        }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    /// Versions in ascending order.
    pub fn versions(&self) -> &[KeyVersion] {
        &self.versions
    }

    pub fn version(&self, version: u32) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// The version allowed to sign, if any.
    pub fn current(&self) -> Option<&KeyVersion> {
        self.versions
            .iter()
            .rev()
            .find(|v| !v.is_revoked() && v.valid_until.is_none())
    }

    /// Every version valid at `at`, newest first. More than one inside an
    /// overlap window.
    pub fn keys_at(&self, at: DateTime<Utc>) -> impl Iterator<Item = &KeyVersion> {
        self.versions.iter().rev().filter(move |v| v.is_valid_at(at))
    }

    pub fn certificates(&self) -> &[RotationCertificate] {
        &self.certificates
    }

    pub fn can_sign(&self) -> bool {
        matches!((&self.signer, self.current()), (Some((v, _)), Some(cur)) if *v == cur.version)
    }

    /// Highest version ever issued, including pruned ones.
    pub fn last_version(&self) -> u32 {
        self.last_version
    }

    fn next_version(&self) -> u32 {
        self.last_version + 1
    }

    fn contains_key(&self, key: &PublicKey) -> bool {
        self.versions.iter().any(|v| v.public_key == *key) || self.retired.contains(key)
    }

    /// Drop versions that ended before `cutoff`, except the newest one.
    fn prune(&mut self, cutoff: DateTime<Utc>) -> usize {
        let last = self.last_version;
        let (kept, pruned): (Vec<KeyVersion>, Vec<KeyVersion>) =
            std::mem::take(&mut self.versions)
                .into_iter()
                .partition(|v| {
                    let ended = match (v.revoked_at, v.valid_until) {
                        (Some(revoked), _) => Some(revoked),
                        (None, until) => until,
                    };
                    v.version == last || ended.map_or(true, |end| end >= cutoff)
                });
        self.versions = kept;
        self.retired.extend(pruned.iter().map(|v| v.public_key.clone()));

        let versions = &self.versions;
        self.certificates
            .retain(|c| versions.iter().any(|v| v.version == c.new_version));
        pruned.len()
    }
}

/// Resolves an entity's keys. The engine's view of the identity registry.
pub trait KeyResolver: Send + Sync + Debug {
    /// The version currently allowed to sign.
    fn current_key(&self, entity: &EntityId) -> Result<Option<KeyVersion>>;

    /// Every version that was valid at `at`, newest first.
    fn keys_at(&self, entity: &EntityId, at: DateTime<Utc>) -> Result<Vec<KeyVersion>>;

    /// The newest version that was valid at `at`.
    fn key_at(&self, entity: &EntityId, at: DateTime<Utc>) -> Result<Option<KeyVersion>> {
        Ok(self.keys_at(entity, at)?.into_iter().next())
    }
}

/// Verify `signature` over `data` with any version of `entity`'s key that
/// was valid at `at`. Returns the verifying version.
///
/// No version valid at `at` gives `KeyNotValidAtTimestamp`; versions that
/// exist but reject the signature give `SignatureInvalid`.
pub fn verify_at(
    keys: &dyn KeyResolver,
    entity: &EntityId,
    data: &[u8],
    signature: &Signature,
    at: DateTime<Utc>,
) -> Result<Verdict<u32>> {
    let candidates = keys.keys_at(entity, at)?;
    if candidates.is_empty() {
        debug!(entity = %entity, at = %at, "No key version valid at timestamp");
        return Ok(Err(ReasonCode::KeyNotValidAtTimestamp));
    }
    for candidate in &candidates {
        if candidate.public_key.verify(data, signature).is_ok() {
            return Ok(Ok(candidate.version));
        }
    }
    debug!(
        entity = %entity,
        tried = candidates.len(),
        "Signature rejected by every valid key version"
    );
    Ok(Err(ReasonCode::SignatureInvalid))
}

/// Manages per-entity key versions.
#[derive(Debug)]
pub struct KeyRotationManager {
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    overlap: Duration,
    audit: Arc<dyn AuditSink>,
}

impl KeyRotationManager {
    pub fn new(store: Arc<dyn KeyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            overlap: Duration::days(DEFAULT_OVERLAP_DAYS),
            audit: Arc::new(NoOpSink),
        }
    }

    /// Build a manager with the overlap window from `keys.overlap_days`.
    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.ensure_valid()?;
        Ok(Self::new(store, clock).with_overlap(config.key_overlap()))
    }

    pub fn with_overlap(mut self, overlap: Duration) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn overlap(&self) -> Duration {
        self.overlap
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn now(&self) -> DateTime<Utc> {
        truncate_millis(self.clock.now())
    }

    /// Register an entity with its first signing key (version 1).
    pub fn register_initial_key(&self, entity: &EntityId, key: SigningKey) -> Result<KeyVersion> {
        let first = KeyVersion::new(entity, 1, key.public_key(), self.now());
        self.register(first, Some(key))
    }

    /// Register an entity whose private key lives elsewhere. Its signatures
    /// can be verified but this manager cannot sign for it.
    pub fn register_public_key(&self, entity: &EntityId, key: PublicKey) -> Result<KeyVersion> {
        let first = KeyVersion::new(entity, 1, key, self.now());
        self.register(first, None)
    }

    fn register(&self, first: KeyVersion, signer: Option<SigningKey>) -> Result<KeyVersion> {
        let entity = first.entity.clone();
        if !self.store.insert(KeyRing::new(first.clone(), signer))? {
            return Err(Error::DuplicateEntity(entity.to_string()));
        }

        info!(
            entity = %entity,
            key = %first.public_key.fingerprint(),
            "Registered initial key"
        );
        self.audit.event(
            AuditEvent::new(AuditEventType::KeyRegistered, entity.as_str(), first.valid_from)
                .with_key(&first.public_key)
                .with_details("version 1"),
        );
        Ok(first)
    }

    /// Rotate to a new key. The previous version enters its overlap window.
    pub fn rotate_key(&self, entity: &EntityId, new_key: SigningKey, reason: &str) -> Result<u32> {
        self.rotate(entity, new_key.public_key(), Some(new_key), reason)
    }

    /// Rotate a verify-only entity to a new public key.
    pub fn rotate_public_key(&self, entity: &EntityId, new_key: PublicKey, reason: &str) -> Result<u32> {
        self.rotate(entity, new_key, None, reason)
    }

    fn rotate(
        &self,
        entity: &EntityId,
        new_public: PublicKey,
        new_signer: Option<SigningKey>,
        reason: &str,
    ) -> Result<u32> {
        let now = self.now();
        let overlap = self.overlap;
        let mut new_version = 0;
        let mut certified = false;
        let mut new_signer = new_signer;

        let found = self.store.update(entity, &mut |ring: &mut KeyRing| {
            if ring.contains_key(&new_public) {
                return Err(Error::KeyReuse(ring.entity.to_string()));
            }
            new_version = ring.next_version();

            let certificate = match (ring.current().map(|v| v.version), &ring.signer) {
                (Some(current), Some((held, signer))) if current == *held => {
                    let mut cert = RotationCertificate {
                        entity: ring.entity.clone(),
                        previous_version: current,
                        new_version,
                        new_public_key: new_public.clone(),
                        reason: reason.to_string(),
                        rotated_at: now,
                        signature: Signature::from_bytes(&[0u8; 64]),
                    };
                    cert.signature = signer.sign(&cert.signing_bytes()?);
                    Some(cert)
                }
                _ => None,
            };

            if let Some(current) = ring
                .versions
                .iter_mut()
                .rev()
                .find(|v| !v.is_revoked() && v.valid_until.is_none())
            {
                current.valid_until = Some(now + overlap);
                current.superseded_by = Some(new_version);
            }

            let mut next = KeyVersion::new(&ring.entity, new_version, new_public.clone(), now);
            next.rotation_reason = Some(reason.to_string());
            ring.versions.push(next);
            ring.last_version = new_version;
            ring.signer = new_signer.take().map(|key| (new_version, key));

            certified = certificate.is_some();
            if let Some(cert) = certificate {
                ring.certificates.push(cert);
            }
            Ok(())
        })?;

        if !found {
            return Err(Error::UnknownEntity(entity.to_string()));
        }

        info!(
            entity = %entity,
            version = new_version,
            certified,
            reason,
            "Rotated key"
        );
        self.audit.event(
            AuditEvent::new(AuditEventType::KeyRotated, entity.as_str(), now)
                .with_key(&new_public)
                .with_details(format!("version {}: {}", new_version, reason)),
        );
        Ok(new_version)
    }

    /// Emergency revoke: the version stops signing and verifying at once.
    pub fn revoke_key(&self, entity: &EntityId, version: u32, reason: &str) -> Result<()> {
        let now = self.now();
        let mut fingerprint = String::new();

        let found = self.store.update(entity, &mut |ring: &mut KeyRing| {
            let target = ring
                .versions
                .iter_mut()
                .find(|v| v.version == version)
                .ok_or_else(|| Error::UnknownKeyVersion {
                    entity: entity.to_string(),
                    version,
                })?;
            if target.is_revoked() {
                return Err(Error::KeyRevoked {
                    entity: entity.to_string(),
                    version,
                });
            }
            target.revoked_at = Some(now);
            target.revocation_reason = Some(reason.to_string());
            fingerprint = target.public_key.fingerprint();

            if matches!(ring.signer, Some((held, _)) if held == version) {
                ring.signer = None;
            }
            Ok(())
        })?;

        if !found {
            return Err(Error::UnknownEntity(entity.to_string()));
        }

        warn!(
            entity = %entity,
            version,
            key = %fingerprint,
            reason,
            "Key version revoked"
        );
        self.audit.event(
            AuditEvent::new(AuditEventType::KeyRevoked, entity.as_str(), now)
                .with_details(format!("version {}: {}", version, reason)),
        );
        Ok(())
    }

    /// Sign with the entity's current key.
    pub fn sign(&self, entity: &EntityId, data: &[u8]) -> Result<(Signature, u32)> {
        let mut signed: Option<(Signature, u32)> = None;
        let found = self.store.read(entity, &mut |ring: &KeyRing| {
            if let (Some(current), Some((held, key))) = (ring.current(), &ring.signer) {
                if current.version == *held {
                    signed = Some((key.sign(data), *held));
                }
            }
        })?;

        if !found {
            return Err(Error::UnknownEntity(entity.to_string()));
        }
        signed.ok_or_else(|| Error::NoActiveKey(entity.to_string()))
    }

    /// Verify a signature with a key version that was valid at `at`.
    ///
    /// Returns the verifying version on success.
    pub fn verify(
        &self,
        entity: &EntityId,
        data: &[u8],
        signature: &Signature,
        at: DateTime<Utc>,
    ) -> Result<Verdict<u32>> {
        verify_at(self, entity, data, signature, at)
    }

    pub fn current_version(&self, entity: &EntityId) -> Result<u32> {
        KeyResolver::current_key(self, entity)?
            .map(|v| v.version)
            .ok_or_else(|| Error::NoActiveKey(entity.to_string()))
    }

    pub fn public_key(&self, entity: &EntityId, version: u32) -> Result<PublicKey> {
        let history = self.key_history(entity)?;
        history
            .into_iter()
            .find(|v| v.version == version)
            .map(|v| v.public_key)
            .ok_or_else(|| Error::UnknownKeyVersion {
                entity: entity.to_string(),
                version,
            })
    }

    pub fn status(&self, entity: &EntityId, version: u32) -> Result<KeyStatus> {
        let now = self.clock.now();
        self.key_history(entity)?
            .into_iter()
            .find(|v| v.version == version)
            .map(|v| v.status(now))
            .ok_or_else(|| Error::UnknownKeyVersion {
                entity: entity.to_string(),
                version,
            })
    }

    /// All retained versions, oldest first.
    pub fn key_history(&self, entity: &EntityId) -> Result<Vec<KeyVersion>> {
        let mut history = Vec::new();
        if !self
            .store
            .read(entity, &mut |ring: &KeyRing| history = ring.versions.clone())?
        {
            return Err(Error::UnknownEntity(entity.to_string()));
        }
        Ok(history)
    }

    pub fn rotation_certificates(&self, entity: &EntityId) -> Result<Vec<RotationCertificate>> {
        let mut certs = Vec::new();
        if !self
            .store
            .read(entity, &mut |ring: &KeyRing| certs = ring.certificates.clone())?
        {
            return Err(Error::UnknownEntity(entity.to_string()));
        }
        Ok(certs)
    }

    /// The certificate that introduced `version`, if one was issued.
    pub fn rotation_certificate(
        &self,
        entity: &EntityId,
        version: u32,
    ) -> Result<Option<RotationCertificate>> {
        Ok(self
            .rotation_certificates(entity)?
            .into_iter()
            .find(|c| c.new_version == version))
    }

    /// Check every retained rotation certificate against the outgoing key
    /// it claims, and that it names the key actually installed.
    pub fn verify_rotation_chain(&self, entity: &EntityId) -> Result<Verdict> {
        let history = self.key_history(entity)?;
        for cert in self.rotation_certificates(entity)? {
            let Some(previous) = history.iter().find(|v| v.version == cert.previous_version)
            else {
                continue;
            };
            let installed = history
                .iter()
                .find(|v| v.version == cert.new_version)
                .map(|v| &v.public_key);
            if installed != Some(&cert.new_public_key) || cert.verify(&previous.public_key).is_err()
            {
                warn!(
                    entity = %entity,
                    from = cert.previous_version,
                    to = cert.new_version,
                    "Rotation certificate does not verify"
                );
                return Ok(Err(ReasonCode::SignatureInvalid));
            }
        }
        Ok(Ok(()))
    }

    /// Drop versions that expired or were revoked more than `grace` ago.
    /// The current and the newest version are never dropped. Returns the
    /// number removed.
    pub fn cleanup_expired_keys(&self, grace: Duration) -> Result<usize> {
        let cutoff = self.clock.now() - grace;
        let mut removed = 0;

        for entity in self.store.entities()? {
            self.store.update(&entity, &mut |ring: &mut KeyRing| {
                removed += ring.prune(cutoff);
                Ok(())
            })?;
        }

        if removed > 0 {
            info!(removed, "Pruned expired key versions");
        }
        Ok(removed)
    }
}

impl KeyResolver for KeyRotationManager {
    fn current_key(&self, entity: &EntityId) -> Result<Option<KeyVersion>> {
        let mut current = None;
        self.store
            .read(entity, &mut |ring: &KeyRing| current = ring.current().cloned())?;
        Ok(current)
    }

    fn keys_at(&self, entity: &EntityId, at: DateTime<Utc>) -> Result<Vec<KeyVersion>> {
        let mut found = Vec::new();
        self.store.read(entity, &mut |ring: &KeyRing| {
            found = ring.keys_at(at).cloned().collect()
        })?;
        Ok(found)
    }
}
