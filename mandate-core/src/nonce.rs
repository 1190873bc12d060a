//! Single-use, time-limited replay tokens.
//!
//! A nonce is issued to an owner, lives for a TTL, and can be consumed
//! exactly once. Consumption is one atomic store update that checks
//! existence, ownership, expiry and prior use together, so two concurrent
//! presentations of the same nonce can never both succeed.
//!
//! Consumed nonces stay in the store as tombstones until their TTL passes.
//! That is what lets a second presentation be reported as
//! [`ReasonCode::ReplayDetected`] instead of [`ReasonCode::UnknownNonce`].
//! Expired entries are removed by [`NonceTracker::purge_expired`], which the
//! sweeper calls off the request path.

use crate::clock::Clock;
use crate::error::{Error, ReasonCode, Result, Verdict};
use crate::identity::EntityId;
use crate::store::NonceStore;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default nonce lifetime.
pub const DEFAULT_NONCE_TTL_SECS: i64 = 300;

const NONCE_BYTES: usize = 32;

/// Stored state of an issued nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub value: String,
    pub owner: EntityId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl NonceRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

/// A nonce handed to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nonce {
    pub value: String,
    pub owner: EntityId,
    pub expires_at: DateTime<Utc>,
}

impl Nonce {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Issues and consumes nonces.
#[derive(Debug)]
pub struct NonceTracker {
    store: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl NonceTracker {
    pub fn new(store: Arc<dyn NonceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: Duration::seconds(DEFAULT_NONCE_TTL_SECS),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh random nonce bound to `owner`.
    pub fn issue(&self, owner: &EntityId) -> Result<Nonce> {
        let mut bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let value = hex::encode(bytes);

        let issued_at = self.clock.now();
        let record = NonceRecord {
            value: value.clone(),
            owner: owner.clone(),
            issued_at,
            expires_at: issued_at + self.ttl,
            consumed_at: None,
        };
        let expires_at = record.expires_at;

        if !self.store.insert(record)? {
            return Err(Error::NonceCollision);
        }

        debug!(owner = %owner, expires_at = %expires_at, "Nonce issued");
        Ok(Nonce {
            value,
            owner: owner.clone(),
            expires_at,
        })
    }

    /// Atomically check and consume `nonce` for `owner`.
    ///
    /// Unknown, expired, or someone else's nonce gives `UnknownNonce`; a nonce
    /// that was already consumed gives `ReplayDetected`.
    pub fn verify_and_consume(&self, owner: &EntityId, nonce: &str) -> Result<Verdict> {
        let now = self.clock.now();
        let mut outcome: Verdict = Err(ReasonCode::UnknownNonce);

        let found = self.store.update(nonce, &mut |record: &mut NonceRecord| {
            outcome = if record.owner != *owner || record.is_expired(now) {
                Err(ReasonCode::UnknownNonce)
            } else if record.is_consumed() {
                Err(ReasonCode::ReplayDetected)
            } else {
                record.consumed_at = Some(now);
                Ok(())
            };
            Ok(())
        })?;

        match (found, outcome) {
            (false, _) => {
                debug!(owner = %owner, "Unknown nonce presented");
                Ok(Err(ReasonCode::UnknownNonce))
            }
            (true, Err(ReasonCode::ReplayDetected)) => {
                warn!(
                    owner = %owner,
                    nonce = %truncate(nonce),
                    "Replay attempt: nonce already consumed"
                );
                Ok(Err(ReasonCode::ReplayDetected))
            }
            (true, outcome) => Ok(outcome),
        }
    }

    /// Remove every nonce past its TTL, consumed or not.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.store.retain(&mut |r: &NonceRecord| !r.is_expired(now))?;
        if removed > 0 {
            info!(removed, "Purged expired nonces");
        }
        Ok(removed)
    }

    /// Number of nonces currently tracked (live and tombstoned).
    pub fn tracked(&self) -> Result<usize> {
        self.store.len()
    }
}

fn truncate(nonce: &str) -> &str {
    nonce.get(..16).unwrap_or(nonce)
}
