//! Timestamp bounds checking.
//!
//! Two attacks are covered: future-dating (a timestamp beyond the allowed
//! clock skew) and staleness/backdating (a timestamp older than the allowed
//! age). The validator is stateless apart from the injected clock.

use crate::clock::Clock;
use crate::error::{ReasonCode, Verdict};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use std::sync::Arc;

/// Default allowed clock skew for future timestamps.
pub const DEFAULT_CLOCK_SKEW_SECS: i64 = 60;

/// Default maximum age of a request timestamp.
pub const DEFAULT_MAX_AGE_SECS: i64 = 300;

/// What a timestamp belongs to. Selects which bounds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampContext {
    /// A request or proof-of-possession timestamp: both bounds.
    Request,
    /// A delegation's issue time: future bound only, its lifetime is
    /// governed by its own expiry.
    Delegation,
    /// A witness attestation: both bounds.
    Attestation,
    /// A revocation record: both bounds.
    Revocation,
}

impl TimestampContext {
    fn checks_age(self) -> bool {
        !matches!(self, TimestampContext::Delegation)
    }
}

/// Bounds-checks timestamps against clock skew and maximum age.
#[derive(Debug, Clone)]
pub struct TimestampValidator {
    clock: Arc<dyn Clock>,
    clock_skew: Duration,
    max_age: Duration,
}

impl TimestampValidator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            clock_skew: Duration::seconds(DEFAULT_CLOCK_SKEW_SECS),
            max_age: Duration::seconds(DEFAULT_MAX_AGE_SECS),
        }
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn clock_skew(&self) -> Duration {
        self.clock_skew
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Validate a UTC timestamp for the given context.
    pub fn validate(&self, timestamp: DateTime<Utc>, context: TimestampContext) -> Verdict {
        let now = self.clock.now();
        if timestamp > now + self.clock_skew {
            return Err(ReasonCode::FutureTimestamp);
        }
        if context.checks_age() && now - timestamp > self.max_age {
            return Err(ReasonCode::ExpiredTimestamp);
        }
        Ok(())
    }

    /// Validate a timestamp carrying an arbitrary UTC offset.
    pub fn validate_fixed_offset(
        &self,
        timestamp: DateTime<FixedOffset>,
        context: TimestampContext,
    ) -> Verdict {
        self.validate(timestamp.with_timezone(&Utc), context)
    }

    /// True when `timestamp` is no older than `max_age` and not in the future
    /// beyond the skew.
    pub fn is_recent(&self, timestamp: DateTime<Utc>, max_age: Duration) -> bool {
        let now = self.clock.now();
        timestamp <= now + self.clock_skew && now - timestamp <= max_age
    }

    /// True when an expiry instant has passed.
    pub fn is_expired(&self, expires_at: DateTime<Utc>) -> bool {
        self.clock.now() >= expires_at
    }
}
