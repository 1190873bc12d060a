//! Background expiry sweeps.
//!
//! The sweeper runs off the request path on a tokio interval:
//!
//! 1. Purges nonces past their TTL (consumed tombstones included)
//! 2. Prunes budget usage history older than the retention window
//! 3. Drops key versions that expired or were revoked longer ago than the
//!    cleanup grace period, when a key manager is attached
//!
//! Revocation records are never swept. Each sweep goes through the store's
//! own sweep primitives, which lock one shard at a time.

use crate::budget::BudgetTracker;
use crate::config::{EngineConfig, DEFAULT_SWEEP_INTERVAL_SECS};
use crate::error::Result;
use crate::keys::{KeyRotationManager, DEFAULT_CLEANUP_GRACE_DAYS};
use crate::nonce::NonceTracker;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub nonces_purged: usize,
    pub history_pruned: usize,
    pub keys_removed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.nonces_purged + self.history_pruned + self.keys_removed
    }
}

/// Periodic cleanup of expired engine state.
#[derive(Debug, Clone)]
pub struct Sweeper {
    nonces: Arc<NonceTracker>,
    budgets: Arc<BudgetTracker>,
    keys: Option<(Arc<KeyRotationManager>, chrono::Duration)>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(nonces: Arc<NonceTracker>, budgets: Arc<BudgetTracker>) -> Self {
        Self {
            nonces,
            budgets,
            keys: None,
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }

    /// Sweeper with the interval and key grace period from `config`, or
    /// `None` when `sweeper.enabled` is off.
    pub fn from_config(
        config: &EngineConfig,
        nonces: Arc<NonceTracker>,
        budgets: Arc<BudgetTracker>,
        keys: Arc<KeyRotationManager>,
    ) -> Option<Self> {
        if !config.sweeper.enabled {
            debug!("Sweeper disabled by configuration");
            return None;
        }
        Some(
            Self::new(nonces, budgets)
                .with_interval(config.sweep_interval())
                .with_key_cleanup(keys, config.key_cleanup_grace()),
        )
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Also drop stale key versions older than `grace`.
    pub fn with_key_cleanup(mut self, keys: Arc<KeyRotationManager>, grace: chrono::Duration) -> Self {
        self.keys = Some((keys, grace));
        self
    }

    /// Key cleanup with the default 90-day grace period.
    pub fn with_default_key_cleanup(self, keys: Arc<KeyRotationManager>) -> Self {
        self.with_key_cleanup(keys, chrono::Duration::days(DEFAULT_CLEANUP_GRACE_DAYS))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run every sweep once.
    pub fn sweep_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            nonces_purged: self.nonces.purge_expired()?,
            history_pruned: self.budgets.prune_history()?,
            keys_removed: 0,
        };
        if let Some((keys, grace)) = &self.keys {
            report.keys_removed = keys.cleanup_expired_keys(*grace)?;
        }

        if report.total() > 0 {
            info!(
                nonces_purged = report.nonces_purged,
                history_pruned = report.history_pruned,
                keys_removed = report.keys_removed,
                "Sweep completed"
            );
        } else {
            debug!("Sweep completed, nothing to remove");
        }
        Ok(report)
    }

    /// Run sweeps on the interval in a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);

            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once() {
                            warn!(error = %e, "Sweep failed, will retry on next interval");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!("Sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        });

        info!(interval_secs = period.as_secs(), "Sweeper started");
        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for the task to exit.
    pub async fn shutdown(self) {
        // A send error means the task already exited.
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}
