//! Background sweeper behavior under paused tokio time.

use chrono::Duration;
use mandate::store::{MemoryBudgetStore, MemoryNonceStore};
use mandate::{BudgetTracker, EntityId, ManualClock, NonceTracker, Sweeper};
use std::sync::Arc;
use std::time::Duration as StdDuration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn trackers() -> (Arc<ManualClock>, Arc<NonceTracker>, Arc<BudgetTracker>) {
    let clock = Arc::new(ManualClock::epoch());
    let nonces = Arc::new(
        NonceTracker::new(Arc::new(MemoryNonceStore::new()), clock.clone())
            .with_ttl(Duration::seconds(60)),
    );
    let budgets = Arc::new(
        BudgetTracker::new(Arc::new(MemoryBudgetStore::new()), clock.clone())
            .with_history_retention(Duration::hours(1)),
    );
    (clock, nonces, budgets)
}

#[tokio::test(start_paused = true)]
async fn test_spawned_sweeper_purges_on_interval() {
    init_tracing();
    let (clock, nonces, budgets) = trackers();
    let agent = EntityId::from("agent");
    nonces.issue(&agent).unwrap();
    clock.advance(Duration::seconds(61));

    let handle = Sweeper::new(nonces.clone(), budgets)
        .with_interval(StdDuration::from_secs(30))
        .spawn();

    // Nothing runs before the first full interval.
    assert_eq!(nonces.tracked().unwrap(), 1);

    tokio::time::sleep(StdDuration::from_secs(31)).await;
    assert_eq!(nonces.tracked().unwrap(), 0);
    assert!(!handle.is_finished());

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_keeps_running_across_ticks() {
    init_tracing();
    let (clock, nonces, budgets) = trackers();
    let agent = EntityId::from("agent");

    let handle = Sweeper::new(nonces.clone(), budgets)
        .with_interval(StdDuration::from_secs(10))
        .spawn();

    for _ in 0..3 {
        nonces.issue(&agent).unwrap();
        clock.advance(Duration::seconds(61));
        tokio::time::sleep(StdDuration::from_secs(11)).await;
        assert_eq!(nonces.tracked().unwrap(), 0);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_task() {
    let (_, nonces, budgets) = trackers();
    let handle = Sweeper::new(nonces, budgets)
        .with_interval(StdDuration::from_secs(3600))
        .spawn();

    tokio::time::timeout(StdDuration::from_secs(5), handle.shutdown())
        .await
        .expect("sweeper did not stop");
}

#[test]
fn test_sweep_once_prunes_budget_history() {
    let (clock, nonces, budgets) = trackers();
    let agent = EntityId::from("agent");
    budgets.create_account(&agent, 1000, 100).unwrap();
    for _ in 0..3 {
        budgets.check_and_deduct(&agent, 10).unwrap().unwrap();
    }
    assert_eq!(budgets.history(&agent).unwrap().len(), 3);

    let sweeper = Sweeper::new(nonces, budgets.clone());
    assert_eq!(sweeper.sweep_once().unwrap().total(), 0);

    clock.advance(Duration::hours(2));
    let report = sweeper.sweep_once().unwrap();
    assert_eq!(report.history_pruned, 3);
    assert_eq!(report.nonces_purged, 0);
    assert!(budgets.history(&agent).unwrap().is_empty());
}
