mod common;

use common::{CYCLE_B, scenario_profile, stack, write_pointer};
use habsim::artifact_store::{ArtifactStore, DirStore};
use habsim::cycle::{CycleManager, Refresh};
use habsim::ensemble::EnsembleOrchestrator;
use habsim::progress::ProgressStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A second manager over the same state and local directory, with its own
/// store client. This is the peer-worker shape: the pointer text cache of
/// the first client must not delay the second one's observation.
fn peer_manager(stack: &common::TestStack, members: u8) -> CycleManager {
    let store = Arc::new(ArtifactStore::new(Arc::new(DirStore::new(
        stack.remote.path(),
    ))));
    let mut manager = CycleManager::new(
        store,
        stack.state.clone(),
        stack.local.path().join("active_cycle"),
        stack.sim_cache.clone(),
        stack.predictions.clone(),
        stack.disk.clone(),
        members,
    );
    manager.set_guard_interval(Duration::ZERO);
    manager
}

/// An advertised cycle with missing members is pending, not adopted.
#[tokio::test]
async fn incomplete_cycle_stays_pending() {
    let stack = stack(3).await;

    // Advertise cycle B with only one of three members uploaded.
    common::seed_member(stack.remote.path(), CYCLE_B, 0, 5.0, 3.0);
    write_pointer(stack.remote.path(), CYCLE_B);

    let manager = peer_manager(&stack, 3);
    let refresh = manager.refresh().await.unwrap();
    assert_eq!(refresh, Refresh::Pending(stack.cycle_b()));

    let (active, _) = manager.active().unwrap();
    assert_eq!(active, stack.cycle_a(), "state must not mutate while pending");
}

/// A complete new cycle flips atomically: epoch bumps, the prediction
/// cache clears, old simulators become unacquirable, and the pointer file
/// holds the new token.
#[tokio::test]
async fn complete_cycle_flips_and_invalidates() {
    let stack = stack(3).await;

    // Populate caches under cycle A.
    let lease = stack.sim_cache.acquire(0).await.unwrap();
    assert_eq!(lease.cycle(), &stack.cycle_a());
    drop(lease);
    stack.predictions.insert(
        "deadbeef00000000".into(),
        Arc::new(habsim::simulator::Trajectory::default()),
    );

    let (_, epoch_before) = stack.cycles.active().unwrap();
    stack.publish_cycle(CYCLE_B, 3);

    let manager = peer_manager(&stack, 3);
    let refresh = manager.refresh().await.unwrap();
    assert_eq!(refresh, Refresh::Flipped(stack.cycle_b()));

    let (active, epoch_after) = stack.cycles.active().unwrap();
    assert_eq!(active, stack.cycle_b());
    assert!(epoch_after > epoch_before);
    assert!(stack.predictions.is_empty(), "flip clears predictions");

    let fresh = stack.sim_cache.acquire(0).await.unwrap();
    assert_eq!(fresh.cycle(), &stack.cycle_b());

    let pointer =
        std::fs::read_to_string(stack.local.path().join("active_cycle")).unwrap();
    assert_eq!(pointer.trim(), CYCLE_B);
}

/// Scenario 3, single path: a lease held across a flip keeps producing a
/// trajectory consistent with its own cycle; no mixed output is possible.
#[tokio::test]
async fn held_lease_survives_flip_consistently() {
    let stack = stack(3).await;
    let cancel = CancellationToken::new();

    let lease = stack.sim_cache.acquire(0).await.unwrap();
    assert_eq!(lease.cycle(), &stack.cycle_a());

    // Flip while the request is logically in flight.
    stack.publish_cycle(CYCLE_B, 3);
    let manager = peer_manager(&stack, 3);
    assert_eq!(
        manager.refresh().await.unwrap(),
        Refresh::Flipped(stack.cycle_b())
    );

    // The held lease still integrates against cycle A's field.
    let path = lease.fly(&scenario_profile(), &cancel).unwrap();
    assert!(!path.descent.is_empty());
    assert_eq!(lease.cycle(), &stack.cycle_a());

    // Anyone acquiring now sees only cycle B.
    let fresh = stack.sim_cache.acquire(0).await.unwrap();
    assert_eq!(fresh.cycle(), &stack.cycle_b());
}

/// await_stable returns a stable pair once the state stops moving.
#[tokio::test]
async fn await_stable_returns_the_active_pair() {
    let stack = stack(3).await;
    let (cycle, epoch) = stack.cycles.await_stable().await.unwrap();
    assert_eq!(cycle, stack.cycle_a());
    assert_eq!(epoch, stack.cycles.active().unwrap().1);
}

/// Scenario 3, ensemble path: a flip landing mid-fan-out still yields a
/// complete, single-cycle ensemble (via the internal restart).
#[tokio::test]
async fn ensemble_completes_across_a_flip() {
    let stack = stack(5).await;
    let orchestrator = Arc::new(EnsembleOrchestrator::new(
        stack.sim_cache.clone(),
        stack.cycles.clone(),
        stack.progress.clone(),
        2,
        Duration::from_secs(60),
    ));
    let profile = habsim::simulator::FlightProfile {
        float_hours: 12.0,
        ..scenario_profile()
    };

    let run = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .run(
                    profile,
                    &(0..5).collect::<Vec<_>>(),
                    5,
                    Some(3),
                    Duration::from_secs(120),
                    CancellationToken::new(),
                )
                .await
        })
    };

    // Land a flip while units are in flight (await_stable alone holds the
    // fan-out for ~250 ms).
    tokio::time::sleep(Duration::from_millis(300)).await;
    stack.publish_cycle(CYCLE_B, 5);
    let manager = peer_manager(&stack, 5);
    let _ = manager.refresh().await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.paths.len(), 5);
    assert_eq!(result.landings.len(), 5 * 6);

    let progress = stack.progress.read(&result.request_id).unwrap();
    assert_eq!(progress.status, ProgressStatus::Complete);
    assert_eq!(progress.done, 30);
}
