mod common;

use common::{scenario_profile, stack};
use habsim::ensemble::{EnsembleOrchestrator, FlightOutcome};
use habsim::errors::SimError;
use habsim::fingerprint::fingerprint;
use habsim::progress::ProgressStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEADLINE: Duration = Duration::from_secs(120);

fn orchestrator(stack: &common::TestStack, workers: usize) -> EnsembleOrchestrator {
    EnsembleOrchestrator::new(
        stack.sim_cache.clone(),
        stack.cycles.clone(),
        stack.progress.clone(),
        workers,
        Duration::from_secs(60),
    )
}

/// Scenario 4: the full 21-member ensemble with 20 perturbations yields
/// 441 landings, 21 paths, and exactly 21 control landings.
#[tokio::test]
async fn full_ensemble_counts() {
    let stack = stack(21).await;
    let orchestrator = orchestrator(&stack, 8);
    let members: Vec<u8> = (0..21).collect();
    let profile = scenario_profile();

    let result = orchestrator
        .run(
            profile,
            &members,
            20,
            Some(1234),
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.paths.len(), 21);
    assert_eq!(result.landings.len(), 21 * 21);

    let controls: Vec<_> = result
        .landings
        .iter()
        .filter(|l| l.perturbation_id == -1)
        .collect();
    assert_eq!(controls.len(), 21);
    assert!(controls.iter().all(|l| l.weight == 2.0));
    assert!(
        result
            .landings
            .iter()
            .filter(|l| l.perturbation_id >= 0)
            .all(|l| l.weight == 1.0)
    );

    for path in &result.paths {
        assert!(matches!(path, FlightOutcome::Path(_)));
    }

    assert_eq!(result.request_id, fingerprint(&profile.request_key(-1)));
    let progress = stack.progress.read(&result.request_id).unwrap();
    assert_eq!(progress.status, ProgressStatus::Complete);
    assert_eq!(progress.done, 441);
    assert_eq!(progress.done_ensemble, 21);
    assert_eq!(progress.done_monte_carlo, 420);
    assert_eq!(progress.percentage(), 100);
}

/// Scenario 5: cancelling a running ensemble leaves terminal `cancelled`
/// progress and caches nothing.
#[tokio::test]
async fn cancellation_discards_partial_results() {
    let stack = stack(10).await;
    let orchestrator = Arc::new(orchestrator(&stack, 2));
    // Long float keeps each unit busy so the cancel lands mid-run.
    let profile = habsim::simulator::FlightProfile {
        float_hours: 24.0,
        ..scenario_profile()
    };

    let cancel = CancellationToken::new();
    let run = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run(profile, &(0..10).collect::<Vec<_>>(), 9, None, DEADLINE, cancel)
                .await
        })
    };

    // Wait until a batch of completions lands, then cancel.
    let request_id = fingerprint(&profile.request_key(-1));
    loop {
        if let Some(progress) = stack.progress.read(&request_id)
            && progress.done >= 10
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let result = run.await.unwrap();
    assert!(matches!(result, Err(SimError::Cancelled)));

    let progress = stack.progress.read(&request_id).unwrap();
    assert_eq!(progress.status, ProgressStatus::Cancelled);
    assert!(progress.done < progress.total);
    assert!(stack.predictions.is_empty(), "nothing may be cached");
}

/// A fixed seed reproduces the exact ensemble regardless of scheduling.
#[tokio::test]
async fn seeded_runs_are_reproducible() {
    let stack = stack(3).await;
    let members: Vec<u8> = (0..3).collect();
    let profile = scenario_profile();

    let a = orchestrator(&stack, 4)
        .run(
            profile,
            &members,
            5,
            Some(77),
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    let b = orchestrator(&stack, 1)
        .run(
            profile,
            &members,
            5,
            Some(77),
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(a.landings.len(), b.landings.len());
    for (x, y) in a.landings.iter().zip(&b.landings) {
        assert_eq!(x.lat, y.lat);
        assert_eq!(x.lon, y.lon);
        assert_eq!(x.perturbation_id, y.perturbation_id);
        assert_eq!(x.model_id, y.model_id);
    }
}

/// A member whose flight leaves the altitude domain gets a sentinel slot;
/// the rest of the ensemble is unaffected.
#[tokio::test]
async fn per_member_failures_are_masked() {
    let stack = stack(3).await;
    let members: Vec<u8> = (0..3).collect();
    // Burst above the domain: every unit is out of domain.
    let profile = habsim::simulator::FlightProfile {
        burst_alt: 50_000.0,
        ..scenario_profile()
    };

    let result = orchestrator(&stack, 4)
        .run(
            profile,
            &members,
            2,
            Some(5),
            DEADLINE,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.paths.len(), 3);
    for path in &result.paths {
        assert!(matches!(path, FlightOutcome::OutOfDomain));
    }
    assert!(result.landings.is_empty());

    // Failed units still count toward progress completion.
    let progress = stack.progress.read(&result.request_id).unwrap();
    assert_eq!(progress.status, ProgressStatus::Complete);
    assert_eq!(progress.done, 9);
}
