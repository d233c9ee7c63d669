//! End-to-end conversion tests against in-memory collaborators.
//!
//! Tests verify:
//! - The (20, 20, 10) scenario produces the expected levels and chunk grids
//! - Level 0 reproduces the input volume exactly
//! - Narrow volumes yield a single true-extent chunk per slab
//! - Transient read failures are retried, persistent ones reported in full

use std::sync::Arc;

use stack_to_chunk::error::ConvertError;
use stack_to_chunk::geometry::{plan, ChunkIndex};
use stack_to_chunk::pyramid::{
    Coordinator, ExecutionMode, LevelsSpec, PyramidState, Reduction, RunOptions, WorkUnit,
};
use stack_to_chunk::store::MemoryStore;

use super::test_utils::{ramp_volume, reference_mean, MockSliceReader, TrackingStore};

fn coordinator(
    shape: [usize; 3],
    edge: usize,
    reader: Arc<MockSliceReader>,
    store: Arc<TrackingStore>,
) -> Coordinator<u16, TrackingStore> {
    Coordinator::new(
        plan(shape, [shape[0], shape[1]], edge).unwrap(),
        reader,
        store,
        LevelsSpec::default(),
    )
}

// =============================================================================
// End-to-End Scenario
// =============================================================================

#[tokio::test]
async fn test_end_to_end_20_20_10() {
    let reader = Arc::new(MockSliceReader::new([20, 20, 10]));
    let store = Arc::new(TrackingStore::new());
    let coordinator = coordinator([20, 20, 10], 8, reader.clone(), store.clone());

    let report = coordinator
        .run(ExecutionMode::Eager)
        .await
        .unwrap()
        .into_report()
        .unwrap();

    assert_eq!(coordinator.state(), PyramidState::PyramidComplete);
    let shapes: Vec<_> = report.levels.iter().map(|l| l.shape).collect();
    assert_eq!(shapes, vec![[20, 20, 10], [10, 10, 5], [5, 5, 3]]);

    let grid0 = store.inner().grid(0).await.unwrap();
    assert_eq!(grid0.grid_shape(), [3, 3, 2]);
    let grid1 = store.inner().grid(1).await.unwrap();
    assert_eq!(grid1.grid_shape(), [2, 2, 1]);

    assert_eq!(store.inner().chunk_count(0).await, 18);
    assert_eq!(store.inner().chunk_count(1).await, 4);
    assert_eq!(store.inner().chunk_count(2).await, 1);
    assert!(store.double_writes().is_empty());

    // Every slice read exactly once
    for z in 0..10 {
        assert_eq!(reader.read_count(z), 1, "slice {} read count", z);
    }
}

#[tokio::test]
async fn test_levels_match_reference_reduction() {
    let reader = Arc::new(MockSliceReader::new([20, 20, 10]));
    let store = Arc::new(TrackingStore::new());
    let coordinator = coordinator([20, 20, 10], 8, reader, store.clone());
    coordinator.run(ExecutionMode::Eager).await.unwrap();

    let volume = ramp_volume([20, 20, 10]);
    let level0 = store.inner().assemble_level(0).await.unwrap();
    assert_eq!(level0, volume);

    let expected1 = reference_mean(&volume, 2);
    let level1 = store.inner().assemble_level(1).await.unwrap();
    assert_eq!(level1, expected1);

    let expected2 = reference_mean(&expected1, 2);
    let level2 = store.inner().assemble_level(2).await.unwrap();
    assert_eq!(level2, expected2);
}

#[tokio::test]
async fn test_max_reduction_and_level_limit() {
    let reader = Arc::new(MockSliceReader::new([20, 20, 10]));
    let store = Arc::new(MemoryStore::<u16>::new());
    let coordinator = Coordinator::new(
        plan([20, 20, 10], [20, 20], 4).unwrap(),
        reader,
        store.clone(),
        LevelsSpec {
            factor: 2,
            max_levels: Some(1),
            reduction: Reduction::Max,
        },
    );

    let report = coordinator
        .run(ExecutionMode::Eager)
        .await
        .unwrap()
        .into_report()
        .unwrap();
    assert_eq!(report.levels.len(), 2);

    let level1 = store.assemble_level(1).await.unwrap();
    assert_eq!(level1.shape(), [10, 10, 5]);
    // The ramp increases along every axis, so the max sits at the far corner
    assert_eq!(level1.get(3, 4, 2), (7 + 20 * 9 + 400 * 5) as u16);
}

// =============================================================================
// Boundary Cases
// =============================================================================

#[tokio::test]
async fn test_narrow_volume_single_chunk_per_slab() {
    let reader = Arc::new(MockSliceReader::new([5, 5, 12]));
    let store = Arc::new(TrackingStore::new());
    let coordinator = coordinator([5, 5, 12], 8, reader, store.clone());
    coordinator.run(ExecutionMode::Eager).await.unwrap();

    let grid = store.inner().grid(0).await.unwrap();
    assert_eq!(grid.grid_shape(), [1, 1, 2]);

    let first = store.inner().get(0, ChunkIndex::new(0, 0, 0)).await.unwrap();
    assert_eq!(first.shape(), [5, 5, 8]);
    let last = store.inner().get(0, ChunkIndex::new(0, 0, 1)).await.unwrap();
    assert_eq!(last.shape(), [5, 5, 4]);

    assert_eq!(
        store.inner().assemble_level(0).await.unwrap(),
        ramp_volume([5, 5, 12])
    );
}

#[tokio::test]
async fn test_volume_fitting_one_chunk_has_single_level() {
    let reader = Arc::new(MockSliceReader::new([5, 5, 5]));
    let store = Arc::new(TrackingStore::new());
    let coordinator = coordinator([5, 5, 5], 8, reader, store.clone());

    let report = coordinator
        .run(ExecutionMode::Eager)
        .await
        .unwrap()
        .into_report()
        .unwrap();
    assert_eq!(report.levels.len(), 1);
    assert_eq!(report.chunks_written(), 1);
    assert_eq!(coordinator.state(), PyramidState::PyramidComplete);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_transient_read_failure_is_retried() {
    let reader = Arc::new(MockSliceReader::new([20, 20, 10]).fail_slice(9, 2));
    let store = Arc::new(TrackingStore::new());
    let coordinator = coordinator([20, 20, 10], 8, reader.clone(), store.clone());

    coordinator.run(ExecutionMode::Eager).await.unwrap();

    assert_eq!(coordinator.state(), PyramidState::PyramidComplete);
    assert_eq!(reader.read_count(9), 3);
    assert_eq!(
        store.inner().assemble_level(0).await.unwrap(),
        ramp_volume([20, 20, 10])
    );
    assert!(store.double_writes().is_empty());
}

#[tokio::test]
async fn test_persistent_failure_reports_every_failing_unit() {
    let reader = Arc::new(
        MockSliceReader::new([20, 20, 24])
            .fail_slice(3, 100)
            .fail_slice(20, 100),
    );
    let store = Arc::new(TrackingStore::new());
    let coordinator = coordinator([20, 20, 24], 8, reader, store.clone()).with_options(RunOptions {
        retries: 1,
        ..RunOptions::default()
    });

    let err = coordinator.run(ExecutionMode::Eager).await.unwrap_err();
    match err {
        ConvertError::LevelIncomplete { level, failure } => {
            assert_eq!(level, 0);
            assert_eq!(failure.succeeded, 1);
            let mut failed = failure.failed_units();
            failed.sort();
            assert_eq!(failed, vec![WorkUnit::Slab(0), WorkUnit::Slab(2)]);
            assert!(failure.failed.iter().all(|f| f.attempts == 2));
        }
        other => panic!("expected LevelIncomplete, got {:?}", other),
    }
    assert_eq!(coordinator.state(), PyramidState::Failed);

    // The healthy slab was written, no level 1 chunk was attempted
    assert_eq!(store.inner().chunk_count(0).await, 9);
    assert_eq!(store.inner().chunk_count(1).await, 0);
}

#[tokio::test]
async fn test_budget_too_small_fails_before_reading() {
    let reader = Arc::new(MockSliceReader::new([20, 20, 10]));
    let store = Arc::new(TrackingStore::new());
    let coordinator =
        coordinator([20, 20, 10], 8, reader.clone(), store.clone()).with_options(RunOptions {
            memory_budget: 1024,
            ..RunOptions::default()
        });

    let err = coordinator.run(ExecutionMode::Eager).await.unwrap_err();
    assert!(matches!(err, ConvertError::BudgetExceeded { .. }));
    assert_eq!(reader.total_reads(), 0);
    assert!(store.inner().grid(0).await.is_none());
}
