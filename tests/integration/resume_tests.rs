//! Cancellation and resume tests.
//!
//! Tests verify:
//! - Cancelling mid-run stops admitting work and leaves written chunks intact
//! - Resuming finishes the pyramid without writing any chunk twice
//! - Re-running a failed downsample level yields the same level as a clean run

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use stack_to_chunk::error::ConvertError;
use stack_to_chunk::geometry::{plan, ChunkIndex};
use stack_to_chunk::pyramid::{Coordinator, ExecutionMode, LevelsSpec, PyramidState, RunOptions};

use super::test_utils::{ramp_volume, MockSliceReader, TrackingStore};

const SHAPE: [usize; 3] = [20, 20, 10];

fn single_worker() -> RunOptions {
    RunOptions {
        max_workers: Some(1),
        ..RunOptions::default()
    }
}

fn coordinator(
    reader: Arc<MockSliceReader>,
    store: Arc<TrackingStore>,
    options: RunOptions,
    cancel: CancellationToken,
) -> Coordinator<u16, TrackingStore> {
    Coordinator::new(
        plan(SHAPE, [SHAPE[0], SHAPE[1]], 8).unwrap(),
        reader,
        store,
        LevelsSpec::default(),
    )
    .with_options(options)
    .with_cancel_token(cancel)
}

// =============================================================================
// Cancel and Resume
// =============================================================================

#[tokio::test]
async fn test_cancel_then_resume_never_rewrites() {
    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let store = Arc::new(TrackingStore::new());

    // First run: cancelled after five level-0 chunks
    let cancel = CancellationToken::new();
    store.cancel_after(5, cancel.clone());
    let first = coordinator(reader.clone(), store.clone(), single_worker(), cancel);
    let err = first.run(ExecutionMode::Eager).await.unwrap_err();

    assert!(matches!(err, ConvertError::Cancelled { level: 0, .. }));
    assert_eq!(first.state(), PyramidState::Cancelled);
    assert_eq!(store.write_count(), 5);
    assert_eq!(store.inner().chunk_count(1).await, 0);

    // Second run: fresh token, same store
    let second = coordinator(
        reader.clone(),
        store.clone(),
        single_worker(),
        CancellationToken::new(),
    );
    let report = second
        .run(ExecutionMode::Eager)
        .await
        .unwrap()
        .into_report()
        .unwrap();

    assert_eq!(second.state(), PyramidState::PyramidComplete);
    assert!(store.double_writes().is_empty());
    assert_eq!(store.write_count(), 18 + 4 + 1);
    assert_eq!(report.levels[0].chunks_skipped, 5);
    assert_eq!(report.levels[0].chunks_written, 13);
    assert_eq!(
        store.inner().assemble_level(0).await.unwrap(),
        ramp_volume(SHAPE)
    );
}

#[tokio::test]
async fn test_cancel_before_run_writes_nothing() {
    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let store = Arc::new(TrackingStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let coordinator = coordinator(reader.clone(), store.clone(), RunOptions::default(), cancel);
    let err = coordinator.run(ExecutionMode::Eager).await.unwrap_err();

    assert!(matches!(err, ConvertError::Cancelled { level: 0, .. }));
    assert_eq!(store.write_count(), 0);
    assert_eq!(reader.total_reads(), 0);
}

#[tokio::test]
async fn test_rerun_of_complete_pyramid_is_a_no_op() {
    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let store = Arc::new(TrackingStore::new());

    coordinator(
        reader.clone(),
        store.clone(),
        RunOptions::default(),
        CancellationToken::new(),
    )
    .run(ExecutionMode::Eager)
    .await
    .unwrap();
    let reads = reader.total_reads();
    let writes = store.write_count();

    let report = coordinator(
        reader.clone(),
        store.clone(),
        RunOptions::default(),
        CancellationToken::new(),
    )
    .run(ExecutionMode::Eager)
    .await
    .unwrap()
    .into_report()
    .unwrap();

    assert_eq!(report.chunks_written(), 0);
    assert_eq!(reader.total_reads(), reads);
    assert_eq!(store.write_count(), writes);
    assert!(store.double_writes().is_empty());
}

// =============================================================================
// Downsample Re-run Idempotence
// =============================================================================

#[tokio::test]
async fn test_downsample_rerun_matches_clean_run() {
    // Clean reference run
    let clean = Arc::new(TrackingStore::new());
    coordinator(
        Arc::new(MockSliceReader::new(SHAPE)),
        clean.clone(),
        RunOptions::default(),
        CancellationToken::new(),
    )
    .run(ExecutionMode::Eager)
    .await
    .unwrap();

    // Level 1 chunk (1, 0, 0) fails on every attempt of the first run
    let store = Arc::new(TrackingStore::new());
    let options = RunOptions {
        retries: 1,
        ..RunOptions::default()
    };
    store.fail_write(1, ChunkIndex::new(1, 0, 0), 2);

    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let first = coordinator(reader.clone(), store.clone(), options, CancellationToken::new());
    let err = first.run(ExecutionMode::Eager).await.unwrap_err();
    match err {
        ConvertError::LevelIncomplete { level, failure } => {
            assert_eq!(level, 1);
            assert_eq!(failure.failed.len(), 1);
            assert_eq!(failure.succeeded, 3);
        }
        other => panic!("expected LevelIncomplete, got {:?}", other),
    }
    assert_eq!(store.inner().chunk_count(1).await, 3);
    assert_eq!(store.inner().chunk_count(2).await, 0);

    let second = coordinator(reader, store.clone(), options, CancellationToken::new());
    second.run(ExecutionMode::Eager).await.unwrap();

    assert!(store.double_writes().is_empty());
    for level in 0..3 {
        assert_eq!(
            store.inner().assemble_level(level).await,
            clean.inner().assemble_level(level).await,
            "level {} differs from clean run",
            level
        );
    }
}
