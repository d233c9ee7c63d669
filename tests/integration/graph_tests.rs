//! Lazy-mode task graph tests.
//!
//! Tests verify:
//! - Building the graph does not touch the store or read slices
//! - Executing the graph produces the same pyramid as an eager run
//! - A failing slab blocks everything downstream of it and nothing else
//! - Cancelling before execution stops slabs without reading slices

use std::sync::Arc;

use stack_to_chunk::error::ConvertError;
use stack_to_chunk::geometry::{plan, ChunkIndex};
use stack_to_chunk::pyramid::{Coordinator, ExecutionMode, LevelsSpec, RunOptions, TaskKey};

use super::test_utils::{MockSliceReader, TrackingStore};

const SHAPE: [usize; 3] = [20, 20, 10];

fn coordinator(
    reader: Arc<MockSliceReader>,
    store: Arc<TrackingStore>,
) -> Coordinator<u16, TrackingStore> {
    Coordinator::new(
        plan(SHAPE, [SHAPE[0], SHAPE[1]], 8).unwrap(),
        reader,
        store,
        LevelsSpec::default(),
    )
}

#[tokio::test]
async fn test_lazy_graph_is_inert_until_executed() {
    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let store = Arc::new(TrackingStore::new());
    let graph = coordinator(reader.clone(), store.clone())
        .run(ExecutionMode::Lazy)
        .await
        .unwrap()
        .into_graph()
        .unwrap();

    assert!(store.inner().grid(0).await.is_none());
    assert_eq!(reader.total_reads(), 0);

    // setup + 2 slabs + 4 level-1 chunks + 1 level-2 chunk + 3 barriers
    assert_eq!(graph.len(), 11);
    let order = graph.topological_order().unwrap();
    assert_eq!(order[0], TaskKey::Setup);
    assert_eq!(
        graph.dependencies(&TaskKey::Chunk {
            level: 2,
            index: ChunkIndex::new(0, 0, 0)
        }),
        Some(&[TaskKey::LevelBarrier(1)][..])
    );
}

#[tokio::test]
async fn test_lazy_matches_eager() {
    let eager_store = Arc::new(TrackingStore::new());
    coordinator(Arc::new(MockSliceReader::new(SHAPE)), eager_store.clone())
        .run(ExecutionMode::Eager)
        .await
        .unwrap();

    let lazy_store = Arc::new(TrackingStore::new());
    let graph = coordinator(Arc::new(MockSliceReader::new(SHAPE)), lazy_store.clone())
        .run(ExecutionMode::Lazy)
        .await
        .unwrap()
        .into_graph()
        .unwrap();
    let workers = graph.resources().max_concurrency();
    let report = graph.execute(workers).await.unwrap().into_result().unwrap();

    assert_eq!(report.chunks_written, 18 + 4 + 1);
    assert!(lazy_store.double_writes().is_empty());
    for level in 0..3 {
        assert_eq!(
            lazy_store.inner().assemble_level(level).await,
            eager_store.inner().assemble_level(level).await,
            "level {} differs",
            level
        );
    }
}

#[tokio::test]
async fn test_failed_slab_skips_downstream_nodes() {
    let reader = Arc::new(MockSliceReader::new(SHAPE).fail_slice(2, 100));
    let store = Arc::new(TrackingStore::new());
    let graph = coordinator(reader, store.clone())
        .with_options(RunOptions {
            retries: 0,
            ..RunOptions::default()
        })
        .run(ExecutionMode::Lazy)
        .await
        .unwrap()
        .into_graph()
        .unwrap();

    let report = graph.execute(4).await.unwrap();
    assert!(!report.is_complete());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, TaskKey::Slab(0));
    assert!(report.skipped.contains(&TaskKey::LevelBarrier(0)));
    assert!(report.skipped.contains(&TaskKey::LevelBarrier(2)));

    // The healthy slab still ran
    assert_eq!(store.inner().chunk_count(0).await, 9);
    assert_eq!(store.inner().chunk_count(1).await, 0);

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, ConvertError::Graph(_)));
}

#[tokio::test]
async fn test_cancelled_graph_reads_no_slices() {
    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let store = Arc::new(TrackingStore::new());
    let coord = coordinator(reader.clone(), store.clone());
    let graph = coord
        .run(ExecutionMode::Lazy)
        .await
        .unwrap()
        .into_graph()
        .unwrap();

    coord.cancel();
    let report = graph.execute(2).await.unwrap();

    assert!(!report.is_complete());
    assert!(report.failed.is_empty());
    assert!(report.cancelled.contains(&TaskKey::Slab(0)));
    assert!(report.cancelled.contains(&TaskKey::Slab(1)));
    assert!(report.skipped.contains(&TaskKey::LevelBarrier(2)));
    assert_eq!(reader.total_reads(), 0);
    assert_eq!(store.write_count(), 0);
}
