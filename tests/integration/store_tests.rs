//! Directory store integration tests.
//!
//! Tests verify:
//! - A full conversion into a sharded directory store round-trips every chunk
//! - Shards are committed and the multiscale manifest is readable
//! - Re-opening a store for resume skips everything already on disk
//! - An image stack on disk converts end to end

use std::path::Path;
use std::sync::Arc;

use image::{GrayImage, Luma};
use tempfile::TempDir;

use stack_to_chunk::geometry::{plan, ChunkIndex, ShardId};
use stack_to_chunk::io::{ChunkReader, ImageStackReader, SliceReader};
use stack_to_chunk::pyramid::{Coordinator, ExecutionMode, LevelsSpec, RunOptions};
use stack_to_chunk::store::{DirectoryStore, Multiscale, SpatialUnit};

use super::test_utils::{ramp_volume, MockSliceReader};

const SHAPE: [usize; 3] = [20, 20, 10];

fn sharded() -> RunOptions {
    RunOptions {
        shard_shape: Some([2, 2, 1]),
        ..RunOptions::default()
    }
}

async fn convert_into(
    store: Arc<DirectoryStore<u16>>,
    reader: Arc<MockSliceReader>,
) -> stack_to_chunk::pyramid::PyramidReport {
    Coordinator::new(
        plan(SHAPE, [SHAPE[0], SHAPE[1]], 8).unwrap(),
        reader,
        store,
        LevelsSpec::default(),
    )
    .with_options(sharded())
    .run(ExecutionMode::Eager)
    .await
    .unwrap()
    .into_report()
    .unwrap()
}

#[tokio::test]
async fn test_directory_store_pipeline() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("volume.stc");
    let store = Arc::new(
        DirectoryStore::<u16>::create(&root, Some([2, 2, 1]))
            .await
            .unwrap(),
    );

    let report = convert_into(store.clone(), Arc::new(MockSliceReader::new(SHAPE))).await;
    assert_eq!(report.chunks_written(), 18 + 4 + 1);
    assert_eq!(store.levels().await, vec![0, 1, 2]);

    // Every level-0 chunk matches the source volume
    let volume = ramp_volume(SHAPE);
    let slab_plan = plan(SHAPE, [20, 20], 8).unwrap();
    let grid = *slab_plan.grid();
    for index in grid.indices() {
        let region = grid.chunk_region(index).unwrap();
        let chunk = store.read_chunk(0, index).await.unwrap();
        assert_eq!(chunk, volume.sub_block(region.origin, region.extent));
    }

    // Chunk (2, 2, 1) lives in shard (1, 1, 1)
    assert!(root.join("0").join("1.1.1").join("2.2.1").is_file());
    for shard in [ShardId::new(0, 0, 0), ShardId::new(1, 1, 1)] {
        assert!(store.is_shard_committed(0, shard).await.unwrap());
    }
    assert!(store.is_shard_committed(2, ShardId::new(0, 0, 0)).await.unwrap());
}

#[tokio::test]
async fn test_multiscale_manifest_written() {
    let dir = TempDir::new().unwrap();
    let store = DirectoryStore::<u16>::create(dir.path().join("out"), None)
        .await
        .unwrap();
    store
        .write_multiscales(Multiscale::new(
            "brain",
            SpatialUnit::Micrometer,
            [0.5, 0.5, 2.0],
            2,
            3,
            "mean",
        ))
        .await
        .unwrap();

    let reopened = DirectoryStore::<u16>::open(store.root()).await.unwrap();
    let manifest = reopened.read_multiscales().await.unwrap();
    let ms = &manifest.multiscales[0];
    assert_eq!(ms.name, "brain");
    assert_eq!(ms.datasets.len(), 3);
    assert_eq!(
        ms.datasets[2].coordinate_transformations[0].scale,
        [2.0, 2.0, 8.0]
    );
}

#[tokio::test]
async fn test_resume_on_reopened_store() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("volume.stc");

    let store = Arc::new(
        DirectoryStore::<u16>::create(&root, Some([2, 2, 1]))
            .await
            .unwrap(),
    );
    convert_into(store, Arc::new(MockSliceReader::new(SHAPE))).await;

    // A second create must refuse to clobber the existing dataset
    assert!(DirectoryStore::<u16>::create(&root, Some([2, 2, 1]))
        .await
        .is_err());
    // Resuming with a different shard shape is rejected
    assert!(DirectoryStore::<u16>::open_or_create(&root, None)
        .await
        .is_err());

    let reader = Arc::new(MockSliceReader::new(SHAPE));
    let reopened = Arc::new(
        DirectoryStore::<u16>::open_or_create(&root, Some([2, 2, 1]))
            .await
            .unwrap(),
    );
    let report = convert_into(reopened, reader.clone()).await;

    assert_eq!(report.chunks_written(), 0);
    assert_eq!(report.levels[0].chunks_skipped, 18);
    assert_eq!(reader.total_reads(), 0);
}

// =============================================================================
// Image Stack
// =============================================================================

fn write_png_stack(dir: &Path, shape: [usize; 3]) {
    let [sx, sy, sz] = shape;
    for z in 0..sz {
        let image = GrayImage::from_fn(sx as u32, sy as u32, |x, y| {
            Luma([(x as usize + 3 * y as usize + 7 * z) as u8])
        });
        image.save(dir.join(format!("slice_{:03}.png", z))).unwrap();
    }
}

#[tokio::test]
async fn test_image_stack_converts_end_to_end() {
    let dir = TempDir::new().unwrap();
    let slices = dir.path().join("slices");
    std::fs::create_dir(&slices).unwrap();
    write_png_stack(&slices, [12, 9, 6]);

    let reader = ImageStackReader::<u8>::open(&slices).unwrap();
    assert_eq!(reader.volume_shape(), [12, 9, 6]);

    let store = Arc::new(
        DirectoryStore::<u8>::create(dir.path().join("out"), None)
            .await
            .unwrap(),
    );
    let report = Coordinator::new(
        plan([12, 9, 6], [12, 9], 4).unwrap(),
        Arc::new(reader),
        store.clone(),
        LevelsSpec::default(),
    )
    .run(ExecutionMode::Eager)
    .await
    .unwrap()
    .into_report()
    .unwrap();

    // 12 x 9 x 6 -> 6 x 5 x 3 -> 3 x 3 x 2
    assert_eq!(report.levels.len(), 3);

    let chunk = store.read_chunk(0, ChunkIndex::new(2, 2, 1)).await.unwrap();
    assert_eq!(chunk.shape(), [4, 1, 2]);
    // Voxel (8, 8, 4) is the chunk origin
    assert_eq!(chunk.get(0, 0, 0), (8 + 3 * 8 + 7 * 4) as u8);
}
