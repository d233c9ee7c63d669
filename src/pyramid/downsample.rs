//! Derivation of level `k + 1` from level `k`.
//!
//! One unit of work per output chunk. Output chunk `(ix, iy, iz)` at level
//! `k + 1` covers the level-`k` region starting at `index * edge * f`, which is
//! exactly `f x f x f` level-`k` chunks (fewer at the volume edge). The worker
//! reads those chunks into a pre-image, reduces every `f x f x f` footprint to
//! one voxel and writes the single resulting chunk.
//!
//! ```text
//!   level k chunks (f = 2)          level k+1 chunk
//!  ┌─────┬─────┐
//!  │ 0,0 │ 1,0 │   reduce 2x2x2
//!  ├─────┼─────┤  ─────────────▶   ┌─────┐
//!  │ 0,1 │ 1,1 │                   │ 0,0 │
//!  └─────┴─────┘                   └─────┘
//! ```
//!
//! Footprints on the far edge of a level are clipped to the voxels that exist,
//! so an edge voxel is the reduction of fewer than `f^3` inputs.

use std::sync::Arc;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{ConvertError, StoreError};
use crate::geometry::{downsampled_shape, plan, ChunkGrid, ChunkIndex, Shape3, ShardTracker};
use crate::io::{ChunkReader, ChunkWriter};
use crate::voxel::{Block, Voxel};

use super::pool::{StageReport, UnitStats, WorkUnit, WorkerPool};
use super::writer::commit_if_complete;

// =============================================================================
// Reductions
// =============================================================================

/// Reduces the voxels of one footprint to a single voxel.
pub trait Reducer<T>: Send + Sync {
    /// Reduce a non-empty set of values.
    fn reduce(&self, values: &[T]) -> T;

    /// Name recorded in the multiscale manifest.
    fn name(&self) -> &str {
        "custom"
    }
}

/// Built-in reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Arithmetic mean, truncated toward zero for integer types
    #[default]
    Mean,
    Max,
    Min,
}

impl Reduction {
    pub fn as_str(self) -> &'static str {
        match self {
            Reduction::Mean => "mean",
            Reduction::Max => "max",
            Reduction::Min => "min",
        }
    }
}

impl<T: Voxel> Reducer<T> for Reduction {
    fn reduce(&self, values: &[T]) -> T {
        let Some(&first) = values.first() else {
            return T::default();
        };
        match self {
            Reduction::Mean => {
                let sum: f64 = values.iter().map(|v| v.to_f64()).sum();
                T::from_f64(sum / values.len() as f64)
            }
            Reduction::Max => values[1..]
                .iter()
                .fold(first, |acc, &v| if v > acc { v } else { acc }),
            Reduction::Min => values[1..]
                .iter()
                .fold(first, |acc, &v| if v < acc { v } else { acc }),
        }
    }

    fn name(&self) -> &str {
        self.as_str()
    }
}

/// Reduce a pre-image into an output block of `out_extent`.
///
/// Output voxel `(x, y, z)` is the reduction of the pre-image voxels in
/// `[x*f, min((x+1)*f, pre_x))` and likewise for `y` and `z`.
pub fn reduce_block<T: Voxel>(
    pre: &Block<T>,
    factor: usize,
    out_extent: Shape3,
    reducer: &dyn Reducer<T>,
) -> Block<T> {
    let pre_shape = pre.shape();
    let mut values = Vec::with_capacity(factor.pow(3));
    Block::from_fn(out_extent, |x, y, z| {
        values.clear();
        let (x0, y0, z0) = (x * factor, y * factor, z * factor);
        for pz in z0..(z0 + factor).min(pre_shape[2]) {
            for py in y0..(y0 + factor).min(pre_shape[1]) {
                for px in x0..(x0 + factor).min(pre_shape[0]) {
                    values.push(pre.get(px, py, pz));
                }
            }
        }
        reducer.reduce(&values)
    })
}

// =============================================================================
// Downsample Job
// =============================================================================

/// The level being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSource {
    pub level: usize,
    pub shape: Shape3,
    pub chunk_edge: usize,
    pub factor: usize,
}

impl LevelSource {
    /// Shape of the level produced from this one.
    pub fn target_shape(&self) -> Shape3 {
        downsampled_shape(self.shape, self.factor)
    }
}

/// Everything a downsample worker needs, cheap to clone into each task.
pub struct DownsampleJob<T: Voxel> {
    source: LevelSource,
    source_grid: ChunkGrid,
    target_grid: ChunkGrid,
    reader: Arc<dyn ChunkReader<T>>,
    writer: Arc<dyn ChunkWriter<T>>,
    reducer: Arc<dyn Reducer<T>>,
    tracker: Option<Arc<ShardTracker>>,
    cancel: CancellationToken,
}

impl<T: Voxel> Clone for DownsampleJob<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            source_grid: self.source_grid,
            target_grid: self.target_grid,
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
            reducer: Arc::clone(&self.reducer),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Voxel> DownsampleJob<T> {
    pub fn new(
        source: LevelSource,
        reader: Arc<dyn ChunkReader<T>>,
        writer: Arc<dyn ChunkWriter<T>>,
        reducer: Arc<dyn Reducer<T>>,
        tracker: Option<Arc<ShardTracker>>,
        cancel: CancellationToken,
    ) -> Result<Self, ConvertError> {
        if source.factor < 2 {
            return Err(ConvertError::geometry(format!(
                "downsample factor must be >= 2, got {}",
                source.factor
            )));
        }
        let source_grid = ChunkGrid::new(source.shape, source.chunk_edge)?;
        let target_shape = source.target_shape();
        let target_grid = *plan(
            target_shape,
            [target_shape[0], target_shape[1]],
            source.chunk_edge,
        )?
        .grid();
        Ok(Self {
            source,
            source_grid,
            target_grid,
            reader,
            writer,
            reducer,
            tracker,
            cancel,
        })
    }

    /// Level written by this job.
    pub fn target_level(&self) -> usize {
        self.source.level + 1
    }

    /// Chunk grid of the target level.
    pub fn target_grid(&self) -> &ChunkGrid {
        &self.target_grid
    }

    /// One unit per target chunk.
    pub fn units(&self) -> Vec<WorkUnit> {
        let level = self.target_level();
        self.target_grid
            .indices()
            .map(|index| WorkUnit::Chunk { level, index })
            .collect()
    }

    /// Produce one target chunk unless it already exists.
    pub async fn process_chunk(&self, index: ChunkIndex) -> Result<UnitStats, ConvertError> {
        let level = self.target_level();
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled { level, pending: 1 });
        }

        let exists = self
            .writer
            .chunk_exists(level, index)
            .await
            .map_err(|source| ConvertError::ChunkWrite {
                level,
                index,
                source,
            })?;
        if exists {
            commit_if_complete(self.tracker.as_deref(), self.writer.as_ref(), index).await?;
            return Ok(UnitStats {
                written: 0,
                skipped: 1,
            });
        }

        let out_region = self.target_grid.chunk_region(index).ok_or_else(|| {
            ConvertError::geometry(format!("chunk {} outside level {}", index, level))
        })?;
        let pre = self.read_pre_image(out_region.origin, out_region.extent).await?;

        let factor = self.source.factor;
        let reducer = Arc::clone(&self.reducer);
        let extent = out_region.extent;
        let chunk = tokio::task::spawn_blocking(move || {
            reduce_block(&pre, factor, extent, reducer.as_ref())
        })
        .await
        .map_err(|e| ConvertError::Worker(e.to_string()))?;

        self.writer
            .write_chunk(level, index, chunk)
            .await
            .map_err(|source| ConvertError::ChunkWrite {
                level,
                index,
                source,
            })?;
        commit_if_complete(self.tracker.as_deref(), self.writer.as_ref(), index).await?;

        debug!(level, chunk = %index, "Downsampled chunk");
        Ok(UnitStats {
            written: 1,
            skipped: 0,
        })
    }

    /// Assemble the source voxels covered by an output region.
    async fn read_pre_image(
        &self,
        out_origin: Shape3,
        out_extent: Shape3,
    ) -> Result<Block<T>, ConvertError> {
        let factor = self.source.factor;
        let edge = self.source.chunk_edge;
        let shape = self.source.shape;

        let origin = out_origin.map(|o| o * factor);
        let mut extent = [0; 3];
        for a in 0..3 {
            extent[a] = (out_extent[a] * factor).min(shape[a] - origin[a]);
        }

        let first = origin.map(|o| o / edge);
        let last = [0, 1, 2].map(|a| (origin[a] + extent[a] - 1) / edge);

        let mut pre = Block::zeros(extent);
        for iz in first[2]..=last[2] {
            for iy in first[1]..=last[1] {
                for ix in first[0]..=last[0] {
                    let index = ChunkIndex::new(ix, iy, iz);
                    let level = self.source.level;
                    let region = self.source_grid.chunk_region(index).ok_or_else(|| {
                        ConvertError::geometry(format!("chunk {} outside level {}", index, level))
                    })?;
                    let chunk = self
                        .reader
                        .read_chunk(level, index)
                        .await
                        .map_err(|source| ConvertError::ChunkRead {
                            level,
                            index,
                            source,
                        })?;
                    if chunk.shape() != region.extent {
                        return Err(ConvertError::ChunkRead {
                            level,
                            index,
                            source: StoreError::ShapeMismatch {
                                expected: region.extent,
                                actual: chunk.shape(),
                            },
                        });
                    }
                    let offset = [0, 1, 2].map(|a| region.origin[a] - origin[a]);
                    pre.paste(offset, &chunk);
                }
            }
        }
        Ok(pre)
    }
}

/// Write every chunk of level `source.level + 1`.
///
/// The source level must be completely written before this is called.
#[instrument(skip_all, fields(level = source.level + 1, workers = pool.workers()))]
pub async fn downsample_level<T: Voxel>(
    reader: Arc<dyn ChunkReader<T>>,
    writer: Arc<dyn ChunkWriter<T>>,
    source: LevelSource,
    reducer: Arc<dyn Reducer<T>>,
    pool: &WorkerPool,
    tracker: Option<Arc<ShardTracker>>,
) -> Result<StageReport, ConvertError> {
    let job = DownsampleJob::new(
        source,
        reader,
        writer,
        reducer,
        tracker,
        pool.cancel_token().clone(),
    )?;
    let level = job.target_level();
    let units = job.units();

    info!(
        level,
        shape = ?source.target_shape(),
        chunks = units.len(),
        "Downsampling level"
    );
    let report = pool
        .run(&format!("level {}", level), units, move |unit| {
            let job = job.clone();
            async move {
                match unit {
                    WorkUnit::Chunk { index, .. } => job.process_chunk(index).await,
                    other => Err(ConvertError::Graph(format!("unexpected unit {}", other))),
                }
            }
        })
        .await;
    info!(
        level,
        written = report.chunks_written,
        skipped = report.chunks_skipped,
        failed = report.failures.len(),
        "Level finished"
    );
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_mean_truncates_integers() {
        assert_eq!(Reduction::Mean.reduce(&[1u16, 2, 2, 2]), 1);
        assert_eq!(Reduction::Mean.reduce(&[3u8, 4]), 3);
        assert_eq!(Reduction::Mean.reduce(&[-3i16, -4]), -3);
        assert_eq!(Reduction::Mean.reduce(&[1.0f32, 2.0]), 1.5);
    }

    #[test]
    fn test_max_min() {
        assert_eq!(Reduction::Max.reduce(&[4u16, 9, 1]), 9);
        assert_eq!(Reduction::Min.reduce(&[4u16, 9, 1]), 1);
        assert_eq!(<Reduction as Reducer<u8>>::name(&Reduction::Max), "max");
    }

    #[test]
    fn test_reduce_block_clips_edge_footprints() {
        // 3x1x1 pre-image, factor 2: second output voxel sees only x = 2.
        let pre = Block::from_vec([3, 1, 1], vec![10u16, 20, 7]).unwrap();
        let out = reduce_block(&pre, 2, [2, 1, 1], &Reduction::Mean);
        assert_eq!(out.as_slice(), &[15, 7]);
    }

    #[test]
    fn test_reduce_block_full_footprint() {
        let pre = Block::from_fn([4, 4, 4], |x, y, z| (x + y + z) as u32);
        let out = reduce_block(&pre, 2, [2, 2, 2], &Reduction::Max);
        assert_eq!(out.get(0, 0, 0), 3);
        assert_eq!(out.get(1, 1, 1), 9);
    }

    async fn store_level(store: &MemoryStore<u16>, level: usize, volume: &Block<u16>, edge: usize) {
        store.create_level(level, volume.shape(), edge).await.unwrap();
        let grid = ChunkGrid::new(volume.shape(), edge).unwrap();
        for index in grid.indices() {
            let region = grid.chunk_region(index).unwrap();
            store
                .write_chunk(level, index, volume.sub_block(region.origin, region.extent))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_downsample_level_matches_whole_volume_reduction() {
        let volume = Block::from_fn([20, 20, 10], |x, y, z| (x * 3 + y * 5 + z * 7) as u16);
        let store = Arc::new(MemoryStore::<u16>::new());
        store_level(&store, 0, &volume, 8).await;
        store.create_level(1, [10, 10, 5], 8).await.unwrap();

        let source = LevelSource {
            level: 0,
            shape: [20, 20, 10],
            chunk_edge: 8,
            factor: 2,
        };
        let pool = WorkerPool::new(3, 0, CancellationToken::new());
        let report = downsample_level(
            store.clone(),
            store.clone(),
            source,
            Arc::new(Reduction::Mean),
            &pool,
            None,
        )
        .await
        .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.chunks_written, 4);

        let expected = reduce_block(&volume, 2, [10, 10, 5], &Reduction::Mean);
        assert_eq!(store.assemble_level(1).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_rerun_skips_existing_chunks() {
        let volume = Block::from_fn([16, 16, 16], |x, _, _| x as u16);
        let store = Arc::new(MemoryStore::<u16>::new());
        store_level(&store, 0, &volume, 8).await;
        store.create_level(1, [8, 8, 8], 8).await.unwrap();

        let source = LevelSource {
            level: 0,
            shape: [16, 16, 16],
            chunk_edge: 8,
            factor: 2,
        };
        let pool = WorkerPool::new(1, 0, CancellationToken::new());
        for _ in 0..2 {
            downsample_level(
                store.clone(),
                store.clone(),
                source,
                Arc::new(Reduction::Max),
                &pool,
                None,
            )
            .await
            .unwrap();
        }
        // 8 level-0 chunks + 1 level-1 chunk, no duplicate writes.
        assert_eq!(store.write_count(), 9);
        let chunk = store.get(1, ChunkIndex::new(0, 0, 0)).await.unwrap();
        assert_eq!(chunk.get(7, 0, 0), 15);
    }

    #[tokio::test]
    async fn test_missing_source_chunk_is_unit_failure() {
        let store = Arc::new(MemoryStore::<u16>::new());
        store.create_level(0, [16, 8, 8], 8).await.unwrap();
        store.create_level(1, [8, 4, 4], 8).await.unwrap();
        store
            .write_chunk(0, ChunkIndex::new(0, 0, 0), Block::zeros([8, 8, 8]))
            .await
            .unwrap();

        let source = LevelSource {
            level: 0,
            shape: [16, 8, 8],
            chunk_edge: 8,
            factor: 2,
        };
        let pool = WorkerPool::new(1, 2, CancellationToken::new());
        let report = downsample_level(
            store.clone(),
            store.clone(),
            source,
            Arc::new(Reduction::Mean),
            &pool,
            None,
        )
        .await
        .unwrap();

        assert_eq!(report.failures.len(), 1);
        // NotFound is not retryable.
        assert_eq!(report.failures[0].attempts, 1);
        assert!(matches!(
            report.failures[0].error,
            ConvertError::ChunkRead { level: 0, .. }
        ));
    }
}
