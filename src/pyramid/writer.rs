//! Full-resolution (level 0) writer.
//!
//! One unit of work per slab. A slab worker reads its `z_count` slices into an
//! `(X, Y, z_count)` buffer once, then cuts that buffer into the slab's
//! Z-layer of level-0 chunks. Because slab `i` owns exactly the chunks with
//! `iz == i`, slabs never contend for a chunk and can run in any order.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::ConvertError;
use crate::geometry::{ChunkIndex, ShardTracker, SlabPlan};
use crate::io::{ChunkWriter, SliceReader};
use crate::voxel::{Block, Voxel};

use super::pool::{StageReport, UnitStats, WorkUnit, WorkerPool};

/// Everything a slab worker needs, cheap to clone into each task.
pub struct Level0Job<T: Voxel> {
    plan: Arc<SlabPlan>,
    reader: Arc<dyn SliceReader<T>>,
    writer: Arc<dyn ChunkWriter<T>>,
    tracker: Option<Arc<ShardTracker>>,
    cancel: CancellationToken,
}

impl<T: Voxel> Clone for Level0Job<T> {
    fn clone(&self) -> Self {
        Self {
            plan: Arc::clone(&self.plan),
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
            tracker: self.tracker.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Voxel> Level0Job<T> {
    /// Create a job, checking that the reader matches the plan.
    pub fn new(
        plan: Arc<SlabPlan>,
        reader: Arc<dyn SliceReader<T>>,
        writer: Arc<dyn ChunkWriter<T>>,
        tracker: Option<Arc<ShardTracker>>,
        cancel: CancellationToken,
    ) -> Result<Self, ConvertError> {
        if reader.volume_shape() != plan.volume_shape() {
            return Err(ConvertError::geometry(format!(
                "slice reader provides volume {:?}, plan expects {:?}",
                reader.volume_shape(),
                plan.volume_shape()
            )));
        }
        Ok(Self {
            plan,
            reader,
            writer,
            tracker,
            cancel,
        })
    }

    /// Slab units in Z order.
    pub fn units(&self) -> Vec<WorkUnit> {
        self.plan.slabs().iter().map(|s| WorkUnit::Slab(s.index)).collect()
    }

    /// Write every missing chunk of one slab.
    ///
    /// Chunks already in the store are skipped. If all of them are present the
    /// slab's slices are not read at all. A slab that starts after
    /// cancellation reads nothing; one already running stops after the chunk
    /// it is currently writing.
    pub async fn process_slab(&self, slab_index: usize) -> Result<UnitStats, ConvertError> {
        let slab = self
            .plan
            .slabs()
            .get(slab_index)
            .ok_or_else(|| ConvertError::geometry(format!("no slab {}", slab_index)))?;
        let mut stats = UnitStats::default();

        let mut missing = Vec::with_capacity(slab.chunks.len());
        for &index in &slab.chunks {
            let exists = self
                .writer
                .chunk_exists(0, index)
                .await
                .map_err(|source| ConvertError::ChunkWrite {
                    level: 0,
                    index,
                    source,
                })?;
            if exists {
                stats.skipped += 1;
                self.record(index).await?;
            } else {
                missing.push(index);
            }
        }
        if missing.is_empty() {
            debug!(slab = slab_index, "Slab already written");
            return Ok(stats);
        }
        if self.cancel.is_cancelled() {
            return Err(ConvertError::Cancelled {
                level: 0,
                pending: missing.len(),
            });
        }

        let [x, y] = self.plan.slice_shape();
        let mut buffer = Block::<T>::zeros([x, y, slab.z_count]);
        for (plane, z) in slab.z_range().enumerate() {
            let slice = self
                .reader
                .read_slice(z)
                .await
                .map_err(|source| ConvertError::SliceRead { z, source })?;
            buffer
                .set_plane(plane, &slice)
                .map_err(|source| ConvertError::SliceRead { z, source })?;
        }

        let grid = self.plan.grid();
        for (n, &index) in missing.iter().enumerate() {
            if n > 0 && self.cancel.is_cancelled() {
                return Err(ConvertError::Cancelled {
                    level: 0,
                    pending: missing.len() - n,
                });
            }
            let region = grid
                .chunk_region(index)
                .ok_or_else(|| ConvertError::geometry(format!("chunk {} outside level 0", index)))?;
            let chunk = buffer.sub_block([region.origin[0], region.origin[1], 0], region.extent);
            self.writer
                .write_chunk(0, index, chunk)
                .await
                .map_err(|source| ConvertError::ChunkWrite {
                    level: 0,
                    index,
                    source,
                })?;
            stats.written += 1;
            self.record(index).await?;
        }

        debug!(
            slab = slab_index,
            written = stats.written,
            skipped = stats.skipped,
            "Slab written"
        );
        Ok(stats)
    }

    async fn record(&self, index: ChunkIndex) -> Result<(), ConvertError> {
        commit_if_complete(self.tracker.as_deref(), self.writer.as_ref(), index).await
    }
}

/// Record a landed chunk and commit its shard if it was the last member.
pub(crate) async fn commit_if_complete<T: Voxel>(
    tracker: Option<&ShardTracker>,
    writer: &dyn ChunkWriter<T>,
    index: ChunkIndex,
) -> Result<(), ConvertError> {
    let Some(tracker) = tracker else {
        return Ok(());
    };
    if let Some(shard) = tracker.record(index) {
        writer.commit_shard(tracker.level(), shard).await?;
        debug!(level = tracker.level(), shard = %shard, "Shard complete");
    }
    Ok(())
}

/// Write all level-0 chunks, one slab per unit of work.
///
/// Slab failures are retried by the pool and then collected in the returned
/// report; they do not stop other slabs.
#[instrument(skip_all, fields(slabs = plan.len(), workers = pool.workers()))]
pub async fn write_level0<T: Voxel>(
    plan: Arc<SlabPlan>,
    reader: Arc<dyn SliceReader<T>>,
    writer: Arc<dyn ChunkWriter<T>>,
    pool: &WorkerPool,
    tracker: Option<Arc<ShardTracker>>,
) -> Result<StageReport, ConvertError> {
    let job = Level0Job::new(plan, reader, writer, tracker, pool.cancel_token().clone())?;
    let units = job.units();

    info!(slabs = units.len(), "Writing level 0");
    let report = pool
        .run("level 0", units, move |unit| {
            let job = job.clone();
            async move {
                match unit {
                    WorkUnit::Slab(i) => job.process_slab(i).await,
                    other => Err(ConvertError::Graph(format!("unexpected unit {}", other))),
                }
            }
        })
        .await;
    info!(
        written = report.chunks_written,
        skipped = report.chunks_skipped,
        failed = report.failures.len(),
        "Level 0 finished"
    );
    Ok(report)
}

// =============================================================================
// Tests
// =============================================================================
