//! Test utilities for integration tests.
//!
//! This module provides a slice reader with read tracking and failure
//! injection, and a chunk store wrapper that flags double writes.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use stack_to_chunk::error::StoreError;
use stack_to_chunk::geometry::{ChunkIndex, Shape3, ShardId};
use stack_to_chunk::io::{ChunkReader, ChunkWriter, SliceReader};
use stack_to_chunk::store::MemoryStore;
use stack_to_chunk::voxel::{Block, Slice};

/// Voxel value at `(x, y, z)` of the synthetic ramp volume.
pub fn ramp(x: usize, y: usize, z: usize) -> u16 {
    (x + 20 * y + 400 * z) as u16
}

/// The full synthetic volume, for comparison.
pub fn ramp_volume(shape: Shape3) -> Block<u16> {
    Block::from_fn(shape, ramp)
}

/// Mean-reduce a whole volume in one pass, truncating toward zero.
pub fn reference_mean(volume: &Block<u16>, factor: usize) -> Block<u16> {
    let [sx, sy, sz] = volume.shape();
    let out = [
        sx.div_ceil(factor),
        sy.div_ceil(factor),
        sz.div_ceil(factor),
    ];
    Block::from_fn(out, |x, y, z| {
        let mut sum = 0.0;
        let mut count = 0usize;
        for pz in z * factor..((z + 1) * factor).min(sz) {
            for py in y * factor..((y + 1) * factor).min(sy) {
                for px in x * factor..((x + 1) * factor).min(sx) {
                    sum += volume.get(px, py, pz) as f64;
                    count += 1;
                }
            }
        }
        (sum / count as f64) as u16
    })
}

// =============================================================================
// Mock Slice Reader with Read Tracking
// =============================================================================

/// A slice reader over the ramp volume that counts reads per slice.
///
/// Reads of selected slices can be made to fail a fixed number of times.
pub struct MockSliceReader {
    shape: Shape3,
    reads: Vec<AtomicUsize>,
    failures: Mutex<HashMap<usize, usize>>,
}

impl MockSliceReader {
    pub fn new(shape: Shape3) -> Self {
        Self {
            shape,
            reads: (0..shape[2]).map(|_| AtomicUsize::new(0)).collect(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` reads of slice `z` with an I/O error.
    pub fn fail_slice(self, z: usize, times: usize) -> Self {
        self.failures.lock().unwrap().insert(z, times);
        self
    }

    /// Reads of slice `z` so far, failed attempts included.
    pub fn read_count(&self, z: usize) -> usize {
        self.reads[z].load(Ordering::SeqCst)
    }

    pub fn total_reads(&self) -> usize {
        self.reads.iter().map(|r| r.load(Ordering::SeqCst)).sum()
    }
}

#[async_trait]
impl SliceReader<u16> for MockSliceReader {
    fn slice_shape(&self) -> [usize; 2] {
        [self.shape[0], self.shape[1]]
    }

    fn depth(&self) -> usize {
        self.shape[2]
    }

    async fn read_slice(&self, z: usize) -> Result<Slice<u16>, StoreError> {
        self.reads[z].fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&z) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Io(format!("injected failure reading z={}", z)));
                }
            }
        }

        let [sx, sy, _] = self.shape;
        let data = (0..sy)
            .flat_map(|y| (0..sx).map(move |x| ramp(x, y, z)))
            .collect();
        Ok(Slice::from_vec([sx, sy], data).unwrap())
    }
}

// =============================================================================
// Tracking Chunk Store
// =============================================================================

/// Wraps a [`MemoryStore`] and records every write attempt.
///
/// A second write of the same chunk is recorded as a double write instead of
/// being forwarded, so tests can assert on it after the run.
pub struct TrackingStore {
    inner: MemoryStore<u16>,
    written: Mutex<HashSet<(usize, ChunkIndex)>>,
    double_writes: Mutex<Vec<(usize, ChunkIndex)>>,
    write_failures: Mutex<HashMap<(usize, ChunkIndex), usize>>,
    writes: AtomicUsize,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl TrackingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            written: Mutex::new(HashSet::new()),
            double_writes: Mutex::new(Vec::new()),
            write_failures: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
        }
    }

    /// Fail the next `times` writes of one chunk with an I/O error.
    pub fn fail_write(&self, level: usize, index: ChunkIndex, times: usize) {
        self.write_failures
            .lock()
            .unwrap()
            .insert((level, index), times);
    }

    /// Cancel `token` once `writes` chunks have been written in total.
    pub fn cancel_after(&self, writes: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((writes, token));
    }

    pub fn inner(&self) -> &MemoryStore<u16> {
        &self.inner
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn double_writes(&self) -> Vec<(usize, ChunkIndex)> {
        self.double_writes.lock().unwrap().clone()
    }
}

impl Default for TrackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkWriter<u16> for TrackingStore {
    async fn create_level(
        &self,
        level: usize,
        shape: Shape3,
        chunk_edge: usize,
    ) -> Result<(), StoreError> {
        self.inner.create_level(level, shape, chunk_edge).await
    }

    async fn write_chunk(
        &self,
        level: usize,
        index: ChunkIndex,
        data: Block<u16>,
    ) -> Result<(), StoreError> {
        {
            let mut failures = self.write_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&(level, index)) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Io(format!(
                        "injected failure writing {} at level {}",
                        index, level
                    )));
                }
            }
        }

        if !self.written.lock().unwrap().insert((level, index)) {
            self.double_writes.lock().unwrap().push((level, index));
            return Ok(());
        }
        self.inner.write_chunk(level, index, data).await?;

        let total = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if total >= *limit {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn chunk_exists(&self, level: usize, index: ChunkIndex) -> Result<bool, StoreError> {
        self.inner.chunk_exists(level, index).await
    }

    async fn commit_shard(&self, level: usize, shard: ShardId) -> Result<(), StoreError> {
        self.inner.commit_shard(level, shard).await
    }
}

#[async_trait]
impl ChunkReader<u16> for TrackingStore {
    async fn read_chunk(&self, level: usize, index: ChunkIndex) -> Result<Block<u16>, StoreError> {
        self.inner.read_chunk(level, index).await
    }
}
