//! In-memory chunk store.
//!
//! Holds every chunk in a map keyed by `(level, index)`. It enforces
//! at-most-once writes: a second write to the same key is rejected with
//! [`StoreError::AlreadyWritten`], which makes it a strict checker for the
//! pipeline's no-double-write guarantee as well as a convenient store for
//! small volumes.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::geometry::{ChunkGrid, ChunkIndex, Shape3, ShardId};
use crate::io::{ChunkReader, ChunkWriter};
use crate::voxel::{Block, Voxel};

/// Chunk store that keeps everything in memory.
pub struct MemoryStore<T> {
    levels: RwLock<HashMap<usize, ChunkGrid>>,
    chunks: RwLock<HashMap<(usize, ChunkIndex), Block<T>>>,
    committed: RwLock<BTreeSet<(usize, ShardId)>>,
    writes: AtomicUsize,
}

impl<T: Voxel> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            levels: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            committed: RwLock::new(BTreeSet::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Grid of a created level.
    pub async fn grid(&self, level: usize) -> Option<ChunkGrid> {
        self.levels.read().await.get(&level).copied()
    }

    /// Copy of a stored chunk.
    pub async fn get(&self, level: usize, index: ChunkIndex) -> Option<Block<T>> {
        self.chunks.read().await.get(&(level, index)).cloned()
    }

    /// Number of chunks stored for `level`.
    pub async fn chunk_count(&self, level: usize) -> usize {
        self.chunks
            .read()
            .await
            .keys()
            .filter(|(l, _)| *l == level)
            .count()
    }

    /// Total successful writes since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    /// Shards committed so far, ordered by `(level, shard)`.
    pub async fn committed_shards(&self) -> Vec<(usize, ShardId)> {
        self.committed.read().await.iter().copied().collect()
    }

    /// Reassemble a whole level into one block.
    ///
    /// Returns `None` if the level is unknown or any chunk is missing.
    pub async fn assemble_level(&self, level: usize) -> Option<Block<T>> {
        let grid = self.grid(level).await?;
        let chunks = self.chunks.read().await;
        let mut volume = Block::zeros(grid.shape());
        for index in grid.indices() {
            let region = grid.chunk_region(index)?;
            let chunk = chunks.get(&(level, index))?;
            volume.paste(region.origin, chunk);
        }
        Some(volume)
    }
}

impl<T: Voxel> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Voxel> ChunkWriter<T> for MemoryStore<T> {
    async fn create_level(
        &self,
        level: usize,
        shape: Shape3,
        chunk_edge: usize,
    ) -> Result<(), StoreError> {
        let grid =
            ChunkGrid::new(shape, chunk_edge).map_err(|e| StoreError::Metadata(e.to_string()))?;
        let mut levels = self.levels.write().await;
        match levels.get(&level) {
            Some(existing) if *existing == grid => Ok(()),
            Some(existing) => Err(StoreError::Metadata(format!(
                "level {} exists with shape {:?}, requested {:?}",
                level,
                existing.shape(),
                shape
            ))),
            None => {
                levels.insert(level, grid);
                Ok(())
            }
        }
    }

    async fn write_chunk(
        &self,
        level: usize,
        index: ChunkIndex,
        data: Block<T>,
    ) -> Result<(), StoreError> {
        let grid = self
            .grid(level)
            .await
            .ok_or(StoreError::UnknownLevel(level))?;
        let expected = grid.chunk_extent(index).ok_or_else(|| {
            StoreError::NotFound(format!("chunk {} outside level {} grid", index, level))
        })?;
        if data.shape() != expected {
            return Err(StoreError::ShapeMismatch {
                expected,
                actual: data.shape(),
            });
        }

        let mut chunks = self.chunks.write().await;
        if chunks.contains_key(&(level, index)) {
            return Err(StoreError::AlreadyWritten { level, index });
        }
        chunks.insert((level, index), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn chunk_exists(&self, level: usize, index: ChunkIndex) -> Result<bool, StoreError> {
        Ok(self.chunks.read().await.contains_key(&(level, index)))
    }

    async fn commit_shard(&self, level: usize, shard: ShardId) -> Result<(), StoreError> {
        self.committed.write().await.insert((level, shard));
        Ok(())
    }
}

#[async_trait]
impl<T: Voxel> ChunkReader<T> for MemoryStore<T> {
    async fn read_chunk(&self, level: usize, index: ChunkIndex) -> Result<Block<T>, StoreError> {
        self.get(level, index)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("chunk {} at level {}", index, level)))
    }
}
