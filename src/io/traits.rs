use async_trait::async_trait;

use crate::error::StoreError;
use crate::geometry::{ChunkIndex, Shape3, ShardId};
use crate::voxel::{Block, Slice, Voxel};

/// Source of input slices.
///
/// Implementations must be safe to call concurrently for different indices.
/// Each call reads one whole slice; partial reads are never requested.
#[async_trait]
pub trait SliceReader<T: Voxel>: Send + Sync {
    /// `[X, Y]` shape of every slice.
    fn slice_shape(&self) -> [usize; 2];

    /// Number of slices (`Z`).
    fn depth(&self) -> usize;

    /// Read the slice at `z`.
    async fn read_slice(&self, z: usize) -> Result<Slice<T>, StoreError>;

    /// Volume shape `(X, Y, Z)`.
    fn volume_shape(&self) -> Shape3 {
        let [x, y] = self.slice_shape();
        [x, y, self.depth()]
    }
}

/// Destination for pyramid chunks.
///
/// Implementations must be safe to call concurrently for distinct chunk keys,
/// and must reject data whose shape disagrees with the chunk's true extent.
/// Any internal compression must run single-threaded so that the pipeline's
/// worker count is the only source of parallelism.
#[async_trait]
pub trait ChunkWriter<T: Voxel>: Send + Sync {
    /// Declare a level before any of its chunks are written.
    ///
    /// Declaring an existing level with the same geometry is a no-op, which is
    /// what allows resumed runs.
    async fn create_level(
        &self,
        level: usize,
        shape: Shape3,
        chunk_edge: usize,
    ) -> Result<(), StoreError>;

    /// Write one chunk at its true extent.
    async fn write_chunk(
        &self,
        level: usize,
        index: ChunkIndex,
        data: Block<T>,
    ) -> Result<(), StoreError>;

    /// Whether the chunk has already been durably written.
    async fn chunk_exists(&self, level: usize, index: ChunkIndex) -> Result<bool, StoreError>;

    /// Mark a shard whose member chunks are all written as ready for reading.
    ///
    /// Stores without whole-shard commit semantics can ignore this.
    async fn commit_shard(&self, _level: usize, _shard: ShardId) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read access to previously written chunks.
#[async_trait]
pub trait ChunkReader<T: Voxel>: Send + Sync {
    /// Read one chunk at its true extent.
    async fn read_chunk(&self, level: usize, index: ChunkIndex) -> Result<Block<T>, StoreError>;
}
