//! Chunk stores and store metadata.
//!
//! - [`DirectoryStore`]: one file per chunk under a level directory, grouped
//!   into shard directories when a shard shape is set
//! - [`MemoryStore`]: everything in memory, rejects duplicate writes
//!
//! Both implement [`ChunkWriter`](crate::io::ChunkWriter) and
//! [`ChunkReader`](crate::io::ChunkReader).

mod directory;
mod memory;
mod metadata;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;
pub use metadata::{
    Axis, CoordinateTransformation, Dataset, GroupMetadata, LevelMetadata, Multiscale,
    MultiscaleDescription, SpatialUnit, StoreMetadata, MULTISCALES_VERSION,
};
