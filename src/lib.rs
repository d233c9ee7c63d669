//! # stack-to-chunk
//!
//! Convert a stack of 2D image slices into a chunked, optionally sharded,
//! multiscale 3D volume.
//!
//! The input is read one slab of `chunk_size` slices at a time, so peak memory
//! is bounded by the slab size rather than by the volume size. Each slab is cut
//! into cubic level-0 chunks, and every coarser level is then produced chunk by
//! chunk from the level below it.
//!
//! ## Features
//!
//! - **Bounded memory**: worker counts are derived from a byte budget before any I/O
//! - **Resumable**: chunks already in the store are skipped, never rewritten
//! - **Sharding**: chunks are grouped into shards that are committed once complete
//! - **Eager or lazy**: run the stages directly or build a dependency graph of them
//!
//! ## Architecture
//!
//! - [`geometry`] - Chunk grids, slab partition and shard layout
//! - [`memory`] - Per-worker memory estimates and worker counts
//! - [`io`] - Slice reader and chunk store traits, image-stack reader
//! - [`store`] - Directory and in-memory chunk stores, multiscale metadata
//! - [`pyramid`] - Level-0 writer, downsampler, worker pool and coordinator
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stack_to_chunk::{
//!     plan, Coordinator, ExecutionMode, LevelsSpec, MemoryStore, SliceReader, VolumeReader,
//! };
//! use stack_to_chunk::voxel::Block;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stack_to_chunk::ConvertError> {
//!     let volume = Block::from_fn([256, 256, 128], |x, y, z| ((x + y + z) % 256) as u8);
//!     let reader: Arc<dyn SliceReader<u8>> = Arc::new(VolumeReader::new(volume));
//!     let store = Arc::new(MemoryStore::<u8>::new());
//!
//!     let coordinator = Coordinator::new(
//!         plan([256, 256, 128], [256, 256], 64)?,
//!         reader,
//!         store.clone(),
//!         LevelsSpec::default(),
//!     );
//!     let output = coordinator.run(ExecutionMode::Eager).await?;
//!     println!("{:?}", output.into_report());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod memory;
pub mod pyramid;
pub mod store;
pub mod voxel;

// Re-export commonly used types
pub use config::{Cli, Command, ConvertConfig, PlanConfig, PlanOutputFormat};
pub use error::{ConvertError, PartialFailure, StoreError, UnitFailure};
pub use geometry::{
    plan, pyramid_shapes, ChunkGrid, ChunkIndex, Region, Shape3, ShardId, ShardTracker, Slab,
    SlabPlan,
};
pub use io::{ChunkReader, ChunkWriter, ImageStackReader, SliceReader, VolumeReader};
pub use memory::MemoryEstimate;
pub use pyramid::{
    Coordinator, ExecutionMode, LevelsSpec, PyramidReport, PyramidState, Reducer, Reduction,
    RunOptions, RunOutput, TaskGraph, TaskKey,
};
pub use store::{DirectoryStore, MemoryStore, Multiscale, SpatialUnit};
pub use voxel::{Block, DataType, Slice, Voxel};
