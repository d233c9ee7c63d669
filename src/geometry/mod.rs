//! Geometry of the conversion: chunk grids, slab partition and shard layout.
//!
//! Everything in this module is a pure function of shapes. It runs before any
//! I/O, so invalid shapes are rejected with
//! [`ConvertError::InvalidGeometry`](crate::error::ConvertError) before a single
//! slice is read.
//!
//! ```text
//!   slices z=0..Z          slabs (chunk_edge slices)      level-0 chunks
//!  ┌──────────┐           ┌──────────┐                  ┌───┬───┬──┐
//!  │ z = 0    │──┐        │ slab 0   │ ──────────────▶  │000│100│2.│  iz = 0
//!  │ ...      │  ├──────▶ │          │                  ├───┼───┼──┤
//!  │ z = C-1  │──┘        ├──────────┤                  │010│110│..│
//!  │ z = C    │──┐        │ slab 1   │ ──────────────▶  └───┴───┴──┘  iz = 1
//!  │ ...      │──┘        └──────────┘
//!  └──────────┘
//! ```

mod grid;
mod planner;
mod shard;

pub use grid::{
    ceil_div, downsampled_shape, pyramid_shapes, ChunkGrid, ChunkIndex, Region, Shape3,
};
pub use planner::{plan, Slab, SlabPlan};
pub use shard::{
    group_into_shards, shard_grid_shape, shard_of, validate_shard_shape, ShardId, ShardTracker,
};
