//! The conversion engine: level-0 writer, downsampler and the coordinator that
//! sequences them.
//!
//! ```text
//!                 ┌──────────────────── Coordinator ────────────────────┐
//!                 │                                                     │
//!  SliceReader ──▶│ write_level0 ──▶ downsample_level ──▶ ... ──▶ done  │──▶ ChunkWriter
//!                 │  (slab units)     (chunk units)                     │
//!                 └──────────── WorkerPool / TaskGraph ─────────────────┘
//! ```
//!
//! Stages run through a [`WorkerPool`] in eager mode, or become nodes of a
//! [`TaskGraph`] in lazy mode. Both share the same per-unit code in
//! [`Level0Job`] and [`DownsampleJob`].

mod coordinator;
mod downsample;
mod graph;
mod pool;
mod writer;

pub use coordinator::{
    Coordinator, ExecutionMode, LevelReport, LevelsSpec, PyramidReport, PyramidState, RunOptions,
    RunOutput, DEFAULT_MEMORY_BUDGET_BYTES,
};
pub use downsample::{
    downsample_level, reduce_block, DownsampleJob, LevelSource, Reducer, Reduction,
};
pub use graph::{GraphReport, ResourceSpec, TaskFn, TaskFuture, TaskGraph, TaskKey};
pub use pool::{run_with_retries, StageReport, UnitStats, WorkUnit, WorkerPool};
pub use writer::{write_level0, Level0Job};
