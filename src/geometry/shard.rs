//! Shard grouping of chunks.
//!
//! A shard is a fixed block of `(sx, sy, sz)` chunks stored together. Chunk
//! `(ix, iy, iz)` belongs to shard `(ix / sx, iy / sy, iz / sz)`, so shard
//! boundaries always fall on chunk boundaries.
//!
//! [`ShardTracker`] counts member chunks as they land so that stores with
//! whole-shard commit semantics can be told exactly once when a shard is
//! complete. Shards on the far edge of a level contain fewer chunks; the
//! tracker expects only the members that exist in the level grid.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

use super::grid::{ceil_div, ChunkGrid, ChunkIndex, Shape3};

/// Position of a shard in its level's shard grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ShardId {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl ShardId {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.x, self.y, self.z)
    }
}

/// Validate a shard shape (in chunks).
pub fn validate_shard_shape(shard_shape: Shape3) -> Result<(), ConvertError> {
    if shard_shape.iter().any(|&s| s == 0) {
        return Err(ConvertError::geometry(format!(
            "shard shape must be >= 1 chunk on every axis, got {:?}",
            shard_shape
        )));
    }
    Ok(())
}

/// Shard containing `index`.
#[inline]
pub fn shard_of(index: ChunkIndex, shard_shape: Shape3) -> ShardId {
    ShardId::new(
        index.x / shard_shape[0],
        index.y / shard_shape[1],
        index.z / shard_shape[2],
    )
}

/// Partition chunk indices into shards.
///
/// Each input index appears in exactly one group; groups are ordered by shard
/// id and keep the input order of their members.
pub fn group_into_shards(
    chunk_indices: impl IntoIterator<Item = ChunkIndex>,
    shard_shape: Shape3,
) -> Result<BTreeMap<ShardId, Vec<ChunkIndex>>, ConvertError> {
    validate_shard_shape(shard_shape)?;
    let mut shards: BTreeMap<ShardId, Vec<ChunkIndex>> = BTreeMap::new();
    for index in chunk_indices {
        shards
            .entry(shard_of(index, shard_shape))
            .or_default()
            .push(index);
    }
    Ok(shards)
}

/// Number of shards along each axis for a chunk grid.
pub fn shard_grid_shape(grid: &ChunkGrid, shard_shape: Shape3) -> Shape3 {
    let chunks = grid.grid_shape();
    [
        ceil_div(chunks[0], shard_shape[0]),
        ceil_div(chunks[1], shard_shape[1]),
        ceil_div(chunks[2], shard_shape[2]),
    ]
}

// =============================================================================
// Shard Tracker
// =============================================================================

struct TrackerState {
    remaining: HashMap<ShardId, usize>,
    recorded: HashSet<ChunkIndex>,
}

/// Tracks shard completion for one level.
///
/// Safe to share between workers; the internal lock only guards counters.
pub struct ShardTracker {
    level: usize,
    shard_shape: Shape3,
    state: Mutex<TrackerState>,
}

impl ShardTracker {
    /// Create a tracker for every chunk of `grid`.
    pub fn new(level: usize, grid: &ChunkGrid, shard_shape: Shape3) -> Result<Self, ConvertError> {
        let groups = group_into_shards(grid.indices(), shard_shape)?;
        let remaining = groups
            .into_iter()
            .map(|(id, members)| (id, members.len()))
            .collect();
        Ok(Self {
            level,
            shard_shape,
            state: Mutex::new(TrackerState {
                remaining,
                recorded: HashSet::new(),
            }),
        })
    }

    /// Level this tracker covers.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Shard shape in chunks.
    pub fn shard_shape(&self) -> Shape3 {
        self.shard_shape
    }

    /// Record that `index` is durably written (or already present).
    ///
    /// Returns the shard id when this was the last outstanding member.
    /// Recording the same chunk twice has no effect.
    pub fn record(&self, index: ChunkIndex) -> Option<ShardId> {
        let shard = shard_of(index, self.shard_shape);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.recorded.insert(index) {
            return None;
        }
        let remaining = state.remaining.get_mut(&shard)?;
        *remaining = remaining.saturating_sub(1);
        (*remaining == 0).then_some(shard)
    }

    /// Number of shards that still have unwritten members.
    pub fn pending_shards(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remaining.values().filter(|&&r| r > 0).count()
    }
}

// =============================================================================
// Tests
// =============================================================================
