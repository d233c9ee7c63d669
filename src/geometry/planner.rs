//! Slab partition of the input volume.
//!
//! A slab is `chunk_edge` consecutive slices. Slab `i` covers
//! `z in [i * chunk_edge, min((i + 1) * chunk_edge, Z))` and produces exactly
//! the Z-layer `iz = i` of level-0 chunks, so no two slabs ever write the same
//! chunk.

use crate::error::ConvertError;

use super::grid::{ChunkGrid, ChunkIndex, Region, Shape3};

/// One slab of consecutive slices and the level-0 chunks it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slab {
    /// Slab index, equal to the Z index of its chunks
    pub index: usize,

    /// First slice of the slab
    pub z_start: usize,

    /// Number of slices in the slab (`chunk_edge`, or fewer for the last slab)
    pub z_count: usize,

    /// Level-0 chunks covered by the slab, all with `z == index`
    pub chunks: Vec<ChunkIndex>,
}

impl Slab {
    /// Slice indices read by this slab.
    pub fn z_range(&self) -> std::ops::Range<usize> {
        self.z_start..self.z_start + self.z_count
    }
}

/// Complete slab partition of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabPlan {
    grid: ChunkGrid,
    slabs: Vec<Slab>,
}

impl SlabPlan {
    /// Volume shape `(X, Y, Z)`.
    pub fn volume_shape(&self) -> Shape3 {
        self.grid.shape()
    }

    /// Shape of one input slice `(X, Y)`.
    pub fn slice_shape(&self) -> [usize; 2] {
        let [x, y, _] = self.grid.shape();
        [x, y]
    }

    /// Output chunk edge length.
    pub fn chunk_edge(&self) -> usize {
        self.grid.chunk_edge()
    }

    /// Level-0 chunk grid.
    pub fn grid(&self) -> &ChunkGrid {
        &self.grid
    }

    /// Slabs in Z order.
    pub fn slabs(&self) -> &[Slab] {
        &self.slabs
    }

    /// Number of slabs.
    pub fn len(&self) -> usize {
        self.slabs.len()
    }

    /// Whether the plan has no slabs (never true for a valid plan).
    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty()
    }

    /// Voxel region of a level-0 chunk.
    pub fn chunk_region(&self, index: ChunkIndex) -> Option<Region> {
        self.grid.chunk_region(index)
    }

    /// Every level-0 chunk, slab by slab.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkIndex> + '_ {
        self.slabs.iter().flat_map(|s| s.chunks.iter().copied())
    }
}

/// Partition a volume into slabs of `chunk_edge` slices.
///
/// # Errors
///
/// Returns `InvalidGeometry` if any dimension is zero, `chunk_edge` is zero,
/// or `slice_shape` differs from the first two volume dimensions.
pub fn plan(
    volume_shape: Shape3,
    slice_shape: [usize; 2],
    chunk_edge: usize,
) -> Result<SlabPlan, ConvertError> {
    if slice_shape != [volume_shape[0], volume_shape[1]] {
        return Err(ConvertError::geometry(format!(
            "slice shape {:?} does not match volume shape {:?}",
            slice_shape, volume_shape
        )));
    }
    let grid = ChunkGrid::new(volume_shape, chunk_edge)?;
    let [gx, gy, gz] = grid.grid_shape();
    let depth = volume_shape[2];

    let slabs = (0..gz)
        .map(|iz| {
            let z_start = iz * chunk_edge;
            let z_count = chunk_edge.min(depth - z_start);
            let chunks = (0..gy)
                .flat_map(|iy| (0..gx).map(move |ix| ChunkIndex::new(ix, iy, iz)))
                .collect();
            Slab {
                index: iz,
                z_start,
                z_count,
                chunks,
            }
        })
        .collect();

    Ok(SlabPlan { grid, slabs })
}

// =============================================================================
// Tests
// =============================================================================
