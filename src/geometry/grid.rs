//! Chunk grids over a level shape.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;

/// A 3D extent or coordinate, ordered `(x, y, z)`.
pub type Shape3 = [usize; 3];

/// Integer ceiling division.
#[inline]
pub fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}

// =============================================================================
// Chunk Index
// =============================================================================

/// Position of a chunk in its level's chunk grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ChunkIndex {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl ChunkIndex {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Components as an array.
    pub fn to_array(self) -> Shape3 {
        [self.x, self.y, self.z]
    }

    /// Build from an `(x, y, z)` array.
    pub fn from_array(a: Shape3) -> Self {
        Self::new(a[0], a[1], a[2])
    }
}

impl fmt::Display for ChunkIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A box in voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First voxel covered
    pub origin: Shape3,

    /// Number of voxels covered along each axis
    pub extent: Shape3,
}

impl Region {
    /// Number of voxels in the region.
    pub fn volume(&self) -> usize {
        self.extent.iter().product()
    }

    /// Whether two regions share at least one voxel.
    pub fn overlaps(&self, other: &Region) -> bool {
        (0..3).all(|a| {
            self.origin[a] < other.origin[a] + other.extent[a]
                && other.origin[a] < self.origin[a] + self.extent[a]
        })
    }
}

// =============================================================================
// Chunk Grid
// =============================================================================

/// Regular cubic chunk grid covering one level.
///
/// Edge chunks are clipped to the level shape; they are never padded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrid {
    shape: Shape3,
    chunk_edge: usize,
}

impl ChunkGrid {
    /// Create a grid, rejecting empty shapes and a zero chunk edge.
    pub fn new(shape: Shape3, chunk_edge: usize) -> Result<Self, ConvertError> {
        if chunk_edge == 0 {
            return Err(ConvertError::geometry("chunk edge must be > 0"));
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(ConvertError::geometry(format!(
                "all dimensions must be >= 1, got {:?}",
                shape
            )));
        }
        Ok(Self { shape, chunk_edge })
    }

    /// Shape of the level in voxels.
    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    /// Nominal chunk edge length.
    pub fn chunk_edge(&self) -> usize {
        self.chunk_edge
    }

    /// Number of chunks along each axis.
    pub fn grid_shape(&self) -> Shape3 {
        self.shape.map(|d| ceil_div(d, self.chunk_edge))
    }

    /// Total number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.grid_shape().iter().product()
    }

    /// Whether `index` lies inside the grid.
    pub fn contains(&self, index: ChunkIndex) -> bool {
        let grid = self.grid_shape();
        index.x < grid[0] && index.y < grid[1] && index.z < grid[2]
    }

    /// Voxel region of a chunk, clipped to the level shape.
    ///
    /// Returns `None` if the index lies outside the grid.
    pub fn chunk_region(&self, index: ChunkIndex) -> Option<Region> {
        if !self.contains(index) {
            return None;
        }
        let origin = index.to_array().map(|i| i * self.chunk_edge);
        let mut extent = [0; 3];
        for a in 0..3 {
            extent[a] = self.chunk_edge.min(self.shape[a] - origin[a]);
        }
        Some(Region { origin, extent })
    }

    /// True extent of a chunk (`min(edge, dim - i * edge)` per axis).
    pub fn chunk_extent(&self, index: ChunkIndex) -> Option<Shape3> {
        self.chunk_region(index).map(|r| r.extent)
    }

    /// All chunk indices, z-major then y then x.
    pub fn indices(&self) -> impl Iterator<Item = ChunkIndex> {
        let [gx, gy, gz] = self.grid_shape();
        (0..gz).flat_map(move |z| {
            (0..gy).flat_map(move |y| (0..gx).map(move |x| ChunkIndex::new(x, y, z)))
        })
    }
}

// =============================================================================
// Level Shapes
// =============================================================================

/// Shape of the next-coarser level: `ceil(shape / factor)` per axis.
pub fn downsampled_shape(shape: Shape3, factor: usize) -> Shape3 {
    shape.map(|d| ceil_div(d, factor))
}

/// Shapes of every pyramid level, starting with level 0.
///
/// Stops once a level fits in a single chunk (`max(shape) <= chunk_edge`) or
/// once `max_levels` downsampled levels have been produced.
pub fn pyramid_shapes(
    level0: Shape3,
    chunk_edge: usize,
    factor: usize,
    max_levels: Option<usize>,
) -> Result<Vec<Shape3>, ConvertError> {
    ChunkGrid::new(level0, chunk_edge)?;
    if factor < 2 {
        return Err(ConvertError::geometry(format!(
            "downsample factor must be >= 2, got {}",
            factor
        )));
    }

    let mut shapes = vec![level0];
    loop {
        let current = shapes[shapes.len() - 1];
        let downsampled = shapes.len() - 1;
        if max_levels.is_some_and(|max| downsampled >= max) {
            break;
        }
        if current.iter().all(|&d| d <= chunk_edge) {
            break;
        }
        shapes.push(downsampled_shape(current, factor));
    }
    Ok(shapes)
}

// =============================================================================
// Tests
// =============================================================================
