//! Voxel element types and in-memory array blocks.
//!
//! A [`Block`] is a dense 3D array stored x-fastest: the element at `(x, y, z)`
//! lives at `(z * ny + y) * nx + x`. Slabs, chunks and downsample pre-images
//! are all blocks. A [`Slice`] is a single 2D plane as returned by a slice
//! reader.
//!
//! # Chunk encoding
//!
//! Blocks are serialized for storage as a small header followed by the raw
//! little-endian elements:
//!
//! ```text
//! ┌────────┬───────┬────────┬────────┬────────┬─────────────────────┐
//! │ "STCK" │ dtype │ nx u32 │ ny u32 │ nz u32 │ nx*ny*nz elements   │
//! └────────┴───────┴────────┴────────┴────────┴─────────────────────┘
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::geometry::Shape3;

/// Magic bytes at the start of every encoded chunk.
const CHUNK_MAGIC: &[u8; 4] = b"STCK";

/// Size of the encoded chunk header in bytes.
pub const CHUNK_HEADER_LEN: usize = 4 + 1 + 3 * 4;

// =============================================================================
// Data Types
// =============================================================================

/// Supported voxel element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    U32,
    I16,
    F32,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::F32 => 4,
        }
    }

    /// Lowercase name, as written to metadata.
    pub fn name(self) -> &'static str {
        match self {
            DataType::U8 => "u8",
            DataType::U16 => "u16",
            DataType::U32 => "u32",
            DataType::I16 => "i16",
            DataType::F32 => "f32",
        }
    }

    fn code(self) -> u8 {
        match self {
            DataType::U8 => 1,
            DataType::U16 => 2,
            DataType::U32 => 3,
            DataType::I16 => 4,
            DataType::F32 => 5,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A fixed-width numeric voxel element.
pub trait Voxel: Copy + Default + PartialOrd + fmt::Debug + Send + Sync + 'static {
    /// Runtime tag for this element type.
    const DATA_TYPE: DataType;

    /// Widen to f64 for reductions.
    fn to_f64(self) -> f64;

    /// Narrow from f64. Integer types truncate toward zero and saturate.
    fn from_f64(value: f64) -> Self;

    /// Append the little-endian encoding of this value.
    fn put_le(self, buf: &mut BytesMut);

    /// Consume one little-endian value from the front of `buf`.
    fn get_le(buf: &mut Bytes) -> Self;
}

macro_rules! impl_voxel {
    ($t:ty, $dtype:expr, $put:ident, $get:ident) => {
        impl Voxel for $t {
            const DATA_TYPE: DataType = $dtype;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }

            #[inline]
            fn put_le(self, buf: &mut BytesMut) {
                buf.$put(self);
            }

            #[inline]
            fn get_le(buf: &mut Bytes) -> Self {
                buf.$get()
            }
        }
    };
}

impl_voxel!(u8, DataType::U8, put_u8, get_u8);
impl_voxel!(u16, DataType::U16, put_u16_le, get_u16_le);
impl_voxel!(u32, DataType::U32, put_u32_le, get_u32_le);
impl_voxel!(i16, DataType::I16, put_i16_le, get_i16_le);
impl_voxel!(f32, DataType::F32, put_f32_le, get_f32_le);

// =============================================================================
// Slice
// =============================================================================

/// One `(X, Y)` plane of the input volume, stored row-major (x fastest).
#[derive(Debug, Clone, PartialEq)]
pub struct Slice<T> {
    shape: [usize; 2],
    data: Vec<T>,
}

impl<T: Voxel> Slice<T> {
    /// Wrap a row-major buffer. Returns `None` if the length does not match.
    pub fn from_vec(shape: [usize; 2], data: Vec<T>) -> Option<Self> {
        (data.len() == shape[0] * shape[1]).then_some(Self { shape, data })
    }

    /// `[width, height]` of the plane.
    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    /// Value at `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[y * self.shape[0] + x]
    }

    /// Raw row-major elements.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

// =============================================================================
// Block
// =============================================================================

/// A dense 3D array with an explicit extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Block<T> {
    shape: Shape3,
    data: Vec<T>,
}

impl<T: Voxel> Block<T> {
    /// Create a block filled with `T::default()`.
    pub fn zeros(shape: Shape3) -> Self {
        Self {
            shape,
            data: vec![T::default(); shape[0] * shape[1] * shape[2]],
        }
    }

    /// Wrap an x-fastest buffer. Returns `None` if the length does not match.
    pub fn from_vec(shape: Shape3, data: Vec<T>) -> Option<Self> {
        (data.len() == shape[0] * shape[1] * shape[2]).then_some(Self { shape, data })
    }

    /// Build a block by evaluating `f(x, y, z)` for every element.
    pub fn from_fn(shape: Shape3, mut f: impl FnMut(usize, usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(shape[0] * shape[1] * shape[2]);
        for z in 0..shape[2] {
            for y in 0..shape[1] {
                for x in 0..shape[0] {
                    data.push(f(x, y, z));
                }
            }
        }
        Self { shape, data }
    }

    /// Extent along each axis.
    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the block holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the element buffer in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len() * T::DATA_TYPE.size()
    }

    #[inline]
    fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.shape[1] + y) * self.shape[0] + x
    }

    /// Value at `(x, y, z)`.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> T {
        self.data[self.offset(x, y, z)]
    }

    /// Set the value at `(x, y, z)`.
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: T) {
        let i = self.offset(x, y, z);
        self.data[i] = value;
    }

    /// Raw x-fastest elements.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Copy a 2D slice into plane `z`.
    ///
    /// The slice must have the same `(x, y)` extent as the block.
    pub fn set_plane(&mut self, z: usize, slice: &Slice<T>) -> Result<(), StoreError> {
        if slice.shape() != [self.shape[0], self.shape[1]] {
            return Err(StoreError::ShapeMismatch {
                expected: [self.shape[0], self.shape[1], 1],
                actual: [slice.shape()[0], slice.shape()[1], 1],
            });
        }
        let plane = self.shape[0] * self.shape[1];
        self.data[z * plane..(z + 1) * plane].copy_from_slice(slice.as_slice());
        Ok(())
    }

    /// Copy out plane `z` as a slice.
    pub fn plane(&self, z: usize) -> Slice<T> {
        let plane = self.shape[0] * self.shape[1];
        Slice {
            shape: [self.shape[0], self.shape[1]],
            data: self.data[z * plane..(z + 1) * plane].to_vec(),
        }
    }

    /// Copy out the sub-block starting at `origin` with the given `extent`.
    ///
    /// # Panics
    /// Panics if the region exceeds the block.
    pub fn sub_block(&self, origin: Shape3, extent: Shape3) -> Block<T> {
        assert!(
            (0..3).all(|a| origin[a] + extent[a] <= self.shape[a]),
            "sub-block {origin:?}+{extent:?} exceeds {:?}",
            self.shape
        );
        let mut data = Vec::with_capacity(extent[0] * extent[1] * extent[2]);
        for z in origin[2]..origin[2] + extent[2] {
            for y in origin[1]..origin[1] + extent[1] {
                let start = self.offset(origin[0], y, z);
                data.extend_from_slice(&self.data[start..start + extent[0]]);
            }
        }
        Block {
            shape: extent,
            data,
        }
    }

    /// Copy `other` into this block with its `(0, 0, 0)` at `origin`.
    ///
    /// # Panics
    /// Panics if `other` does not fit.
    pub fn paste(&mut self, origin: Shape3, other: &Block<T>) {
        let extent = other.shape;
        assert!(
            (0..3).all(|a| origin[a] + extent[a] <= self.shape[a]),
            "paste {origin:?}+{extent:?} exceeds {:?}",
            self.shape
        );
        for z in 0..extent[2] {
            for y in 0..extent[1] {
                let src = other.offset(0, y, z);
                let dst = self.offset(origin[0], origin[1] + y, origin[2] + z);
                self.data[dst..dst + extent[0]].copy_from_slice(&other.data[src..src + extent[0]]);
            }
        }
    }

    /// Encode as header + little-endian elements.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + self.nbytes());
        buf.put_slice(CHUNK_MAGIC);
        buf.put_u8(T::DATA_TYPE.code());
        for dim in self.shape {
            buf.put_u32_le(dim as u32);
        }
        for &value in &self.data {
            value.put_le(&mut buf);
        }
        buf.freeze()
    }

    /// Decode bytes produced by [`Block::to_bytes`].
    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, StoreError> {
        if bytes.len() < CHUNK_HEADER_LEN || &bytes[..4] != CHUNK_MAGIC {
            return Err(StoreError::Corrupt("missing chunk header".to_string()));
        }
        bytes.advance(4);

        let code = bytes.get_u8();
        if code != T::DATA_TYPE.code() {
            return Err(StoreError::Corrupt(format!(
                "dtype code {} does not match {}",
                code,
                T::DATA_TYPE
            )));
        }

        let shape = [
            bytes.get_u32_le() as usize,
            bytes.get_u32_le() as usize,
            bytes.get_u32_le() as usize,
        ];
        let count = shape[0] * shape[1] * shape[2];
        if bytes.remaining() != count * T::DATA_TYPE.size() {
            return Err(StoreError::Corrupt(format!(
                "expected {} bytes of data for shape {:?}, found {}",
                count * T::DATA_TYPE.size(),
                shape,
                bytes.remaining()
            )));
        }

        let mut data = Vec::with_capacity(count);
        for _ in 0..count {
            data.push(T::get_le(&mut bytes));
        }
        Ok(Self { shape, data })
    }
}

// =============================================================================
// Tests
// =============================================================================
