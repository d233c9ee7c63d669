//! Collaborator interfaces and the image-stack slice reader.
//!
//! The pyramid engine only ever talks to its inputs and outputs through the
//! traits defined here:
//!
//! ```text
//!  ┌──────────────┐     ┌─────────────────────┐     ┌──────────────────┐
//!  │ SliceReader  │───▶ │   pyramid engine    │───▶ │   ChunkWriter    │
//!  │ (one slice   │     │ (writer, downsample,│     │ (level, index)   │
//!  │  per call)   │     │  coordinator)       │ ◀── │   ChunkReader    │
//!  └──────────────┘     └─────────────────────┘     └──────────────────┘
//! ```
//!
//! [`ImageStackReader`] implements [`SliceReader`] over image files and
//! [`VolumeReader`] over a volume already in memory; the stores
//! in [`crate::store`] implement the chunk traits.

mod image_stack;
mod traits;
mod volume;

pub use image_stack::{list_slice_files, read_image_header, ImageStackReader, ImageVoxel};
pub use traits::{ChunkReader, ChunkWriter, SliceReader};
pub use volume::VolumeReader;
