//! Slice reader over a stack of image files.
//!
//! The stack is either a directory of `.tif`/`.tiff`/`.png` files (one slice per
//! file, ordered by file name) or a `.txt` file listing one slice path per line.
//! Slice shape and element type are taken from the first file.
//!
//! Decoding is CPU-bound and runs on tokio's blocking pool, so concurrent
//! `read_slice` calls from different workers do not stall the runtime.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use image::{ColorType, DynamicImage, ImageDecoder, ImageReader};
use tracing::debug;

use crate::error::StoreError;
use crate::voxel::{DataType, Slice, Voxel};

use super::traits::SliceReader;

/// File extensions accepted when scanning a directory.
const SLICE_EXTENSIONS: &[&str] = &["tif", "tiff", "png"];

/// Voxel types that can be read from single-channel images.
///
/// Only the matching grey image variant is accepted, so decoding a slice never
/// holds more than one slice of `Self`.
pub trait ImageVoxel: Voxel {
    /// Take the pixels of `image`, row-major, if it is stored as `Self`.
    fn from_image(image: DynamicImage) -> Option<Vec<Self>>;
}

impl ImageVoxel for u8 {
    fn from_image(image: DynamicImage) -> Option<Vec<Self>> {
        match image {
            DynamicImage::ImageLuma8(buffer) => Some(buffer.into_raw()),
            _ => None,
        }
    }
}

impl ImageVoxel for u16 {
    fn from_image(image: DynamicImage) -> Option<Vec<Self>> {
        match image {
            DynamicImage::ImageLuma16(buffer) => Some(buffer.into_raw()),
            _ => None,
        }
    }
}

/// Element type of a single-channel image, `None` for colour or alpha images.
fn slice_dtype(color: ColorType) -> Option<DataType> {
    match color {
        ColorType::L8 => Some(DataType::U8),
        ColorType::L16 => Some(DataType::U16),
        _ => None,
    }
}

fn unsupported(path: &Path, color: ColorType) -> StoreError {
    StoreError::Decode(format!(
        "{}: {:?} images are not supported, slices must be 8 or 16 bit greyscale",
        path.display(),
        color
    ))
}

fn is_slice_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SLICE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// List slice files for a stack path.
pub fn list_slice_files(path: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let files = if path.extension().and_then(|e| e.to_str()) == Some("txt") {
        std::fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect()
    } else {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.is_file() && is_slice_file(&entry_path) {
                files.push(entry_path);
            }
        }
        files.sort();
        files
    };

    if files.is_empty() {
        return Err(StoreError::NotFound(format!(
            "no slice images found in {}",
            path.display()
        )));
    }
    Ok(files)
}

/// Shape `[width, height]` and element type of an image file, read from its header.
///
/// Fails for anything but single-channel 8 or 16 bit images.
pub fn read_image_header(path: &Path) -> Result<([usize; 2], DataType), StoreError> {
    let decoder = ImageReader::open(path)?
        .with_guessed_format()?
        .into_decoder()
        .map_err(|e| StoreError::Decode(format!("{}: {}", path.display(), e)))?;
    let (width, height) = decoder.dimensions();
    let color = decoder.color_type();
    let dtype = slice_dtype(color).ok_or_else(|| unsupported(path, color))?;
    Ok(([width as usize, height as usize], dtype))
}

// =============================================================================
// Image Stack Reader
// =============================================================================

/// Reads one image file per slice.
pub struct ImageStackReader<T> {
    files: Arc<Vec<PathBuf>>,
    slice_shape: [usize; 2],
    _voxel: PhantomData<fn() -> T>,
}

impl<T: ImageVoxel> ImageStackReader<T> {
    /// Open a directory of slices or a `.txt` list of slice paths.
    ///
    /// The first slice must already be stored as `T`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let files = list_slice_files(path.as_ref())?;
        let (slice_shape, dtype) = read_image_header(&files[0])?;
        if dtype != T::DATA_TYPE {
            return Err(StoreError::Decode(format!(
                "{}: slices are {}, cannot read them as {}",
                files[0].display(),
                dtype,
                T::DATA_TYPE
            )));
        }
        debug!(
            slices = files.len(),
            width = slice_shape[0],
            height = slice_shape[1],
            dtype = %dtype,
            "Opened image stack"
        );
        Ok(Self {
            files: Arc::new(files),
            slice_shape,
            _voxel: PhantomData,
        })
    }

    /// Slice file paths in Z order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

fn decode_slice<T: ImageVoxel>(path: &Path, expected: [usize; 2]) -> Result<Slice<T>, StoreError> {
    let image = ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| StoreError::Decode(format!("{}: {}", path.display(), e)))?;
    let shape = [image.width() as usize, image.height() as usize];
    if shape != expected {
        return Err(StoreError::ShapeMismatch {
            expected: [expected[0], expected[1], 1],
            actual: [shape[0], shape[1], 1],
        });
    }
    let color = image.color();
    let pixels = T::from_image(image).ok_or_else(|| unsupported(path, color))?;
    Slice::from_vec(shape, pixels)
        .ok_or_else(|| StoreError::Decode(format!("{}: unexpected pixel count", path.display())))
}

#[async_trait]
impl<T: ImageVoxel> SliceReader<T> for ImageStackReader<T> {
    fn slice_shape(&self) -> [usize; 2] {
        self.slice_shape
    }

    fn depth(&self) -> usize {
        self.files.len()
    }

    async fn read_slice(&self, z: usize) -> Result<Slice<T>, StoreError> {
        let path = self
            .files
            .get(z)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("slice {} of {}", z, self.files.len())))?;
        let expected = self.slice_shape;

        tokio::task::spawn_blocking(move || decode_slice::<T>(&path, expected))
            .await
            .map_err(|e| StoreError::Io(format!("decode task failed: {}", e)))?
    }
}

// =============================================================================
// Tests
// =============================================================================
