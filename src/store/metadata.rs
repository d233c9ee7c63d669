//! Store and multiscale metadata documents.
//!
//! Three JSON documents describe a directory store:
//!
//! - `store.json` at the root: element type and shard shape
//! - `<level>/level.json`: shape and chunk edge of one level
//! - `multiscales.json` at the root: the multiscale manifest, one dataset per
//!   level with its scale relative to physical units

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::geometry::Shape3;
use crate::voxel::DataType;

/// Version of the multiscale manifest layout.
pub const MULTISCALES_VERSION: &str = "0.4";

/// Root document identifying a directory as a chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub dtype: DataType,
    pub shard_shape: Option<Shape3>,
}

/// Geometry of one stored level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelMetadata {
    pub level: usize,
    pub shape: Shape3,
    pub chunk_edge: usize,
    pub dtype: DataType,
    pub shard_shape: Option<Shape3>,
}

// =============================================================================
// Spatial Units
// =============================================================================

/// Physical unit of the spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lowercase")]
pub enum SpatialUnit {
    Angstrom,
    Attometer,
    Centimeter,
    Decimeter,
    Exameter,
    Femtometer,
    Foot,
    Gigameter,
    Hectometer,
    Inch,
    Kilometer,
    Megameter,
    Meter,
    Micrometer,
    Mile,
    Millimeter,
    Nanometer,
    Parsec,
    Petameter,
    Picometer,
    Terameter,
    Yard,
    Yoctometer,
    Yottameter,
    Zeptometer,
    Zettameter,
}

// =============================================================================
// Multiscale Manifest
// =============================================================================

/// One named axis of the arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub unit: SpatialUnit,
}

/// A coordinate transformation attached to a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateTransformation {
    #[serde(rename = "type")]
    pub kind: String,
    pub scale: [f64; 3],
}

/// One pyramid level in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub path: String,
    #[serde(rename = "coordinateTransformations")]
    pub coordinate_transformations: Vec<CoordinateTransformation>,
}

/// Free-form description of how the pyramid was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiscaleDescription {
    pub description: String,
}

/// A multiscale image: axes plus one dataset per level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Multiscale {
    pub version: String,
    pub name: String,
    pub axes: Vec<Axis>,
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: MultiscaleDescription,
    pub datasets: Vec<Dataset>,
}

impl Multiscale {
    /// Describe a pyramid of `n_levels` levels.
    ///
    /// Level `k` has voxels `factor^k` times larger than level 0 on every axis.
    pub fn new(
        name: impl Into<String>,
        unit: SpatialUnit,
        voxel_size: [f64; 3],
        factor: usize,
        n_levels: usize,
        reduction: &str,
    ) -> Self {
        let axes = ["x", "y", "z"]
            .iter()
            .map(|n| Axis {
                name: n.to_string(),
                kind: "space".to_string(),
                unit,
            })
            .collect();

        let datasets = (0..n_levels)
            .map(|level| {
                let multiplier = (factor as f64).powi(level as i32);
                Dataset {
                    path: level.to_string(),
                    coordinate_transformations: vec![CoordinateTransformation {
                        kind: "scale".to_string(),
                        scale: voxel_size.map(|v| v * multiplier),
                    }],
                }
            })
            .collect();

        Self {
            version: MULTISCALES_VERSION.to_string(),
            name: name.into(),
            axes,
            kind: reduction.to_string(),
            metadata: MultiscaleDescription {
                description: format!("Downscaled by {} using {} block reduction", factor, reduction),
            },
            datasets,
        }
    }
}

/// Root manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub multiscales: Vec<Multiscale>,
}
