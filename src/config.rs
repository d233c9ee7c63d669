//! Command-line configuration for stack-to-chunk.
//!
//! Every option can also be set through an environment variable with the
//! `STC_` prefix:
//!
//! - `STC_INPUT` - Slice directory or `.txt` list of slice paths
//! - `STC_OUTPUT` - Output store directory
//! - `STC_CHUNK_SIZE` - Cubic chunk edge in voxels (default: 64)
//! - `STC_SHARD_SHAPE` - Shard shape in chunks, e.g. `4,4,4`
//! - `STC_MEMORY_BUDGET` - Memory budget, e.g. `4GB`, `512MiB` (default: 4GB)
//! - `STC_WORKERS` - Upper bound on concurrent workers
//! - `STC_FACTOR` - Downsampling factor per axis (default: 2)
//! - `STC_MAX_LEVELS` - Maximum number of downsampled levels
//! - `STC_REDUCTION` - `mean`, `max` or `min` (default: mean)
//! - `STC_RETRIES` - Retries per unit of work (default: 2)
//!
//! # Example
//!
//! ```text
//! stack-to-chunk plan --input slices/ --chunk-size 128 --memory-budget 8GB
//! stack-to-chunk convert --input slices/ --output brain.stc --shard-shape 4,4,4
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::geometry::Shape3;
use crate::pyramid::{ExecutionMode, LevelsSpec, Reduction, RunOptions};
use crate::store::SpatialUnit;
use crate::voxel::DataType;

// =============================================================================
// Default Values
// =============================================================================

/// Default chunk edge in voxels.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// Default downsampling factor.
pub const DEFAULT_DOWNSAMPLE_FACTOR: usize = 2;

/// Default memory budget.
pub const DEFAULT_MEMORY_BUDGET: &str = "4GB";

/// Default retries per unit of work.
pub const DEFAULT_RETRIES: u32 = 2;

/// Default multiscale group name.
pub const DEFAULT_GROUP_NAME: &str = "volume";

// =============================================================================
// Byte Sizes
// =============================================================================

/// Parse a human-readable byte size.
///
/// Accepts bare byte counts and `K`/`KB`/`KiB`, `M`/`MB`/`MiB`, `G`/`GB`/`GiB`,
/// `T`/`TB`/`TiB` suffixes (all powers of 1024), case-insensitive, with an
/// optional fractional part (`1.5GB`).
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    let multiplier: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        "T" | "TB" | "TIB" => 1 << 40,
        _ => return Err(format!("Invalid size '{}': unknown unit", s)),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| format!("Invalid size '{}': expected a number like '4GB'", s))?;
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 1.0 || bytes > u64::MAX as f64 {
        return Err(format!("Invalid size '{}': must be at least one byte", s));
    }
    Ok(bytes as u64)
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// stack-to-chunk - convert image stacks into chunked multiscale volumes.
#[derive(Parser, Debug)]
#[command(name = "stack-to-chunk")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert a slice stack into a chunked multiscale store.
    Convert(ConvertConfig),

    /// Print the level layout and memory estimates without converting.
    Plan(PlanConfig),
}

/// Input stack and chunking, shared by every command.
#[derive(Args, Debug, Clone)]
pub struct StackArgs {
    /// Directory of .tif/.tiff/.png slices, or a .txt file listing slice paths.
    #[arg(short, long, env = "STC_INPUT")]
    pub input: PathBuf,

    /// Edge length of the cubic output chunks, in voxels.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, env = "STC_CHUNK_SIZE")]
    pub chunk_size: usize,

    /// Element type of the output. Taken from the first slice if omitted;
    /// conversion fails if the slices are stored as another type.
    #[arg(long, value_enum, env = "STC_DTYPE")]
    pub dtype: Option<DataType>,
}

/// Pyramid and resource options, shared by every command.
#[derive(Args, Debug, Clone)]
pub struct PyramidArgs {
    /// Memory budget for one stage across all workers (e.g. 4GB, 512MiB).
    #[arg(long, default_value = DEFAULT_MEMORY_BUDGET, env = "STC_MEMORY_BUDGET")]
    pub memory_budget: String,

    /// Upper bound on concurrent workers, on top of the memory budget.
    #[arg(short, long, env = "STC_WORKERS")]
    pub workers: Option<usize>,

    /// Downsampling factor per axis between consecutive levels.
    #[arg(long, default_value_t = DEFAULT_DOWNSAMPLE_FACTOR, env = "STC_FACTOR")]
    pub factor: usize,

    /// Maximum number of downsampled levels. By default levels are added
    /// until one fits in a single chunk.
    #[arg(long, env = "STC_MAX_LEVELS")]
    pub max_levels: Option<usize>,
}

impl PyramidArgs {
    fn validate(&self) -> Result<(), String> {
        parse_byte_size(&self.memory_budget)?;
        if self.workers == Some(0) {
            return Err("workers must be greater than 0".to_string());
        }
        if self.factor < 2 {
            return Err("factor must be at least 2".to_string());
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConvertConfig {
    #[command(flatten)]
    pub stack: StackArgs,

    #[command(flatten)]
    pub pyramid: PyramidArgs,

    /// Output store directory. Must not exist unless --resume is given.
    #[arg(short, long, env = "STC_OUTPUT")]
    pub output: PathBuf,

    /// Continue an interrupted conversion, skipping chunks already written.
    #[arg(long, default_value_t = false)]
    pub resume: bool,

    /// Group chunks into shards of this many chunks per axis (e.g. 4,4,4).
    #[arg(long, env = "STC_SHARD_SHAPE", value_delimiter = ',')]
    pub shard_shape: Option<Vec<usize>>,

    /// Reduction applied when downsampling.
    #[arg(long, value_enum, default_value_t = Reduction::Mean, env = "STC_REDUCTION")]
    pub reduction: Reduction,

    /// Retries per slab or chunk after a transient I/O failure.
    #[arg(long, default_value_t = DEFAULT_RETRIES, env = "STC_RETRIES")]
    pub retries: u32,

    /// Execute stages directly, or build a task graph and run it locally.
    #[arg(long, value_enum, default_value_t = ExecutionMode::Eager)]
    pub mode: ExecutionMode,

    /// Name of the multiscale image.
    #[arg(long, default_value = DEFAULT_GROUP_NAME)]
    pub name: String,

    /// Physical voxel size along x,y,z at full resolution.
    #[arg(long, value_delimiter = ',', default_value = "1,1,1")]
    pub voxel_size: Vec<f64>,

    /// Unit of the voxel size.
    #[arg(long, value_enum, default_value_t = SpatialUnit::Micrometer)]
    pub unit: SpatialUnit,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ConvertConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.stack.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        self.pyramid.validate()?;

        if let Some(ref shard) = self.shard_shape {
            if shard.len() != 3 {
                return Err("shard_shape must have three values (x,y,z)".to_string());
            }
            if shard.contains(&0) {
                return Err("shard_shape values must be greater than 0".to_string());
            }
        }

        if self.voxel_size.len() != 3 {
            return Err("voxel_size must have three values (x,y,z)".to_string());
        }
        if self.voxel_size.iter().any(|&v| !(v > 0.0 && v.is_finite())) {
            return Err("voxel_size values must be positive".to_string());
        }

        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        Ok(())
    }

    /// Shard shape as an array. Call `validate()` first.
    pub fn shard_shape(&self) -> Option<Shape3> {
        self.shard_shape
            .as_ref()
            .filter(|s| s.len() == 3)
            .map(|s| [s[0], s[1], s[2]])
    }

    /// Voxel size as an array. Call `validate()` first.
    pub fn voxel_size(&self) -> [f64; 3] {
        match self.voxel_size.as_slice() {
            [x, y, z] => [*x, *y, *z],
            _ => [1.0; 3],
        }
    }

    pub fn levels_spec(&self) -> LevelsSpec {
        LevelsSpec {
            factor: self.pyramid.factor,
            max_levels: self.pyramid.max_levels,
            reduction: self.reduction,
        }
    }

    pub fn run_options(&self) -> Result<RunOptions, String> {
        Ok(RunOptions {
            memory_budget: parse_byte_size(&self.pyramid.memory_budget)?,
            max_workers: self.pyramid.workers,
            retries: self.retries,
            shard_shape: self.shard_shape(),
        })
    }
}

/// Output format for the plan command.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanOutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug, Clone)]
pub struct PlanConfig {
    #[command(flatten)]
    pub stack: StackArgs,

    #[command(flatten)]
    pub pyramid: PyramidArgs,

    /// Output format.
    #[arg(long, value_enum, default_value_t = PlanOutputFormat::Text)]
    pub format: PlanOutputFormat,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl PlanConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.stack.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        self.pyramid.validate()
    }

    /// Memory budget in bytes. Call `validate()` first.
    pub fn memory_budget(&self) -> Result<u64, String> {
        parse_byte_size(&self.pyramid.memory_budget)
    }
}

// =============================================================================
// Tests
// =============================================================================
