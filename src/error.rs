use std::fmt;

use thiserror::Error;

use crate::geometry::ChunkIndex;
use crate::pyramid::WorkUnit;

/// Errors reported by chunk stores and slice readers.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Filesystem or decoder I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Requested chunk, slice or level does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Data shape disagrees with the expected shape at this position
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        actual: [usize; 3],
    },

    /// Level has not been created in the store
    #[error("Unknown level: {0}")]
    UnknownLevel(usize),

    /// Chunk was already written (stores that enforce at-most-once writes)
    #[error("Chunk {index} at level {level} already written")]
    AlreadyWritten { level: usize, index: ChunkIndex },

    /// Stored bytes could not be decoded into a chunk
    #[error("Corrupt chunk data: {0}")]
    Corrupt(String),

    /// Image file could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Store or level metadata is missing or inconsistent
    #[error("Metadata error: {0}")]
    Metadata(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Io(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Metadata(err.to_string())
    }
}

/// Errors raised by the conversion engine.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// Bad shapes or chunk size, raised before any I/O
    #[error("Invalid geometry: {reason}")]
    InvalidGeometry { reason: String },

    /// A single worker would need more memory than the budget allows
    #[error(
        "Memory budget exceeded: one {stage} worker needs {required} bytes, budget is {budget} bytes"
    )]
    BudgetExceeded {
        stage: &'static str,
        required: u64,
        budget: u64,
    },

    /// The slice reader failed for slice `z`
    #[error("Failed to read slice z={z}: {source}")]
    SliceRead { z: usize, source: StoreError },

    /// The chunk writer failed
    #[error("Failed to write chunk {index} at level {level}: {source}")]
    ChunkWrite {
        level: usize,
        index: ChunkIndex,
        source: StoreError,
    },

    /// The chunk reader failed
    #[error("Failed to read chunk {index} at level {level}: {source}")]
    ChunkRead {
        level: usize,
        index: ChunkIndex,
        source: StoreError,
    },

    /// One or more units of a level failed after retries
    #[error("Level {level} incomplete: {failure}")]
    LevelIncomplete {
        level: usize,
        failure: PartialFailure,
    },

    /// The run was cancelled before the level finished
    #[error("Cancelled during level {level}: {pending} unit(s) not completed")]
    Cancelled { level: usize, pending: usize },

    /// Store-level failure outside a unit of work (e.g. creating a level)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Task graph is malformed or a node failed in the local scheduler
    #[error("Task graph error: {0}")]
    Graph(String),

    /// A worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl ConvertError {
    /// Create an `InvalidGeometry` error.
    pub fn geometry(reason: impl Into<String>) -> Self {
        ConvertError::InvalidGeometry {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same unit of work might succeed.
    ///
    /// Only collaborator-reported I/O failures are retryable. Shape mismatches
    /// and duplicate writes are deterministic and are escalated immediately.
    pub fn is_retryable(&self) -> bool {
        let source = match self {
            ConvertError::SliceRead { source, .. }
            | ConvertError::ChunkWrite { source, .. }
            | ConvertError::ChunkRead { source, .. } => source,
            _ => return false,
        };
        matches!(source, StoreError::Io(_) | StoreError::Decode(_))
    }
}

// =============================================================================
// Partial failure summary
// =============================================================================

/// A unit of work that failed after all retries.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    /// The failing slab or chunk
    pub unit: WorkUnit,

    /// Number of attempts made
    pub attempts: u32,

    /// Last error reported for this unit
    pub error: ConvertError,
}

/// Summary of a stage in which some units did not succeed.
///
/// Carries every failing and every unfinished unit so a re-run can target
/// exactly the missing work.
#[derive(Debug, Clone, Default)]
pub struct PartialFailure {
    /// Stage name (e.g. "level 0")
    pub stage: String,

    /// Number of units that succeeded
    pub succeeded: usize,

    /// Units that failed after retries
    pub failed: Vec<UnitFailure>,

    /// Units never admitted or interrupted because of cancellation
    pub cancelled: Vec<WorkUnit>,
}

impl PartialFailure {
    /// All failing units, in the order they were reported.
    pub fn failed_units(&self) -> Vec<WorkUnit> {
        self.failed.iter().map(|f| f.unit).collect()
    }

    /// Whether the summary records no failures and no cancellations.
    pub fn is_empty(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} succeeded, {} failed",
            self.stage,
            self.succeeded,
            self.failed.len()
        )?;
        if !self.cancelled.is_empty() {
            write!(f, ", {} cancelled", self.cancelled.len())?;
        }
        if !self.failed.is_empty() {
            let units: Vec<String> = self.failed.iter().map(|u| u.unit.to_string()).collect();
            write!(f, " [{}]", units.join(", "))?;
        }
        Ok(())
    }
}
