//! Per-worker memory estimates.
//!
//! Both estimates are upper bounds on the buffers a single worker allocates,
//! not heuristics. The coordinator divides the caller's budget by them to cap
//! concurrency:
//!
//! ```text
//! max_workers = max(1, floor(memory_budget / per_worker_estimate))
//! ```
//!
//! # Slab worker
//!
//! A slab worker holds the `(X, Y, C)` slab buffer, one decoded slice while it
//! is copied in, and then one chunk sub-block plus its encoded bytes while the
//! chunk is handed to the writer. Image slices are decoded straight into the
//! output type, so a decoded slice is never larger than `X * Y` voxels.
//!
//! # Downsample worker
//!
//! A downsample worker assembles the `f^3` finer chunks of the pre-image, one
//! source chunk in flight (raw bytes and decoded), and finally one coarser
//! output chunk plus its encoded bytes.

use serde::Serialize;

use crate::error::ConvertError;
use crate::voxel::CHUNK_HEADER_LEN;

/// Estimate for one full-resolution slab worker, in bytes.
pub fn slab_process_memory(slice_shape: [usize; 2], chunk_edge: usize, dtype_size: usize) -> u64 {
    let slice = (slice_shape[0] * slice_shape[1]) as u64;
    let chunk = (chunk_edge as u64).pow(3);
    let dtype = dtype_size as u64;

    let slab_buffer = slice * chunk_edge as u64 * dtype;
    let read_buffer = slice * dtype;
    let chunk_copy = chunk * dtype;
    let encoded_chunk = chunk * dtype + CHUNK_HEADER_LEN as u64;

    slab_buffer + read_buffer + chunk_copy + encoded_chunk
}

/// Estimate for one downsample worker, in bytes.
pub fn downsample_process_memory(chunk_edge: usize, downsample_factor: usize, dtype_size: usize) -> u64 {
    let chunk = (chunk_edge as u64).pow(3) * dtype_size as u64;
    let footprint = (downsample_factor as u64).pow(3);
    let header = CHUNK_HEADER_LEN as u64;

    let pre_image = footprint * chunk;
    let source_in_flight = 2 * chunk + header;
    let output = 2 * chunk + header;

    pre_image + source_in_flight + output
}

/// Number of workers that fit in `memory_budget`.
///
/// # Errors
///
/// Returns `BudgetExceeded` if a single worker needs more than the budget.
pub fn max_workers(
    stage: &'static str,
    memory_budget: u64,
    per_worker: u64,
) -> Result<usize, ConvertError> {
    if per_worker > memory_budget {
        return Err(ConvertError::BudgetExceeded {
            stage,
            required: per_worker,
            budget: memory_budget,
        });
    }
    let workers = memory_budget / per_worker.max(1);
    Ok(usize::try_from(workers).unwrap_or(usize::MAX).max(1))
}

// =============================================================================
// Memory Estimate Report
// =============================================================================

/// Both estimates and the worker counts they allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryEstimate {
    /// Bytes per full-resolution slab worker
    pub slab_bytes: u64,

    /// Bytes per downsample worker
    pub downsample_bytes: u64,

    /// Workers admitted during level 0
    pub level0_workers: usize,

    /// Workers admitted during each downsample level
    pub downsample_workers: usize,
}

impl MemoryEstimate {
    /// Compute both estimates and check them against `memory_budget`.
    ///
    /// `worker_cap` further limits the worker counts when set.
    pub fn compute(
        slice_shape: [usize; 2],
        chunk_edge: usize,
        downsample_factor: usize,
        dtype_size: usize,
        memory_budget: u64,
        worker_cap: Option<usize>,
    ) -> Result<Self, ConvertError> {
        let slab_bytes = slab_process_memory(slice_shape, chunk_edge, dtype_size);
        let downsample_bytes = downsample_process_memory(chunk_edge, downsample_factor, dtype_size);
        let cap = worker_cap.unwrap_or(usize::MAX).max(1);

        Ok(Self {
            slab_bytes,
            downsample_bytes,
            level0_workers: max_workers("slab", memory_budget, slab_bytes)?.min(cap),
            downsample_workers: max_workers("downsample", memory_budget, downsample_bytes)?
                .min(cap),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
