//! Bounded worker pool for independent units of work.
//!
//! Units are spawned onto a [`JoinSet`] only once a semaphore permit is
//! available, so at most `workers` units are alive at a time and queued work
//! costs nothing but its [`WorkUnit`] key.
//!
//! Cancellation stops admission. Units already running are allowed to finish
//! their current chunk and are expected to observe the token themselves.
//! Nothing is aborted, so no chunk write is ever interrupted half way.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConvertError, PartialFailure, UnitFailure};
use crate::geometry::ChunkIndex;

/// An independently schedulable piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkUnit {
    /// Full-resolution slab, by slab index
    Slab(usize),

    /// One output chunk of a downsampled level
    Chunk { level: usize, index: ChunkIndex },
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnit::Slab(i) => write!(f, "slab {}", i),
            WorkUnit::Chunk { level, index } => write!(f, "chunk {} at level {}", index, level),
        }
    }
}

/// Chunks touched by one unit.
///
/// A retried unit reports only its final attempt. Chunks a failed earlier
/// attempt managed to write are found in the store and counted as skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitStats {
    /// Chunks written by this unit
    pub written: usize,

    /// Chunks already present and left alone
    pub skipped: usize,
}

impl UnitStats {
    pub fn merge(&mut self, other: UnitStats) {
        self.written += other.written;
        self.skipped += other.skipped;
    }
}

/// Outcome of running one stage.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    /// Stage name, used in logs and failure summaries
    pub stage: String,

    /// Units that completed
    pub succeeded: usize,

    /// Chunks written by the successful attempt of each unit
    pub chunks_written: usize,

    /// Chunks found already written and skipped, including those left by a
    /// failed attempt of the same unit
    pub chunks_skipped: usize,

    /// Units that failed after all retries
    pub failures: Vec<UnitFailure>,

    /// Units not admitted or stopped because of cancellation
    pub cancelled: Vec<WorkUnit>,
}

impl StageReport {
    /// Whether every unit succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.cancelled.is_empty()
    }

    /// Summary of what did not succeed.
    pub fn partial_failure(&self) -> PartialFailure {
        PartialFailure {
            stage: self.stage.clone(),
            succeeded: self.succeeded,
            failed: self.failures.clone(),
            cancelled: self.cancelled.clone(),
        }
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Runs units with bounded concurrency, retries and cooperative cancellation.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    retries: u32,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool admitting at most `workers` units at once (minimum 1).
    pub fn new(workers: usize, retries: u32, cancel: CancellationToken) -> Self {
        Self {
            workers: workers.max(1),
            retries,
            cancel,
        }
    }

    /// Maximum concurrent units.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Retries allowed per unit after the first attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Token observed by the pool and its units.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run every unit to completion, failure or cancellation.
    ///
    /// Failures of one unit never stop its siblings; they are collected in the
    /// returned report.
    pub async fn run<F, Fut>(&self, stage: &str, units: Vec<WorkUnit>, work: F) -> StageReport
    where
        F: Fn(WorkUnit) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UnitStats, ConvertError>> + Send + 'static,
    {
        let work = Arc::new(work);
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut pending: VecDeque<WorkUnit> = units.into();
        let mut tasks: JoinSet<(WorkUnit, u32, Result<UnitStats, ConvertError>)> = JoinSet::new();
        let mut report = StageReport {
            stage: stage.to_string(),
            ..Default::default()
        };

        debug!(
            stage,
            units = pending.len(),
            workers = self.workers,
            "Starting stage"
        );

        loop {
            if pending.is_empty() && tasks.is_empty() {
                break;
            }

            if !pending.is_empty() && !self.cancel.is_cancelled() {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => {
                        debug!(stage, pending = pending.len(), "Stage cancelled, draining workers");
                    }

                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        record_result(&mut report, joined);
                    }

                    permit = Arc::clone(&permits).acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let Some(unit) = pending.pop_front() else { continue };
                        let work = Arc::clone(&work);
                        let cancel = self.cancel.clone();
                        let retries = self.retries;
                        tasks.spawn(async move {
                            let _permit = permit;
                            let handle = tokio::spawn(async move {
                                run_with_retries(unit, retries, &cancel, |u| work(u)).await
                            });
                            match handle.await {
                                Ok((attempts, result)) => (unit, attempts, result),
                                Err(e) => (unit, 1, Err(ConvertError::Worker(e.to_string()))),
                            }
                        });
                    }
                }
            } else {
                match tasks.join_next().await {
                    Some(joined) => record_result(&mut report, joined),
                    None => break,
                }
            }
        }

        report.cancelled.extend(pending);
        report
    }
}

fn record_result(
    report: &mut StageReport,
    joined: Result<(WorkUnit, u32, Result<UnitStats, ConvertError>), tokio::task::JoinError>,
) {
    match joined {
        Ok((_, _, Ok(stats))) => {
            report.succeeded += 1;
            report.chunks_written += stats.written;
            report.chunks_skipped += stats.skipped;
        }
        Ok((unit, _, Err(ConvertError::Cancelled { .. }))) => {
            report.cancelled.push(unit);
        }
        Ok((unit, attempts, Err(error))) => {
            warn!(stage = %report.stage, unit = %unit, attempts, error = %error, "Unit failed");
            report.failures.push(UnitFailure {
                unit,
                attempts,
                error,
            });
        }
        // The inner spawn already turns panics into errors; the outer task
        // only fails if the runtime is shutting down.
        Err(e) => {
            warn!(stage = %report.stage, error = %e, "Worker task lost");
        }
    }
}

/// Run `work` for `unit`, retrying retryable errors up to `retries` times.
///
/// Returns the number of attempts made with the final result, so on success
/// the stats are those of the last attempt only. No retry is started once the
/// token is cancelled.
pub async fn run_with_retries<F, Fut>(
    unit: WorkUnit,
    retries: u32,
    cancel: &CancellationToken,
    work: F,
) -> (u32, Result<UnitStats, ConvertError>)
where
    F: Fn(WorkUnit) -> Fut,
    Fut: Future<Output = Result<UnitStats, ConvertError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match work(unit).await {
            Ok(stats) => return (attempt, Ok(stats)),
            Err(e) if e.is_retryable() && attempt <= retries && !cancel.is_cancelled() => {
                warn!(unit = %unit, attempt, error = %e, "Retrying unit");
            }
            Err(e) => return (attempt, Err(e)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
