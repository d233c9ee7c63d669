//! Sequencing of the whole conversion.
//!
//! # State machine
//!
//! ```text
//! Planned ─▶ Level0Writing ─▶ Level0Done ─▶ Downsampling(1) ─▶ LevelDone(1) ─▶ ... ─▶ PyramidComplete
//!    │             │                              │
//!    └─────────────┴──────────────────────────────┴──▶ Failed | Cancelled
//! ```
//!
//! The memory budget is checked for both stages before the store is touched.
//! Level `k + 1` starts only after every unit of level `k` succeeded; a level
//! with failures or cancelled units ends the run.
//!
//! In lazy mode the same stages become a [`TaskGraph`] that is returned without
//! running anything. The state machine is only driven by eager runs.

use std::sync::Arc;

use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConvertError;
use crate::geometry::{pyramid_shapes, validate_shard_shape, ChunkGrid, Shape3, ShardTracker, SlabPlan};
use crate::io::{ChunkReader, ChunkWriter, SliceReader};
use crate::memory::MemoryEstimate;
use crate::voxel::Voxel;

use super::downsample::{downsample_level, DownsampleJob, LevelSource, Reducer, Reduction};
use super::graph::{ResourceSpec, TaskGraph, TaskKey};
use super::pool::{run_with_retries, StageReport, UnitStats, WorkUnit, WorkerPool};
use super::writer::{write_level0, Level0Job};

/// Default memory budget when none is configured (4GB).
pub const DEFAULT_MEMORY_BUDGET_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// How [`Coordinator::run`] executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExecutionMode {
    /// Run every stage now
    #[default]
    Eager,

    /// Return a task graph without running it
    Lazy,
}

/// Progress of an eager run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidState {
    Planned,
    Level0Writing,
    Level0Done,
    /// Producing the given level from the one below it
    Downsampling(usize),
    LevelDone(usize),
    PyramidComplete,
    Failed,
    Cancelled,
}

impl PyramidState {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PyramidState::PyramidComplete | PyramidState::Failed | PyramidState::Cancelled
        )
    }
}

/// Which levels to build and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelsSpec {
    /// Integer downsampling factor per axis, at least 2
    pub factor: usize,

    /// Maximum number of downsampled levels; `None` stops at a single chunk
    pub max_levels: Option<usize>,

    /// Built-in reduction, unless a custom reducer is supplied
    pub reduction: Reduction,
}

impl Default for LevelsSpec {
    fn default() -> Self {
        Self {
            factor: 2,
            max_levels: None,
            reduction: Reduction::Mean,
        }
    }
}

/// Resource limits and layout options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Byte ceiling shared by all workers of a stage
    pub memory_budget: u64,

    /// Optional extra cap on concurrent workers
    pub max_workers: Option<usize>,

    /// Retries per unit after the first attempt
    pub retries: u32,

    /// Shard shape in chunks; `None` disables shard tracking
    pub shard_shape: Option<Shape3>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET_BYTES,
            max_workers: None,
            retries: 2,
            shard_shape: None,
        }
    }
}

/// Chunks written for one level.
///
/// Counts follow [`StageReport`]: a chunk written by a failed attempt of a
/// unit that later succeeded shows up as skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelReport {
    pub level: usize,
    pub shape: Shape3,
    pub chunks_written: usize,
    pub chunks_skipped: usize,
}

/// Summary of a completed eager run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PyramidReport {
    pub estimate: MemoryEstimate,
    pub levels: Vec<LevelReport>,
}

impl PyramidReport {
    pub fn chunks_written(&self) -> usize {
        self.levels.iter().map(|l| l.chunks_written).sum()
    }
}

/// Result of [`Coordinator::run`].
#[derive(Debug)]
pub enum RunOutput {
    Complete(PyramidReport),
    Graph(TaskGraph),
}

impl RunOutput {
    pub fn into_report(self) -> Option<PyramidReport> {
        match self {
            RunOutput::Complete(report) => Some(report),
            RunOutput::Graph(_) => None,
        }
    }

    pub fn into_graph(self) -> Option<TaskGraph> {
        match self {
            RunOutput::Graph(graph) => Some(graph),
            RunOutput::Complete(_) => None,
        }
    }
}

/// Everything derived from shapes before any I/O.
struct Prepared {
    shapes: Vec<Shape3>,
    estimate: MemoryEstimate,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives a conversion from slices to a complete pyramid.
pub struct Coordinator<T: Voxel, S> {
    plan: Arc<SlabPlan>,
    reader: Arc<dyn SliceReader<T>>,
    store: Arc<S>,
    levels: LevelsSpec,
    options: RunOptions,
    reducer: Arc<dyn Reducer<T>>,
    cancel: CancellationToken,
    state: watch::Sender<PyramidState>,
}

impl<T, S> Coordinator<T, S>
where
    T: Voxel,
    S: ChunkWriter<T> + ChunkReader<T> + 'static,
{
    pub fn new(
        plan: SlabPlan,
        reader: Arc<dyn SliceReader<T>>,
        store: Arc<S>,
        levels: LevelsSpec,
    ) -> Self {
        let (state, _) = watch::channel(PyramidState::Planned);
        Self {
            plan: Arc::new(plan),
            reader,
            store,
            reducer: Arc::new(levels.reduction),
            levels,
            options: RunOptions::default(),
            cancel: CancellationToken::new(),
            state,
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the built-in reduction with a caller-supplied one.
    pub fn with_reducer(mut self, reducer: Arc<dyn Reducer<T>>) -> Self {
        self.reducer = reducer;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn plan(&self) -> &SlabPlan {
        &self.plan
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn reducer(&self) -> &Arc<dyn Reducer<T>> {
        &self.reducer
    }

    /// Shapes of every level that will be produced.
    pub fn level_shapes(&self) -> Result<Vec<Shape3>, ConvertError> {
        pyramid_shapes(
            self.plan.volume_shape(),
            self.plan.chunk_edge(),
            self.levels.factor,
            self.levels.max_levels,
        )
    }

    /// Per-worker estimates and worker counts under the configured budget.
    pub fn estimate(&self) -> Result<MemoryEstimate, ConvertError> {
        MemoryEstimate::compute(
            self.plan.slice_shape(),
            self.plan.chunk_edge(),
            self.levels.factor,
            T::DATA_TYPE.size(),
            self.options.memory_budget,
            self.options.max_workers,
        )
    }

    /// Stop admitting new units. In-flight units finish their current chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> PyramidState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<PyramidState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PyramidState) {
        debug!(?state, "Pyramid state");
        self.state.send_replace(state);
    }

    fn fail<E>(&self, error: E) -> E {
        self.set_state(PyramidState::Failed);
        error
    }

    /// Run the conversion.
    ///
    /// Geometry, shard shape and memory budget are all validated before any
    /// slice is read or the store is touched.
    pub async fn run(&self, mode: ExecutionMode) -> Result<RunOutput, ConvertError> {
        self.set_state(PyramidState::Planned);
        let prepared = self.prepare().map_err(|e| self.fail(e))?;
        info!(
            levels = prepared.shapes.len(),
            slab_workers = prepared.estimate.level0_workers,
            downsample_workers = prepared.estimate.downsample_workers,
            mode = ?mode,
            "Pyramid planned"
        );

        match mode {
            ExecutionMode::Eager => self.run_eager(prepared).await.map(RunOutput::Complete),
            ExecutionMode::Lazy => self
                .build_graph(prepared)
                .map(RunOutput::Graph)
                .map_err(|e| self.fail(e)),
        }
    }

    fn prepare(&self) -> Result<Prepared, ConvertError> {
        if self.reader.volume_shape() != self.plan.volume_shape() {
            return Err(ConvertError::geometry(format!(
                "slice reader provides volume {:?}, plan expects {:?}",
                self.reader.volume_shape(),
                self.plan.volume_shape()
            )));
        }
        if let Some(shard_shape) = self.options.shard_shape {
            validate_shard_shape(shard_shape)?;
        }
        let shapes = self.level_shapes()?;
        let estimate = self.estimate()?;
        Ok(Prepared { shapes, estimate })
    }

    fn tracker(&self, level: usize, shape: Shape3) -> Result<Option<Arc<ShardTracker>>, ConvertError> {
        let Some(shard_shape) = self.options.shard_shape else {
            return Ok(None);
        };
        let grid = ChunkGrid::new(shape, self.plan.chunk_edge())?;
        Ok(Some(Arc::new(ShardTracker::new(level, &grid, shard_shape)?)))
    }

    fn source(&self, shapes: &[Shape3], level: usize) -> LevelSource {
        LevelSource {
            level,
            shape: shapes[level],
            chunk_edge: self.plan.chunk_edge(),
            factor: self.levels.factor,
        }
    }

    fn writer(&self) -> Arc<dyn ChunkWriter<T>> {
        self.store.clone()
    }

    fn chunk_reader(&self) -> Arc<dyn ChunkReader<T>> {
        self.store.clone()
    }

    async fn run_eager(&self, prepared: Prepared) -> Result<PyramidReport, ConvertError> {
        let Prepared { shapes, estimate } = prepared;
        let edge = self.plan.chunk_edge();

        for (level, &shape) in shapes.iter().enumerate() {
            self.store
                .create_level(level, shape, edge)
                .await
                .map_err(|e| self.fail(ConvertError::from(e)))?;
        }

        let mut levels = Vec::with_capacity(shapes.len());

        self.set_state(PyramidState::Level0Writing);
        let pool = WorkerPool::new(estimate.level0_workers, self.options.retries, self.cancel.clone());
        let tracker = self.tracker(0, shapes[0]).map_err(|e| self.fail(e))?;
        let report = write_level0(
            Arc::clone(&self.plan),
            Arc::clone(&self.reader),
            self.writer(),
            &pool,
            tracker,
        )
        .await;
        let report = self.finish_stage(0, report)?;
        levels.push(level_report(0, shapes[0], &report));
        self.set_state(PyramidState::Level0Done);

        for level in 1..shapes.len() {
            self.set_state(PyramidState::Downsampling(level));
            let pool = WorkerPool::new(
                estimate.downsample_workers,
                self.options.retries,
                self.cancel.clone(),
            );
            let tracker = self.tracker(level, shapes[level]).map_err(|e| self.fail(e))?;
            let report = downsample_level(
                self.chunk_reader(),
                self.writer(),
                self.source(&shapes, level - 1),
                Arc::clone(&self.reducer),
                &pool,
                tracker,
            )
            .await;
            let report = self.finish_stage(level, report)?;
            levels.push(level_report(level, shapes[level], &report));
            self.set_state(PyramidState::LevelDone(level));
        }

        self.set_state(PyramidState::PyramidComplete);
        let report = PyramidReport { estimate, levels };
        info!(
            levels = report.levels.len(),
            chunks_written = report.chunks_written(),
            "Pyramid complete"
        );
        Ok(report)
    }

    /// Refuse to advance past a level that did not fully succeed.
    fn finish_stage(
        &self,
        level: usize,
        report: Result<StageReport, ConvertError>,
    ) -> Result<StageReport, ConvertError> {
        let report = report.map_err(|e| self.fail(e))?;
        if !report.failures.is_empty() {
            warn!(level, failed = report.failures.len(), "Level incomplete");
            return Err(self.fail(ConvertError::LevelIncomplete {
                level,
                failure: report.partial_failure(),
            }));
        }
        if !report.cancelled.is_empty() {
            warn!(level, pending = report.cancelled.len(), "Run cancelled");
            self.set_state(PyramidState::Cancelled);
            return Err(ConvertError::Cancelled {
                level,
                pending: report.cancelled.len(),
            });
        }
        Ok(report)
    }

    /// Express the run as a task graph. Does not touch the store.
    fn build_graph(&self, prepared: Prepared) -> Result<TaskGraph, ConvertError> {
        let Prepared { shapes, estimate } = prepared;
        let edge = self.plan.chunk_edge();
        let retries = self.options.retries;
        let mut graph = TaskGraph::new(ResourceSpec::from_estimate(&estimate));

        let writer = self.writer();
        let setup_shapes = shapes.clone();
        graph.add_task(TaskKey::Setup, Vec::new(), move || async move {
            for (level, &shape) in setup_shapes.iter().enumerate() {
                writer.create_level(level, shape, edge).await?;
            }
            Ok::<_, ConvertError>(UnitStats::default())
        })?;

        let level0 = Level0Job::new(
            Arc::clone(&self.plan),
            Arc::clone(&self.reader),
            self.writer(),
            self.tracker(0, shapes[0])?,
            self.cancel.clone(),
        )?;
        let mut producers = Vec::with_capacity(self.plan.len());
        for slab in self.plan.slabs() {
            let i = slab.index;
            let job = level0.clone();
            let cancel = self.cancel.clone();
            graph.add_task(TaskKey::Slab(i), vec![TaskKey::Setup], move || async move {
                let work = move |_| {
                    let job = job.clone();
                    async move { job.process_slab(i).await }
                };
                run_with_retries(WorkUnit::Slab(i), retries, &cancel, work).await.1
            })?;
            producers.push(TaskKey::Slab(i));
        }
        add_barrier(&mut graph, 0, producers)?;

        for level in 1..shapes.len() {
            let job = DownsampleJob::new(
                self.source(&shapes, level - 1),
                self.chunk_reader(),
                self.writer(),
                Arc::clone(&self.reducer),
                self.tracker(level, shapes[level])?,
                self.cancel.clone(),
            )?;
            let mut producers = Vec::with_capacity(job.target_grid().chunk_count());
            for index in job.target_grid().indices() {
                let key = TaskKey::Chunk { level, index };
                let unit = WorkUnit::Chunk { level, index };
                let job = job.clone();
                let cancel = self.cancel.clone();
                graph.add_task(key, vec![TaskKey::LevelBarrier(level - 1)], move || async move {
                    let work = move |_| {
                        let job = job.clone();
                        async move { job.process_chunk(index).await }
                    };
                    run_with_retries(unit, retries, &cancel, work).await.1
                })?;
                producers.push(key);
            }
            add_barrier(&mut graph, level, producers)?;
        }

        info!(nodes = graph.len(), "Task graph built");
        Ok(graph)
    }
}

fn add_barrier(
    graph: &mut TaskGraph,
    level: usize,
    producers: Vec<TaskKey>,
) -> Result<(), ConvertError> {
    graph.add_task(TaskKey::LevelBarrier(level), producers, move || async move {
        debug!(level, "Level complete");
        Ok(UnitStats::default())
    })
}

fn level_report(level: usize, shape: Shape3, report: &StageReport) -> LevelReport {
    LevelReport {
        level,
        shape,
        chunks_written: report.chunks_written,
        chunks_skipped: report.chunks_skipped,
    }
}

// =============================================================================
// Tests
// =============================================================================
