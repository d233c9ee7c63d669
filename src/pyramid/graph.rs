//! Lazy execution as an explicit task graph.
//!
//! A [`TaskGraph`] carries the same work as an eager run, expressed as nodes
//! with dependencies instead of sequential stages:
//!
//! ```text
//!  Setup ──▶ Slab(0..n) ──▶ LevelBarrier(0) ──▶ Chunk{1, ..} ──▶ LevelBarrier(1) ──▶ ...
//! ```
//!
//! Nothing runs when the graph is built. Any scheduler can consume it through
//! [`TaskGraph::topological_order`] and [`TaskGraph::into_tasks`];
//! [`TaskGraph::execute`] is a local scheduler on the tokio runtime.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::ConvertError;
use crate::geometry::ChunkIndex;
use crate::memory::MemoryEstimate;

use super::pool::UnitStats;

/// Identifies a node of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    /// Declares every level in the store
    Setup,

    /// Writes one level-0 slab
    Slab(usize),

    /// Writes one chunk of a downsampled level
    Chunk { level: usize, index: ChunkIndex },

    /// Completes once every producer of the level has completed
    LevelBarrier(usize),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Setup => f.write_str("setup"),
            TaskKey::Slab(i) => write!(f, "slab-{}", i),
            TaskKey::Chunk { level, index } => {
                write!(f, "chunk-{}-{}.{}.{}", level, index.x, index.y, index.z)
            }
            TaskKey::LevelBarrier(level) => write!(f, "level-{}-done", level),
        }
    }
}

/// Future produced by a task.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<UnitStats, ConvertError>> + Send>>;

/// Deferred task body.
pub type TaskFn = Box<dyn FnOnce() -> TaskFuture + Send>;

/// Worker caps and per-worker memory for the stages in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSpec {
    pub level0_workers: usize,
    pub downsample_workers: usize,
    pub slab_worker_bytes: u64,
    pub downsample_worker_bytes: u64,
}

impl ResourceSpec {
    pub fn from_estimate(estimate: &MemoryEstimate) -> Self {
        Self {
            level0_workers: estimate.level0_workers,
            downsample_workers: estimate.downsample_workers,
            slab_worker_bytes: estimate.slab_bytes,
            downsample_worker_bytes: estimate.downsample_bytes,
        }
    }

    /// Concurrency that respects the budget in every stage.
    pub fn max_concurrency(&self) -> usize {
        self.level0_workers.min(self.downsample_workers).max(1)
    }
}

struct TaskNode {
    key: TaskKey,
    dependencies: Vec<TaskKey>,
    task: Option<TaskFn>,
}

/// Result of running a graph with the local scheduler.
#[derive(Debug, Default)]
pub struct GraphReport {
    /// Nodes that completed
    pub completed: usize,

    /// Chunks written across all nodes
    pub chunks_written: usize,

    /// Chunks found already written
    pub chunks_skipped: usize,

    /// Nodes that returned an error
    pub failed: Vec<(TaskKey, ConvertError)>,

    /// Nodes stopped by cancellation
    pub cancelled: Vec<TaskKey>,

    /// Nodes never run because a dependency did not complete
    pub skipped: Vec<TaskKey>,
}

impl GraphReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty() && self.skipped.is_empty()
    }

    /// Turn an incomplete run into an error naming the failed nodes.
    pub fn into_result(self) -> Result<Self, ConvertError> {
        if self.is_complete() {
            return Ok(self);
        }
        let failed: Vec<String> = self
            .failed
            .iter()
            .map(|(key, e)| format!("{}: {}", key, e))
            .collect();
        Err(ConvertError::Graph(format!(
            "{} completed, {} failed, {} cancelled, {} skipped [{}]",
            self.completed,
            self.failed.len(),
            self.cancelled.len(),
            self.skipped.len(),
            failed.join("; ")
        )))
    }
}

// =============================================================================
// Task Graph
// =============================================================================

/// Nodes with dependencies and deferred callables.
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<TaskKey, usize>,
    resources: ResourceSpec,
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.nodes.len())
            .field("resources", &self.resources)
            .finish()
    }
}

impl TaskGraph {
    pub fn new(resources: ResourceSpec) -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            resources,
        }
    }

    /// Add a node. Dependencies may refer to nodes added later.
    pub fn add_task<F, Fut>(
        &mut self,
        key: TaskKey,
        dependencies: Vec<TaskKey>,
        task: F,
    ) -> Result<(), ConvertError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<UnitStats, ConvertError>> + Send + 'static,
    {
        if self.index.contains_key(&key) {
            return Err(ConvertError::Graph(format!("duplicate task {}", key)));
        }
        self.index.insert(key, self.nodes.len());
        self.nodes.push(TaskNode {
            key,
            dependencies,
            task: Some(Box::new(move || Box::pin(task()) as TaskFuture)),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = TaskKey> + '_ {
        self.nodes.iter().map(|n| n.key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.index.contains_key(key)
    }

    /// Direct dependencies of a node.
    pub fn dependencies(&self, key: &TaskKey) -> Option<&[TaskKey]> {
        self.index
            .get(key)
            .map(|&i| self.nodes[i].dependencies.as_slice())
    }

    pub fn resources(&self) -> &ResourceSpec {
        &self.resources
    }

    /// Node indices that depend on each node, validating every edge.
    fn dependents(&self) -> Result<Vec<Vec<usize>>, ConvertError> {
        let mut dependents = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                let &d = self.index.get(dep).ok_or_else(|| {
                    ConvertError::Graph(format!("{} depends on unknown task {}", node.key, dep))
                })?;
                dependents[d].push(i);
            }
        }
        Ok(dependents)
    }

    /// A dependency-respecting order of all keys.
    ///
    /// # Errors
    ///
    /// Returns `Graph` if an edge points to a missing node or the graph has a
    /// cycle.
    pub fn topological_order(&self) -> Result<Vec<TaskKey>, ConvertError> {
        let dependents = self.dependents()?;
        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| remaining[i] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(self.nodes[i].key);
            for &d in &dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(ConvertError::Graph(format!(
                "dependency cycle among {} task(s)",
                self.nodes.len() - order.len()
            )));
        }
        Ok(order)
    }

    /// Hand the nodes to an external scheduler as `(key, dependencies, task)`.
    pub fn into_tasks(self) -> Vec<(TaskKey, Vec<TaskKey>, TaskFn)> {
        self.nodes
            .into_iter()
            .filter_map(|n| n.task.map(|t| (n.key, n.dependencies, t)))
            .collect()
    }

    /// Run the graph on the current runtime with at most `workers` nodes in
    /// flight.
    ///
    /// A node starts once all its dependencies completed. When a node fails,
    /// everything downstream of it is skipped; unrelated nodes still run.
    pub async fn execute(mut self, workers: usize) -> Result<GraphReport, ConvertError> {
        self.topological_order()?;
        let dependents = self.dependents()?;
        let workers = workers.max(1);

        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut blocked = vec![false; self.nodes.len()];
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut running: JoinSet<(usize, Result<UnitStats, ConvertError>)> = JoinSet::new();
        let mut report = GraphReport::default();

        debug!(nodes = self.nodes.len(), workers, "Executing task graph");

        while !ready.is_empty() || !running.is_empty() {
            while running.len() < workers {
                let Some(i) = ready.pop_front() else { break };
                let Some(task) = self.nodes[i].task.take() else {
                    continue;
                };
                running.spawn(async move {
                    match tokio::spawn(task()).await {
                        Ok(result) => (i, result),
                        Err(e) => (i, Err(ConvertError::Worker(e.to_string()))),
                    }
                });
            }

            let Some(joined) = running.join_next().await else {
                continue;
            };
            let (i, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Graph worker lost");
                    continue;
                }
            };
            let key = self.nodes[i].key;

            match result {
                Ok(stats) => {
                    report.completed += 1;
                    report.chunks_written += stats.written;
                    report.chunks_skipped += stats.skipped;
                    for &d in &dependents[i] {
                        remaining[d] -= 1;
                        if remaining[d] == 0 && !blocked[d] {
                            ready.push_back(d);
                        }
                    }
                }
                Err(error) => {
                    match error {
                        ConvertError::Cancelled { .. } => report.cancelled.push(key),
                        error => {
                            warn!(task = %key, error = %error, "Task failed");
                            report.failed.push((key, error));
                        }
                    }
                    let mut stack = dependents[i].clone();
                    while let Some(d) = stack.pop() {
                        if !blocked[d] {
                            blocked[d] = true;
                            report.skipped.push(self.nodes[d].key);
                            stack.extend(dependents[d].iter().copied());
                        }
                    }
                }
            }
        }

        debug!(
            completed = report.completed,
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Task graph finished"
        );
        Ok(report)
    }
}

// =============================================================================
// Tests
// =============================================================================
