//! stack-to-chunk - convert image stacks into chunked multiscale volumes.
//!
//! This binary wires the image-stack reader, the directory store and the
//! pyramid coordinator together.

use clap::Parser;
use serde::Serialize;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stack_to_chunk::{
    config::{Cli, Command, ConvertConfig, PlanConfig, PlanOutputFormat, StackArgs},
    geometry::{plan, pyramid_shapes, ChunkGrid, Shape3},
    io::{list_slice_files, read_image_header, ImageStackReader, ImageVoxel},
    memory::MemoryEstimate,
    pyramid::{Coordinator, RunOutput},
    store::{DirectoryStore, Multiscale},
    voxel::DataType,
    ConvertError,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Convert(config) => run_convert(config).await,
        Command::Plan(config) => run_plan(config),
    }
}

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "stack_to_chunk=debug"
    } else {
        "stack_to_chunk=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Slice shape, depth and element type of the input stack.
struct StackInfo {
    slice_shape: [usize; 2],
    depth: usize,
    dtype: DataType,
}

impl StackInfo {
    fn volume_shape(&self) -> Shape3 {
        [self.slice_shape[0], self.slice_shape[1], self.depth]
    }
}

fn inspect_stack(stack: &StackArgs) -> Result<StackInfo, String> {
    let files = list_slice_files(&stack.input).map_err(|e| e.to_string())?;
    let (slice_shape, detected) = read_image_header(&files[0]).map_err(|e| e.to_string())?;
    Ok(StackInfo {
        slice_shape,
        depth: files.len(),
        dtype: stack.dtype.unwrap_or(detected),
    })
}

// =============================================================================
// Convert Command
// =============================================================================

async fn run_convert(config: ConvertConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let stack = match inspect_stack(&config.stack) {
        Ok(stack) => stack,
        Err(e) => {
            error!("Failed to open input stack: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Configuration:");
    info!("  Input: {}", config.stack.input.display());
    info!("  Output: {}", config.output.display());
    info!(
        "  Volume: {} x {} x {} ({})",
        stack.slice_shape[0], stack.slice_shape[1], stack.depth, stack.dtype
    );
    info!("  Chunk size: {}", config.stack.chunk_size);
    match config.shard_shape() {
        Some(shard) => info!("  Shards: {:?} chunks", shard),
        None => info!("  Shards: disabled"),
    }
    info!("  Memory budget: {}", config.pyramid.memory_budget);

    let started = Instant::now();
    let result = match stack.dtype {
        DataType::U8 => convert::<u8>(&config, &stack).await,
        DataType::U16 => convert::<u16>(&config, &stack).await,
        other => Err(format!(
            "{} output is not supported for image stacks (use u8 or u16)",
            other
        )),
    };

    match result {
        Ok(chunks) => {
            info!(
                "Wrote {} chunk(s) to {} in {:.1}s",
                chunks,
                config.output.display(),
                started.elapsed().as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Conversion failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn convert<T: ImageVoxel>(config: &ConvertConfig, stack: &StackInfo) -> Result<usize, String> {
    let run_options = config.run_options()?;
    let reader = ImageStackReader::<T>::open(&config.stack.input).map_err(|e| e.to_string())?;
    let slab_plan = plan(stack.volume_shape(), stack.slice_shape, config.stack.chunk_size)
        .map_err(|e| e.to_string())?;

    let store = if config.resume {
        DirectoryStore::<T>::open_or_create(&config.output, run_options.shard_shape).await
    } else {
        DirectoryStore::<T>::create(&config.output, run_options.shard_shape).await
    }
    .map_err(|e| e.to_string())?;
    let store = Arc::new(store);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let coordinator = Coordinator::new(slab_plan, Arc::new(reader), store.clone(), config.levels_spec())
        .with_options(run_options)
        .with_cancel_token(cancel);

    let n_levels = coordinator.level_shapes().map_err(|e| e.to_string())?.len();
    let chunks = match coordinator.run(config.mode).await {
        Ok(RunOutput::Complete(report)) => {
            for level in &report.levels {
                info!(
                    "  Level {}: {:?}, {} written, {} skipped",
                    level.level, level.shape, level.chunks_written, level.chunks_skipped
                );
            }
            report.chunks_written()
        }
        Ok(RunOutput::Graph(graph)) => {
            let workers = graph.resources().max_concurrency();
            info!("Running task graph: {} node(s), {} worker(s)", graph.len(), workers);
            let report = graph
                .execute(workers)
                .await
                .and_then(|r| r.into_result())
                .map_err(|e| explain(e, &config.output))?;
            report.chunks_written
        }
        Err(e) => return Err(explain(e, &config.output)),
    };

    let multiscale = Multiscale::new(
        config.name.clone(),
        config.unit,
        config.voxel_size(),
        config.pyramid.factor,
        n_levels,
        coordinator.reducer().name(),
    );
    store
        .write_multiscales(multiscale)
        .await
        .map_err(|e| e.to_string())?;

    Ok(chunks)
}

/// Cancel the run on Ctrl+C. In-flight chunks finish before workers stop.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight chunks...");
            cancel.cancel();
        }
    });
}

fn explain(e: ConvertError, output: &Path) -> String {
    if matches!(e, ConvertError::Cancelled { .. } | ConvertError::LevelIncomplete { .. }) {
        warn!(
            "Re-run with --resume --output {} to finish the remaining chunks",
            output.display()
        );
    }
    e.to_string()
}

// =============================================================================
// Plan Command
// =============================================================================

#[derive(Serialize)]
struct PlannedLevel {
    level: usize,
    shape: Shape3,
    chunks: usize,
}

#[derive(Serialize)]
struct PlanSummary {
    volume_shape: Shape3,
    dtype: DataType,
    chunk_size: usize,
    slabs: usize,
    estimate: MemoryEstimate,
    levels: Vec<PlannedLevel>,
}

fn run_plan(config: PlanConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match build_plan_summary(&config) {
        Ok(summary) => {
            print_plan(&summary, config.format);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn build_plan_summary(config: &PlanConfig) -> Result<PlanSummary, String> {
    let stack = inspect_stack(&config.stack)?;
    let chunk_size = config.stack.chunk_size;
    let slab_plan = plan(stack.volume_shape(), stack.slice_shape, chunk_size)
        .map_err(|e| e.to_string())?;

    let estimate = MemoryEstimate::compute(
        stack.slice_shape,
        chunk_size,
        config.pyramid.factor,
        stack.dtype.size(),
        config.memory_budget()?,
        config.pyramid.workers,
    )
    .map_err(|e| e.to_string())?;

    let shapes = pyramid_shapes(
        stack.volume_shape(),
        chunk_size,
        config.pyramid.factor,
        config.pyramid.max_levels,
    )
    .map_err(|e| e.to_string())?;

    let levels = shapes
        .into_iter()
        .enumerate()
        .map(|(level, shape)| {
            let chunks = ChunkGrid::new(shape, chunk_size).map(|g| g.chunk_count())?;
            Ok(PlannedLevel {
                level,
                shape,
                chunks,
            })
        })
        .collect::<Result<Vec<_>, ConvertError>>()
        .map_err(|e| e.to_string())?;

    Ok(PlanSummary {
        volume_shape: stack.volume_shape(),
        dtype: stack.dtype,
        chunk_size,
        slabs: slab_plan.len(),
        estimate,
        levels,
    })
}

fn print_plan(summary: &PlanSummary, format: PlanOutputFormat) {
    match format {
        PlanOutputFormat::Json => match serde_json::to_string_pretty(summary) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Error: {}", e),
        },
        PlanOutputFormat::Text => {
            let [x, y, z] = summary.volume_shape;
            println!("Conversion Plan");
            println!("═══════════════");
            println!();
            println!("Volume:      {} x {} x {} ({})", x, y, z, summary.dtype);
            println!("Chunk size:  {}", summary.chunk_size);
            println!("Slabs:       {}", summary.slabs);
            println!();
            println!("Memory per worker:");
            println!(
                "  Level 0:     {} ({} worker(s))",
                format_bytes(summary.estimate.slab_bytes),
                summary.estimate.level0_workers
            );
            println!(
                "  Downsample:  {} ({} worker(s))",
                format_bytes(summary.estimate.downsample_bytes),
                summary.estimate.downsample_workers
            );
            println!();
            println!("Levels:");
            for level in &summary.levels {
                let [x, y, z] = level.shape;
                println!(
                    "  {:>2}  {:>6} x {:>6} x {:>6}  {:>8} chunk(s)",
                    level.level, x, y, z, level.chunks
                );
            }
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

