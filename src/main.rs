//! camgraph - Main Entry Point
//!
//! Loads a graph file, streams a number of capture requests through it and
//! reports how each one completed.

use anyhow::{bail, Context};
use camgraph::{
    config::AppConfig,
    pipeline::{DeactivateMode, NegotiationMode, RequestResult},
    types::CaptureRequest,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// How long to wait for one request before giving up on it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "camgraph", version, about = "Per-request camera graph scheduler")]
struct Cli {
    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, env = "CAMGRAPH_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run capture requests through a graph
    Run {
        /// Graph configuration (TOML)
        #[arg(long)]
        graph: PathBuf,

        /// Number of requests to submit
        #[arg(long, default_value_t = 30)]
        requests: u64,

        /// Resolve unsatisfiable ports to their default properties
        #[arg(long)]
        fallback: bool,

        /// Print the fence error ring as JSON when done
        #[arg(long)]
        dump_errors: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The guard flushes the file writer on exit.
    let _log_guard = init_logging(cli.log_dir.as_deref());

    match cli.command {
        Command::Run {
            graph,
            requests,
            fallback,
            dump_errors,
        } => run(&graph, requests, fallback, dump_errors),
    }
}

fn init_logging(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,camgraph=debug"));
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "camgraph.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

fn run(graph: &std::path::Path, requests: u64, fallback: bool, dump_errors: bool) -> anyhow::Result<()> {
    let config = AppConfig::load(graph).with_context(|| format!("Failed to load {:?}", graph))?;
    if config.graph.streams.is_empty() {
        bail!("{:?} declares no streams", graph);
    }
    tracing::info!("Starting camgraph on {:?}", graph);

    let (mut pipeline, bridge) = config.graph.build_pipeline(config.scheduler.clone())?;
    let mode = if fallback {
        NegotiationMode::FallbackToDefault
    } else {
        NegotiationMode::Strict
    };
    pipeline.finalize(mode).context("Buffer negotiation failed")?;
    pipeline.stream_on()?;

    let streams = config.graph.stream_ids();
    let started = Instant::now();
    let (mut ok, mut failed, mut cancelled, mut lost) = (0u64, 0u64, 0u64, 0u64);
    for id in 0..requests {
        pipeline.process_request(&CaptureRequest::new(id, streams.iter().copied()))?;
        if config.scheduler.worker_threads == 0 {
            pipeline.run_until_idle();
        }
        match bridge.wait_for_request(id, REQUEST_TIMEOUT) {
            Some(RequestResult::Success) => ok += 1,
            Some(RequestResult::Failed {
                node_name,
                stage,
                reason,
                ..
            }) => {
                tracing::warn!("Request {} failed in {} ({:?}): {}", id, node_name, stage, reason);
                failed += 1;
            }
            Some(RequestResult::Cancelled) => cancelled += 1,
            None => {
                tracing::error!("Request {} did not complete within {:?}", id, REQUEST_TIMEOUT);
                pipeline.flush(id)?;
                lost += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    pipeline.stream_off(DeactivateMode::ReleaseAll)?;
    let stats = pipeline.stats();
    tracing::info!(
        "{} requests in {:.1?}: {} ok, {} failed, {} cancelled, {} timed out",
        requests,
        elapsed,
        ok,
        failed,
        cancelled,
        lost
    );
    tracing::info!(
        "DRQ: {} units added, {} resolved, {} expired; {} fence errors recorded",
        stats.drq.added,
        stats.drq.resolved,
        stats.drq.expired,
        stats.fence_errors_recorded
    );

    if dump_errors {
        println!("{}", pipeline.fence_errors_json()?);
    }
    Ok(())
}
