//! # camgraph: per-request node-graph scheduling for camera pipelines
//!
//! A capture request enters a DAG of processing nodes (sensor, front end,
//! image engines, encoders, sinks). Each node sets the request up, reports
//! what it waits on as dependency units, and runs when those resolve.
//! Fences signal completion asynchronously; the engine turns the signals
//! into graph progress on a worker pool and reports every request's
//! outcome over a channel.
//!
//! ## Architecture
//!
//! - **Negotiation**: before streaming, buffer shapes are agreed sink to
//!   source (requirements) and source to sink (properties)
//! - **Scheduling**: a deferred request queue holds dependency units until
//!   their properties are published and their fences signal
//! - **Completion**: fence callbacks only post jobs; workers update the
//!   per-request state and retire finished requests
//! - **Communication**: crossbeam channels carry jobs and caller messages
//!
//! ## Example
//!
//! ```ignore
//! use camgraph::config::AppConfig;
//! use camgraph::pipeline::NegotiationMode;
//! use camgraph::types::CaptureRequest;
//! use std::time::Duration;
//!
//! let config = AppConfig::load("configs/preview_snapshot.toml")?;
//! let (mut pipeline, bridge) = config.graph.build_pipeline(config.scheduler.clone())?;
//! pipeline.finalize(NegotiationMode::Strict)?;
//! pipeline.stream_on()?;
//!
//! pipeline.process_request(&CaptureRequest::new(0, config.graph.stream_ids()))?;
//! let result = bridge.wait_for_request(0, Duration::from_secs(1));
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use config::{AppConfig, GraphConfig, SchedulerConfig};
pub use error::{CamGraphError, Result};
pub use pipeline::{Pipeline, PipelineBridge, PipelineError, PipelineResult, RequestResult};
pub use types::{BatchInfo, CaptureRequest, StreamConfig};
