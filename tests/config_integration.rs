//! Integration tests for configuration files
//!
//! These tests validate:
//! - Saving and loading a complete configuration
//! - Running the shipped sample graph on worker threads

mod common;

use camgraph::config::{AppConfig, FenceMode, LinkConfig, NodeConfig, OutputPortConfig, SchedulerConfig};
use camgraph::pipeline::{DeactivateMode, Format, NegotiationMode, NodeKind, RequestResult, StreamId};
use camgraph::types::{CaptureRequest, StreamConfig};
use camgraph::CamGraphError;
use common::worker_timeout;
use tempfile::TempDir;

const SAMPLE: &str = "configs/preview_snapshot.toml";

fn two_node_graph() -> AppConfig {
    let mut config = AppConfig {
        scheduler: SchedulerConfig {
            queue_depth: 4,
            worker_threads: 0,
            fence_mode: FenceMode::Polling { interval_ms: 3 },
            fence_timeout_ms: Some(500),
            ..SchedulerConfig::default()
        },
        ..AppConfig::default()
    };
    config.graph.streams.push(StreamConfig {
        id: StreamId(0),
        name: "preview".to_string(),
        width: 640,
        height: 480,
        format: Format::Nv12,
    });

    let mut sensor = NodeConfig::new("sensor", NodeKind::Sensor);
    sensor.outputs.push(OutputPortConfig {
        name: "out".to_string(),
        format: Some(Format::Nv12),
        capability: Default::default(),
        default_properties: None,
        composite_group: None,
        buffer_count: Some(3),
        stream: None,
    });
    let mut sink = NodeConfig::new("sink", NodeKind::Sink);
    sink.inputs.push(camgraph::config::InputPortConfig {
        name: "in".to_string(),
        requirement: Default::default(),
        source_buffer: false,
    });
    sink.outputs.push(OutputPortConfig {
        name: "hal".to_string(),
        format: None,
        capability: Default::default(),
        default_properties: None,
        composite_group: None,
        buffer_count: None,
        stream: Some(StreamId(0)),
    });
    config.graph.nodes = vec![sensor, sink];
    config.graph.links.push(LinkConfig {
        from: "sensor.out".to_string(),
        to: "sink.in".to_string(),
        loopback: false,
    });
    config
}

#[test]
fn test_config_save_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.toml");
    let config = two_node_graph();

    config.save(&path).unwrap();
    let loaded = AppConfig::load(&path).unwrap();

    assert_eq!(loaded, config);
    assert_eq!(loaded.scheduler.fence_mode, FenceMode::Polling { interval_ms: 3 });
    assert_eq!(loaded.graph.stream_ids(), vec![StreamId(0)]);
}

#[test]
fn test_loaded_graph_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("graph.toml");
    two_node_graph().save(&path).unwrap();

    let config = AppConfig::load(&path).unwrap();
    let (mut pipeline, bridge) = config.graph.build_pipeline(config.scheduler.clone()).unwrap();
    pipeline.finalize(NegotiationMode::Strict).unwrap();
    pipeline.stream_on().unwrap();

    for r in 0..6 {
        pipeline
            .process_request(&CaptureRequest::new(r, config.graph.stream_ids()))
            .unwrap();
        pipeline.run_until_idle();
        assert_eq!(common::expect_result(&bridge, r), RequestResult::Success);
    }
    pipeline.stream_off(DeactivateMode::ReleaseAll).unwrap();
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = AppConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, CamGraphError::Config(_)));
}

#[test]
fn test_unknown_link_port_rejected() {
    let mut config = two_node_graph();
    config.graph.links[0].to = "sink.missing".to_string();
    let err = config.graph.build_pipeline(SchedulerConfig::manual()).unwrap_err();
    assert!(err.to_string().contains("sink.missing"));
}

#[test]
fn test_sample_graph_on_workers() {
    let config = AppConfig::load(SAMPLE).unwrap();
    assert_eq!(config.scheduler.worker_threads, 4);
    let (mut pipeline, bridge) = config.graph.build_pipeline(config.scheduler.clone()).unwrap();
    pipeline.finalize(NegotiationMode::Strict).unwrap();
    pipeline.stream_on().unwrap();

    let streams = config.graph.stream_ids();
    for r in 0..12 {
        pipeline.process_request(&CaptureRequest::new(r, streams.iter().copied())).unwrap();
        let result = bridge.wait_for_request(r, worker_timeout());
        assert_eq!(result, Some(RequestResult::Success), "request {}", r);
    }

    let stats = pipeline.stats();
    assert_eq!(stats.requests.succeeded, 12);
    assert_eq!(stats.in_flight, 0);
    pipeline.stream_off(DeactivateMode::ReleaseAll).unwrap();
    assert!(pipeline.fence_errors().is_empty());
}
