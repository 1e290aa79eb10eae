//! Integration tests for the request lifecycle
//!
//! These tests validate:
//! - Buffer references across a bypassed stage
//! - Flushing a deferred request and reusing its ring slot
//! - Composite fences released exactly once
//! - Stream off releasing everything
//! - Loopback inputs reading the previous request's output
//! - In-place forwarding of the producer's buffer
//! - Real-time units surviving until flushed, batch completion

mod common;

use camgraph::config::SchedulerConfig;
use camgraph::pipeline::{
    BuiltinNode, BypassNode, BypassPolicy, DeactivateMode, FencePrimitive, FenceResult, Format,
    InMemoryMetadataPool, InputPortDesc, NegotiationMode, NodeDescriptor, NodeKind, OutputPortDesc,
    NodeId, PerRequestNodeStatus, Pipeline, PipelineBridge, PipelineError, PipelineMessage, PortId,
    RequestResult, SoftwareFencePool, StreamId,
};
use camgraph::types::{BatchInfo, CaptureRequest};
use common::builders::{
    link, manual_pipeline, sink, source, stage, ExternalFences, LinearGraphBuilder, PortLog,
    ScriptedNode,
};
use common::expect_result;
use common::mock_helpers::{double_releases, recording_fences, ReleaseLog};
use std::sync::Arc;

fn request(id: u64) -> CaptureRequest {
    CaptureRequest::new(id, [StreamId(0)])
}

#[test]
fn test_bypass_moves_one_reference_per_consumer() {
    let external = ExternalFences::default();
    let (p, bridge, fences, [source, bypass, _]) = LinearGraphBuilder::new()
        .middle(
            stage("jpeg", NodeKind::Jpeg).bypassable(),
            BuiltinNode::Bypass(BypassNode::new(NodeKind::Jpeg, BypassPolicy::Always)).into(),
        )
        .sink(ScriptedNode::new().wait_inputs().external_fence(&external).into_node())
        .build();
    let produced = PortId::new(source, 0);

    p.process_request(&request(0)).unwrap();
    p.run_until_idle();

    // The bypassed stage finished and handed its input back; the sink holds
    // the forwarded reference next to the producer's own.
    assert_eq!(p.request_status(bypass, 0).unwrap(), Some(PerRequestNodeStatus::Success));
    assert_eq!(p.output_buffer_ref_count(produced, 0).unwrap(), Some(2));
    assert_eq!(
        p.output_buffer_ref_count(PortId::new(bypass, 0), 0).unwrap(),
        Some(2),
        "consumers of the bypassed port read the producer's buffer"
    );

    let fence = external.lock().unwrap()[0];
    fences.signal(fence, FenceResult::Success).unwrap();
    p.run_until_idle();

    assert_eq!(expect_result(&bridge, 0), RequestResult::Success);
    assert_eq!(p.output_buffer_ref_count(produced, 0).unwrap(), Some(1));
}

#[test]
fn test_flush_frees_ring_slot() {
    let external = ExternalFences::default();
    let config = SchedulerConfig {
        queue_depth: 2,
        ..SchedulerConfig::manual()
    };
    let (p, bridge, fences, [_, middle, sink]) = LinearGraphBuilder::new()
        .config(config)
        .middle(
            stage("middle", NodeKind::Ipe),
            ScriptedNode::new().wait_inputs().external_fence(&external).into_node(),
        )
        .build();

    p.process_request(&request(0)).unwrap();
    p.run_until_idle();
    assert_eq!(p.request_status(middle, 0).unwrap(), Some(PerRequestNodeStatus::Deferred));

    // Request 2 shares the ring slot of the deferred request 0.
    assert!(matches!(
        p.process_request(&request(2)),
        Err(PipelineError::ResourceExhausted(_))
    ));
    assert!(matches!(
        p.process_request(&request(0)),
        Err(PipelineError::InvalidArgument(_))
    ));

    p.flush(0).unwrap();
    p.run_until_idle();
    assert_eq!(expect_result(&bridge, 0), RequestResult::Cancelled);
    assert_eq!(p.request_status(middle, 0).unwrap(), Some(PerRequestNodeStatus::Cancelled));
    assert_eq!(p.request_status(sink, 0).unwrap(), Some(PerRequestNodeStatus::Cancelled));
    assert_eq!(p.stats().deferred_units, 0);
    // No fence error is recorded for a flush.
    assert!(p.fence_errors().is_empty());

    // A late signal for the flushed request changes nothing.
    let stale = external.lock().unwrap()[0];
    fences.signal(stale, FenceResult::Success).unwrap();
    p.run_until_idle();

    p.process_request(&request(2)).unwrap();
    p.run_until_idle();
    let fresh = external.lock().unwrap()[1];
    fences.signal(fresh, FenceResult::Success).unwrap();
    p.run_until_idle();

    assert_eq!(expect_result(&bridge, 2), RequestResult::Success);
    assert_eq!(p.request_status(middle, 2).unwrap(), Some(PerRequestNodeStatus::Success));
    let counters = p.stats().requests;
    assert_eq!((counters.submitted, counters.succeeded, counters.cancelled), (2, 1, 1));
}

/// source(a, b in one composite group) -> sink0 (stream 0), sink1 (stream 1)
fn composite_graph(fences: Arc<dyn FencePrimitive>) -> (Pipeline, PipelineBridge) {
    let config = SchedulerConfig::manual();
    let (bridge, msg_tx) = PipelineBridge::new();
    let metadata = Arc::new(InMemoryMetadataPool::new(0, config.queue_depth));
    let mut p = Pipeline::new(config, fences, metadata, msg_tx);
    let source = p
        .add_node(
            NodeDescriptor::new("source", NodeKind::Sensor)
                .output(OutputPortDesc::new("a").format(Format::Nv12).composite_group(1))
                .output(OutputPortDesc::new("b").format(Format::Nv12).composite_group(1)),
            ScriptedNode::new().into_node(),
        )
        .unwrap();
    let sink0 = p.add_node(sink("sink0", 0, 640, 480), ScriptedNode::new().wait_inputs().into_node()).unwrap();
    let sink1 = p.add_node(sink("sink1", 1, 320, 240), ScriptedNode::new().wait_inputs().into_node()).unwrap();
    p.link(PortId::new(source, 0), PortId::new(sink0, 0), false).unwrap();
    p.link(PortId::new(source, 1), PortId::new(sink1, 0), false).unwrap();
    p.finalize(NegotiationMode::Strict).unwrap();
    p.stream_on().unwrap();
    (p, bridge)
}

#[test]
fn test_composite_fence_released_once() {
    let pool = Arc::new(SoftwareFencePool::new());
    let releases = ReleaseLog::default();
    let (p, bridge) = composite_graph(Arc::new(recording_fences(&pool, &releases)));

    p.process_request(&CaptureRequest::new(0, [StreamId(0), StreamId(1)])).unwrap();
    p.run_until_idle();
    assert_eq!(expect_result(&bridge, 0), RequestResult::Success);

    // One shared fence for the source plus one per sink.
    let stats = pool.stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.live, 0);
    assert_eq!(releases.lock().unwrap().len(), 3);
    assert!(double_releases(&releases).is_empty());

    // Only one port of the group is active for a single-stream request.
    p.process_request(&CaptureRequest::new(1, [StreamId(1)])).unwrap();
    p.run_until_idle();
    assert_eq!(expect_result(&bridge, 1), RequestResult::Success);
    assert_eq!(pool.stats().created, 5);
    assert_eq!(pool.stats().live, 0);
    assert!(double_releases(&releases).is_empty());
}

#[test]
fn test_stream_off_releases_everything() {
    let pool = Arc::new(SoftwareFencePool::new());
    let releases = ReleaseLog::default();
    let (mut p, bridge) = composite_graph(Arc::new(recording_fences(&pool, &releases)));

    for r in 0..3 {
        p.process_request(&CaptureRequest::new(r, [StreamId(0), StreamId(1)])).unwrap();
        p.run_until_idle();
        assert_eq!(expect_result(&bridge, r), RequestResult::Success);
    }
    assert!(p.stats().pools.iter().any(|(_, s)| s.in_use > 0));

    p.stream_off(DeactivateMode::ReleaseAll).unwrap();

    assert!(!p.is_streaming());
    assert!(p.stats().pools.iter().all(|(_, s)| !s.active && s.in_use == 0));
    assert_eq!(pool.stats().live, 0);
    assert!(double_releases(&releases).is_empty());
    assert_eq!(
        p.process_request(&request(3)),
        Err(PipelineError::NotStreaming)
    );
    // Streaming again needs no new finalize.
    p.stream_on().unwrap();
}

/// source -> temporal -> sink, with temporal also reading its own previous output.
fn temporal_graph(log: &PortLog) -> (Pipeline, PipelineBridge, NodeId) {
    let (mut p, bridge, _fences) = manual_pipeline(SchedulerConfig::manual());
    let source = p.add_node(source("source"), ScriptedNode::new().into_node()).unwrap();
    let temporal = p
        .add_node(
            NodeDescriptor::new("temporal", NodeKind::Ipe)
                .input(InputPortDesc::new("in"))
                .input(InputPortDesc::new("prev"))
                .output(OutputPortDesc::new("out").format(Format::Nv12)),
            ScriptedNode::new().wait_inputs().logging_ports(log).into_node(),
        )
        .unwrap();
    let sink = p.add_node(sink("sink", 0, 640, 480), ScriptedNode::new().wait_inputs().into_node()).unwrap();
    link(&mut p, source, temporal);
    p.link(PortId::new(temporal, 0), PortId::new(temporal, 1), true).unwrap();
    link(&mut p, temporal, sink);
    p.finalize(NegotiationMode::Strict).unwrap();
    p.stream_on().unwrap();
    (p, bridge, temporal)
}

#[test]
fn test_loopback_reads_previous_output() {
    let log = PortLog::default();
    let (mut p, bridge, temporal) = temporal_graph(&log);
    let produced = PortId::new(temporal, 0);

    for r in 0..4 {
        p.process_request(&request(r)).unwrap();
        p.run_until_idle();
        assert_eq!(expect_result(&bridge, r), RequestResult::Success, "request {}", r);
        // The loopback reference on r - 1 went back with request r.
        if r > 0 {
            assert_eq!(p.output_buffer_ref_count(produced, r - 1).unwrap(), Some(1));
        }
    }

    let seen = log.lock().unwrap().clone();
    let loopback = |r: u64| seen.iter().find(|s| s.request == r && s.loopback).cloned();
    let output = |r: u64| seen.iter().find(|s| s.request == r && s.is_output).cloned();

    assert!(loopback(0).is_none(), "request 0 has no previous frame");
    for r in 1..4 {
        let prev = loopback(r).unwrap_or_else(|| panic!("request {} saw no loopback input", r));
        assert_eq!(prev.port, 1);
        assert_eq!(prev.stamp, Some(r - 1));
        assert_eq!(prev.buffer, output(r - 1).and_then(|o| o.buffer));
    }

    p.stream_off(DeactivateMode::ReleaseAll).unwrap();
    assert!(p.stats().pools.iter().all(|(_, s)| s.in_use == 0));
}

#[test]
fn test_loopback_output_enabled_without_streams() {
    let log = PortLog::default();
    let (p, bridge, temporal) = temporal_graph(&log);

    // No stream of request 0 needs the temporal node's output, but the
    // loopback keeps it producing for request 1.
    p.process_request(&CaptureRequest::new(0, [StreamId(7)])).unwrap();
    p.run_until_idle();
    assert_eq!(expect_result(&bridge, 0), RequestResult::Success);
    assert_eq!(p.request_status(temporal, 0).unwrap(), Some(PerRequestNodeStatus::Success));
    assert!(p.output_buffer_ref_count(PortId::new(temporal, 0), 0).unwrap().is_some());
}

#[test]
fn test_in_place_writes_into_producer_buffer() {
    let log = PortLog::default();
    let external = ExternalFences::default();
    let (mut p, bridge, fences, [source, in_place, _]) = LinearGraphBuilder::new()
        .middle(
            stage("denoise", NodeKind::Ipe).in_place(),
            ScriptedNode::new().wait_inputs().logging_ports(&log).into_node(),
        )
        .sink(ScriptedNode::new().wait_inputs().external_fence(&external).into_node())
        .build();
    let produced = PortId::new(source, 0);

    p.process_request(&request(0)).unwrap();
    p.run_until_idle();
    assert_eq!(p.request_status(in_place, 0).unwrap(), Some(PerRequestNodeStatus::Success));

    let seen = log.lock().unwrap().clone();
    let input = seen.iter().find(|s| !s.is_output).unwrap();
    let output = seen.iter().rev().find(|s| s.is_output).unwrap();
    assert!(input.buffer.is_some());
    assert_eq!(output.buffer, input.buffer);
    assert_eq!(output.stamp, Some(0));

    // The producer's own reference plus the one forwarded to the sink.
    assert_eq!(p.output_buffer_ref_count(produced, 0).unwrap(), Some(2));
    assert_eq!(p.output_buffer_ref_count(PortId::new(in_place, 0), 0).unwrap(), Some(2));

    let fence = external.lock().unwrap()[0];
    fences.signal(fence, FenceResult::Success).unwrap();
    p.run_until_idle();
    assert_eq!(expect_result(&bridge, 0), RequestResult::Success);
    assert_eq!(p.output_buffer_ref_count(produced, 0).unwrap(), Some(1));

    p.stream_off(DeactivateMode::ReleaseAll).unwrap();
    assert!(p.stats().pools.iter().all(|(_, s)| s.in_use == 0));
}

/// A pipeline whose middle node holds request 0 on a preemptable unit.
fn preemptable_middle(desc: NodeDescriptor) -> (Pipeline, PipelineBridge) {
    let external = ExternalFences::default();
    let (p, bridge, _fences, _) = LinearGraphBuilder::new()
        .middle(
            desc,
            ScriptedNode::new()
                .wait_inputs()
                .external_fence(&external)
                .preemptable()
                .into_node(),
        )
        .build();
    p.process_request(&request(0)).unwrap();
    p.run_until_idle();
    // The middle's preemptable unit and the sink's wait on the middle.
    assert_eq!(p.stats().deferred_units, 2);
    (p, bridge)
}

#[test]
fn test_real_time_units_wait_for_flush() {
    let (mut plain, _bridge) = preemptable_middle(stage("middle", NodeKind::Ipe));
    plain.stream_off(DeactivateMode::Default).unwrap();
    let drq = plain.stats().drq;
    assert_eq!((drq.abandoned, drq.cleared), (1, 1));

    let (mut ordered, _bridge) = preemptable_middle(stage("middle", NodeKind::Ipe).real_time());
    ordered.stream_off(DeactivateMode::Default).unwrap();
    let drq = ordered.stats().drq;
    assert_eq!((drq.abandoned, drq.cleared), (0, 2));
}

#[test]
fn test_last_request_closes_batch() {
    let (p, bridge, _fences, _) = LinearGraphBuilder::new().build();

    for r in 0..3u64 {
        let batch = BatchInfo {
            batch_size: 3,
            index_in_batch: r as u32,
        };
        p.process_request(&request(r).with_batch(batch)).unwrap();
        p.run_until_idle();
    }

    let messages = bridge.drain();
    let completed = messages
        .iter()
        .filter(|m| matches!(m, PipelineMessage::RequestComplete { .. }))
        .count();
    let batches: Vec<(u64, u32)> = messages
        .iter()
        .filter_map(|m| match m {
            PipelineMessage::BatchComplete { last_request, batch_size } => Some((*last_request, *batch_size)),
            _ => None,
        })
        .collect();
    assert_eq!(completed, 3);
    assert_eq!(batches, vec![(2, 3)]);
}
