//! Benchmarks for negotiation and dependency scheduling
//!
//! Run with: cargo bench

use camgraph::config::SchedulerConfig;
use camgraph::pipeline::negotiation::combine_requirements;
use camgraph::pipeline::scheduler::{AddOutcome, DeferredRequestQueue};
use camgraph::pipeline::{
    AnyNode, BufferRequirement, BuiltinNode, DependencyUnit, Dimension, FencePrimitive,
    FenceResult, Format, InMemoryMetadataPool, InputPortDesc, NegotiationMode, NodeDescriptor,
    NodeId, NodeKind, OutputPortDesc, Pipeline, PortId, SensorNode, SinkNode, StageNode,
    StreamId, TagId,
};
use camgraph::types::CaptureRequest;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_requirement_combination(c: &mut Criterion) {
    let mut group = c.benchmark_group("requirement_combination");

    for consumers in [2usize, 8, 32].iter() {
        let reqs: Vec<BufferRequirement> = (0..*consumers as u32)
            .map(|i| {
                let min = Dimension::new(640 + i * 16, 480 + i * 9);
                BufferRequirement::range(min, Dimension::new(8192, 8192), min)
            })
            .collect();
        group.throughput(Throughput::Elements(*consumers as u64));
        group.bench_with_input(BenchmarkId::new("combine", consumers), &reqs, |b, reqs| {
            b.iter(|| combine_requirements(black_box(reqs)))
        });
    }

    group.finish();
}

fn bench_deferred_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("deferred_queue");
    let metadata = InMemoryMetadataPool::new(0, 8);

    for units in [16usize, 256].iter() {
        group.throughput(Throughput::Elements(*units as u64));
        group.bench_with_input(BenchmarkId::new("add_then_signal", units), units, |b, &units| {
            let fences = camgraph::pipeline::SoftwareFencePool::new();
            b.iter(|| {
                let mut drq = DeferredRequestQueue::new(None);
                let mut handles = Vec::with_capacity(units);
                for i in 0..units {
                    let fence = fences.create("bench").unwrap();
                    let unit = DependencyUnit::builder(1).buffer_fence(fence).build().unwrap();
                    if let AddOutcome::Deferred { .. } =
                        drq.add(NodeId(i as u32), i as u64, unit, &fences, &metadata)
                    {
                        handles.push(fence);
                    }
                }
                let mut ready = 0;
                for fence in handles {
                    fences.signal(fence, FenceResult::Success).unwrap();
                    ready += drq.fence_signaled(fence, FenceResult::Success).len();
                    fences.release(fence).unwrap();
                }
                black_box(ready)
            });
        });
    }

    group.bench_function("property_published", |b| {
        let fences = camgraph::pipeline::SoftwareFencePool::new();
        let tag = TagId(0x0002_0001);
        b.iter(|| {
            let mut drq = DeferredRequestQueue::new(None);
            for r in 1..64u64 {
                let unit = DependencyUnit::builder(1)
                    .property(camgraph::pipeline::PropertyRequirement::previous(tag, 1))
                    .build()
                    .unwrap();
                drq.add(NodeId(0), r, unit, &fences, &metadata);
            }
            let ready: usize = (0..63u64).map(|r| drq.property_published(tag, r).len()).sum();
            black_box(ready)
        });
    });

    group.finish();
}

/// sensor -> ipe -> sink on built-in nodes, run without workers.
fn linear_pipeline() -> (Pipeline, camgraph::pipeline::PipelineBridge) {
    let (mut p, bridge) = Pipeline::with_bridge(SchedulerConfig::manual());
    let sensor = p
        .add_node(
            NodeDescriptor::new("sensor", NodeKind::Sensor)
                .output(OutputPortDesc::new("out").format(Format::Nv12)),
            AnyNode::from(BuiltinNode::Sensor(SensorNode::new())),
        )
        .unwrap();
    let ipe = p
        .add_node(
            NodeDescriptor::new("ipe", NodeKind::Ipe)
                .input(InputPortDesc::new("in"))
                .output(OutputPortDesc::new("out").format(Format::Nv12)),
            AnyNode::from(BuiltinNode::Stage(StageNode::new(NodeKind::Ipe))),
        )
        .unwrap();
    let sink = p
        .add_node(
            NodeDescriptor::new("sink", NodeKind::Sink)
                .input(InputPortDesc::new("in"))
                .output(OutputPortDesc::new("hal").sink(
                    StreamId(0),
                    BufferRequirement::exact(Dimension::new(1920, 1080)),
                )),
            AnyNode::from(BuiltinNode::Sink(SinkNode::new())),
        )
        .unwrap();
    p.link(PortId::new(sensor, 0), PortId::new(ipe, 0), false).unwrap();
    p.link(PortId::new(ipe, 0), PortId::new(sink, 0), false).unwrap();
    p.finalize(NegotiationMode::Strict).unwrap();
    p.stream_on().unwrap();
    (p, bridge)
}

fn bench_request_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_round_trip");
    group.throughput(Throughput::Elements(1));

    let (pipeline, bridge) = linear_pipeline();
    let mut next = 0u64;
    group.bench_function("linear_three_nodes", |b| {
        b.iter(|| {
            pipeline
                .process_request(&CaptureRequest::new(next, [StreamId(0)]))
                .unwrap();
            pipeline.run_until_idle();
            next += 1;
            black_box(bridge.drain().len())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_requirement_combination,
    bench_deferred_queue,
    bench_request_round_trip
);
criterion_main!(benches);
