//! Pipeline: owns the node graph and drives it through its lifecycle.
//!
//! The pipeline:
//! 1. Collects nodes and port links while the graph is being built
//! 2. Compiles the topology and negotiates buffers on `finalize`
//! 3. Acquires node resources, activates buffer pools and starts the worker
//!    pool on `stream_on`
//! 4. Admits capture requests: sets every node up in topological order and
//!    posts a `Process` job per enabled node
//! 5. Flushes outstanding requests, stops the workers and releases
//!    everything on `stream_off`
//!
//! Structural changes (new nodes, links, late HAL streams) need exclusive
//! access to the shared `GraphContext`, so they are only possible while
//! streams are off.

use crate::pipeline::bridge::{FailureStage, PipelineBridge, PipelineMessage};
use crate::pipeline::buffer::BufferPoolStats;
use crate::pipeline::compiled_plan::PlanStats;
use crate::pipeline::compiler::PipelineCompiler;
use crate::pipeline::context::{GraphContext, RequestContext, RequestCounters};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::{FencePrimitive, SoftwareFencePool};
use crate::pipeline::fence_errors::FenceErrorEntry;
use crate::pipeline::id::{NodeId, PortId, RequestId, TagId};
use crate::pipeline::lock;
use crate::pipeline::metadata::{InMemoryMetadataPool, MetadataPool, MetadataValue};
use crate::pipeline::negotiation::NegotiationMode;
use crate::pipeline::negotiator::{BufferNegotiator, NegotiationScope};
use crate::pipeline::node::{AnyNode, DeactivateMode, StreamLifecycle};
use crate::pipeline::port::{InputLink, SinkStream};
use crate::pipeline::request::PerRequestNodeStatus;
use crate::pipeline::scheduler::DrqStats;
use crate::pipeline::slot::{NodeDescriptor, NodeSlot};
use crate::pipeline::worker::{job_channel, Job, WorkerPool};
use crate::config::SchedulerConfig;
use crate::types::{CaptureRequest, StreamConfig};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineState {
    /// Nodes or links changed since the last `finalize`.
    Building,
    Finalized,
    Streaming,
}

/// Snapshot of engine statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub plan: PlanStats,
    pub generation: u64,
    pub requests: RequestCounters,
    pub in_flight: usize,
    pub deferred_units: usize,
    pub drq: DrqStats,
    pub fence_errors_recorded: u64,
    /// Per output port, in node order.
    pub pools: Vec<(PortId, BufferPoolStats)>,
}

/// Per-request node-graph scheduler.
pub struct Pipeline {
    ctx: Arc<GraphContext>,
    jobs_rx: Receiver<Job>,
    workers: Option<WorkerPool>,
    state: PipelineState,
    negotiation_mode: NegotiationMode,
    graph_generation: u64,
    created_notified: bool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("graph_generation", &self.graph_generation)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        config: SchedulerConfig,
        fences: Arc<dyn FencePrimitive>,
        metadata: Arc<dyn MetadataPool>,
        msg_tx: Sender<PipelineMessage>,
    ) -> Self {
        let (jobs_tx, jobs_rx) = job_channel();
        let ctx = GraphContext::new(metadata.pipeline_id(), config, fences, metadata, jobs_tx, msg_tx);
        Self {
            ctx: Arc::new(ctx),
            jobs_rx,
            workers: None,
            state: PipelineState::Building,
            negotiation_mode: NegotiationMode::Strict,
            graph_generation: 0,
            created_notified: false,
        }
    }

    /// A pipeline on software fences and an in-memory metadata pool, plus
    /// the bridge its messages arrive on.
    pub fn with_bridge(config: SchedulerConfig) -> (Self, PipelineBridge) {
        let (bridge, msg_tx) = PipelineBridge::new();
        let metadata = Arc::new(InMemoryMetadataPool::new(0, config.queue_depth));
        let pipeline = Self::new(config, Arc::new(SoftwareFencePool::new()), metadata, msg_tx);
        (pipeline, bridge)
    }

    pub fn context(&self) -> &GraphContext {
        &self.ctx
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.ctx.config()
    }

    pub fn is_streaming(&self) -> bool {
        self.state == PipelineState::Streaming
    }

    pub fn node(&self, id: NodeId) -> PipelineResult<&NodeSlot> {
        self.ctx.node(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.ctx.nodes().iter().find(|n| n.name() == name).map(|n| n.id())
    }

    pub fn node_count(&self) -> usize {
        self.ctx.nodes().len()
    }

    /// Exclusive access to the graph; only possible while streams are off.
    fn graph_mut(&mut self) -> PipelineResult<&mut GraphContext> {
        if self.state == PipelineState::Streaming {
            return Err(PipelineError::Streaming);
        }
        Arc::get_mut(&mut self.ctx).ok_or(PipelineError::Streaming)
    }

    // ── Graph building ──

    /// Add a node to the pipeline. Returns its NodeId.
    pub fn add_node(&mut self, desc: NodeDescriptor, node: AnyNode) -> PipelineResult<NodeId> {
        let graph = self.graph_mut()?;
        let depth = graph.config().queue_depth;
        let id = NodeId(graph.nodes.len() as u32);
        if graph.nodes.iter().any(|n| n.name() == desc.name) {
            return Err(PipelineError::InvalidArgument(format!(
                "node name {} is already taken",
                desc.name
            )));
        }
        debug!("Adding node {} ({}) as {}", desc.name, node.type_name(), id);
        graph.nodes.push(NodeSlot::new(id, desc, node, depth));
        self.invalidate_plan();
        Ok(id)
    }

    /// Feed output port `from` into input port `to`. A loopback link reads
    /// the producer's output of the previous request.
    pub fn link(&mut self, from: PortId, to: PortId, loopback: bool) -> PipelineResult<()> {
        let graph = self.graph_mut()?;
        let producer = graph
            .nodes
            .get(from.node().index())
            .ok_or(PipelineError::UnknownNode(from.node()))?;
        if producer.outputs.get(from.index()).is_none() {
            return Err(PipelineError::UnknownPort(from));
        }
        let producer_secure = producer.flags.secure;
        let consumer = graph
            .nodes
            .get_mut(to.node().index())
            .ok_or(PipelineError::UnknownNode(to.node()))?;
        if producer_secure && !consumer.flags.secure {
            return Err(PipelineError::InvalidArgument(format!(
                "secure output {} cannot feed non-secure node {}",
                from, consumer.name
            )));
        }
        let input = consumer
            .inputs
            .get_mut(to.index())
            .ok_or(PipelineError::UnknownPort(to))?;
        if let Some(existing) = input.link {
            return Err(PipelineError::InvalidArgument(format!(
                "input {} is already fed by {}",
                to, existing.producer
            )));
        }
        input.link = Some(InputLink {
            producer: from,
            loopback,
        });
        graph.nodes[from.node().index()].outputs[from.index()]
            .consumers
            .push((to, loopback));
        self.invalidate_plan();
        Ok(())
    }

    fn invalidate_plan(&mut self) {
        self.state = PipelineState::Building;
        self.graph_generation += 1;
    }

    /// Compile the topology and negotiate every buffer. Fails on cycles and
    /// on unsatisfiable requirements; `FallbackToDefault` must be asked for
    /// explicitly.
    pub fn finalize(&mut self, mode: NegotiationMode) -> PipelineResult<()> {
        let generation = self.graph_generation;
        let graph = self.graph_mut()?;
        Self::recompile(graph, generation)?;
        let scope = NegotiationScope::full(&graph.plan);
        let buffers = graph.config().buffer_count();
        BufferNegotiator::negotiate(&mut graph.nodes, &scope, mode, buffers)?;

        if !self.created_notified {
            let graph = self.graph_mut()?;
            for slot in &mut graph.nodes {
                slot.derived
                    .get_mut()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .notify_pipeline_created();
            }
            self.created_notified = true;
        }
        self.negotiation_mode = mode;
        self.state = PipelineState::Finalized;
        info!(
            "Pipeline finalized: {} nodes, {} inactive ({:?} negotiation, gen {})",
            self.ctx.plan().stats.total_nodes,
            self.ctx.plan().stats.inactive_nodes,
            mode,
            generation
        );
        Ok(())
    }

    fn recompile(graph: &mut GraphContext, generation: u64) -> PipelineResult<()> {
        let plan = PipelineCompiler::compile(&mut graph.nodes, generation)?;
        debug!(
            "Pipeline recompiled: {} nodes, {} sources, {} sinks in {}us (gen {})",
            plan.stats.total_nodes,
            plan.stats.source_nodes,
            plan.stats.sink_nodes,
            plan.stats.compile_time_us,
            plan.generation
        );
        graph.plan = plan;
        Ok(())
    }

    /// Bind a HAL stream to an internal output port after finalize. The
    /// stream masks are propagated again and the port's node renegotiates
    /// together with its ancestors and descendants.
    pub fn attach_sink_stream(&mut self, port: PortId, stream: &StreamConfig) -> PipelineResult<()> {
        if self.state == PipelineState::Building {
            return Err(PipelineError::InvalidArgument(
                "attach a sink stream after finalize".to_string(),
            ));
        }
        let graph = self.graph_mut()?;
        let out = graph
            .nodes
            .get_mut(port.node().index())
            .and_then(|n| n.outputs.get_mut(port.index()))
            .ok_or(PipelineError::UnknownPort(port))?;
        if let Some(existing) = out.desc.sink {
            return Err(PipelineError::InvalidArgument(format!(
                "port {} already serves stream {:?}",
                port, existing.stream
            )));
        }
        out.desc.sink = Some(SinkStream {
            stream: stream.id,
            requirement: stream.requirement(),
        });
        info!("Stream {} ({}) attached to port {}", stream.name, stream.id.0, port);
        self.graph_generation += 1;
        let generation = self.graph_generation;
        Self::recompile(self.graph_mut()?, generation)?;
        self.trigger_buffer_negotiation(port.node())
    }

    /// Renegotiate around `node`: Walk 1 for it and its ancestors, Walk 2
    /// for those plus every descendant.
    pub fn trigger_buffer_negotiation(&mut self, node: NodeId) -> PipelineResult<()> {
        if self.state == PipelineState::Building {
            return Err(PipelineError::InvalidArgument(
                "renegotiation needs a finalized graph".to_string(),
            ));
        }
        let mode = self.negotiation_mode;
        let graph = self.graph_mut()?;
        graph.node(node)?;
        let scope = NegotiationScope::around(&graph.plan, node);
        let buffers = graph.config().buffer_count();
        BufferNegotiator::negotiate(&mut graph.nodes, &scope, mode, buffers)
    }

    // ── Stream lifecycle ──

    pub fn stream_on(&mut self) -> PipelineResult<()> {
        match self.state {
            PipelineState::Streaming => return Err(PipelineError::Streaming),
            PipelineState::Building => {
                return Err(PipelineError::InvalidArgument(
                    "finalize the pipeline before stream on".to_string(),
                ))
            }
            PipelineState::Finalized => {}
        }
        let stale = self.jobs_rx.try_iter().count();
        if stale > 0 {
            debug!("Dropped {} stale jobs", stale);
        }

        for id in self.ctx.plan().order() {
            let slot = self.ctx.node(*id)?;
            let mut node = lock(&slot.derived);
            node.acquire_resources()?;
            node.on_stream_on()?;
        }
        for slot in self.ctx.nodes() {
            for out in slot.outputs.iter().filter(|o| o.properties.is_some()) {
                out.buffers.activate()?;
            }
        }

        let config = self.ctx.config().clone();
        if config.worker_threads > 0 {
            let pool = WorkerPool::start(
                Arc::clone(&self.ctx),
                self.ctx.job_sender(),
                self.jobs_rx.clone(),
                config.worker_threads,
                config.fence_mode.poll_interval(),
                config.fence_timeout(),
            )
            .map_err(|e| PipelineError::ResourceExhausted(format!("worker threads: {}", e)))?;
            self.workers = Some(pool);
        }
        self.state = PipelineState::Streaming;
        info!(
            "Stream on: {} nodes, {} workers, {:?}",
            self.ctx.nodes().len(),
            config.worker_threads,
            config.fence_mode
        );
        Ok(())
    }

    /// Flush every outstanding request, stop the workers, then let every
    /// node stop and release. The first node error is returned after
    /// everything has been released.
    pub fn stream_off(&mut self, mode: DeactivateMode) -> PipelineResult<()> {
        if self.state != PipelineState::Streaming {
            return Err(PipelineError::NotStreaming);
        }
        let abandoned = self.ctx.abandon_preemptable();
        if !abandoned.is_empty() {
            debug!("Abandoned {} preemptable units", abandoned.len());
        }
        for request in self.ctx.in_flight() {
            self.flush(request)?;
        }

        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
        let drained = self.ctx.run_until_idle(&self.jobs_rx);
        if drained > 0 {
            debug!("Ran {} jobs left after stream off", drained);
        }

        let mut first_error = None;
        for id in self.ctx.plan().order().iter().rev() {
            let slot = self.ctx.node(*id)?;
            let mut node = lock(&slot.derived);
            let result = node
                .on_stream_off(mode)
                .and_then(|_| node.release_resources(mode));
            if let Err(e) = result {
                warn!("{} failed to stop: {}", slot.name(), e);
                first_error.get_or_insert(e);
            }
        }
        for slot in self.ctx.nodes() {
            slot.release_all_requests(&self.ctx);
            for out in &slot.outputs {
                out.buffers.deactivate();
            }
        }

        self.state = PipelineState::Finalized;
        let counters = self.ctx.counters();
        info!(
            "Stream off ({:?}): {} submitted, {} succeeded, {} failed, {} cancelled",
            mode, counters.submitted, counters.succeeded, counters.failed, counters.cancelled
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Requests ──

    /// Admit `request` into every node and start the enabled ones. A setup
    /// failure is returned here and the request is still reported as failed.
    pub fn process_request(&self, request: &CaptureRequest) -> PipelineResult<()> {
        if self.state != PipelineState::Streaming {
            return Err(PipelineError::NotStreaming);
        }
        let r = request.request_id;
        let context = RequestContext::from_capture(request);
        self.ctx.begin_tracking(&context)?;

        let metadata = self.ctx.metadata();
        metadata.invalidate(r);
        if !request.settings.is_empty() {
            metadata.write_data_list(self.ctx.pipeline_id(), r, &request.settings);
        }

        let mut enabled = Vec::new();
        for id in self.ctx.plan().order() {
            let slot = self.ctx.node(*id)?;
            match slot.setup_request(&self.ctx, &context) {
                Ok(true) => {
                    self.ctx.track_node(r, *id);
                    enabled.push(*id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Setup of request {} failed at {}: {}", r, slot.name(), e);
                    for done in enabled.iter().rev() {
                        self.ctx.node(*done)?.flush(&self.ctx, r);
                    }
                    self.ctx.record_failure(r, *id, FailureStage::Setup, e.to_string());
                    self.ctx.seal_tracking(r);
                    return Err(e);
                }
            }
        }
        self.ctx.seal_tracking(r);

        let tags: Vec<TagId> = request.settings.iter().map(|(t, _)| *t).collect();
        self.ctx.publish_properties(r, &tags);
        debug!("Request {} admitted to {} nodes", r, enabled.len());
        for node in enabled {
            self.ctx.dispatch(Job::Process { node, request: r });
        }
        Ok(())
    }

    /// Cancel `request` everywhere, sinks first. Flushing a request that is
    /// not in flight is a no-op.
    pub fn flush(&self, request: RequestId) -> PipelineResult<()> {
        if !self.ctx.is_in_flight(request) {
            debug!("Flush of request {} ignored; not in flight", request);
            return Ok(());
        }
        self.ctx.mark_cancelled(request);
        for id in self.ctx.plan().order().iter().rev() {
            self.ctx.node(*id)?.flush(&self.ctx, request);
        }
        info!("Request {} flushed", request);
        Ok(())
    }

    /// Drop every deferred unit of `node` for `request`. Idempotent.
    pub fn clear_dependencies(&self, node: NodeId, request: RequestId) -> PipelineResult<usize> {
        self.ctx.node(node)?;
        Ok(self.ctx.clear_dependencies(node, request))
    }

    /// Publish tags for `request` from outside the graph and wake the
    /// units waiting on them.
    pub fn publish_metadata(&self, request: RequestId, entries: &[(TagId, MetadataValue)]) {
        self.ctx
            .metadata()
            .write_data_list(self.ctx.pipeline_id(), request, entries);
        let tags: Vec<TagId> = entries.iter().map(|(t, _)| *t).collect();
        self.ctx.publish_properties(request, &tags);
    }

    /// Pump the job queue on the calling thread. The only way jobs run when
    /// `worker_threads` is 0.
    pub fn run_until_idle(&self) -> usize {
        self.ctx.run_until_idle(&self.jobs_rx)
    }

    // ── Introspection ──

    pub fn request_status(&self, node: NodeId, request: RequestId) -> PipelineResult<Option<PerRequestNodeStatus>> {
        Ok(self.ctx.node(node)?.request_status(request))
    }

    /// References held on the buffer `port` produced for `request`.
    pub fn output_buffer_ref_count(&self, port: PortId, request: RequestId) -> PipelineResult<Option<u32>> {
        let slot = self.ctx.node(port.node())?;
        Ok(slot.output_buffer_ref_count(&self.ctx, port.port_index(), request))
    }

    pub fn fence_errors(&self) -> Vec<FenceErrorEntry> {
        self.ctx.fence_errors()
    }

    /// The fence error window as pretty JSON, oldest first.
    pub fn fence_errors_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.ctx.fence_errors())
    }

    pub fn dump_fence_errors(&self) {
        self.ctx.dump_fence_errors();
    }

    pub fn stats(&self) -> PipelineStats {
        let pools = self
            .ctx
            .nodes()
            .iter()
            .flat_map(|n| n.outputs.iter().map(|o| (o.id, o.buffers.stats())))
            .collect();
        PipelineStats {
            plan: self.ctx.plan().stats.clone(),
            generation: self.ctx.plan().generation,
            requests: self.ctx.counters(),
            in_flight: self.ctx.in_flight().len(),
            deferred_units: self.ctx.deferred_units(),
            drq: self.ctx.drq_stats(),
            fence_errors_recorded: self.ctx.fence_errors_recorded(),
            pools,
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state == PipelineState::Streaming {
            if let Err(e) = self.stream_off(DeactivateMode::ReleaseAll) {
                warn!("Stream off on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bridge::RequestResult;
    use crate::pipeline::buffer::{Dimension, Format};
    use crate::pipeline::id::StreamId;
    use crate::pipeline::negotiation::BufferRequirement;
    use crate::pipeline::node::{BufferNegotiable, ExecuteContext, NodePlugin, RequestExecutable};
    use crate::pipeline::node_type::NodeKind;
    use crate::pipeline::port::{InputPortDesc, OutputPortDesc};
    use std::time::Duration;

    struct Passthrough;

    impl BufferNegotiable for Passthrough {}
    impl StreamLifecycle for Passthrough {}
    impl RequestExecutable for Passthrough {
        fn execute_process_request(&mut self, _ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
            Ok(())
        }
    }
    impl NodePlugin for Passthrough {
        fn type_name(&self) -> &str {
            "passthrough"
        }
    }

    fn plugin() -> AnyNode {
        AnyNode::Plugin(Box::new(Passthrough))
    }

    /// src → stage → sink(stream 0)
    fn linear() -> (Pipeline, PipelineBridge, [NodeId; 3]) {
        let (mut p, bridge) = Pipeline::with_bridge(SchedulerConfig::manual());
        let src = p
            .add_node(
                NodeDescriptor::new("src", NodeKind::Sensor)
                    .output(OutputPortDesc::new("out").format(Format::RawMipi10)),
                plugin(),
            )
            .unwrap();
        let stage = p
            .add_node(
                NodeDescriptor::new("stage", NodeKind::Ipe)
                    .input(InputPortDesc::new("in"))
                    .output(OutputPortDesc::new("out").format(Format::Nv12)),
                plugin(),
            )
            .unwrap();
        let sink = p
            .add_node(
                NodeDescriptor::new("sink", NodeKind::Sink)
                    .input(InputPortDesc::new("in"))
                    .output(OutputPortDesc::new("hal").sink(
                        StreamId(0),
                        BufferRequirement::exact(Dimension::new(640, 480)),
                    )),
                plugin(),
            )
            .unwrap();
        p.link(PortId::new(src, 0), PortId::new(stage, 0), false).unwrap();
        p.link(PortId::new(stage, 0), PortId::new(sink, 0), false).unwrap();
        (p, bridge, [src, stage, sink])
    }

    #[test]
    fn test_request_completes_in_manual_mode() {
        let (mut p, bridge, [src, _, sink]) = linear();
        p.finalize(NegotiationMode::Strict).unwrap();
        p.stream_on().unwrap();

        p.process_request(&CaptureRequest::new(0, [StreamId(0)])).unwrap();
        assert!(p.run_until_idle() > 0);

        assert_eq!(
            bridge.wait_for_request(0, Duration::from_millis(100)),
            Some(RequestResult::Success)
        );
        assert_eq!(p.request_status(sink, 0).unwrap(), Some(PerRequestNodeStatus::Success));
        assert_eq!(p.request_status(src, 0).unwrap(), Some(PerRequestNodeStatus::Success));
        let stats = p.stats();
        assert_eq!(stats.requests.succeeded, 1);
        assert_eq!(stats.in_flight, 0);
        p.stream_off(DeactivateMode::Default).unwrap();
    }

    #[test]
    fn test_graph_is_frozen_while_streaming() {
        let (mut p, _bridge, _) = linear();
        p.finalize(NegotiationMode::Strict).unwrap();
        p.stream_on().unwrap();
        let err = p.add_node(NodeDescriptor::new("late", NodeKind::Custom), plugin());
        assert_eq!(err, Err(PipelineError::Streaming));
        p.stream_off(DeactivateMode::ReleaseAll).unwrap();
        assert!(p.add_node(NodeDescriptor::new("late", NodeKind::Custom), plugin()).is_ok());
        // A new node needs a new finalize.
        assert!(p.stream_on().is_err());
    }

    #[test]
    fn test_link_rejects_second_producer() {
        let (mut p, _bridge, [src, stage, _]) = linear();
        let err = p.link(PortId::new(src, 0), PortId::new(stage, 0), false);
        assert!(matches!(err, Err(PipelineError::InvalidArgument(_))));
        let err = p.link(PortId::new(src, 3), PortId::new(stage, 0), false);
        assert_eq!(err, Err(PipelineError::UnknownPort(PortId::new(src, 3))));
    }

    #[test]
    fn test_secure_output_needs_secure_consumer() {
        let (mut p, _bridge) = Pipeline::with_bridge(SchedulerConfig::manual());
        let protected = p
            .add_node(
                NodeDescriptor::new("protected", NodeKind::Sensor)
                    .secure()
                    .output(OutputPortDesc::new("out").format(Format::Nv12)),
                plugin(),
            )
            .unwrap();
        let open = p
            .add_node(NodeDescriptor::new("open", NodeKind::Ipe).input(InputPortDesc::new("in")), plugin())
            .unwrap();
        let guarded = p
            .add_node(
                NodeDescriptor::new("guarded", NodeKind::Ipe).secure().input(InputPortDesc::new("in")),
                plugin(),
            )
            .unwrap();

        let err = p.link(PortId::new(protected, 0), PortId::new(open, 0), false);
        assert!(matches!(err, Err(PipelineError::InvalidArgument(m)) if m.contains("non-secure")));
        p.link(PortId::new(protected, 0), PortId::new(guarded, 0), false).unwrap();
    }

    #[test]
    fn test_request_without_streams_retires_at_once() {
        let (mut p, bridge, _) = linear();
        p.finalize(NegotiationMode::Strict).unwrap();
        p.stream_on().unwrap();
        p.process_request(&CaptureRequest::new(3, [StreamId(5)])).unwrap();
        assert_eq!(
            bridge.wait_for_request(3, Duration::from_millis(100)),
            Some(RequestResult::Success)
        );
        p.stream_off(DeactivateMode::Default).unwrap();
    }

    #[test]
    fn test_flush_of_unknown_request_is_noop() {
        let (mut p, _bridge, _) = linear();
        p.finalize(NegotiationMode::Strict).unwrap();
        p.stream_on().unwrap();
        assert!(p.flush(42).is_ok());
        assert!(p.flush(42).is_ok());
        assert_eq!(p.stats().requests.cancelled, 0);
    }

    #[test]
    fn test_requests_need_stream_on() {
        let (mut p, _bridge, _) = linear();
        p.finalize(NegotiationMode::Strict).unwrap();
        assert_eq!(
            p.process_request(&CaptureRequest::new(0, [StreamId(0)])),
            Err(PipelineError::NotStreaming)
        );
    }
}
