//! Test graph builders and a scripted test node

use camgraph::config::SchedulerConfig;
use camgraph::pipeline::{
    AnyNode, BufferNegotiable, BufferRequirement, DependencyUnit, Dimension, ExecuteContext,
    FenceHandle, FencePrimitive, Format, InMemoryMetadataPool, InputPortDesc, NegotiationMode,
    NodeDescriptor, NodeId, NodeKind, NodePlugin, OutputPortDesc, Pipeline, PipelineBridge,
    PipelineError, PipelineResult, PortId, PropertyRequirement, RequestExecutable, RequestId,
    SoftwareFencePool, StreamId, StreamLifecycle,
};
use std::sync::{Arc, Mutex};

/// `(request, sequence id)` of every execution of a scripted node.
pub type Invocations = Arc<Mutex<Vec<(RequestId, u32)>>>;

/// External fences a scripted node created, in creation order.
pub type ExternalFences = Arc<Mutex<Vec<FenceHandle>>>;

/// One port as a scripted node saw it during an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenPort {
    pub request: RequestId,
    pub port: u16,
    pub is_output: bool,
    pub loopback: bool,
    /// Id of the bound buffer, if any.
    pub buffer: Option<u32>,
    /// Request the bound buffer was acquired for.
    pub stamp: Option<RequestId>,
}

/// Every port of every execution of a scripted node.
pub type PortLog = Arc<Mutex<Vec<SeenPort>>>;

/// Sequence id a scripted node resumes at once its unit resolves.
pub const RESUME_SEQUENCE: u32 = 1;

/// Node whose dependency reporting is configured per test.
///
/// At sequence 0 it reports one unit (resume at `RESUME_SEQUENCE`) made of
/// whatever it was built with; with nothing configured it finishes at once.
#[derive(Default)]
pub struct ScriptedNode {
    invocations: Invocations,
    ports: Option<PortLog>,
    wait_inputs: bool,
    external: Option<ExternalFences>,
    property: Option<PropertyRequirement>,
    preemptable: bool,
    empty_unit: bool,
    fail_at: Option<u32>,
    double_submit: bool,
}

impl ScriptedNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recording(mut self, invocations: &Invocations) -> Self {
        self.invocations = Arc::clone(invocations);
        self
    }

    pub fn logging_ports(mut self, log: &PortLog) -> Self {
        self.ports = Some(Arc::clone(log));
        self
    }

    pub fn wait_inputs(mut self) -> Self {
        self.wait_inputs = true;
        self
    }

    pub fn external_fence(mut self, fences: &ExternalFences) -> Self {
        self.external = Some(Arc::clone(fences));
        self
    }

    pub fn property(mut self, requirement: PropertyRequirement) -> Self {
        self.property = Some(requirement);
        self
    }

    pub fn preemptable(mut self) -> Self {
        self.preemptable = true;
        self
    }

    /// Report a unit with no condition at all.
    pub fn empty_unit(mut self) -> Self {
        self.empty_unit = true;
        self
    }

    pub fn fail_at(mut self, sequence_id: u32) -> Self {
        self.fail_at = Some(sequence_id);
        self
    }

    /// Report the scheduler invariant breach a node must never cause.
    pub fn double_submit(mut self) -> Self {
        self.double_submit = true;
        self
    }

    pub fn into_node(self) -> AnyNode {
        AnyNode::Plugin(Box::new(self))
    }
}

impl BufferNegotiable for ScriptedNode {}
impl StreamLifecycle for ScriptedNode {}

impl RequestExecutable for ScriptedNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        let seq = ctx.sequence_id();
        self.invocations.lock().unwrap().push((ctx.request_id(), seq));
        if let Some(log) = &self.ports {
            let request = ctx.request_id();
            let mut log = log.lock().unwrap();
            for i in ctx.inputs() {
                log.push(SeenPort {
                    request,
                    port: i.port_index,
                    is_output: false,
                    loopback: i.loopback,
                    buffer: i.buffer.as_ref().map(|b| b.id()),
                    stamp: i.buffer.as_ref().and_then(|b| b.stamp()),
                });
            }
            for o in ctx.outputs() {
                log.push(SeenPort {
                    request,
                    port: o.port_index,
                    is_output: true,
                    loopback: false,
                    buffer: o.buffer.as_ref().map(|b| b.id()),
                    stamp: o.buffer.as_ref().and_then(|b| b.stamp()),
                });
            }
        }

        if self.double_submit {
            return Err(PipelineError::DoubleSubmission {
                node: ctx.node(),
                request: ctx.request_id(),
            });
        }
        if self.fail_at == Some(seq) {
            return Err(PipelineError::InvalidArgument(format!("scripted failure at seq {}", seq)));
        }
        if seq != 0 {
            return Ok(());
        }
        if self.empty_unit {
            ctx.report_dependency(DependencyUnit::builder(RESUME_SEQUENCE).build()?);
            return Ok(());
        }

        let mut unit = if self.wait_inputs {
            ctx.input_dependency(RESUME_SEQUENCE)
        } else {
            DependencyUnit::builder(RESUME_SEQUENCE)
        };
        if let Some(fences) = &self.external {
            let fence = ctx.fence_provider().create("scripted:external")?;
            fences.lock().unwrap().push(fence);
            unit = unit.external_fence(fence);
        }
        if let Some(requirement) = self.property {
            unit = unit.property(requirement);
        }
        if self.preemptable {
            unit = unit.preemptable();
        }
        let unit = unit.build()?;
        if unit.has_any_dependency() {
            ctx.report_dependency(unit);
        }
        Ok(())
    }
}

impl NodePlugin for ScriptedNode {
    fn type_name(&self) -> &str {
        "scripted"
    }
}

/// Manual-mode pipeline on a fence pool the test can signal directly.
pub fn manual_pipeline(config: SchedulerConfig) -> (Pipeline, PipelineBridge, Arc<SoftwareFencePool>) {
    let fences = Arc::new(SoftwareFencePool::new());
    let (bridge, msg_tx) = PipelineBridge::new();
    let metadata = Arc::new(InMemoryMetadataPool::new(0, config.queue_depth));
    let provider: Arc<dyn FencePrimitive> = fences.clone();
    let pipeline = Pipeline::new(config, provider, metadata, msg_tx);
    (pipeline, bridge, fences)
}

pub fn source(name: &str) -> NodeDescriptor {
    NodeDescriptor::new(name, NodeKind::Sensor).output(OutputPortDesc::new("out").format(Format::Nv12))
}

pub fn stage(name: &str, kind: NodeKind) -> NodeDescriptor {
    NodeDescriptor::new(name, kind)
        .input(InputPortDesc::new("in"))
        .output(OutputPortDesc::new("out").format(Format::Nv12))
}

/// A sink serving `stream` at `width` x `height`.
pub fn sink(name: &str, stream: u32, width: u32, height: u32) -> NodeDescriptor {
    NodeDescriptor::new(name, NodeKind::Sink)
        .input(InputPortDesc::new("in"))
        .output(OutputPortDesc::new("hal").sink(
            StreamId(stream),
            BufferRequirement::exact(Dimension::new(width, height)),
        ))
}

pub fn link(pipeline: &mut Pipeline, from: NodeId, to: NodeId) {
    pipeline
        .link(PortId::new(from, 0), PortId::new(to, 0), false)
        .unwrap();
}

/// Builder for `source -> middle -> sink(stream 0)` graphs.
pub struct LinearGraphBuilder {
    config: SchedulerConfig,
    source: AnyNode,
    middle: AnyNode,
    middle_desc: NodeDescriptor,
    sink: AnyNode,
}

impl LinearGraphBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::manual(),
            source: ScriptedNode::new().into_node(),
            middle: ScriptedNode::new().wait_inputs().into_node(),
            middle_desc: stage("middle", NodeKind::Ipe),
            sink: ScriptedNode::new().wait_inputs().into_node(),
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn source(mut self, node: AnyNode) -> Self {
        self.source = node;
        self
    }

    pub fn middle(mut self, desc: NodeDescriptor, node: AnyNode) -> Self {
        self.middle_desc = desc;
        self.middle = node;
        self
    }

    pub fn sink(mut self, node: AnyNode) -> Self {
        self.sink = node;
        self
    }

    /// The finalized pipeline, its bridge, its fences and `[source, middle, sink]`.
    pub fn build(self) -> (Pipeline, PipelineBridge, Arc<SoftwareFencePool>, [NodeId; 3]) {
        let (mut p, bridge, fences) = manual_pipeline(self.config);
        let a = p.add_node(source("source"), self.source).unwrap();
        let b = p.add_node(self.middle_desc, self.middle).unwrap();
        let c = p.add_node(sink("sink", 0, 640, 480), self.sink).unwrap();
        link(&mut p, a, b);
        link(&mut p, b, c);
        p.finalize(NegotiationMode::Strict).unwrap();
        p.stream_on().unwrap();
        (p, bridge, fences, [a, b, c])
    }
}

impl Default for LinearGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_builder() {
        let invocations = Invocations::default();
        let node = ScriptedNode::new().recording(&invocations).wait_inputs().fail_at(2);
        assert!(node.wait_inputs);
        assert_eq!(node.fail_at, Some(2));
        assert!(Arc::ptr_eq(&node.invocations, &invocations));
    }
}
