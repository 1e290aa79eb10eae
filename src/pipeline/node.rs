//! Node abstraction for the pipeline.
//!
//! Two-layer design:
//! - **Capability traits**: `BufferNegotiable`, `RequestExecutable` and
//!   `StreamLifecycle`. The scheduler only ever calls these.
//! - **`BuiltinNode` enum**: all built-in nodes. The compiler can inline
//!   match arms, eliminating dynamic dispatch on the hot path.
//!
//! `AnyNode` wraps either a built-in node or a `NodePlugin` trait object so
//! the pipeline can handle both uniformly.

use crate::pipeline::buffer::{BufferProperties, ImageBuffer};
use crate::pipeline::context::RequestContext;
use crate::pipeline::dependency::{DependencyUnit, DependencyUnitBuilder};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::{FencePrimitive, FenceResult, FenceStatus};
use crate::pipeline::id::{FenceHandle, NodeId, PortId, RequestId, TagId};
use crate::pipeline::metadata::{MetadataPool, MetadataValue, TagQuery};
use crate::pipeline::negotiation::{
    default_finalize_buffer_properties, default_finalize_input_requirement, BufferNegotiationData,
};
use crate::pipeline::nodes::{BypassNode, SensorNode, SinkNode, StageNode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How far `StreamLifecycle::on_stream_off` / `release_resources` go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeactivateMode {
    /// Stop processing; keep hardware resources for a quick restart.
    #[default]
    Default,
    /// Stop and release everything, as for pipeline teardown.
    ReleaseAll,
}

/// An input port as seen by derived logic for one request.
#[derive(Debug, Clone)]
pub struct InputView {
    pub port_index: u16,
    pub producer: PortId,
    /// `None` once the producing request has been retired.
    pub fence: Option<FenceHandle>,
    /// `None` while the producer's buffer is still delayed.
    pub buffer: Option<Arc<ImageBuffer>>,
    pub properties: Option<BufferProperties>,
    pub loopback: bool,
}

/// An output port as seen by derived logic for one request.
#[derive(Debug, Clone)]
pub struct OutputView {
    pub port_index: u16,
    pub fence: FenceHandle,
    pub buffer: Option<Arc<ImageBuffer>>,
    pub properties: Option<BufferProperties>,
    pub is_sink: bool,
}

/// Everything derived logic may touch while executing one step of a request.
pub struct ExecuteContext<'a> {
    request: &'a RequestContext,
    node: NodeId,
    node_name: &'a str,
    sequence_id: u32,
    pipeline_id: u32,
    inputs: Vec<InputView>,
    outputs: Vec<OutputView>,
    fences: &'a Arc<dyn FencePrimitive>,
    metadata: &'a dyn MetadataPool,
    pub(crate) dependencies: Vec<DependencyUnit>,
    pub(crate) published: Vec<TagId>,
    pub(crate) submitted: bool,
    pub(crate) partial_metadata_done: bool,
    pub(crate) metadata_done: bool,
    signaled: Vec<FenceHandle>,
}

impl<'a> ExecuteContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        request: &'a RequestContext,
        node: NodeId,
        node_name: &'a str,
        sequence_id: u32,
        pipeline_id: u32,
        inputs: Vec<InputView>,
        outputs: Vec<OutputView>,
        fences: &'a Arc<dyn FencePrimitive>,
        metadata: &'a dyn MetadataPool,
    ) -> Self {
        Self {
            request,
            node,
            node_name,
            sequence_id,
            pipeline_id,
            inputs,
            outputs,
            fences,
            metadata,
            dependencies: Vec::new(),
            published: Vec::new(),
            submitted: false,
            partial_metadata_done: false,
            metadata_done: false,
            signaled: Vec::new(),
        }
    }

    pub fn request(&self) -> &RequestContext {
        self.request
    }

    pub fn request_id(&self) -> RequestId {
        self.request.request_id
    }

    /// 0 on the first invocation, otherwise the `process_sequence_id` of the
    /// dependency unit that just resolved.
    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn node_name(&self) -> &str {
        self.node_name
    }

    pub fn inputs(&self) -> &[InputView] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputView] {
        &self.outputs
    }

    /// Fences guarding inputs that are still pending or whose producer
    /// failed. A failed fence in a unit fails the resume as upstream; a
    /// failed loopback fence only means the previous frame is unusable.
    pub fn pending_input_fences(&self) -> Vec<FenceHandle> {
        let mut out: Vec<FenceHandle> = self
            .inputs
            .iter()
            .filter_map(|i| Some((i.fence?, i.loopback)))
            .filter(|(f, loopback)| match self.fences.status(*f) {
                Ok(FenceStatus::Pending) => true,
                Ok(FenceStatus::Signaled(result)) => !*loopback && !result.is_success(),
                Err(_) => false,
            })
            .map(|(f, _)| f)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// A unit builder already holding every pending input fence.
    pub fn input_dependency(&self, process_sequence_id: u32) -> DependencyUnitBuilder {
        self.pending_input_fences()
            .into_iter()
            .fold(DependencyUnit::builder(process_sequence_id), |b, f| b.buffer_fence(f))
    }

    /// Defer the rest of this request until `unit` resolves.
    pub fn report_dependency(&mut self, unit: DependencyUnit) {
        self.dependencies.push(unit);
    }

    pub fn get_data_list(&self, queries: &[TagQuery]) -> Vec<Option<MetadataValue>> {
        self.metadata
            .get_data_list(self.pipeline_id, self.request.request_id, queries)
    }

    pub fn write_data_list(&mut self, entries: &[(TagId, MetadataValue)]) {
        self.metadata
            .write_data_list(self.pipeline_id, self.request.request_id, entries);
        self.published.extend(entries.iter().map(|(t, _)| *t));
    }

    pub fn mark_partial_metadata_done(&mut self) {
        self.partial_metadata_done = true;
    }

    pub fn mark_metadata_done(&mut self) {
        self.metadata_done = true;
    }

    /// The outputs were handed to a hardware queue that will signal them.
    pub fn mark_submitted(&mut self) {
        self.submitted = true;
    }

    pub fn fence_provider(&self) -> Arc<dyn FencePrimitive> {
        Arc::clone(self.fences)
    }

    /// Distinct output fences not yet signaled.
    pub fn unsignaled_output_fences(&self) -> Vec<FenceHandle> {
        let mut out = Vec::new();
        for o in &self.outputs {
            if out.contains(&o.fence) || self.signaled.contains(&o.fence) {
                continue;
            }
            if matches!(self.fences.status(o.fence), Ok(FenceStatus::Pending)) {
                out.push(o.fence);
            }
        }
        out
    }

    /// Signal one output. Ports sharing a composite fence are signaled
    /// together; signaling the group twice is a no-op.
    pub fn signal_output(&mut self, port_index: u16, result: FenceResult) -> PipelineResult<()> {
        let Some(fence) = self
            .outputs
            .iter()
            .find(|o| o.port_index == port_index)
            .map(|o| o.fence)
        else {
            return Err(PipelineError::InvalidArgument(format!(
                "{} has no active output {} for request {}",
                self.node_name, port_index, self.request.request_id
            )));
        };
        if self.signaled.contains(&fence) {
            return Ok(());
        }
        self.fences.signal(fence, result)?;
        self.signaled.push(fence);
        Ok(())
    }

    pub fn signal_all_outputs(&mut self, result: FenceResult) -> PipelineResult<()> {
        for fence in self.unsignaled_output_fences() {
            self.fences.signal(fence, result)?;
            self.signaled.push(fence);
        }
        Ok(())
    }
}

/// Buffer negotiation hooks. The defaults implement the generic protocol.
pub trait BufferNegotiable {
    /// Walk 1: derive, per input, what to ask of the producer.
    fn finalize_input_requirement(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        default_finalize_input_requirement(data)
    }

    /// Walk 2: fix the output buffer properties from the resolved inputs.
    fn finalize_buffer_properties(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        default_finalize_buffer_properties(data)
    }
}

/// Per-request processing.
pub trait RequestExecutable {
    /// Run one step of a request. Report dependency units through the
    /// context to be re-invoked later; return with none to finish.
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()>;

    /// Bypassable nodes elect, per request, to forward their input.
    fn elects_bypass(&mut self, _request: &RequestContext) -> bool {
        false
    }

    /// A fence of this node's request signaled with an error.
    fn notify_request_processing_error(
        &mut self,
        _request: RequestId,
        _fence: FenceHandle,
        _result: FenceResult,
    ) {
    }
}

/// Stream lifecycle hooks.
pub trait StreamLifecycle {
    fn notify_pipeline_created(&mut self) {}

    fn acquire_resources(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    fn release_resources(&mut self, _mode: DeactivateMode) -> PipelineResult<()> {
        Ok(())
    }

    fn on_stream_on(&mut self) -> PipelineResult<()> {
        Ok(())
    }

    fn on_stream_off(&mut self, _mode: DeactivateMode) -> PipelineResult<()> {
        Ok(())
    }
}

/// Trait for pluggable/user-defined nodes.
pub trait NodePlugin: BufferNegotiable + RequestExecutable + StreamLifecycle + Send {
    /// Human-readable type name of this node.
    fn type_name(&self) -> &str;
}

/// Enum dispatch for built-in nodes.
pub enum BuiltinNode {
    Sensor(SensorNode),
    Stage(StageNode),
    Bypass(BypassNode),
    Sink(SinkNode),
}

impl BuiltinNode {
    pub fn type_name(&self) -> &str {
        match self {
            BuiltinNode::Sensor(_) => "sensor",
            BuiltinNode::Stage(n) => n.kind().display_name(),
            BuiltinNode::Bypass(_) => "bypass",
            BuiltinNode::Sink(_) => "sink",
        }
    }
}

impl BufferNegotiable for BuiltinNode {
    fn finalize_input_requirement(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.finalize_input_requirement(data),
            BuiltinNode::Stage(n) => n.finalize_input_requirement(data),
            BuiltinNode::Bypass(n) => n.finalize_input_requirement(data),
            BuiltinNode::Sink(n) => n.finalize_input_requirement(data),
        }
    }

    fn finalize_buffer_properties(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.finalize_buffer_properties(data),
            BuiltinNode::Stage(n) => n.finalize_buffer_properties(data),
            BuiltinNode::Bypass(n) => n.finalize_buffer_properties(data),
            BuiltinNode::Sink(n) => n.finalize_buffer_properties(data),
        }
    }
}

impl RequestExecutable for BuiltinNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.execute_process_request(ctx),
            BuiltinNode::Stage(n) => n.execute_process_request(ctx),
            BuiltinNode::Bypass(n) => n.execute_process_request(ctx),
            BuiltinNode::Sink(n) => n.execute_process_request(ctx),
        }
    }

    fn elects_bypass(&mut self, request: &RequestContext) -> bool {
        match self {
            BuiltinNode::Bypass(n) => n.elects_bypass(request),
            _ => false,
        }
    }

    fn notify_request_processing_error(
        &mut self,
        request: RequestId,
        fence: FenceHandle,
        result: FenceResult,
    ) {
        match self {
            BuiltinNode::Sensor(n) => n.notify_request_processing_error(request, fence, result),
            BuiltinNode::Stage(n) => n.notify_request_processing_error(request, fence, result),
            BuiltinNode::Bypass(n) => n.notify_request_processing_error(request, fence, result),
            BuiltinNode::Sink(n) => n.notify_request_processing_error(request, fence, result),
        }
    }
}

impl StreamLifecycle for BuiltinNode {
    fn notify_pipeline_created(&mut self) {
        match self {
            BuiltinNode::Sensor(n) => n.notify_pipeline_created(),
            BuiltinNode::Stage(n) => n.notify_pipeline_created(),
            BuiltinNode::Bypass(n) => n.notify_pipeline_created(),
            BuiltinNode::Sink(n) => n.notify_pipeline_created(),
        }
    }

    fn acquire_resources(&mut self) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.acquire_resources(),
            BuiltinNode::Stage(n) => n.acquire_resources(),
            BuiltinNode::Bypass(n) => n.acquire_resources(),
            BuiltinNode::Sink(n) => n.acquire_resources(),
        }
    }

    fn release_resources(&mut self, mode: DeactivateMode) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.release_resources(mode),
            BuiltinNode::Stage(n) => n.release_resources(mode),
            BuiltinNode::Bypass(n) => n.release_resources(mode),
            BuiltinNode::Sink(n) => n.release_resources(mode),
        }
    }

    fn on_stream_on(&mut self) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.on_stream_on(),
            BuiltinNode::Stage(n) => n.on_stream_on(),
            BuiltinNode::Bypass(n) => n.on_stream_on(),
            BuiltinNode::Sink(n) => n.on_stream_on(),
        }
    }

    fn on_stream_off(&mut self, mode: DeactivateMode) -> PipelineResult<()> {
        match self {
            BuiltinNode::Sensor(n) => n.on_stream_off(mode),
            BuiltinNode::Stage(n) => n.on_stream_off(mode),
            BuiltinNode::Bypass(n) => n.on_stream_off(mode),
            BuiltinNode::Sink(n) => n.on_stream_off(mode),
        }
    }
}

/// Wrapper that holds either a built-in node (enum dispatch) or a plugin (trait object).
pub enum AnyNode {
    Builtin(BuiltinNode),
    Plugin(Box<dyn NodePlugin>),
}

impl AnyNode {
    pub fn type_name(&self) -> &str {
        match self {
            AnyNode::Builtin(n) => n.type_name(),
            AnyNode::Plugin(n) => n.type_name(),
        }
    }
}

impl From<BuiltinNode> for AnyNode {
    fn from(node: BuiltinNode) -> Self {
        AnyNode::Builtin(node)
    }
}

impl BufferNegotiable for AnyNode {
    fn finalize_input_requirement(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.finalize_input_requirement(data),
            AnyNode::Plugin(n) => n.finalize_input_requirement(data),
        }
    }

    fn finalize_buffer_properties(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.finalize_buffer_properties(data),
            AnyNode::Plugin(n) => n.finalize_buffer_properties(data),
        }
    }
}

impl RequestExecutable for AnyNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.execute_process_request(ctx),
            AnyNode::Plugin(n) => n.execute_process_request(ctx),
        }
    }

    fn elects_bypass(&mut self, request: &RequestContext) -> bool {
        match self {
            AnyNode::Builtin(n) => n.elects_bypass(request),
            AnyNode::Plugin(n) => n.elects_bypass(request),
        }
    }

    fn notify_request_processing_error(
        &mut self,
        request: RequestId,
        fence: FenceHandle,
        result: FenceResult,
    ) {
        match self {
            AnyNode::Builtin(n) => n.notify_request_processing_error(request, fence, result),
            AnyNode::Plugin(n) => n.notify_request_processing_error(request, fence, result),
        }
    }
}

impl StreamLifecycle for AnyNode {
    fn notify_pipeline_created(&mut self) {
        match self {
            AnyNode::Builtin(n) => n.notify_pipeline_created(),
            AnyNode::Plugin(n) => n.notify_pipeline_created(),
        }
    }

    fn acquire_resources(&mut self) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.acquire_resources(),
            AnyNode::Plugin(n) => n.acquire_resources(),
        }
    }

    fn release_resources(&mut self, mode: DeactivateMode) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.release_resources(mode),
            AnyNode::Plugin(n) => n.release_resources(mode),
        }
    }

    fn on_stream_on(&mut self) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.on_stream_on(),
            AnyNode::Plugin(n) => n.on_stream_on(),
        }
    }

    fn on_stream_off(&mut self, mode: DeactivateMode) -> PipelineResult<()> {
        match self {
            AnyNode::Builtin(n) => n.on_stream_off(mode),
            AnyNode::Plugin(n) => n.on_stream_off(mode),
        }
    }
}
