//! Node slots: one arena entry per node.
//!
//! A `NodeSlot` owns the node's ports, the derived node behind its execution
//! lock, the ring of per-request status and the per-request port bindings.
//! This module covers construction, per-request setup, slot recycling and
//! retirement. Execution, completion and forwarding live in their own
//! modules as further `impl NodeSlot` blocks.
//!
//! Lock discipline: a thread never holds two nodes' `request_state` locks at
//! once. Calls into a producer happen with the consumer's state unlocked.

use crate::pipeline::buffer::{BufferProperties, ImageBuffer};
use crate::pipeline::composite::CompositePortFenceInfo;
use crate::pipeline::context::{GraphContext, RequestContext};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::{FenceCallback, FenceResult};
use crate::pipeline::id::{FenceHandle, NodeId, PortId, RequestId};
use crate::pipeline::lock;
use crate::pipeline::node::AnyNode;
use crate::pipeline::node_type::NodeKind;
use crate::pipeline::port::{InputPort, InputPortDesc, OutputPort, OutputPortDesc, StreamMask};
use crate::pipeline::request::{PerRequestNodeStatus, RequestRing};
use crate::pipeline::worker::{FenceCallbackData, Job};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Static node flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFlags {
    /// Disabled nodes are set up idle for every request.
    pub enabled: bool,
    /// Always forwards its input buffer as its output, then runs.
    pub in_place: bool,
    /// Must preserve submission order on its hardware queue. Its deferred
    /// units are never abandoned, only flushed.
    pub real_time: bool,
    /// May elect, per request, to forward its input and skip execution.
    pub bypassable: bool,
    /// Produces protected content; only secure nodes may consume it.
    pub secure: bool,
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            in_place: false,
            real_time: false,
            bypassable: false,
            secure: false,
        }
    }
}

impl NodeFlags {
    /// Outputs are bound late because the buffer may come from an ancestor.
    pub fn forwards_input(&self) -> bool {
        self.in_place || self.bypassable
    }
}

/// Everything needed to add a node to a pipeline.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub name: String,
    pub kind: NodeKind,
    pub flags: NodeFlags,
    pub inputs: Vec<InputPortDesc>,
    pub outputs: Vec<OutputPortDesc>,
    /// Overrides the pipeline's flush bound for this node.
    pub worst_case_response: Option<Duration>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            flags: NodeFlags::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            worst_case_response: None,
        }
    }

    pub fn input(mut self, port: InputPortDesc) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: OutputPortDesc) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn flags(mut self, flags: NodeFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn bypassable(mut self) -> Self {
        self.flags.bypassable = true;
        self
    }

    pub fn in_place(mut self) -> Self {
        self.flags.in_place = true;
        self
    }

    pub fn real_time(mut self) -> Self {
        self.flags.real_time = true;
        self
    }

    pub fn secure(mut self) -> Self {
        self.flags.secure = true;
        self
    }

    pub fn worst_case_response(mut self, bound: Duration) -> Self {
        self.worst_case_response = Some(bound);
        self
    }
}

/// Binds one fence to the output ports it guards for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFenceHandlerData {
    pub fence: FenceHandle,
    pub ports: Vec<u16>,
    /// Set when the fence callback has been processed.
    pub result: Option<FenceResult>,
}

/// Late-bound output of a forwarding node.
#[derive(Debug, Clone, Default)]
pub(crate) struct DelayedOutputBufferInfo {
    /// Consumers bound before the buffer was known. Each gets one reference
    /// once it is.
    pub(crate) consumers_attached: u32,
    /// The buffer consumers read: an ancestor's when bypassing, otherwise
    /// the node's own.
    pub(crate) resolved: Option<Arc<ImageBuffer>>,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputBinding {
    pub(crate) fence: FenceHandle,
    /// Buffer acquired from this port's own pool; holds one reference.
    pub(crate) buffer: Option<Arc<ImageBuffer>>,
    pub(crate) delayed: Option<DelayedOutputBufferInfo>,
}

impl OutputBinding {
    /// What a consumer of this port reads.
    pub(crate) fn consumer_buffer(&self) -> Option<Arc<ImageBuffer>> {
        match &self.delayed {
            Some(d) => d.resolved.clone(),
            None => self.buffer.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct InputBinding {
    pub(crate) port_index: u16,
    pub(crate) producer: PortId,
    /// `r`, or `r - 1` for a loopback input.
    pub(crate) producer_request: RequestId,
    /// `None` when the producing request had already retired.
    pub(crate) fence: Option<FenceHandle>,
    pub(crate) buffer: Option<Arc<ImageBuffer>>,
    pub(crate) properties: Option<BufferProperties>,
    /// The producer's buffer was not known at setup.
    pub(crate) pending: bool,
    pub(crate) loopback: bool,
    pub(crate) consumed: bool,
}

/// Per-request port state of one node.
#[derive(Debug, Default)]
pub(crate) struct RequestPorts {
    pub(crate) request: Option<RequestContext>,
    pub(crate) inputs: Vec<InputBinding>,
    /// Indexed by output port; `None` for ports inactive this request.
    pub(crate) outputs: Vec<Option<OutputBinding>>,
    pub(crate) composites: Vec<CompositePortFenceInfo>,
    pub(crate) handlers: Vec<NodeFenceHandlerData>,
    pub(crate) bypassed: bool,
    pub(crate) retired: bool,
}

impl RequestPorts {
    fn for_request(request: &RequestContext, outputs: usize) -> Self {
        Self {
            request: Some(request.clone()),
            outputs: vec![None; outputs],
            ..Self::default()
        }
    }

    pub(crate) fn holds(&self, request: RequestId) -> bool {
        self.request.as_ref().is_some_and(|r| r.request_id == request)
    }

    pub(crate) fn output(&self, port: u16) -> Option<&OutputBinding> {
        self.outputs.get(port as usize).and_then(|o| o.as_ref())
    }

    pub(crate) fn output_mut(&mut self, port: u16) -> Option<&mut OutputBinding> {
        self.outputs.get_mut(port as usize).and_then(|o| o.as_mut())
    }

    /// Distinct output fences, one per composite group.
    pub(crate) fn output_fences(&self) -> Vec<FenceHandle> {
        self.handlers.iter().map(|h| h.fence).collect()
    }
}

/// What a producer hands a consumer binding to one of its outputs.
#[derive(Debug, Clone)]
pub(crate) struct ProducerGrant {
    pub(crate) fence: Option<FenceHandle>,
    pub(crate) buffer: Option<Arc<ImageBuffer>>,
    pub(crate) properties: Option<BufferProperties>,
    pub(crate) pending: bool,
}

pub struct NodeSlot {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) flags: NodeFlags,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    /// Execution lock. Every status transition happens under it.
    pub(crate) derived: Mutex<AnyNode>,
    pub(crate) ring: RequestRing,
    request_state: Box<[Mutex<RequestPorts>]>,
    worst_case_response: Option<Duration>,
}

impl NodeSlot {
    pub(crate) fn new(id: NodeId, desc: NodeDescriptor, node: AnyNode, queue_depth: usize) -> Self {
        let inputs = desc
            .inputs
            .into_iter()
            .enumerate()
            .map(|(i, d)| InputPort::new(PortId::new(id, i as u16), d))
            .collect();
        let outputs = desc
            .outputs
            .into_iter()
            .enumerate()
            .map(|(i, d)| OutputPort::new(PortId::new(id, i as u16), d))
            .collect();
        let ring = RequestRing::new(id, queue_depth);
        let request_state = (0..ring.depth())
            .map(|_| Mutex::new(RequestPorts::default()))
            .collect();
        Self {
            id,
            name: desc.name,
            kind: desc.kind,
            flags: desc.flags,
            inputs,
            outputs,
            derived: Mutex::new(node),
            ring,
            request_state,
            worst_case_response: desc.worst_case_response,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn type_name(&self) -> String {
        lock(&self.derived).type_name().to_string()
    }

    pub fn worst_case_response(&self) -> Option<Duration> {
        self.worst_case_response
    }

    /// Union of the streams served by this node's outputs.
    pub fn stream_mask(&self) -> StreamMask {
        self.outputs
            .iter()
            .fold(StreamMask::EMPTY, |m, o| m.union(o.stream_mask))
    }

    pub fn request_status(&self, request: RequestId) -> Option<PerRequestNodeStatus> {
        self.ring.get(request).map(|info| info.status())
    }

    pub(crate) fn state(&self, request: RequestId) -> &Mutex<RequestPorts> {
        &self.request_state[self.ring.slot_index(request)]
    }

    fn enabled_for(&self, streams: StreamMask) -> bool {
        self.flags.enabled
            && (self.outputs.is_empty() || self.outputs.iter().any(|o| o.enabled_for(streams)))
    }

    // ── Setup ──

    /// Admit `request`: recycle the ring slot, bind an output buffer and
    /// fence per active port and bind every input to its producer. Returns
    /// whether the node is enabled for the request.
    pub(crate) fn setup_request(&self, ctx: &GraphContext, request: &RequestContext) -> PipelineResult<bool> {
        let r = request.request_id;
        let info = self.ring.slot(r);
        if let Some(previous) = info.request_id() {
            if previous == r {
                return Err(PipelineError::InvalidArgument(format!(
                    "{} already holds request {}",
                    self.name, r
                )));
            }
            if !info.is_complete() {
                return Err(PipelineError::ResourceExhausted(format!(
                    "{} ring slot for request {} still busy with request {}",
                    self.name, r, previous
                )));
            }
            self.recycle(ctx, r);
        }

        if !self.enabled_for(request.streams) {
            *lock(self.state(r)) = RequestPorts::for_request(request, self.outputs.len());
            info.reset_for(r, false, 0);
            debug!("{} idle for request {}", self.name, r);
            return Ok(false);
        }

        let mut ports = RequestPorts::for_request(request, self.outputs.len());
        let bound = self
            .bind_outputs(ctx, request, &mut ports)
            .and_then(|_| self.bind_inputs(ctx, r, &mut ports));
        if let Err(e) = bound {
            self.release_ports(ctx, ports);
            return Err(e);
        }

        let fences = ports.output_fences();
        *lock(self.state(r)) = ports;
        info.reset_for(r, true, fences.len() as u32);
        for fence in fences {
            self.watch_output_fence(ctx, r, fence);
        }
        debug!("{} set up for request {}", self.name, r);
        Ok(true)
    }

    fn bind_outputs(&self, ctx: &GraphContext, request: &RequestContext, ports: &mut RequestPorts) -> PipelineResult<()> {
        let r = request.request_id;
        let mut groups: Vec<(Option<u32>, Vec<u16>)> = Vec::new();
        for port in self.outputs.iter().filter(|o| o.enabled_for(request.streams)) {
            let idx = port.id.port_index();
            match port.desc.composite_group {
                Some(g) => match groups.iter_mut().find(|(k, _)| *k == Some(g)) {
                    Some((_, members)) => members.push(idx),
                    None => groups.push((Some(g), vec![idx])),
                },
                None => groups.push((None, vec![idx])),
            }
        }

        for (group, members) in groups {
            let label = match group {
                Some(g) => format!("{}:group{}:r{}", self.name, g, r),
                None => format!("{}:{}:r{}", self.name, self.outputs[members[0] as usize].desc.name, r),
            };
            let fence = ctx.fences().create(&label)?;
            ports
                .composites
                .push(CompositePortFenceInfo::new(fence, group, members.clone()));
            ports.handlers.push(NodeFenceHandlerData {
                fence,
                ports: members.clone(),
                result: None,
            });
            for idx in members {
                let binding = if self.flags.forwards_input() {
                    OutputBinding {
                        fence,
                        buffer: None,
                        delayed: Some(DelayedOutputBufferInfo::default()),
                    }
                } else {
                    OutputBinding {
                        fence,
                        buffer: Some(self.outputs[idx as usize].buffers.acquire(r)?),
                        delayed: None,
                    }
                };
                ports.outputs[idx as usize] = Some(binding);
            }
        }
        Ok(())
    }

    fn bind_inputs(&self, ctx: &GraphContext, r: RequestId, ports: &mut RequestPorts) -> PipelineResult<()> {
        for input in &self.inputs {
            let Some(link) = input.link else {
                continue;
            };
            let producer_request = if link.loopback {
                match r.checked_sub(1) {
                    Some(p) => p,
                    None => continue,
                }
            } else {
                r
            };
            let producer = ctx.node(link.producer.node())?;
            let Some(grant) = producer.add_consumer_reference(ctx, link.producer.port_index(), producer_request)?
            else {
                debug!(
                    "{} input {} has no active producer for request {}",
                    self.name, input.desc.name, producer_request
                );
                continue;
            };
            ports.inputs.push(InputBinding {
                port_index: input.id.port_index(),
                producer: link.producer,
                producer_request,
                fence: grant.fence,
                buffer: grant.buffer,
                properties: grant.properties.or(input.resolved),
                pending: grant.pending,
                loopback: link.loopback,
                consumed: false,
            });
        }
        Ok(())
    }

    fn watch_output_fence(&self, ctx: &GraphContext, request: RequestId, fence: FenceHandle) {
        let jobs = ctx.job_sender();
        let node = self.id;
        let callback: FenceCallback = Box::new(move |fence, result| {
            let _ = jobs.send(Job::FenceCallback(FenceCallbackData {
                node,
                request,
                fence,
                result,
            }));
        });
        if let Err(e) = ctx.fences().register_callback(fence, callback) {
            warn!("{} cannot watch output fence {:?}: {}", self.name, fence, e);
        }
    }

    // ── Recycling and retirement ──

    /// Free the ring slot `request` is about to take over.
    fn recycle(&self, ctx: &GraphContext, request: RequestId) {
        let old = std::mem::take(&mut *lock(self.state(request)));
        if let Some(previous) = &old.request {
            debug!(
                "{} recycles slot of request {} for request {}",
                self.name, previous.request_id, request
            );
        }
        self.release_ports(ctx, old);
    }

    /// Drop the node's own buffer references, any fence still held and any
    /// input reference not yet handed back.
    pub(crate) fn release_ports(&self, ctx: &GraphContext, mut ports: RequestPorts) {
        for (idx, binding) in ports.outputs.iter().enumerate() {
            let Some(buffer) = binding.as_ref().and_then(|b| b.buffer.as_ref()) else {
                continue;
            };
            if let Err(e) = self.outputs[idx].buffers.release_reference(buffer) {
                warn!("{} output {}: {}", self.name, idx, e);
            }
        }
        for composite in &mut ports.composites {
            if let Err(e) = composite.release_all(ctx.fences().as_ref()) {
                warn!("{} fence {:?}: {}", self.name, composite.fence(), e);
            }
        }
        let request = ports.request.as_ref().map(|r| r.request_id);
        for input in ports.inputs.iter_mut().filter(|i| !i.consumed) {
            input.consumed = true;
            if let Ok(producer) = ctx.node(input.producer.node()) {
                producer.notify_output_consumed(
                    ctx,
                    input.producer.port_index(),
                    input.producer_request,
                    input.buffer.clone(),
                );
            }
            debug!(
                "{} released unconsumed input {} of request {:?}",
                self.name, input.port_index, request
            );
        }
    }

    /// The request retired: every active port drops its reference on its
    /// (possibly shared) fence.
    pub(crate) fn retire_request(&self, ctx: &GraphContext, request: RequestId) {
        let mut state = lock(self.state(request));
        if !state.holds(request) || state.retired {
            return;
        }
        let active: Vec<u16> = state
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_some())
            .map(|(i, _)| i as u16)
            .collect();
        for port in active {
            let Some(composite) = state.composites.iter_mut().find(|c| c.covers(port)) else {
                continue;
            };
            match composite.release_port(port, ctx.fences().as_ref()) {
                Ok(true) => debug!("{} released {:?}", self.name, composite.fence()),
                Ok(false) => {}
                Err(e) => warn!("{} output {}: {}", self.name, port, e),
            }
        }
        state.retired = true;
    }

    /// Release everything still held by any ring slot, as on stream off.
    pub(crate) fn release_all_requests(&self, ctx: &GraphContext) {
        for state in self.request_state.iter() {
            let ports = std::mem::take(&mut *lock(state));
            self.release_ports(ctx, ports);
        }
    }
}
