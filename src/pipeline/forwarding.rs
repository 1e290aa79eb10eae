//! Producer-side port access and bypass / in-place forwarding.
//!
//! Consumers never touch a producer's buffer pool directly. They bind
//! through `add_consumer_reference`, resolve late buffers with
//! `output_port_requested_data` and hand references back with
//! `notify_output_consumed`.
//!
//! A forwarding node (bypassable or in-place) does not know its output
//! buffer at setup. Consumers binding to it before the buffer is known are
//! counted in `DelayedOutputBufferInfo::consumers_attached`; when the node
//! resolves its output it takes one reference per attached consumer on the
//! buffer's real owner.

use crate::pipeline::buffer::{BufferProperties, ImageBuffer};
use crate::pipeline::context::GraphContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::FenceResult;
use crate::pipeline::id::RequestId;
use crate::pipeline::lock;
use crate::pipeline::slot::{NodeSlot, ProducerGrant};
use std::sync::Arc;
use tracing::{debug, warn};

impl NodeSlot {
    /// Bind a consumer to output `port` for `request`. `Ok(None)` when the
    /// port is inactive for the request or the request was never set up.
    pub(crate) fn add_consumer_reference(
        &self,
        ctx: &GraphContext,
        port: u16,
        request: RequestId,
    ) -> PipelineResult<Option<ProducerGrant>> {
        if self.ring.get(request).is_none() {
            return Ok(None);
        }
        let mut state = lock(self.state(request));
        if !state.holds(request) {
            return Ok(None);
        }
        let retired = state.retired;
        let Some(binding) = state.output_mut(port) else {
            return Ok(None);
        };
        let properties = self.outputs.get(port as usize).and_then(|o| o.properties);
        let fence = (!retired).then_some(binding.fence);

        if let Some(delayed) = binding.delayed.as_mut() {
            return match delayed.resolved.clone() {
                Some(buffer) => {
                    ctx.add_buffer_reference(&buffer)?;
                    Ok(Some(ProducerGrant {
                        fence,
                        buffer: Some(buffer),
                        properties,
                        pending: false,
                    }))
                }
                None => {
                    delayed.consumers_attached += 1;
                    Ok(Some(ProducerGrant {
                        fence,
                        buffer: None,
                        properties,
                        pending: true,
                    }))
                }
            };
        }

        let buffer = binding.buffer.clone();
        if let Some(buffer) = &buffer {
            self.outputs[port as usize].buffers.add_reference(buffer)?;
        }
        Ok(Some(ProducerGrant {
            fence,
            buffer,
            properties,
            pending: false,
        }))
    }

    /// The buffer a consumer of `port` reads for `request`, without taking a
    /// reference. `None` while a forwarded buffer is still unresolved.
    pub(crate) fn output_port_requested_data(
        &self,
        port: u16,
        request: RequestId,
    ) -> Option<(Arc<ImageBuffer>, Option<BufferProperties>)> {
        let state = lock(self.state(request));
        if !state.holds(request) {
            return None;
        }
        let buffer = state.output(port)?.consumer_buffer()?;
        let properties = self
            .outputs
            .get(port as usize)
            .and_then(|o| o.properties)
            .or(Some(*buffer.properties()));
        Some((buffer, properties))
    }

    /// A consumer is done with output `port` of `request`.
    pub(crate) fn notify_output_consumed(
        &self,
        ctx: &GraphContext,
        port: u16,
        request: RequestId,
        buffer: Option<Arc<ImageBuffer>>,
    ) {
        if let Some(buffer) = buffer {
            if let Err(e) = ctx.release_buffer_reference(&buffer) {
                warn!("{} output {} request {}: {}", self.name, port, request, e);
            }
            return;
        }

        let resolved = {
            let mut state = lock(self.state(request));
            if !state.holds(request) {
                return;
            }
            let Some(delayed) = state.output_mut(port).and_then(|b| b.delayed.as_mut()) else {
                return;
            };
            match delayed.resolved.clone() {
                Some(buffer) => Some(buffer),
                None => {
                    delayed.consumers_attached = delayed.consumers_attached.saturating_sub(1);
                    None
                }
            }
        };
        if let Some(buffer) = resolved {
            if let Err(e) = ctx.release_buffer_reference(&buffer) {
                warn!("{} output {} request {}: {}", self.name, port, request, e);
            }
        }
    }

    /// Reference count of the buffer consumers of `port` read for `request`.
    pub fn output_buffer_ref_count(&self, ctx: &GraphContext, port: u16, request: RequestId) -> Option<u32> {
        let (buffer, _) = self.output_port_requested_data(port, request)?;
        ctx.buffer_manager(buffer.owner())
            .ok()
            .map(|m| m.ref_count(&buffer))
    }

    // ── Forwarding ──

    /// Expose the first non-loopback input buffer on every delayed output.
    /// With `signal` (bypass) the output fences are signaled right away.
    pub(crate) fn forward_outputs(&self, ctx: &GraphContext, request: RequestId, signal: bool) -> PipelineResult<()> {
        let fences = {
            let mut state = lock(self.state(request));
            let source = state
                .inputs
                .iter()
                .filter(|i| !i.loopback)
                .find_map(|i| i.buffer.clone())
                .ok_or_else(|| {
                    PipelineError::InvalidArgument(format!(
                        "{} has no input buffer to forward for request {}",
                        self.name, request
                    ))
                })?;
            // Every attached consumer's reference is taken before any port
            // resolves, so a failure leaves nothing half forwarded.
            let attached: u32 = state
                .outputs
                .iter()
                .flatten()
                .filter_map(|b| b.delayed.as_ref())
                .map(|d| d.consumers_attached)
                .sum();
            if attached > 0 {
                ctx.add_buffer_references(&source, attached)?;
            }
            let mut fences = Vec::new();
            for binding in state.outputs.iter_mut().flatten() {
                let Some(delayed) = binding.delayed.as_mut() else {
                    continue;
                };
                delayed.resolved = Some(Arc::clone(&source));
                if !fences.contains(&binding.fence) {
                    fences.push(binding.fence);
                }
            }
            state.bypassed = signal;
            fences
        };
        debug!("{} forwards its input for request {}", self.name, request);
        if signal {
            for fence in fences {
                ctx.fences().signal(fence, FenceResult::Success)?;
            }
        }
        Ok(())
    }

    /// A bypassable node that did not bypass produces into its own pool.
    pub(crate) fn bind_own_outputs(&self, ctx: &GraphContext, request: RequestId) -> PipelineResult<()> {
        let mut state = lock(self.state(request));
        for (idx, binding) in state.outputs.iter_mut().enumerate() {
            let Some(binding) = binding.as_mut() else {
                continue;
            };
            let Some(delayed) = binding.delayed.as_mut() else {
                continue;
            };
            if delayed.resolved.is_some() {
                continue;
            }
            let buffer = self.outputs[idx].buffers.acquire(request)?;
            if delayed.consumers_attached > 0 {
                if let Err(e) = ctx.add_buffer_references(&buffer, delayed.consumers_attached) {
                    let _ = self.outputs[idx].buffers.release_reference(&buffer);
                    return Err(e);
                }
            }
            delayed.resolved = Some(Arc::clone(&buffer));
            binding.buffer = Some(buffer);
        }
        Ok(())
    }
}
