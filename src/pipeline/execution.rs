//! Dependency-driven execution of one node for one request.
//!
//! ```text
//! Process job ──► process_request ──► internal unit? ──yes──► DRQ ──► resume ──┐
//!                                          │ no                                 │
//!                                          ▼                                    ▼
//!                                    after_internal ◄──────────────────── (internal)
//!                                          │
//!                      bypass ─► forward + signal ─► Success
//!                      else   ─► run_derived(seq) ──► units? ──yes──► DRQ ──► resume ─► run_derived(seq)
//!                                                        │ no
//!                                                        ▼
//!                                                  Success [─► Submit]
//! ```
//!
//! Every status transition happens with the node's execution lock held. The
//! lock is held while a unit is handed to the DRQ, so a resume can never
//! observe a half-finished step.

use crate::pipeline::bridge::FailureStage;
use crate::pipeline::context::{GraphContext, RequestContext};
use crate::pipeline::dependency::DependencyUnit;
use crate::pipeline::error::{fatal_invariant, PipelineError};
use crate::pipeline::fence::{FenceResult, FenceStatus};
use crate::pipeline::fence_errors::FenceErrorEntry;
use crate::pipeline::id::{FenceHandle, RequestId};
use crate::pipeline::lock;
use crate::pipeline::node::{AnyNode, ExecuteContext, InputView, OutputView, RequestExecutable};
use crate::pipeline::request::{PerRequestInfo, PerRequestNodeStatus};
use crate::pipeline::scheduler::ReadyUnit;
use crate::pipeline::slot::NodeSlot;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Sequence id of the first invocation and of base-logic internal units.
const INITIAL_SEQUENCE: u32 = 0;

impl NodeSlot {
    /// First invocation of the node for `request`.
    pub(crate) fn process_request(&self, ctx: &GraphContext, request: RequestId) {
        let mut node = lock(&self.derived);
        let Some(info) = self.ring.get(request) else {
            debug!("{} no longer holds request {}", self.name, request);
            return;
        };
        if !info.is_enabled() || info.status() != PerRequestNodeStatus::Setup {
            debug!("{} request {} is {:?}; not processing", self.name, request, info.status());
            return;
        }
        if !self.transition(info, PerRequestNodeStatus::Running) {
            return;
        }
        let Some(context) = lock(self.state(request)).request.clone() else {
            return;
        };

        let bypass = self.flags.bypassable && node.elects_bypass(&context);
        let fences = {
            let mut state = lock(self.state(request));
            state.bypassed = bypass;
            let forwarding = bypass || self.flags.in_place;
            let mut fences: Vec<FenceHandle> = state
                .inputs
                .iter()
                .filter(|i| i.pending || (forwarding && !i.loopback))
                .filter_map(|i| i.fence)
                .collect();
            fences.sort();
            fences.dedup();
            fences
        };
        let fences: Vec<FenceHandle> = fences
            .into_iter()
            .filter(|f| matches!(ctx.fences().status(*f), Ok(FenceStatus::Pending)))
            .collect();

        if fences.is_empty() {
            self.after_internal(ctx, &mut node, info, &context, bypass);
            return;
        }

        let unit = fences
            .into_iter()
            .fold(DependencyUnit::builder(INITIAL_SEQUENCE).internal(), |b, f| b.buffer_fence(f))
            .build();
        match unit {
            Ok(unit) => {
                debug!(
                    "{} request {} waits on {} input fence(s) before forwarding",
                    self.name,
                    request,
                    unit.fences.len()
                );
                info.add_outstanding_units(1);
                if self.transition(info, PerRequestNodeStatus::Deferred) {
                    ctx.submit_dependencies(self.id, request, vec![unit]);
                }
            }
            Err(e) => self.fail_locked(ctx, &mut node, info, request, FailureStage::Execute, e.to_string()),
        }
    }

    /// A dependency unit of this node resolved.
    pub(crate) fn resume(&self, ctx: &GraphContext, ready: ReadyUnit) {
        let mut node = lock(&self.derived);
        let request = ready.request;
        let Some(info) = self.ring.get(request) else {
            debug!("{} dropped unit for recycled request {}", self.name, request);
            return;
        };
        info.unit_resolved();
        if info.status().is_settled() {
            debug!(
                "{} request {} already {:?}; unit seq {} dropped",
                self.name,
                request,
                info.status(),
                ready.unit.process_sequence_id
            );
            return;
        }
        if let Some((fence, result)) = ready.failed.first() {
            let reason = format!("input fence {:?} signaled {:?}", fence, result);
            self.fail_locked(ctx, &mut node, info, request, FailureStage::Upstream, reason);
            return;
        }
        if !self.transition(info, PerRequestNodeStatus::Running) {
            return;
        }
        if ready.unit.is_internal() {
            let Some(context) = lock(self.state(request)).request.clone() else {
                return;
            };
            let bypass = lock(self.state(request)).bypassed;
            self.after_internal(ctx, &mut node, info, &context, bypass);
        } else {
            self.run_derived(ctx, &mut node, info, request, ready.unit.process_sequence_id);
        }
    }

    /// Base-logic step once every forwarded or delayed input is available.
    fn after_internal(
        &self,
        ctx: &GraphContext,
        node: &mut AnyNode,
        info: &PerRequestInfo,
        context: &RequestContext,
        bypass: bool,
    ) {
        let request = context.request_id;
        if let Some(reason) = self.upstream_failure(ctx, request) {
            self.fail_locked(ctx, node, info, request, FailureStage::Upstream, reason);
            return;
        }
        if let Err(reason) = self.resolve_deferred_inputs(ctx, request) {
            self.fail_locked(ctx, node, info, request, FailureStage::Execute, reason);
            return;
        }

        let prepared = if bypass {
            self.forward_outputs(ctx, request, true)
        } else if self.flags.in_place {
            self.forward_outputs(ctx, request, false)
        } else if self.flags.bypassable {
            self.bind_own_outputs(ctx, request)
        } else {
            Ok(())
        };
        if let Err(e) = prepared {
            self.fail_locked(ctx, node, info, request, FailureStage::Execute, e.to_string());
            return;
        }

        if bypass {
            debug!("{} bypassed request {}", self.name, request);
            if self.transition(info, PerRequestNodeStatus::Success) {
                self.check_complete(ctx, request);
            }
            return;
        }
        self.run_derived(ctx, node, info, request, INITIAL_SEQUENCE);
    }

    /// First non-loopback input whose fence already failed.
    fn upstream_failure(&self, ctx: &GraphContext, request: RequestId) -> Option<String> {
        let fences: Vec<FenceHandle> = lock(self.state(request))
            .inputs
            .iter()
            .filter(|i| !i.loopback)
            .filter_map(|i| i.fence)
            .collect();
        fences.into_iter().find_map(|f| match ctx.fences().status(f) {
            Ok(FenceStatus::Signaled(result)) if !result.is_success() => {
                Some(format!("input fence {:?} signaled {:?}", f, result))
            }
            _ => None,
        })
    }

    /// Ask producers for the buffers that were unknown at setup. The own
    /// state lock is never held while a producer is queried.
    fn resolve_deferred_inputs(&self, ctx: &GraphContext, request: RequestId) -> Result<(), String> {
        let pending: Vec<(usize, crate::pipeline::id::PortId, RequestId)> = lock(self.state(request))
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| i.pending && i.buffer.is_none())
            .map(|(idx, i)| (idx, i.producer, i.producer_request))
            .collect();
        for (idx, producer, producer_request) in pending {
            let data = ctx
                .node(producer.node())
                .ok()
                .and_then(|p| p.output_port_requested_data(producer.port_index(), producer_request));
            let mut state = lock(self.state(request));
            let Some(input) = state.inputs.get_mut(idx) else {
                continue;
            };
            match data {
                Some((buffer, properties)) => {
                    input.buffer = Some(buffer);
                    input.properties = properties.or(input.properties);
                    input.pending = false;
                }
                None if input.loopback => input.pending = false,
                None => {
                    return Err(format!(
                        "input {} unresolved: producer {} has no buffer for request {}",
                        input.port_index, producer, producer_request
                    ))
                }
            }
        }
        Ok(())
    }

    /// Invoke derived logic, starting at `sequence_id`, until it either
    /// reports real dependencies or finishes.
    fn run_derived(
        &self,
        ctx: &GraphContext,
        node: &mut AnyNode,
        info: &PerRequestInfo,
        request: RequestId,
        sequence_id: u32,
    ) {
        let mut immediate = VecDeque::from([sequence_id]);
        let mut submitted = false;
        while let Some(seq) = immediate.pop_front() {
            if info.status() != PerRequestNodeStatus::Running
                && !self.transition(info, PerRequestNodeStatus::Running)
            {
                return;
            }
            // A producer may have failed since the previous step.
            if let Some(reason) = self.upstream_failure(ctx, request) {
                self.fail_locked(ctx, node, info, request, FailureStage::Upstream, reason);
                return;
            }
            let Some((context, inputs, outputs)) = self.views(request) else {
                return;
            };
            let mut ectx = ExecuteContext::new(
                &context,
                self.id,
                &self.name,
                seq,
                ctx.pipeline_id(),
                inputs,
                outputs,
                ctx.fences(),
                ctx.metadata(),
            );
            let result = node.execute_process_request(&mut ectx);
            let units = std::mem::take(&mut ectx.dependencies);
            let published = std::mem::take(&mut ectx.published);
            submitted |= ectx.submitted;
            if ectx.metadata_done {
                info.mark_metadata_done();
            } else if ectx.partial_metadata_done {
                info.mark_partial_metadata_done();
            }
            drop(ectx);
            ctx.publish_properties(request, &published);

            if let Err(e) = result {
                if e.is_fatal() {
                    fatal_invariant(&e);
                }
                self.fail_locked(ctx, node, info, request, FailureStage::Execute, e.to_string());
                return;
            }

            let mut real = Vec::new();
            for unit in units {
                if unit.has_any_dependency() {
                    real.push(unit);
                } else {
                    warn!(
                        "{} reported an empty dependency unit (seq {}) for request {}; running it now",
                        self.name, unit.process_sequence_id, request
                    );
                    immediate.push_back(unit.process_sequence_id);
                }
            }
            if !real.is_empty() {
                debug!("{} request {} defers {} unit(s)", self.name, request, real.len());
                info.add_outstanding_units(real.len() as u32);
                ctx.submit_dependencies(self.id, request, real);
            }
        }

        if info.outstanding_units() > 0 {
            self.transition(info, PerRequestNodeStatus::Deferred);
            return;
        }
        if !self.transition(info, PerRequestNodeStatus::Success) {
            return;
        }
        if submitted {
            self.transition(info, PerRequestNodeStatus::Submit);
        } else {
            self.signal_pending_outputs(ctx, request, FenceResult::Success);
        }
        self.check_complete(ctx, request);
    }

    /// Per-request views handed to derived logic.
    fn views(&self, request: RequestId) -> Option<(RequestContext, Vec<InputView>, Vec<OutputView>)> {
        let state = lock(self.state(request));
        let context = state.request.clone()?;
        let inputs = state
            .inputs
            .iter()
            .map(|i| InputView {
                port_index: i.port_index,
                producer: i.producer,
                fence: i.fence,
                buffer: i.buffer.clone(),
                properties: i.properties,
                loopback: i.loopback,
            })
            .collect();
        let outputs = state
            .outputs
            .iter()
            .enumerate()
            .filter_map(|(idx, b)| {
                let b = b.as_ref()?;
                let port = &self.outputs[idx];
                Some(OutputView {
                    port_index: idx as u16,
                    fence: b.fence,
                    buffer: b.consumer_buffer(),
                    properties: port.properties,
                    is_sink: port.is_sink(),
                })
            })
            .collect();
        Some((context, inputs, outputs))
    }

    /// Move to `to`. A double submission aborts; any other refusal means the
    /// request was settled concurrently and the caller stops.
    pub(crate) fn transition(&self, info: &PerRequestInfo, to: PerRequestNodeStatus) -> bool {
        match info.set_request_status(to) {
            Ok(_) => true,
            Err(e) if e.is_fatal() => fatal_invariant(&e),
            Err(e) => {
                debug!("{}: {}", self.name, e);
                false
            }
        }
    }

    /// Signal every output fence of `request` still pending.
    pub(crate) fn signal_pending_outputs(&self, ctx: &GraphContext, request: RequestId, result: FenceResult) {
        let fences = lock(self.state(request)).output_fences();
        for fence in fences {
            if !matches!(ctx.fences().status(fence), Ok(FenceStatus::Pending)) {
                continue;
            }
            match ctx.fences().signal(fence, result) {
                Ok(()) => {}
                // Signaled concurrently by a hardware queue.
                Err(PipelineError::InvalidArgument(_)) => {}
                Err(e) => warn!("{} cannot signal {:?}: {}", self.name, fence, e),
            }
        }
    }

    /// Fail `request` from outside the execution lock.
    pub(crate) fn fail_request(&self, ctx: &GraphContext, request: RequestId, stage: FailureStage, reason: String) {
        let mut node = lock(&self.derived);
        let Some(info) = self.ring.get(request) else {
            return;
        };
        self.fail_locked(ctx, &mut node, info, request, stage, reason);
    }

    /// Settle `request` as failed. Outputs still pending are signaled
    /// `Failed` so consumers unblock and carry the error forward.
    fn fail_locked(
        &self,
        ctx: &GraphContext,
        _node: &mut AnyNode,
        info: &PerRequestInfo,
        request: RequestId,
        stage: FailureStage,
        reason: String,
    ) {
        if info.status() != PerRequestNodeStatus::Cancelled {
            self.transition(info, PerRequestNodeStatus::Error);
        }
        warn!("{} request {} failed ({:?}): {}", self.name, request, stage, reason);
        // Output fences report the failure themselves when signaled.
        let own_failure = matches!(stage, FailureStage::Setup | FailureStage::Execute);
        if own_failure && lock(self.state(request)).output_fences().is_empty() {
            ctx.record_fence_error(FenceErrorEntry::without_fence(
                self.id,
                self.name.as_str(),
                request,
                FenceResult::Failed,
            ));
        }
        ctx.record_failure(request, self.id, stage, reason);
        let cleared = ctx.clear_dependencies(self.id, request);
        if cleared > 0 {
            debug!("{} dropped {} deferred unit(s) of request {}", self.name, cleared, request);
        }
        self.signal_pending_outputs(ctx, request, FenceResult::Failed);
        self.check_complete(ctx, request);
    }
}
