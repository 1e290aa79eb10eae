//! Output-fence completion and flush.
//!
//! Output fences are watched from setup on. Each signal arrives as a
//! `Job::FenceCallback`; once the request has settled and every fence of
//! the node has signaled, the node's part of the request is complete: the
//! inputs go back to their producers and the pipeline is told.

use crate::pipeline::bridge::FailureStage;
use crate::pipeline::context::GraphContext;
use crate::pipeline::fence::FenceResult;
use crate::pipeline::fence_errors::FenceErrorEntry;
use crate::pipeline::id::RequestId;
use crate::pipeline::lock;
use crate::pipeline::node::RequestExecutable;
use crate::pipeline::request::{PerRequestInfo, PerRequestNodeStatus};
use crate::pipeline::slot::NodeSlot;
use crate::pipeline::worker::FenceCallbackData;
use std::sync::TryLockError;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

impl NodeSlot {
    pub(crate) fn process_fence_callback(&self, ctx: &GraphContext, data: FenceCallbackData) {
        let request = data.request;
        let Some(info) = self.ring.get(request) else {
            debug!("{} fence {:?} for recycled request {}", self.name, data.fence, request);
            return;
        };

        {
            let mut state = lock(self.state(request));
            if let Some(handler) = state.handlers.iter_mut().find(|h| h.fence == data.fence) {
                handler.result = Some(data.result);
            }
        }

        let flushed = data.result == FenceResult::Cancelled
            && info.status() == PerRequestNodeStatus::Cancelled;
        if !data.result.is_success() && !flushed {
            ctx.record_fence_error(FenceErrorEntry::new(
                self.id,
                self.name.as_str(),
                request,
                data.fence,
                data.result,
            ));
            let mut node = lock(&self.derived);
            node.notify_request_processing_error(request, data.fence, data.result);
            ctx.record_failure(
                request,
                self.id,
                FailureStage::Fence,
                format!("output fence {:?} signaled {:?}", data.fence, data.result),
            );
            if !matches!(
                info.status(),
                PerRequestNodeStatus::Error | PerRequestNodeStatus::Cancelled
            ) {
                self.transition(info, PerRequestNodeStatus::Error);
                ctx.clear_dependencies(self.id, request);
            }
        }

        let remaining = info.fence_signaled();
        debug!(
            "{} fence {:?} of request {} signaled {:?} ({} left)",
            self.name, data.fence, request, data.result, remaining
        );
        self.check_complete(ctx, request);
    }

    /// Complete the node's part of `request` once it settled and every output
    /// fence signaled. Runs at most once per request.
    pub(crate) fn check_complete(&self, ctx: &GraphContext, request: RequestId) {
        let Some(info) = self.ring.get(request) else {
            return;
        };
        if info.status().is_settled() && info.unsignaled_fences() == 0 && info.try_mark_complete() {
            self.on_complete(ctx, request, info);
        }
    }

    fn on_complete(&self, ctx: &GraphContext, request: RequestId, info: &PerRequestInfo) {
        if !info.metadata_done() {
            info.mark_metadata_done();
        }

        let consumed: Vec<_> = {
            let mut state = lock(self.state(request));
            state
                .inputs
                .iter_mut()
                .filter(|i| !i.consumed)
                .map(|i| {
                    i.consumed = true;
                    (i.producer, i.producer_request, i.buffer.clone())
                })
                .collect()
        };
        for (producer, producer_request, buffer) in consumed {
            match ctx.node(producer.node()) {
                Ok(slot) => slot.notify_output_consumed(ctx, producer.port_index(), producer_request, buffer),
                Err(e) => warn!("{}: {}", self.name, e),
            }
        }

        debug!("{} completed request {} as {:?}", self.name, request, info.status());
        ctx.node_request_done(self.id, request);
    }

    /// Cancel whatever the node still does for `request`. Waits up to the
    /// node's worst-case response time for a running step to return, then
    /// releases anyway.
    pub(crate) fn flush(&self, ctx: &GraphContext, request: RequestId) {
        let Some(info) = self.ring.get(request) else {
            return;
        };
        if info.is_complete() {
            return;
        }

        let bound = ctx.worst_case_response(self);
        let deadline = Instant::now() + bound;
        let guard = loop {
            match self.derived.try_lock() {
                Ok(guard) => break Some(guard),
                Err(TryLockError::Poisoned(p)) => break Some(p.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    warn!(
                        "{} still busy with request {} after {:?}; forcing release",
                        self.name, request, bound
                    );
                    break None;
                }
                Err(TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            }
        };

        let cleared = ctx.clear_dependencies(self.id, request);
        if info.status() != PerRequestNodeStatus::Error {
            self.transition(info, PerRequestNodeStatus::Cancelled);
        }
        self.signal_pending_outputs(ctx, request, FenceResult::Cancelled);
        debug!(
            "{} flushed request {} ({} deferred unit(s) dropped)",
            self.name, request, cleared
        );
        drop(guard);

        if info.try_mark_complete() {
            self.on_complete(ctx, request, info);
        }
    }
}
