//! Shared scheduling state.
//!
//! `GraphContext` is everything a worker needs to advance a request: the
//! node arena, the compiled order, the fence and metadata providers, the
//! deferred request queue and the per-request trackers. The pipeline owns it
//! behind an `Arc`; workers hold clones while streaming.
//!
//! `RequestContext` is the explicit per-request context passed to every call
//! that needs to know which request it is working on.

use crate::config::SchedulerConfig;
use crate::pipeline::bridge::{FailureStage, PipelineMessage, RequestResult};
use crate::pipeline::buffer::{ImageBuffer, ImageBufferManager};
use crate::pipeline::compiled_plan::CompiledPlan;
use crate::pipeline::dependency::DependencyUnit;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::{FenceCallback, FencePrimitive, FenceResult};
use crate::pipeline::fence_errors::{FenceErrorBuffer, FenceErrorEntry};
use crate::pipeline::id::{FenceHandle, NodeId, PortId, RequestId, TagId};
use crate::pipeline::lock;
use crate::pipeline::metadata::MetadataPool;
use crate::pipeline::port::StreamMask;
use crate::pipeline::scheduler::{AddOutcome, DeferredRequestQueue, DrqStats};
use crate::pipeline::slot::NodeSlot;
use crate::pipeline::worker::Job;
use crate::types::{BatchInfo, CaptureRequest};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// The request a call is working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub sync_id: u64,
    pub batch: BatchInfo,
    /// HAL streams the request fills.
    pub streams: StreamMask,
}

impl RequestContext {
    /// A request enabling every stream.
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            sync_id: request_id,
            batch: BatchInfo::default(),
            streams: StreamMask::ALL,
        }
    }

    pub fn from_capture(request: &CaptureRequest) -> Self {
        Self {
            request_id: request.request_id,
            sync_id: request.sync_id,
            batch: request.batch,
            streams: StreamMask::from_streams(request.streams.iter().copied()),
        }
    }
}

#[derive(Debug, Clone)]
struct RequestFailure {
    node: NodeId,
    stage: FailureStage,
    reason: String,
}

/// Pipeline-level bookkeeping for one in-flight request.
#[derive(Debug)]
struct RequestTracker {
    nodes: Vec<NodeId>,
    pending: usize,
    /// Setup finished; no more nodes will join.
    sealed: bool,
    failure: Option<RequestFailure>,
    cancelled: bool,
    batch: BatchInfo,
    started: Instant,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Request counters reported by `Pipeline::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounters {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct GraphContext {
    pipeline_id: u32,
    config: SchedulerConfig,
    pub(crate) nodes: Vec<NodeSlot>,
    pub(crate) plan: CompiledPlan,
    fences: Arc<dyn FencePrimitive>,
    metadata: Arc<dyn MetadataPool>,
    drq: Mutex<DeferredRequestQueue>,
    fence_errors: Mutex<FenceErrorBuffer>,
    requests: Mutex<HashMap<RequestId, RequestTracker>>,
    counters: Counters,
    jobs: Sender<Job>,
    messages: Sender<PipelineMessage>,
}

impl GraphContext {
    pub(crate) fn new(
        pipeline_id: u32,
        config: SchedulerConfig,
        fences: Arc<dyn FencePrimitive>,
        metadata: Arc<dyn MetadataPool>,
        jobs: Sender<Job>,
        messages: Sender<PipelineMessage>,
    ) -> Self {
        Self {
            pipeline_id,
            drq: Mutex::new(DeferredRequestQueue::new(config.fence_timeout())),
            config,
            nodes: Vec::new(),
            plan: CompiledPlan::new(),
            fences,
            metadata,
            fence_errors: Mutex::new(FenceErrorBuffer::new()),
            requests: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            jobs,
            messages,
        }
    }

    pub fn pipeline_id(&self) -> u32 {
        self.pipeline_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn fences(&self) -> &Arc<dyn FencePrimitive> {
        &self.fences
    }

    pub fn metadata(&self) -> &dyn MetadataPool {
        self.metadata.as_ref()
    }

    pub fn nodes(&self) -> &[NodeSlot] {
        &self.nodes
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    pub fn node(&self, id: NodeId) -> PipelineResult<&NodeSlot> {
        self.nodes.get(id.index()).ok_or(PipelineError::UnknownNode(id))
    }

    /// The pool owning buffers produced on `port`.
    pub(crate) fn buffer_manager(&self, port: PortId) -> PipelineResult<&ImageBufferManager> {
        self.node(port.node())?
            .outputs
            .get(port.index())
            .map(|o| &o.buffers)
            .ok_or(PipelineError::UnknownPort(port))
    }

    /// Add a reference on `buffer` through the pool of the port that owns it.
    pub(crate) fn add_buffer_reference(&self, buffer: &ImageBuffer) -> PipelineResult<u32> {
        self.buffer_manager(buffer.owner())?.add_reference(buffer)
    }

    pub(crate) fn add_buffer_references(&self, buffer: &ImageBuffer, count: u32) -> PipelineResult<u32> {
        self.buffer_manager(buffer.owner())?.add_references(buffer, count)
    }

    pub(crate) fn release_buffer_reference(&self, buffer: &ImageBuffer) -> PipelineResult<u32> {
        self.buffer_manager(buffer.owner())?.release_reference(buffer)
    }

    pub(crate) fn node_name(&self, id: NodeId) -> String {
        self.node(id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|_| id.to_string())
    }

    // ── Job dispatch ──

    pub(crate) fn dispatch(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            warn!("Job queue closed; dropping job");
        }
    }

    pub(crate) fn job_sender(&self) -> Sender<Job> {
        self.jobs.clone()
    }

    /// Execute one job on the calling thread.
    pub fn run_job(&self, job: Job) {
        match job {
            Job::Process { node, request } => match self.node(node) {
                Ok(slot) => slot.process_request(self, request),
                Err(e) => warn!("Process job for {}: {}", node, e),
            },
            Job::Resume(ready) => match self.node(ready.node) {
                Ok(slot) => slot.resume(self, ready),
                Err(e) => warn!("Resume job: {}", e),
            },
            Job::FenceSignaled { fence, result } => {
                let ready = lock(&self.drq).fence_signaled(fence, result);
                for unit in ready {
                    self.dispatch(Job::Resume(unit));
                }
            }
            Job::FenceCallback(data) => match self.node(data.node) {
                Ok(slot) => slot.process_fence_callback(self, data),
                Err(e) => warn!("Fence callback for {:?}: {}", data.fence, e),
            },
            Job::Poll => {
                self.poll_dependencies();
            }
            Job::Watchdog => {
                self.handle_timeouts(Instant::now());
            }
            Job::Shutdown => {}
        }
    }

    /// Run queued jobs on the calling thread until nothing is left to do.
    /// In polling mode each round also re-evaluates the queue. Returns the
    /// number of jobs run.
    pub fn run_until_idle(&self, rx: &Receiver<Job>) -> usize {
        let polling = self.config.fence_mode.poll_interval().is_some();
        let watchdog = self.config.fence_timeout().is_some();
        let mut ran = 0;
        loop {
            while let Ok(job) = rx.try_recv() {
                if !matches!(job, Job::Shutdown) {
                    self.run_job(job);
                    ran += 1;
                }
            }
            let mut progressed = false;
            if polling {
                progressed |= self.poll_dependencies() > 0;
            }
            if watchdog {
                progressed |= self.handle_timeouts(Instant::now()) > 0;
            }
            if !progressed && rx.is_empty() {
                return ran;
            }
        }
    }

    // ── Dependencies ──

    /// Queue `units` for `(node, request)`. Satisfied units go straight
    /// back to the node as `Resume` jobs.
    pub(crate) fn submit_dependencies(&self, node: NodeId, request: RequestId, units: Vec<DependencyUnit>) {
        let polling = self.config.fence_mode.poll_interval().is_some();
        for unit in units {
            let outcome = lock(&self.drq).add(
                node,
                request,
                unit,
                self.fences.as_ref(),
                self.metadata.as_ref(),
            );
            match outcome {
                AddOutcome::Ready(ready) => self.dispatch(Job::Resume(ready)),
                AddOutcome::Deferred { watch } if !polling => {
                    for fence in watch {
                        self.watch_fence(fence);
                    }
                }
                AddOutcome::Deferred { .. } => {}
            }
        }
    }

    fn watch_fence(&self, fence: FenceHandle) {
        let jobs = self.jobs.clone();
        let callback: FenceCallback = Box::new(move |fence, result| {
            let _ = jobs.send(Job::FenceSignaled { fence, result });
        });
        match self.fences.register_callback(fence, callback) {
            Ok(()) => {}
            // Released with its retired request, so it has signaled.
            Err(PipelineError::UnknownFence(_)) => self.dispatch(Job::FenceSignaled {
                fence,
                result: FenceResult::Success,
            }),
            Err(e) => warn!("Cannot watch {:?}: {}", fence, e),
        }
    }

    /// Wake units waiting on `tags` of `request`.
    pub(crate) fn publish_properties(&self, request: RequestId, tags: &[TagId]) {
        if tags.is_empty() {
            return;
        }
        let ready: Vec<_> = {
            let mut drq = lock(&self.drq);
            tags.iter()
                .flat_map(|tag| drq.property_published(*tag, request))
                .collect()
        };
        for unit in ready {
            self.dispatch(Job::Resume(unit));
        }
    }

    pub(crate) fn clear_dependencies(&self, node: NodeId, request: RequestId) -> usize {
        lock(&self.drq).clear_dependencies(node, request)
    }

    /// Real-time nodes keep their units until flushed.
    pub(crate) fn abandon_preemptable(&self) -> Vec<(NodeId, RequestId)> {
        let ordered: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|n| n.flags.real_time)
            .map(|n| n.id)
            .collect();
        lock(&self.drq).abandon_preemptable(&ordered)
    }

    pub fn deferred_units(&self) -> usize {
        lock(&self.drq).len()
    }

    pub fn drq_stats(&self) -> DrqStats {
        lock(&self.drq).stats()
    }

    pub(crate) fn pending_units(&self, node: NodeId, request: RequestId) -> usize {
        lock(&self.drq).pending_for(node, request)
    }

    fn poll_dependencies(&self) -> usize {
        let ready = lock(&self.drq).poll(self.fences.as_ref(), self.metadata.as_ref());
        let n = ready.len();
        for unit in ready {
            self.dispatch(Job::Resume(unit));
        }
        n
    }

    /// Fail every unit whose fences are overdue. Returns how many expired.
    pub(crate) fn handle_timeouts(&self, now: Instant) -> usize {
        let expired = lock(&self.drq).expire(now);
        for unit in &expired {
            let name = self.node_name(unit.node);
            for fence in &unit.unsignaled {
                self.record_fence_error(FenceErrorEntry::new(
                    unit.node,
                    name.as_str(),
                    unit.request,
                    *fence,
                    FenceResult::Timeout,
                ));
            }
            let reason = format!(
                "{} fence(s) unsignaled after {:?} (seq {})",
                unit.unsignaled.len(),
                unit.waited,
                unit.unit.process_sequence_id
            );
            warn!("{} request {}: {}", name, unit.request, reason);
            if let Ok(slot) = self.node(unit.node) {
                slot.fail_request(self, unit.request, FailureStage::Timeout, reason);
            }
        }
        expired.len()
    }

    // ── Fence errors ──

    pub(crate) fn record_fence_error(&self, entry: FenceErrorEntry) {
        error!(
            "Fence {:?} of request {} on {} signaled {:?}",
            entry.fence, entry.request_id, entry.node_name, entry.result
        );
        lock(&self.fence_errors).push(entry);
    }

    pub fn fence_errors(&self) -> Vec<FenceErrorEntry> {
        lock(&self.fence_errors).snapshot()
    }

    pub fn fence_errors_recorded(&self) -> u64 {
        lock(&self.fence_errors).total_recorded()
    }

    pub fn dump_fence_errors(&self) {
        lock(&self.fence_errors).dump();
    }

    // ── Request tracking ──

    /// Admit `request` at pipeline level. Fails if it is already in flight
    /// or an in-flight request still holds its ring slot.
    pub(crate) fn begin_tracking(&self, request: &RequestContext) -> PipelineResult<()> {
        let r = request.request_id;
        let depth = self.config.queue_depth.max(1) as u64;
        let mut requests = lock(&self.requests);
        if requests.contains_key(&r) {
            return Err(PipelineError::InvalidArgument(format!(
                "request {} is already in flight",
                r
            )));
        }
        if let Some(busy) = requests.keys().find(|id| *id % depth == r % depth) {
            return Err(PipelineError::ResourceExhausted(format!(
                "request {} needs the ring slot of in-flight request {}",
                r, busy
            )));
        }
        requests.insert(
            r,
            RequestTracker {
                nodes: Vec::new(),
                pending: 0,
                sealed: false,
                failure: None,
                cancelled: false,
                batch: request.batch,
                started: Instant::now(),
            },
        );
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `node` was set up enabled for `request` and must finish before the
    /// request retires.
    pub(crate) fn track_node(&self, request: RequestId, node: NodeId) {
        if let Some(t) = lock(&self.requests).get_mut(&request) {
            t.nodes.push(node);
            t.pending += 1;
        }
    }

    /// Setup is over. Retires at once when no node was enabled.
    pub(crate) fn seal_tracking(&self, request: RequestId) {
        let retired = {
            let mut requests = lock(&self.requests);
            match requests.get_mut(&request) {
                Some(t) => {
                    t.sealed = true;
                    if t.pending == 0 {
                        requests.remove(&request)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(t) = retired {
            self.retire(request, t);
        }
    }

    pub fn is_in_flight(&self, request: RequestId) -> bool {
        lock(&self.requests).contains_key(&request)
    }

    pub fn in_flight(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = lock(&self.requests).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remember the first failure of `request` and report it.
    pub(crate) fn record_failure(
        &self,
        request: RequestId,
        node: NodeId,
        stage: FailureStage,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        if let Some(t) = lock(&self.requests).get_mut(&request) {
            if t.failure.is_none() {
                t.failure = Some(RequestFailure {
                    node,
                    stage,
                    reason: reason.clone(),
                });
            }
        }
        self.send_message(PipelineMessage::NodeError {
            node,
            node_name: self.node_name(node),
            request_id: request,
            stage,
            message: reason,
        });
    }

    pub(crate) fn mark_cancelled(&self, request: RequestId) {
        if let Some(t) = lock(&self.requests).get_mut(&request) {
            t.cancelled = true;
        }
    }

    /// A node finished `request`. The last one retires it.
    pub(crate) fn node_request_done(&self, node: NodeId, request: RequestId) {
        let retired = {
            let mut requests = lock(&self.requests);
            let Some(t) = requests.get_mut(&request) else {
                return;
            };
            t.pending = t.pending.saturating_sub(1);
            debug!(
                "{} done with request {} ({} nodes left)",
                self.node_name(node),
                request,
                t.pending
            );
            if t.sealed && t.pending == 0 {
                requests.remove(&request)
            } else {
                None
            }
        };
        if let Some(t) = retired {
            self.retire(request, t);
        }
    }

    /// Release the request's fences on every node and report the outcome.
    fn retire(&self, request: RequestId, tracker: RequestTracker) {
        for id in &tracker.nodes {
            if let Ok(slot) = self.node(*id) {
                slot.retire_request(self, request);
            }
        }
        let result = if tracker.cancelled {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            RequestResult::Cancelled
        } else if let Some(f) = tracker.failure {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            RequestResult::Failed {
                node: f.node,
                node_name: self.node_name(f.node),
                stage: f.stage,
                reason: f.reason,
            }
        } else {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            RequestResult::Success
        };
        let latency = tracker.started.elapsed();
        match &result {
            RequestResult::Success => debug!("Request {} complete in {:?}", request, latency),
            RequestResult::Cancelled => info!("Request {} cancelled", request),
            RequestResult::Failed { node_name, stage, reason, .. } => {
                warn!("Request {} failed at {} ({:?}): {}", request, node_name, stage, reason)
            }
        }
        self.send_message(PipelineMessage::RequestComplete {
            request_id: request,
            result,
            latency,
        });
        if tracker.batch.is_batched() && tracker.batch.is_last_in_batch() {
            debug!("Batch of {} closed by request {}", tracker.batch.batch_size, request);
            self.send_message(PipelineMessage::BatchComplete {
                last_request: request,
                batch_size: tracker.batch.batch_size,
            });
        }
    }

    fn send_message(&self, msg: PipelineMessage) {
        match self.messages.try_send(msg) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => warn!("Message channel full; dropping pipeline message"),
        }
    }

    pub fn counters(&self) -> RequestCounters {
        RequestCounters {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn worst_case_response(&self, node: &NodeSlot) -> Duration {
        node.worst_case_response()
            .unwrap_or_else(|| self.config.worst_case_response_time())
    }
}
