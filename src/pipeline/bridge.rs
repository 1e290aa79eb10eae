//! Thread boundary between the scheduling engine and its caller.
//!
//! Worker threads report request completions and node errors as
//! `PipelineMessage`s over a crossbeam channel; the caller holds the
//! `PipelineBridge` end.

use crate::pipeline::id::{NodeId, RequestId};
use crate::pipeline::lock;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Where in a request's life a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureStage {
    /// Buffer or fence allocation while admitting the request.
    Setup,
    /// The node's own execution returned an error.
    Execute,
    /// An output fence signaled with an error.
    Fence,
    /// A dependency fence never signaled.
    Timeout,
    /// An input arrived errored from a producer.
    Upstream,
}

/// Final outcome of one capture request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RequestResult {
    Success,
    /// The first failure recorded for the request.
    Failed {
        node: NodeId,
        node_name: String,
        stage: FailureStage,
        reason: String,
    },
    Cancelled,
}

impl RequestResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestResult::Success)
    }
}

/// Messages sent from the engine to the caller.
#[derive(Debug, Clone)]
pub enum PipelineMessage {
    /// Every enabled node finished the request and its fences were released.
    RequestComplete {
        request_id: RequestId,
        result: RequestResult,
        latency: Duration,
    },

    /// The last request of a batched (HFR) capture completed. Sent after
    /// that request's own `RequestComplete`.
    BatchComplete {
        last_request: RequestId,
        batch_size: u32,
    },

    /// A node failed a request. The request still completes.
    NodeError {
        node: NodeId,
        node_name: String,
        request_id: RequestId,
        stage: FailureStage,
        message: String,
    },
}

/// Channel capacity for messages (engine → caller).
pub(crate) const MSG_CHANNEL_CAPACITY: usize = 10_000;

/// Caller-side handle for receiving engine messages.
pub struct PipelineBridge {
    msg_rx: Receiver<PipelineMessage>,
    /// Messages received while waiting for a specific request.
    stash: Mutex<VecDeque<PipelineMessage>>,
}

impl std::fmt::Debug for PipelineBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBridge").finish_non_exhaustive()
    }
}

impl PipelineBridge {
    /// Create a bridge and the sender the engine reports through.
    pub fn new() -> (Self, Sender<PipelineMessage>) {
        let (msg_tx, msg_rx) = bounded(MSG_CHANNEL_CAPACITY);
        (
            Self {
                msg_rx,
                stash: Mutex::new(VecDeque::new()),
            },
            msg_tx,
        )
    }

    /// Drain all pending messages.
    pub fn drain(&self) -> Vec<PipelineMessage> {
        let mut msgs: Vec<PipelineMessage> = lock(&self.stash).drain(..).collect();
        while let Ok(msg) = self.msg_rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    /// Try to receive a single message without blocking.
    pub fn try_recv(&self) -> Option<PipelineMessage> {
        if let Some(msg) = lock(&self.stash).pop_front() {
            return Some(msg);
        }
        self.msg_rx.try_recv().ok()
    }

    /// Block until `request_id` completes. Other messages received in the
    /// meantime stay queued for `drain`/`try_recv`.
    pub fn wait_for_request(&self, request_id: RequestId, timeout: Duration) -> Option<RequestResult> {
        {
            let mut stash = lock(&self.stash);
            if let Some(pos) = stash.iter().position(|m| completes(m, request_id)) {
                return stash.remove(pos).and_then(into_result);
            }
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.msg_rx.recv_timeout(remaining) {
                Ok(msg) if completes(&msg, request_id) => return into_result(msg),
                Ok(msg) => lock(&self.stash).push_back(msg),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

fn completes(msg: &PipelineMessage, request_id: RequestId) -> bool {
    matches!(msg, PipelineMessage::RequestComplete { request_id: r, .. } if *r == request_id)
}

fn into_result(msg: PipelineMessage) -> Option<RequestResult> {
    match msg {
        PipelineMessage::RequestComplete { result, .. } => Some(result),
        PipelineMessage::BatchComplete { .. } | PipelineMessage::NodeError { .. } => None,
    }
}
