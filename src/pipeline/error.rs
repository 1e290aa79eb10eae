//! Pipeline-specific error types.

use crate::pipeline::fence::FenceResult;
use crate::pipeline::id::{FenceHandle, NodeId, PortId, RequestId};
use crate::pipeline::request::PerRequestNodeStatus;
use thiserror::Error;

/// Errors that can occur within the node-graph engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Buffer negotiation failed at node {node:?} port {port:?}: {reason}")]
    NegotiationFailure {
        node: NodeId,
        port: Option<u16>,
        reason: String,
    },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Fence {fence:?} signaled with {result:?}")]
    FenceError {
        fence: FenceHandle,
        result: FenceResult,
    },

    /// Scheduler invariant breach. Never recoverable.
    #[error("Request {request} submitted twice on node {node:?}")]
    DoubleSubmission { node: NodeId, request: RequestId },

    #[error("Illegal request status transition {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: PerRequestNodeStatus,
        to: PerRequestNodeStatus,
    },

    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("Unknown port {0:?}")]
    UnknownPort(PortId),

    #[error("Unknown fence {0:?}")]
    UnknownFence(FenceHandle),

    #[error("Cycle detected in pipeline graph")]
    CycleDetected,

    #[error("Pipeline is not streaming")]
    NotStreaming,

    #[error("Operation not allowed while streaming")]
    Streaming,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Node {node:?} error: {message}")]
    Node { node: NodeId, message: String },

    #[error("Channel send error")]
    ChannelSend,
}

impl PipelineError {
    /// Fatal errors abort instead of being reported per request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::DoubleSubmission { .. })
    }

    pub fn negotiation(node: NodeId, port: Option<u16>, reason: impl Into<String>) -> Self {
        PipelineError::NegotiationFailure {
            node,
            port,
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Log a scheduler invariant breach and abort the calling thread.
pub fn fatal_invariant(err: &PipelineError) -> ! {
    tracing::error!("Fatal scheduler invariant breach: {}", err);
    panic!("fatal scheduler invariant breach: {}", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_double_submission_is_fatal() {
        let fatal = PipelineError::DoubleSubmission {
            node: NodeId(1),
            request: 4,
        };
        assert!(fatal.is_fatal());
        assert!(!PipelineError::ResourceExhausted("pool".into()).is_fatal());
        assert!(!PipelineError::negotiation(NodeId(0), Some(1), "min > max").is_fatal());
    }

    #[test]
    #[should_panic(expected = "submitted twice")]
    fn test_fatal_invariant_panics() {
        fatal_invariant(&PipelineError::DoubleSubmission {
            node: NodeId(0),
            request: 1,
        });
    }

    #[test]
    fn test_negotiation_display() {
        let err = PipelineError::negotiation(NodeId(2), Some(0), "width 640 above max 320");
        let text = err.to_string();
        assert!(text.contains("node#2"));
        assert!(text.contains("width 640 above max 320"));
    }
}
