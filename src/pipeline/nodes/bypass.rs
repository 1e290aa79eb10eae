//! BypassNode: a stage that may skip itself per request.
//!
//! When the policy elects bypass, the base logic forwards the ancestor's
//! buffer downstream and the stage never runs. Otherwise the wrapped stage
//! runs as usual and produces its own buffer.

use crate::pipeline::context::RequestContext;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::fence::FenceResult;
use crate::pipeline::id::{FenceHandle, RequestId};
use crate::pipeline::negotiation::BufferNegotiationData;
use crate::pipeline::node::{
    BufferNegotiable, DeactivateMode, ExecuteContext, RequestExecutable, StreamLifecycle,
};
use crate::pipeline::node_type::NodeKind;
use crate::pipeline::nodes::StageNode;
use serde::{Deserialize, Serialize};

/// When a bypassable stage forwards its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BypassPolicy {
    #[default]
    Never,
    Always,
    /// Requests whose id is a multiple of `n`.
    EveryNth { n: u64 },
}

impl BypassPolicy {
    pub fn elects(&self, request: RequestId) -> bool {
        match self {
            BypassPolicy::Never => false,
            BypassPolicy::Always => true,
            BypassPolicy::EveryNth { n } => *n > 0 && request % n == 0,
        }
    }
}

pub struct BypassNode {
    policy: BypassPolicy,
    stage: StageNode,
    bypassed: u64,
}

impl BypassNode {
    pub fn new(kind: NodeKind, policy: BypassPolicy) -> Self {
        Self::wrap(StageNode::new(kind), policy)
    }

    pub fn wrap(stage: StageNode, policy: BypassPolicy) -> Self {
        Self {
            policy,
            stage,
            bypassed: 0,
        }
    }

    pub fn policy(&self) -> BypassPolicy {
        self.policy
    }

    pub fn kind(&self) -> NodeKind {
        self.stage.kind()
    }

    pub fn bypassed(&self) -> u64 {
        self.bypassed
    }

    pub fn processed(&self) -> u64 {
        self.stage.processed()
    }
}

impl BufferNegotiable for BypassNode {
    fn finalize_input_requirement(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        self.stage.finalize_input_requirement(data)
    }

    fn finalize_buffer_properties(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        self.stage.finalize_buffer_properties(data)
    }
}

impl RequestExecutable for BypassNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        self.stage.execute_process_request(ctx)
    }

    fn elects_bypass(&mut self, request: &RequestContext) -> bool {
        let elected = self.policy.elects(request.request_id);
        if elected {
            self.bypassed += 1;
        }
        elected
    }

    fn notify_request_processing_error(&mut self, request: RequestId, fence: FenceHandle, result: FenceResult) {
        self.stage.notify_request_processing_error(request, fence, result);
    }
}

impl StreamLifecycle for BypassNode {
    fn on_stream_on(&mut self) -> PipelineResult<()> {
        self.bypassed = 0;
        self.stage.on_stream_on()
    }

    fn on_stream_off(&mut self, mode: DeactivateMode) -> PipelineResult<()> {
        self.stage.on_stream_off(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policies() {
        assert!(!BypassPolicy::Never.elects(0));
        assert!(BypassPolicy::Always.elects(7));
        let every3 = BypassPolicy::EveryNth { n: 3 };
        let elected: Vec<RequestId> = (0..7).filter(|r| every3.elects(*r)).collect();
        assert_eq!(elected, vec![0, 3, 6]);
        assert!(!BypassPolicy::EveryNth { n: 0 }.elects(0));
    }

    #[test]
    fn test_election_is_counted() {
        let mut node = BypassNode::new(NodeKind::Jpeg, BypassPolicy::EveryNth { n: 2 });
        for r in 0..4 {
            node.elects_bypass(&RequestContext::new(r));
        }
        assert_eq!(node.bypassed(), 2);
    }

    #[test]
    fn test_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            bypass: BypassPolicy,
        }
        let w: Wrapper = toml::from_str("bypass = { policy = \"every_nth\", n = 4 }").unwrap();
        assert_eq!(w.bypass, BypassPolicy::EveryNth { n: 4 });
    }
}
