//! SinkNode: end of a branch.
//!
//! With a HAL stream output it fills the stream buffer once its input is
//! ready. Without outputs it only consumes its input.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::node::{BufferNegotiable, ExecuteContext, RequestExecutable, StreamLifecycle};

const INPUT_READY: u32 = 1;

pub struct SinkNode {
    delivered: u64,
}

impl SinkNode {
    pub fn new() -> Self {
        Self { delivered: 0 }
    }

    /// Frames handed to the stream since stream on.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

impl Default for SinkNode {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferNegotiable for SinkNode {}

impl RequestExecutable for SinkNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        if ctx.sequence_id() != INPUT_READY {
            let unit = ctx.input_dependency(INPUT_READY).build()?;
            if unit.has_any_dependency() {
                ctx.report_dependency(unit);
                return Ok(());
            }
        }
        self.delivered += 1;
        tracing::trace!("{} delivered request {}", ctx.node_name(), ctx.request_id());
        ctx.mark_metadata_done();
        Ok(())
    }
}

impl StreamLifecycle for SinkNode {
    fn on_stream_on(&mut self) -> PipelineResult<()> {
        self.delivered = 0;
        Ok(())
    }
}
