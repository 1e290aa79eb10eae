//! Shared fences for output ports that complete in lock-step.
//!
//! Output ports declaring the same composite group get one fence per request.
//! Every port holds one reference to it; the fence goes back to the fence
//! provider when the last port lets go, and never before.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fence::FencePrimitive;
use crate::pipeline::id::FenceHandle;

#[derive(Debug, Clone)]
pub struct CompositePortFenceInfo {
    fence: FenceHandle,
    group: Option<u32>,
    /// Ports still holding a reference.
    holders: Vec<u16>,
    released: bool,
}

impl CompositePortFenceInfo {
    pub fn new(fence: FenceHandle, group: Option<u32>, ports: Vec<u16>) -> Self {
        Self {
            fence,
            group,
            holders: ports,
            released: false,
        }
    }

    pub fn fence(&self) -> FenceHandle {
        self.fence
    }

    pub fn group(&self) -> Option<u32> {
        self.group
    }

    pub fn ref_count(&self) -> usize {
        self.holders.len()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn covers(&self, port: u16) -> bool {
        self.holders.contains(&port)
    }

    /// Drop `port`'s reference. Returns true when this call released the
    /// fence to the provider.
    pub fn release_port(&mut self, port: u16, fences: &dyn FencePrimitive) -> PipelineResult<bool> {
        let pos = self.holders.iter().position(|&p| p == port).ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "port {} holds no reference on {:?}",
                port, self.fence
            ))
        })?;
        self.holders.swap_remove(pos);
        if self.holders.is_empty() && !self.released {
            self.released = true;
            fences.release(self.fence)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Release every remaining reference.
    pub fn release_all(&mut self, fences: &dyn FencePrimitive) -> PipelineResult<()> {
        while let Some(&port) = self.holders.first() {
            self.release_port(port, fences)?;
        }
        Ok(())
    }
}
