//! Fence primitive contract and a software implementation.
//!
//! The engine needs exactly five operations from a fence provider: create,
//! register-callback, signal, query and release. Hardware backends implement
//! `FencePrimitive` over their driver; `SoftwareFencePool` is the in-process
//! implementation used by the built-in nodes and the tests.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::FenceHandle;
use crate::pipeline::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Outcome carried by a signaled fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FenceResult {
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl FenceResult {
    pub fn is_success(self) -> bool {
        self == FenceResult::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Signaled(FenceResult),
}

impl FenceStatus {
    pub fn is_signaled(self) -> bool {
        matches!(self, FenceStatus::Signaled(_))
    }
}

/// Invoked once when the fence signals. Implementations must not block; the
/// engine's callbacks only post a message.
pub type FenceCallback = Box<dyn FnOnce(FenceHandle, FenceResult) + Send + 'static>;

#[cfg_attr(test, mockall::automock)]
pub trait FencePrimitive: Send + Sync {
    /// Create an unsignaled fence.
    fn create(&self, name: &str) -> PipelineResult<FenceHandle>;

    /// Register a callback. If the fence is already signaled the callback
    /// runs immediately on the calling thread.
    fn register_callback(&self, fence: FenceHandle, callback: FenceCallback)
        -> PipelineResult<()>;

    /// Signal the fence. Signaling twice is an error.
    fn signal(&self, fence: FenceHandle, result: FenceResult) -> PipelineResult<()>;

    fn status(&self, fence: FenceHandle) -> PipelineResult<FenceStatus>;

    /// Return the fence to the pool. The handle is invalid afterwards.
    fn release(&self, fence: FenceHandle) -> PipelineResult<()>;
}

struct FenceEntry {
    name: String,
    status: FenceStatus,
    callbacks: Vec<FenceCallback>,
}

#[derive(Default)]
struct PoolInner {
    next_handle: u64,
    fences: HashMap<FenceHandle, FenceEntry>,
    created: u64,
    released: u64,
}

/// Counters exposed for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FencePoolStats {
    pub created: u64,
    pub released: u64,
    pub live: usize,
}

/// Mutex-protected software fence table. Callbacks are always invoked with
/// the table unlocked.
#[derive(Default)]
pub struct SoftwareFencePool {
    inner: Mutex<PoolInner>,
}

impl SoftwareFencePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FencePoolStats {
        let inner = lock(&self.inner);
        FencePoolStats {
            created: inner.created,
            released: inner.released,
            live: inner.fences.len(),
        }
    }

    pub fn name_of(&self, fence: FenceHandle) -> Option<String> {
        lock(&self.inner).fences.get(&fence).map(|e| e.name.clone())
    }
}

impl FencePrimitive for SoftwareFencePool {
    fn create(&self, name: &str) -> PipelineResult<FenceHandle> {
        let mut inner = lock(&self.inner);
        inner.next_handle += 1;
        let handle = FenceHandle(inner.next_handle);
        inner.fences.insert(
            handle,
            FenceEntry {
                name: name.to_string(),
                status: FenceStatus::Pending,
                callbacks: Vec::new(),
            },
        );
        inner.created += 1;
        Ok(handle)
    }

    fn register_callback(
        &self,
        fence: FenceHandle,
        callback: FenceCallback,
    ) -> PipelineResult<()> {
        let fire_now = {
            let mut inner = lock(&self.inner);
            let entry = inner
                .fences
                .get_mut(&fence)
                .ok_or(PipelineError::UnknownFence(fence))?;
            match entry.status {
                FenceStatus::Pending => {
                    entry.callbacks.push(callback);
                    None
                }
                FenceStatus::Signaled(result) => Some((callback, result)),
            }
        };
        if let Some((callback, result)) = fire_now {
            callback(fence, result);
        }
        Ok(())
    }

    fn signal(&self, fence: FenceHandle, result: FenceResult) -> PipelineResult<()> {
        let callbacks = {
            let mut inner = lock(&self.inner);
            let entry = inner
                .fences
                .get_mut(&fence)
                .ok_or(PipelineError::UnknownFence(fence))?;
            if entry.status.is_signaled() {
                return Err(PipelineError::InvalidArgument(format!(
                    "fence {:?} ({}) already signaled",
                    fence, entry.name
                )));
            }
            entry.status = FenceStatus::Signaled(result);
            std::mem::take(&mut entry.callbacks)
        };
        tracing::trace!("Fence {:?} signaled {:?}, {} observers", fence, result, callbacks.len());
        for callback in callbacks {
            callback(fence, result);
        }
        Ok(())
    }

    fn status(&self, fence: FenceHandle) -> PipelineResult<FenceStatus> {
        lock(&self.inner)
            .fences
            .get(&fence)
            .map(|e| e.status)
            .ok_or(PipelineError::UnknownFence(fence))
    }

    fn release(&self, fence: FenceHandle) -> PipelineResult<()> {
        let mut inner = lock(&self.inner);
        if inner.fences.remove(&fence).is_none() {
            return Err(PipelineError::UnknownFence(fence));
        }
        inner.released += 1;
        Ok(())
    }
}
