//! Per-(node, request) lifecycle state.
//!
//! Every node keeps a ring of `PerRequestInfo` slots indexed by
//! `request_id % queue_depth`. All fields are atomics: fence callbacks on
//! worker threads read them concurrently with the node's own execution.
//!
//! ```text
//! Uninitialized -> Setup -> Running <-> Deferred
//!                             |
//!                             +-> Success -> Submit
//!                             +-> Error
//!   (Setup | Deferred | Running | Success | Submit) -> Cancelled
//! ```

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{NodeId, RequestId};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum PerRequestNodeStatus {
    Uninitialized = 0,
    Setup = 1,
    Deferred = 2,
    Running = 3,
    Success = 4,
    Error = 5,
    Cancelled = 6,
    /// Handed to the hardware queue.
    Submit = 7,
}

impl PerRequestNodeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Setup,
            2 => Self::Deferred,
            3 => Self::Running,
            4 => Self::Success,
            5 => Self::Error,
            6 => Self::Cancelled,
            7 => Self::Submit,
            _ => Self::Uninitialized,
        }
    }

    /// No further execution will happen for the request.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Submit | Self::Error | Self::Cancelled
        )
    }

    fn has_executed(self) -> bool {
        matches!(self, Self::Success | Self::Submit)
    }
}

const NO_REQUEST: u64 = u64::MAX;

/// One ring slot.
#[derive(Debug)]
pub struct PerRequestInfo {
    node: NodeId,
    request_id: AtomicU64,
    status: AtomicU8,
    enabled: AtomicBool,
    num_unsignaled_fences: AtomicU32,
    outstanding_units: AtomicU32,
    request_complete: AtomicBool,
    partial_metadata_done: AtomicBool,
    metadata_done: AtomicBool,
}

impl PerRequestInfo {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            request_id: AtomicU64::new(NO_REQUEST),
            status: AtomicU8::new(PerRequestNodeStatus::Uninitialized as u8),
            enabled: AtomicBool::new(false),
            num_unsignaled_fences: AtomicU32::new(0),
            outstanding_units: AtomicU32::new(0),
            request_complete: AtomicBool::new(false),
            partial_metadata_done: AtomicBool::new(false),
            metadata_done: AtomicBool::new(false),
        }
    }

    /// Claim the slot for `request_id`, moving it to `Setup`.
    pub fn reset_for(&self, request_id: RequestId, enabled: bool, unsignaled_fences: u32) {
        self.num_unsignaled_fences
            .store(unsignaled_fences, Ordering::SeqCst);
        self.outstanding_units.store(0, Ordering::SeqCst);
        self.request_complete.store(!enabled, Ordering::SeqCst);
        self.partial_metadata_done.store(false, Ordering::SeqCst);
        self.metadata_done.store(false, Ordering::SeqCst);
        self.enabled.store(enabled, Ordering::SeqCst);
        self.status
            .store(PerRequestNodeStatus::Setup as u8, Ordering::SeqCst);
        self.request_id.store(request_id, Ordering::SeqCst);
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self.request_id.load(Ordering::SeqCst) {
            NO_REQUEST => None,
            id => Some(id),
        }
    }

    /// True when the slot currently holds `request_id`.
    pub fn holds(&self, request_id: RequestId) -> bool {
        self.request_id.load(Ordering::SeqCst) == request_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PerRequestNodeStatus {
        PerRequestNodeStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Validated, lock-free transition. Returns the previous status.
    ///
    /// Moving to `Success` (or `Submit`) a second time, or trying to run a
    /// request that already succeeded, yields `DoubleSubmission`.
    pub fn set_request_status(
        &self,
        to: PerRequestNodeStatus,
    ) -> PipelineResult<PerRequestNodeStatus> {
        use PerRequestNodeStatus::*;
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            let from = PerRequestNodeStatus::from_u8(current);
            let allowed = match to {
                Setup => true,
                Running => matches!(from, Setup | Deferred),
                Deferred => matches!(from, Running | Deferred),
                Success => from == Running,
                Submit => from == Success,
                Error => !matches!(from, Cancelled | Uninitialized),
                Cancelled => from != Uninitialized && from != Error,
                Uninitialized => false,
            };
            if !allowed {
                let double = match to {
                    Success | Running => from.has_executed(),
                    Submit => from == Submit,
                    _ => false,
                };
                if double {
                    return Err(PipelineError::DoubleSubmission {
                        node: self.node,
                        request: self.request_id.load(Ordering::SeqCst),
                    });
                }
                return Err(PipelineError::InvalidStateTransition { from, to });
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unsignaled_fences(&self) -> u32 {
        self.num_unsignaled_fences.load(Ordering::SeqCst)
    }

    /// Returns the remaining count.
    pub fn fence_signaled(&self) -> u32 {
        let prev = self
            .num_unsignaled_fences
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn add_outstanding_units(&self, n: u32) {
        self.outstanding_units.fetch_add(n, Ordering::SeqCst);
    }

    /// Returns the remaining count.
    pub fn unit_resolved(&self) -> u32 {
        let prev = self
            .outstanding_units
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn outstanding_units(&self) -> u32 {
        self.outstanding_units.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.request_complete.load(Ordering::SeqCst)
    }

    /// Mark the request complete. Only the first caller gets `true`.
    pub fn try_mark_complete(&self) -> bool {
        !self.request_complete.swap(true, Ordering::SeqCst)
    }

    pub fn mark_partial_metadata_done(&self) {
        self.partial_metadata_done.store(true, Ordering::SeqCst);
    }

    pub fn mark_metadata_done(&self) {
        self.partial_metadata_done.store(true, Ordering::SeqCst);
        self.metadata_done.store(true, Ordering::SeqCst);
    }

    pub fn partial_metadata_done(&self) -> bool {
        self.partial_metadata_done.load(Ordering::SeqCst)
    }

    pub fn metadata_done(&self) -> bool {
        self.metadata_done.load(Ordering::SeqCst)
    }
}

/// Fixed-depth ring of request slots.
#[derive(Debug)]
pub struct RequestRing {
    slots: Box<[PerRequestInfo]>,
}

impl RequestRing {
    pub fn new(node: NodeId, depth: usize) -> Self {
        let slots = (0..depth.max(1)).map(|_| PerRequestInfo::new(node)).collect();
        Self { slots }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index(&self, request_id: RequestId) -> usize {
        (request_id % self.slots.len() as u64) as usize
    }

    pub fn slot(&self, request_id: RequestId) -> &PerRequestInfo {
        &self.slots[self.slot_index(request_id)]
    }

    /// The slot, only if it still belongs to `request_id`.
    pub fn get(&self, request_id: RequestId) -> Option<&PerRequestInfo> {
        let slot = self.slot(request_id);
        slot.holds(request_id).then_some(slot)
    }
}
