//! Rolling window of fence failures kept for postmortem dumps.

use crate::pipeline::fence::FenceResult;
use crate::pipeline::id::{FenceHandle, NodeId, RequestId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of most-recent fence errors retained.
pub const FENCE_ERROR_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FenceErrorEntry {
    pub node: NodeId,
    pub node_name: String,
    pub request_id: RequestId,
    /// `None` for a node that failed without any output fence to carry it.
    pub fence: Option<FenceHandle>,
    pub result: FenceResult,
    pub recorded_at: DateTime<Utc>,
}

impl FenceErrorEntry {
    /// Entry stamped with the current time.
    pub fn new(
        node: NodeId,
        node_name: impl Into<String>,
        request_id: RequestId,
        fence: FenceHandle,
        result: FenceResult,
    ) -> Self {
        Self {
            node,
            node_name: node_name.into(),
            request_id,
            fence: Some(fence),
            result,
            recorded_at: Utc::now(),
        }
    }

    /// Entry for a node with no output fence.
    pub fn without_fence(
        node: NodeId,
        node_name: impl Into<String>,
        request_id: RequestId,
        result: FenceResult,
    ) -> Self {
        Self {
            node,
            node_name: node_name.into(),
            request_id,
            fence: None,
            result,
            recorded_at: Utc::now(),
        }
    }
}

/// Fixed-size ring; the oldest entry is overwritten once full.
#[derive(Debug)]
pub struct FenceErrorBuffer {
    entries: Vec<Option<FenceErrorEntry>>,
    next: usize,
    total: u64,
}

impl Default for FenceErrorBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FenceErrorBuffer {
    pub fn new() -> Self {
        Self {
            entries: vec![None; FENCE_ERROR_CAPACITY],
            next: 0,
            total: 0,
        }
    }

    pub fn push(&mut self, entry: FenceErrorEntry) {
        self.entries[self.next] = Some(entry);
        self.next = (self.next + 1) % FENCE_ERROR_CAPACITY;
        self.total += 1;
    }

    /// Errors recorded since creation, including overwritten ones.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<FenceErrorEntry> {
        (0..FENCE_ERROR_CAPACITY)
            .filter_map(|i| self.entries[(self.next + i) % FENCE_ERROR_CAPACITY].clone())
            .collect()
    }

    pub fn dump(&self) {
        tracing::error!(
            "Fence error window: {} retained of {} recorded",
            self.len(),
            self.total
        );
        for e in self.snapshot() {
            tracing::error!(
                "  [{}] node {} ({:?}) request {} fence {:?} -> {:?}",
                e.recorded_at.format("%H:%M:%S%.3f"),
                e.node_name,
                e.node,
                e.request_id,
                e.fence,
                e.result
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(request_id: RequestId) -> FenceErrorEntry {
        FenceErrorEntry {
            node: NodeId(1),
            node_name: "ife".to_string(),
            request_id,
            fence: Some(FenceHandle(request_id + 1)),
            result: FenceResult::Failed,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_keeps_insertion_order_below_capacity() {
        let mut ring = FenceErrorBuffer::new();
        assert!(ring.is_empty());
        for r in 0..3 {
            ring.push(entry(r));
        }
        let ids: Vec<_> = ring.snapshot().iter().map(|e| e.request_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let mut ring = FenceErrorBuffer::new();
        for r in 0..(FENCE_ERROR_CAPACITY as u64 + 7) {
            ring.push(entry(r));
        }
        let snap = ring.snapshot();
        assert_eq!(snap.len(), FENCE_ERROR_CAPACITY);
        assert_eq!(snap.first().unwrap().request_id, 7);
        assert_eq!(snap.last().unwrap().request_id, FENCE_ERROR_CAPACITY as u64 + 6);
        assert_eq!(ring.total_recorded(), FENCE_ERROR_CAPACITY as u64 + 7);
    }
}
