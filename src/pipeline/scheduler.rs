//! Deferred request queue (DRQ).
//!
//! Holds the dependency units nodes reported and not yet satisfied. Entries
//! are indexed by the fences and `(tag, request)` properties they wait on, so
//! a signal or a publication only touches the entries it can unblock. A unit
//! leaves the queue exactly once: ready, expired, cleared or abandoned.

use crate::pipeline::dependency::DependencyUnit;
use crate::pipeline::fence::{FencePrimitive, FenceResult, FenceStatus};
use crate::pipeline::id::{FenceHandle, NodeId, RequestId, TagId};
use crate::pipeline::metadata::MetadataPool;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A unit whose conditions all hold, on its way back to its node.
#[derive(Debug, Clone)]
pub struct ReadyUnit {
    pub node: NodeId,
    pub request: RequestId,
    pub unit: DependencyUnit,
    /// Fences that signaled with an error while the unit waited.
    pub failed: Vec<(FenceHandle, FenceResult)>,
}

/// A unit dropped by the watchdog.
#[derive(Debug, Clone)]
pub struct TimedOutUnit {
    pub node: NodeId,
    pub request: RequestId,
    pub unit: DependencyUnit,
    pub unsignaled: Vec<FenceHandle>,
    pub waited: Duration,
}

#[derive(Debug)]
pub enum AddOutcome {
    /// Already satisfied; run it now.
    Ready(ReadyUnit),
    /// Queued. The caller registers callbacks on `watch`.
    Deferred { watch: Vec<FenceHandle> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrqStats {
    pub added: u64,
    pub deferred: u64,
    pub resolved: u64,
    pub expired: u64,
    pub cleared: u64,
    pub abandoned: u64,
}

#[derive(Debug)]
struct DeferredEntry {
    node: NodeId,
    request: RequestId,
    unit: DependencyUnit,
    pending_fences: Vec<FenceHandle>,
    pending_properties: Vec<(TagId, RequestId)>,
    failed: Vec<(FenceHandle, FenceResult)>,
    enqueued_at: Instant,
}

impl DeferredEntry {
    fn is_satisfied(&self) -> bool {
        self.pending_fences.is_empty() && self.pending_properties.is_empty()
    }

    fn into_ready(self) -> ReadyUnit {
        ReadyUnit {
            node: self.node,
            request: self.request,
            unit: self.unit,
            failed: self.failed,
        }
    }
}

/// Where a fence stands from the queue's point of view. A fence the provider
/// no longer knows was released by a retired request and counts as signaled.
fn fence_state(fences: &dyn FencePrimitive, fence: FenceHandle) -> Option<FenceResult> {
    match fences.status(fence) {
        Ok(FenceStatus::Pending) => None,
        Ok(FenceStatus::Signaled(result)) => Some(result),
        Err(_) => Some(FenceResult::Success),
    }
}

#[derive(Debug, Default)]
pub struct DeferredRequestQueue {
    entries: HashMap<u64, DeferredEntry>,
    next_key: u64,
    fence_waiters: HashMap<FenceHandle, Vec<u64>>,
    property_waiters: HashMap<(TagId, RequestId), Vec<u64>>,
    timeout: Option<Duration>,
    stats: DrqStats,
}

impl DeferredRequestQueue {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> DrqStats {
        self.stats
    }

    /// Units still queued for `(node, request)`.
    pub fn pending_for(&self, node: NodeId, request: RequestId) -> usize {
        self.entries
            .values()
            .filter(|e| e.node == node && e.request == request)
            .count()
    }

    /// Evaluate `unit` against the current fence and metadata state and
    /// queue whatever does not hold yet.
    pub fn add(
        &mut self,
        node: NodeId,
        request: RequestId,
        unit: DependencyUnit,
        fences: &dyn FencePrimitive,
        metadata: &dyn MetadataPool,
    ) -> AddOutcome {
        self.stats.added += 1;
        let mut entry = DeferredEntry {
            node,
            request,
            pending_fences: Vec::new(),
            pending_properties: Vec::new(),
            failed: Vec::new(),
            enqueued_at: Instant::now(),
            unit,
        };

        for req in &entry.unit.fences {
            if entry.pending_fences.contains(&req.fence) {
                continue;
            }
            match fence_state(fences, req.fence) {
                None => entry.pending_fences.push(req.fence),
                Some(result) if !result.is_success() => entry.failed.push((req.fence, result)),
                Some(_) => {}
            }
        }
        for prop in &entry.unit.properties {
            // Offsets reaching before request 0 hold trivially.
            let Some(addressed) = prop.addressed_request(request) else {
                continue;
            };
            let key = (prop.tag, addressed);
            if !metadata.is_published(prop.tag, addressed) && !entry.pending_properties.contains(&key) {
                entry.pending_properties.push(key);
            }
        }

        if entry.is_satisfied() {
            self.stats.resolved += 1;
            return AddOutcome::Ready(entry.into_ready());
        }

        let key = self.next_key;
        self.next_key += 1;
        for fence in &entry.pending_fences {
            self.fence_waiters.entry(*fence).or_default().push(key);
        }
        for prop in &entry.pending_properties {
            self.property_waiters.entry(*prop).or_default().push(key);
        }
        let watch = entry.pending_fences.clone();
        tracing::debug!(
            "DRQ: {:?} request {} seq {} waits on {} fences, {} properties",
            node,
            request,
            entry.unit.process_sequence_id,
            entry.pending_fences.len(),
            entry.pending_properties.len()
        );
        self.entries.insert(key, entry);
        self.stats.deferred += 1;
        AddOutcome::Deferred { watch }
    }

    /// A watched fence signaled.
    pub fn fence_signaled(&mut self, fence: FenceHandle, result: FenceResult) -> Vec<ReadyUnit> {
        let Some(keys) = self.fence_waiters.remove(&fence) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for key in keys {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            entry.pending_fences.retain(|f| *f != fence);
            if !result.is_success() {
                entry.failed.push((fence, result));
            }
            if entry.is_satisfied() {
                if let Some(entry) = self.remove_entry(key) {
                    ready.push(entry.into_ready());
                }
            }
        }
        self.stats.resolved += ready.len() as u64;
        ready
    }

    /// `tag` became available for `request`.
    pub fn property_published(&mut self, tag: TagId, request: RequestId) -> Vec<ReadyUnit> {
        let Some(keys) = self.property_waiters.remove(&(tag, request)) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for key in keys {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            entry.pending_properties.retain(|p| *p != (tag, request));
            if entry.is_satisfied() {
                if let Some(entry) = self.remove_entry(key) {
                    ready.push(entry.into_ready());
                }
            }
        }
        self.stats.resolved += ready.len() as u64;
        ready
    }

    /// Re-check every queued unit. Drives progress in polling fence mode.
    pub fn poll(&mut self, fences: &dyn FencePrimitive, metadata: &dyn MetadataPool) -> Vec<ReadyUnit> {
        let mut signaled: Vec<(FenceHandle, FenceResult)> = Vec::new();
        for fence in self.fence_waiters.keys() {
            if let Some(result) = fence_state(fences, *fence) {
                signaled.push((*fence, result));
            }
        }
        let published: Vec<(TagId, RequestId)> = self
            .property_waiters
            .keys()
            .filter(|(tag, request)| metadata.is_published(*tag, *request))
            .copied()
            .collect();

        let mut ready = Vec::new();
        for (fence, result) in signaled {
            ready.extend(self.fence_signaled(fence, result));
        }
        for (tag, request) in published {
            ready.extend(self.property_published(tag, request));
        }
        ready
    }

    /// Remove units that waited longer than the configured timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<TimedOutUnit> {
        let Some(timeout) = self.timeout else {
            return Vec::new();
        };
        let overdue: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.enqueued_at) >= timeout)
            .map(|(k, _)| *k)
            .collect();
        let mut expired = Vec::with_capacity(overdue.len());
        for key in overdue {
            if let Some(entry) = self.remove_entry(key) {
                expired.push(TimedOutUnit {
                    node: entry.node,
                    request: entry.request,
                    waited: now.saturating_duration_since(entry.enqueued_at),
                    unsignaled: entry.pending_fences,
                    unit: entry.unit,
                });
            }
        }
        self.stats.expired += expired.len() as u64;
        expired
    }

    /// Drop every unit of `(node, request)`. Returns how many were dropped;
    /// a second call returns 0.
    pub fn clear_dependencies(&mut self, node: NodeId, request: RequestId) -> usize {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.node == node && e.request == request)
            .map(|(k, _)| *k)
            .collect();
        let cleared = keys.iter().filter_map(|k| self.remove_entry(*k)).count();
        self.stats.cleared += cleared as u64;
        cleared
    }

    /// Drop preemptable units, as when the pipeline stops. Units of
    /// `ordered` nodes are kept: their hardware queue must see every
    /// submission in order, so only a flush may drop them.
    pub fn abandon_preemptable(&mut self, ordered: &[NodeId]) -> Vec<(NodeId, RequestId)> {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.unit.is_preemptable() && !ordered.contains(&e.node))
            .map(|(k, _)| *k)
            .collect();
        let dropped: Vec<(NodeId, RequestId)> = keys
            .iter()
            .filter_map(|k| self.remove_entry(*k))
            .map(|e| (e.node, e.request))
            .collect();
        self.stats.abandoned += dropped.len() as u64;
        dropped
    }

    fn remove_entry(&mut self, key: u64) -> Option<DeferredEntry> {
        let entry = self.entries.remove(&key)?;
        for fence in &entry.pending_fences {
            if let Some(keys) = self.fence_waiters.get_mut(fence) {
                keys.retain(|k| *k != key);
                if keys.is_empty() {
                    self.fence_waiters.remove(fence);
                }
            }
        }
        for prop in &entry.pending_properties {
            if let Some(keys) = self.property_waiters.get_mut(prop) {
                keys.retain(|k| *k != key);
                if keys.is_empty() {
                    self.property_waiters.remove(prop);
                }
            }
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dependency::PropertyRequirement;
    use crate::pipeline::fence::SoftwareFencePool;
    use crate::pipeline::metadata::{InMemoryMetadataPool, MetadataValue};

    const TAG: TagId = TagId(0x77);

    fn setup() -> (DeferredRequestQueue, SoftwareFencePool, InMemoryMetadataPool) {
        (
            DeferredRequestQueue::new(None),
            SoftwareFencePool::new(),
            InMemoryMetadataPool::new(0, 8),
        )
    }

    #[test]
    fn test_satisfied_unit_is_ready_immediately() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        fences.signal(f, FenceResult::Success).unwrap();
        let unit = DependencyUnit::builder(3).buffer_fence(f).build().unwrap();
        match drq.add(NodeId(1), 4, unit, &fences, &meta) {
            AddOutcome::Ready(r) => {
                assert_eq!(r.unit.process_sequence_id, 3);
                assert!(r.failed.is_empty());
            }
            other => panic!("expected ready, got {:?}", other),
        }
        assert!(drq.is_empty());
    }

    #[test]
    fn test_unit_waits_for_every_condition() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        let unit = DependencyUnit::builder(1)
            .buffer_fence(f)
            .property(PropertyRequirement::current(TAG))
            .build()
            .unwrap();
        let AddOutcome::Deferred { watch } = drq.add(NodeId(2), 5, unit, &fences, &meta) else {
            panic!("expected deferral");
        };
        assert_eq!(watch, vec![f]);

        assert!(drq.fence_signaled(f, FenceResult::Success).is_empty());
        assert_eq!(drq.pending_for(NodeId(2), 5), 1);

        meta.write_data_list(0, 5, &[(TAG, MetadataValue::Int(1))]);
        let ready = drq.property_published(TAG, 5);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].node, NodeId(2));
        assert!(drq.is_empty());
    }

    #[test]
    fn test_previous_request_property() {
        let (mut drq, fences, meta) = setup();
        let unit = DependencyUnit::builder(1)
            .property(PropertyRequirement::previous(TAG, 1))
            .build()
            .unwrap();
        // Request 0 has no predecessor.
        assert!(matches!(
            drq.add(NodeId(0), 0, unit.clone(), &fences, &meta),
            AddOutcome::Ready(_)
        ));
        assert!(matches!(
            drq.add(NodeId(0), 3, unit, &fences, &meta),
            AddOutcome::Deferred { .. }
        ));
        assert_eq!(drq.property_published(TAG, 2).len(), 1);
    }

    #[test]
    fn test_failed_fence_is_carried() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        let unit = DependencyUnit::builder(1).buffer_fence(f).build().unwrap();
        drq.add(NodeId(1), 0, unit, &fences, &meta);
        let ready = drq.fence_signaled(f, FenceResult::Failed);
        assert_eq!(ready[0].failed, vec![(f, FenceResult::Failed)]);
    }

    #[test]
    fn test_released_fence_counts_as_signaled() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("gone").unwrap();
        fences.signal(f, FenceResult::Success).unwrap();
        fences.release(f).unwrap();
        let unit = DependencyUnit::builder(1).buffer_fence(f).build().unwrap();
        assert!(matches!(
            drq.add(NodeId(1), 0, unit, &fences, &meta),
            AddOutcome::Ready(_)
        ));
    }

    #[test]
    fn test_clear_dependencies_is_idempotent() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        for seq in 0..2 {
            let unit = DependencyUnit::builder(seq).buffer_fence(f).build().unwrap();
            drq.add(NodeId(1), 9, unit, &fences, &meta);
        }
        assert_eq!(drq.clear_dependencies(NodeId(1), 9), 2);
        assert_eq!(drq.clear_dependencies(NodeId(1), 9), 0);
        assert!(drq.is_empty());
        // The waiter index went with the entries.
        assert!(drq.fence_signaled(f, FenceResult::Success).is_empty());
    }

    #[test]
    fn test_poll_finds_signaled_fences() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        let unit = DependencyUnit::builder(1).buffer_fence(f).build().unwrap();
        drq.add(NodeId(1), 0, unit, &fences, &meta);
        assert!(drq.poll(&fences, &meta).is_empty());
        fences.signal(f, FenceResult::Success).unwrap();
        assert_eq!(drq.poll(&fences, &meta).len(), 1);
    }

    #[test]
    fn test_expire_reports_unsignaled_fences() {
        let fences = SoftwareFencePool::new();
        let meta = InMemoryMetadataPool::new(0, 8);
        let mut drq = DeferredRequestQueue::new(Some(Duration::from_millis(5)));
        let f = fences.create("stuck").unwrap();
        let unit = DependencyUnit::builder(1).buffer_fence(f).build().unwrap();
        drq.add(NodeId(4), 2, unit, &fences, &meta);

        assert!(drq.expire(Instant::now()).is_empty());
        let later = Instant::now() + Duration::from_millis(10);
        let expired = drq.expire(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].unsignaled, vec![f]);
        assert_eq!(drq.stats().expired, 1);
    }

    #[test]
    fn test_abandon_only_preemptable() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        let keep = DependencyUnit::builder(1).buffer_fence(f).build().unwrap();
        let spare = DependencyUnit::builder(2).buffer_fence(f).preemptable().build().unwrap();
        drq.add(NodeId(1), 0, keep, &fences, &meta);
        drq.add(NodeId(1), 0, spare, &fences, &meta);
        assert_eq!(drq.abandon_preemptable(&[]), vec![(NodeId(1), 0)]);
        assert_eq!(drq.len(), 1);
    }

    #[test]
    fn test_abandon_keeps_ordered_nodes() {
        let (mut drq, fences, meta) = setup();
        let f = fences.create("in").unwrap();
        for node in [NodeId(1), NodeId(2)] {
            let unit = DependencyUnit::builder(1).buffer_fence(f).preemptable().build().unwrap();
            drq.add(node, 3, unit, &fences, &meta);
        }
        assert_eq!(drq.abandon_preemptable(&[NodeId(2)]), vec![(NodeId(1), 3)]);
        assert_eq!(drq.len(), 1);
        assert_eq!(drq.clear_dependencies(NodeId(2), 3), 1);
        assert_eq!(drq.stats().abandoned, 1);
    }
}
