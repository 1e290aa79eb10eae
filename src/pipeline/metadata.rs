//! Per-request metadata pool.
//!
//! The pool is a collaborator: the engine only needs to write a list of
//! tags for a request, read them back at a signed request offset, and ask
//! whether a tag has been published. `InMemoryMetadataPool` keeps one slot
//! per request in a ring the size of the queue depth.

use crate::pipeline::id::{RequestId, TagId};
use crate::pipeline::lock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Well-known tags published by the built-in nodes.
pub mod tags {
    use crate::pipeline::id::TagId;

    pub const SENSOR_EXPOSURE_NS: TagId = TagId(0x0001_0001);
    pub const SENSOR_GAIN: TagId = TagId(0x0001_0002);
    pub const SENSOR_TIMESTAMP_NS: TagId = TagId(0x0001_0003);
    pub const SENSOR_FRAME_DURATION_NS: TagId = TagId(0x0001_0004);

    pub const STATS_AWB_GAINS: TagId = TagId(0x0002_0001);
    pub const STATS_AEC_LUX: TagId = TagId(0x0002_0002);

    pub const IQ_REGISTER_DIGEST: TagId = TagId(0x0003_0001);
    pub const JPEG_QUALITY: TagId = TagId(0x0003_0002);

    /// Stage tags are allocated from here, per node.
    pub const STAGE_RESULT_BASE: TagId = TagId(0x0010_0000);

    pub fn stage_result(node_index: u32) -> TagId {
        TagId(STAGE_RESULT_BASE.0 + node_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Floats(Vec<f64>),
    Text(String),
}

impl MetadataValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}

/// A tag read, addressed relative to the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagQuery {
    pub tag: TagId,
    pub offset: u64,
    pub negate: bool,
}

impl TagQuery {
    pub fn current(tag: TagId) -> Self {
        Self {
            tag,
            offset: 0,
            negate: false,
        }
    }

    fn resolve(&self, request: RequestId) -> Option<RequestId> {
        if self.negate {
            request.checked_add(self.offset)
        } else {
            request.checked_sub(self.offset)
        }
    }
}

pub trait MetadataPool: Send + Sync {
    fn pipeline_id(&self) -> u32;

    /// Reset the slot for a new request.
    fn invalidate(&self, request: RequestId);

    fn write_data_list(&self, pipeline_id: u32, request: RequestId, entries: &[(TagId, MetadataValue)]);

    /// One result per query, `None` for tags not (yet) published.
    fn get_data_list(
        &self,
        pipeline_id: u32,
        request: RequestId,
        queries: &[TagQuery],
    ) -> Vec<Option<MetadataValue>>;

    fn is_published(&self, tag: TagId, request: RequestId) -> bool;
}

#[derive(Debug, Default)]
struct Slot {
    request: Option<RequestId>,
    values: HashMap<TagId, MetadataValue>,
}

#[derive(Debug)]
pub struct InMemoryMetadataPool {
    pipeline_id: u32,
    slots: Vec<Mutex<Slot>>,
}

impl InMemoryMetadataPool {
    pub fn new(pipeline_id: u32, depth: usize) -> Self {
        Self {
            pipeline_id,
            slots: (0..depth.max(1)).map(|_| Mutex::new(Slot::default())).collect(),
        }
    }

    fn slot(&self, request: RequestId) -> &Mutex<Slot> {
        &self.slots[(request % self.slots.len() as u64) as usize]
    }

    fn read(&self, request: RequestId, tag: TagId) -> Option<MetadataValue> {
        let slot = lock(self.slot(request));
        if slot.request != Some(request) {
            return None;
        }
        slot.values.get(&tag).cloned()
    }
}

impl MetadataPool for InMemoryMetadataPool {
    fn pipeline_id(&self) -> u32 {
        self.pipeline_id
    }

    fn invalidate(&self, request: RequestId) {
        let mut slot = lock(self.slot(request));
        slot.request = Some(request);
        slot.values.clear();
    }

    fn write_data_list(&self, pipeline_id: u32, request: RequestId, entries: &[(TagId, MetadataValue)]) {
        if pipeline_id != self.pipeline_id {
            tracing::warn!(
                "Metadata write for pipeline {} dropped by pool of pipeline {}",
                pipeline_id,
                self.pipeline_id
            );
            return;
        }
        let mut slot = lock(self.slot(request));
        if slot.request != Some(request) {
            slot.request = Some(request);
            slot.values.clear();
        }
        for (tag, value) in entries {
            slot.values.insert(*tag, value.clone());
        }
    }

    fn get_data_list(
        &self,
        pipeline_id: u32,
        request: RequestId,
        queries: &[TagQuery],
    ) -> Vec<Option<MetadataValue>> {
        queries
            .iter()
            .map(|q| {
                if pipeline_id != self.pipeline_id {
                    return None;
                }
                q.resolve(request).and_then(|r| self.read(r, q.tag))
            })
            .collect()
    }

    fn is_published(&self, tag: TagId, request: RequestId) -> bool {
        self.read(request, tag).is_some()
    }
}
