//! Core data types for camgraph
//!
//! This module contains the capture-request level types callers hand to the
//! engine: the request itself, its batch description and the HAL streams a
//! graph can serve.
//!
//! # Main Types
//!
//! - [`CaptureRequest`] - One frame request: id, enabled streams, settings
//! - [`BatchInfo`] - Position of the request inside a batched (HFR) capture
//! - [`StreamConfig`] - A HAL output stream (id, size, format)

use crate::pipeline::buffer::{Dimension, Format};
use crate::pipeline::id::{RequestId, StreamId, TagId};
use crate::pipeline::metadata::MetadataValue;
use crate::pipeline::negotiation::BufferRequirement;
use serde::{Deserialize, Serialize};

/// Batch position of a request. A batch size of 1 means no batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub batch_size: u32,
    pub index_in_batch: u32,
}

impl Default for BatchInfo {
    fn default() -> Self {
        Self {
            batch_size: 1,
            index_in_batch: 0,
        }
    }
}

impl BatchInfo {
    pub fn is_batched(&self) -> bool {
        self.batch_size > 1
    }

    pub fn is_last_in_batch(&self) -> bool {
        self.index_in_batch.saturating_add(1) >= self.batch_size
    }
}

/// A HAL stream the graph can fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
}

impl StreamConfig {
    pub fn dimension(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }

    /// The stream buffer is fixed: exact size and format.
    pub fn requirement(&self) -> BufferRequirement {
        BufferRequirement::exact(self.dimension()).with_format(Some(self.format))
    }
}

/// One capture request as submitted by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub request_id: RequestId,
    pub sync_id: u64,
    pub batch: BatchInfo,
    /// Streams to fill; nodes serving none of them stay idle.
    pub streams: Vec<StreamId>,
    /// Per-request settings written to the metadata pool before setup.
    pub settings: Vec<(TagId, MetadataValue)>,
}

impl CaptureRequest {
    pub fn new(request_id: RequestId, streams: impl IntoIterator<Item = StreamId>) -> Self {
        Self {
            request_id,
            sync_id: request_id,
            batch: BatchInfo::default(),
            streams: streams.into_iter().collect(),
            settings: Vec::new(),
        }
    }

    pub fn with_setting(mut self, tag: TagId, value: MetadataValue) -> Self {
        self.settings.push((tag, value));
        self
    }

    pub fn with_batch(mut self, batch: BatchInfo) -> Self {
        self.batch = batch;
        self
    }
}
