//! Port descriptors and per-port runtime state.
//!
//! A node declares its ports with `InputPortDesc` / `OutputPortDesc`. The
//! pipeline turns them into `InputPort` / `OutputPort`, which hold the link
//! to the producer (by id, never by pointer), the negotiation results and,
//! for outputs, the owned buffer pool.

use crate::pipeline::buffer::{BufferProperties, Format, ImageBufferManager};
use crate::pipeline::id::{PortId, StreamId};
use crate::pipeline::negotiation::BufferRequirement;
use serde::{Deserialize, Serialize};

/// Set of HAL streams, one bit per `StreamId`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StreamMask(pub u64);

impl StreamMask {
    pub const EMPTY: StreamMask = StreamMask(0);
    pub const ALL: StreamMask = StreamMask(u64::MAX);

    pub fn single(stream: StreamId) -> Self {
        if stream.0 >= StreamId::MAX_STREAMS {
            return Self::EMPTY;
        }
        StreamMask(1 << stream.0)
    }

    pub fn from_streams(streams: impl IntoIterator<Item = StreamId>) -> Self {
        streams.into_iter().fold(Self::EMPTY, |m, s| m.union(Self::single(s)))
    }

    pub fn union(self, other: Self) -> Self {
        StreamMask(self.0 | other.0)
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, stream: StreamId) -> bool {
        self.intersects(Self::single(stream))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for StreamMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamMask({:#x})", self.0)
    }
}

/// A HAL stream bound to a sink output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStream {
    pub stream: StreamId,
    pub requirement: BufferRequirement,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputPortDesc {
    pub name: String,
    pub requirement: BufferRequirement,
    /// The input reads a buffer supplied from outside the graph.
    pub is_source_buffer: bool,
}

impl InputPortDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn requirement(mut self, requirement: BufferRequirement) -> Self {
        self.requirement = requirement;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputPortDesc {
    pub name: String,
    pub format: Option<Format>,
    /// Sizes this port can produce.
    pub capability: BufferRequirement,
    /// Used only by fallback negotiation.
    pub default_properties: Option<BufferProperties>,
    /// Ports sharing a group share one fence per request.
    pub composite_group: Option<u32>,
    pub sink: Option<SinkStream>,
    /// Overrides the pipeline's default pool size.
    pub buffer_count: Option<usize>,
}

impl OutputPortDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn capability(mut self, capability: BufferRequirement) -> Self {
        self.capability = capability;
        self
    }

    pub fn default_properties(mut self, props: BufferProperties) -> Self {
        self.default_properties = Some(props);
        self
    }

    pub fn composite_group(mut self, group: u32) -> Self {
        self.composite_group = Some(group);
        self
    }

    pub fn sink(mut self, stream: StreamId, requirement: BufferRequirement) -> Self {
        self.sink = Some(SinkStream { stream, requirement });
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = Some(count);
        self
    }
}

/// Where an input gets its buffer from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLink {
    /// Producer's output port.
    pub producer: PortId,
    /// Reads the producer's output of the previous request.
    pub loopback: bool,
}

#[derive(Debug)]
pub struct InputPort {
    pub id: PortId,
    pub desc: InputPortDesc,
    pub link: Option<InputLink>,
    pub requirement_to_producer: Option<BufferRequirement>,
    pub resolved: Option<BufferProperties>,
}

impl InputPort {
    pub fn new(id: PortId, desc: InputPortDesc) -> Self {
        Self {
            id,
            desc,
            link: None,
            requirement_to_producer: None,
            resolved: None,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.link.is_some_and(|l| l.loopback)
    }
}

#[derive(Debug)]
pub struct OutputPort {
    pub id: PortId,
    pub desc: OutputPortDesc,
    /// Consumer input ports, with their loopback flag.
    pub consumers: Vec<(PortId, bool)>,
    pub properties: Option<BufferProperties>,
    /// Streams served through this port, set by stream propagation.
    pub stream_mask: StreamMask,
    /// Feeds a loopback input and is therefore enabled for every request.
    pub always_enabled: bool,
    pub buffers: ImageBufferManager,
}

impl OutputPort {
    pub fn new(id: PortId, desc: OutputPortDesc) -> Self {
        Self {
            id,
            desc,
            consumers: Vec::new(),
            properties: None,
            stream_mask: StreamMask::EMPTY,
            always_enabled: false,
            buffers: ImageBufferManager::new(id),
        }
    }

    pub fn is_sink(&self) -> bool {
        self.desc.sink.is_some()
    }

    /// Enabled for a request carrying `streams`.
    pub fn enabled_for(&self, streams: StreamMask) -> bool {
        self.always_enabled || self.stream_mask.intersects(streams)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::NodeId;

    #[test]
    fn test_stream_mask() {
        let m = StreamMask::from_streams([StreamId(0), StreamId(5)]);
        assert!(m.contains(StreamId(5)));
        assert!(!m.contains(StreamId(1)));
        assert!(m.intersects(StreamMask::single(StreamId(0))));
        assert!(StreamMask::single(StreamId(64)).is_empty());
    }

    #[test]
    fn test_loopback_parent_always_enabled() {
        let mut out = OutputPort::new(PortId::new(NodeId(0), 0), OutputPortDesc::new("out"));
        assert!(!out.enabled_for(StreamMask::ALL));
        out.always_enabled = true;
        assert!(out.enabled_for(StreamMask::EMPTY));
    }
}
