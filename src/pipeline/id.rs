//! Identity types for the node graph.
//!
//! Node ids are newtypes over `u32` that index directly into the pipeline's
//! node arena, so every lookup is O(1) and ports never hold pointers to
//! other nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capture request identifier, monotonically assigned by the caller.
pub type RequestId = u64;

/// Index into the pipeline's node arena, in insertion order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A port of one node. Input or output is given by where the id is used;
/// links always name the producer's output port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortId {
    node: NodeId,
    port: u16,
}

impl PortId {
    pub const fn new(node: NodeId, port_index: u16) -> Self {
        Self { node, port: port_index }
    }

    pub fn node(self) -> NodeId {
        self.node
    }

    pub fn port_index(self) -> u16 {
        self.port
    }

    /// Position in the node's input or output list.
    pub fn index(self) -> usize {
        usize::from(self.port)
    }
}

impl fmt::Debug for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}.{}", self.node.0, self.port)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node.0, self.port)
    }
}

/// HAL stream identifier. At most 64 streams per pipeline (see `StreamMask`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const MAX_STREAMS: u32 = 64;
}

/// Metadata tag or property identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagId(pub u32);

impl fmt::Debug for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagId(0x{:08X})", self.0)
    }
}

/// Opaque handle to a fence owned by a `FencePrimitive`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FenceHandle(pub u64);

impl FenceHandle {
    pub const INVALID: FenceHandle = FenceHandle(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for FenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Fence(INVALID)")
        } else {
            write!(f, "Fence({})", self.0)
        }
    }
}
