//! Per-request node-graph scheduling engine.
//!
//! Capture requests flow through a DAG of processing nodes connected by
//! ports. Before streaming, buffer requirements are negotiated across the
//! graph; per request, every enabled node is set up, reports the
//! dependencies it waits on, and runs once they resolve. Completion is
//! driven by fence callbacks posted to a worker pool.
//!
//! # Architecture
//!
//! ```text
//! [Sensor] ──► [IFE] ──► [IPE] ──► [Preview sink]
//!                   └──► [JPEG (bypassable)] ──► [Snapshot sink]
//! ```
//!
//! # Design
//!
//! - **Node arena**: nodes live in a `Vec<NodeSlot>` indexed by `NodeId`;
//!   ports name their producer by `PortId`, never by pointer.
//! - **Capability interfaces**: the scheduler talks to nodes only through
//!   `BufferNegotiable`, `RequestExecutable` and `StreamLifecycle`.
//! - **Enum dispatch**: built-in nodes are `BuiltinNode` variants; user
//!   nodes plug in as `AnyNode::Plugin`.
//! - **Message-driven completion**: fence callbacks only post a `Job`; a
//!   worker re-evaluates the deferred request queue.
//! - **Explicit request context**: every call that needs the current
//!   request receives a `RequestContext`.

pub mod bridge;
pub mod buffer;
pub mod compiled_plan;
pub mod compiler;
pub mod completion;
pub mod composite;
pub mod context;
pub mod dependency;
pub mod error;
pub mod execution;
pub mod executor;
pub mod fence;
pub mod fence_errors;
pub mod forwarding;
pub mod id;
pub mod metadata;
pub mod negotiation;
pub mod negotiator;
pub mod node;
pub mod node_type;
pub mod nodes;
pub mod port;
pub mod request;
pub mod scheduler;
pub mod slot;
pub mod worker;

pub use bridge::{FailureStage, PipelineBridge, PipelineMessage, RequestResult};
pub use buffer::{BufferProperties, Dimension, Format, ImageBuffer, ImageBufferManager, PlaneAlignment};
pub use context::{GraphContext, RequestContext, RequestCounters};
pub use dependency::{DependencyFlags, DependencyUnit, PropertyRequirement};
pub use error::{PipelineError, PipelineResult};
pub use executor::{Pipeline, PipelineStats};
pub use fence::{FenceResult, FenceStatus, FencePrimitive, SoftwareFencePool};
pub use fence_errors::{FenceErrorBuffer, FenceErrorEntry, FENCE_ERROR_CAPACITY};
pub use id::{FenceHandle, NodeId, PortId, RequestId, StreamId, TagId};
pub use metadata::{InMemoryMetadataPool, MetadataPool, MetadataValue, TagQuery};
pub use negotiation::{BufferNegotiationData, BufferRequirement, NegotiationMode};
pub use node::{
    AnyNode, BufferNegotiable, BuiltinNode, DeactivateMode, ExecuteContext, NodePlugin,
    RequestExecutable, StreamLifecycle,
};
pub use node_type::NodeKind;
pub use nodes::{BypassNode, BypassPolicy, IqModule, SensorNode, SensorSettings, SinkNode, StageNode};
pub use port::{InputPortDesc, OutputPortDesc, StreamMask};
pub use request::PerRequestNodeStatus;
pub use slot::{NodeDescriptor, NodeFlags, NodeSlot};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
