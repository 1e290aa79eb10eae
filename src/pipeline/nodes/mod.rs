//! Built-in node implementations.

pub mod bypass;
pub mod sensor;
pub mod sink;
pub mod stage;

pub use bypass::{BypassNode, BypassPolicy};
pub use sensor::{SensorNode, SensorSettings};
pub use sink::SinkNode;
pub use stage::{IqModule, StageNode};
