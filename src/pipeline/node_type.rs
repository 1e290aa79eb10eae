//! Node kind enumeration for graph descriptions.
//!
//! This module defines the kinds of nodes a graph file can instantiate and
//! the display metadata used in logs.

use serde::{Deserialize, Serialize};

/// Kinds of nodes a pipeline can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    // Source nodes
    /// Image sensor; the graph's frame source.
    Sensor,

    // Processing stages
    /// Image front end: raw capture and statistics.
    Ife,
    /// Bayer processing segment.
    Bps,
    /// Image processing engine.
    Ipe,
    /// JPEG encoder.
    Jpeg,
    /// Stage that may forward its input instead of producing a buffer.
    Bypass,

    // Sink nodes
    /// HAL stream target, or a pure sink without outputs.
    Sink,

    /// A user-supplied plugin node.
    Custom,
}

impl NodeKind {
    /// Get the display name for this node kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeKind::Sensor => "Sensor",
            NodeKind::Ife => "IFE",
            NodeKind::Bps => "BPS",
            NodeKind::Ipe => "IPE",
            NodeKind::Jpeg => "JPEG",
            NodeKind::Bypass => "Bypass",
            NodeKind::Sink => "Sink",
            NodeKind::Custom => "Custom",
        }
    }

    /// Get all built-in node kinds.
    pub fn all() -> &'static [NodeKind] {
        &[
            NodeKind::Sensor,
            NodeKind::Ife,
            NodeKind::Bps,
            NodeKind::Ipe,
            NodeKind::Jpeg,
            NodeKind::Bypass,
            NodeKind::Sink,
        ]
    }

    /// Check if this node kind is a sink node.
    pub fn is_sink(&self) -> bool {
        matches!(self, NodeKind::Sink)
    }

    /// Check if this node kind runs as a generic processing stage.
    pub fn is_stage(&self) -> bool {
        matches!(
            self,
            NodeKind::Ife | NodeKind::Bps | NodeKind::Ipe | NodeKind::Jpeg
        )
    }

    /// Stages that can downscale their input to each output.
    pub fn is_scaler(&self) -> bool {
        matches!(self, NodeKind::Ife | NodeKind::Bps | NodeKind::Ipe)
    }

    /// Get a detailed description of what this node does.
    pub fn description(&self) -> &'static str {
        match self {
            NodeKind::Sensor =>
                "Frame source.\n\
                 Publishes exposure, gain and timestamp.\n\
                 Optionally signals through a hardware queue.",

            NodeKind::Ife =>
                "Front-end stage.\n\
                 Consumes raw sensor frames.\n\
                 Publishes AWB and AEC statistics.",

            NodeKind::Bps =>
                "Bayer processing stage.\n\
                 Offline raw-to-YUV conversion.",

            NodeKind::Ipe =>
                "Image processing engine.\n\
                 Produces preview and video outputs.",

            NodeKind::Jpeg =>
                "JPEG encoder stage.\n\
                 Produces blob output for snapshots.",

            NodeKind::Bypass =>
                "Forwards its input per request.\n\
                 Zero-copy when bypass is elected.",

            NodeKind::Sink =>
                "Terminates a branch.\n\
                 Bound to a HAL stream or buffer-less.",

            NodeKind::Custom => "User-supplied plugin node.",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrips_through_serde() {
        for kind in NodeKind::all() {
            let json = serde_json::to_string(kind).unwrap();
            let back: NodeKind = serde_json::from_str(&json).unwrap();
            assert_eq!(*kind, back);
        }
        assert_eq!(serde_json::to_string(&NodeKind::Ife).unwrap(), "\"ife\"");
    }

    #[test]
    fn test_classification() {
        assert!(NodeKind::Sink.is_sink());
        assert!(NodeKind::Jpeg.is_stage());
        assert!(!NodeKind::Bypass.is_stage());
        assert!(NodeKind::Ipe.is_scaler());
        assert!(!NodeKind::Jpeg.is_scaler());
    }
}
