//! Graph topology files.
//!
//! A graph file lists the nodes (kind, flags, ports, dependencies), the
//! links between ports and the HAL streams sink ports serve. Ports are
//! referenced as `"node.port"` by name.
//!
//! ```toml
//! [[graph.streams]]
//! id = 0
//! name = "preview"
//! width = 1920
//! height = 1080
//! format = "nv12"
//!
//! [[graph.nodes]]
//! name = "sensor"
//! kind = "sensor"
//! outputs = [{ name = "raw", format = "raw_mipi10" }]
//!
//! [[graph.links]]
//! from = "sensor.raw"
//! to = "ife.in"
//! ```

use crate::error::{CamGraphError, Result, ResultExt};
use crate::pipeline::bridge::PipelineBridge;
use crate::pipeline::buffer::{BufferProperties, Format};
use crate::pipeline::dependency::PropertyRequirement;
use crate::pipeline::executor::Pipeline;
use crate::pipeline::id::{NodeId, PortId, StreamId, TagId};
use crate::pipeline::negotiation::BufferRequirement;
use crate::pipeline::node::{AnyNode, BuiltinNode};
use crate::pipeline::node_type::NodeKind;
use crate::pipeline::nodes::{BypassNode, BypassPolicy, SensorNode, SensorSettings, SinkNode, StageNode};
use crate::pipeline::port::{InputPortDesc, OutputPortDesc};
use crate::pipeline::slot::{NodeDescriptor, NodeFlags};
use crate::types::StreamConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::SchedulerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPortConfig {
    pub name: String,
    #[serde(default)]
    pub requirement: BufferRequirement,
    /// Reads a buffer supplied from outside the graph.
    #[serde(default)]
    pub source_buffer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPortConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default)]
    pub capability: BufferRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_properties: Option<BufferProperties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_count: Option<usize>,
    /// HAL stream this port fills; makes it a sink port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamId>,
}

/// A property the node waits on before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyConfig {
    pub tag: u32,
    /// Read from request `current - offset`.
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub negate: bool,
}

impl PropertyConfig {
    pub fn requirement(&self) -> PropertyRequirement {
        PropertyRequirement {
            tag: TagId(self.tag),
            offset: self.offset,
            negate: self.negate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub flags: NodeFlags,
    #[serde(default)]
    pub inputs: Vec<InputPortConfig>,
    #[serde(default)]
    pub outputs: Vec<OutputPortConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<PropertyConfig>,
    /// Dependency units may be dropped at stream off.
    #[serde(default)]
    pub preemptable: bool,
    /// Makes a stage bypassable with this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass: Option<BypassPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorSettings>,
    /// Sensor only: signal outputs from a hardware queue after this delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_latency_ms: Option<u64>,
    /// Sensor only: fail every n-th frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_every: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_case_response_ms: Option<u64>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            flags: NodeFlags::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            properties: Vec::new(),
            preemptable: false,
            bypass: None,
            sensor: None,
            frame_latency_ms: None,
            fail_every: None,
            worst_case_response_ms: None,
        }
    }

    fn is_bypassable(&self) -> bool {
        self.flags.bypassable || self.bypass.is_some() || self.kind == NodeKind::Bypass
    }

    fn instantiate(&self) -> Result<BuiltinNode> {
        let node = match self.kind {
            NodeKind::Sensor => {
                let mut sensor = SensorNode::new().with_settings(self.sensor.unwrap_or_default());
                if let Some(ms) = self.frame_latency_ms {
                    sensor = sensor.with_hardware_queue(Duration::from_millis(ms));
                }
                if let Some(n) = self.fail_every {
                    sensor = sensor.with_fault_injection(n);
                }
                BuiltinNode::Sensor(sensor)
            }
            NodeKind::Ife | NodeKind::Bps | NodeKind::Ipe | NodeKind::Jpeg | NodeKind::Bypass => {
                let mut stage = self
                    .properties
                    .iter()
                    .fold(StageNode::new(self.kind), |s, p| s.with_property_dependency(p.requirement()));
                if self.preemptable {
                    stage = stage.preemptable();
                }
                if self.is_bypassable() {
                    BuiltinNode::Bypass(BypassNode::wrap(stage, self.bypass.unwrap_or_default()))
                } else {
                    BuiltinNode::Stage(stage)
                }
            }
            NodeKind::Sink => BuiltinNode::Sink(SinkNode::new()),
            NodeKind::Custom => {
                return Err(CamGraphError::Config(format!(
                    "node {} is a custom node; add it with Pipeline::add_node",
                    self.name
                )))
            }
        };
        Ok(node)
    }

    fn descriptor(&self, streams: &HashMap<StreamId, &StreamConfig>) -> Result<NodeDescriptor> {
        let mut flags = self.flags;
        flags.bypassable = self.is_bypassable();
        let mut desc = NodeDescriptor::new(self.name.clone(), self.kind).flags(flags);
        if let Some(ms) = self.worst_case_response_ms {
            desc = desc.worst_case_response(Duration::from_millis(ms));
        }
        for input in &self.inputs {
            let mut port = InputPortDesc::new(input.name.clone()).requirement(input.requirement);
            port.is_source_buffer = input.source_buffer;
            desc = desc.input(port);
        }
        for output in &self.outputs {
            let mut port = OutputPortDesc::new(output.name.clone()).capability(output.capability);
            port.format = output.format;
            port.default_properties = output.default_properties;
            port.composite_group = output.composite_group;
            port.buffer_count = output.buffer_count;
            if let Some(id) = output.stream {
                let stream = streams.get(&id).ok_or_else(|| {
                    CamGraphError::Config(format!(
                        "{}.{} serves unknown stream {}",
                        self.name, output.name, id.0
                    ))
                })?;
                port = port.sink(stream.id, stream.requirement());
                port.format = port.format.or(Some(stream.format));
            }
            desc = desc.output(port);
        }
        Ok(desc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Producer output, `"node.port"`.
    pub from: String,
    /// Consumer input, `"node.port"`.
    pub to: String,
    #[serde(default)]
    pub loopback: bool,
}

/// Nodes, links and HAL streams of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub streams: Vec<StreamConfig>,
    pub nodes: Vec<NodeConfig>,
    pub links: Vec<LinkConfig>,
}

impl GraphConfig {
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|s| s.id).collect()
    }

    /// A pipeline on software fences with its bridge, populated with this
    /// graph. The caller finalizes it.
    pub fn build_pipeline(&self, scheduler: SchedulerConfig) -> Result<(Pipeline, PipelineBridge)> {
        scheduler.validate()?;
        let (mut pipeline, bridge) = Pipeline::with_bridge(scheduler);
        self.populate(&mut pipeline)?;
        Ok((pipeline, bridge))
    }

    /// Add every node and link to `pipeline`.
    pub fn populate(&self, pipeline: &mut Pipeline) -> Result<()> {
        let streams: HashMap<StreamId, &StreamConfig> = self.streams.iter().map(|s| (s.id, s)).collect();
        if streams.len() != self.streams.len() {
            return Err(CamGraphError::Config("duplicate stream id".to_string()));
        }

        let mut ids: HashMap<&str, (NodeId, &NodeConfig)> = HashMap::new();
        for node in &self.nodes {
            let desc = node.descriptor(&streams)?;
            let built = node.instantiate()?;
            let id = pipeline
                .add_node(desc, AnyNode::from(built))
                .with_context(|| format!("Failed to add node {}", node.name))?;
            ids.insert(node.name.as_str(), (id, node));
        }

        for link in &self.links {
            let from = resolve_port(&ids, &link.from, PortDirection::Output)?;
            let to = resolve_port(&ids, &link.to, PortDirection::Input)?;
            pipeline
                .link(from, to, link.loopback)
                .with_context(|| format!("Failed to link {} -> {}", link.from, link.to))?;
        }
        tracing::info!(
            "Graph loaded: {} nodes, {} links, {} streams",
            self.nodes.len(),
            self.links.len(),
            self.streams.len()
        );
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum PortDirection {
    Input,
    Output,
}

fn resolve_port(ids: &HashMap<&str, (NodeId, &NodeConfig)>, path: &str, dir: PortDirection) -> Result<PortId> {
    let (node_name, port_name) = path
        .rsplit_once('.')
        .ok_or_else(|| CamGraphError::Config(format!("port reference {:?} is not node.port", path)))?;
    let (id, node) = ids
        .get(node_name)
        .ok_or_else(|| CamGraphError::Config(format!("unknown node {:?} in {:?}", node_name, path)))?;
    let index = match dir {
        PortDirection::Input => node.inputs.iter().position(|p| p.name == port_name),
        PortDirection::Output => node.outputs.iter().position(|p| p.name == port_name),
    };
    let index = index.ok_or_else(|| CamGraphError::Config(format!("unknown port {:?}", path)))?;
    Ok(PortId::new(*id, index as u16))
}
