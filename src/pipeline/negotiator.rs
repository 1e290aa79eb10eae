//! Graph-wide buffer negotiation.
//!
//! Walk 1 runs consumers before producers: every node turns what its
//! outputs' consumers want into one requirement per input, which becomes a
//! consumer requirement of the producer's output. Walk 2 runs producers
//! before consumers: every node fixes its output properties from its
//! resolved inputs. Loopback inputs are resolved after both walks, and every
//! input is finally checked against what it asked for.
//!
//! Only the derived hooks of `BufferNegotiable` decide; this module moves
//! the data between ports and configures the output pools.

use crate::pipeline::buffer::BufferProperties;
use crate::pipeline::compiled_plan::CompiledPlan;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::negotiation::{
    BufferNegotiationData, BufferRequirement, InputPortNegotiationData, NegotiationMode,
    OutputPortNegotiationData,
};
use crate::pipeline::node::BufferNegotiable;
use crate::pipeline::slot::NodeSlot;
use std::sync::PoisonError;
use tracing::{debug, info, warn};

/// Which nodes a negotiation pass touches.
#[derive(Debug, Clone)]
pub struct NegotiationScope {
    /// Nodes that re-run Walk 1, in topological order.
    pub walk1: Vec<NodeId>,
    /// Nodes that re-run Walk 2, in topological order.
    pub walk2: Vec<NodeId>,
}

impl NegotiationScope {
    pub fn full(plan: &CompiledPlan) -> Self {
        Self {
            walk1: plan.order().to_vec(),
            walk2: plan.order().to_vec(),
        }
    }

    /// `node` and its ancestors re-run Walk 1; they and every descendant
    /// re-run Walk 2.
    pub fn around(plan: &CompiledPlan, node: NodeId) -> Self {
        let mut walk1 = plan.ancestors_of(node);
        walk1.push(node);
        let mut walk2 = walk1.clone();
        walk2.extend(plan.descendants_of(node));
        let position = |n: &NodeId| plan.position.get(n.index()).copied().unwrap_or(usize::MAX);
        walk1.sort_by_key(position);
        walk2.sort_by_key(position);
        walk2.dedup();
        Self { walk1, walk2 }
    }
}

pub struct BufferNegotiator;

impl BufferNegotiator {
    /// Run both walks over `scope` and configure the output pools of every
    /// node in Walk 2.
    pub fn negotiate(
        nodes: &mut [NodeSlot],
        scope: &NegotiationScope,
        mode: NegotiationMode,
        default_buffer_count: usize,
    ) -> PipelineResult<()> {
        for id in scope.walk1.iter().rev() {
            Self::walk1_node(nodes, *id, mode)?;
        }
        for id in &scope.walk2 {
            Self::walk2_node(nodes, *id, mode)?;
        }
        Self::resolve_loopback_inputs(nodes, &scope.walk2);
        Self::verify(nodes, &scope.walk2, mode)?;

        for id in &scope.walk2 {
            let slot = &nodes[id.index()];
            for out in &slot.outputs {
                let Some(props) = out.properties else {
                    continue;
                };
                let count = out.desc.buffer_count.unwrap_or(default_buffer_count);
                out.buffers.configure(props, count)?;
                debug!(
                    "{} output {} negotiated {:?} {} ({} buffers, {} bytes each)",
                    slot.name,
                    out.desc.name,
                    props.format,
                    props.dimension,
                    count,
                    props.size_bytes()
                );
            }
        }
        info!(
            "Buffer negotiation done ({} nodes in walk 1, {} in walk 2)",
            scope.walk1.len(),
            scope.walk2.len()
        );
        Ok(())
    }

    /// What every consumer of each output wants: non-loopback consumers'
    /// requirements plus the HAL stream's.
    fn consumer_requirements(nodes: &[NodeSlot], id: NodeId) -> Vec<Vec<BufferRequirement>> {
        nodes[id.index()]
            .outputs
            .iter()
            .map(|out| {
                let mut reqs: Vec<BufferRequirement> = out
                    .consumers
                    .iter()
                    .filter(|(_, loopback)| !loopback)
                    .filter_map(|(port, _)| {
                        let input = nodes.get(port.node().index())?.inputs.get(port.index())?;
                        Some(input.requirement_to_producer.unwrap_or(input.desc.requirement))
                    })
                    .collect();
                if let Some(sink) = out.desc.sink {
                    reqs.push(sink.requirement);
                }
                reqs
            })
            .collect()
    }

    fn negotiation_data(nodes: &[NodeSlot], id: NodeId, mode: NegotiationMode) -> BufferNegotiationData {
        let consumers = Self::consumer_requirements(nodes, id);
        let slot = &nodes[id.index()];
        let inputs = slot
            .inputs
            .iter()
            .filter(|i| i.link.is_some())
            .map(|i| InputPortNegotiationData {
                port_index: i.id.port_index(),
                declared: i.desc.requirement,
                requirement_to_producer: i.requirement_to_producer,
                resolved: None,
                loopback: i.is_loopback(),
            })
            .collect();
        let outputs = slot
            .outputs
            .iter()
            .zip(consumers)
            .map(|(o, consumer_requirements)| OutputPortNegotiationData {
                port_index: o.id.port_index(),
                format: o.desc.format,
                capability: o.desc.capability,
                default_properties: o.desc.default_properties,
                consumer_requirements,
                is_sink: o.is_sink(),
                final_properties: None,
            })
            .collect();
        BufferNegotiationData {
            node: id,
            mode,
            forwards_input: slot.flags.forwards_input(),
            inputs,
            outputs,
        }
    }

    fn walk1_node(nodes: &mut [NodeSlot], id: NodeId, mode: NegotiationMode) -> PipelineResult<()> {
        let mut data = Self::negotiation_data(nodes, id, mode);
        let slot = &mut nodes[id.index()];
        slot.derived
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .finalize_input_requirement(&mut data)?;
        for input in data.inputs {
            if let Some(port) = slot.inputs.get_mut(input.port_index as usize) {
                port.requirement_to_producer = input.requirement_to_producer;
            }
        }
        Ok(())
    }

    fn walk2_node(nodes: &mut [NodeSlot], id: NodeId, mode: NegotiationMode) -> PipelineResult<()> {
        let mut data = Self::negotiation_data(nodes, id, mode);
        for input in data.inputs.iter_mut().filter(|i| !i.loopback) {
            input.resolved = Self::producer_properties(nodes, id, input.port_index);
        }
        let slot = &mut nodes[id.index()];
        slot.derived
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .finalize_buffer_properties(&mut data)?;
        for input in data.inputs {
            if let Some(port) = slot.inputs.get_mut(input.port_index as usize) {
                port.resolved = input.resolved;
            }
        }
        for output in data.outputs {
            if let Some(port) = slot.outputs.get_mut(output.port_index as usize) {
                port.properties = output.final_properties;
            }
        }
        Ok(())
    }

    fn producer_properties(nodes: &[NodeSlot], id: NodeId, input: u16) -> Option<BufferProperties> {
        let link = nodes[id.index()].inputs.get(input as usize)?.link?;
        nodes
            .get(link.producer.node().index())?
            .outputs
            .get(link.producer.index())?
            .properties
    }

    fn resolve_loopback_inputs(nodes: &mut [NodeSlot], scope: &[NodeId]) {
        for id in scope {
            let loops: Vec<u16> = nodes[id.index()]
                .inputs
                .iter()
                .filter(|i| i.is_loopback())
                .map(|i| i.id.port_index())
                .collect();
            for port in loops {
                let props = Self::producer_properties(nodes, *id, port);
                nodes[id.index()].inputs[port as usize].resolved = props;
            }
        }
    }

    /// Every linked input must accept what its producer settled on and every
    /// HAL stream must accept its port.
    fn verify(nodes: &[NodeSlot], scope: &[NodeId], mode: NegotiationMode) -> PipelineResult<()> {
        for id in scope {
            let slot = &nodes[id.index()];
            for input in slot.inputs.iter().filter(|i| i.link.is_some()) {
                let Some(props) = input.resolved else {
                    return Err(PipelineError::negotiation(
                        *id,
                        Some(input.id.port_index()),
                        format!("input {} has no resolved properties", input.desc.name),
                    ));
                };
                let wanted = input.requirement_to_producer.unwrap_or(input.desc.requirement);
                if let Err(reason) = wanted.accepts(&props) {
                    Self::reject(*id, input.id.port_index(), &slot.name, reason, mode)?;
                }
            }
            for out in &slot.outputs {
                let (Some(sink), Some(props)) = (out.desc.sink, out.properties) else {
                    continue;
                };
                if let Err(reason) = sink.requirement.accepts(&props) {
                    Self::reject(*id, out.id.port_index(), &slot.name, reason, mode)?;
                }
            }
        }
        Ok(())
    }

    fn reject(id: NodeId, port: u16, name: &str, reason: String, mode: NegotiationMode) -> PipelineResult<()> {
        match mode {
            NegotiationMode::Strict => Err(PipelineError::negotiation(id, Some(port), reason)),
            NegotiationMode::FallbackToDefault => {
                warn!("{} port {} accepted a fallback buffer: {}", name, port, reason);
                Ok(())
            }
        }
    }
}
