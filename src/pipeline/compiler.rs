use super::compiled_plan::{CompiledPlan, PlanStats};
use super::error::{PipelineError, PipelineResult};
use super::id::{NodeId, PortId};
use super::port::StreamMask;
use super::slot::NodeSlot;
use std::collections::VecDeque;

/// Compiles a pipeline graph into a scheduling plan
pub struct PipelineCompiler;

impl PipelineCompiler {
    /// Compile a pipeline graph into a scheduling plan.
    ///
    /// Orders the nodes topologically (loopback edges do not count, they
    /// read the previous request) and propagates the HAL stream masks from
    /// the sinks back to the sources.
    ///
    /// # Arguments
    /// * `nodes` - All nodes in the graph
    /// * `generation` - Generation counter for cache invalidation
    ///
    /// # Errors
    /// `CycleDetected` when the non-loopback edges do not form a DAG.
    pub fn compile(nodes: &mut [NodeSlot], generation: u64) -> PipelineResult<CompiledPlan> {
        let start_time = std::time::Instant::now();
        let n = nodes.len();

        let (parents, children, loopback_edges) = Self::build_adjacency(nodes);
        let order = Self::topological_sort(&parents, &children)?;

        let mut position = vec![0; n];
        for (pos, id) in order.iter().enumerate() {
            position[id.index()] = pos;
        }

        Self::propagate_streams(nodes, &order);

        let inactive_nodes: Vec<NodeId> = nodes
            .iter()
            .filter(|slot| Self::never_enabled(slot))
            .map(|slot| slot.id)
            .collect();
        for id in &inactive_nodes {
            tracing::warn!(
                "Node {} serves no stream and will stay idle",
                nodes[id.index()].name
            );
        }

        let stats = PlanStats {
            total_nodes: n,
            source_nodes: parents.iter().filter(|p| p.is_empty()).count(),
            sink_nodes: nodes.iter().filter(|slot| Self::is_sink(slot)).count(),
            inactive_nodes: inactive_nodes.len(),
            loopback_edges: loopback_edges.len(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        Ok(CompiledPlan {
            order,
            position,
            parents,
            children,
            loopback_edges,
            generation,
            stats,
            inactive_nodes,
        })
    }

    /// Build producer and consumer lists from the input links.
    #[allow(clippy::type_complexity)]
    fn build_adjacency(
        nodes: &[NodeSlot],
    ) -> (
        Vec<Vec<NodeId>>,
        Vec<Vec<NodeId>>,
        Vec<(PortId, PortId)>,
    ) {
        let n = nodes.len();
        let mut parents = vec![Vec::new(); n];
        let mut children = vec![Vec::new(); n];
        let mut loopback = Vec::new();

        for slot in nodes {
            for input in &slot.inputs {
                let Some(link) = input.link else {
                    continue;
                };
                if link.loopback {
                    loopback.push((link.producer, input.id));
                    continue;
                }
                let from = link.producer.node();
                if from.index() >= n {
                    continue;
                }
                if !parents[slot.id.index()].contains(&from) {
                    parents[slot.id.index()].push(from);
                    children[from.index()].push(slot.id);
                }
            }
        }

        (parents, children, loopback)
    }

    /// Kahn's algorithm. Ties are broken by node id so the order is stable.
    fn topological_sort(parents: &[Vec<NodeId>], children: &[Vec<NodeId>]) -> PipelineResult<Vec<NodeId>> {
        let n = parents.len();
        let mut in_degree: Vec<usize> = parents.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut result = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            result.push(NodeId(node as u32));
            for child in &children[node] {
                in_degree[child.index()] -= 1;
                if in_degree[child.index()] == 0 {
                    queue.push_back(child.index());
                }
            }
        }

        if result.len() != n {
            return Err(PipelineError::CycleDetected);
        }
        Ok(result)
    }

    /// Walk consumers before producers. An output serves its own HAL stream
    /// plus every stream its consumers serve; a consumer without outputs
    /// serves everything. Outputs feeding a loopback input are always enabled.
    fn propagate_streams(nodes: &mut [NodeSlot], order: &[NodeId]) {
        for slot in nodes.iter_mut() {
            for out in &mut slot.outputs {
                out.stream_mask = out
                    .desc
                    .sink
                    .map(|s| StreamMask::single(s.stream))
                    .unwrap_or(StreamMask::EMPTY);
                out.always_enabled = false;
            }
        }

        for id in order.iter().rev() {
            let idx = id.index();
            let mut masks = Vec::with_capacity(nodes[idx].outputs.len());
            let mut always = Vec::with_capacity(nodes[idx].outputs.len());
            for out in &nodes[idx].outputs {
                let mut mask = out.stream_mask;
                let mut loop_parent = false;
                for (consumer, loopback) in &out.consumers {
                    if *loopback {
                        loop_parent = true;
                        continue;
                    }
                    if let Some(c) = nodes.get(consumer.node().index()) {
                        mask = mask.union(Self::node_mask(c));
                    }
                }
                masks.push(mask);
                always.push(loop_parent);
            }
            for ((out, mask), loop_parent) in nodes[idx].outputs.iter_mut().zip(masks).zip(always) {
                out.stream_mask = mask;
                out.always_enabled = loop_parent;
            }
        }
    }

    /// Streams a node serves.
    fn node_mask(slot: &NodeSlot) -> StreamMask {
        if slot.outputs.is_empty() {
            return StreamMask::ALL;
        }
        if slot.outputs.iter().any(|o| o.always_enabled) {
            return StreamMask::ALL;
        }
        slot.stream_mask()
    }

    fn is_sink(slot: &NodeSlot) -> bool {
        slot.outputs.is_empty() || slot.outputs.iter().all(|o| o.is_sink())
    }

    fn never_enabled(slot: &NodeSlot) -> bool {
        !slot.outputs.is_empty()
            && slot
                .outputs
                .iter()
                .all(|o| o.stream_mask.is_empty() && !o.always_enabled)
    }
}
