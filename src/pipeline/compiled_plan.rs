use crate::pipeline::id::{NodeId, PortId};

/// Compiled scheduling plan for a pipeline graph.
/// Holds the topological order and the structural adjacency used by setup,
/// negotiation and flush.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    /// Every node, producers before consumers. Loopback edges are ignored.
    pub order: Vec<NodeId>,

    /// Position of each node in `order`, indexed by node id.
    pub position: Vec<usize>,

    /// Non-loopback producers of each node.
    pub parents: Vec<Vec<NodeId>>,

    /// Non-loopback consumers of each node.
    pub children: Vec<Vec<NodeId>>,

    /// Loopback edges as (producer output, consumer input).
    pub loopback_edges: Vec<(PortId, PortId)>,

    /// Cache invalidation generation number
    pub generation: u64,

    /// Compilation statistics
    pub stats: PlanStats,

    /// Nodes no request can ever enable
    pub inactive_nodes: Vec<NodeId>,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    /// Total number of nodes in the graph
    pub total_nodes: usize,

    /// Number of source nodes (no linked inputs)
    pub source_nodes: usize,

    /// Number of sink nodes (no outputs, or only HAL stream outputs)
    pub sink_nodes: usize,

    /// Number of nodes no stream reaches
    pub inactive_nodes: usize,

    pub loopback_edges: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

impl CompiledPlan {
    /// Create a new empty compiled plan
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            position: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            loopback_edges: Vec::new(),
            generation: 0,
            stats: PlanStats::default(),
            inactive_nodes: Vec::new(),
        }
    }

    /// Check if the plan has any nodes
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn parents_of(&self, node: NodeId) -> &[NodeId] {
        self.parents.get(node.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children_of(&self, node: NodeId) -> &[NodeId] {
        self.children.get(node.index()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every transitive producer of `node`, in topological order.
    pub fn ancestors_of(&self, node: NodeId) -> Vec<NodeId> {
        self.sorted(self.closure(node, &self.parents))
    }

    /// Every transitive consumer of `node`, in topological order.
    pub fn descendants_of(&self, node: NodeId) -> Vec<NodeId> {
        self.sorted(self.closure(node, &self.children))
    }

    fn closure(&self, start: NodeId, adjacency: &[Vec<NodeId>]) -> Vec<NodeId> {
        let mut seen = vec![false; adjacency.len()];
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(n) = stack.pop() {
            for &next in adjacency.get(n.index()).map(Vec::as_slice).unwrap_or(&[]) {
                if !seen[next.index()] {
                    seen[next.index()] = true;
                    out.push(next);
                    stack.push(next);
                }
            }
        }
        out
    }

    fn sorted(&self, mut nodes: Vec<NodeId>) -> Vec<NodeId> {
        nodes.sort_by_key(|n| self.position.get(n.index()).copied().unwrap_or(usize::MAX));
        nodes
    }
}

impl Default for CompiledPlan {
    fn default() -> Self {
        Self::new()
    }
}
