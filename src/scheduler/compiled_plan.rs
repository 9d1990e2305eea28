use crate::graph::NodeId;

/// Evaluation order for one graph generation.
///
/// Every node appears in `order`, fed or not: nodes with a missing input are
/// still visited so they can report the error and null their outputs.
#[derive(Debug, Clone, Default)]
pub struct CompiledPlan {
    /// All nodes in topological order
    pub order: Vec<NodeId>,

    /// Graph generation this plan was compiled from
    pub generation: u64,

    pub stats: PlanStats,

    /// Sinks with no complete path from a source
    pub inactive_sink_nodes: Vec<NodeId>,

    /// Nodes with an unconnected input somewhere upstream
    pub disconnected_nodes: Vec<NodeId>,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub total_nodes: usize,

    /// Nodes fed through complete paths from sources
    pub active_nodes: usize,

    pub disconnected_nodes: usize,

    /// Nodes without input slots (channels, generators, importers)
    pub source_nodes: usize,

    /// Nodes whose streams nobody consumes
    pub sink_nodes: usize,

    pub compile_time_us: u64,
}

impl CompiledPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn is_disconnected(&self, id: NodeId) -> bool {
        self.disconnected_nodes.contains(&id)
    }
}
