use super::compiled_plan::{CompiledPlan, PlanStats};
use crate::graph::{FilterGraph, NodeId};
use std::collections::{BTreeMap, VecDeque};

/// Compiles a filter graph into an evaluation plan
pub struct PlanCompiler;

impl PlanCompiler {
    /// Order every node topologically and classify sources, sinks and
    /// disconnected nodes.
    ///
    /// A node is *fed* when it is a source, or when every input slot is
    /// connected and every producer is fed. Unfed nodes count as
    /// disconnected but stay in the order.
    pub fn compile(graph: &FilterGraph, generation: u64) -> CompiledPlan {
        let start_time = std::time::Instant::now();

        let ids = graph.ids();
        if ids.is_empty() {
            return CompiledPlan {
                generation,
                ..CompiledPlan::default()
            };
        }

        let index: BTreeMap<NodeId, usize> = ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let n = ids.len();

        // Build adjacency lists (forward and backward)
        let mut fwd_adj = vec![Vec::new(); n];
        let mut bwd_adj = vec![Vec::new(); n];
        for (from, to) in graph.edges() {
            if let (Some(&f), Some(&t)) = (index.get(&from), index.get(&to)) {
                fwd_adj[f].push(t);
                bwd_adj[t].push(f);
            }
        }

        let sources: Vec<usize> = (0..n)
            .filter(|&i| graph.node(ids[i]).is_some_and(|node| node.core().input_count() == 0))
            .collect();
        let sinks: Vec<usize> = (0..n).filter(|&i| fwd_adj[i].is_empty()).collect();

        let order = Self::topological_sort(&fwd_adj, &bwd_adj);
        if order.len() != n {
            tracing::warn!(
                "Filter graph has a cycle! Only {} of {} nodes scheduled.",
                order.len(),
                n
            );
        }

        // Walk in order so producers are classified before consumers
        let mut fed = vec![false; n];
        for &i in &order {
            let Some(node) = graph.node(ids[i]) else {
                continue;
            };
            let core = node.core();
            fed[i] = core.inputs().iter().all(|slot| {
                slot.source
                    .and_then(|src| index.get(&src.node))
                    .is_some_and(|&p| fed[p])
            });
        }

        let disconnected_nodes: Vec<NodeId> = (0..n).filter(|&i| !fed[i]).map(|i| ids[i]).collect();
        let inactive_sink_nodes: Vec<NodeId> =
            sinks.iter().filter(|&&i| !fed[i]).map(|&i| ids[i]).collect();

        let stats = PlanStats {
            total_nodes: n,
            active_nodes: n - disconnected_nodes.len(),
            disconnected_nodes: disconnected_nodes.len(),
            source_nodes: sources.len(),
            sink_nodes: sinks.len(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        CompiledPlan {
            order: order.into_iter().map(|i| ids[i]).collect(),
            generation,
            stats,
            inactive_sink_nodes,
            disconnected_nodes,
        }
    }

    /// Kahn's algorithm; ties resolve by ascending node id
    fn topological_sort(fwd_adj: &[Vec<usize>], bwd_adj: &[Vec<usize>]) -> Vec<usize> {
        let n = fwd_adj.len();
        let mut in_degree: Vec<usize> = bwd_adj.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut result = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            result.push(node);
            for &next in &fwd_adj[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        result
    }
}
