//! Graph evaluation.
//!
//! One refresh cycle:
//! 1. Recompile the plan if the graph topology changed.
//! 2. Pop at most one pending waveform set per instrument into channel streams.
//! 3. Visit nodes in topological order. For each filter, check inputs, stage
//!    them where the filter wants them, call `refresh`, then stamp outputs
//!    with a new revision.
//!
//! Errors stay on the node: the message is recorded, outputs are nulled and
//! the cycle continues. Downstream nodes then see a missing input.

mod compiled_plan;
mod compiler;
mod runner;

pub use compiled_plan::{CompiledPlan, PlanStats};
pub use compiler::PlanCompiler;
pub use runner::{RunnerCommand, SchedulerRunner};

use crate::buffer::{notify_memory_pressure, MemoryPressureLevel};
use crate::compute::{CommandBuffer, ComputeContext};
use crate::config::SchedulerConfig;
use crate::error::{Result, ScopeError};
use crate::graph::{AnyNode, FilterGraph, InputLocation, NodeId, RefreshContext, RefreshStamp, StreamRef};
use std::time::Instant;

/// Outcome of one refresh cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Pending acquisition sets moved into channels
    pub acquisitions: usize,
    pub refreshed: usize,
    /// Filters skipped because nothing changed
    pub skipped: usize,
    /// Filters that ended the cycle with an error
    pub errors: usize,
    /// Refreshes retried after releasing memory
    pub retries: usize,
    pub elapsed_us: u64,
    pub plan_generation: u64,
}

pub struct Scheduler {
    compute: ComputeContext,
    config: SchedulerConfig,
    plan: CompiledPlan,
    compiled_plan_dirty: bool,
    cmd: CommandBuffer,
    cycles: u64,
}

impl Scheduler {
    pub fn new(compute: ComputeContext, config: SchedulerConfig) -> Self {
        Self {
            compute,
            config,
            plan: CompiledPlan::new(),
            compiled_plan_dirty: true,
            cmd: CommandBuffer::new(),
            cycles: 0,
        }
    }

    pub fn cpu_only() -> Self {
        Self::new(ComputeContext::cpu_only(), SchedulerConfig::default())
    }

    pub fn compute(&self) -> &ComputeContext {
        &self.compute
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    /// Completed refresh cycles
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Force a recompile on the next cycle
    pub fn invalidate_plan(&mut self) {
        self.compiled_plan_dirty = true;
    }

    fn recompile_if_needed(&mut self, graph: &FilterGraph) {
        if !self.compiled_plan_dirty && self.plan.generation == graph.generation() {
            return;
        }
        self.plan = PlanCompiler::compile(graph, graph.generation());
        self.compiled_plan_dirty = false;

        tracing::info!(
            "Filter graph recompiled: {} active / {} total (gen {})",
            self.plan.stats.active_nodes,
            self.plan.stats.total_nodes,
            self.plan.generation,
        );

        for &id in &self.plan.inactive_sink_nodes {
            if let Some(node) = graph.node(id) {
                tracing::warn!(
                    "Sink node '{}' ({}) is disconnected from data sources",
                    node.core().display_name,
                    id
                );
            }
        }
    }

    /// Run one refresh cycle over the whole graph
    pub fn refresh(&mut self, graph: &mut FilterGraph) -> RefreshStats {
        let start = Instant::now();
        self.recompile_if_needed(graph);

        let mut stats = RefreshStats {
            acquisitions: graph.pop_pending_waveforms(),
            plan_generation: self.plan.generation,
            ..RefreshStats::default()
        };

        let order = self.plan.order.clone();
        for id in order {
            self.refresh_node(graph, id, &mut stats);
        }

        self.cycles += 1;
        stats.elapsed_us = start.elapsed().as_micros() as u64;
        tracing::debug!(
            "Refresh cycle {}: {} refreshed, {} skipped, {} errors in {} us",
            self.cycles,
            stats.refreshed,
            stats.skipped,
            stats.errors,
            stats.elapsed_us
        );
        stats
    }

    fn refresh_node(&mut self, graph: &mut FilterGraph, id: NodeId, stats: &mut RefreshStats) {
        let Some(AnyNode::Filter(filter)) = graph.node(id) else {
            return;
        };
        let core = filter.core();
        let sources: Vec<Option<StreamRef>> = core.inputs().iter().map(|s| s.source).collect();
        let names: Vec<String> = core.inputs().iter().map(|s| s.name.clone()).collect();
        let parameter_generation = core.parameters().generation();
        let last_refresh = core.last_refresh.clone();
        let volatile = filter.is_volatile();
        let location = filter.input_location();

        let revisions: Vec<Option<u64>> = sources
            .iter()
            .map(|s| s.and_then(|r| graph.stream(r)).and_then(|st| st.revision()))
            .collect();

        // Missing inputs are reported without calling into the filter
        if let Some(slot) = revisions.iter().position(Option::is_none) {
            let error = ScopeError::MissingInput(names[slot].clone());
            self.record_failure(graph, id, error, stats);
            return;
        }

        let stamp = RefreshStamp {
            input_revisions: revisions.clone(),
            parameter_generation,
        };
        if self.config.skip_unchanged && !volatile && last_refresh.as_ref() == Some(&stamp) {
            stats.skipped += 1;
            return;
        }

        if let Err(e) = self.stage_inputs(graph, &sources, location) {
            self.record_failure(graph, id, e, stats);
            return;
        }

        let Some(mut node) = graph.take(id) else {
            return;
        };
        let result = self.run_filter(graph, &mut node, &sources, &names, stats);

        let core = node.core_mut();
        match result {
            Ok(()) => {
                let max_input = revisions.iter().flatten().copied().max().unwrap_or(0);
                let revision = (max_input + 1).max(core.output_revision + 1);
                core.output_revision = revision;
                for stream in core.streams_mut() {
                    if stream.has_data() {
                        stream.stamp(revision);
                    }
                }
                core.last_refresh = Some(stamp);
                stats.refreshed += 1;
            }
            Err(e) => {
                tracing::debug!("{} '{}' failed: {}", id, core.display_name, e);
                core.clear_outputs();
                core.add_error(e.to_string());
                core.last_refresh = None;
                stats.errors += 1;
            }
        }
        graph.restore(node);
    }

    /// Refresh with one retry after releasing memory on allocation failure
    fn run_filter(
        &mut self,
        graph: &FilterGraph,
        node: &mut AnyNode,
        sources: &[Option<StreamRef>],
        names: &[String],
        stats: &mut RefreshStats,
    ) -> Result<()> {
        let Some(filter) = node.as_filter_mut() else {
            return Ok(());
        };
        filter.core_mut().clear_errors();

        let mut retried = false;
        loop {
            self.cmd.reset();
            let inputs = sources.iter().map(|s| s.and_then(|r| graph.stream(r))).collect();
            let mut ctx = RefreshContext::new(inputs, names.to_vec(), &self.compute, &mut self.cmd);
            let result = filter.refresh(&mut ctx);

            match result {
                Err(e) if !retried && e.is_out_of_memory() => {
                    let Some((kind, bytes)) = e.out_of_memory_details() else {
                        return Err(e);
                    };
                    if !notify_memory_pressure(MemoryPressureLevel::Hard, kind, bytes) {
                        return Err(e);
                    }
                    tracing::warn!("Retrying '{}' after releasing memory", filter.core().display_name);
                    stats.retries += 1;
                    retried = true;
                    filter.core_mut().clear_outputs();
                }
                other => return other,
            }
        }
    }

    /// Move input waveforms to where the filter wants to read them
    fn stage_inputs(
        &self,
        graph: &mut FilterGraph,
        sources: &[Option<StreamRef>],
        location: InputLocation,
    ) -> Result<()> {
        for src in sources.iter().flatten() {
            let Some(waveform) = graph.stream_mut(*src).and_then(|s| s.waveform_mut()) else {
                continue;
            };
            match (location, self.compute.device()) {
                (InputLocation::DontCare, _) => {}
                (InputLocation::Gpu, Some(device)) => waveform.prepare_for_gpu_access(device)?,
                (InputLocation::Gpu, None) | (InputLocation::Cpu, _) => waveform.prepare_for_cpu_access()?,
            }
        }
        Ok(())
    }

    fn record_failure(&self, graph: &mut FilterGraph, id: NodeId, error: ScopeError, stats: &mut RefreshStats) {
        if let Some(node) = graph.node_mut(id) {
            let core = node.core_mut();
            core.clear_outputs();
            core.clear_errors();
            core.add_error(error.to_string());
            core.last_refresh = None;
        }
        stats.errors += 1;
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("has_device", &self.compute.has_device())
            .field("plan_generation", &self.plan.generation)
            .field("cycles", &self.cycles)
            .finish()
    }
}
