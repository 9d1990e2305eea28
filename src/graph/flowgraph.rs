//! The filter graph: node storage, wiring and instrument attachment.
//!
//! Nodes live in a `BTreeMap` keyed by [`NodeId`], so iteration order is
//! stable and ids survive removal of other nodes. Wiring is stored on the
//! consumer side only (each input slot holds an optional [`StreamRef`]).
//! Cycles are rejected when an input is set, so the scheduler can assume a DAG.

use super::filter::Filter;
use super::id::{NodeId, StreamRef};
use super::node::AnyNode;
use super::parameter::{ParameterMap, ParameterValue};
use super::registry::FilterRegistry;
use super::stream::Stream;
use crate::error::{Result, ScopeError};
use crate::instrument::{AcquisitionController, InstrumentChannel, InstrumentHandle};
use crate::waveform::Waveform;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct FilterGraph {
    nodes: BTreeMap<NodeId, AnyNode>,
    instruments: Vec<InstrumentHandle>,
    next_id: u32,
    generation: u64,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented on every topology change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation += 1;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &AnyNode)> {
        self.nodes.iter()
    }

    // ── Adding and removing ──

    /// Add a node under a freshly assigned id
    pub fn add_node(&mut self, node: impl Into<AnyNode>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let mut node = node.into();
        node.core_mut().set_id(id);
        self.nodes.insert(id, node);
        self.touch();
        id
    }

    /// Add a node under a caller-chosen id (used when loading documents)
    pub fn insert_with_id(&mut self, id: NodeId, node: impl Into<AnyNode>) -> Result<()> {
        if !id.is_valid() || self.nodes.contains_key(&id) {
            return Err(ScopeError::InvalidParameter(format!("{} is already in use", id)));
        }
        let mut node = node.into();
        node.core_mut().set_id(id);
        self.nodes.insert(id, node);
        self.next_id = self.next_id.max(id.0 + 1);
        self.touch();
        Ok(())
    }

    pub fn add_filter(&mut self, filter: Box<dyn Filter>) -> NodeId {
        self.add_node(AnyNode::Filter(filter))
    }

    /// Create a filter from the process-wide registry
    pub fn create_filter(&mut self, class_name: &str, color: &str) -> Result<NodeId> {
        self.create_filter_with(FilterRegistry::global(), class_name, color)
    }

    pub fn create_filter_with(
        &mut self,
        registry: &FilterRegistry,
        class_name: &str,
        color: &str,
    ) -> Result<NodeId> {
        let filter = registry.create_filter(class_name, color)?;
        Ok(self.add_filter(filter))
    }

    /// Attach an instrument and add one channel node per instrument channel.
    ///
    /// With `ids`, channel `i` is inserted under `ids[i]`; otherwise fresh ids are used.
    pub fn attach_instrument(
        &mut self,
        name: impl Into<String>,
        acquisition: Arc<AcquisitionController>,
        ids: Option<&[NodeId]>,
    ) -> Result<Vec<NodeId>> {
        let name = name.into();
        let instrument = acquisition.instrument().clone();
        let count = instrument.channel_count();
        if let Some(ids) = ids {
            if ids.len() != count {
                return Err(ScopeError::InvalidParameter(format!(
                    "instrument '{}' has {} channels, {} ids given",
                    name,
                    count,
                    ids.len()
                )));
            }
        }

        let mut channels = Vec::with_capacity(count);
        for index in 0..count {
            let channel = InstrumentChannel::new(instrument.clone(), index);
            let id = match ids {
                Some(ids) => {
                    self.insert_with_id(ids[index], channel)?;
                    ids[index]
                }
                None => self.add_node(channel),
            };
            channels.push(id);
        }

        tracing::info!("Attached instrument '{}' with {} channels", name, count);
        self.instruments.push(InstrumentHandle {
            name,
            acquisition,
            channels: channels.clone(),
        });
        Ok(channels)
    }

    pub fn instruments(&self) -> &[InstrumentHandle] {
        &self.instruments
    }

    pub fn instrument(&self, name: &str) -> Option<&InstrumentHandle> {
        self.instruments.iter().find(|h| h.name == name)
    }

    /// Remove a node and clear every input that referenced its streams
    pub fn remove(&mut self, id: NodeId) -> Result<AnyNode> {
        let node = self.nodes.remove(&id).ok_or(ScopeError::UnknownNode(id))?;
        let mut cleared = 0;
        for other in self.nodes.values_mut() {
            cleared += other.core_mut().disconnect_from(id);
        }
        for handle in &mut self.instruments {
            handle.channels.retain(|&c| c != id);
        }
        self.instruments.retain(|h| !h.channels.is_empty());
        self.touch();
        tracing::debug!("Removed {} ({} references cleared)", id, cleared);
        Ok(node)
    }

    // ── Lookup ──

    pub fn node(&self, id: NodeId) -> Option<&AnyNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut AnyNode> {
        self.nodes.get_mut(&id)
    }

    pub fn filter(&self, id: NodeId) -> Option<&dyn Filter> {
        self.nodes.get(&id).and_then(AnyNode::as_filter)
    }

    pub fn stream(&self, r: StreamRef) -> Option<&Stream> {
        self.nodes.get(&r.node).and_then(|n| n.core().stream(r.stream))
    }

    pub fn stream_mut(&mut self, r: StreamRef) -> Option<&mut Stream> {
        self.nodes.get_mut(&r.node).and_then(|n| n.core_mut().stream_mut(r.stream))
    }

    /// Stream reference by node id and stream name
    pub fn stream_ref(&self, node: NodeId, name: &str) -> Result<StreamRef> {
        let n = self.nodes.get(&node).ok_or(ScopeError::UnknownNode(node))?;
        n.core()
            .stream_index(name)
            .map(|i| StreamRef::new(node, i))
            .ok_or_else(|| ScopeError::InvalidParameter(format!("{} has no stream '{}'", node, name)))
    }

    // ── Wiring ──

    /// Connect input `slot` of `to` to `source`, or disconnect it with `None`.
    ///
    /// Fails when the stream is rejected by the node's `validate_channel`
    /// or when the connection would create a cycle.
    pub fn set_input(&mut self, to: NodeId, slot: usize, source: Option<StreamRef>) -> Result<()> {
        let node = self.nodes.get(&to).ok_or(ScopeError::UnknownNode(to))?;
        if slot >= node.core().input_count() {
            return Err(ScopeError::InvalidParameter(format!("{} has no input slot {}", to, slot)));
        }

        if let Some(src) = source {
            let stream = self.stream(src).ok_or(if self.contains(src.node) {
                ScopeError::UnknownStream {
                    node: src.node,
                    stream: src.stream,
                }
            } else {
                ScopeError::UnknownNode(src.node)
            })?;
            if !node.validate_channel(slot, stream) {
                return Err(ScopeError::InvalidInput(format!(
                    "stream '{}' of {} is not accepted by input '{}' of {}",
                    stream.name,
                    src.node,
                    node.core().input_name(slot).unwrap_or("?"),
                    to
                )));
            }
            if self.would_create_cycle(src.node, to) {
                return Err(ScopeError::CycleDetected { from: src.node, to });
            }
        }

        if let Some(node) = self.nodes.get_mut(&to) {
            node.core_mut().set_input_unchecked(slot, source)?;
        }
        self.touch();
        Ok(())
    }

    /// Connect by input slot name
    pub fn connect(&mut self, source: StreamRef, to: NodeId, input: &str) -> Result<()> {
        let slot = self
            .nodes
            .get(&to)
            .ok_or(ScopeError::UnknownNode(to))?
            .core()
            .input_index(input)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("{} has no input '{}'", to, input)))?;
        self.set_input(to, slot, Some(source))
    }

    pub fn disconnect(&mut self, to: NodeId, slot: usize) -> Result<()> {
        self.set_input(to, slot, None)
    }

    /// Whether `to` is `from` or already feeds `from` through existing inputs
    fn would_create_cycle(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.core().inputs().iter().filter_map(|s| s.source.map(|r| r.node)));
            }
        }
        false
    }

    /// Every connection as (producer, consumer)
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.nodes
            .iter()
            .flat_map(|(&id, node)| {
                node.core()
                    .inputs()
                    .iter()
                    .filter_map(move |slot| slot.source.map(|src| (src.node, id)))
            })
            .collect()
    }

    // ── Parameters ──

    pub fn set_parameter(&mut self, id: NodeId, name: &str, value: &ParameterValue) -> Result<()> {
        self.change_parameter(id, name, |params| params.set_value(name, value))
    }

    /// Set a parameter from user text (SI prefixes, enum names)
    pub fn set_parameter_from_string(&mut self, id: NodeId, name: &str, text: &str) -> Result<()> {
        self.change_parameter(id, name, |params| params.set_from_string(name, text))
    }

    /// Apply `set`, notify the filter, then rewire consumers if its outputs moved
    fn change_parameter<F>(&mut self, id: NodeId, name: &str, set: F) -> Result<()>
    where
        F: FnOnce(&mut ParameterMap) -> Result<()>,
    {
        let node = self.nodes.get_mut(&id).ok_or(ScopeError::UnknownNode(id))?;
        let old_streams: Vec<String> = node.core().streams().iter().map(|s| s.name.clone()).collect();
        let old_inputs = node.core().input_count();
        set(node.core_mut().parameters_mut())?;
        if let Some(f) = node.as_filter_mut() {
            f.on_parameter_changed(name);
        }

        let core = node.core();
        let streams_changed = core.streams().len() != old_streams.len()
            || core.streams().iter().zip(&old_streams).any(|(s, old)| s.name != *old);
        let inputs_changed = core.input_count() != old_inputs;
        if streams_changed {
            self.revalidate_consumers(id, &old_streams);
        }
        if streams_changed || inputs_changed {
            self.touch();
        }
        Ok(())
    }

    /// Follow consumers of `source` to the stream of the same name after its
    /// outputs were rebuilt. Inputs whose stream is gone or no longer
    /// accepted are disconnected.
    fn revalidate_consumers(&mut self, source: NodeId, old_streams: &[String]) {
        let mut rewired = Vec::new();
        for (&id, node) in &self.nodes {
            for (slot, input) in node.core().inputs().iter().enumerate() {
                let Some(src) = input.source.filter(|r| r.node == source) else {
                    continue;
                };
                let target = old_streams
                    .get(src.stream)
                    .and_then(|name| self.stream_ref(source, name).ok())
                    .filter(|r| self.stream(*r).is_some_and(|s| node.validate_channel(slot, s)));
                if target != Some(src) {
                    rewired.push((id, slot, src, target));
                }
            }
        }

        for (id, slot, old, target) in rewired {
            match target {
                Some(new) => tracing::debug!("{} input {} follows {} to {}", id, slot, old, new),
                None => tracing::warn!("{} input {} disconnected: {} no longer exists", id, slot, old),
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                if let Err(e) = node.core_mut().set_input_unchecked(slot, target) {
                    tracing::error!("Failed to rewire {} input {}: {}", id, slot, e);
                }
            }
        }
    }

    // ── Scheduler support ──

    /// Move at most one pending waveform set per instrument into channel streams.
    /// Returns the number of sets applied.
    pub fn pop_pending_waveforms(&mut self) -> usize {
        let mut applied = 0;
        for handle in &self.instruments {
            let Some(set) = handle.acquisition.pop_pending_waveform() else {
                continue;
            };
            applied += 1;

            let mut by_channel: BTreeMap<usize, Vec<(usize, Waveform)>> = BTreeMap::new();
            for ((channel, stream), waveform) in set {
                by_channel.entry(channel).or_default().push((stream, waveform));
            }
            for (channel, streams) in by_channel {
                let Some(id) = handle.channels.get(channel) else {
                    tracing::warn!(
                        "Instrument '{}' delivered data for missing channel {}",
                        handle.name,
                        channel
                    );
                    continue;
                };
                if let Some(AnyNode::Channel(c)) = self.nodes.get_mut(id) {
                    c.accept_waveforms(streams);
                }
            }
        }
        applied
    }

    /// Temporarily take a node out of the graph (for refresh)
    pub(crate) fn take(&mut self, id: NodeId) -> Option<AnyNode> {
        self.nodes.remove(&id)
    }

    pub(crate) fn restore(&mut self, node: AnyNode) {
        self.nodes.insert(node.id(), node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable_and_unique() {
        let mut graph = FilterGraph::new();
        let a = graph.create_filter("Tone", "#ffffff").unwrap();
        let b = graph.create_filter("Tone", "#ffffff").unwrap();
        assert_ne!(a, b);
        graph.remove(a).unwrap();
        let c = graph.create_filter("Tone", "#ffffff").unwrap();
        assert_ne!(c, a);
        assert_eq!(graph.node(b).unwrap().id(), b);
    }

    #[test]
    fn test_connect_validates_stream_type() {
        let mut graph = FilterGraph::new();
        let tone = graph.create_filter("Tone", "#ffffff").unwrap();
        let spi = graph.create_filter("SPI", "#ffffff").unwrap();
        let err = graph.connect(StreamRef::new(tone, 0), spi, "clk").unwrap_err();
        assert!(matches!(err, ScopeError::InvalidInput(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = FilterGraph::new();
        let tone = graph.create_filter("Tone", "#ffffff").unwrap();
        let a = graph.create_filter("Window", "#ffffff").unwrap();
        let b = graph.create_filter("Window", "#ffffff").unwrap();
        graph.connect(StreamRef::new(tone, 0), a, "din").unwrap();
        graph.connect(StreamRef::new(a, 0), b, "din").unwrap();

        let err = graph.connect(StreamRef::new(b, 0), a, "din").unwrap_err();
        assert!(matches!(err, ScopeError::CycleDetected { .. }));
        let err = graph.connect(StreamRef::new(a, 0), a, "din").unwrap_err();
        assert!(matches!(err, ScopeError::CycleDetected { .. }));
    }

    #[test]
    fn test_remove_clears_references() {
        let mut graph = FilterGraph::new();
        let tone = graph.create_filter("Tone", "#ffffff").unwrap();
        let rms = graph.create_filter("AC RMS", "#ffffff").unwrap();
        graph.connect(StreamRef::new(tone, 0), rms, "din").unwrap();
        assert_eq!(graph.edges(), vec![(tone, rms)]);

        let gen = graph.generation();
        graph.remove(tone).unwrap();
        assert!(graph.generation() > gen);
        assert!(graph.edges().is_empty());
        assert_eq!(graph.node(rms).unwrap().core().input(0), None);
    }

    #[test]
    fn test_unknown_stream() {
        let mut graph = FilterGraph::new();
        let tone = graph.create_filter("Tone", "#ffffff").unwrap();
        let rms = graph.create_filter("AC RMS", "#ffffff").unwrap();
        let err = graph.set_input(rms, 0, Some(StreamRef::new(tone, 9))).unwrap_err();
        assert!(matches!(err, ScopeError::UnknownStream { stream: 9, .. }));
        let err = graph.set_input(rms, 0, Some(StreamRef::new(NodeId(77), 0))).unwrap_err();
        assert!(matches!(err, ScopeError::UnknownNode(NodeId(77))));
    }

    #[test]
    fn test_shrinking_outputs_rewires_consumers() {
        let mut graph = FilterGraph::new();
        let plane = graph.create_filter("Reference Plane Extension", "#ffffff").unwrap();
        graph.set_parameter(plane, "Ports", &ParameterValue::Int(3)).unwrap();
        let s33 = graph.stream_ref(plane, "S33_mag").unwrap();
        let s22 = graph.stream_ref(plane, "S22_mag").unwrap();
        assert_eq!(s33.stream, 16);
        assert_eq!(s22.stream, 8);

        let gone = graph.create_filter("Bandwidth", "#ffffff").unwrap();
        let kept = graph.create_filter("Bandwidth", "#ffffff").unwrap();
        graph.set_input(gone, 0, Some(s33)).unwrap();
        graph.set_input(kept, 0, Some(s22)).unwrap();

        let gen = graph.generation();
        graph.set_parameter(plane, "Ports", &ParameterValue::Int(2)).unwrap();
        assert!(graph.generation() > gen);
        assert_eq!(graph.node(gone).unwrap().core().input(0), None);
        let moved = graph.node(kept).unwrap().core().input(0).unwrap();
        assert_eq!(moved, graph.stream_ref(plane, "S22_mag").unwrap());
        assert_eq!(moved.stream, 6);
        assert_eq!(graph.edges(), vec![(plane, kept)]);
    }

    #[test]
    fn test_unchanged_outputs_keep_generation() {
        let mut graph = FilterGraph::new();
        let tone = graph.create_filter("Tone", "#ffffff").unwrap();
        let gen = graph.generation();
        graph.set_parameter(tone, "Frequency", &ParameterValue::Float(2e6)).unwrap();
        assert_eq!(graph.generation(), gen);
    }

    #[test]
    fn test_parameter_from_string_notifies_filter() {
        let mut graph = FilterGraph::new();
        let tone = graph.create_filter("Tone", "#ffffff").unwrap();
        graph.set_parameter_from_string(tone, "Frequency", "2.5 MHz").unwrap();
        let f = graph.node(tone).unwrap().core().parameters().float("Frequency");
        assert!((f - 2.5e6).abs() < 1e-3);
        assert!(graph.set_parameter_from_string(tone, "Nope", "1").is_err());
    }
}
