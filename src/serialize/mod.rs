//! Graph documents: save and load a whole filter graph.
//!
//! A [`GraphDocument`] records every instrument (driver, transport, timebase,
//! trigger and per-channel front-end settings) and every filter (class,
//! color, typed parameters, named input wiring and stream units). Filters
//! are keyed by node id and channels carry theirs, so ids survive a round
//! trip. Documents are JSON or TOML, picked by file extension the same way
//! as [`EngineConfig`](crate::config::EngineConfig).
//!
//! Loading is tolerant. Unknown keys are ignored, and a problem that only
//! affects one node (unknown class, dangling input, rejected setting) becomes
//! a warning instead of failing the whole load.

use crate::config::AcquisitionConfig;
use crate::error::{Result, ScopeError};
use crate::graph::{FilterGraph, FilterRegistry, NodeCore, NodeId, ParameterValue, StreamRef};
use crate::instrument::{
    AcquisitionController, ChannelKind, Coupling, Instrument, InstrumentFactory, InstrumentHandle,
    TriggerSettings,
};
use crate::units::Unit;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

/// Newest document layout this build reads and writes
pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphDocument {
    pub version: u32,
    /// Instruments keyed by name
    pub instruments: BTreeMap<String, InstrumentEntry>,
    /// Filters keyed by node id
    pub filters: BTreeMap<String, FilterEntry>,
}

impl Default for GraphDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            instruments: BTreeMap::new(),
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentEntry {
    pub driver: String,
    pub transport: String,
    pub connection_string: String,
    pub sample_rate: u64,
    pub sample_depth: u64,
    pub interleaving: bool,
    pub trigger_offset_fs: i64,
    pub trigger: TriggerSettings,
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelEntry {
    pub id: u32,
    pub display_name: String,
    pub color: String,
    pub enabled: bool,
    pub coupling: Option<Coupling>,
    pub attenuation: f64,
    pub bandwidth_limit_mhz: u32,
    pub inverted: bool,
    /// Full-scale range per stream, volts
    pub ranges: Vec<f64>,
    /// Offset per stream, volts
    pub offsets: Vec<f64>,
    pub input_mux: usize,
    pub adc_mode: usize,
    pub digital_threshold: Option<f64>,
    pub digital_hysteresis: Option<f64>,
    pub streams: Vec<StreamEntry>,
}

impl Default for ChannelEntry {
    fn default() -> Self {
        Self {
            id: 0,
            display_name: String::new(),
            color: String::new(),
            enabled: true,
            coupling: None,
            attenuation: 1.0,
            bandwidth_limit_mhz: 0,
            inverted: false,
            ranges: Vec::new(),
            offsets: Vec::new(),
            input_mux: 0,
            adc_mode: 0,
            digital_threshold: None,
            digital_hysteresis: None,
            streams: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterEntry {
    pub class: String,
    pub color: String,
    pub display_name: String,
    pub parameters: BTreeMap<String, ParameterValue>,
    /// Connected inputs keyed by input name
    pub inputs: BTreeMap<String, StreamRef>,
    pub streams: Vec<StreamEntry>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamEntry {
    pub name: String,
    pub x_unit: Unit,
    pub y_unit: Unit,
}

/// A graph rebuilt from a document, plus everything that could not be restored
#[derive(Debug)]
pub struct LoadedGraph {
    pub graph: FilterGraph,
    pub warnings: Vec<String>,
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}

fn parse_id(key: &str) -> Option<NodeId> {
    key.parse::<u32>().ok().map(NodeId).filter(|id| id.is_valid())
}

fn stream_entries(core: &NodeCore) -> Vec<StreamEntry> {
    core.streams()
        .iter()
        .map(|s| StreamEntry {
            name: s.name.clone(),
            x_unit: s.x_unit,
            y_unit: s.y_unit,
        })
        .collect()
}

fn channel_entry(graph: &FilterGraph, instrument: &dyn Instrument, i: usize, id: NodeId) -> ChannelEntry {
    let info = instrument.channel_info(i);
    let digital = info.kind == ChannelKind::Digital;
    let stream_count = info.streams.len();
    let core = graph.node(id).map(|n| n.core());
    ChannelEntry {
        id: id.0,
        display_name: core.map(|c| c.display_name.clone()).unwrap_or_default(),
        color: core.map(|c| c.color.clone()).unwrap_or(info.color),
        enabled: instrument.is_channel_enabled(i),
        coupling: (!digital).then(|| instrument.coupling(i)),
        attenuation: instrument.attenuation(i),
        bandwidth_limit_mhz: instrument.bandwidth_limit(i),
        inverted: instrument.is_inverted(i),
        ranges: (0..stream_count).map(|s| instrument.voltage_range(i, s)).collect(),
        offsets: (0..stream_count).map(|s| instrument.offset(i, s)).collect(),
        input_mux: instrument.input_mux(i),
        adc_mode: instrument.adc_mode(i),
        digital_threshold: digital.then(|| instrument.digital_threshold(i)),
        digital_hysteresis: digital.then(|| instrument.digital_hysteresis(i)),
        streams: core.map(stream_entries).unwrap_or_default(),
    }
}

fn instrument_entry(graph: &FilterGraph, handle: &InstrumentHandle) -> InstrumentEntry {
    let instrument = handle.instrument();
    let transport = instrument.transport();
    InstrumentEntry {
        driver: instrument.driver_name(),
        transport: transport.name,
        connection_string: transport.connection_string,
        sample_rate: instrument.sample_rate(),
        sample_depth: instrument.sample_depth(),
        interleaving: instrument.is_interleaving(),
        trigger_offset_fs: instrument.trigger_offset(),
        trigger: instrument.trigger(),
        channels: handle
            .channels
            .iter()
            .enumerate()
            .map(|(i, &id)| channel_entry(graph, instrument.as_ref(), i, id))
            .collect(),
    }
}

/// Re-apply a saved setting when it differs from what the driver reports
fn restore<T: PartialEq + Debug>(
    warnings: &mut Vec<String>,
    what: impl FnOnce() -> String,
    current: T,
    saved: T,
    set: impl FnOnce(T) -> Result<()>,
) {
    if current == saved {
        return;
    }
    if let Err(e) = set(saved) {
        let message = format!("{}: {}", what(), e);
        tracing::warn!("{}", message);
        warnings.push(message);
    }
}

fn restore_timebase(instrument: &dyn Instrument, name: &str, entry: &InstrumentEntry, warnings: &mut Vec<String>) {
    if entry.sample_rate != 0 {
        restore(warnings, || format!("{} sample rate", name), instrument.sample_rate(), entry.sample_rate, |v| {
            instrument.set_sample_rate(v)
        });
    }
    if entry.sample_depth != 0 {
        restore(warnings, || format!("{} sample depth", name), instrument.sample_depth(), entry.sample_depth, |v| {
            instrument.set_sample_depth(v)
        });
    }
    restore(warnings, || format!("{} interleaving", name), instrument.is_interleaving(), entry.interleaving, |v| {
        instrument.set_interleaving(v).map(|_| ())
    });
    restore(
        warnings,
        || format!("{} trigger offset", name),
        instrument.trigger_offset(),
        entry.trigger_offset_fs,
        |v| instrument.set_trigger_offset(v),
    );
    restore(warnings, || format!("{} trigger", name), instrument.trigger(), entry.trigger.clone(), |v| {
        instrument.set_trigger(v)
    });
}

fn restore_channel(instrument: &dyn Instrument, i: usize, entry: &ChannelEntry, warnings: &mut Vec<String>) {
    let label = || format!("{} channel {}", instrument.name(), i);
    restore(warnings, || format!("{} enable", label()), instrument.is_channel_enabled(i), entry.enabled, |v| {
        instrument.set_channel_enabled(i, v)
    });
    if let Some(coupling) = entry.coupling {
        restore(warnings, || format!("{} coupling", label()), instrument.coupling(i), coupling, |v| {
            instrument.set_coupling(i, v)
        });
    }
    restore(warnings, || format!("{} attenuation", label()), instrument.attenuation(i), entry.attenuation, |v| {
        instrument.set_attenuation(i, v)
    });
    restore(
        warnings,
        || format!("{} bandwidth limit", label()),
        instrument.bandwidth_limit(i),
        entry.bandwidth_limit_mhz,
        |v| instrument.set_bandwidth_limit(i, v),
    );
    restore(warnings, || format!("{} invert", label()), instrument.is_inverted(i), entry.inverted, |v| {
        instrument.set_inverted(i, v)
    });
    for (s, &range) in entry.ranges.iter().enumerate() {
        restore(warnings, || format!("{} range", label()), instrument.voltage_range(i, s), range, |v| {
            instrument.set_voltage_range(i, s, v)
        });
    }
    for (s, &offset) in entry.offsets.iter().enumerate() {
        restore(warnings, || format!("{} offset", label()), instrument.offset(i, s), offset, |v| {
            instrument.set_offset(i, s, v)
        });
    }
    restore(warnings, || format!("{} input mux", label()), instrument.input_mux(i), entry.input_mux, |v| {
        instrument.set_input_mux(i, v)
    });
    restore(warnings, || format!("{} ADC mode", label()), instrument.adc_mode(i), entry.adc_mode, |v| {
        instrument.set_adc_mode(i, v)
    });
    if let Some(threshold) = entry.digital_threshold {
        restore(warnings, || format!("{} threshold", label()), instrument.digital_threshold(i), threshold, |v| {
            instrument.set_digital_threshold(i, v)
        });
    }
    if let Some(hysteresis) = entry.digital_hysteresis {
        restore(warnings, || format!("{} hysteresis", label()), instrument.digital_hysteresis(i), hysteresis, |v| {
            instrument.set_digital_hysteresis(i, v)
        });
    }
}

/// Apply saved stream units to streams that still exist under the same name
fn restore_streams(core: &mut NodeCore, streams: &[StreamEntry]) {
    for saved in streams {
        if let Some(idx) = core.stream_index(&saved.name) {
            if let Some(stream) = core.stream_mut(idx) {
                stream.x_unit = saved.x_unit;
                stream.y_unit = saved.y_unit;
            }
        }
    }
}

fn has_parameter(graph: &FilterGraph, id: NodeId, name: &str) -> bool {
    graph
        .node(id)
        .is_some_and(|n| n.core().parameters().contains(name))
}

/// Set saved parameters. Names created by another parameter's change hook
/// (a port count, say) are retried once the rest are in place.
fn restore_parameters(graph: &mut FilterGraph, id: NodeId, entry: &FilterEntry, warnings: &mut Vec<String>) {
    let mut deferred = Vec::new();
    for (name, value) in &entry.parameters {
        if has_parameter(graph, id, name) {
            if let Err(e) = graph.set_parameter(id, name, value) {
                warnings.push(format!("{} parameter '{}': {}", id, name, e));
            }
        } else {
            deferred.push((name, value));
        }
    }
    for (name, value) in deferred {
        if !has_parameter(graph, id, name) {
            tracing::warn!("Dropping unknown parameter '{}' of {}", name, id);
            warnings.push(format!("{} has no parameter '{}'", id, name));
            continue;
        }
        if let Err(e) = graph.set_parameter(id, name, value) {
            warnings.push(format!("{} parameter '{}': {}", id, name, e));
        }
    }
}

impl GraphDocument {
    /// Snapshot a graph
    pub fn from_graph(graph: &FilterGraph) -> Self {
        let instruments = graph
            .instruments()
            .iter()
            .map(|h| (h.name.clone(), instrument_entry(graph, h)))
            .collect();

        let filters = graph
            .iter()
            .filter_map(|(id, node)| node.as_filter().map(|f| (id, f.core())))
            .map(|(id, core)| {
                let entry = FilterEntry {
                    class: core.class_name().to_string(),
                    color: core.color.clone(),
                    display_name: core.display_name.clone(),
                    parameters: core
                        .parameters()
                        .iter()
                        .map(|(name, p)| (name.clone(), p.value().clone()))
                        .collect(),
                    inputs: core
                        .inputs()
                        .iter()
                        .filter_map(|slot| slot.source.map(|src| (slot.name.clone(), src)))
                        .collect(),
                    streams: stream_entries(core),
                };
                (id.0.to_string(), entry)
            })
            .collect();

        Self {
            version: DOCUMENT_VERSION,
            instruments,
            filters,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ScopeError::Serialization(format!("Failed to serialize graph: {}", e)))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ScopeError::Serialization(format!("Failed to parse graph: {}", e)))
    }

    /// Read a `.toml` or JSON document
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScopeError::from(e).with_context(format!("reading {:?}", path)))?;
        let doc = if is_toml(path) {
            Self::from_toml(&text)
        } else {
            Self::from_json(&text)
        };
        doc.map_err(|e| e.with_context(format!("loading {:?}", path)))
    }

    /// Write as TOML or JSON depending on the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = if is_toml(path) { self.to_toml()? } else { self.to_json()? };
        std::fs::write(path, text)?;
        tracing::info!(
            "Saved graph with {} instruments and {} filters to {:?}",
            self.instruments.len(),
            self.filters.len(),
            path
        );
        Ok(())
    }

    /// Node ids the document will create
    fn known_ids(&self) -> BTreeSet<u32> {
        self.instruments
            .values()
            .flat_map(|i| i.channels.iter().map(|c| c.id))
            .chain(self.filters.keys().filter_map(|k| parse_id(k)).map(|id| id.0))
            .collect()
    }

    /// Check a document against the available filters and drivers without building it
    pub fn preflight(&self, registry: &FilterRegistry, drivers: &InstrumentFactory) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.version > DOCUMENT_VERSION {
            warnings.push(format!(
                "document version {} is newer than supported version {}",
                self.version, DOCUMENT_VERSION
            ));
        }
        for (name, inst) in &self.instruments {
            if !drivers.contains(&inst.driver) {
                warnings.push(format!("instrument '{}' uses unknown driver '{}'", name, inst.driver));
            }
        }

        let known = self.known_ids();
        for (key, entry) in &self.filters {
            if parse_id(key).is_none() {
                warnings.push(format!("'{}' is not a valid node id", key));
            }
            if !registry.contains(&entry.class) {
                warnings.push(format!("node {} has unknown filter class '{}'", key, entry.class));
            }
            for (input, src) in &entry.inputs {
                if !known.contains(&src.node.0) {
                    warnings.push(format!(
                        "input '{}' of node {} refers to missing node {}",
                        input, key, src.node.0
                    ));
                }
            }
        }
        warnings
    }

    /// Rebuild a graph. Fails only on documents newer than this build understands.
    pub fn build(
        &self,
        registry: &FilterRegistry,
        drivers: &InstrumentFactory,
        acquisition: &AcquisitionConfig,
    ) -> Result<LoadedGraph> {
        if self.version > DOCUMENT_VERSION {
            return Err(ScopeError::Serialization(format!(
                "document version {} is newer than supported version {}",
                self.version, DOCUMENT_VERSION
            )));
        }
        let mut graph = FilterGraph::new();
        let mut warnings = Vec::new();

        for (name, entry) in &self.instruments {
            if let Err(e) = self.build_instrument(&mut graph, name, entry, drivers, acquisition, &mut warnings) {
                tracing::warn!("Skipping instrument '{}': {}", name, e);
                warnings.push(format!("instrument '{}': {}", name, e));
            }
        }

        let mut created = Vec::new();
        for (key, entry) in &self.filters {
            let Some(id) = parse_id(key) else {
                warnings.push(format!("'{}' is not a valid node id", key));
                continue;
            };
            let filter = match registry.create_filter(&entry.class, &entry.color) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("Skipping node {}: {}", key, e);
                    warnings.push(format!("node {}: {}", key, e));
                    continue;
                }
            };
            if let Err(e) = graph.insert_with_id(id, filter) {
                warnings.push(format!("node {}: {}", key, e));
                continue;
            }
            if let Some(node) = graph.node_mut(id) {
                if !entry.display_name.is_empty() {
                    node.core_mut().display_name = entry.display_name.clone();
                }
            }
            restore_parameters(&mut graph, id, entry, &mut warnings);
            if let Some(node) = graph.node_mut(id) {
                restore_streams(node.core_mut(), &entry.streams);
            }
            created.push((id, entry));
        }

        // Wire last so every source exists
        for (id, entry) in created {
            for (input, &src) in &entry.inputs {
                let slot = graph.node(id).and_then(|n| n.core().input_index(input));
                let Some(slot) = slot else {
                    warnings.push(format!("{} has no input '{}'", id, input));
                    continue;
                };
                if let Err(e) = graph.set_input(id, slot, Some(src)) {
                    tracing::warn!("Leaving input '{}' of {} unconnected: {}", input, id, e);
                    warnings.push(format!("input '{}' of {}: {}", input, id, e));
                }
            }
        }

        tracing::info!(
            "Loaded graph with {} nodes ({} warnings)",
            graph.len(),
            warnings.len()
        );
        Ok(LoadedGraph { graph, warnings })
    }

    fn build_instrument(
        &self,
        graph: &mut FilterGraph,
        name: &str,
        entry: &InstrumentEntry,
        drivers: &InstrumentFactory,
        acquisition: &AcquisitionConfig,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let instrument = drivers.create(&entry.driver, name, &entry.connection_string)?;
        restore_timebase(instrument.as_ref(), name, entry, warnings);

        let count = instrument.channel_count();
        let ids: Vec<NodeId> = entry.channels.iter().map(|c| NodeId(c.id)).collect();
        let ids_usable = ids.len() == count && ids.iter().all(|&id| id.is_valid() && !graph.contains(id));
        if !ids_usable && !entry.channels.is_empty() {
            warnings.push(format!(
                "instrument '{}': saved channel ids do not fit {} channels, assigning new ids",
                name, count
            ));
        }

        let controller = Arc::new(AcquisitionController::from_config(instrument.clone(), acquisition));
        let channel_ids = graph.attach_instrument(name, controller, ids_usable.then_some(ids.as_slice()))?;

        for (i, (&id, saved)) in channel_ids.iter().zip(&entry.channels).enumerate() {
            restore_channel(instrument.as_ref(), i, saved, warnings);
            if let Some(node) = graph.node_mut(id) {
                let core = node.core_mut();
                if !saved.display_name.is_empty() {
                    core.display_name = saved.display_name.clone();
                }
                if !saved.color.is_empty() {
                    core.color = saved.color.clone();
                }
                restore_streams(core, &saved.streams);
            }
        }
        Ok(())
    }
}

/// Save `graph` to `path` (TOML for `.toml`, JSON otherwise)
pub fn save_graph(graph: &FilterGraph, path: impl AsRef<Path>) -> Result<()> {
    GraphDocument::from_graph(graph).save(path)
}

/// Load a graph with the built-in filters and drivers
pub fn load_graph(path: impl AsRef<Path>, acquisition: &AcquisitionConfig) -> Result<LoadedGraph> {
    GraphDocument::load(path)?.build(
        FilterRegistry::global(),
        &InstrumentFactory::with_builtins(),
        acquisition,
    )
}
