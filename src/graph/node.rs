//! Node abstraction for the filter graph.
//!
//! Two layers, as in the rest of the graph:
//! - **[`NodeCore`]** holds what every node has: identity, input slots,
//!   output streams, parameters and the error list.
//! - **[`AnyNode`]** is the enum stored in the graph. Instrument channels are
//!   a concrete variant; everything else is a boxed [`Filter`].

use super::filter::Filter;
use super::id::{NodeId, StreamRef};
use super::parameter::ParameterMap;
use super::stream::Stream;
use crate::error::{Result, ScopeError};
use crate::instrument::InstrumentChannel;
use crate::waveform::Waveform;

/// One input of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSlot {
    pub name: String,
    pub source: Option<StreamRef>,
}

/// What a node saw on its last refresh; used to skip unchanged work
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RefreshStamp {
    pub input_revisions: Vec<Option<u64>>,
    pub parameter_generation: u64,
}

/// State shared by every node kind
#[derive(Debug)]
pub struct NodeCore {
    id: NodeId,
    class_name: String,
    pub display_name: String,
    pub color: String,
    inputs: Vec<InputSlot>,
    streams: Vec<Stream>,
    params: ParameterMap,
    errors: Vec<String>,
    pub(crate) last_refresh: Option<RefreshStamp>,
    pub(crate) output_revision: u64,
}

impl NodeCore {
    pub fn new(class_name: impl Into<String>, color: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self {
            id: NodeId::INVALID,
            display_name: class_name.clone(),
            class_name,
            color: color.into(),
            inputs: Vec::new(),
            streams: Vec::new(),
            params: ParameterMap::new(),
            errors: Vec::new(),
            last_refresh: None,
            output_revision: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    // ── Inputs ──

    pub fn create_input(&mut self, name: impl Into<String>) {
        self.inputs.push(InputSlot {
            name: name.into(),
            source: None,
        });
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, i: usize) -> Option<StreamRef> {
        self.inputs.get(i).and_then(|slot| slot.source)
    }

    pub fn input_name(&self, i: usize) -> Option<&str> {
        self.inputs.get(i).map(|slot| slot.name.as_str())
    }

    /// Index of the input slot called `name`
    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|slot| slot.name == name)
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    /// Replace the input slots. A slot whose name survives keeps its source.
    pub fn rebuild_inputs<S: Into<String>>(&mut self, names: impl IntoIterator<Item = S>) {
        let old = std::mem::take(&mut self.inputs);
        self.inputs = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                let source = old.iter().find(|slot| slot.name == name).and_then(|slot| slot.source);
                InputSlot { name, source }
            })
            .collect();
        self.last_refresh = None;
    }

    /// Raw slot assignment; validation and cycle checks live in the graph
    pub(crate) fn set_input_unchecked(&mut self, i: usize, source: Option<StreamRef>) -> Result<()> {
        let slot = self
            .inputs
            .get_mut(i)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no input slot {}", i)))?;
        slot.source = source;
        self.last_refresh = None;
        Ok(())
    }

    /// Clear every input that points at `node`. Returns how many were cleared.
    pub(crate) fn disconnect_from(&mut self, node: NodeId) -> usize {
        let mut cleared = 0;
        for slot in &mut self.inputs {
            if slot.source.is_some_and(|s| s.node == node) {
                slot.source = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.last_refresh = None;
        }
        cleared
    }

    // ── Streams ──

    pub fn add_stream(&mut self, stream: Stream) -> usize {
        self.streams.push(stream);
        self.streams.len() - 1
    }

    /// Replace every output stream; consumers address streams by index
    pub fn rebuild_streams(&mut self, streams: Vec<Stream>) {
        self.streams = streams;
        self.last_refresh = None;
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, i: usize) -> Option<&Stream> {
        self.streams.get(i)
    }

    pub fn stream_mut(&mut self, i: usize) -> Option<&mut Stream> {
        self.streams.get_mut(i)
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [Stream] {
        &mut self.streams
    }

    /// Index of the stream called `name`
    pub fn stream_index(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.name == name)
    }

    pub fn set_output_waveform(&mut self, i: usize, waveform: Waveform) {
        match self.streams.get_mut(i) {
            Some(stream) => stream.set_waveform(Some(waveform)),
            None => tracing::error!("{} has no output stream {}", self.id, i),
        }
    }

    pub fn set_output_value(&mut self, i: usize, value: f64) {
        match self.streams.get_mut(i) {
            Some(stream) => stream.set_value(Some(value)),
            None => tracing::error!("{} has no output stream {}", self.id, i),
        }
    }

    /// Null every output stream
    pub fn clear_outputs(&mut self) {
        for stream in &mut self.streams {
            stream.clear();
        }
    }

    // ── Parameters ──

    pub fn parameters(&self) -> &ParameterMap {
        &self.params
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterMap {
        &mut self.params
    }

    // ── Errors ──

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }
}

/// Enum dispatch over node kinds
#[derive(Debug)]
pub enum AnyNode {
    Channel(InstrumentChannel),
    Filter(Box<dyn Filter>),
}

impl AnyNode {
    pub fn core(&self) -> &NodeCore {
        match self {
            AnyNode::Channel(c) => c.core(),
            AnyNode::Filter(f) => f.core(),
        }
    }

    pub fn core_mut(&mut self) -> &mut NodeCore {
        match self {
            AnyNode::Channel(c) => c.core_mut(),
            AnyNode::Filter(f) => f.core_mut(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.core().id()
    }

    pub fn class_name(&self) -> &str {
        self.core().class_name()
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, AnyNode::Channel(_))
    }

    pub fn as_filter(&self) -> Option<&dyn Filter> {
        match self {
            AnyNode::Filter(f) => Some(f.as_ref()),
            AnyNode::Channel(_) => None,
        }
    }

    pub fn as_filter_mut(&mut self) -> Option<&mut (dyn Filter + 'static)> {
        match self {
            AnyNode::Filter(f) => Some(f.as_mut()),
            AnyNode::Channel(_) => None,
        }
    }

    pub fn as_channel(&self) -> Option<&InstrumentChannel> {
        match self {
            AnyNode::Channel(c) => Some(c),
            AnyNode::Filter(_) => None,
        }
    }

    pub fn as_channel_mut(&mut self) -> Option<&mut InstrumentChannel> {
        match self {
            AnyNode::Channel(c) => Some(c),
            AnyNode::Filter(_) => None,
        }
    }

    /// Whether `stream` is an acceptable source for input `i`.
    /// Channels have no inputs and accept nothing.
    pub fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        match self {
            AnyNode::Channel(_) => false,
            AnyNode::Filter(f) => i < f.core().input_count() && f.validate_channel(i, stream),
        }
    }
}

impl From<InstrumentChannel> for AnyNode {
    fn from(c: InstrumentChannel) -> Self {
        AnyNode::Channel(c)
    }
}

impl From<Box<dyn Filter>> for AnyNode {
    fn from(f: Box<dyn Filter>) -> Self {
        AnyNode::Filter(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Unit;

    #[test]
    fn test_inputs_by_name() {
        let mut core = NodeCore::new("Window", "#ffffff");
        core.create_input("din");
        core.create_input("clk");
        assert_eq!(core.input_count(), 2);
        assert_eq!(core.input_index("clk"), Some(1));
        assert_eq!(core.input(0), None);

        core.set_input_unchecked(0, Some(StreamRef::new(NodeId(4), 0))).unwrap();
        core.set_input_unchecked(1, Some(StreamRef::new(NodeId(4), 1))).unwrap();
        assert_eq!(core.disconnect_from(NodeId(4)), 2);
        assert!(core.inputs().iter().all(|s| s.source.is_none()));
        assert!(core.set_input_unchecked(5, None).is_err());
    }

    #[test]
    fn test_rebuild_inputs_keeps_named_sources() {
        let mut core = NodeCore::new("Reference Plane Extension", "#ffffff");
        core.rebuild_inputs(["S11_mag", "S11_ang"]);
        let src = StreamRef::new(NodeId(2), 1);
        core.set_input_unchecked(1, Some(src)).unwrap();

        core.rebuild_inputs(["S11_mag", "S11_ang", "S21_mag"]);
        assert_eq!(core.input_count(), 3);
        assert_eq!(core.input(1), Some(src));
        assert_eq!(core.input(2), None);
    }

    #[test]
    fn test_clear_outputs_nulls_values() {
        let mut core = NodeCore::new("Peak", "#ffffff");
        let i = core.add_stream(Stream::scalar("Pk-Pk", Unit::Volts));
        core.set_output_value(i, 1.5);
        assert!(core.stream(i).unwrap().has_data());
        core.clear_outputs();
        assert!(!core.stream(i).unwrap().has_data());
    }
}
