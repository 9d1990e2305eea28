//! Flow graph: nodes, streams, parameters and the filter registry.
//!
//! # Architecture
//!
//! - [`FilterGraph`] owns every node and enforces acyclic wiring.
//! - [`AnyNode`] is either an [`InstrumentChannel`](crate::instrument::InstrumentChannel)
//!   (a leaf fed by acquisition) or a boxed [`Filter`].
//! - Each node owns its [`Stream`]s; each stream owns its current waveform.
//! - [`FilterRegistry`] creates filters by class name.
//!
//! Evaluation order and refresh live in [`crate::scheduler`].

mod filter;
mod flowgraph;
mod id;
mod node;
mod parameter;
mod registry;
mod stream;

pub(crate) use filter::filter_core;
pub use filter::{
    is_analog_waveform, is_digital_waveform, is_frequency_domain, is_scalar, Filter, InputLocation,
    RefreshContext,
};
pub use flowgraph::FilterGraph;
pub use id::{NodeId, StreamRef};
pub use node::{AnyNode, InputSlot, NodeCore};
pub(crate) use node::RefreshStamp;
pub use parameter::{FileFilter, FilterParameter, ParameterChange, ParameterMap, ParameterValue};
pub use registry::{FilterFactory, FilterRegistry};
pub use stream::{Stream, StreamFlags, StreamType};
