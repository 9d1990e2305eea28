//! The `Filter` trait and the context handed to `refresh`.

use super::node::NodeCore;
use super::stream::{Stream, StreamType};
use crate::compute::{CommandBuffer, ComputeContext};
use crate::error::{Result, ScopeError};
use crate::units::Unit;
use crate::waveform::{AnalogView, DigitalView, Waveform};
use std::fmt;

/// Where a filter wants its inputs staged before `refresh`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputLocation {
    #[default]
    Cpu,
    Gpu,
    /// The filter handles either residency itself
    DontCare,
}

/// A flow-graph node that derives its outputs from its inputs.
///
/// `refresh` either sets a fresh waveform on each output, sets a scalar value,
/// or returns an error. On error the scheduler records the message on the node
/// and nulls every output, so implementations need not clean up.
pub trait Filter: Send + fmt::Debug {
    fn core(&self) -> &NodeCore;

    fn core_mut(&mut self) -> &mut NodeCore;

    /// Whether `stream` is an acceptable source for input `i`
    fn validate_channel(&self, i: usize, stream: &Stream) -> bool;

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()>;

    fn input_location(&self) -> InputLocation {
        InputLocation::Cpu
    }

    /// Volatile filters are refreshed every cycle even when nothing changed
    fn is_volatile(&self) -> bool {
        false
    }

    /// Called after a parameter has been set through the graph
    fn on_parameter_changed(&mut self, _name: &str) {}
}

/// Implements `core`/`core_mut` for a filter whose `NodeCore` is in `self.core`
macro_rules! filter_core {
    () => {
        fn core(&self) -> &$crate::graph::NodeCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut $crate::graph::NodeCore {
            &mut self.core
        }
    };
}
pub(crate) use filter_core;

/// Accept any time-domain analog waveform stream
pub fn is_analog_waveform(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Analog && stream.x_unit == Unit::Femtoseconds
}

/// Accept any analog stream whose X axis is frequency
pub fn is_frequency_domain(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Analog && stream.x_unit.hertz_scale().is_some()
}

pub fn is_digital_waveform(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Digital
}

pub fn is_scalar(stream: &Stream) -> bool {
    stream.stream_type == StreamType::AnalogScalar
}

/// Everything a filter may touch during one refresh
pub struct RefreshContext<'a> {
    inputs: Vec<Option<&'a Stream>>,
    names: Vec<String>,
    compute: &'a ComputeContext,
    cmd: &'a mut CommandBuffer,
}

impl<'a> RefreshContext<'a> {
    pub fn new(
        inputs: Vec<Option<&'a Stream>>,
        names: Vec<String>,
        compute: &'a ComputeContext,
        cmd: &'a mut CommandBuffer,
    ) -> Self {
        Self {
            inputs,
            names,
            compute,
            cmd,
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn name(&self, i: usize) -> String {
        self.names.get(i).cloned().unwrap_or_else(|| format!("input {}", i))
    }

    pub fn input(&self, i: usize) -> Option<&'a Stream> {
        self.inputs.get(i).copied().flatten()
    }

    pub fn input_waveform(&self, i: usize) -> Result<&'a Waveform> {
        self.input(i)
            .and_then(Stream::waveform)
            .ok_or_else(|| ScopeError::MissingInput(self.name(i)))
    }

    pub fn analog_input(&self, i: usize) -> Result<AnalogView<'a>> {
        self.input_waveform(i)?
            .analog()
            .ok_or_else(|| ScopeError::InvalidInput(format!("{} is not an analog waveform", self.name(i))))
    }

    pub fn digital_input(&self, i: usize) -> Result<DigitalView<'a>> {
        self.input_waveform(i)?
            .digital()
            .ok_or_else(|| ScopeError::InvalidInput(format!("{} is not a digital waveform", self.name(i))))
    }

    pub fn scalar_input(&self, i: usize) -> Result<f64> {
        self.input(i)
            .and_then(Stream::value)
            .ok_or_else(|| ScopeError::MissingInput(self.name(i)))
    }

    pub fn compute(&self) -> &'a ComputeContext {
        self.compute
    }

    pub fn cmd(&mut self) -> &mut CommandBuffer {
        self.cmd
    }

    /// Submit the recorded commands and wait for completion
    pub fn submit_and_block(&mut self) -> Result<()> {
        let queue = self
            .compute
            .queue()
            .ok_or_else(|| ScopeError::Unsupported("no compute device".to_string()))?;
        queue.submit_and_block(self.cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::UniformWaveform;

    #[test]
    fn test_missing_and_wrong_type_inputs() {
        let compute = ComputeContext::cpu_only();
        let mut cmd = CommandBuffer::new();

        let mut analog = Stream::analog("CH1", Unit::Volts);
        analog.set_waveform(Some(UniformWaveform::from_samples(vec![1.0f32, 2.0], 10).into()));
        let empty = Stream::digital("D0");

        let ctx = RefreshContext::new(
            vec![Some(&analog), Some(&empty), None],
            vec!["din".into(), "clk".into(), "cs".into()],
            &compute,
            &mut cmd,
        );

        assert_eq!(ctx.analog_input(0).unwrap().len(), 2);
        assert!(matches!(ctx.digital_input(0), Err(ScopeError::InvalidInput(_))));
        assert!(matches!(ctx.input_waveform(1), Err(ScopeError::MissingInput(n)) if n == "clk"));
        assert!(matches!(ctx.scalar_input(2), Err(ScopeError::MissingInput(_))));
    }

    #[test]
    fn test_stream_predicates() {
        assert!(is_analog_waveform(&Stream::analog("a", Unit::Volts)));
        assert!(!is_analog_waveform(&Stream::digital("d")));
        let spectrum = Stream::new("mag", StreamType::Analog, Unit::Hertz, Unit::Db);
        assert!(is_frequency_domain(&spectrum));
        let fine = Stream::new("mag", StreamType::Analog, Unit::Millihertz, Unit::Db);
        assert!(is_frequency_domain(&fine));
        assert!(is_scalar(&Stream::scalar("x", Unit::Volts)));
    }
}
