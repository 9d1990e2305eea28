//! Output streams of flow-graph nodes.

use crate::units::Unit;
use crate::waveform::Waveform;
use serde::{Deserialize, Serialize};

/// Sample type carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Analog,
    Digital,
    Protocol,
    AnalogScalar,
    Trigger,
}

/// Display flags of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamFlags(pub u8);

impl StreamFlags {
    /// Render as steps; consumers must not interpolate between samples
    pub const DO_NOT_INTERPOLATE: StreamFlags = StreamFlags(0x01);

    pub fn contains(self, other: StreamFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: StreamFlags) {
        self.0 |= other.0;
    }
}

/// One named output of a node. Owns its current waveform exclusively.
#[derive(Debug)]
pub struct Stream {
    pub name: String,
    pub stream_type: StreamType,
    pub x_unit: Unit,
    pub y_unit: Unit,
    pub flags: StreamFlags,
    value: Option<f64>,
    waveform: Option<Waveform>,
    revision: u64,
}

impl Stream {
    pub fn new(name: impl Into<String>, stream_type: StreamType, x_unit: Unit, y_unit: Unit) -> Self {
        Self {
            name: name.into(),
            stream_type,
            x_unit,
            y_unit,
            flags: StreamFlags::default(),
            value: None,
            waveform: None,
            revision: 0,
        }
    }

    /// Time-domain analog stream
    pub fn analog(name: impl Into<String>, y_unit: Unit) -> Self {
        Self::new(name, StreamType::Analog, Unit::Femtoseconds, y_unit)
    }

    /// Time-domain digital stream
    pub fn digital(name: impl Into<String>) -> Self {
        Self::new(name, StreamType::Digital, Unit::Femtoseconds, Unit::Unitless)
    }

    pub fn protocol(name: impl Into<String>) -> Self {
        Self::new(name, StreamType::Protocol, Unit::Femtoseconds, Unit::Unitless)
    }

    /// Single-value stream
    pub fn scalar(name: impl Into<String>, y_unit: Unit) -> Self {
        Self::new(name, StreamType::AnalogScalar, Unit::Femtoseconds, y_unit)
    }

    pub fn with_flags(mut self, flags: StreamFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn waveform(&self) -> Option<&Waveform> {
        self.waveform.as_ref()
    }

    pub fn waveform_mut(&mut self) -> Option<&mut Waveform> {
        self.waveform.as_mut()
    }

    /// Replace the current waveform; the previous one is dropped
    pub fn set_waveform(&mut self, waveform: Option<Waveform>) {
        self.waveform = waveform;
    }

    pub fn take_waveform(&mut self) -> Option<Waveform> {
        self.waveform.take()
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn set_value(&mut self, value: Option<f64>) {
        self.value = value;
    }

    /// Null both the waveform and the scalar value
    pub fn clear(&mut self) {
        self.waveform = None;
        self.value = None;
    }

    pub fn has_data(&self) -> bool {
        self.waveform.is_some() || self.value.is_some()
    }

    /// Revision of the current contents, `None` when the stream is null
    pub fn revision(&self) -> Option<u64> {
        match (&self.waveform, self.value) {
            (Some(w), _) => Some(w.revision().max(self.revision)),
            (None, Some(_)) => Some(self.revision),
            (None, None) => None,
        }
    }

    /// Stamp the stream and its waveform with a new revision
    pub(crate) fn stamp(&mut self, revision: u64) {
        self.revision = revision;
        if let Some(w) = self.waveform.as_mut() {
            w.header_mut().revision = revision;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::UniformWaveform;

    #[test]
    fn test_replacing_waveform() {
        let mut s = Stream::analog("CH1", Unit::Volts);
        assert!(!s.has_data());
        let mut w = UniformWaveform::from_samples(vec![1.0f32], 1);
        w.header.revision = 4;
        s.set_waveform(Some(w.into()));
        assert_eq!(s.revision(), Some(4));

        s.set_waveform(Some(UniformWaveform::from_samples(vec![2.0f32, 3.0], 1).into()));
        assert_eq!(s.waveform().unwrap().len(), 2);
        s.clear();
        assert!(s.waveform().is_none());
        assert_eq!(s.revision(), None);
    }

    #[test]
    fn test_scalar_revision() {
        let mut s = Stream::scalar("rms", Unit::Volts);
        s.set_value(Some(0.5));
        s.stamp(9);
        assert_eq!(s.revision(), Some(9));
    }

    #[test]
    fn test_flags() {
        let s = Stream::analog("x", Unit::Volts).with_flags(StreamFlags::DO_NOT_INTERPOLATE);
        assert!(s.flags.contains(StreamFlags::DO_NOT_INTERPOLATE));
        assert!(!StreamFlags::default().contains(StreamFlags::DO_NOT_INTERPOLATE));
    }
}
