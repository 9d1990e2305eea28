//! Protocol waveforms: sparse sequences of decoded symbols.
//!
//! Color and text rendering are delegated to the symbol type, so a decoder
//! only defines its symbol enum and implements [`ProtocolSymbol`].

use super::WaveformHeader;
use crate::buffer::AcceleratedBuffer;
use crate::compute::ComputeDevice;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Palette shared by protocol decoders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardColor {
    Idle,
    Control,
    Address,
    Preamble,
    Data,
    Status,
    ChecksumOk,
    ChecksumBad,
    Error,
}

impl StandardColor {
    /// Display color as `#rrggbb`
    pub fn hex(&self) -> &'static str {
        match self {
            StandardColor::Idle => "#404040",
            StandardColor::Control => "#c000a0",
            StandardColor::Address => "#ffff00",
            StandardColor::Preamble => "#808080",
            StandardColor::Data => "#336699",
            StandardColor::Status => "#00ffff",
            StandardColor::ChecksumOk => "#00ff00",
            StandardColor::ChecksumBad => "#ff0000",
            StandardColor::Error => "#ff0000",
        }
    }
}

/// One decoded symbol
pub trait ProtocolSymbol: Clone + Debug + Send + Sync + 'static {
    fn color(&self) -> StandardColor;
    fn text(&self) -> String;
}

/// Type-erased protocol waveform
pub trait AnyProtocolWaveform: Debug + Send + Sync {
    fn header(&self) -> &WaveformHeader;
    fn header_mut(&mut self) -> &mut WaveformHeader;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn offset(&self, i: usize) -> i64;
    fn duration(&self, i: usize) -> i64;
    fn color(&self, i: usize) -> StandardColor;
    fn text(&self, i: usize) -> String;
    fn prepare_for_cpu_access(&mut self) -> Result<()>;
    fn prepare_for_gpu_access(&mut self, device: &Arc<ComputeDevice>) -> Result<()>;
    fn clone_box(&self) -> Result<Box<dyn AnyProtocolWaveform>>;
    fn as_any(&self) -> &dyn Any;
}

impl<'a> dyn AnyProtocolWaveform + 'a {
    pub fn downcast_ref<S: ProtocolSymbol>(&self) -> Option<&ProtocolWaveform<S>> {
        self.as_any().downcast_ref::<ProtocolWaveform<S>>()
    }
}

#[derive(Debug)]
pub struct ProtocolWaveform<S: ProtocolSymbol> {
    pub header: WaveformHeader,
    pub offsets: AcceleratedBuffer<i64>,
    pub durations: AcceleratedBuffer<i64>,
    pub symbols: Vec<S>,
}

impl<S: ProtocolSymbol> ProtocolWaveform<S> {
    pub fn new(timescale: i64) -> Self {
        Self {
            header: WaveformHeader::with_timescale(timescale),
            offsets: AcceleratedBuffer::new(),
            durations: AcceleratedBuffer::new(),
            symbols: Vec::new(),
        }
    }

    pub fn push(&mut self, offset: i64, duration: i64, symbol: S) {
        self.offsets.push(offset);
        self.durations.push(duration);
        self.symbols.push(symbol);
    }

    pub fn symbol(&self, i: usize) -> &S {
        &self.symbols[i]
    }

    /// Extend the last symbol so it ends at `end` (in offset units)
    pub fn extend_last_to(&mut self, end: i64) {
        if let Some(last) = self.symbols.len().checked_sub(1) {
            self.durations[last] = (end - self.offsets[last]).max(1);
        }
    }

    pub fn offset_scaled(&self, i: usize) -> i64 {
        self.offsets[i] * self.header.timescale + self.header.trigger_phase
    }

    pub fn mark_modified_from_cpu(&mut self) {
        self.offsets.mark_modified_from_cpu();
        self.durations.mark_modified_from_cpu();
    }
}

impl<S: ProtocolSymbol> AnyProtocolWaveform for ProtocolWaveform<S> {
    fn header(&self) -> &WaveformHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WaveformHeader {
        &mut self.header
    }

    fn len(&self) -> usize {
        self.symbols.len()
    }

    fn offset(&self, i: usize) -> i64 {
        self.offsets[i]
    }

    fn duration(&self, i: usize) -> i64 {
        self.durations[i]
    }

    fn color(&self, i: usize) -> StandardColor {
        self.symbols[i].color()
    }

    fn text(&self, i: usize) -> String {
        self.symbols[i].text()
    }

    fn prepare_for_cpu_access(&mut self) -> Result<()> {
        self.offsets.prepare_for_cpu_access()?;
        self.durations.prepare_for_cpu_access()
    }

    fn prepare_for_gpu_access(&mut self, device: &Arc<ComputeDevice>) -> Result<()> {
        self.offsets.prepare_for_gpu_access(device)?;
        self.durations.prepare_for_gpu_access(device)
    }

    fn clone_box(&self) -> Result<Box<dyn AnyProtocolWaveform>> {
        Ok(Box::new(ProtocolWaveform {
            header: self.header.clone(),
            offsets: self.offsets.try_clone()?,
            durations: self.durations.try_clone()?,
            symbols: self.symbols.clone(),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::Waveform;

    #[derive(Debug, Clone, PartialEq)]
    enum Bit {
        Start,
        Value(u8),
    }

    impl ProtocolSymbol for Bit {
        fn color(&self) -> StandardColor {
            match self {
                Bit::Start => StandardColor::Preamble,
                Bit::Value(_) => StandardColor::Data,
            }
        }

        fn text(&self) -> String {
            match self {
                Bit::Start => "START".to_string(),
                Bit::Value(v) => format!("{:02x}", v),
            }
        }
    }

    #[test]
    fn test_dispatch_to_symbol_type() {
        let mut w = ProtocolWaveform::new(1000);
        w.push(0, 5, Bit::Start);
        w.push(5, 10, Bit::Value(0x3c));
        w.extend_last_to(20);

        let wave = Waveform::from(w);
        let p = wave.protocol().unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.text(1), "3c");
        assert_eq!(p.color(0), StandardColor::Preamble);
        assert_eq!(p.duration(1), 15);
        assert_eq!(wave.offset_scaled(1), 5000);

        let typed = p.downcast_ref::<Bit>().unwrap();
        assert_eq!(typed.symbol(0), &Bit::Start);
    }

    #[test]
    fn test_clone_box_is_deep() {
        let mut w = ProtocolWaveform::new(1);
        w.push(0, 1, Bit::Value(1));
        let copy = w.clone_box().unwrap();
        w.symbols[0] = Bit::Value(2);
        assert_eq!(copy.text(0), "01");
    }
}
