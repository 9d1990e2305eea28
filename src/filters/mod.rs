//! Built-in filter catalog.
//!
//! Each filter lives in its own module and exposes a `NAME` constant used
//! both as its class name and as its key in the [`FilterRegistry`].
//!
//! | Class | Module |
//! |---|---|
//! | `AC RMS` | [`ac_rms`] |
//! | `Peak` | [`peak`] |
//! | `Bandwidth` | [`bandwidth`] |
//! | `Trend` | [`trend`] |
//! | `Window` | [`window`] |
//! | `FFT` | [`fft`] |
//! | `Group Delay` | [`group_delay`] |
//! | `Vector Frequency` | [`vector_frequency`] |
//! | `Emphasis` | [`emphasis`] |
//! | `Tone` | [`tone`] |
//! | `SPI` | [`spi`] |
//! | `TMDS` | [`tmds`] |
//! | `CAN` | [`can`] |
//! | `Touchstone Import` | [`touchstone`] |
//! | `Reference Plane Extension` | [`reference_plane`] |
//! | `PcapNG Export` | [`pcapng`] |

pub mod ac_rms;
pub mod bandwidth;
pub mod can;
pub mod emphasis;
pub mod fft;
pub mod group_delay;
pub mod pcapng;
pub mod peak;
pub mod reference_plane;
pub mod spi;
pub mod tmds;
pub mod tone;
pub mod touchstone;
pub mod trend;
pub mod vector_frequency;
pub mod window;

pub use ac_rms::AcRmsFilter;
pub use bandwidth::BandwidthFilter;
pub use can::{CanDecoder, CanSymbol};
pub use emphasis::{EmphasisFilter, EmphasisType};
pub use fft::{FftFilter, WindowFunction};
pub use group_delay::GroupDelayFilter;
pub use pcapng::{EthernetSymbol, PcapNgExportFilter};
pub use peak::PeakFilter;
pub use reference_plane::ReferencePlaneFilter;
pub use spi::{SpiDecoder, SpiSymbol};
pub use tmds::{TmdsDecoder, TmdsSymbol};
pub use tone::ToneFilter;
pub use touchstone::TouchstoneImportFilter;
pub use trend::TrendFilter;
pub use vector_frequency::VectorFrequencyFilter;
pub use window::WindowFilter;

use crate::graph::FilterRegistry;

/// Register every built-in filter with `registry`
pub fn register_builtins(registry: &mut FilterRegistry) {
    registry.register(ac_rms::NAME, |color| Box::new(AcRmsFilter::new(color)));
    registry.register(peak::NAME, |color| Box::new(PeakFilter::new(color)));
    registry.register(bandwidth::NAME, |color| Box::new(BandwidthFilter::new(color)));
    registry.register(trend::NAME, |color| Box::new(TrendFilter::new(color)));
    registry.register(window::NAME, |color| Box::new(WindowFilter::new(color)));
    registry.register(fft::NAME, |color| Box::new(FftFilter::new(color)));
    registry.register(group_delay::NAME, |color| Box::new(GroupDelayFilter::new(color)));
    registry.register(vector_frequency::NAME, |color| {
        Box::new(VectorFrequencyFilter::new(color))
    });
    registry.register(emphasis::NAME, |color| Box::new(EmphasisFilter::new(color)));
    registry.register(tone::NAME, |color| Box::new(ToneFilter::new(color)));
    registry.register(spi::NAME, |color| Box::new(SpiDecoder::new(color)));
    registry.register(tmds::NAME, |color| Box::new(TmdsDecoder::new(color)));
    registry.register(can::NAME, |color| Box::new(CanDecoder::new(color)));
    registry.register(touchstone::NAME, |color| {
        Box::new(TouchstoneImportFilter::new(color))
    });
    registry.register(reference_plane::NAME, |color| {
        Box::new(ReferencePlaneFilter::new(color))
    });
    registry.register(pcapng::NAME, |color| Box::new(PcapNgExportFilter::new(color)));
    tracing::debug!("Registered built-in filters");
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Run a filter outside a graph.

    use crate::compute::{CommandBuffer, ComputeContext};
    use crate::error::Result;
    use crate::graph::{Filter, RefreshContext, Stream, StreamType};
    use crate::units::Unit;
    use crate::waveform::{UniformWaveform, Waveform};

    /// Refresh `filter` with `inputs` wired in slot order, on the CPU path
    pub fn refresh(filter: &mut dyn Filter, inputs: &[&Stream]) -> Result<()> {
        refresh_on(filter, inputs, &ComputeContext::cpu_only())
    }

    pub fn refresh_on(filter: &mut dyn Filter, inputs: &[&Stream], compute: &ComputeContext) -> Result<()> {
        let names = filter
            .core()
            .inputs()
            .iter()
            .map(|slot| slot.name.clone())
            .collect();
        let mut cmd = CommandBuffer::new();
        let mut ctx = RefreshContext::new(inputs.iter().map(|s| Some(*s)).collect(), names, compute, &mut cmd);
        filter.refresh(&mut ctx)
    }

    pub fn analog_stream(samples: Vec<f32>, timescale: i64) -> Stream {
        let mut s = Stream::analog("in", Unit::Volts);
        s.set_waveform(Some(UniformWaveform::from_samples(samples, timescale).into()));
        s
    }

    pub fn digital_stream(samples: Vec<bool>, timescale: i64) -> Stream {
        let mut s = Stream::digital("in");
        s.set_waveform(Some(UniformWaveform::from_samples(samples, timescale).into()));
        s
    }

    pub fn spectrum_stream(waveform: Waveform, y_unit: Unit) -> Stream {
        let mut s = Stream::new("spectrum", StreamType::Analog, Unit::Hertz, y_unit);
        s.set_waveform(Some(waveform));
        s
    }
}
