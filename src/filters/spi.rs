//! SPI decoder (mode 0: data sampled on rising SCK while CS# is low).

use crate::error::Result;
use crate::graph::{is_digital_waveform, Filter, FilterParameter, NodeCore, RefreshContext, Stream};
use crate::waveform::edges::{find_edges, EdgeKind};
use crate::waveform::{DigitalView, ProtocolSymbol, ProtocolWaveform, StandardColor};

pub const NAME: &str = "SPI";

pub const PARAM_BIT_ORDER: &str = "Bit Order";

const MSB_FIRST: i64 = 0;
const LSB_FIRST: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiSymbol {
    Select,
    Deselect,
    Data(u8),
}

impl ProtocolSymbol for SpiSymbol {
    fn color(&self) -> StandardColor {
        match self {
            SpiSymbol::Select | SpiSymbol::Deselect => StandardColor::Control,
            SpiSymbol::Data(_) => StandardColor::Data,
        }
    }

    fn text(&self) -> String {
        match self {
            SpiSymbol::Select => "SELECT".to_string(),
            SpiSymbol::Deselect => "DESELECT".to_string(),
            SpiSymbol::Data(b) => format!("{:02x}", b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Event {
    /// CS# edge; `true` when the bus becomes selected
    ChipSelect(bool),
    Clock,
}

/// Decode one capture. All positions are femtoseconds.
pub fn decode(clk: DigitalView<'_>, cs: DigitalView<'_>, data: DigitalView<'_>, msb_first: bool) -> ProtocolWaveform<SpiSymbol> {
    let mut out = ProtocolWaveform::new(1);
    out.header.copy_timebase_from(clk.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;
    if clk.is_empty() || cs.is_empty() {
        return out;
    }

    let mut events: Vec<(i64, Event)> = find_edges(cs, EdgeKind::Both)
        .into_iter()
        .filter_map(|t| cs.value_at(t).map(|level| (t, Event::ChipSelect(!level))))
        .collect();
    events.extend(find_edges(clk, EdgeKind::Rising).into_iter().map(|t| (t, Event::Clock)));
    events.sort();

    let mut selected = !cs.value(0);
    if selected {
        out.push(cs.offset_scaled(0), 1, SpiSymbol::Select);
    }
    let mut byte = 0u8;
    let mut bits = 0u32;
    let mut byte_start = 0i64;

    for (t, event) in events {
        match event {
            Event::ChipSelect(now_selected) => {
                if now_selected == selected {
                    continue;
                }
                out.extend_last_to(t);
                selected = now_selected;
                bits = 0;
                byte = 0;
                let symbol = if selected { SpiSymbol::Select } else { SpiSymbol::Deselect };
                out.push(t, 1, symbol);
            }
            Event::Clock if selected => {
                let Some(bit) = data.value_at(t) else { continue };
                if bits == 0 {
                    byte_start = t;
                }
                if msb_first {
                    byte = (byte << 1) | u8::from(bit);
                } else {
                    byte |= u8::from(bit) << bits;
                }
                bits += 1;
                if bits == 8 {
                    out.extend_last_to(byte_start);
                    out.push(byte_start, (t - byte_start).max(1), SpiSymbol::Data(byte));
                    bits = 0;
                    byte = 0;
                }
            }
            Event::Clock => {}
        }
    }
    out.mark_modified_from_cpu();
    out
}

#[derive(Debug)]
pub struct SpiDecoder {
    core: NodeCore,
}

impl SpiDecoder {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("clk");
        core.create_input("cs");
        core.create_input("data");
        core.add_stream(Stream::protocol("data"));
        core.parameters_mut().insert(
            PARAM_BIT_ORDER,
            FilterParameter::enumeration(&[("MSB first", MSB_FIRST), ("LSB first", LSB_FIRST)], MSB_FIRST),
        );
        Self { core }
    }
}

impl Filter for SpiDecoder {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i < 3 && is_digital_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let clk = ctx.digital_input(0)?;
        let cs = ctx.digital_input(1)?;
        let data = ctx.digital_input(2)?;
        let msb_first = self.core.parameters().int(PARAM_BIT_ORDER) == MSB_FIRST;
        let out = decode(clk, cs, data, msb_first);
        tracing::debug!("{} decoded {} SPI symbols", self.core.id(), out.symbols.len());
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}
