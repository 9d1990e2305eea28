//! TMDS (DVI / HDMI) lane decoder.
//!
//! The data lane is sampled on every clock transition, giving one bit per
//! edge in transmission order. A 10-bit word's bit `j` is the `j`th bit on
//! the wire, so the constants below read the same as the symbol tables in
//! the DVI 1.0 standard (`q9` is the most significant bit).
//!
//! Word alignment is found by trying all ten phases and keeping the one that
//! lines up the most control codes.

use crate::error::{Result, ScopeError};
use crate::graph::{is_digital_waveform, Filter, FilterParameter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::edges::{find_edges, sample_on_edges, EdgeKind};
use crate::waveform::{DigitalView, ProtocolSymbol, ProtocolWaveform, StandardColor};

pub const NAME: &str = "TMDS";

pub const PARAM_LANE: &str = "Lane";

const WORD_BITS: usize = 10;

/// Control words for C1:C0 = 00, 01, 10, 11
const CONTROL_CODES: [u16; 4] = [0x354, 0x0ab, 0x154, 0x2ab];

/// Video leading guard band, lanes 0 and 2
const GUARD_LANE_0_2: u16 = 0x2cc;
/// Video leading guard band, lane 1
const GUARD_LANE_1: u16 = 0x133;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmdsSymbol {
    /// Control period word carrying C1:C0
    Control(u8),
    Guard,
    Data(u8),
    Error,
}

impl ProtocolSymbol for TmdsSymbol {
    fn color(&self) -> StandardColor {
        match self {
            TmdsSymbol::Control(_) => StandardColor::Control,
            TmdsSymbol::Guard => StandardColor::Preamble,
            TmdsSymbol::Data(_) => StandardColor::Data,
            TmdsSymbol::Error => StandardColor::Error,
        }
    }

    fn text(&self) -> String {
        match self {
            TmdsSymbol::Control(c) => format!("CTL{}", c),
            TmdsSymbol::Guard => "GB".to_string(),
            TmdsSymbol::Data(d) => format!("{:02x}", d),
            TmdsSymbol::Error => "ERROR".to_string(),
        }
    }
}

fn guard_band(lane: i64) -> u16 {
    if lane == 1 {
        GUARD_LANE_1
    } else {
        GUARD_LANE_0_2
    }
}

fn word_at(bits: &[bool], start: usize) -> u16 {
    bits[start..start + WORD_BITS]
        .iter()
        .enumerate()
        .fold(0u16, |w, (j, &b)| w | (u16::from(b) << j))
}

fn control_index(word: u16) -> Option<u8> {
    CONTROL_CODES.iter().position(|&c| c == word).map(|i| i as u8)
}

/// Whether the transition-minimizing encoder picks XNOR for `byte`
fn uses_xnor(byte: u8) -> bool {
    let ones = byte.count_ones();
    ones > 4 || (ones == 4 && byte & 1 == 0)
}

/// Decode a data-period word, or `None` if no valid encoder output matches
pub fn decode_data_word(word: u16) -> Option<u8> {
    let mut q = (word & 0xff) as u8;
    if word & 0x200 != 0 {
        q = !q;
    }
    let xor = word & 0x100 != 0;
    let mut d = q & 1;
    for i in 1..8 {
        let bit = ((q >> i) ^ (q >> (i - 1))) & 1;
        let bit = if xor { bit } else { bit ^ 1 };
        d |= bit << i;
    }
    (uses_xnor(d) != xor).then_some(d)
}

/// Phase (0..10) that aligns the most control codes
pub fn find_word_phase(bits: &[bool]) -> usize {
    (0..WORD_BITS)
        .max_by_key(|&phase| {
            let hits = (phase..)
                .step_by(WORD_BITS)
                .take_while(|&i| i + WORD_BITS <= bits.len())
                .filter(|&i| control_index(word_at(bits, i)).is_some())
                .count();
            // Ties go to the earliest phase
            (hits, std::cmp::Reverse(phase))
        })
        .unwrap_or(0)
}

/// Decode a lane. `data` is sampled on every transition of `clk`.
pub fn decode(data: DigitalView<'_>, clk: DigitalView<'_>, lane: i64) -> ProtocolWaveform<TmdsSymbol> {
    let edges = find_edges(clk, EdgeKind::Both);
    let sampled = sample_on_edges(data, &edges);

    let mut out = ProtocolWaveform::new(1);
    out.header.copy_timebase_from(data.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;

    let bits = sampled.samples.as_slice();
    let times = sampled.offsets.as_slice();
    if bits.len() < WORD_BITS {
        return out;
    }
    let guard = guard_band(lane);
    let phase = find_word_phase(bits);

    let mut i = phase;
    while i + WORD_BITS <= bits.len() {
        let word = word_at(bits, i);
        let after_control = matches!(
            out.symbols.last(),
            Some(TmdsSymbol::Control(_)) | Some(TmdsSymbol::Guard)
        );
        let symbol = if let Some(c) = control_index(word) {
            TmdsSymbol::Control(c)
        } else if word == guard && after_control {
            TmdsSymbol::Guard
        } else {
            decode_data_word(word).map_or(TmdsSymbol::Error, TmdsSymbol::Data)
        };

        let start = times[i];
        let end = times
            .get(i + WORD_BITS)
            .copied()
            .unwrap_or_else(|| times[i + WORD_BITS - 1] + sampled.durations[i + WORD_BITS - 1]);
        out.push(start, (end - start).max(1), symbol);
        i += WORD_BITS;
    }
    out.mark_modified_from_cpu();
    out
}

#[derive(Debug)]
pub struct TmdsDecoder {
    core: NodeCore,
}

impl TmdsDecoder {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("data");
        core.create_input("clk");
        core.add_stream(Stream::protocol("data"));
        core.parameters_mut().insert(PARAM_LANE, FilterParameter::int(0, Unit::Unitless));
        Self { core }
    }
}

impl Filter for TmdsDecoder {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i < 2 && is_digital_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let lane = self.core.parameters().int(PARAM_LANE);
        if !(0..=2).contains(&lane) {
            return Err(ScopeError::InvalidParameter(format!("TMDS lane must be 0-2, got {}", lane)));
        }
        let data = ctx.digital_input(0)?;
        let clk = ctx.digital_input(1)?;
        let out = decode(data, clk, lane);
        tracing::debug!("{} decoded {} TMDS words on lane {}", self.core.id(), out.symbols.len(), lane);
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}
