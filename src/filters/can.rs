//! Classical CAN 2.0A/B frame decoder.
//!
//! The bus idles recessive (high). A frame starts at the first dominant edge
//! after idle; each bit is sampled at its center and the bit clock is
//! resynchronized on every transition. From SOF through the CRC sequence a
//! stuff bit of opposite polarity follows every five identical bits.

use crate::error::{Result, ScopeError};
use crate::graph::{is_digital_waveform, Filter, FilterParameter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::edges::{find_edges, EdgeKind};
use crate::waveform::{DigitalView, ProtocolSymbol, ProtocolWaveform, StandardColor, FS_PER_SECOND};

pub const NAME: &str = "CAN";

pub const PARAM_BIT_RATE: &str = "Bit Rate";

const CRC15_POLY: u16 = 0x4599;
const STUFF_RUN: u32 = 5;
const EOF_BITS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanSymbol {
    Sof,
    Id { id: u32, extended: bool },
    /// Remote transmission request bit; `true` for a remote frame
    Rtr(bool),
    /// Reserved bit, expected dominant
    R0(bool),
    Dlc(u8),
    Data(u8),
    Crc { value: u16, ok: bool },
    CrcDelim(bool),
    /// `true` when some receiver drove the ACK slot dominant
    Ack(bool),
    AckDelim(bool),
    /// `true` when all seven EOF bits were recessive
    Eof(bool),
    StuffError,
}

impl ProtocolSymbol for CanSymbol {
    fn color(&self) -> StandardColor {
        match *self {
            CanSymbol::Sof => StandardColor::Preamble,
            CanSymbol::Id { .. } => StandardColor::Address,
            CanSymbol::Rtr(_) => StandardColor::Control,
            CanSymbol::R0(recessive) => {
                if recessive {
                    StandardColor::Error
                } else {
                    StandardColor::Control
                }
            }
            CanSymbol::Dlc(n) => {
                if n <= 8 {
                    StandardColor::Control
                } else {
                    StandardColor::Error
                }
            }
            CanSymbol::Data(_) => StandardColor::Data,
            CanSymbol::Crc { ok: true, .. } => StandardColor::ChecksumOk,
            CanSymbol::Crc { ok: false, .. } => StandardColor::ChecksumBad,
            CanSymbol::Ack(true) => StandardColor::Status,
            CanSymbol::Ack(false) => StandardColor::Error,
            CanSymbol::CrcDelim(level) | CanSymbol::AckDelim(level) | CanSymbol::Eof(level) => {
                if level {
                    StandardColor::Preamble
                } else {
                    StandardColor::Error
                }
            }
            CanSymbol::StuffError => StandardColor::Error,
        }
    }

    fn text(&self) -> String {
        match *self {
            CanSymbol::Sof => "SOF".to_string(),
            CanSymbol::Id { id, extended: false } => format!("ID {:03x}", id),
            CanSymbol::Id { id, extended: true } => format!("ID {:08x}", id),
            CanSymbol::Rtr(true) => "REQ".to_string(),
            CanSymbol::Rtr(false) => "DATA".to_string(),
            CanSymbol::R0(_) => "r0".to_string(),
            CanSymbol::Dlc(n) => format!("Len {}", n),
            CanSymbol::Data(b) => format!("{:02x}", b),
            CanSymbol::Crc { value, ok: true } => format!("CRC {:04x}", value),
            CanSymbol::Crc { value, ok: false } => format!("CRC {:04x} BAD", value),
            CanSymbol::CrcDelim(_) => "CRC DELIM".to_string(),
            CanSymbol::Ack(true) => "ACK".to_string(),
            CanSymbol::Ack(false) => "NAK".to_string(),
            CanSymbol::AckDelim(_) => "ACK DELIM".to_string(),
            CanSymbol::Eof(_) => "EOF".to_string(),
            CanSymbol::StuffError => "STUFF ERROR".to_string(),
        }
    }
}

/// CRC-15/CAN over destuffed bits, SOF through the last data bit
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc15(u16);

impl Crc15 {
    pub fn update(&mut self, bit: bool) {
        let next = bit ^ ((self.0 >> 14) & 1 == 1);
        self.0 = (self.0 << 1) & 0x7fff;
        if next {
            self.0 ^= CRC15_POLY;
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Bit {
    start: i64,
    end: i64,
    level: bool,
}

/// Why a frame stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameEnd {
    /// Capture ended mid-frame
    Truncated,
    StuffError { at: i64, end: i64 },
}

/// Bit clock recovery over a digital capture
struct BitReader<'a> {
    view: DigitalView<'a>,
    edges: &'a [i64],
    next_edge: usize,
    bit_fs: i64,
    bit_start: i64,
}

impl<'a> BitReader<'a> {
    fn next_bit(&mut self) -> std::result::Result<Bit, FrameEnd> {
        let sample_at = self.bit_start + self.bit_fs / 2;
        let level = self.view.value_at(sample_at).ok_or(FrameEnd::Truncated)?;
        while self.edges.get(self.next_edge).is_some_and(|&e| e <= sample_at) {
            self.next_edge += 1;
        }
        let nominal = self.bit_start + self.bit_fs;
        // Resync on a transition within half a bit of the nominal boundary
        let end = match self.edges.get(self.next_edge) {
            Some(&e) if e < nominal + self.bit_fs / 2 => e,
            _ => nominal,
        };
        let bit = Bit {
            start: self.bit_start,
            end,
            level,
        };
        self.bit_start = end;
        Ok(bit)
    }
}

/// Field reader with destuffing and CRC accumulation
struct FrameReader<'a> {
    bits: BitReader<'a>,
    run_level: bool,
    run_len: u32,
    crc: Crc15,
    crc_active: bool,
}

impl<'a> FrameReader<'a> {
    fn stuffed_bit(&mut self) -> std::result::Result<Bit, FrameEnd> {
        if self.run_len == STUFF_RUN {
            let stuff = self.bits.next_bit()?;
            if stuff.level == self.run_level {
                return Err(FrameEnd::StuffError {
                    at: stuff.start,
                    end: stuff.end,
                });
            }
            self.run_level = stuff.level;
            self.run_len = 1;
        }
        let bit = self.bits.next_bit()?;
        if bit.level == self.run_level {
            self.run_len += 1;
        } else {
            self.run_level = bit.level;
            self.run_len = 1;
        }
        if self.crc_active {
            self.crc.update(bit.level);
        }
        Ok(bit)
    }

    /// `n` stuffed bits, MSB first: (start, end, value)
    fn field(&mut self, n: usize) -> std::result::Result<(i64, i64, u32), FrameEnd> {
        let first = self.stuffed_bit()?;
        let mut value = u32::from(first.level);
        let mut end = first.end;
        for _ in 1..n {
            let b = self.stuffed_bit()?;
            value = (value << 1) | u32::from(b.level);
            end = b.end;
        }
        Ok((first.start, end, value))
    }

    /// Consume the stuff bit owed after the last stuffed field, if any
    fn finish_stuffing(&mut self) -> std::result::Result<(), FrameEnd> {
        if self.run_len == STUFF_RUN {
            let stuff = self.bits.next_bit()?;
            if stuff.level == self.run_level {
                return Err(FrameEnd::StuffError {
                    at: stuff.start,
                    end: stuff.end,
                });
            }
        }
        Ok(())
    }

    /// One bit outside the stuffed region
    fn fixed_bit(&mut self) -> std::result::Result<Bit, FrameEnd> {
        self.bits.next_bit()
    }
}

/// Decode one frame starting at the SOF edge. Returns where the frame ended.
fn decode_frame(
    out: &mut ProtocolWaveform<CanSymbol>,
    view: DigitalView<'_>,
    edges: &[i64],
    first_edge: usize,
    bit_fs: i64,
) -> std::result::Result<i64, FrameEnd> {
    let mut r = FrameReader {
        bits: BitReader {
            view,
            edges,
            next_edge: first_edge,
            bit_fs,
            bit_start: edges[first_edge],
        },
        run_level: true,
        run_len: 0,
        crc: Crc15::default(),
        crc_active: true,
    };

    let sof = r.stuffed_bit()?;
    out.push(sof.start, sof.end - sof.start, CanSymbol::Sof);

    let (id_start, id_end, base_id) = r.field(11)?;
    let (rtr_start, rtr_end, rtr_or_srr) = r.field(1)?;
    let (ide_start, _, ide) = r.field(1)?;

    let (rtr, r0_start, r0_end, r0) = if ide == 1 {
        let (_, ext_end, ext) = r.field(18)?;
        out.push(
            id_start,
            ext_end - id_start,
            CanSymbol::Id {
                id: (base_id << 18) | ext,
                extended: true,
            },
        );
        let (s, e, v) = r.field(1)?;
        out.push(s, e - s, CanSymbol::Rtr(v == 1));
        // r1 and r0 shown as one reserved field
        let (rs, re, reserved) = r.field(2)?;
        (v == 1, rs, re, reserved != 0)
    } else {
        out.push(
            id_start,
            id_end - id_start,
            CanSymbol::Id {
                id: base_id,
                extended: false,
            },
        );
        out.push(rtr_start, rtr_end - rtr_start, CanSymbol::Rtr(rtr_or_srr == 1));
        // IDE is folded into the reserved field for base frames
        let (_, e, v) = r.field(1)?;
        (rtr_or_srr == 1, ide_start, e, v == 1)
    };
    out.push(r0_start, r0_end - r0_start, CanSymbol::R0(r0));

    let (s, e, dlc) = r.field(4)?;
    out.push(s, e - s, CanSymbol::Dlc(dlc as u8));

    if !rtr {
        for _ in 0..dlc.min(8) {
            let (s, e, byte) = r.field(8)?;
            out.push(s, e - s, CanSymbol::Data(byte as u8));
        }
    }

    let expected = r.crc.value();
    r.crc_active = false;
    let (s, e, crc) = r.field(15)?;
    r.finish_stuffing()?;
    out.push(s, e - s, CanSymbol::Crc {
        value: crc as u16,
        ok: crc as u16 == expected,
    });

    let delim = r.fixed_bit()?;
    out.push(delim.start, delim.end - delim.start, CanSymbol::CrcDelim(delim.level));
    let ack = r.fixed_bit()?;
    out.push(ack.start, ack.end - ack.start, CanSymbol::Ack(!ack.level));
    let delim = r.fixed_bit()?;
    out.push(delim.start, delim.end - delim.start, CanSymbol::AckDelim(delim.level));

    let first = r.fixed_bit()?;
    let mut eof_ok = first.level;
    let mut end = first.end;
    for _ in 1..EOF_BITS {
        let b = r.fixed_bit()?;
        eof_ok &= b.level;
        end = b.end;
    }
    out.push(first.start, end - first.start, CanSymbol::Eof(eof_ok));
    Ok(end)
}

/// Decode every frame in `view` at `bit_rate` bits per second
pub fn decode(view: DigitalView<'_>, bit_rate: f64) -> Result<ProtocolWaveform<CanSymbol>> {
    if bit_rate.is_nan() || bit_rate <= 0.0 {
        return Err(ScopeError::InvalidParameter(format!("bit rate must be positive, got {}", bit_rate)));
    }
    let bit_fs = (FS_PER_SECOND as f64 / bit_rate).round() as i64;
    let per_sample = view.duration_scaled(0).max(1);
    if bit_fs < 2 * per_sample {
        return Err(ScopeError::InvalidInput(format!(
            "bit time of {} fs is under two samples",
            bit_fs
        )));
    }

    let mut out = ProtocolWaveform::new(1);
    out.header.copy_timebase_from(view.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;

    let edges = find_edges(view, EdgeKind::Both);
    let mut idx = 0;
    while idx < edges.len() {
        // SOF is a recessive-to-dominant transition
        if view.value_at(edges[idx]) != Some(false) {
            idx += 1;
            continue;
        }
        match decode_frame(&mut out, view, &edges, idx, bit_fs) {
            Ok(end) => idx = edges.partition_point(|&e| e < end),
            Err(FrameEnd::StuffError { at, end }) => {
                out.push(at, end - at, CanSymbol::StuffError);
                idx = edges.partition_point(|&e| e < end);
            }
            Err(FrameEnd::Truncated) => break,
        }
    }
    out.mark_modified_from_cpu();
    Ok(out)
}

#[derive(Debug)]
pub struct CanDecoder {
    core: NodeCore,
}

impl CanDecoder {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::protocol("data"));
        core.parameters_mut()
            .insert(PARAM_BIT_RATE, FilterParameter::float(500_000.0, Unit::BitsPerSecond));
        Self { core }
    }
}

impl Filter for CanDecoder {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_digital_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let view = ctx.digital_input(0)?;
        let out = decode(view, self.core.parameters().float(PARAM_BIT_RATE))?;
        tracing::debug!("{} decoded {} CAN symbols", self.core.id(), out.symbols.len());
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;

    const SAMPLES_PER_BIT: usize = 10;
    /// 500 kbit/s at 10 samples per bit
    const TIMESCALE: i64 = 200_000_000;

    fn push_bits(bits: &mut Vec<bool>, value: u32, n: usize) {
        for k in (0..n).rev() {
            bits.push((value >> k) & 1 == 1);
        }
    }

    fn crc(bits: &[bool]) -> u16 {
        let mut c = Crc15::default();
        bits.iter().for_each(|&b| c.update(b));
        c.value()
    }

    fn stuff(bits: &[bool]) -> Vec<bool> {
        let mut out = Vec::new();
        let (mut level, mut run) = (true, 0);
        for &b in bits {
            if run == 5 {
                out.push(!level);
                level = !level;
                run = 1;
            }
            out.push(b);
            if b == level {
                run += 1;
            } else {
                level = b;
                run = 1;
            }
        }
        if run == 5 {
            out.push(!level);
        }
        out
    }

    /// Bus levels for one frame surrounded by idle
    fn frame(id: u32, extended: bool, data: &[u8], corrupt_crc: bool) -> Vec<bool> {
        let mut bits = vec![false];
        if extended {
            push_bits(&mut bits, id >> 18, 11);
            bits.extend([true, true]);
            push_bits(&mut bits, id & 0x3ffff, 18);
            bits.extend([false, false, false]);
        } else {
            push_bits(&mut bits, id, 11);
            bits.extend([false, false, false]);
        }
        push_bits(&mut bits, data.len() as u32, 4);
        for &b in data {
            push_bits(&mut bits, u32::from(b), 8);
        }
        let mut c = crc(&bits);
        if corrupt_crc {
            c ^= 1;
        }
        push_bits(&mut bits, u32::from(c), 15);

        let mut bus = vec![true; 11];
        bus.extend(stuff(&bits));
        bus.extend([true, false, true]);
        bus.extend([true; EOF_BITS]);
        bus.extend([true; 3]);
        bus.into_iter()
            .flat_map(|b| std::iter::repeat(b).take(SAMPLES_PER_BIT))
            .collect()
    }

    fn run(samples: Vec<bool>) -> Vec<CanSymbol> {
        let mut f = CanDecoder::new("#ffffff");
        let input = test_support::digital_stream(samples, TIMESCALE);
        test_support::refresh(&mut f, &[&input]).unwrap();
        let w = f.core().stream(0).unwrap().waveform().unwrap();
        w.protocol().unwrap().downcast_ref::<CanSymbol>().unwrap().symbols.clone()
    }

    #[test]
    fn test_crc15_check_value() {
        // CRC-15/CAN of ASCII "123456789"
        let mut c = Crc15::default();
        for byte in b"123456789" {
            for k in (0..8).rev() {
                c.update((byte >> k) & 1 == 1);
            }
        }
        assert_eq!(c.value(), 0x059e);
    }

    #[test]
    fn test_base_frame() {
        let symbols = run(frame(0x123, false, &[0xde, 0xad], false));
        let crc_ok = symbols
            .iter()
            .any(|s| matches!(s, CanSymbol::Crc { ok: true, .. }));
        assert!(crc_ok, "{:?}", symbols);
        assert_eq!(symbols[0], CanSymbol::Sof);
        assert_eq!(symbols[1], CanSymbol::Id { id: 0x123, extended: false });
        assert_eq!(symbols[2], CanSymbol::Rtr(false));
        assert_eq!(symbols[3], CanSymbol::R0(false));
        assert_eq!(symbols[4], CanSymbol::Dlc(2));
        assert_eq!(symbols[5], CanSymbol::Data(0xde));
        assert_eq!(symbols[6], CanSymbol::Data(0xad));
        assert_eq!(
            &symbols[8..],
            &[
                CanSymbol::CrcDelim(true),
                CanSymbol::Ack(true),
                CanSymbol::AckDelim(true),
                CanSymbol::Eof(true)
            ]
        );
    }

    #[test]
    fn test_extended_frame_with_stuffing() {
        // Long runs of zeros force stuff bits in the ID and data
        let symbols = run(frame(0x0000_0001, true, &[0x00, 0xff, 0x00], false));
        assert_eq!(symbols[1], CanSymbol::Id { id: 1, extended: true });
        let data: Vec<u8> = symbols
            .iter()
            .filter_map(|s| match s {
                CanSymbol::Data(b) => Some(*b),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![0x00, 0xff, 0x00]);
        assert!(symbols.iter().any(|s| matches!(s, CanSymbol::Crc { ok: true, .. })));
    }

    #[test]
    fn test_bad_crc_flagged() {
        let symbols = run(frame(0x7ff, false, &[0x42], true));
        let crc = symbols
            .iter()
            .find(|s| matches!(s, CanSymbol::Crc { .. }))
            .copied()
            .unwrap();
        assert!(matches!(crc, CanSymbol::Crc { ok: false, .. }));
        assert_eq!(crc.color(), StandardColor::ChecksumBad);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut samples = frame(0x100, false, &[1], false);
        samples.extend(frame(0x200, false, &[], false));
        let ids: Vec<CanSymbol> = run(samples)
            .into_iter()
            .filter(|s| matches!(s, CanSymbol::Id { .. }))
            .collect();
        assert_eq!(
            ids,
            vec![
                CanSymbol::Id { id: 0x100, extended: false },
                CanSymbol::Id { id: 0x200, extended: false }
            ]
        );
    }

    #[test]
    fn test_stuff_violation() {
        // Six dominant bits straight after idle
        let mut bus = vec![true; 11];
        bus.extend([false; 6]);
        bus.extend([true; 40]);
        let samples = bus
            .into_iter()
            .flat_map(|b| std::iter::repeat(b).take(SAMPLES_PER_BIT))
            .collect();
        let symbols = run(samples);
        assert_eq!(symbols.last(), Some(&CanSymbol::StuffError));
    }

    #[test]
    fn test_rate_too_high_for_capture() {
        let view_stream = test_support::digital_stream(vec![true; 100], TIMESCALE);
        let view = view_stream.waveform().unwrap().digital().unwrap();
        assert!(decode(view, 1e9).is_err());
        assert!(decode(view, 0.0).is_err());
    }
}
