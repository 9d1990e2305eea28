//! Export decoded Ethernet frames to a pcapng capture file.
//!
//! The file is opened lazily on the first refresh after the path changes and
//! starts with a Section Header Block and one Ethernet Interface Description
//! Block with nanosecond timestamps. Every refresh appends one Enhanced
//! Packet Block per complete frame. Captured data runs from the destination
//! MAC through the payload; the FCS is not stored.

use crate::error::{Result, ScopeError};
use crate::graph::{FileFilter, Filter, FilterParameter, NodeCore, RefreshContext, Stream, StreamType};
use crate::waveform::{ProtocolSymbol, ProtocolWaveform, StandardColor};
use std::fs::File;
use std::io::{BufWriter, Write};

pub const NAME: &str = "PcapNG Export";

pub const PARAM_OUTPUT_FILE: &str = "Output File";

const BLOCK_SHB: u32 = 0x0a0d_0d0a;
const BLOCK_IDB: u32 = 0x0000_0001;
const BLOCK_EPB: u32 = 0x0000_0006;
const BYTE_ORDER_MAGIC: u32 = 0x1a2b_3c4d;
const LINKTYPE_ETHERNET: u16 = 1;

const OPT_ENDOFOPT: u16 = 0;
const OPT_IF_NAME: u16 = 2;
const OPT_IF_TSRESOL: u16 = 9;

const FS_PER_NS: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthernetSymbol {
    Preamble,
    Sfd,
    DstMac([u8; 6]),
    SrcMac([u8; 6]),
    Ethertype(u16),
    Payload(u8),
    Fcs(u32),
}

fn mac_text(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

impl ProtocolSymbol for EthernetSymbol {
    fn color(&self) -> StandardColor {
        match self {
            EthernetSymbol::Preamble | EthernetSymbol::Sfd => StandardColor::Preamble,
            EthernetSymbol::DstMac(_) | EthernetSymbol::SrcMac(_) => StandardColor::Address,
            EthernetSymbol::Ethertype(_) => StandardColor::Control,
            EthernetSymbol::Payload(_) => StandardColor::Data,
            EthernetSymbol::Fcs(_) => StandardColor::ChecksumOk,
        }
    }

    fn text(&self) -> String {
        match self {
            EthernetSymbol::Preamble => "PREAMBLE".to_string(),
            EthernetSymbol::Sfd => "SFD".to_string(),
            EthernetSymbol::DstMac(mac) => format!("To {}", mac_text(mac)),
            EthernetSymbol::SrcMac(mac) => format!("From {}", mac_text(mac)),
            EthernetSymbol::Ethertype(t) => format!("Type {:04x}", t),
            EthernetSymbol::Payload(b) => format!("{:02x}", b),
            EthernetSymbol::Fcs(crc) => format!("CRC {:08x}", crc),
        }
    }
}

/// One reassembled frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    /// Femtoseconds since the waveform's start timestamp
    pub start: i64,
    pub data: Vec<u8>,
}

/// Group symbols into frames. A frame starts at its destination MAC (or the
/// preamble before it) and ends at the FCS or the next frame.
pub fn assemble_frames(wave: &ProtocolWaveform<EthernetSymbol>) -> Vec<EthernetFrame> {
    let mut frames = Vec::new();
    let mut current: Option<EthernetFrame> = None;
    let mut preamble_start: Option<i64> = None;

    for (i, symbol) in wave.symbols.iter().enumerate() {
        let t = wave.offset_scaled(i);
        match symbol {
            EthernetSymbol::Preamble => {
                frames.extend(current.take());
                preamble_start = Some(t);
            }
            EthernetSymbol::Sfd => {}
            EthernetSymbol::DstMac(mac) => {
                frames.extend(current.take());
                let mut data = Vec::with_capacity(64);
                data.extend_from_slice(mac);
                current = Some(EthernetFrame {
                    start: preamble_start.take().unwrap_or(t),
                    data,
                });
            }
            EthernetSymbol::SrcMac(mac) => {
                if let Some(f) = current.as_mut() {
                    f.data.extend_from_slice(mac);
                }
            }
            EthernetSymbol::Ethertype(t) => {
                if let Some(f) = current.as_mut() {
                    f.data.extend_from_slice(&t.to_be_bytes());
                }
            }
            EthernetSymbol::Payload(b) => {
                if let Some(f) = current.as_mut() {
                    f.data.push(*b);
                }
            }
            EthernetSymbol::Fcs(_) => frames.extend(current.take()),
        }
    }
    frames.extend(current);
    frames
}

/// Little-endian pcapng block writer
#[derive(Debug)]
pub struct PcapNgWriter<W: Write> {
    out: W,
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

impl<W: Write> PcapNgWriter<W> {
    /// Write the section header and the single Ethernet interface
    pub fn new(mut out: W) -> Result<Self> {
        // Section Header Block, no options
        let len = 28u32;
        out.write_all(&BLOCK_SHB.to_le_bytes())?;
        out.write_all(&len.to_le_bytes())?;
        out.write_all(&BYTE_ORDER_MAGIC.to_le_bytes())?;
        out.write_all(&1u16.to_le_bytes())?;
        out.write_all(&0u16.to_le_bytes())?;
        out.write_all(&(-1i64).to_le_bytes())?;
        out.write_all(&len.to_le_bytes())?;

        let mut w = Self { out };
        let mut options = Vec::new();
        push_option(&mut options, OPT_IF_NAME, b"eth0");
        push_option(&mut options, OPT_IF_TSRESOL, &[9]);
        push_option(&mut options, OPT_ENDOFOPT, &[]);

        let mut body = Vec::with_capacity(8 + options.len());
        body.extend_from_slice(&LINKTYPE_ETHERNET.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        // Snap length 0: no limit
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&options);
        w.block(BLOCK_IDB, &body)?;
        Ok(w)
    }

    /// Append one packet with a nanosecond timestamp
    pub fn write_packet(&mut self, timestamp_ns: u64, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len())
            .map_err(|_| ScopeError::InvalidInput(format!("{} byte frame is too long", data.len())))?;
        let mut body = Vec::with_capacity(20 + padded(data.len()) + 4);
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&((timestamp_ns >> 32) as u32).to_le_bytes());
        body.extend_from_slice(&(timestamp_ns as u32).to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(data);
        body.resize(20 + padded(data.len()), 0);
        push_option(&mut body, OPT_ENDOFOPT, &[]);
        self.block(BLOCK_EPB, &body)
    }

    fn block(&mut self, block_type: u32, body: &[u8]) -> Result<()> {
        let total = u32::try_from(12 + body.len())
            .map_err(|_| ScopeError::InvalidInput("pcapng block too large".to_string()))?;
        self.out.write_all(&block_type.to_le_bytes())?;
        self.out.write_all(&total.to_le_bytes())?;
        self.out.write_all(body)?;
        self.out.write_all(&total.to_le_bytes())?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn push_option(buf: &mut Vec<u8>, code: u16, value: &[u8]) {
    buf.extend_from_slice(&code.to_le_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + padded(value.len()) - value.len(), 0);
}

#[derive(Debug)]
pub struct PcapNgExportFilter {
    core: NodeCore,
    writer: Option<PcapNgWriter<BufWriter<File>>>,
    frames_written: usize,
}

impl PcapNgExportFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.parameters_mut().insert(
            PARAM_OUTPUT_FILE,
            FilterParameter::filename("", FileFilter::new("PcapNG files", &["pcapng"])),
        );
        Self {
            core,
            writer: None,
            frames_written: 0,
        }
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    fn writer(&mut self) -> Result<&mut PcapNgWriter<BufWriter<File>>> {
        if self.writer.is_none() {
            let path = self.core.parameters().text(PARAM_OUTPUT_FILE);
            if path.is_empty() {
                return Err(ScopeError::InvalidParameter("no output file selected".to_string()));
            }
            let file = File::create(&path).map_err(|e| ScopeError::from(e).with_context(format!("Creating {}", path)))?;
            tracing::info!("Writing pcapng capture to {}", path);
            self.writer = Some(PcapNgWriter::new(BufWriter::new(file))?);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| ScopeError::InvalidParameter("no output file selected".to_string()))
    }
}

impl Filter for PcapNgExportFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && stream.stream_type == StreamType::Protocol
    }

    fn on_parameter_changed(&mut self, name: &str) {
        if name != PARAM_OUTPUT_FILE {
            return;
        }
        if let Some(mut old) = self.writer.take() {
            if let Err(e) = old.flush() {
                tracing::warn!("Failed to flush pcapng output: {}", e);
            }
        }
        self.frames_written = 0;
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let input = ctx.input_waveform(0)?;
        let wave = input
            .protocol()
            .and_then(|p| p.downcast_ref::<EthernetSymbol>())
            .ok_or_else(|| ScopeError::InvalidInput("input is not an Ethernet decode".to_string()))?;

        let frames = assemble_frames(wave);
        let header = &wave.header;
        let base_ns = header.start_timestamp * 1_000_000_000 + header.start_femtoseconds / FS_PER_NS;

        let writer = self.writer()?;
        for frame in &frames {
            let ns = base_ns + frame.start / FS_PER_NS;
            writer.write_packet(ns.max(0) as u64, &frame.data)?;
        }
        writer.flush()?;
        self.frames_written += frames.len();
        tracing::debug!("{} exported {} frames", self.core.id(), frames.len());
        Ok(())
    }
}

// Flush buffered blocks on drop
impl Drop for PcapNgExportFilter {
    fn drop(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;
    use crate::graph::ParameterValue;

    const DST: [u8; 6] = [0xff; 6];
    const SRC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

    fn frame_symbols(w: &mut ProtocolWaveform<EthernetSymbol>, start: i64, payload: &[u8]) {
        let bit = 800_000; // 1.25 Gbaud byte time in fs
        let mut t = start;
        let mut push = |w: &mut ProtocolWaveform<EthernetSymbol>, s| {
            w.push(t, bit, s);
            t += bit;
        };
        push(w, EthernetSymbol::Preamble);
        push(w, EthernetSymbol::Sfd);
        push(w, EthernetSymbol::DstMac(DST));
        push(w, EthernetSymbol::SrcMac(SRC));
        push(w, EthernetSymbol::Ethertype(0x0800));
        for &b in payload {
            push(w, EthernetSymbol::Payload(b));
        }
        push(w, EthernetSymbol::Fcs(0xdead_beef));
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn test_assemble_frames() {
        let mut w = ProtocolWaveform::new(1);
        frame_symbols(&mut w, 0, &[1, 2, 3]);
        frame_symbols(&mut w, 50_000_000, &[4]);
        let frames = assemble_frames(&w);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.len(), 6 + 6 + 2 + 3);
        assert_eq!(&frames[0].data[12..14], &[0x08, 0x00]);
        assert_eq!(frames[1].start, 50_000_000);
        assert_eq!(frames[1].data.last(), Some(&4));
    }

    #[test]
    fn test_block_layout() {
        let mut w = PcapNgWriter::new(Vec::new()).unwrap();
        w.write_packet(0x1_0000_0002, &[0xaa; 5]).unwrap();
        let buf = w.into_inner();

        // SHB
        assert_eq!(u32_at(&buf, 0), BLOCK_SHB);
        assert_eq!(u32_at(&buf, 4), 28);
        assert_eq!(u32_at(&buf, 8), BYTE_ORDER_MAGIC);
        assert_eq!(u32_at(&buf, 24), 28);

        // IDB
        let idb = 28;
        assert_eq!(u32_at(&buf, idb), BLOCK_IDB);
        let idb_len = u32_at(&buf, idb + 4) as usize;
        assert_eq!(idb_len, 40);
        assert_eq!(&buf[idb + 20..idb + 24], b"eth0");
        assert_eq!(buf[idb + 28], 9);
        assert_eq!(u32_at(&buf, idb + idb_len - 4), idb_len as u32);

        // EPB
        let epb = idb + idb_len;
        assert_eq!(u32_at(&buf, epb), BLOCK_EPB);
        let epb_len = u32_at(&buf, epb + 4) as usize;
        assert_eq!(epb_len, 28 + 8 + 4 + 4);
        assert_eq!(u32_at(&buf, epb + 12), 1);
        assert_eq!(u32_at(&buf, epb + 16), 2);
        assert_eq!(u32_at(&buf, epb + 20), 5);
        assert_eq!(buf.len(), epb + epb_len);
        assert_eq!(buf.len() % 4, 0);
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.pcapng");

        let mut f = PcapNgExportFilter::new("#ffffff");
        f.core_mut()
            .parameters_mut()
            .set_value(
                PARAM_OUTPUT_FILE,
                &ParameterValue::Filename(path.to_str().unwrap().to_string()),
            )
            .unwrap();
        f.on_parameter_changed(PARAM_OUTPUT_FILE);

        let mut w = ProtocolWaveform::new(1);
        w.header.start_timestamp = 10;
        frame_symbols(&mut w, 0, &[0u8; 46]);
        let mut input = Stream::protocol("eth");
        input.set_waveform(Some(w.into()));
        test_support::refresh(&mut f, &[&input]).unwrap();
        test_support::refresh(&mut f, &[&input]).unwrap();
        assert_eq!(f.frames_written(), 2);

        let buf = std::fs::read(&path).unwrap();
        let epb = 28 + 40;
        assert_eq!(u32_at(&buf, epb), BLOCK_EPB);
        let ts = (u64::from(u32_at(&buf, epb + 12)) << 32) | u64::from(u32_at(&buf, epb + 16));
        assert_eq!(ts, 10_000_000_000);
        assert_eq!(u32_at(&buf, epb + 20), 60);
    }

    #[test]
    fn test_requires_output_file() {
        let mut f = PcapNgExportFilter::new("#ffffff");
        let mut w = ProtocolWaveform::new(1);
        frame_symbols(&mut w, 0, &[1]);
        let mut input = Stream::protocol("eth");
        input.set_waveform(Some(w.into()));
        assert!(matches!(
            test_support::refresh(&mut f, &[&input]),
            Err(ScopeError::InvalidParameter(_))
        ));
    }
}
