//! Software oscilloscope for demos and tests.
//!
//! Generates four analog channels from simple patterns at the configured
//! sample rate and depth. Settings are cached locally and mirrored as
//! commands onto a loopback transport, the way a real SCPI driver would
//! push them to hardware.
//!
//! | Channel | Pattern                        |
//! |---------|--------------------------------|
//! | CH1     | 1 MHz sine, 1 V amplitude      |
//! | CH2     | 250 kHz square, 0.5 V          |
//! | CH3     | 100 kHz triangle, 2 V          |
//! | CH4     | noise, 50 mV                   |

use super::transport::{lock, LoopbackTransport, ScpiLink};
use super::{
    ChannelInfo, Coupling, Instrument, TransportDescriptor, TriggerMode, TriggerSettings,
    WaveformSet,
};
use crate::error::{Result, ScopeError};
use crate::waveform::{timescale_for_rate, UniformWaveform};
use std::f64::consts::PI;
use std::sync::Mutex;

pub const DRIVER_NAME: &str = "demo";

const CHANNEL_COLORS: [&str; 4] = ["#ffff00", "#00ffff", "#ff00ff", "#336699"];

/// Commands whose later instances replace queued earlier ones
const DEDUP_VERBS: &[&str] = &["OFFSET", "RANGE", "COUPLING", "ATTEN", "BWL", "TRA"];

/// Signal generated on one demo channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DemoPattern {
    Sine { frequency: f64, amplitude: f64 },
    Square { frequency: f64, amplitude: f64 },
    Triangle { frequency: f64, amplitude: f64 },
    Sawtooth { frequency: f64, amplitude: f64 },
    Noise { amplitude: f64 },
}

impl DemoPattern {
    /// Value at `t` seconds
    fn value(&self, t: f64, rng: &mut XorShift) -> f64 {
        match *self {
            DemoPattern::Sine {
                frequency,
                amplitude,
            } => amplitude * (2.0 * PI * frequency * t).sin(),
            DemoPattern::Square {
                frequency,
                amplitude,
            } => {
                if (t * frequency).fract() < 0.5 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            DemoPattern::Triangle {
                frequency,
                amplitude,
            } => {
                let phase = (t * frequency).fract();
                if phase < 0.5 {
                    amplitude * (4.0 * phase - 1.0)
                } else {
                    amplitude * (3.0 - 4.0 * phase)
                }
            }
            DemoPattern::Sawtooth {
                frequency,
                amplitude,
            } => amplitude * (2.0 * (t * frequency).fract() - 1.0),
            DemoPattern::Noise { amplitude } => (rng.next_f64() - 0.5) * 2.0 * amplitude,
        }
    }
}

/// Small deterministic generator for the noise pattern
#[derive(Debug, Clone)]
struct XorShift(u64);

impl XorShift {
    fn next_f64(&mut self) -> f64 {
        let mut s = self.0;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.0 = s;
        (s as f64) / (u64::MAX as f64)
    }
}

#[derive(Debug, Clone)]
struct DemoChannel {
    pattern: DemoPattern,
    enabled: bool,
    coupling: Coupling,
    attenuation: f64,
    bandwidth_mhz: u32,
    range: f64,
    offset: f64,
    inverted: bool,
}

#[derive(Debug)]
struct DemoState {
    channels: Vec<DemoChannel>,
    sample_rate: u64,
    sample_depth: u64,
    interleaving: bool,
    armed: bool,
    single_shot: bool,
    trigger_offset: i64,
    trigger: TriggerSettings,
    rng: XorShift,
    captures: u64,
}

pub struct DemoOscilloscope {
    name: String,
    state: Mutex<DemoState>,
    link: ScpiLink,
    loopback: LoopbackTransport,
}

impl DemoOscilloscope {
    pub fn new(name: impl Into<String>) -> Self {
        let patterns = [
            DemoPattern::Sine {
                frequency: 1e6,
                amplitude: 1.0,
            },
            DemoPattern::Square {
                frequency: 250e3,
                amplitude: 0.5,
            },
            DemoPattern::Triangle {
                frequency: 100e3,
                amplitude: 2.0,
            },
            DemoPattern::Noise { amplitude: 0.05 },
        ];
        let channels = patterns
            .iter()
            .map(|&pattern| DemoChannel {
                pattern,
                enabled: true,
                coupling: Coupling::Dc1M,
                attenuation: 1.0,
                bandwidth_mhz: 0,
                range: 8.0,
                offset: 0.0,
                inverted: false,
            })
            .collect();

        let name = name.into();
        let loopback = LoopbackTransport::new(format!("demo:{}", name));
        Self {
            state: Mutex::new(DemoState {
                channels,
                sample_rate: 1_000_000_000,
                sample_depth: 10_000,
                interleaving: false,
                armed: false,
                single_shot: false,
                trigger_offset: 0,
                trigger: TriggerSettings::default(),
                rng: XorShift(0x9E37_79B9_7F4A_7C15),
                captures: 0,
            }),
            link: ScpiLink::new(Box::new(loopback.clone()), DEDUP_VERBS),
            loopback,
            name,
        }
    }

    /// Replace the pattern of channel `i`
    pub fn set_pattern(&self, i: usize, pattern: DemoPattern) -> Result<()> {
        let mut state = lock(&self.state);
        let ch = state
            .channels
            .get_mut(i)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no channel {}", i)))?;
        ch.pattern = pattern;
        Ok(())
    }

    /// Commands pushed to the (loopback) hardware so far
    pub fn sent_commands(&self) -> Vec<String> {
        self.loopback.sent()
    }

    /// Make the transport fail, to exercise error paths
    pub fn fail_transport(&self, message: &str) {
        self.loopback.fail_with(message);
    }

    fn with_channel<R>(&self, i: usize, f: impl FnOnce(&mut DemoChannel) -> R) -> Result<R> {
        let mut state = lock(&self.state);
        state
            .channels
            .get_mut(i)
            .map(f)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no channel {}", i)))
    }

    fn read_channel<R: Default>(&self, i: usize, f: impl FnOnce(&DemoChannel) -> R) -> R {
        lock(&self.state).channels.get(i).map(f).unwrap_or_default()
    }

    /// Update the cache, then queue and flush the matching command
    fn configure(&self, cmd: String, apply: impl FnOnce(&mut DemoState)) -> Result<()> {
        apply(&mut lock(&self.state));
        self.link.send_deferred(cmd);
        self.link.flush().map(|_| ())
    }
}

impl Instrument for DemoOscilloscope {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn driver_name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    fn transport(&self) -> TransportDescriptor {
        TransportDescriptor {
            name: self.link.name(),
            connection_string: self.link.connection_string(),
        }
    }

    fn channel_count(&self) -> usize {
        lock(&self.state).channels.len()
    }

    fn channel_info(&self, i: usize) -> ChannelInfo {
        ChannelInfo::analog(format!("CH{}", i + 1), CHANNEL_COLORS[i % CHANNEL_COLORS.len()])
    }

    fn available_couplings(&self, _i: usize) -> Vec<Coupling> {
        vec![
            Coupling::Dc1M,
            Coupling::Ac1M,
            Coupling::Dc50,
            Coupling::Gnd,
            Coupling::Synthetic,
        ]
    }

    fn coupling(&self, i: usize) -> Coupling {
        lock(&self.state)
            .channels
            .get(i)
            .map(|c| c.coupling)
            .unwrap_or(Coupling::Synthetic)
    }

    fn set_coupling(&self, i: usize, coupling: Coupling) -> Result<()> {
        self.with_channel(i, |c| c.coupling = coupling)?;
        self.configure(format!("C{}:COUPLING {:?}", i + 1, coupling), |_| {})
    }

    fn attenuation(&self, i: usize) -> f64 {
        self.read_channel(i, |c| c.attenuation)
    }

    fn set_attenuation(&self, i: usize, attenuation: f64) -> Result<()> {
        if attenuation <= 0.0 {
            return Err(ScopeError::InvalidParameter("attenuation must be positive".into()));
        }
        self.with_channel(i, |c| c.attenuation = attenuation)?;
        self.configure(format!("C{}:ATTEN {}", i + 1, attenuation), |_| {})
    }

    fn bandwidth_limit(&self, i: usize) -> u32 {
        self.read_channel(i, |c| c.bandwidth_mhz)
    }

    fn set_bandwidth_limit(&self, i: usize, mhz: u32) -> Result<()> {
        self.with_channel(i, |c| c.bandwidth_mhz = mhz)?;
        self.configure(format!("C{}:BWL {}", i + 1, mhz), |_| {})
    }

    fn voltage_range(&self, i: usize, _stream: usize) -> f64 {
        self.read_channel(i, |c| c.range)
    }

    fn set_voltage_range(&self, i: usize, _stream: usize, range: f64) -> Result<()> {
        self.with_channel(i, |c| c.range = range)?;
        self.configure(format!("C{}:RANGE {}", i + 1, range), |_| {})
    }

    fn offset(&self, i: usize, _stream: usize) -> f64 {
        self.read_channel(i, |c| c.offset)
    }

    fn set_offset(&self, i: usize, _stream: usize, offset: f64) -> Result<()> {
        self.with_channel(i, |c| c.offset = offset)?;
        self.configure(format!("C{}:OFFSET {}", i + 1, offset), |_| {})
    }

    fn is_channel_enabled(&self, i: usize) -> bool {
        self.read_channel(i, |c| c.enabled)
    }

    fn set_channel_enabled(&self, i: usize, enabled: bool) -> Result<()> {
        self.with_channel(i, |c| c.enabled = enabled)?;
        let onoff = if enabled { "ON" } else { "OFF" };
        self.configure(format!("C{}:TRA {}", i + 1, onoff), |_| {})
    }

    fn is_inverted(&self, i: usize) -> bool {
        self.read_channel(i, |c| c.inverted)
    }

    fn set_inverted(&self, i: usize, invert: bool) -> Result<()> {
        self.with_channel(i, |c| c.inverted = invert)?;
        self.configure(format!("C{}:INVS {}", i + 1, u8::from(invert)), |_| {})
    }

    fn start(&self) -> Result<()> {
        self.configure("TRIG_MODE NORM".to_string(), |s| {
            s.armed = true;
            s.single_shot = false;
        })
    }

    fn start_single_trigger(&self) -> Result<()> {
        self.configure("TRIG_MODE SINGLE".to_string(), |s| {
            s.armed = true;
            s.single_shot = true;
        })
    }

    fn stop(&self) -> Result<()> {
        self.configure("TRIG_MODE STOP".to_string(), |s| s.armed = false)
    }

    fn force_trigger(&self) -> Result<()> {
        self.configure("FRTR".to_string(), |s| s.armed = true)
    }

    fn poll_trigger(&self) -> Result<TriggerMode> {
        self.link.flush()?;
        Ok(if lock(&self.state).armed {
            TriggerMode::Triggered
        } else {
            TriggerMode::Stop
        })
    }

    fn acquire_data(&self) -> Result<WaveformSet> {
        self.link.flush()?;
        let mut state = lock(&self.state);
        let rate = state.sample_rate;
        let depth = state.sample_depth as usize;
        let timescale = timescale_for_rate(rate as f64);
        let t0 = state.captures as f64 * depth as f64 / rate as f64;
        let trigger_phase = state.trigger_offset.rem_euclid(timescale.max(1));

        let mut set = WaveformSet::new();
        let channels = state.channels.clone();
        for (i, ch) in channels.iter().enumerate() {
            if !ch.enabled {
                continue;
            }
            let sign = if ch.inverted { -1.0 } else { 1.0 };
            let samples: Vec<f32> = (0..depth)
                .map(|n| {
                    let t = t0 + n as f64 / rate as f64;
                    let v = match ch.coupling {
                        Coupling::Gnd => 0.0,
                        _ => ch.pattern.value(t, &mut state.rng),
                    };
                    (sign * v / ch.attenuation + ch.offset) as f32
                })
                .collect();
            let mut w = UniformWaveform::from_samples(samples, timescale);
            w.header.trigger_phase = trigger_phase;
            w.header.stamp_now();
            set.insert((i, 0), w.into());
        }

        state.captures += 1;
        if state.single_shot {
            state.armed = false;
        }
        Ok(set)
    }

    fn is_trigger_armed(&self) -> bool {
        lock(&self.state).armed
    }

    fn sample_rates_non_interleaved(&self) -> Vec<u64> {
        vec![
            1_000_000,
            10_000_000,
            100_000_000,
            500_000_000,
            1_000_000_000,
        ]
    }

    fn sample_rates_interleaved(&self) -> Vec<u64> {
        vec![2_000_000_000]
    }

    fn sample_depths_non_interleaved(&self) -> Vec<u64> {
        vec![1_000, 10_000, 100_000, 1_000_000]
    }

    fn sample_depths_interleaved(&self) -> Vec<u64> {
        vec![2_000, 20_000, 200_000, 2_000_000]
    }

    fn sample_rate(&self) -> u64 {
        lock(&self.state).sample_rate
    }

    fn set_sample_rate(&self, rate: u64) -> Result<()> {
        if rate == 0 {
            return Err(ScopeError::InvalidParameter("sample rate must be non-zero".into()));
        }
        self.configure(format!("SARA {}", rate), |s| s.sample_rate = rate)
    }

    fn sample_depth(&self) -> u64 {
        lock(&self.state).sample_depth
    }

    fn set_sample_depth(&self, depth: u64) -> Result<()> {
        self.configure(format!("MSIZ {}", depth), |s| s.sample_depth = depth)
    }

    fn is_interleaving(&self) -> bool {
        lock(&self.state).interleaving
    }

    fn set_interleaving(&self, interleave: bool) -> Result<bool> {
        let allowed = !interleave || self.can_interleave();
        let applied = interleave && allowed;
        self.configure(format!("ILVD {}", u8::from(applied)), |s| s.interleaving = applied)?;
        Ok(applied)
    }

    fn interleave_conflicts(&self) -> Vec<(usize, usize)> {
        vec![(0, 1), (2, 3)]
    }

    fn trigger_offset(&self) -> i64 {
        lock(&self.state).trigger_offset
    }

    fn set_trigger_offset(&self, offset_fs: i64) -> Result<()> {
        self.configure(format!("TRDL {}", offset_fs), |s| s.trigger_offset = offset_fs)
    }

    fn trigger(&self) -> TriggerSettings {
        lock(&self.state).trigger.clone()
    }

    fn set_trigger(&self, trigger: TriggerSettings) -> Result<()> {
        let cmd = format!("TRIG C{}:{:?}:{}", trigger.source + 1, trigger.slope, trigger.level);
        self.configure(cmd, |s| s.trigger = trigger)
    }
}

impl std::fmt::Debug for DemoOscilloscope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoOscilloscope").field("name", &self.name).finish()
    }
}
