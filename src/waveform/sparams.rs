//! S-parameter sets and Touchstone parsing.
//!
//! Magnitudes are linear, phases radians, frequencies Hz.

use super::SparseWaveform;
use crate::error::{Result, ResultExt, ScopeError};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SParameterPoint {
    pub frequency: f64,
    pub magnitude: f64,
    pub phase: f64,
}

/// Wrap an angle difference into `(-π, π]`
fn wrap_pi(mut d: f64) -> f64 {
    while d > PI {
        d -= 2.0 * PI;
    }
    while d <= -PI {
        d += 2.0 * PI;
    }
    d
}

/// One port pair over frequency, ordered by frequency
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SParameterVector {
    pub points: Vec<SParameterPoint>,
}

impl SParameterVector {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Index `i` such that `points[i].frequency <= f < points[i + 1].frequency`
    fn bracket(&self, f: f64) -> Option<(usize, f64)> {
        let n = self.points.len();
        if n < 2 || f <= self.points[0].frequency || f >= self.points[n - 1].frequency {
            return None;
        }
        let hi = self.points.partition_point(|p| p.frequency <= f);
        let lo = hi - 1;
        let (a, b) = (&self.points[lo], &self.points[hi]);
        Some((lo, (f - a.frequency) / (b.frequency - a.frequency)))
    }

    fn clamped(&self, f: f64) -> Option<&SParameterPoint> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        Some(if f <= first.frequency { first } else { last })
    }

    /// Linearly interpolated magnitude; clamps outside the measured range
    pub fn interpolate_magnitude(&self, f: f64) -> f64 {
        match self.bracket(f) {
            Some((lo, frac)) => {
                let (a, b) = (self.points[lo].magnitude, self.points[lo + 1].magnitude);
                a + (b - a) * frac
            }
            None => self.clamped(f).map(|p| p.magnitude).unwrap_or(0.0),
        }
    }

    /// Interpolated phase along the shortest arc between neighbours
    pub fn interpolate_angle(&self, f: f64) -> f64 {
        match self.bracket(f) {
            Some((lo, frac)) => {
                let a = self.points[lo].phase;
                let d = wrap_pi(self.points[lo + 1].phase - a);
                a + d * frac
            }
            None => self.clamped(f).map(|p| p.phase).unwrap_or(0.0),
        }
    }

    pub fn interpolate(&self, f: f64) -> SParameterPoint {
        SParameterPoint {
            frequency: f,
            magnitude: self.interpolate_magnitude(f),
            phase: self.interpolate_angle(f),
        }
    }

    /// Group delay in seconds between bins `k` and `k + 1`
    pub fn group_delay(&self, k: usize) -> Option<f64> {
        let a = self.points.get(k)?;
        let b = self.points.get(k + 1)?;
        let df = b.frequency - a.frequency;
        if df == 0.0 {
            return None;
        }
        let dphi = wrap_pi(b.phase - a.phase);
        Some(-dphi / df / (2.0 * PI))
    }

    /// Magnitude (dB) and angle (degrees) as sparse waveforms over frequency
    pub fn to_waveforms(&self) -> (SparseWaveform<f32>, SparseWaveform<f32>) {
        let mut mag = SparseWaveform::new(1);
        let mut ang = SparseWaveform::new(1);
        let n = self.points.len();
        for (i, p) in self.points.iter().enumerate() {
            let offset = p.frequency.round() as i64;
            let next = if i + 1 < n {
                self.points[i + 1].frequency.round() as i64
            } else if i > 0 {
                offset + (offset - self.points[i - 1].frequency.round() as i64)
            } else {
                offset + 1
            };
            let duration = (next - offset).max(1);
            let db = 20.0 * p.magnitude.max(f64::MIN_POSITIVE).log10();
            mag.push(offset, duration, db as f32);
            ang.push(offset, duration, p.phase.to_degrees() as f32);
        }
        (mag, ang)
    }
}

/// Full S-parameter matrix keyed by `(to, from)`, 1-indexed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SParameters {
    nports: usize,
    params: BTreeMap<(usize, usize), SParameterVector>,
}

impl SParameters {
    pub fn new(nports: usize) -> Self {
        let mut params = BTreeMap::new();
        for to in 1..=nports {
            for from in 1..=nports {
                params.insert((to, from), SParameterVector::default());
            }
        }
        Self { nports, params }
    }

    pub fn port_count(&self) -> usize {
        self.nports
    }

    pub fn get(&self, to: usize, from: usize) -> Option<&SParameterVector> {
        self.params.get(&(to, from))
    }

    pub fn get_mut(&mut self, to: usize, from: usize) -> Option<&mut SParameterVector> {
        self.params.get_mut(&(to, from))
    }

    pub fn insert(&mut self, to: usize, from: usize, vec: SParameterVector) {
        self.nports = self.nports.max(to).max(from);
        self.params.insert((to, from), vec);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(usize, usize), &SParameterVector)> {
        self.params.iter()
    }

    pub fn frequency_count(&self) -> usize {
        self.params.values().map(SParameterVector::len).max().unwrap_or(0)
    }

    /// Parse Touchstone text for an `nports`-port network
    pub fn parse_touchstone(text: &str, nports: usize) -> Result<Self> {
        if nports == 0 {
            return Err(ScopeError::Parse("Touchstone port count must be positive".to_string()));
        }
        let mut options = TouchstoneOptions::default();
        let mut values: Vec<f64> = Vec::new();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('!').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(opts) = line.strip_prefix('#') {
                options = TouchstoneOptions::parse(opts)?;
                continue;
            }
            if line.starts_with('[') {
                // Version 2 keywords are not interpreted
                continue;
            }
            for tok in line.split_whitespace() {
                let v: f64 = tok.parse().map_err(|_| {
                    ScopeError::Parse(format!("line {}: bad number '{}'", lineno + 1, tok))
                })?;
                values.push(v);
            }
        }

        let per_record = 1 + 2 * nports * nports;
        if values.len() % per_record != 0 {
            return Err(ScopeError::Parse(format!(
                "{} values is not a whole number of {}-value records",
                values.len(),
                per_record
            )));
        }

        let mut out = Self::new(nports);
        for record in values.chunks_exact(per_record) {
            let frequency = record[0] * options.freq_scale;
            for k in 0..nports * nports {
                // Two-port files list S11 S21 S12 S22; larger ones are row-major
                let (to, from) = if nports == 2 {
                    (k % 2 + 1, k / 2 + 1)
                } else {
                    (k / nports + 1, k % nports + 1)
                };
                let (a, b) = (record[1 + 2 * k], record[2 + 2 * k]);
                let (magnitude, phase) = options.format.to_mag_phase(a, b);
                if let Some(vec) = out.get_mut(to, from) {
                    vec.points.push(SParameterPoint {
                        frequency,
                        magnitude,
                        phase,
                    });
                }
            }
        }
        tracing::debug!(
            "Parsed Touchstone: {} ports, {} points, z0={}",
            nports,
            out.frequency_count(),
            options.z0
        );
        Ok(out)
    }

    /// Load a `.sNp` file; the port count comes from the extension
    pub fn load_touchstone(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let nports = touchstone_port_count(path).ok_or_else(|| {
            ScopeError::Parse(format!("{:?} does not have a .sNp extension", path))
        })?;
        let text = std::fs::read_to_string(path)?;
        Self::parse_touchstone(&text, nports).with_context(|| format!("Loading {:?}", path))
    }
}

/// Port count from a `.sNp` extension
pub fn touchstone_port_count(path: &Path) -> Option<usize> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let digits = ext.strip_prefix('s')?.strip_suffix('p')?;
    digits.parse().ok().filter(|&n| n > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataFormat {
    MagnitudeAngle,
    DbAngle,
    RealImaginary,
}

impl DataFormat {
    fn to_mag_phase(self, a: f64, b: f64) -> (f64, f64) {
        match self {
            DataFormat::MagnitudeAngle => (a, b.to_radians()),
            DataFormat::DbAngle => (10f64.powf(a / 20.0), b.to_radians()),
            DataFormat::RealImaginary => (a.hypot(b), b.atan2(a)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TouchstoneOptions {
    freq_scale: f64,
    format: DataFormat,
    z0: f64,
}

impl Default for TouchstoneOptions {
    fn default() -> Self {
        Self {
            freq_scale: 1e9,
            format: DataFormat::MagnitudeAngle,
            z0: 50.0,
        }
    }
}

impl TouchstoneOptions {
    fn parse(text: &str) -> Result<Self> {
        let mut opts = Self::default();
        let mut tokens = text.split_whitespace().map(|t| t.to_ascii_uppercase());
        while let Some(tok) = tokens.next() {
            match tok.as_str() {
                "HZ" => opts.freq_scale = 1.0,
                "KHZ" => opts.freq_scale = 1e3,
                "MHZ" => opts.freq_scale = 1e6,
                "GHZ" => opts.freq_scale = 1e9,
                "MA" => opts.format = DataFormat::MagnitudeAngle,
                "DB" => opts.format = DataFormat::DbAngle,
                "RI" => opts.format = DataFormat::RealImaginary,
                "S" => {}
                "Y" | "Z" | "H" | "G" => {
                    return Err(ScopeError::Parse(format!(
                        "{}-parameter Touchstone files are not supported",
                        tok
                    )))
                }
                "R" => {
                    let z = tokens
                        .next()
                        .ok_or_else(|| ScopeError::Parse("R without impedance".to_string()))?;
                    opts.z0 = z
                        .parse()
                        .map_err(|_| ScopeError::Parse(format!("bad reference impedance '{}'", z)))?;
                }
                other => {
                    return Err(ScopeError::Parse(format!("unknown option '{}'", other)));
                }
            }
        }
        Ok(opts)
    }
}
