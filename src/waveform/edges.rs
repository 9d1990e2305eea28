//! Threshold crossings, edge finding and clock-based sampling.
//!
//! All X positions are in scaled units (femtoseconds for time-domain
//! waveforms), i.e. `offset * timescale + trigger_phase`.

use super::{AnalogView, DigitalView, SparseWaveform};

/// Index pairs `(i, j)` bracketing each crossing of `threshold`.
///
/// Samples exactly on the threshold (and NaNs) are skipped, so a signal that
/// touches the threshold and returns to the same side does not cross it.
fn crossing_brackets(samples: &[f32], threshold: f32) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut last: Option<usize> = None;
    for (j, &v) in samples.iter().enumerate() {
        if v == threshold || v.is_nan() {
            continue;
        }
        if let Some(i) = last {
            if (samples[i] > threshold) != (v > threshold) {
                out.push((i, j));
            }
        }
        last = Some(j);
    }
    out
}

/// Linear interpolation of the threshold position between samples `i` and `j`
fn interpolate_crossing(wave: &AnalogView<'_>, i: usize, j: usize, threshold: f32) -> i64 {
    let (a, b) = (wave.value(i) as f64, wave.value(j) as f64);
    let x0 = wave.offset_scaled(i);
    let dx = (wave.offset_scaled(j) - x0) as f64;
    let frac = (threshold as f64 - a) / (b - a);
    x0 + (frac * dx).round() as i64
}

/// Interpolated X positions where the signal crosses `threshold`.
///
/// For each pair `(i, j)` on opposite sides of the threshold the crossing is
/// `x_i + (t - s_i) / (s_j - s_i) * (x_j - x_i)`. `j` is usually `i + 1`;
/// samples sitting on the threshold are stepped over.
pub fn find_zero_crossings(wave: AnalogView<'_>, threshold: f32) -> Vec<i64> {
    crossing_brackets(wave.samples(), threshold)
        .into_iter()
        .map(|(i, j)| interpolate_crossing(&wave, i, j, threshold))
        .collect()
}

/// Interpolated positions of rising (`rising = true`) or falling threshold crossings
pub fn find_analog_edges(wave: AnalogView<'_>, threshold: f32, rising: bool) -> Vec<i64> {
    let samples = wave.samples();
    crossing_brackets(samples, threshold)
        .into_iter()
        .filter(|&(i, _)| (samples[i] < threshold) == rising)
        .map(|(i, j)| interpolate_crossing(&wave, i, j, threshold))
        .collect()
}

/// Which transitions of a digital signal to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Rising,
    Falling,
    Both,
}

/// Positions of digital transitions (start of the sample after the change)
pub fn find_edges(wave: DigitalView<'_>, kind: EdgeKind) -> Vec<i64> {
    let samples = wave.samples();
    let mut out = Vec::new();
    for i in 1..samples.len() {
        let (prev, cur) = (samples[i - 1], samples[i]);
        let hit = match kind {
            EdgeKind::Rising => !prev && cur,
            EdgeKind::Falling => prev && !cur,
            EdgeKind::Both => prev != cur,
        };
        if hit {
            out.push(wave.offset_scaled(i));
        }
    }
    out
}

/// Sample `data` at each clock edge.
///
/// The result is sparse with timescale 1 (scaled units); each sample lasts
/// until the next edge. Edges outside the data are skipped.
pub fn sample_on_edges(data: DigitalView<'_>, edges: &[i64]) -> SparseWaveform<bool> {
    let mut out = SparseWaveform::new(1);
    out.header.copy_timebase_from(data.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;

    let mut hits: Vec<(i64, bool)> = Vec::with_capacity(edges.len());
    for &t in edges {
        if let Some(v) = data.value_at(t) {
            hits.push((t, v));
        }
    }
    for (k, &(t, v)) in hits.iter().enumerate() {
        let duration = hits.get(k + 1).map(|&(next, _)| next - t).unwrap_or(1).max(1);
        out.push(t, duration, v);
    }
    out
}
