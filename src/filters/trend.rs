//! Trend accumulator: turns successive scalar values into a waveform.
//!
//! A value is appended once per input revision, so refreshing on unchanged
//! input does not duplicate points. X is femtoseconds since the first point.

use crate::error::Result;
use crate::graph::{is_scalar, Filter, FilterParameter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::{SparseWaveform, WaveformHeader};
use std::collections::VecDeque;
use std::time::Instant;

pub const NAME: &str = "Trend";

pub const PARAM_DEPTH: &str = "Depth";

#[derive(Debug)]
pub struct TrendFilter {
    core: NodeCore,
    history: VecDeque<(i64, f32)>,
    origin: Option<(Instant, WaveformHeader)>,
    last_revision: Option<u64>,
}

impl TrendFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::analog("trend", Unit::Volts));
        core.parameters_mut()
            .insert(PARAM_DEPTH, FilterParameter::int(1000, Unit::SampleDepth));
        Self {
            core,
            history: VecDeque::new(),
            origin: None,
            last_revision: None,
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.origin = None;
        self.last_revision = None;
    }

    fn depth(&self) -> usize {
        self.core.parameters().int(PARAM_DEPTH).max(1) as usize
    }

    fn trim(&mut self) {
        let depth = self.depth();
        while self.history.len() > depth {
            self.history.pop_front();
        }
    }

    fn record(&mut self, value: f64) {
        let (origin, _) = self.origin.get_or_insert_with(|| {
            let mut header = WaveformHeader::with_timescale(1);
            header.stamp_now();
            (Instant::now(), header)
        });
        let elapsed = origin.elapsed().as_nanos().min(i64::MAX as u128 / 1_000_000) as i64;
        let mut x = elapsed * 1_000_000;
        if let Some(&(prev, _)) = self.history.back() {
            x = x.max(prev + 1);
        }
        self.history.push_back((x, value as f32));
        self.trim();
    }

    fn build(&self) -> SparseWaveform<f32> {
        let mut out = SparseWaveform::new(1);
        if let Some((_, header)) = &self.origin {
            out.header.copy_timebase_from(header);
        }
        out.header.timescale = 1;
        for (i, &(x, v)) in self.history.iter().enumerate() {
            let next = self.history.get(i + 1).map(|&(n, _)| n).unwrap_or(x + 1);
            out.push(x, (next - x).max(1), v);
        }
        out.mark_modified_from_cpu();
        out
    }
}

impl Filter for TrendFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_scalar(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let value = ctx.scalar_input(0)?;
        let input = ctx.input(0);
        let revision = input.and_then(Stream::revision);
        if let Some(stream) = input {
            self.core.streams_mut()[0].y_unit = stream.y_unit;
        }
        if revision.is_none() || revision != self.last_revision {
            self.record(value);
            self.last_revision = revision;
        }
        let out = self.build();
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }

    fn on_parameter_changed(&mut self, name: &str) {
        if name == PARAM_DEPTH {
            self.trim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;

    fn scalar(value: f64, revision: u64) -> Stream {
        let mut s = Stream::scalar("x", Unit::Volts);
        s.set_value(Some(value));
        s.stamp(revision);
        s
    }

    #[test]
    fn test_accumulates_once_per_revision() {
        let mut f = TrendFilter::new("#ffffff");
        test_support::refresh(&mut f, &[&scalar(1.0, 1)]).unwrap();
        test_support::refresh(&mut f, &[&scalar(1.0, 1)]).unwrap();
        test_support::refresh(&mut f, &[&scalar(2.0, 2)]).unwrap();
        assert_eq!(f.len(), 2);

        let w = f.core().stream(0).unwrap().waveform().unwrap();
        let view = w.analog().unwrap();
        assert_eq!(view.samples(), &[1.0, 2.0]);
        assert!(view.offset_scaled(1) > view.offset_scaled(0));
    }

    #[test]
    fn test_depth_limits_history() {
        let mut f = TrendFilter::new("#ffffff");
        f.core_mut().parameters_mut().set_int(PARAM_DEPTH, 3).unwrap();
        for i in 0..10 {
            test_support::refresh(&mut f, &[&scalar(i as f64, i + 1)]).unwrap();
        }
        assert_eq!(f.len(), 3);
        f.core_mut().parameters_mut().set_int(PARAM_DEPTH, 1).unwrap();
        f.on_parameter_changed(PARAM_DEPTH);
        assert_eq!(f.len(), 1);
        f.clear();
        assert!(f.is_empty());
    }

    #[test]
    fn test_missing_value() {
        let mut f = TrendFilter::new("#ffffff");
        let empty = Stream::scalar("x", Unit::Volts);
        assert!(test_support::refresh(&mut f, &[&empty]).is_err());
    }
}
