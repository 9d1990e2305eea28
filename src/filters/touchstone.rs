//! Touchstone (`.sNp`) import.
//!
//! A source node: no inputs, one magnitude and one angle stream per port
//! pair. The stream list is rebuilt whenever the file name changes.

use crate::error::{Result, ScopeError};
use crate::graph::{FileFilter, Filter, FilterParameter, NodeCore, RefreshContext, Stream, StreamType};
use crate::units::Unit;
use crate::waveform::sparams::SParameters;

pub const NAME: &str = "Touchstone Import";

pub const PARAM_FILE_NAME: &str = "File Name";

/// Magnitude and angle stream names for one port pair
pub fn stream_names(to: usize, from: usize) -> (String, String) {
    (format!("S{}{}_mag", to, from), format!("S{}{}_ang", to, from))
}

/// Magnitude (dB) and angle (degrees) streams for one port pair
pub fn sparameter_streams(to: usize, from: usize) -> [Stream; 2] {
    let (mag, ang) = stream_names(to, from);
    [
        Stream::new(mag, StreamType::Analog, Unit::Hertz, Unit::Db),
        Stream::new(ang, StreamType::Analog, Unit::Hertz, Unit::Degrees),
    ]
}

#[derive(Debug)]
pub struct TouchstoneImportFilter {
    core: NodeCore,
    params: Option<SParameters>,
    load_error: Option<String>,
}

impl TouchstoneImportFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.parameters_mut().insert(
            PARAM_FILE_NAME,
            FilterParameter::filename("", FileFilter::new("Touchstone files", &["s*p"])),
        );
        Self {
            core,
            params: None,
            load_error: None,
        }
    }

    /// The loaded network, if any
    pub fn sparameters(&self) -> Option<&SParameters> {
        self.params.as_ref()
    }

    fn reload(&mut self) {
        let path = self.core.parameters().text(PARAM_FILE_NAME);
        self.params = None;
        self.load_error = None;
        if path.is_empty() {
            self.core.rebuild_streams(Vec::new());
            return;
        }

        match SParameters::load_touchstone(&path) {
            Ok(params) => {
                let streams = params
                    .iter()
                    .flat_map(|(&(to, from), _)| sparameter_streams(to, from))
                    .collect();
                self.core.rebuild_streams(streams);
                tracing::info!(
                    "Loaded {}-port network from {} ({} points)",
                    params.port_count(),
                    path,
                    params.frequency_count()
                );
                self.params = Some(params);
            }
            Err(e) => {
                tracing::warn!("Failed to load {}: {}", path, e);
                self.core.rebuild_streams(Vec::new());
                self.load_error = Some(e.to_string());
            }
        }
    }
}

impl Filter for TouchstoneImportFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, _i: usize, _stream: &Stream) -> bool {
        false
    }

    fn on_parameter_changed(&mut self, name: &str) {
        if name == PARAM_FILE_NAME {
            self.reload();
        }
    }

    fn refresh(&mut self, _ctx: &mut RefreshContext<'_>) -> Result<()> {
        if let Some(e) = &self.load_error {
            return Err(ScopeError::Parse(e.clone()));
        }
        let Some(params) = &self.params else {
            return Err(ScopeError::InvalidParameter("no Touchstone file selected".to_string()));
        };

        let mut outputs = Vec::with_capacity(params.port_count() * params.port_count() * 2);
        for (_, vec) in params.iter() {
            let (mut mag, mut ang) = vec.to_waveforms();
            mag.mark_modified_from_cpu();
            ang.mark_modified_from_cpu();
            outputs.push(mag);
            outputs.push(ang);
        }
        for (i, w) in outputs.into_iter().enumerate() {
            self.core.set_output_waveform(i, w.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;
    use crate::graph::ParameterValue;
    use std::io::Write;

    const TWO_PORT: &str = "! thru\n# GHZ S MA R 50\n1.0 0.1 0 0.9 -90 0.9 -90 0.1 0\n2.0 0.1 0 0.8 -180 0.8 -180 0.1 0\n";

    fn load(f: &mut TouchstoneImportFilter, path: &str) {
        f.core_mut()
            .parameters_mut()
            .set_value(PARAM_FILE_NAME, &ParameterValue::Filename(path.to_string()))
            .unwrap();
        f.on_parameter_changed(PARAM_FILE_NAME);
    }

    #[test]
    fn test_import_two_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thru.s2p");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(TWO_PORT.as_bytes())
            .unwrap();

        let mut f = TouchstoneImportFilter::new("#ffffff");
        load(&mut f, path.to_str().unwrap());
        assert_eq!(f.core().stream_count(), 8);
        let s21_ang = f.core().stream_index("S21_ang").unwrap();

        test_support::refresh(&mut f, &[]).unwrap();
        let stream = f.core().stream(s21_ang).unwrap();
        assert_eq!(stream.x_unit, Unit::Hertz);
        assert_eq!(stream.y_unit, Unit::Degrees);
        let view = stream.waveform().unwrap().analog().unwrap();
        assert_eq!(view.offset_scaled(1), 2_000_000_000);
        assert!((view.value(0) + 90.0).abs() < 1e-4);

        let s11_mag = f.core().stream_index("S11_mag").unwrap();
        let mag = f.core().stream(s11_mag).unwrap().waveform().unwrap().analog().unwrap();
        assert!((mag.value(0) + 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_missing_file_reports_error() {
        let mut f = TouchstoneImportFilter::new("#ffffff");
        load(&mut f, "/nonexistent/path.s2p");
        assert_eq!(f.core().stream_count(), 0);
        assert!(test_support::refresh(&mut f, &[]).is_err());
    }

    #[test]
    fn test_no_file_selected() {
        let mut f = TouchstoneImportFilter::new("#ffffff");
        assert!(matches!(
            test_support::refresh(&mut f, &[]),
            Err(ScopeError::InvalidParameter(_))
        ));
    }
}
