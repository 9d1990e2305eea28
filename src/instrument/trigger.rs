//! Trigger configuration carried by instruments and graph documents.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Edge,
    /// Pulse narrower or wider than `width_fs`
    PulseWidth,
    /// Leaves the band between `level` and `upper_level`
    Window,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSlope {
    #[default]
    Rising,
    Falling,
    Any,
}

/// Trigger subtree: type, source channel and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub trigger_type: TriggerType,
    /// Driver channel index of the trigger source
    pub source: usize,
    /// Volts
    pub level: f64,
    pub upper_level: f64,
    pub slope: EdgeSlope,
    pub width_fs: i64,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            trigger_type: TriggerType::Edge,
            source: 0,
            level: 0.0,
            upper_level: 0.0,
            slope: EdgeSlope::Rising,
            width_fs: 0,
        }
    }
}

impl TriggerSettings {
    pub fn edge(source: usize, level: f64, slope: EdgeSlope) -> Self {
        Self {
            source,
            level,
            slope,
            ..Self::default()
        }
    }

    /// Whether the transition `a -> b` satisfies an edge trigger
    pub fn edge_matches(&self, a: f64, b: f64) -> bool {
        let rising = a < self.level && b >= self.level;
        let falling = a > self.level && b <= self.level;
        match self.slope {
            EdgeSlope::Rising => rising,
            EdgeSlope::Falling => falling,
            EdgeSlope::Any => rising || falling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_matching() {
        let t = TriggerSettings::edge(0, 0.5, EdgeSlope::Rising);
        assert!(t.edge_matches(0.0, 1.0));
        assert!(!t.edge_matches(1.0, 0.0));
        let any = TriggerSettings::edge(0, 0.5, EdgeSlope::Any);
        assert!(any.edge_matches(1.0, 0.0));
    }

    #[test]
    fn test_missing_keys_default() {
        let t: TriggerSettings = serde_json::from_str(r#"{"level": 1.5, "future_key": 3}"#).unwrap();
        assert_eq!(t.level, 1.5);
        assert_eq!(t.slope, EdgeSlope::Rising);
    }
}
