//! Physical units and SI-prefixed value formatting.
//!
//! A [`Unit`] tags every stream axis and every numeric parameter. It knows
//! how to render a value for humans (`pretty_print`, `pretty_print_range`)
//! and how to parse such text back (`parse_string`).
//!
//! # Storage conventions
//!
//! - [`Unit::Femtoseconds`] values are stored in femtoseconds but rendered in seconds.
//! - [`Unit::Millihertz`] values are stored in millihertz but rendered in hertz.
//! - [`Unit::Millivolts`] values are stored in volts but always rendered as `mV`.
//! - [`Unit::Percent`] values are stored as a fraction (0.5 = 50%).
//! - [`Unit::LogBer`] values are stored as `log10(BER)` and rendered as a BER.
//!
//! Formatting runs under a [`LocaleGuard`] so switching to the display
//! locale never outlives a single call.

pub mod locale;

pub use locale::{
    current_locale, display_locale, set_display_locale, LocaleGuard, NumericLocale,
};

use crate::error::{Result, ScopeError};
use serde::{Deserialize, Serialize};

/// Unit of a value or axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Unit {
    /// Time, stored in femtoseconds
    #[default]
    Femtoseconds,
    Hertz,
    /// Frequency stored in millihertz, displayed in hertz
    Millihertz,
    Volts,
    /// Voltage stored in volts, always displayed in millivolts
    Millivolts,
    Amps,
    Ohms,
    Watts,
    BitsPerSecond,
    /// Dimensionless, SI prefixes allowed
    Unitless,
    /// Dimensionless logarithmic quantity, no prefixes
    UnitlessLog,
    /// log10 of a bit error rate
    LogBer,
    SampleRate,
    SampleDepth,
    /// Stored as a fraction, displayed as a percentage
    Percent,
    Degrees,
    Celsius,
    Db,
    Dbm,
    Ui,
    Rpm,
    Rho,
}

/// SI prefixes understood by the formatter and parser, largest first.
const SI_PREFIXES: &[(&str, f64)] = &[
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("", 1.0),
    ("m", 1e-3),
    ("µ", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
];

impl Unit {
    /// All units, in declaration order.
    pub fn all() -> &'static [Unit] {
        &[
            Unit::Femtoseconds,
            Unit::Hertz,
            Unit::Millihertz,
            Unit::Volts,
            Unit::Millivolts,
            Unit::Amps,
            Unit::Ohms,
            Unit::Watts,
            Unit::BitsPerSecond,
            Unit::Unitless,
            Unit::UnitlessLog,
            Unit::LogBer,
            Unit::SampleRate,
            Unit::SampleDepth,
            Unit::Percent,
            Unit::Degrees,
            Unit::Celsius,
            Unit::Db,
            Unit::Dbm,
            Unit::Ui,
            Unit::Rpm,
            Unit::Rho,
        ]
    }

    /// Suffix appended after the (optional) SI prefix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::Femtoseconds => "s",
            Unit::Hertz | Unit::Millihertz => "Hz",
            Unit::Volts => "V",
            Unit::Millivolts => "V",
            Unit::Amps => "A",
            Unit::Ohms => "Ω",
            Unit::Watts => "W",
            Unit::BitsPerSecond => "b/s",
            Unit::Unitless | Unit::UnitlessLog | Unit::LogBer => "",
            Unit::SampleRate => "Sa/s",
            Unit::SampleDepth => "pts",
            Unit::Percent => "%",
            Unit::Degrees => "°",
            Unit::Celsius => "°C",
            Unit::Db => "dB",
            Unit::Dbm => "dBm",
            Unit::Ui => "UI",
            Unit::Rpm => "RPM",
            Unit::Rho => "ρ",
        }
    }

    /// Whether values of this unit get an SI prefix when displayed.
    pub fn uses_si_prefix(&self) -> bool {
        !matches!(
            self,
            Unit::UnitlessLog
                | Unit::LogBer
                | Unit::Percent
                | Unit::Degrees
                | Unit::Celsius
                | Unit::Db
                | Unit::Dbm
                | Unit::Ui
                | Unit::Rho
        )
    }

    /// Factor converting a stored value into the displayed base unit.
    fn display_scale(&self) -> f64 {
        match self {
            Unit::Femtoseconds => 1e-15,
            Unit::Millihertz => 1e-3,
            Unit::Percent => 100.0,
            _ => 1.0,
        }
    }

    /// Hertz per stored unit if this is a frequency unit
    pub fn hertz_scale(&self) -> Option<f64> {
        match self {
            Unit::Hertz => Some(1.0),
            Unit::Millihertz => Some(1e-3),
            _ => None,
        }
    }

    /// Pick the SI prefix for a value already in display base units.
    fn prefix_for(&self, value: f64) -> (&'static str, f64) {
        if *self == Unit::Millivolts {
            return ("m", 1e-3);
        }
        if !self.uses_si_prefix() {
            return ("", 1.0);
        }
        let mag = value.abs();
        if mag == 0.0 || !mag.is_finite() {
            return ("", 1.0);
        }
        for &(prefix, scale) in SI_PREFIXES {
            if mag >= scale * 0.9999995 {
                return (prefix, scale);
            }
        }
        ("f", 1e-15)
    }

    /// Render `value` with `sigfigs` significant figures and an SI prefix.
    ///
    /// With `use_display_locale` the decimal point follows the user's display
    /// locale for the duration of this call.
    pub fn pretty_print(&self, value: f64, sigfigs: usize, use_display_locale: bool) -> String {
        let _guard = LocaleGuard::for_display(use_display_locale);

        if !value.is_finite() {
            return format!("{} {}", value, self.suffix()).trim_end().to_string();
        }

        if *self == Unit::LogBer {
            let ber = 10f64.powf(value);
            let digits = sigfigs.saturating_sub(1);
            return localize(&format!("{:.*e}", digits, ber));
        }

        let base = value * self.display_scale();
        let (prefix, scale) = self.prefix_for(base);
        let scaled = base / scale;
        let number = format_sigfigs(scaled, sigfigs);
        join_value(&localize(&number), prefix, self.suffix())
    }

    /// Render an axis label for the pixel interval `[pixel_min, pixel_max]`.
    ///
    /// The SI prefix is chosen from the overall axis range; only as many
    /// digits are emitted as are needed to distinguish the two pixel
    /// extrema, and the value is rounded toward `pixel_max`. An interval
    /// spanning zero renders as `0`.
    pub fn pretty_print_range(
        &self,
        pixel_min: f64,
        pixel_max: f64,
        range_min: f64,
        range_max: f64,
    ) -> String {
        let _guard = LocaleGuard::for_display(false);

        if pixel_min <= 0.0 && pixel_max >= 0.0 {
            return "0".to_string();
        }

        let scale_in = self.display_scale();
        let range_mag = (range_min * scale_in).abs().max((range_max * scale_in).abs());
        let (prefix, scale) = self.prefix_for(range_mag);

        let a = pixel_min * scale_in / scale;
        let b = pixel_max * scale_in / scale;

        let mut decimals = 0usize;
        while decimals < 12 {
            let p = 10f64.powi(decimals as i32);
            if (a * p).round() != (b * p).round() {
                break;
            }
            decimals += 1;
        }
        if decimals == 12 {
            return self.pretty_print(pixel_max, 4, false);
        }

        let number = format!("{:.*}", decimals, b);
        join_value(&localize(&number), prefix, self.suffix())
    }

    /// Parse text produced by [`Unit::pretty_print`] (or typed by a user).
    ///
    /// Accepts an optional SI prefix letter (`T G M k m µ u n p f`) after the
    /// number; the unit suffix itself is optional and ignored.
    pub fn parse_string(&self, text: &str, use_display_locale: bool) -> Result<f64> {
        let _guard = LocaleGuard::for_display(use_display_locale);
        let decimal = current_locale().decimal_point;

        let trimmed = text.trim();
        let (number, rest) = split_number(trimmed, decimal);
        if number.is_empty() {
            return Err(ScopeError::Parse(format!("no number in '{}'", text)));
        }
        let normalized: String = number
            .chars()
            .map(|c| if c == decimal { '.' } else { c })
            .collect();
        let mut value: f64 = normalized
            .parse()
            .map_err(|_| ScopeError::Parse(format!("invalid number '{}'", number)))?;

        if *self == Unit::LogBer {
            if value <= 0.0 {
                return Err(ScopeError::Parse(format!("BER must be positive: '{}'", text)));
            }
            return Ok(value.log10());
        }

        let rest = rest.trim_start();
        let mut prefix_scale = 1.0;
        let mut had_prefix = false;
        if self.uses_si_prefix() || *self == Unit::Millivolts {
            if let Some(c) = rest.chars().next() {
                let scale = match c {
                    'T' => Some(1e12),
                    'G' => Some(1e9),
                    'M' => Some(1e6),
                    'k' | 'K' => Some(1e3),
                    'm' => Some(1e-3),
                    'µ' | 'u' | 'μ' => Some(1e-6),
                    'n' => Some(1e-9),
                    'p' => Some(1e-12),
                    'f' => Some(1e-15),
                    _ => None,
                };
                // "pts" starts with 'p' but carries no prefix
                if let Some(scale) = scale {
                    if !self.is_suffix_start(rest) {
                        prefix_scale = scale;
                        had_prefix = true;
                    }
                }
            }
        }

        if *self == Unit::Millivolts && !had_prefix {
            // Bare numbers entered for a millivolt field are millivolts
            prefix_scale = 1e-3;
        }

        value *= prefix_scale;
        Ok(value / self.display_scale())
    }

    /// True if `rest` is exactly this unit's suffix (no prefix present).
    fn is_suffix_start(&self, rest: &str) -> bool {
        let suffix = self.suffix();
        !suffix.is_empty() && rest.starts_with(suffix)
    }

    /// Short stable name used in serialized documents.
    pub fn name(&self) -> &'static str {
        match self {
            Unit::Femtoseconds => "fs",
            Unit::Hertz => "Hz",
            Unit::Millihertz => "mHz",
            Unit::Volts => "V",
            Unit::Millivolts => "mV",
            Unit::Amps => "A",
            Unit::Ohms => "Ohms",
            Unit::Watts => "W",
            Unit::BitsPerSecond => "bps",
            Unit::Unitless => "",
            Unit::UnitlessLog => "log",
            Unit::LogBer => "logber",
            Unit::SampleRate => "Sa/s",
            Unit::SampleDepth => "pts",
            Unit::Percent => "%",
            Unit::Degrees => "deg",
            Unit::Celsius => "degC",
            Unit::Db => "dB",
            Unit::Dbm => "dBm",
            Unit::Ui => "UI",
            Unit::Rpm => "RPM",
            Unit::Rho => "rho",
        }
    }

    /// Inverse of [`Unit::name`].
    pub fn from_name(name: &str) -> Option<Unit> {
        Unit::all().iter().copied().find(|u| u.name() == name)
    }
}

impl std::fmt::Display for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Format with a fixed number of significant figures (no exponent).
fn format_sigfigs(value: f64, sigfigs: usize) -> String {
    let sigfigs = sigfigs.max(1) as i32;
    let mag = value.abs();
    let int_digits = if mag == 0.0 {
        1
    } else {
        (mag.log10() + 1e-9).floor() as i32 + 1
    };
    let decimals = (sigfigs - int_digits).max(0) as usize;
    format!("{:.*}", decimals, value)
}

/// Replace the C decimal point with the current locale's.
fn localize(number: &str) -> String {
    let decimal = current_locale().decimal_point;
    if decimal == '.' {
        number.to_string()
    } else {
        number.replace('.', &decimal.to_string())
    }
}

fn join_value(number: &str, prefix: &str, suffix: &str) -> String {
    if prefix.is_empty() && suffix.is_empty() {
        number.to_string()
    } else if suffix == "%" || suffix == "°" {
        format!("{}{}", number, suffix)
    } else {
        format!("{} {}{}", number, prefix, suffix)
    }
}

/// Split a leading numeric literal (sign, digits, decimal point, exponent)
/// from the rest of the text.
fn split_number(text: &str, decimal: char) -> (&str, &str) {
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_exp = false;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (_, c) = chars[i];
        let accept = if c.is_ascii_digit() {
            seen_digit = true;
            true
        } else if (c == '+' || c == '-') && i == 0 {
            true
        } else if c == decimal && !seen_exp {
            true
        } else if (c == 'e' || c == 'E') && seen_digit && !seen_exp {
            // Only an exponent if a digit (optionally signed) follows
            let next = chars.get(i + 1).map(|&(_, n)| n);
            let next2 = chars.get(i + 2).map(|&(_, n)| n);
            let is_exp = match next {
                Some(n) if n.is_ascii_digit() => true,
                Some('+') | Some('-') => matches!(next2, Some(d) if d.is_ascii_digit()),
                _ => false,
            };
            if is_exp {
                seen_exp = true;
                // consume the sign too
                if matches!(next, Some('+') | Some('-')) {
                    i += 1;
                }
            }
            is_exp
        } else {
            false
        };
        if !accept {
            break;
        }
        end = chars.get(i + 1).map(|&(p, _)| p).unwrap_or(text.len());
        i += 1;
    }
    (&text[..end], &text[end..])
}
