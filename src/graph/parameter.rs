//! Typed node parameters.
//!
//! A [`FilterParameter`] stores one tagged [`ParameterValue`] plus the
//! metadata needed to present and parse it: a [`Unit`], an enum name table
//! and an optional file filter. Setters coerce between representations, so
//! `set_int` on a float parameter stores a float.
//!
//! [`ParameterMap`] owns the parameters of one node, counts changes, and
//! fans change notifications out to `crossbeam_channel` subscribers.

use crate::error::{Result, ScopeError};
use crate::units::Unit;
use crate::util::Bijection;
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tagged parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    String(String),
    Enum(i64),
    Filename(String),
    Bool(bool),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Int(_) => "int",
            ParameterValue::Float(_) => "float",
            ParameterValue::String(_) => "string",
            ParameterValue::Enum(_) => "enum",
            ParameterValue::Filename(_) => "filename",
            ParameterValue::Bool(_) => "bool",
        }
    }

    fn same_type(&self, other: &ParameterValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Extension filter for filename parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFilter {
    pub description: String,
    pub extensions: Vec<String>,
}

impl FileFilter {
    pub fn new(description: impl Into<String>, extensions: &[&str]) -> Self {
        Self {
            description: description.into(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Whether `path` ends in one of the extensions (case-insensitive).
    ///
    /// Extensions may be glob-like (`s*p`), in which case `*` matches any run of digits.
    pub fn accepts(&self, path: &str) -> bool {
        let Some(ext) = std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
        else {
            return false;
        };
        self.extensions.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.split_once('*') {
                Some((pre, post)) => {
                    ext.len() > pre.len() + post.len()
                        && ext.starts_with(pre)
                        && ext.ends_with(post)
                        && ext[pre.len()..ext.len() - post.len()]
                            .chars()
                            .all(|c| c.is_ascii_digit())
                }
                None => ext == pattern,
            }
        })
    }
}

/// One parameter with its presentation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FilterParameter {
    value: ParameterValue,
    unit: Unit,
    enum_names: Bijection<String, i64>,
    file_filter: Option<FileFilter>,
}

impl FilterParameter {
    fn with_value(value: ParameterValue, unit: Unit) -> Self {
        Self {
            value,
            unit,
            enum_names: Bijection::new(),
            file_filter: None,
        }
    }

    pub fn int(value: i64, unit: Unit) -> Self {
        Self::with_value(ParameterValue::Int(value), unit)
    }

    pub fn float(value: f64, unit: Unit) -> Self {
        Self::with_value(ParameterValue::Float(value), unit)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::with_value(ParameterValue::String(value.into()), Unit::Unitless)
    }

    pub fn boolean(value: bool) -> Self {
        Self::with_value(ParameterValue::Bool(value), Unit::Unitless)
    }

    /// Enum parameter from `(name, value)` pairs
    pub fn enumeration(names: &[(&str, i64)], value: i64) -> Self {
        let mut p = Self::with_value(ParameterValue::Enum(value), Unit::Unitless);
        for (name, v) in names {
            p.enum_names.insert(name.to_string(), *v);
        }
        p
    }

    pub fn filename(path: impl Into<String>, filter: FileFilter) -> Self {
        let mut p = Self::with_value(ParameterValue::Filename(path.into()), Unit::Unitless);
        p.file_filter = Some(filter);
        p
    }

    pub fn value(&self) -> &ParameterValue {
        &self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn set_unit(&mut self, unit: Unit) {
        self.unit = unit;
    }

    pub fn enum_names(&self) -> &Bijection<String, i64> {
        &self.enum_names
    }

    pub fn file_filter(&self) -> Option<&FileFilter> {
        self.file_filter.as_ref()
    }

    pub fn as_int(&self) -> i64 {
        match &self.value {
            ParameterValue::Int(v) | ParameterValue::Enum(v) => *v,
            ParameterValue::Float(v) => v.round() as i64,
            ParameterValue::Bool(b) => i64::from(*b),
            ParameterValue::String(s) | ParameterValue::Filename(s) => {
                self.unit.parse_string(s, false).map(|v| v.round() as i64).unwrap_or(0)
            }
        }
    }

    pub fn as_float(&self) -> f64 {
        match &self.value {
            ParameterValue::Int(v) | ParameterValue::Enum(v) => *v as f64,
            ParameterValue::Float(v) => *v,
            ParameterValue::Bool(b) => f64::from(u8::from(*b)),
            ParameterValue::String(s) | ParameterValue::Filename(s) => {
                self.unit.parse_string(s, false).unwrap_or(0.0)
            }
        }
    }

    pub fn as_bool(&self) -> bool {
        match &self.value {
            ParameterValue::Bool(b) => *b,
            ParameterValue::Int(v) | ParameterValue::Enum(v) => *v != 0,
            ParameterValue::Float(v) => *v != 0.0,
            ParameterValue::String(s) | ParameterValue::Filename(s) => parse_bool(s).unwrap_or(false),
        }
    }

    /// Human-readable rendering: enum names, SI-prefixed numbers, raw strings
    pub fn as_string(&self) -> String {
        match &self.value {
            ParameterValue::Int(v) => self.unit.pretty_print(*v as f64, 6, false),
            ParameterValue::Float(v) => self.unit.pretty_print(*v, 6, false),
            ParameterValue::Enum(v) => self
                .enum_names
                .reverse(v)
                .cloned()
                .unwrap_or_else(|| v.to_string()),
            ParameterValue::String(s) | ParameterValue::Filename(s) => s.clone(),
            ParameterValue::Bool(b) => b.to_string(),
        }
    }

    /// Store `v`, converted to this parameter's type
    pub fn set_int(&mut self, v: i64) {
        self.value = match &self.value {
            ParameterValue::Int(_) => ParameterValue::Int(v),
            ParameterValue::Enum(_) => ParameterValue::Enum(v),
            ParameterValue::Float(_) => ParameterValue::Float(v as f64),
            ParameterValue::Bool(_) => ParameterValue::Bool(v != 0),
            ParameterValue::String(_) => ParameterValue::String(v.to_string()),
            ParameterValue::Filename(_) => ParameterValue::Filename(v.to_string()),
        };
    }

    pub fn set_float(&mut self, v: f64) {
        self.value = match &self.value {
            ParameterValue::Int(_) => ParameterValue::Int(v.round() as i64),
            ParameterValue::Enum(_) => ParameterValue::Enum(v.round() as i64),
            ParameterValue::Float(_) => ParameterValue::Float(v),
            ParameterValue::Bool(_) => ParameterValue::Bool(v != 0.0),
            ParameterValue::String(_) => ParameterValue::String(self.unit.pretty_print(v, 6, false)),
            ParameterValue::Filename(_) => ParameterValue::Filename(v.to_string()),
        };
    }

    pub fn set_bool(&mut self, v: bool) {
        self.set_int(i64::from(v));
        if let ParameterValue::String(s) | ParameterValue::Filename(s) = &mut self.value {
            *s = v.to_string();
        }
    }

    /// Parse text according to the parameter type.
    ///
    /// Numbers accept SI prefixes through the unit; enums accept a name or a
    /// number; strings and filenames are stored verbatim.
    pub fn set_from_string(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        match &self.value {
            ParameterValue::Int(_) => {
                let v = self.unit.parse_string(text, false)?;
                self.value = ParameterValue::Int(v.round() as i64);
            }
            ParameterValue::Float(_) => {
                let v = self.unit.parse_string(text, false)?;
                self.value = ParameterValue::Float(v);
            }
            ParameterValue::Enum(_) => {
                let v = match self.enum_names.forward(&text.to_string()) {
                    Some(v) => *v,
                    None => text.parse::<i64>().map_err(|_| {
                        ScopeError::InvalidParameter(format!("'{}' is not a valid choice", text))
                    })?,
                };
                self.value = ParameterValue::Enum(v);
            }
            ParameterValue::Bool(_) => {
                let b = parse_bool(text).ok_or_else(|| {
                    ScopeError::InvalidParameter(format!("'{}' is not a boolean", text))
                })?;
                self.value = ParameterValue::Bool(b);
            }
            ParameterValue::String(_) => self.value = ParameterValue::String(text.to_string()),
            ParameterValue::Filename(_) => self.value = ParameterValue::Filename(text.to_string()),
        }
        Ok(())
    }

    /// Assign a tagged value, coercing it to this parameter's type
    pub fn set_value(&mut self, value: &ParameterValue) -> Result<()> {
        if self.value.same_type(value) {
            self.value = value.clone();
            return Ok(());
        }
        match value {
            ParameterValue::Int(v) | ParameterValue::Enum(v) => self.set_int(*v),
            ParameterValue::Float(v) => self.set_float(*v),
            ParameterValue::Bool(b) => self.set_bool(*b),
            ParameterValue::String(s) | ParameterValue::Filename(s) => self.set_from_string(s)?,
        }
        Ok(())
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Notification sent to subscribers when a parameter changes
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterChange {
    pub name: String,
    pub value: ParameterValue,
}

/// Named parameters of one node
#[derive(Debug, Default)]
pub struct ParameterMap {
    params: BTreeMap<String, FilterParameter>,
    subscribers: Vec<Sender<ParameterChange>>,
    generation: u64,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a parameter. Re-declaring replaces it silently.
    pub fn insert(&mut self, name: impl Into<String>, param: FilterParameter) {
        self.params.insert(name.into(), param);
    }

    pub fn get(&self, name: &str) -> Option<&FilterParameter> {
        self.params.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterParameter)> {
        self.params.iter()
    }

    /// Incremented on every change; used for change detection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Receive a [`ParameterChange`] for every subsequent change
    pub fn subscribe(&mut self) -> Receiver<ParameterChange> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn int(&self, name: &str) -> i64 {
        self.params.get(name).map(FilterParameter::as_int).unwrap_or(0)
    }

    pub fn float(&self, name: &str) -> f64 {
        self.params.get(name).map(FilterParameter::as_float).unwrap_or(0.0)
    }

    pub fn bool(&self, name: &str) -> bool {
        self.params.get(name).is_some_and(FilterParameter::as_bool)
    }

    pub fn string(&self, name: &str) -> String {
        self.params.get(name).map(FilterParameter::as_string).unwrap_or_default()
    }

    /// Raw text of a string or filename parameter
    pub fn text(&self, name: &str) -> String {
        match self.params.get(name).map(FilterParameter::value) {
            Some(ParameterValue::String(s)) | Some(ParameterValue::Filename(s)) => s.clone(),
            Some(_) => self.string(name),
            None => String::new(),
        }
    }

    fn update<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut FilterParameter) -> Result<()>,
    {
        let param = self
            .params
            .get_mut(name)
            .ok_or_else(|| ScopeError::InvalidParameter(format!("no parameter '{}'", name)))?;
        let before = param.value.clone();
        f(param)?;
        if param.value != before {
            self.generation += 1;
            let change = ParameterChange {
                name: name.to_string(),
                value: param.value.clone(),
            };
            self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        }
        Ok(())
    }

    pub fn set_int(&mut self, name: &str, v: i64) -> Result<()> {
        self.update(name, |p| {
            p.set_int(v);
            Ok(())
        })
    }

    pub fn set_float(&mut self, name: &str, v: f64) -> Result<()> {
        self.update(name, |p| {
            p.set_float(v);
            Ok(())
        })
    }

    pub fn set_bool(&mut self, name: &str, v: bool) -> Result<()> {
        self.update(name, |p| {
            p.set_bool(v);
            Ok(())
        })
    }

    pub fn set_from_string(&mut self, name: &str, text: &str) -> Result<()> {
        self.update(name, |p| p.set_from_string(text))
    }

    pub fn set_value(&mut self, name: &str, value: &ParameterValue) -> Result<()> {
        self.update(name, |p| p.set_value(value))
    }
}
