//! Name → factory map for filters.

use super::filter::Filter;
use crate::error::{Result, ScopeError};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Builds a filter with the given display color
pub type FilterFactory = fn(color: &str) -> Box<dyn Filter>;

#[derive(Debug, Clone, Default)]
pub struct FilterRegistry {
    factories: BTreeMap<String, FilterFactory>,
}

static GLOBAL: OnceLock<FilterRegistry> = OnceLock::new();

impl FilterRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in catalog
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::filters::register_builtins(&mut registry);
        registry
    }

    /// Process-wide registry of built-in filters
    pub fn global() -> &'static FilterRegistry {
        GLOBAL.get_or_init(Self::with_builtins)
    }

    pub fn register(&mut self, name: impl Into<String>, factory: FilterFactory) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::warn!("Filter class '{}' registered twice; keeping the later factory", name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create_filter(&self, name: &str, color: &str) -> Result<Box<dyn Filter>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ScopeError::UnknownFilter(name.to_string()))?;
        Ok(factory(color))
    }
}
