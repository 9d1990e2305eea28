//! Driver name → constructor map, used when rebuilding graphs from documents.

use super::demo::{self, DemoOscilloscope};
use super::Instrument;
use crate::error::{Result, ScopeError};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an instrument from its saved name and connection string
pub type InstrumentConstructor = fn(name: &str, connection: &str) -> Result<Arc<dyn Instrument>>;

#[derive(Debug, Clone, Default)]
pub struct InstrumentFactory {
    drivers: BTreeMap<String, InstrumentConstructor>,
}

fn create_demo(name: &str, _connection: &str) -> Result<Arc<dyn Instrument>> {
    Ok(Arc::new(DemoOscilloscope::new(name)))
}

impl InstrumentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory knowing the drivers shipped with the crate
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register(demo::DRIVER_NAME, create_demo);
        factory
    }

    pub fn register(&mut self, driver: impl Into<String>, constructor: InstrumentConstructor) {
        let driver = driver.into();
        if self.drivers.insert(driver.clone(), constructor).is_some() {
            tracing::warn!("Driver '{}' registered twice; keeping the later constructor", driver);
        }
    }

    pub fn contains(&self, driver: &str) -> bool {
        self.drivers.contains_key(driver)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }

    pub fn create(&self, driver: &str, name: &str, connection: &str) -> Result<Arc<dyn Instrument>> {
        let constructor = self
            .drivers
            .get(driver)
            .ok_or_else(|| ScopeError::Unsupported(format!("no driver named '{}'", driver)))?;
        constructor(name, connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_driver_is_builtin() {
        let factory = InstrumentFactory::with_builtins();
        let scope = factory.create("demo", "bench", "").unwrap();
        assert_eq!(scope.name(), "bench");
        assert_eq!(scope.driver_name(), "demo");
        assert!(factory.drivers().eq(["demo"]));
    }

    #[test]
    fn test_unknown_driver() {
        let factory = InstrumentFactory::with_builtins();
        assert!(matches!(
            factory.create("lecroy", "x", "10.0.0.1"),
            Err(ScopeError::Unsupported(_))
        ));
    }
}
