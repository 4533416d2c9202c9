//! Backend plugin table
//!
//! Maps a plugin name (`"etcd"`, `"memory"`, ...) to the factory that builds
//! the backend. The table is an ordinary value: build it once at the
//! program's entry point and pass it to whoever initializes a registry.

use crate::backend::{Backend, BackendFactory};
use crate::error::{RegistryError, Result};
use crate::options::RegistryOptions;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct BackendPlugins {
    factories: RwLock<HashMap<String, Arc<dyn BackendFactory>>>,
}

impl BackendPlugins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. Fails with `DuplicateBackend` if the name is taken.
    pub fn register(&self, factory: Arc<dyn BackendFactory>) -> Result<()> {
        let mut factories = self.factories.write();
        let name = factory.name().to_string();
        if factories.contains_key(&name) {
            return Err(RegistryError::DuplicateBackend(name));
        }
        factories.insert(name, factory);
        Ok(())
    }

    /// Remove a factory. Fails with `UnknownBackend` if the name is absent.
    pub fn unregister(&self, name: &str) -> Result<()> {
        self.factories
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Look up `name` and connect it with `options`.
    pub async fn init(&self, name: &str, options: &RegistryOptions) -> Result<Arc<dyn Backend>> {
        // Clone out so the lock is not held across the connect.
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBackend(name.to_string()))?;
        factory.connect(options).await
    }
}
