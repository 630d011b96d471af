use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;

/// A backend shared between the registry and whoever is running inference.
///
/// Wrapped in `Mutex` because `DetectorBackend::infer` takes `&mut self`.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Named detector backends available to the application.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    order: Vec<String>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            order: Vec::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        if !self.backends.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered backend names in registration order.
    pub fn list(&self) -> Vec<String> {
        self.order.clone()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
