//! Explicit backend registration.
//!
//! The surrounding virtual filesystem consults the registry instead of
//! having backends patch a global operation table at load time. Each
//! backend is registered under a name and owned by the registry.

use std::collections::HashMap;

use tracing::debug;

use crate::{FsBackend, FsError, Result};

/// Named collection of filesystem backends.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Box<dyn FsBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under `name`. Registering a second backend
    /// under an occupied name fails and leaves the first in place.
    pub fn register(&mut self, name: impl Into<String>, backend: Box<dyn FsBackend>) -> Result<()> {
        let name = name.into();
        if self.backends.contains_key(&name) {
            return Err(FsError::AlreadyExists.into());
        }
        debug!(%name, "registering filesystem backend");
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Remove and return the backend registered under `name`.
    pub fn unregister(&mut self, name: &str) -> Option<Box<dyn FsBackend>> {
        self.backends.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn FsBackend> {
        self.backends.get(name).map(|b| &**b)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut dyn FsBackend> {
        // unsize at return position; through `map` the mutable borrow
        // would not coerce to the object type
        match self.backends.get_mut(name) {
            Some(backend) => Some(&mut **backend),
            None => None,
        }
    }

    /// Names of all registered backends, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }
}
