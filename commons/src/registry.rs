//! Name-indexed catalog of extension factories.
//!
//! Worker binaries embed the extensions they ship by registering a
//! factory per name; mock mode uses the same catalog to build the
//! extension in the host process.

use crate::dispatch::{Dispatchable, ExtensionContext};
use anyhow::{bail, Result as Fallible};
use std::collections::HashMap;

/// Builds one extension instance from its construction context.
pub type ExtensionFactory =
    Box<dyn Fn(&ExtensionContext) -> Fallible<Box<dyn Dispatchable>> + Send + Sync>;

/// The catalog itself.
#[derive(Default)]
pub struct ExtensionRegistry {
    factories: HashMap<String, ExtensionFactory>,
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        ExtensionRegistry::default()
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: &str, factory: F) -> &mut Self
    where
        F: Fn(&ExtensionContext) -> Fallible<Box<dyn Dispatchable>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    /// True when `name` has a registered factory.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the extension registered under `name`.
    pub fn build(&self, name: &str, context: &ExtensionContext) -> Fallible<Box<dyn Dispatchable>> {
        match self.factories.get(name) {
            Some(factory) => factory(context),
            None => bail!("no extension named '{}' is registered", name),
        }
    }
}
