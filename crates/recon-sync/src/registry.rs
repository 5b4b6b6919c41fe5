use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use recon_adapters::{build_adapter, AdapterDeps, SyncAdapter, ADAPTERS};
use tracing::warn;

use crate::config::ProvidersFile;

/// Adapters available to the runner, by name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<&'static str, Arc<dyn SyncAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every adapter whose provider is enabled in `providers`.
    pub fn from_providers(providers: &ProvidersFile, deps: &AdapterDeps) -> Result<Self> {
        let mut registry = Self::new();
        for (name, provider) in ADAPTERS {
            if !providers.is_enabled(*provider) {
                continue;
            }
            let setup = match providers.setup_for(*provider) {
                Ok(setup) => setup,
                Err(err) => {
                    warn!(adapter = name, error = %err, "skipping adapter");
                    continue;
                }
            };
            let adapter =
                build_adapter(name, deps.clone(), &setup).with_context(|| format!("building adapter {name}"))?;
            registry.insert(adapter);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, adapter: Arc<dyn SyncAdapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SyncAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
