//! Sync orchestration: configuration, the adapter registry, the run loop,
//! duplicate merging and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use recon_adapters::AdapterDeps;
use recon_core::matcher::EntityMatcher;
use recon_storage::{HttpFetcher, Store};

pub mod config;
pub mod merge;
pub mod registry;
pub mod runner;
pub mod schedule;

pub use config::{ProviderConfig, ProvidersFile, RateLimitConfig, SyncConfig};
pub use merge::{MergeReport, MergeResolver, ReviewCandidate};
pub use registry::AdapterRegistry;
pub use runner::{SyncError, SyncRunner, MAX_ERRORS};
pub use schedule::maybe_build_scheduler;

pub const CRATE_NAME: &str = "recon-sync";

/// Everything a front end needs, wired from configuration.
#[derive(Clone)]
pub struct Engine {
    pub config: SyncConfig,
    pub store: Arc<dyn Store>,
    pub runner: SyncRunner,
    pub resolver: Arc<MergeResolver>,
}

impl Engine {
    pub async fn from_config(config: SyncConfig, store: Arc<dyn Store>) -> Result<Self> {
        let providers = ProvidersFile::load_or_default(&config.providers_file).await?;
        let fetcher = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let matcher = Arc::new(EntityMatcher::standard());
        let deps = AdapterDeps {
            store: Arc::clone(&store),
            transport: Arc::new(fetcher),
            limiters: providers.limiters(),
            matcher: Arc::clone(&matcher),
        };
        let registry = AdapterRegistry::from_providers(&providers, &deps)?;
        Ok(Self::assemble(config, store, registry, matcher))
    }

    pub fn assemble(
        config: SyncConfig,
        store: Arc<dyn Store>,
        registry: AdapterRegistry,
        matcher: Arc<EntityMatcher>,
    ) -> Self {
        let runner = SyncRunner::new(Arc::clone(&store), registry, config.stale_after);
        let resolver = MergeResolver::new(Arc::clone(&store), matcher, config.primary_source)
            .with_review_threshold(config.review_threshold);
        Self {
            config,
            store,
            runner,
            resolver: Arc::new(resolver),
        }
    }
}
