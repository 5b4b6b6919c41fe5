//! Environment settings and the `providers.yaml` registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use recon_adapters::{ProviderSetup, ADAPTERS};
use recon_core::Provider;
use recon_storage::{HttpClientConfig, RateLimiter, RateLimiters};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::fs;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub providers_file: PathBuf,
    pub primary_source: Provider,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub stale_after: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub merge_cron: String,
    pub web_port: u16,
    pub review_threshold: f64,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            providers_file: std::env::var("RECON_PROVIDERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("providers.yaml")),
            primary_source: env_parse("RECON_PRIMARY_SOURCE").unwrap_or(Provider::Hubspot),
            http_timeout_secs: env_parse("RECON_HTTP_TIMEOUT_SECS").unwrap_or(20),
            user_agent: std::env::var("RECON_USER_AGENT").unwrap_or_else(|_| "recon-sync/0.1".to_string()),
            stale_after: Duration::from_secs(env_parse("RECON_STALE_RUN_SECS").unwrap_or(1800)),
            scheduler_enabled: std::env::var("RECON_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string()),
            merge_cron: std::env::var("MERGE_CRON").unwrap_or_else(|_| "0 30 2 * * *".to_string()),
            web_port: env_parse("RECON_WEB_PORT").unwrap_or(8000),
            review_threshold: env_parse("RECON_MERGE_REVIEW_THRESHOLD").unwrap_or(0.85),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Name of the environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub settings: JsonValue,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub providers: BTreeMap<Provider, ProviderConfig>,
}

impl ProvidersFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// A missing file means no providers are configured.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            tracing::warn!(path = %path.display(), "providers file not found, no adapters enabled");
            Ok(Self::default())
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        self.providers.get(&provider).is_some_and(|p| p.enabled)
    }

    /// Adapter names whose provider is enabled, in registry order.
    pub fn enabled_adapters(&self) -> Vec<&'static str> {
        ADAPTERS
            .iter()
            .filter(|(_, provider)| self.is_enabled(*provider))
            .map(|(name, _)| *name)
            .collect()
    }

    /// Built-in limits, overridden per provider by `rate_limit`.
    pub fn limiters(&self) -> RateLimiters {
        let mut limiters = RateLimiters::with_defaults();
        for (provider, config) in &self.providers {
            if let Some(limit) = config.rate_limit {
                limiters.insert(
                    *provider,
                    RateLimiter::new(limit.max_requests.max(1), Duration::from_millis(limit.window_ms.max(1))),
                );
            }
        }
        limiters
    }

    pub fn setup_for(&self, provider: Provider) -> Result<ProviderSetup> {
        let config = self
            .providers
            .get(&provider)
            .with_context(|| format!("provider {provider} is not configured"))?;
        let token = match &config.token_env {
            Some(var) => std::env::var(var).with_context(|| format!("{var} is not set for provider {provider}"))?,
            None => String::new(),
        };
        let mut setup = ProviderSetup::new(SecretString::from(token));
        setup.base_url = config.base_url.clone();
        setup.page_size = config.page_size;
        setup.settings = config.settings.clone();
        Ok(setup)
    }
}
