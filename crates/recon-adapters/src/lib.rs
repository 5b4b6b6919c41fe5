//! Sync adapter contract and the provider adapters that implement it.
//!
//! An adapter pairs one external system with one entity type. It exposes the
//! two-phase contract the orchestrator drives: `fetch_all` yields raw batches
//! (pagination and throttling hidden inside), `map_and_upsert` turns one batch
//! into canonical rows and reports per-item results.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use recon_core::matcher::EntityMatcher;
use recon_core::{DependentRecord, NaturalKey, Provider};
use recon_storage::{FetchError, JsonTransport, RateLimiter, RateLimiters, Store, StoreError, UpsertOutcome};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub mod google;
pub mod hubspot;
pub mod monday;
pub mod normalize;
pub mod pagination;
pub mod quickbooks;
pub mod resolve;
pub mod sheets;
pub mod slack;

#[cfg(test)]
mod test_support;

pub const CRATE_NAME: &str = "recon-adapters";

/// Every adapter this crate can build, with the provider whose limiter and credentials it uses.
pub const ADAPTERS: &[(&str, Provider)] = &[
    (hubspot::DEALS, Provider::Hubspot),
    (monday::ITEMS, Provider::Monday),
    (monday::USERS, Provider::Monday),
    (quickbooks::LEDGER, Provider::Quickbooks),
    (sheets::FINANCIALS, Provider::Sheets),
    (slack::MESSAGES, Provider::Slack),
    (google::CALENDAR_EVENTS, Provider::Calendar),
    (google::GMAIL_MESSAGES, Provider::Gmail),
];

pub fn provider_for(adapter: &str) -> Option<Provider> {
    ADAPTERS
        .iter()
        .find(|(name, _)| *name == adapter)
        .map(|(_, provider)| *provider)
}

pub type Batch = Vec<JsonValue>;
pub type BatchStream = BoxStream<'static, Result<Batch, AdapterError>>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unexpected payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Per-run state shared by every batch of one adapter run.
#[derive(Debug)]
pub struct SyncContext {
    pub import_id: Uuid,
    pub adapter: String,
    pub started_at: DateTime<Utc>,
    seen: Mutex<HashSet<NaturalKey>>,
    totals: Mutex<HashMap<NaturalKey, Decimal>>,
}

impl SyncContext {
    pub fn new(import_id: Uuid, adapter: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            import_id,
            adapter: adapter.into(),
            started_at,
            seen: Mutex::new(HashSet::new()),
            totals: Mutex::new(HashMap::new()),
        }
    }

    /// True the first time this run produces `key`; later inputs with the same key lose.
    pub async fn first_sighting(&self, key: &NaturalKey) -> bool {
        self.seen.lock().await.insert(key.clone())
    }

    /// Add `amount` to this run's running total for `key` and return the new total.
    pub async fn accumulate(&self, key: &NaturalKey, amount: Decimal) -> Decimal {
        let mut totals = self.totals.lock().await;
        let total = totals.entry(key.clone()).or_insert(Decimal::ZERO);
        *total += amount;
        *total
    }
}

/// Result of mapping one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub synced: u64,
    pub failed: u64,
    /// Unmatched owners and duplicate-key inputs. Neither is an error.
    pub skipped: u64,
    pub errors: Vec<String>,
}

impl BatchOutcome {
    pub fn fail(&mut self, item: impl Display, err: impl Display) {
        self.failed += 1;
        self.errors.push(format!("{item}: {err}"));
    }

    pub fn tally(&mut self, written: Written) {
        match written {
            Written::Synced => self.synced += 1,
            Written::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Written {
    Synced,
    Skipped,
}

/// Idempotent write of one dependent record; the first input of a run wins its key.
pub async fn write_record(store: &dyn Store, ctx: &SyncContext, record: &DependentRecord) -> Result<Written, StoreError> {
    let key = record.natural_key();
    if !ctx.first_sighting(&key).await {
        debug!(scope_key = %key.scope_key, "duplicate key within run, dropping input");
        return Ok(Written::Skipped);
    }
    match store.upsert_record(record).await? {
        UpsertOutcome::Inserted | UpsertOutcome::Updated => Ok(Written::Synced),
        UpsertOutcome::Conflict => {
            debug!(scope_key = %key.scope_key, "key owned by another source, dropping input");
            Ok(Written::Skipped)
        }
    }
}

/// Connection details for one provider.
#[derive(Debug)]
pub struct Credentials {
    pub token: SecretString,
    pub base_url: String,
}

/// Everything `build_adapter` needs for one provider, as read from configuration.
#[derive(Debug)]
pub struct ProviderSetup {
    pub token: SecretString,
    pub base_url: Option<String>,
    pub page_size: Option<usize>,
    /// Provider-specific mapping tables, decoded by each adapter.
    pub settings: JsonValue,
}

impl ProviderSetup {
    pub fn new(token: SecretString) -> Self {
        Self {
            token,
            base_url: None,
            page_size: None,
            settings: JsonValue::Null,
        }
    }

    fn credentials(&self, default_base: &str) -> Arc<Credentials> {
        let base_url = self
            .base_url
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();
        Arc::new(Credentials {
            token: SecretString::from(self.token.expose_secret().to_owned()),
            base_url,
        })
    }

    fn settings<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T, AdapterError> {
        if self.settings.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.settings.clone()).map_err(|e| AdapterError::Config(e.to_string()))
    }
}

/// Shared services handed to every adapter.
#[derive(Clone)]
pub struct AdapterDeps {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn JsonTransport>,
    pub limiters: RateLimiters,
    pub matcher: Arc<EntityMatcher>,
}

impl AdapterDeps {
    pub fn limiter(&self, provider: Provider) -> Arc<RateLimiter> {
        self.limiters.get(provider)
    }
}

#[async_trait]
pub trait SyncAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn provider(&self) -> Provider;

    /// Lazy, finite stream of raw batches. Empty when nothing is configured to read.
    async fn fetch_all(&self, ctx: &SyncContext) -> Result<BatchStream, AdapterError>;

    /// Map and persist one batch. Item problems land in the outcome; only
    /// adapter-level failures are returned as errors.
    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError>;
}

pub fn build_adapter(
    name: &str,
    deps: AdapterDeps,
    setup: &ProviderSetup,
) -> Result<Arc<dyn SyncAdapter>, AdapterError> {
    let adapter: Arc<dyn SyncAdapter> = match name {
        hubspot::DEALS => Arc::new(hubspot::HubspotDeals::new(deps, setup)?),
        monday::ITEMS => Arc::new(monday::MondayItems::new(deps, setup)?),
        monday::USERS => Arc::new(monday::MondayUsers::new(deps, setup)?),
        quickbooks::LEDGER => Arc::new(quickbooks::QuickbooksLedger::new(deps, setup)?),
        sheets::FINANCIALS => Arc::new(sheets::SheetsFinancials::new(deps, setup)?),
        slack::MESSAGES => Arc::new(slack::SlackMessages::new(deps, setup)?),
        google::CALENDAR_EVENTS => Arc::new(google::CalendarEvents::new(deps, setup)?),
        google::GMAIL_MESSAGES => Arc::new(google::GmailMessages::new(deps, setup)?),
        other => return Err(AdapterError::Config(format!("unknown adapter {other}"))),
    };
    Ok(adapter)
}

/// Lossy text view of a JSON scalar; `null` and empty strings are absent.
pub(crate) fn json_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

pub(crate) fn str_at<'a>(value: &'a JsonValue, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
