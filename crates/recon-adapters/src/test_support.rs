use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::TryStreamExt;
use recon_core::matcher::EntityMatcher;
use recon_storage::{FetchError, JsonRequest, JsonTransport, RateLimiters, Store};
use serde_json::Value as JsonValue;

use crate::{AdapterDeps, AdapterError, BatchOutcome, SyncAdapter, SyncContext};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    pub throttled: bool,
}

impl Recorded {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Replays canned responses in order and records what was asked for.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<JsonValue, FetchError>>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<JsonValue>) -> Arc<Self> {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(responses: Vec<Result<JsonValue, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl JsonTransport for ScriptedTransport {
    async fn send(&self, request: JsonRequest<'_>) -> Result<JsonValue, FetchError> {
        if let Some(limiter) = request.limiter {
            limiter.acquire().await;
        }
        self.requests.lock().unwrap().push(Recorded {
            method: request.method.to_string(),
            url: request.url.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
            throttled: request.limiter.is_some(),
        });
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(FetchError::Decode {
                url: request.url,
                message: "no scripted response left".into(),
            })
        })
    }
}

pub fn deps(store: Arc<dyn Store>, transport: Arc<ScriptedTransport>) -> AdapterDeps {
    AdapterDeps {
        store,
        transport,
        limiters: RateLimiters::with_defaults(),
        matcher: Arc::new(EntityMatcher::standard()),
    }
}

/// Fetch every batch and map it, the way the orchestrator would.
pub async fn run(adapter: &dyn SyncAdapter) -> Result<(usize, BatchOutcome), AdapterError> {
    let ctx = SyncContext::new(uuid::Uuid::new_v4(), adapter.name(), chrono::Utc::now());
    let batches: Vec<_> = adapter.fetch_all(&ctx).await?.try_collect().await?;
    let mut found = 0;
    let mut total = BatchOutcome::default();
    for batch in batches {
        found += batch.len();
        let outcome = adapter.map_and_upsert(batch, &ctx).await?;
        total.synced += outcome.synced;
        total.failed += outcome.failed;
        total.skipped += outcome.skipped;
        total.errors.extend(outcome.errors);
    }
    Ok((found, total))
}
