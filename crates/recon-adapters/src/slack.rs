//! Slack channel history → client communication log. Channels are mapped to
//! clients in configuration; messages never create clients.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_core::{Communication, DependentRecord, Provider, RecordBody};
use recon_storage::{Auth, JsonRequest, JsonTransport, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::pagination::{self, paginate, Page, PageFetcher};
use crate::resolve::{ClientResolver, CreatePolicy};
use crate::{
    str_at, write_record, AdapterDeps, AdapterError, Batch, BatchOutcome, BatchStream, Credentials, ProviderSetup,
    SyncAdapter, SyncContext, Written,
};

pub const MESSAGES: &str = "slack:messages";

const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const DEFAULT_PAGE_SIZE: usize = 200;
const SUMMARY_CHARS: usize = 500;
const IGNORED_SUBTYPES: &[&str] = &["channel_join", "channel_leave", "channel_topic", "channel_purpose"];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SlackSettings {
    /// Channel id → client name.
    pub channels: BTreeMap<String, String>,
}

pub struct SlackMessages {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: SlackSettings,
    page_size: usize,
}

/// Slack `ts` (`"1704067200.000100"`) → UTC timestamp.
fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, micros) = ts.split_once('.').unwrap_or((ts, "0"));
    let secs = secs.parse::<i64>().ok()?;
    let micros = format!("{micros:0<6}").get(..6)?.parse::<u32>().ok()?;
    DateTime::from_timestamp(secs, micros * 1_000)
}

fn summarize(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(SUMMARY_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

impl SlackMessages {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(DEFAULT_BASE_URL),
            settings: setup.settings()?,
            page_size: setup.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000),
            deps,
        })
    }

    async fn apply_message(
        &self,
        wrapped: &JsonValue,
        resolver: &mut ClientResolver<'_>,
        ctx: &SyncContext,
    ) -> Result<Written, AdapterError> {
        let channel = str_at(wrapped, "/channel").unwrap_or_default();
        let Some(message) = wrapped.get("message") else {
            return Err(AdapterError::Payload("message missing".into()));
        };
        if str_at(message, "/subtype").is_some_and(|s| IGNORED_SUBTYPES.contains(&s)) {
            return Ok(Written::Skipped);
        }
        let ts = str_at(message, "/ts").ok_or_else(|| AdapterError::Payload("message without ts".into()))?;
        let sent_at = parse_ts(ts).ok_or_else(|| AdapterError::Payload(format!("bad ts {ts}")))?;

        let Some(client_name) = self.settings.channels.get(channel) else {
            return Ok(Written::Skipped);
        };
        let resolution = resolver.resolve(client_name, None, CreatePolicy::Never).await?;
        let Some(client_id) = resolution.client_id() else {
            return Ok(Written::Skipped);
        };

        let record = DependentRecord::new(
            client_id,
            Provider::Slack,
            RecordBody::Communication(Communication {
                external_id: format!("{channel}:{ts}"),
                channel: channel.to_string(),
                author: str_at(message, "/user")
                    .or_else(|| str_at(message, "/username"))
                    .map(str::to_string),
                sent_at,
                summary: summarize(str_at(message, "/text").unwrap_or_default()),
            }),
            Utc::now(),
        );
        Ok(write_record(self.deps.store.as_ref(), ctx, &record).await?)
    }
}

struct HistoryPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    channels: Vec<String>,
    page_size: usize,
}

#[async_trait]
impl PageFetcher for HistoryPages {
    /// Token is `channel_index|cursor`; an empty cursor starts that channel.
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let (index, cursor) = match token.as_deref().and_then(|t| t.split_once('|')) {
            Some((index, cursor)) => (index.parse::<usize>().unwrap_or(0), cursor.to_string()),
            None => (0, String::new()),
        };
        let Some(channel) = self.channels.get(index) else {
            return Ok(Page::default());
        };

        let mut request = JsonRequest::get(
            format!("{}/conversations.history", self.creds.base_url),
            Auth::Bearer(&self.creds.token),
        )
        .throttled(limiter)
        .query("channel", channel.as_str())
        .query("limit", self.page_size.to_string());
        if !cursor.is_empty() {
            request = request.query("cursor", cursor);
        }
        let body = self.transport.send(request).await?;
        if body.get("ok").and_then(JsonValue::as_bool) != Some(true) {
            let error = str_at(&body, "/error").unwrap_or("unknown error");
            return Err(AdapterError::Payload(format!("slack {channel}: {error}")));
        }

        let items = body
            .get("messages")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .map(|message| json!({ "channel": channel, "message": message }))
            .collect();
        let next = match str_at(&body, "/response_metadata/next_cursor") {
            Some(next) => Some(format!("{index}|{next}")),
            None if index + 1 < self.channels.len() => Some(format!("{}|", index + 1)),
            None => None,
        };
        Ok(Page { items, next })
    }
}

#[async_trait]
impl SyncAdapter for SlackMessages {
    fn name(&self) -> &'static str {
        MESSAGES
    }

    fn provider(&self) -> Provider {
        Provider::Slack
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        if self.settings.channels.is_empty() {
            debug!("no slack channels mapped");
            return Ok(pagination::empty());
        }
        let fetcher = HistoryPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            channels: self.settings.channels.keys().cloned().collect(),
            page_size: self.page_size,
        };
        Ok(paginate(fetcher, self.deps.limiter(Provider::Slack), None))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = MESSAGES, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Slack).await?;
            let mut outcome = BatchOutcome::default();
            for wrapped in &batch {
                match self.apply_message(wrapped, &mut resolver, ctx).await {
                    Ok(written) => outcome.tally(written),
                    Err(err) => {
                        let ts = str_at(wrapped, "/message/ts").unwrap_or("?");
                        outcome.fail(format!("message {ts}"), err);
                    }
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}
