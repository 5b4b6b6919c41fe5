//! Google Calendar events → meeting log, Gmail messages → communication log.
//! Both attribute items to clients through attendee/correspondent domains and
//! never create clients.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use recon_core::{Communication, DependentRecord, Meeting, Provider, RecordBody};
use recon_storage::{Auth, JsonRequest, JsonTransport, RateLimiter};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::pagination::{paginate, Page, PageFetcher};
use crate::resolve::{ClientResolver, CreatePolicy};
use crate::{
    json_text, str_at, write_record, AdapterDeps, AdapterError, Batch, BatchOutcome, BatchStream, Credentials,
    ProviderSetup, SyncAdapter, SyncContext, Written,
};

pub const CALENDAR_EVENTS: &str = "calendar:events";
pub const GMAIL_MESSAGES: &str = "gmail:messages";

const CALENDAR_BASE_URL: &str = "https://www.googleapis.com";
const GMAIL_BASE_URL: &str = "https://gmail.googleapis.com";
const CALENDAR_PAGE_SIZE: usize = 250;
const GMAIL_PAGE_SIZE: usize = 100;

/// Domain routing shared by both Google adapters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DomainMap {
    /// Email domain → client name.
    pub domains: BTreeMap<String, String>,
    /// Our own domains; never used to pick a client.
    pub internal_domains: Vec<String>,
}

impl DomainMap {
    /// Client name candidates for a set of addresses, mapped domains first,
    /// then the bare stem of each external domain (`acme.com` → `acme`).
    fn candidates<'a>(&self, addresses: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let internal = self
            .internal_domains
            .iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .collect::<HashSet<_>>();
        let mut mapped = Vec::new();
        let mut stems = Vec::new();
        for address in addresses {
            let Some(domain) = domain_of(address) else {
                continue;
            };
            if internal.contains(&domain) {
                continue;
            }
            if let Some(name) = self.domains.get(&domain) {
                mapped.push(name.clone());
            } else if let Some(stem) = domain.split('.').next().filter(|s| !s.is_empty()) {
                stems.push(stem.to_string());
            }
        }
        mapped.extend(stems);
        mapped.dedup();
        mapped
    }
}

fn domain_of(address: &str) -> Option<String> {
    let (_, domain) = address.trim().rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

/// `"Dana <dana@acme.com>, ops@acme.com"` → bare addresses.
fn addresses(header: &str) -> Vec<String> {
    header
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let address = match (part.find('<'), part.rfind('>')) {
                (Some(open), Some(close)) if open < close => &part[open + 1..close],
                _ => part,
            };
            address.contains('@').then(|| address.trim().to_string())
        })
        .collect()
}

async fn resolve_any(
    resolver: &mut ClientResolver<'_>,
    candidates: &[String],
) -> Result<Option<uuid::Uuid>, AdapterError> {
    for name in candidates {
        if let Some(id) = resolver.resolve(name, None, CreatePolicy::Never).await?.client_id() {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

/// `{"dateTime": rfc3339}` or all-day `{"date": "YYYY-MM-DD"}`.
fn event_time(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    let value = value?;
    if let Some(at) = str_at(value, "/dateTime") {
        return DateTime::parse_from_rfc3339(at).ok().map(|dt| dt.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(str_at(value, "/date")?, "%Y-%m-%d").ok()?;
    Some(day.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Simple `items` + `nextPageToken` listing used by both APIs.
struct TokenPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    path: String,
    params: Vec<(String, String)>,
}

impl TokenPages {
    async fn list(&self, token: Option<String>, items_key: &str, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let mut request = JsonRequest::get(
            format!("{}{}", self.creds.base_url, self.path),
            Auth::Bearer(&self.creds.token),
        )
        .throttled(limiter);
        for (key, value) in &self.params {
            request = request.query(key.as_str(), value.as_str());
        }
        if let Some(token) = token {
            request = request.query("pageToken", token);
        }
        let body = self.transport.send(request).await?;
        Ok(Page {
            items: body.get(items_key).and_then(JsonValue::as_array).cloned().unwrap_or_default(),
            next: str_at(&body, "/nextPageToken").map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarSettings {
    pub calendar_id: String,
    /// RFC 3339 lower bound passed as `timeMin`.
    pub time_min: Option<String>,
    #[serde(flatten)]
    pub routing: DomainMap,
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            calendar_id: "primary".into(),
            time_min: None,
            routing: DomainMap::default(),
        }
    }
}

pub struct CalendarEvents {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: CalendarSettings,
    page_size: usize,
}

impl CalendarEvents {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(CALENDAR_BASE_URL),
            settings: setup.settings()?,
            page_size: setup.page_size.unwrap_or(CALENDAR_PAGE_SIZE).clamp(1, 2500),
            deps,
        })
    }

    async fn apply_event(
        &self,
        event: &JsonValue,
        resolver: &mut ClientResolver<'_>,
        ctx: &SyncContext,
    ) -> Result<Written, AdapterError> {
        if str_at(event, "/status") == Some("cancelled") {
            return Ok(Written::Skipped);
        }
        let id = str_at(event, "/id").ok_or_else(|| AdapterError::Payload("event without id".into()))?;
        let starts_at =
            event_time(event.get("start")).ok_or_else(|| AdapterError::Payload("event without start".into()))?;
        let title = str_at(event, "/summary").unwrap_or("(untitled)").to_string();
        let attendees = event
            .get("attendees")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|a| str_at(a, "/email").map(str::to_string))
            .collect::<Vec<_>>();

        let mut candidates = self.settings.routing.candidates(attendees.iter().map(String::as_str));
        candidates.push(title.clone());
        let Some(client_id) = resolve_any(resolver, &candidates).await? else {
            return Ok(Written::Skipped);
        };

        let record = DependentRecord::new(
            client_id,
            Provider::Calendar,
            RecordBody::Meeting(Meeting {
                external_id: id.to_string(),
                title,
                starts_at,
                ends_at: event_time(event.get("end")),
                attendees,
            }),
            Utc::now(),
        );
        Ok(write_record(self.deps.store.as_ref(), ctx, &record).await?)
    }
}

struct EventPages(TokenPages);

#[async_trait]
impl PageFetcher for EventPages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        self.0.list(token, "items", limiter).await
    }
}

#[async_trait]
impl SyncAdapter for CalendarEvents {
    fn name(&self) -> &'static str {
        CALENDAR_EVENTS
    }

    fn provider(&self) -> Provider {
        Provider::Calendar
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        let mut params = vec![
            ("maxResults".to_string(), self.page_size.to_string()),
            ("singleEvents".to_string(), "true".to_string()),
            ("orderBy".to_string(), "startTime".to_string()),
        ];
        if let Some(time_min) = &self.settings.time_min {
            params.push(("timeMin".to_string(), time_min.clone()));
        }
        let fetcher = EventPages(TokenPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            path: format!("/calendar/v3/calendars/{}/events", self.settings.calendar_id),
            params,
        });
        Ok(paginate(fetcher, self.deps.limiter(Provider::Calendar), None))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = CALENDAR_EVENTS, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Calendar).await?;
            let mut outcome = BatchOutcome::default();
            for event in &batch {
                match self.apply_event(event, &mut resolver, ctx).await {
                    Ok(written) => outcome.tally(written),
                    Err(err) => {
                        let id = str_at(event, "/id").unwrap_or("?");
                        outcome.fail(format!("event {id}"), err);
                    }
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    pub query: String,
    pub user_id: String,
    #[serde(flatten)]
    pub routing: DomainMap,
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            query: "newer_than:30d".into(),
            user_id: "me".into(),
            routing: DomainMap::default(),
        }
    }
}

pub struct GmailMessages {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: GmailSettings,
    page_size: usize,
}

fn header<'a>(message: &'a JsonValue, name: &str) -> Option<&'a str> {
    message
        .pointer("/payload/headers")?
        .as_array()?
        .iter()
        .find(|h| h.get("name").and_then(JsonValue::as_str).is_some_and(|n| n.eq_ignore_ascii_case(name)))
        .and_then(|h| str_at(h, "/value"))
}

impl GmailMessages {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(GMAIL_BASE_URL),
            settings: setup.settings()?,
            page_size: setup.page_size.unwrap_or(GMAIL_PAGE_SIZE).clamp(1, 500),
            deps,
        })
    }

    async fn apply_message(
        &self,
        message: &JsonValue,
        resolver: &mut ClientResolver<'_>,
        ctx: &SyncContext,
    ) -> Result<Written, AdapterError> {
        let id = str_at(message, "/id").ok_or_else(|| AdapterError::Payload("message without id".into()))?;
        let sent_at = message
            .get("internalDate")
            .and_then(json_text)
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| AdapterError::Payload("message without internalDate".into()))?;

        let from = header(message, "From");
        let mut correspondents = Vec::new();
        for name in ["From", "To", "Cc"] {
            correspondents.extend(header(message, name).map(addresses).unwrap_or_default());
        }
        let candidates = self.settings.routing.candidates(correspondents.iter().map(String::as_str));
        let Some(client_id) = resolve_any(resolver, &candidates).await? else {
            return Ok(Written::Skipped);
        };

        let subject = header(message, "Subject").unwrap_or("(no subject)");
        let summary = match str_at(message, "/snippet") {
            Some(snippet) => format!("{subject}: {snippet}"),
            None => subject.to_string(),
        };
        let record = DependentRecord::new(
            client_id,
            Provider::Gmail,
            RecordBody::Communication(Communication {
                external_id: id.to_string(),
                channel: "email".into(),
                author: from.map(str::to_string),
                sent_at,
                summary,
            }),
            Utc::now(),
        );
        Ok(write_record(self.deps.store.as_ref(), ctx, &record).await?)
    }
}

/// Lists message ids, then fetches each message's metadata under the same limiter.
struct MessagePages {
    listing: TokenPages,
}

#[async_trait]
impl PageFetcher for MessagePages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let listed = self.listing.list(token, "messages", limiter).await?;
        let mut items = Vec::with_capacity(listed.items.len());
        for stub in &listed.items {
            let Some(id) = str_at(stub, "/id") else {
                continue;
            };
            let request = JsonRequest::get(
                format!("{}{}/{id}", self.listing.creds.base_url, self.listing.path),
                Auth::Bearer(&self.listing.creds.token),
            )
            .throttled(limiter)
            .query("format", "metadata")
            .query("metadataHeaders", "From")
            .query("metadataHeaders", "To")
            .query("metadataHeaders", "Cc")
            .query("metadataHeaders", "Subject");
            items.push(self.listing.transport.send(request).await?);
        }
        Ok(Page { items, next: listed.next })
    }
}

#[async_trait]
impl SyncAdapter for GmailMessages {
    fn name(&self) -> &'static str {
        GMAIL_MESSAGES
    }

    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        if self.settings.routing.domains.is_empty() {
            debug!("no gmail domains mapped, matching on domain stems only");
        }
        let fetcher = MessagePages {
            listing: TokenPages {
                transport: Arc::clone(&self.deps.transport),
                creds: Arc::clone(&self.creds),
                path: format!("/gmail/v1/users/{}/messages", self.settings.user_id),
                params: vec![
                    ("q".to_string(), self.settings.query.clone()),
                    ("maxResults".to_string(), self.page_size.to_string()),
                ],
            },
        };
        Ok(paginate(fetcher, self.deps.limiter(Provider::Gmail), None))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = GMAIL_MESSAGES, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Gmail).await?;
            let mut outcome = BatchOutcome::default();
            for message in &batch {
                match self.apply_message(message, &mut resolver, ctx).await {
                    Ok(written) => outcome.tally(written),
                    Err(err) => {
                        let id = str_at(message, "/id").unwrap_or("?");
                        outcome.fail(format!("message {id}"), err);
                    }
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{deps, run, ScriptedTransport};
    use recon_core::{Client, ClientStatus};
    use recon_storage::{MemoryStore, Store};
    use secrecy::SecretString;
    use serde_json::json;

    fn routing() -> JsonValue {
        json!({
            "domains": { "acme.com": "Acme Co" },
            "internal_domains": ["agency.test"]
        })
    }

    async fn store_with(names: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for name in names {
            store
                .insert_client(&Client::new(*name, ClientStatus::Active, Utc::now()))
                .await
                .unwrap();
        }
        store
    }

    #[test]
    fn parses_address_headers() {
        assert_eq!(
            addresses("Dana Reyes <dana@acme.com>, ops@Globex.io, not-an-address"),
            vec!["dana@acme.com".to_string(), "ops@Globex.io".to_string()]
        );
        assert_eq!(domain_of("ops@Globex.io"), Some("globex.io".into()));
    }

    #[test]
    fn internal_domains_never_route() {
        let map: DomainMap = serde_json::from_value(routing()).unwrap();
        let names = map.candidates(["me@agency.test", "x@globex.io", "y@acme.com"]);
        assert_eq!(names, vec!["Acme Co".to_string(), "globex".to_string()]);
    }

    #[test]
    fn all_day_events_start_at_midnight() {
        let at = event_time(Some(&json!({ "date": "2024-03-01" }))).unwrap();
        assert_eq!(at.to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert!(event_time(Some(&json!({}))).is_none());
    }

    #[tokio::test]
    async fn calendar_routes_by_domain_then_title() {
        let store = store_with(&["Acme Co", "Globex"]).await;
        let mut setup = ProviderSetup::new(SecretString::from("g"));
        setup.settings = routing();
        let transport = ScriptedTransport::new(vec![
            json!({
                "items": [
                    { "id": "e1", "summary": "Weekly sync", "start": { "dateTime": "2024-03-01T15:00:00Z" },
                      "end": { "dateTime": "2024-03-01T15:30:00Z" },
                      "attendees": [{ "email": "me@agency.test" }, { "email": "dana@acme.com" }] },
                    { "id": "e2", "status": "cancelled" }
                ],
                "nextPageToken": "p2"
            }),
            json!({ "items": [
                { "id": "e3", "summary": "Globex - Quarterly Review", "start": { "date": "2024-03-04" } },
                { "id": "e4", "summary": "Dentist", "start": { "date": "2024-03-05" } },
                { "id": "e5", "summary": "No start" }
            ]}),
        ]);
        let adapter = CalendarEvents::new(deps(store.clone(), transport.clone()), &setup).unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();

        assert_eq!(found, 5);
        assert_eq!(outcome.synced, 2);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(store.count_records().await.unwrap(), 2);
        assert_eq!(store.list_clients().await.unwrap().len(), 2);

        let requests = transport.requests();

        assert!(requests.iter().all(|r| r.throttled));
        assert!(requests[0].url.ends_with("/calendar/v3/calendars/primary/events"));
        assert_eq!(requests[0].param("singleEvents"), Some("true"));
        assert_eq!(requests[1].param("pageToken"), Some("p2"));
    }

    #[tokio::test]
    async fn gmail_fetches_metadata_per_listed_message() {
        let store = store_with(&["Acme Co"]).await;
        let mut setup = ProviderSetup::new(SecretString::from("g"));
        setup.settings = routing();
        let message = |id: &str, from: &str| {
            json!({
                "id": id,
                "internalDate": "1709305200000",
                "snippet": "Attached the brief",
                "payload": { "headers": [
                    { "name": "From", "value": from },
                    { "name": "To", "value": "me@agency.test" },
                    { "name": "Subject", "value": "Q2 plan" }
                ]}
            })
        };
        let transport = ScriptedTransport::new(vec![
            json!({ "messages": [{ "id": "m1" }, { "id": "m2" }] }),
            message("m1", "Dana <dana@acme.com>"),
            message("m2", "Stranger <who@unknown.org>"),
        ]);
        let adapter = GmailMessages::new(deps(store.clone(), transport.clone()), &setup).unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();

        assert_eq!(found, 2);
        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.skipped, 1);

        let requests = transport.requests();

        assert!(requests.iter().all(|r| r.throttled));
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].param("q"), Some("newer_than:30d"));
        assert!(requests[1].url.ends_with("/gmail/v1/users/me/messages/m1"));
        assert_eq!(requests[1].param("format"), Some("metadata"));

        let acme = &store.list_clients().await.unwrap()[0];
        let rows = store.records_for_client(acme.id).await.unwrap();
        let RecordBody::Communication(mail) = &rows[0].body else {
            panic!("expected a communication");
        };
        assert_eq!(mail.summary, "Q2 plan: Attached the brief");
        assert_eq!(mail.author.as_deref(), Some("Dana <dana@acme.com>"));
    }
}
