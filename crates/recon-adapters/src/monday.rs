//! monday.com work board: items become deliverables, time entries and role
//! assignments; board users become team members.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use recon_core::{
    ClientStatus, Deliverable, DependentRecord, Provider, RecordBody, RoleAssignment, TeamMember, TimeEntry,
};
use recon_storage::{Auth, JsonRequest, JsonTransport, RateLimiter, StoreError};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::normalize::{self, PersonKind};
use crate::pagination::{self, paginate, Page, PageFetcher};
use crate::resolve::{find_team_member, ClientResolver, CreatePolicy};
use crate::{
    json_text, str_at, write_record, AdapterDeps, AdapterError, Batch, BatchOutcome, BatchStream, Credentials,
    ProviderSetup, SyncAdapter, SyncContext, Written,
};

pub const ITEMS: &str = "monday:items";
pub const USERS: &str = "monday:users";

const DEFAULT_BASE_URL: &str = "https://api.monday.com/v2";
const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_ROLE: &str = "contributor";

const ITEM_FIELDS: &str = "cursor items { id name group { id title } column_values { id text value } }";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MondayColumns {
    pub client: Option<String>,
    pub status: Option<String>,
    pub due_date: Option<String>,
    pub people: Option<String>,
    pub time_tracking: Option<String>,
    pub budget: Option<String>,
    pub labels: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MondaySettings {
    pub board_id: Option<String>,
    pub columns: MondayColumns,
    /// Read the client name from the item's group title rather than the item name.
    pub client_from_group: bool,
    pub default_role: Option<String>,
}

async fn graphql(
    transport: &dyn JsonTransport,
    creds: &Credentials,
    query: &str,
    variables: JsonValue,
    limiter: &RateLimiter,
) -> Result<JsonValue, AdapterError> {
    let request = JsonRequest::post(
        creds.base_url.clone(),
        Auth::Raw(&creds.token),
        json!({ "query": query, "variables": variables }),
    )
    .throttled(limiter);
    let mut body = transport.send(request).await?;
    if let Some(errors) = body.get("errors").and_then(JsonValue::as_array).filter(|e| !e.is_empty()) {
        let message = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AdapterError::Payload(format!("monday graphql: {message}")));
    }
    if let Some(message) = str_at(&body, "/error_message") {
        return Err(AdapterError::Payload(format!("monday graphql: {message}")));
    }
    body.get_mut("data")
        .map(JsonValue::take)
        .ok_or_else(|| AdapterError::Payload("monday response without data".into()))
}

fn column<'a>(item: &'a JsonValue, id: Option<&str>) -> Option<&'a JsonValue> {
    let id = id?;
    item.get("column_values")?
        .as_array()?
        .iter()
        .find(|c| c.get("id").and_then(JsonValue::as_str) == Some(id))
}

/// Display text of a column.
fn column_text(item: &JsonValue, id: Option<&str>) -> Option<String> {
    column(item, id).and_then(|c| c.get("text")).and_then(json_text)
}

/// Raw JSON value of a column (monday sends it JSON-encoded inside a string).
fn column_value(item: &JsonValue, id: Option<&str>) -> Option<String> {
    column(item, id).and_then(|c| c.get("value")).and_then(json_text)
}

pub struct MondayItems {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: MondaySettings,
    page_size: usize,
}

impl MondayItems {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(DEFAULT_BASE_URL),
            settings: setup.settings()?,
            page_size: setup.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 500),
            deps,
        })
    }

    fn client_name<'a>(&self, item: &'a JsonValue) -> Option<(String, Option<&'a str>)> {
        if let Some(name) = column_text(item, self.settings.columns.client.as_deref()) {
            return Some((name, None));
        }
        if self.settings.client_from_group {
            let title = str_at(item, "/group/title")?;
            return Some((title.to_string(), str_at(item, "/group/id")));
        }
        str_at(item, "/name").map(|name| (name.to_string(), None))
    }

    async fn apply_item(
        &self,
        item: &JsonValue,
        resolver: &mut ClientResolver<'_>,
        ctx: &SyncContext,
    ) -> Result<Written, AdapterError> {
        let item_id = item
            .get("id")
            .and_then(json_text)
            .ok_or_else(|| AdapterError::Payload("item without id".into()))?;
        let title = str_at(item, "/name").unwrap_or_default().to_string();
        let (client_name, group_key) = self
            .client_name(item)
            .ok_or_else(|| AdapterError::Payload("item has no client name".into()))?;
        let client_key = group_key.map(str::to_string).unwrap_or_else(|| item_id.clone());

        let resolution = resolver
            .resolve(&client_name, Some(&client_key), CreatePolicy::Create(ClientStatus::Active))
            .await?;
        let Some(client_id) = resolution.client_id() else {
            return Ok(Written::Skipped);
        };

        let cols = &self.settings.columns;
        let store = self.deps.store.as_ref();
        let now = Utc::now();
        let due_date = column_value(item, cols.due_date.as_deref())
            .and_then(|v| normalize::date(&v))
            .or_else(|| column_text(item, cols.due_date.as_deref()).and_then(|t| normalize::date(&t)));

        let deliverable = DependentRecord::new(
            client_id,
            Provider::Monday,
            RecordBody::Deliverable(Deliverable {
                external_id: item_id.clone(),
                title,
                status: column_text(item, cols.status.as_deref()).and_then(|t| normalize::status(&t)),
                due_date,
                labels: column_text(item, cols.labels.as_deref())
                    .and_then(|t| normalize::labels(&t))
                    .unwrap_or_default(),
                budget: column_text(item, cols.budget.as_deref()).and_then(|t| normalize::decimal(&t)),
            }),
            now,
        );
        let written = write_record(store, ctx, &deliverable).await?;

        let members = self.members(item).await?;

        let tracked_value = column_value(item, cols.time_tracking.as_deref());
        let tracked_text = column_text(item, cols.time_tracking.as_deref());
        if tracked_value.is_some() || tracked_text.is_some() {
            let hours = tracked_value
                .as_deref()
                .and_then(normalize::hours)
                .or_else(|| tracked_text.as_deref().and_then(normalize::hours));
            if hours.is_none() {
                debug!(item = %item_id, "unreadable duration, keeping incomplete time entry");
            }
            let entry = DependentRecord::new(
                client_id,
                Provider::Monday,
                RecordBody::TimeEntry(TimeEntry {
                    external_id: item_id.clone(),
                    team_member_id: members.first().copied(),
                    date: due_date,
                    hours,
                    description: str_at(item, "/name").map(str::to_string),
                    incomplete: hours.is_none(),
                }),
                now,
            );
            write_record(store, ctx, &entry).await?;
        }

        let role = column_text(item, cols.role.as_deref())
            .or_else(|| self.settings.default_role.clone())
            .unwrap_or_else(|| DEFAULT_ROLE.to_string());
        for member_id in members {
            let assignment = DependentRecord::new(
                client_id,
                Provider::Monday,
                RecordBody::RoleAssignment(RoleAssignment {
                    team_member_id: member_id,
                    role: role.clone(),
                }),
                now,
            );
            write_record(store, ctx, &assignment).await?;
        }

        Ok(written)
    }

    /// Team members named in the people column; teams and unknown users are ignored.
    async fn members(&self, item: &JsonValue) -> Result<Vec<Uuid>, StoreError> {
        let Some(raw) = column_value(item, self.settings.columns.people.as_deref()) else {
            return Ok(Vec::new());
        };
        let mut ids = Vec::new();
        for person in normalize::people(&raw).unwrap_or_default() {
            if person.kind != PersonKind::Person {
                continue;
            }
            let member = find_team_member(self.deps.store.as_ref(), Provider::Monday, Some(&person.id), None, None).await?;
            if let Some(member) = member {
                ids.push(member.id);
            }
        }
        Ok(ids)
    }
}

struct ItemPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    board_id: String,
    page_size: usize,
}

#[async_trait]
impl PageFetcher for ItemPages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let (query, variables, pointer) = match token {
            None => (
                format!(
                    "query ($board: [ID!], $limit: Int!) {{ boards(ids: $board) {{ items_page(limit: $limit) {{ {ITEM_FIELDS} }} }} }}"
                ),
                json!({ "board": [self.board_id], "limit": self.page_size }),
                "/boards/0/items_page",
            ),
            Some(cursor) => (
                format!(
                    "query ($cursor: String!, $limit: Int!) {{ next_items_page(cursor: $cursor, limit: $limit) {{ {ITEM_FIELDS} }} }}"
                ),
                json!({ "cursor": cursor, "limit": self.page_size }),
                "/next_items_page",
            ),
        };
        let data = graphql(self.transport.as_ref(), &self.creds, &query, variables, limiter).await?;
        let page = data
            .pointer(pointer)
            .ok_or_else(|| AdapterError::Payload(format!("board {} not found", self.board_id)))?;
        Ok(Page {
            items: page.get("items").and_then(JsonValue::as_array).cloned().unwrap_or_default(),
            next: str_at(page, "/cursor").map(str::to_string),
        })
    }
}

#[async_trait]
impl SyncAdapter for MondayItems {
    fn name(&self) -> &'static str {
        ITEMS
    }

    fn provider(&self) -> Provider {
        Provider::Monday
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        let Some(board_id) = self.settings.board_id.clone() else {
            debug!("no monday board configured");
            return Ok(pagination::empty());
        };
        let fetcher = ItemPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            board_id,
            page_size: self.page_size,
        };
        Ok(paginate(fetcher, self.deps.limiter(Provider::Monday), None))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = ITEMS, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Monday).await?;
            let mut outcome = BatchOutcome::default();
            for item in &batch {
                match self.apply_item(item, &mut resolver, ctx).await {
                    Ok(written) => outcome.tally(written),
                    Err(err) => {
                        let label = item.get("id").and_then(json_text).unwrap_or_else(|| "?".into());
                        outcome.fail(format!("item {label}"), err);
                    }
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

pub struct MondayUsers {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    page_size: usize,
}

impl MondayUsers {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(DEFAULT_BASE_URL),
            page_size: setup.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000),
            deps,
        })
    }

    async fn apply_user(&self, user: &JsonValue) -> Result<(), AdapterError> {
        let id = user
            .get("id")
            .and_then(json_text)
            .ok_or_else(|| AdapterError::Payload("user without id".into()))?;
        let name = str_at(user, "/name").ok_or_else(|| AdapterError::Payload("user without name".into()))?;
        let email = str_at(user, "/email");
        let store = self.deps.store.as_ref();

        let now = Utc::now();
        let mut member = find_team_member(store, Provider::Monday, Some(&id), Some(name), email)
            .await?
            .unwrap_or_else(|| TeamMember::new(name, now));
        member.name = name.to_string();
        if email.is_some() {
            member.email = email.map(str::to_string);
        }
        member.active = user.get("enabled").and_then(JsonValue::as_bool).unwrap_or(true);
        member.external_ids.insert(Provider::Monday, id);
        member.updated_at = now;
        store.upsert_team_member(&member).await?;
        Ok(())
    }
}

struct UserPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    page_size: usize,
}

#[async_trait]
impl PageFetcher for UserPages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let page_number = token.as_deref().and_then(|t| t.parse::<u64>().ok()).unwrap_or(1);
        let data = graphql(
            self.transport.as_ref(),
            &self.creds,
            "query ($limit: Int!, $page: Int!) { users(limit: $limit, page: $page) { id name email enabled } }",
            json!({ "limit": self.page_size, "page": page_number }),
            limiter,
        )
        .await?;
        Ok(Page {
            items: data.get("users").and_then(JsonValue::as_array).cloned().unwrap_or_default(),
            next: Some((page_number + 1).to_string()),
        })
    }
}

#[async_trait]
impl SyncAdapter for MondayUsers {
    fn name(&self) -> &'static str {
        USERS
    }

    fn provider(&self) -> Provider {
        Provider::Monday
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        let fetcher = UserPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            page_size: self.page_size,
        };
        Ok(paginate(fetcher, self.deps.limiter(Provider::Monday), Some(self.page_size)))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = USERS, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut outcome = BatchOutcome::default();
            for user in &batch {
                match self.apply_user(user).await {
                    Ok(()) => outcome.synced += 1,
                    Err(err) => {
                        let label = user.get("id").and_then(json_text).unwrap_or_else(|| "?".into());
                        outcome.fail(format!("user {label}"), err);
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
    use recon_core::{Client, RecordKind};
    use recon_storage::{MemoryStore, Store};
    use secrecy::SecretString;

    fn board_setup() -> ProviderSetup {
        let mut setup = ProviderSetup::new(SecretString::from("monday-token"));
        setup.settings = json!({
            "board_id": "42",
            "columns": {
                "status": "status",
                "due_date": "date4",
                "people": "person",
                "time_tracking": "time",
                "budget": "numbers",
                "labels": "dropdown"
            }
        });
        setup
    }

    fn item(id: &str, name: &str, duration: JsonValue) -> JsonValue {
        json!({
            "id": id,
            "name": name,
            "group": { "id": "topics", "title": "Active" },
            "column_values": [
                { "id": "status", "text": "Working on it", "value": "{\"index\":0}" },
                { "id": "date4", "text": "2024-01-15", "value": "{\"date\":\"2024-01-15\"}" },
                { "id": "person", "text": "Dana", "value": "{\"personsAndTeams\":[{\"id\":501,\"kind\":\"person\"},{\"id\":9,\"kind\":\"team\"}]}" },
                { "id": "time", "text": "", "value": duration },
                { "id": "numbers", "text": "2,500", "value": "\"2500\"" },
                { "id": "dropdown", "text": "SEO, Paid", "value": null }
            ]
        })
    }

    async fn seed_member(store: &MemoryStore) -> TeamMember {
        let mut member = TeamMember::new("Dana Reyes", Utc::now());
        member.external_ids.insert(Provider::Monday, "501".into());
        store.upsert_team_member(&member).await.unwrap();
        member
    }

    #[tokio::test]
    async fn items_map_to_deliverables_time_and_roles() {
        let store = Arc::new(MemoryStore::new());
        let member = seed_member(&store).await;
        let acme = Client::new("Acme Co", ClientStatus::Active, Utc::now());
        store.insert_client(&acme).await.unwrap();

        let transport = ScriptedTransport::new(vec![
            json!({ "data": { "boards": [{ "items_page": {
                "cursor": "c-1",
                "items": [item("1001", "Acme Co - Paid Content", json!("{\"running\":false,\"duration\":5400}"))]
            }}]}}),
            json!({ "data": { "next_items_page": {
                "cursor": null,
                "items": [item("1002", "Acme Co - Web Redesign", json!("{\"running\":true}"))]
            }}}),
        ]);
        let adapter = MondayItems::new(deps(store.clone(), transport.clone()), &board_setup()).unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();

        assert_eq!(found, 2);
        assert_eq!(outcome.synced, 2);
        assert_eq!(outcome.failed, 0, "{:?}", outcome.errors);

        let requests = transport.requests();

        assert!(requests.iter().all(|r| r.throttled));
        assert_eq!(requests[0].body.as_ref().unwrap()["variables"]["board"], json!(["42"]));
        assert_eq!(requests[1].body.as_ref().unwrap()["variables"]["cursor"], "c-1");

        let rows = store.records_for_client(acme.id).await.unwrap();
        let count = |kind| rows.iter().filter(|r| r.kind() == kind).count();
        assert_eq!(count(RecordKind::Deliverable), 2);
        assert_eq!(count(RecordKind::TimeEntry), 2);
        assert_eq!(count(RecordKind::RoleAssignment), 1);

        let entries = rows
            .iter()
            .filter_map(|r| match &r.body {
                RecordBody::TimeEntry(t) => Some(t.clone()),
                _ => None,
            })
            .collect::<Vec<_>>();
        let tracked = entries.iter().find(|t| t.external_id == "1001").unwrap();
        assert_eq!(tracked.hours, Some(1.5));
        assert_eq!(tracked.team_member_id, Some(member.id));
        let running = entries.iter().find(|t| t.external_id == "1002").unwrap();
        assert!(running.incomplete);
        assert_eq!(running.hours, None);

        let deliverable = rows
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::Deliverable(d) if d.external_id == "1001" => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(deliverable.status.as_deref(), Some("Working on it"));
        assert_eq!(deliverable.labels, vec!["SEO".to_string(), "Paid".to_string()]);
        assert_eq!(deliverable.budget, Some(rust_decimal_macros::dec!(2500)));
    }

    #[tokio::test]
    async fn no_board_means_no_batches() {
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![]);
        let adapter = MondayItems::new(
            deps(store, transport.clone()),
            &ProviderSetup::new(SecretString::from("t")),
        )
        .unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();
        assert_eq!(found, 0);
        assert_eq!(outcome, BatchOutcome::default());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn graphql_errors_fail_the_run() {
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![json!({ "errors": [{ "message": "Not Authenticated" }] })]);
        let adapter = MondayItems::new(deps(store, transport), &board_setup()).unwrap();
        let err = run(&adapter).await.unwrap_err();
        assert!(err.to_string().contains("Not Authenticated"));
    }

    #[tokio::test]
    async fn users_page_by_number_and_merge_into_members() {
        let store = Arc::new(MemoryStore::new());
        let mut existing = TeamMember::new("dana reyes", Utc::now());
        existing.email = Some("dana@agency.test".into());
        store.upsert_team_member(&existing).await.unwrap();

        let mut setup = ProviderSetup::new(SecretString::from("t"));
        setup.page_size = Some(2);
        let transport = ScriptedTransport::new(vec![
            json!({ "data": { "users": [
                { "id": 501, "name": "Dana Reyes", "email": "dana@agency.test", "enabled": true },
                { "id": 502, "name": "Sam Ortiz", "email": "sam@agency.test", "enabled": false }
            ]}}),
            json!({ "data": { "users": [] } }),
        ]);
        let adapter = MondayUsers::new(deps(store.clone(), transport.clone()), &setup).unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();

        assert_eq!(found, 2);
        assert_eq!(outcome.synced, 2);
        let requests = transport.requests();
        assert!(requests.iter().all(|r| r.throttled));
        assert_eq!(requests[1].body.as_ref().unwrap()["variables"]["page"], 2);

        let members = store.list_team_members().await.unwrap();
        assert_eq!(members.len(), 2);
        let dana = members.iter().find(|m| m.id == existing.id).unwrap();
        assert_eq!(dana.external_ids.get(&Provider::Monday).map(String::as_str), Some("501"));
        assert_eq!(dana.name, "Dana Reyes");
        let sam = members.iter().find(|m| m.name == "Sam Ortiz").unwrap();
        assert!(!sam.active);
    }
}
