//! QuickBooks Online ledger: invoices become monthly revenue, purchase lines
//! monthly cost, per customer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use recon_core::{ClientStatus, DependentRecord, FinancialEntry, FinancialType, Provider, RecordBody};
use recon_storage::{Auth, JsonRequest, JsonTransport, RateLimiter, UpsertOutcome};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::normalize;
use crate::pagination::{self, paginate, Page, PageFetcher};
use crate::resolve::{ClientResolver, CreatePolicy};
use crate::{
    json_text, str_at, AdapterDeps, AdapterError, Batch, BatchOutcome, BatchStream, Credentials, ProviderSetup,
    SyncAdapter, SyncContext, Written,
};

pub const LEDGER: &str = "quickbooks:ledger";

const DEFAULT_BASE_URL: &str = "https://quickbooks.api.intuit.com";
const DEFAULT_PAGE_SIZE: usize = 100;
const MINOR_VERSION: &str = "65";
const ENTITIES: [&str; 2] = ["Invoice", "Purchase"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuickbooksSettings {
    pub realm_id: Option<String>,
    pub revenue_category: String,
    pub cost_category: String,
    pub currency: String,
}

impl Default for QuickbooksSettings {
    fn default() -> Self {
        Self {
            realm_id: None,
            revenue_category: "services".into(),
            cost_category: "expense".into(),
            currency: "USD".into(),
        }
    }
}

pub struct QuickbooksLedger {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: QuickbooksSettings,
    page_size: usize,
}

/// One ledger line already attributed to a customer.
struct LedgerLine {
    customer_id: String,
    customer_name: String,
    period: NaiveDate,
    record_type: FinancialType,
    category: String,
    amount: Decimal,
    currency: String,
}

impl QuickbooksLedger {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(DEFAULT_BASE_URL),
            settings: setup.settings()?,
            page_size: setup.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 1000),
            deps,
        })
    }

    fn lines(&self, entity: &str, row: &JsonValue) -> Result<Vec<LedgerLine>, AdapterError> {
        let txn_date = str_at(row, "/TxnDate")
            .and_then(normalize::date)
            .ok_or_else(|| AdapterError::Payload("missing TxnDate".into()))?;
        let period = FinancialEntry::month_of(txn_date);
        let currency = str_at(row, "/CurrencyRef/value").unwrap_or(&self.settings.currency).to_string();

        match entity {
            "Invoice" => {
                let Some((customer_id, customer_name)) = customer_ref(row.get("CustomerRef")) else {
                    return Ok(Vec::new());
                };
                let amount = amount_of(row.get("TotalAmt"))
                    .ok_or_else(|| AdapterError::Payload("invoice without TotalAmt".into()))?;
                Ok(vec![LedgerLine {
                    customer_id,
                    customer_name,
                    period,
                    record_type: FinancialType::Revenue,
                    category: self.settings.revenue_category.clone(),
                    amount,
                    currency,
                }])
            }
            "Purchase" => {
                let header_customer = row
                    .get("EntityRef")
                    .filter(|r| r.get("type").and_then(JsonValue::as_str) == Some("Customer"));
                let mut lines = Vec::new();
                for line in row.get("Line").and_then(JsonValue::as_array).into_iter().flatten() {
                    let detail = line
                        .get("AccountBasedExpenseLineDetail")
                        .or_else(|| line.get("ItemBasedExpenseLineDetail"));
                    let customer = detail
                        .and_then(|d| d.get("CustomerRef"))
                        .or(header_customer);
                    let Some((customer_id, customer_name)) = customer_ref(customer) else {
                        continue;
                    };
                    let Some(amount) = amount_of(line.get("Amount")) else {
                        continue;
                    };
                    let category = detail
                        .and_then(|d| str_at(d, "/AccountRef/name"))
                        .unwrap_or(&self.settings.cost_category)
                        .to_lowercase();
                    lines.push(LedgerLine {
                        customer_id,
                        customer_name,
                        period,
                        record_type: FinancialType::Cost,
                        category,
                        amount,
                        currency: currency.clone(),
                    });
                }
                Ok(lines)
            }
            other => Err(AdapterError::Payload(format!("unexpected entity {other}"))),
        }
    }

    async fn apply_row(
        &self,
        wrapped: &JsonValue,
        resolver: &mut ClientResolver<'_>,
        ctx: &SyncContext,
    ) -> Result<Written, AdapterError> {
        let entity = str_at(wrapped, "/entity").unwrap_or_default();
        let Some(row) = wrapped.get("row") else {
            return Err(AdapterError::Payload("row missing".into()));
        };
        let lines = self.lines(entity, row)?;

        let mut written = Written::Skipped;
        for line in lines {
            let resolution = resolver
                .resolve(&line.customer_name, Some(&line.customer_id), CreatePolicy::Create(ClientStatus::Active))
                .await?;
            let Some(client_id) = resolution.client_id() else {
                continue;
            };
            if self.write_line(client_id, line, ctx).await? == Written::Synced {
                written = Written::Synced;
            }
        }
        Ok(written)
    }

    /// Upsert the run's running total for the line's key, so several invoices in
    /// the same month and category add up instead of overwriting each other.
    async fn write_line(&self, client_id: Uuid, line: LedgerLine, ctx: &SyncContext) -> Result<Written, AdapterError> {
        let mut record = DependentRecord::new(
            client_id,
            Provider::Quickbooks,
            RecordBody::Financial(FinancialEntry {
                period: line.period,
                record_type: line.record_type,
                category: line.category,
                amount: line.amount,
                currency: line.currency,
            }),
            Utc::now(),
        );
        let total = ctx.accumulate(&record.natural_key(), line.amount).await;
        if let RecordBody::Financial(entry) = &mut record.body {
            entry.amount = total;
        }
        Ok(match self.deps.store.upsert_record(&record).await? {
            UpsertOutcome::Inserted | UpsertOutcome::Updated => Written::Synced,
            UpsertOutcome::Conflict => {
                debug!(scope_key = %record.scope_key(), "financial key owned by another source");
                Written::Skipped
            }
        })
    }
}

fn customer_ref(value: Option<&JsonValue>) -> Option<(String, String)> {
    let value = value?;
    let id = value.get("value").and_then(json_text)?;
    let name = str_at(value, "/name")?.to_string();
    Some((id, name))
}

fn amount_of(value: Option<&JsonValue>) -> Option<Decimal> {
    value.and_then(json_text).and_then(|text| normalize::decimal(&text))
}

struct LedgerPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    realm_id: String,
    page_size: usize,
}

/// `Entity:start` → which query to run next.
fn parse_token(token: Option<&str>) -> (usize, usize) {
    let Some((entity, start)) = token.and_then(|t| t.split_once(':')) else {
        return (0, 1);
    };
    let index = ENTITIES.iter().position(|e| *e == entity).unwrap_or(0);
    (index, start.parse().unwrap_or(1))
}

#[async_trait]
impl PageFetcher for LedgerPages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let (index, start) = parse_token(token.as_deref());
        let entity = ENTITIES[index];
        let request = JsonRequest::get(
            format!("{}/v3/company/{}/query", self.creds.base_url, self.realm_id),
            Auth::Bearer(&self.creds.token),
        )
        .throttled(limiter)
        .query(
            "query",
            format!("SELECT * FROM {entity} STARTPOSITION {start} MAXRESULTS {}", self.page_size),
        )
        .query("minorversion", MINOR_VERSION);
        let body = self.transport.send(request).await?;
        let response = body
            .get("QueryResponse")
            .ok_or_else(|| AdapterError::Payload("ledger response without QueryResponse".into()))?;
        let rows = response.get(entity).and_then(JsonValue::as_array).cloned().unwrap_or_default();

        let next = if rows.len() >= self.page_size {
            Some(format!("{entity}:{}", start + rows.len()))
        } else {
            ENTITIES.get(index + 1).map(|e| format!("{e}:1"))
        };
        Ok(Page {
            items: rows.into_iter().map(|row| json!({ "entity": entity, "row": row })).collect(),
            next,
        })
    }
}

#[async_trait]
impl SyncAdapter for QuickbooksLedger {
    fn name(&self) -> &'static str {
        LEDGER
    }

    fn provider(&self) -> Provider {
        Provider::Quickbooks
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        let Some(realm_id) = self.settings.realm_id.clone() else {
            debug!("no quickbooks realm configured");
            return Ok(pagination::empty());
        };
        let fetcher = LedgerPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            realm_id,
            page_size: self.page_size,
        };
        // Short pages switch entity rather than end the stream.
        Ok(paginate(fetcher, self.deps.limiter(Provider::Quickbooks), None))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = LEDGER, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Quickbooks).await?;
            let mut outcome = BatchOutcome::default();
            for wrapped in &batch {
                match self.apply_row(wrapped, &mut resolver, ctx).await {
                    Ok(written) => outcome.tally(written),
                    Err(err) => {
                        let entity = str_at(wrapped, "/entity").unwrap_or("row");
                        let id = wrapped.pointer("/row/Id").and_then(json_text).unwrap_or_else(|| "?".into());
                        outcome.fail(format!("{entity} {id}"), err);
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
    use recon_core::Client;
    use recon_storage::{MemoryStore, Store};
    use rust_decimal_macros::dec;
    use secrecy::SecretString;

    fn setup(page_size: usize) -> ProviderSetup {
        let mut setup = ProviderSetup::new(SecretString::from("qb-token"));
        setup.page_size = Some(page_size);
        setup.settings = json!({ "realm_id": "9130" });
        setup
    }

    fn invoice(id: &str, customer: (&str, &str), date: &str, total: f64) -> JsonValue {
        json!({
            "Id": id,
            "TxnDate": date,
            "TotalAmt": total,
            "CustomerRef": { "value": customer.0, "name": customer.1 }
        })
    }

    fn financials(rows: &[DependentRecord]) -> Vec<FinancialEntry> {
        rows.iter()
            .filter_map(|r| match &r.body {
                RecordBody::Financial(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn invoices_then_purchases_with_monthly_totals() {
        let store = Arc::new(MemoryStore::new());
        let acme = Client::new("Acme Co", ClientStatus::Active, Utc::now());
        store.insert_client(&acme).await.unwrap();

        let transport = ScriptedTransport::new(vec![
            json!({ "QueryResponse": { "Invoice": [
                invoice("101", ("58", "ACME Co."), "2024-01-05", 1000.0),
                invoice("102", ("58", "ACME Co."), "2024-01-20", 250.5)
            ]}}),
            json!({ "QueryResponse": { "Invoice": [
                invoice("103", ("77", "Umbrella Corp"), "2024-02-01", 400.0)
            ]}}),
            json!({ "QueryResponse": { "Purchase": [{
                "Id": "p1",
                "TxnDate": "2024-01-11",
                "Line": [
                    { "Amount": 120.0, "AccountBasedExpenseLineDetail": {
                        "AccountRef": { "name": "Contractors" },
                        "CustomerRef": { "value": "58", "name": "ACME Co." } } },
                    { "Amount": 30.0, "AccountBasedExpenseLineDetail": {
                        "AccountRef": { "name": "Office" } } }
                ]
            }]}}),
        ]);
        let adapter = QuickbooksLedger::new(deps(store.clone(), transport.clone()), &setup(2)).unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();

        assert_eq!(found, 4);
        assert_eq!(outcome.synced, 4, "{:?}", outcome.errors);
        assert_eq!(outcome.failed, 0);

        assert!(transport.requests().iter().all(|r| r.throttled));
        let queries = transport
            .requests()
            .iter()
            .map(|r| r.param("query").unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            queries,
            vec![
                "SELECT * FROM Invoice STARTPOSITION 1 MAXRESULTS 2",
                "SELECT * FROM Invoice STARTPOSITION 3 MAXRESULTS 2",
                "SELECT * FROM Purchase STARTPOSITION 1 MAXRESULTS 2",
            ]
        );

        let acme_rows = financials(&store.records_for_client(acme.id).await.unwrap());
        let revenue = acme_rows.iter().find(|f| f.record_type == FinancialType::Revenue).unwrap();
        assert_eq!(revenue.amount, dec!(1250.5));
        assert_eq!(revenue.period, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        let cost = acme_rows.iter().find(|f| f.record_type == FinancialType::Cost).unwrap();
        assert_eq!(cost.category, "contractors");
        assert_eq!(cost.amount, dec!(120));

        let umbrella = store.find_client_by_external_id(Provider::Quickbooks, "77").await.unwrap().unwrap();
        assert_eq!(umbrella.name, "Umbrella Corp");
        assert_eq!(store.list_clients().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rerun_replaces_totals_instead_of_doubling() {
        let store = Arc::new(MemoryStore::new());
        let page = || json!({ "QueryResponse": { "Invoice": [invoice("1", ("5", "Hooli"), "2024-03-02", 10.0)] } });
        let empty = || json!({ "QueryResponse": {} });
        let transport = ScriptedTransport::new(vec![page(), empty(), page(), empty()]);
        let adapter = QuickbooksLedger::new(deps(store.clone(), transport), &setup(50)).unwrap();

        run(&adapter).await.unwrap();
        run(&adapter).await.unwrap();

        let hooli = store.find_client_by_external_id(Provider::Quickbooks, "5").await.unwrap().unwrap();
        let rows = financials(&store.records_for_client(hooli.id).await.unwrap());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, dec!(10));
    }

    #[tokio::test]
    async fn invoice_without_date_fails_alone() {
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![
            json!({ "QueryResponse": { "Invoice": [
                { "Id": "7", "TotalAmt": 5, "CustomerRef": { "value": "5", "name": "Hooli" } },
                invoice("8", ("5", "Hooli"), "2024-03-02", 10.0)
            ]}}),
            json!({ "QueryResponse": {} }),
        ]);
        let adapter = QuickbooksLedger::new(deps(store, transport), &setup(50)).unwrap();
        let (_, outcome) = run(&adapter).await.unwrap();
        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.errors[0].starts_with("Invoice 7:"));
    }

    #[test]
    fn token_round_trip() {
        assert_eq!(parse_token(None), (0, 1));
        assert_eq!(parse_token(Some("Invoice:101")), (0, 101));
        assert_eq!(parse_token(Some("Purchase:1")), (1, 1));
    }
}
