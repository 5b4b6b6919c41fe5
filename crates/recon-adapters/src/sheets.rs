//! Google Sheets financial tracker: one row per client, month, type and category.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use recon_core::{ClientStatus, DependentRecord, FinancialEntry, FinancialType, Provider, RecordBody};
use recon_storage::{Auth, JsonRequest, JsonTransport, RateLimiter};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::normalize;
use crate::pagination::{self, paginate, Page, PageFetcher};
use crate::resolve::{ClientResolver, CreatePolicy};
use crate::{
    json_text, AdapterDeps, AdapterError, Batch, BatchOutcome, BatchStream, Credentials, ProviderSetup, SyncAdapter,
    SyncContext, Written,
};

pub const FINANCIALS: &str = "sheets:financials";

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com";
const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SheetColumns {
    pub client: String,
    pub period: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub category: String,
    pub amount: String,
    pub currency: String,
}

impl Default for SheetColumns {
    fn default() -> Self {
        Self {
            client: "A".into(),
            period: "B".into(),
            record_type: "C".into(),
            category: "D".into(),
            amount: "E".into(),
            currency: "F".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SheetsSettings {
    pub spreadsheet_id: Option<String>,
    /// `Sheet!A:F`; the column span bounds every page request.
    pub range: String,
    pub header_rows: usize,
    pub columns: SheetColumns,
    pub create_clients: bool,
    pub default_category: String,
    pub default_currency: String,
}

impl Default for SheetsSettings {
    fn default() -> Self {
        Self {
            spreadsheet_id: None,
            range: "Sheet1!A:F".into(),
            header_rows: 1,
            columns: SheetColumns::default(),
            create_clients: false,
            default_category: "general".into(),
            default_currency: "USD".into(),
        }
    }
}

/// Zero-based index of a column letter (`A` → 0, `AA` → 26).
fn column_index(letters: &str) -> Option<usize> {
    let letters = letters.trim();
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(
        letters
            .to_ascii_uppercase()
            .bytes()
            .fold(0usize, |acc, b| acc * 26 + usize::from(b - b'A' + 1))
            - 1,
    )
}

/// `Sheet!A:F` → (`Sheet`, `A`, `F`).
fn split_range(range: &str) -> Result<(String, String, String), AdapterError> {
    let (sheet, span) = range.rsplit_once('!').unwrap_or(("Sheet1", range));
    let (first, last) = span
        .split_once(':')
        .ok_or_else(|| AdapterError::Config(format!("sheet range {range} needs a column span")))?;
    let strip = |s: &str| s.trim_end_matches(|c: char| c.is_ascii_digit()).to_string();
    let (first, last) = (strip(first), strip(last));
    if column_index(&first).is_none() || column_index(&last).is_none() {
        return Err(AdapterError::Config(format!("sheet range {range} has bad columns")));
    }
    Ok((sheet.to_string(), first, last))
}

pub struct SheetsFinancials {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: SheetsSettings,
    page_size: usize,
    first_column: usize,
}

impl SheetsFinancials {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        let settings: SheetsSettings = setup.settings()?;
        let (_, first, _) = split_range(&settings.range)?;
        Ok(Self {
            creds: setup.credentials(DEFAULT_BASE_URL),
            first_column: column_index(&first).unwrap_or(0),
            page_size: setup.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
            settings,
            deps,
        })
    }

    fn cell(&self, cells: &[JsonValue], column: &str) -> Option<String> {
        let index = column_index(column)?.checked_sub(self.first_column)?;
        cells.get(index).and_then(json_text)
    }

    async fn apply_row(
        &self,
        row: &JsonValue,
        resolver: &mut ClientResolver<'_>,
        ctx: &SyncContext,
    ) -> Result<Written, AdapterError> {
        let cells = row.get("cells").and_then(JsonValue::as_array).map(Vec::as_slice).unwrap_or_default();
        if cells.iter().all(|c| json_text(c).is_none()) {
            return Ok(Written::Skipped);
        }
        let cols = &self.settings.columns;
        let client_name = self
            .cell(cells, &cols.client)
            .ok_or_else(|| AdapterError::Payload("no client name".into()))?;
        let period_text = self.cell(cells, &cols.period).unwrap_or_default();
        let period = normalize::month(&period_text)
            .ok_or_else(|| AdapterError::Payload(format!("unreadable period {period_text:?}")))?;
        let amount_text = self.cell(cells, &cols.amount).unwrap_or_default();
        let amount = normalize::decimal(&amount_text)
            .ok_or_else(|| AdapterError::Payload(format!("unreadable amount {amount_text:?}")))?;
        let record_type = match self.cell(cells, &cols.record_type) {
            Some(text) => FinancialType::from_str(&text).map_err(|e| AdapterError::Payload(e.to_string()))?,
            None => FinancialType::Revenue,
        };

        let policy = if self.settings.create_clients {
            CreatePolicy::Create(ClientStatus::Active)
        } else {
            CreatePolicy::Never
        };
        let resolution = resolver.resolve(&client_name, None, policy).await?;
        let Some(client_id) = resolution.client_id() else {
            return Ok(Written::Skipped);
        };

        let record = DependentRecord::new(
            client_id,
            Provider::Sheets,
            RecordBody::Financial(FinancialEntry {
                period,
                record_type,
                category: self
                    .cell(cells, &cols.category)
                    .unwrap_or_else(|| self.settings.default_category.clone()),
                amount,
                currency: self
                    .cell(cells, &cols.currency)
                    .unwrap_or_else(|| self.settings.default_currency.clone()),
            }),
            Utc::now(),
        );
        Ok(crate::write_record(self.deps.store.as_ref(), ctx, &record).await?)
    }
}

struct RowPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    spreadsheet_id: String,
    sheet: String,
    first: String,
    last: String,
    first_row: usize,
    page_size: usize,
}

#[async_trait]
impl PageFetcher for RowPages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let start = token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(self.first_row);
        let end = start + self.page_size - 1;
        let range = format!("{}!{}{start}:{}{end}", self.sheet, self.first, self.last);
        let request = JsonRequest::get(
            format!("{}/v4/spreadsheets/{}/values/{range}", self.creds.base_url, self.spreadsheet_id),
            Auth::Bearer(&self.creds.token),
        )
        .throttled(limiter)
        .query("majorDimension", "ROWS")
        .query("valueRenderOption", "FORMATTED_VALUE");
        let body = self.transport.send(request).await?;
        let rows = body.get("values").and_then(JsonValue::as_array).cloned().unwrap_or_default();
        Ok(Page {
            items: rows
                .into_iter()
                .enumerate()
                .map(|(offset, cells)| json!({ "row": start + offset, "cells": cells }))
                .collect(),
            next: Some((start + self.page_size).to_string()),
        })
    }
}

#[async_trait]
impl SyncAdapter for SheetsFinancials {
    fn name(&self) -> &'static str {
        FINANCIALS
    }

    fn provider(&self) -> Provider {
        Provider::Sheets
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        let Some(spreadsheet_id) = self.settings.spreadsheet_id.clone() else {
            debug!("no spreadsheet configured");
            return Ok(pagination::empty());
        };
        let (sheet, first, last) = split_range(&self.settings.range)?;
        let fetcher = RowPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            spreadsheet_id,
            sheet,
            first,
            last,
            first_row: self.settings.header_rows + 1,
            page_size: self.page_size,
        };
        Ok(paginate(fetcher, self.deps.limiter(Provider::Sheets), Some(self.page_size)))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = FINANCIALS, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Sheets).await?;
            let mut outcome = BatchOutcome::default();
            for row in &batch {
                match self.apply_row(row, &mut resolver, ctx).await {
                    Ok(written) => outcome.tally(written),
                    Err(err) => {
                        let number = row.get("row").and_then(json_text).unwrap_or_else(|| "?".into());
                        outcome.fail(format!("row {number}"), err);
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

    fn setup(page_size: usize, create_clients: bool) -> ProviderSetup {
        let mut setup = ProviderSetup::new(SecretString::from("g-token"));
        setup.page_size = Some(page_size);
        setup.settings = json!({
            "spreadsheet_id": "sheet-1",
            "range": "Financials!A:F",
            "create_clients": create_clients
        });
        setup
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_index("A"), Some(0));
        assert_eq!(column_index("f"), Some(5));
        assert_eq!(column_index("AA"), Some(26));
        assert_eq!(column_index("1"), None);
        assert_eq!(
            split_range("Financials!B2:G").unwrap(),
            ("Financials".to_string(), "B".to_string(), "G".to_string())
        );
        assert!(split_range("Financials").is_err());
    }

    #[tokio::test]
    async fn pages_by_row_window_and_skips_unknown_clients() {
        let store = Arc::new(MemoryStore::new());
        let acme = Client::new("Acme Co", ClientStatus::Active, Utc::now());
        store.insert_client(&acme).await.unwrap();

        let transport = ScriptedTransport::new(vec![
            json!({ "values": [
                ["Acme Co", "2024-01", "revenue", "Retainer", "$5,000.00", "USD"],
                ["Nobody Inc", "2024-01", "revenue", "Retainer", "10"]
            ]}),
            json!({ "values": [
                ["ACME CO.", "01/2024", "cost", "Ads", "(1,200)"],
                []
            ]}),
            json!({ "values": [
                ["Acme Co", "sometime", "revenue", "x", "1"]
            ]}),
        ]);
        let adapter = SheetsFinancials::new(deps(store.clone(), transport.clone()), &setup(2, false)).unwrap();
        let (found, outcome) = run(&adapter).await.unwrap();

        assert_eq!(found, 5);
        assert_eq!(outcome.synced, 2);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors, vec!["row 6: unexpected payload: unreadable period \"sometime\"".to_string()]);

        assert!(transport.requests().iter().all(|r| r.throttled));
        let urls = transport.requests().iter().map(|r| r.url.clone()).collect::<Vec<_>>();
        assert!(urls[0].ends_with("/v4/spreadsheets/sheet-1/values/Financials!A2:F3"));
        assert!(urls[1].ends_with("/values/Financials!A4:F5"));
        assert!(urls[2].ends_with("/values/Financials!A6:F7"));

        let rows = store.records_for_client(acme.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let cost = rows
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::Financial(f) if f.record_type == FinancialType::Cost => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cost.amount, dec!(-1200));
        assert_eq!(cost.currency, "USD");
        assert_eq!(store.list_clients().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_rows_keep_the_first() {
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![json!({ "values": [
            ["Hooli", "2024-02", "revenue", "Retainer", "100"],
            ["Hooli", "2024-02-14", "revenue", "retainer", "999"]
        ]})]);
        let adapter = SheetsFinancials::new(deps(store.clone(), transport), &setup(50, true)).unwrap();
        let (_, outcome) = run(&adapter).await.unwrap();

        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.skipped, 1);
        let hooli = &store.list_clients().await.unwrap()[0];
        let rows = store.records_for_client(hooli.id).await.unwrap();
        let RecordBody::Financial(entry) = &rows[0].body else {
            panic!("expected a financial row");
        };
        assert_eq!(entry.amount, dec!(100));
    }
}
