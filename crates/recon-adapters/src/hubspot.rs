//! HubSpot CRM deals: the primary source that seeds canonical clients.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use recon_core::{ClientStatus, Provider};
use recon_storage::{Auth, JsonRequest, JsonTransport, RateLimiter, StoreError};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::normalize;
use crate::pagination::{paginate, Page, PageFetcher};
use crate::resolve::{ClientResolver, CreatePolicy, Resolution};
use crate::{
    json_text, str_at, AdapterDeps, AdapterError, Batch, BatchOutcome, BatchStream, Credentials, ProviderSetup,
    SyncAdapter, SyncContext,
};

pub const DEALS: &str = "hubspot:deals";

const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";
const DEFAULT_PAGE_SIZE: usize = 100;
const DEAL_PROPERTIES: &str = "dealname,dealstage,closedate,amount,industry";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HubspotSettings {
    /// Deal stage id → client status. Unlisted stages fall back to the built-in pipeline names.
    pub stage_status: HashMap<String, ClientStatus>,
}

impl HubspotSettings {
    fn status_for(&self, stage: Option<&str>) -> ClientStatus {
        let Some(stage) = stage else {
            return ClientStatus::Prospect;
        };
        if let Some(status) = self.stage_status.get(stage) {
            return *status;
        }
        match stage.to_ascii_lowercase().as_str() {
            "closedwon" => ClientStatus::Active,
            "closedlost" => ClientStatus::Churned,
            _ => ClientStatus::Prospect,
        }
    }
}

pub struct HubspotDeals {
    deps: AdapterDeps,
    creds: Arc<Credentials>,
    settings: HubspotSettings,
    page_size: usize,
}

impl HubspotDeals {
    pub fn new(deps: AdapterDeps, setup: &ProviderSetup) -> Result<Self, AdapterError> {
        Ok(Self {
            creds: setup.credentials(DEFAULT_BASE_URL),
            settings: setup.settings()?,
            page_size: setup.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, 100),
            deps,
        })
    }

    async fn apply_deal(&self, deal: &JsonValue, resolver: &mut ClientResolver<'_>) -> Result<DealResult, ItemError> {
        let id = deal.get("id").and_then(json_text).ok_or(ItemError::Invalid("deal without id"))?;
        let name = str_at(deal, "/properties/dealname").ok_or(ItemError::Invalid("deal has no name"))?;
        let status = self.settings.status_for(str_at(deal, "/properties/dealstage"));

        let resolution = resolver.resolve(name, Some(&id), CreatePolicy::Create(status)).await?;
        let Some(client_id) = resolution.client_id() else {
            return Ok(DealResult::Unmatched);
        };
        self.refresh_client(client_id, deal, status).await?;
        Ok(match resolution {
            Resolution::Created(_) => DealResult::Created,
            _ => DealResult::Matched,
        })
    }

    /// Promote prospects on won deals and fill blanks; never downgrade an active client.
    async fn refresh_client(&self, client_id: Uuid, deal: &JsonValue, status: ClientStatus) -> Result<(), StoreError> {
        let store = self.deps.store.as_ref();
        let Some(mut client) = store.get_client(client_id).await? else {
            return Ok(());
        };
        let before = client.clone();

        if client.status == ClientStatus::Prospect && status == ClientStatus::Active {
            client.status = ClientStatus::Active;
        }
        if client.status == ClientStatus::Active && client.start_date.is_none() {
            client.start_date = str_at(deal, "/properties/closedate").and_then(normalize::date);
        }
        if client.industry.is_none() {
            client.industry = str_at(deal, "/properties/industry").map(str::to_string);
        }

        if client != before {
            client.updated_at = Utc::now();
            store.update_client(&client).await?;
        }
        Ok(())
    }
}

enum DealResult {
    Created,
    Matched,
    Unmatched,
}

#[derive(Debug, thiserror::Error)]
enum ItemError {
    #[error("{0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct DealPages {
    transport: Arc<dyn JsonTransport>,
    creds: Arc<Credentials>,
    page_size: usize,
}

#[async_trait]
impl PageFetcher for DealPages {
    async fn fetch_page(&self, token: Option<String>, limiter: &RateLimiter) -> Result<Page, AdapterError> {
        let mut request = JsonRequest::get(
            format!("{}/crm/v3/objects/deals", self.creds.base_url),
            Auth::Bearer(&self.creds.token),
        )
        .throttled(limiter)
        .query("limit", self.page_size.to_string())
        .query("properties", DEAL_PROPERTIES);
        if let Some(after) = token {
            request = request.query("after", after);
        }
        let body = self.transport.send(request).await?;
        let items = body
            .get("results")
            .and_then(JsonValue::as_array)
            .cloned()
            .ok_or_else(|| AdapterError::Payload("deals response without results".into()))?;
        Ok(Page {
            items,
            next: str_at(&body, "/paging/next/after").map(str::to_string),
        })
    }
}

#[async_trait]
impl SyncAdapter for HubspotDeals {
    fn name(&self) -> &'static str {
        DEALS
    }

    fn provider(&self) -> Provider {
        Provider::Hubspot
    }

    async fn fetch_all(&self, _ctx: &SyncContext) -> Result<BatchStream, AdapterError> {
        let fetcher = DealPages {
            transport: Arc::clone(&self.deps.transport),
            creds: Arc::clone(&self.creds),
            page_size: self.page_size,
        };
        Ok(paginate(fetcher, self.deps.limiter(Provider::Hubspot), Some(self.page_size)))
    }

    async fn map_and_upsert(&self, batch: Batch, ctx: &SyncContext) -> Result<BatchOutcome, AdapterError> {
        let span = info_span!("map_batch", adapter = DEALS, import_id = %ctx.import_id, items = batch.len());
        async move {
            let mut resolver =
                ClientResolver::load(self.deps.store.as_ref(), &self.deps.matcher, Provider::Hubspot).await?;
            let mut outcome = BatchOutcome::default();
            for deal in &batch {
                let label = deal.get("id").and_then(json_text).unwrap_or_else(|| "deal".to_string());
                match self.apply_deal(deal, &mut resolver).await {
                    Ok(DealResult::Created | DealResult::Matched) => outcome.synced += 1,
                    Ok(DealResult::Unmatched) => outcome.skipped += 1,
                    Err(err) => outcome.fail(format!("deal {label}"), err),
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}
