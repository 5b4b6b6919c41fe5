//! Persistence contract for the canonical entity graph.

use async_trait::async_trait;
use recon_core::merge::MergePlan;
use recon_core::{Alias, Client, DependentRecord, Provider, SyncImport, TeamMember};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// What an idempotent upsert did with its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The natural key already belongs to a row written by another source; input dropped.
    Conflict,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeApplied {
    pub repointed: usize,
    pub discarded: usize,
    pub aliases_created: usize,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_clients(&self) -> StoreResult<Vec<Client>>;
    async fn get_client(&self, id: Uuid) -> StoreResult<Option<Client>>;
    async fn find_client_by_external_id(&self, source: Provider, external_id: &str) -> StoreResult<Option<Client>>;
    /// Fails with `UniqueViolation` when one of the client's external keys is taken.
    async fn insert_client(&self, client: &Client) -> StoreResult<()>;
    async fn update_client(&self, client: &Client) -> StoreResult<()>;

    async fn list_aliases(&self, source: Option<Provider>) -> StoreResult<Vec<Alias>>;
    /// Returns false when `(lower(alias), source)` already exists.
    async fn insert_alias(&self, alias: &Alias) -> StoreResult<bool>;

    async fn list_team_members(&self) -> StoreResult<Vec<TeamMember>>;
    async fn find_team_member_by_external_id(
        &self,
        source: Provider,
        external_id: &str,
    ) -> StoreResult<Option<TeamMember>>;
    async fn upsert_team_member(&self, member: &TeamMember) -> StoreResult<()>;

    /// Insert or update by `(kind, client_id, scope_key)`. An existing row from a
    /// different source is left alone and reported as `Conflict`.
    async fn upsert_record(&self, record: &DependentRecord) -> StoreResult<UpsertOutcome>;
    async fn records_for_client(&self, client_id: Uuid) -> StoreResult<Vec<DependentRecord>>;
    async fn count_records(&self) -> StoreResult<u64>;

    /// Apply one merge atomically. Records the plan wanted to re-point that now
    /// collide with a primary row are discarded instead.
    async fn apply_merge(&self, plan: &MergePlan) -> StoreResult<MergeApplied>;

    async fn insert_import(&self, import: &SyncImport) -> StoreResult<()>;
    async fn update_import(&self, import: &SyncImport) -> StoreResult<()>;
    async fn get_import(&self, id: Uuid) -> StoreResult<Option<SyncImport>>;
    /// Newest first.
    async fn list_imports(&self, limit: usize) -> StoreResult<Vec<SyncImport>>;
    async fn running_imports(&self, adapter: &str) -> StoreResult<Vec<SyncImport>>;
}
