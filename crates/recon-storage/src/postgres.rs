//! PostgreSQL `Store` over runtime `sqlx` queries.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use recon_core::merge::MergePlan;
use recon_core::{
    Alias, Client, ClientStatus, DependentRecord, Provider, RecordBody, SyncImport, SyncStatus, TeamMember,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::store::{MergeApplied, Store, StoreError, StoreResult, UpsertOutcome};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running recon migrations")?;
        Ok(())
    }

    async fn client_keys(&self, client_id: Option<Uuid>) -> StoreResult<HashMap<Uuid, BTreeMap<Provider, String>>> {
        let rows = sqlx::query(
            r#"
            SELECT client_id, provider, external_id
              FROM client_external_keys
             WHERE ($1::uuid IS NULL OR client_id = $1)
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;

        let mut keys: HashMap<Uuid, BTreeMap<Provider, String>> = HashMap::new();
        for row in rows {
            let client_id: Uuid = row.try_get("client_id")?;
            keys.entry(client_id)
                .or_default()
                .insert(parse_provider(&row, "provider")?, row.try_get("external_id")?);
        }
        Ok(keys)
    }

    async fn member_keys(&self) -> StoreResult<HashMap<Uuid, BTreeMap<Provider, String>>> {
        let rows = sqlx::query("SELECT member_id, provider, external_id FROM team_member_external_keys")
            .fetch_all(&self.pool)
            .await?;
        let mut keys: HashMap<Uuid, BTreeMap<Provider, String>> = HashMap::new();
        for row in rows {
            let member_id: Uuid = row.try_get("member_id")?;
            keys.entry(member_id)
                .or_default()
                .insert(parse_provider(&row, "provider")?, row.try_get("external_id")?);
        }
        Ok(keys)
    }
}

fn unique_or(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::UniqueViolation(what()),
        _ => StoreError::Database(err),
    }
}

fn parse_provider(row: &PgRow, column: &str) -> StoreResult<Provider> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: recon_core::ParseEnumError| StoreError::Corrupt(e.to_string()))
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn to_u64(row: &PgRow, column: &str) -> StoreResult<u64> {
    let n: i64 = row.try_get(column)?;
    Ok(n.max(0) as u64)
}

fn client_from_row(row: &PgRow, external_ids: BTreeMap<Provider, String>) -> StoreResult<Client> {
    let status: String = row.try_get("status")?;
    Ok(Client {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: status
            .parse::<ClientStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        external_ids,
        industry: row.try_get("industry")?,
        notes: row.try_get("notes")?,
        start_date: row.try_get::<Option<NaiveDate>, _>("start_date")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> StoreResult<DependentRecord> {
    let body: JsonValue = row.try_get("body")?;
    let body: RecordBody = serde_json::from_value(body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(DependentRecord {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        source: parse_provider(row, "source")?,
        body,
        updated_at: row.try_get("updated_at")?,
    })
}

fn import_from_row(row: &PgRow) -> StoreResult<SyncImport> {
    let status: String = row.try_get("status")?;
    let errors: JsonValue = row.try_get("errors")?;
    Ok(SyncImport {
        id: row.try_get("id")?,
        provider: parse_provider(row, "provider")?,
        adapter: row.try_get("adapter")?,
        status: status
            .parse::<SyncStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        records_found: to_u64(row, "records_found")?,
        records_synced: to_u64(row, "records_synced")?,
        records_failed: to_u64(row, "records_failed")?,
        records_skipped: to_u64(row, "records_skipped")?,
        current_step: row.try_get("current_step")?,
        errors: serde_json::from_value(errors).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        started_at: row.try_get("started_at")?,
        updated_at: row.try_get("updated_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
    })
}

async fn write_client_keys(
    tx: &mut Transaction<'_, Postgres>,
    client_id: Uuid,
    keys: &BTreeMap<Provider, String>,
) -> StoreResult<()> {
    for (provider, external_id) in keys {
        sqlx::query("INSERT INTO client_external_keys (client_id, provider, external_id) VALUES ($1, $2, $3)")
            .bind(client_id)
            .bind(provider.as_str())
            .bind(external_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| unique_or(e, || format!("client external key {provider}:{external_id}")))?;
    }
    Ok(())
}

const CLIENT_COLUMNS: &str = "id, name, status, industry, notes, start_date, created_at, updated_at";
const IMPORT_COLUMNS: &str = "id, provider, adapter, status, records_found, records_synced, records_failed, \
     records_skipped, current_step, errors, started_at, updated_at, finished_at";

#[async_trait]
impl Store for PgStore {
    async fn list_clients(&self) -> StoreResult<Vec<Client>> {
        let rows = sqlx::query(&format!("SELECT {CLIENT_COLUMNS} FROM clients ORDER BY created_at, id"))
            .fetch_all(&self.pool)
            .await?;
        let mut keys = self.client_keys(None).await?;
        rows.iter()
            .map(|row| -> StoreResult<Client> {
                let id: Uuid = row.try_get("id")?;
                client_from_row(row, keys.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn get_client(&self, id: Uuid) -> StoreResult<Option<Client>> {
        let row = sqlx::query(&format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let keys = self.client_keys(Some(id)).await?.remove(&id).unwrap_or_default();
                Ok(Some(client_from_row(&row, keys)?))
            }
            None => Ok(None),
        }
    }

    async fn find_client_by_external_id(&self, source: Provider, external_id: &str) -> StoreResult<Option<Client>> {
        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT client_id FROM client_external_keys WHERE provider = $1 AND external_id = $2",
        )
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        match owner {
            Some(id) => self.get_client(id).await,
            None => Ok(None),
        }
    }

    async fn insert_client(&self, client: &Client) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO clients (id, name, status, industry, notes, start_date, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(client.id)
        .bind(&client.name)
        .bind(client.status.as_str())
        .bind(&client.industry)
        .bind(&client.notes)
        .bind(client.start_date)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_or(e, || format!("client id {}", client.id)))?;
        write_client_keys(&mut tx, client.id, &client.external_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_client(&self, client: &Client) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE clients
               SET name = $2, status = $3, industry = $4, notes = $5, start_date = $6, updated_at = $7
             WHERE id = $1
            "#,
        )
        .bind(client.id)
        .bind(&client.name)
        .bind(client.status.as_str())
        .bind(&client.industry)
        .bind(&client.notes)
        .bind(client.start_date)
        .bind(client.updated_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "client",
                id: client.id,
            });
        }
        sqlx::query("DELETE FROM client_external_keys WHERE client_id = $1")
            .bind(client.id)
            .execute(&mut *tx)
            .await?;
        write_client_keys(&mut tx, client.id, &client.external_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_aliases(&self, source: Option<Provider>) -> StoreResult<Vec<Alias>> {
        let rows = sqlx::query(
            r#"
            SELECT client_id, alias, source, created_at
              FROM aliases
             WHERE ($1::text IS NULL OR source = $1)
             ORDER BY id
            "#,
        )
        .bind(source.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<Alias> {
                Ok(Alias {
                    client_id: row.try_get("client_id")?,
                    alias: row.try_get("alias")?,
                    source: parse_provider(row, "source")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn insert_alias(&self, alias: &Alias) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO aliases (client_id, alias, source, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(alias.client_id)
        .bind(alias.alias.trim())
        .bind(alias.source.as_str())
        .bind(alias.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_team_members(&self) -> StoreResult<Vec<TeamMember>> {
        let rows = sqlx::query(
            "SELECT id, name, email, active, created_at, updated_at FROM team_members ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut keys = self.member_keys().await?;
        rows.iter()
            .map(|row| -> StoreResult<TeamMember> {
                let id: Uuid = row.try_get("id")?;
                Ok(TeamMember {
                    id,
                    name: row.try_get("name")?,
                    email: row.try_get("email")?,
                    external_ids: keys.remove(&id).unwrap_or_default(),
                    active: row.try_get("active")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn find_team_member_by_external_id(
        &self,
        source: Provider,
        external_id: &str,
    ) -> StoreResult<Option<TeamMember>> {
        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT member_id FROM team_member_external_keys WHERE provider = $1 AND external_id = $2",
        )
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        Ok(self.list_team_members().await?.into_iter().find(|m| m.id == owner))
    }

    async fn upsert_team_member(&self, member: &TeamMember) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO team_members (id, name, email, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
               SET name = EXCLUDED.name,
                   email = EXCLUDED.email,
                   active = EXCLUDED.active,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(member.id)
        .bind(&member.name)
        .bind(&member.email)
        .bind(member.active)
        .bind(member.created_at)
        .bind(member.updated_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM team_member_external_keys WHERE member_id = $1")
            .bind(member.id)
            .execute(&mut *tx)
            .await?;
        for (provider, external_id) in &member.external_ids {
            sqlx::query("INSERT INTO team_member_external_keys (member_id, provider, external_id) VALUES ($1, $2, $3)")
                .bind(member.id)
                .bind(provider.as_str())
                .bind(external_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| unique_or(e, || format!("team member external key {provider}:{external_id}")))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_record(&self, record: &DependentRecord) -> StoreResult<UpsertOutcome> {
        let body = serde_json::to_value(&record.body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        // No row back means the key is held by another source and the update was filtered out.
        let inserted: Option<bool> = sqlx::query_scalar(
            r#"
            INSERT INTO dependent_records (id, kind, client_id, scope_key, source, body, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (kind, client_id, scope_key) DO UPDATE
               SET body = EXCLUDED.body,
                   updated_at = EXCLUDED.updated_at
             WHERE dependent_records.source = EXCLUDED.source
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(record.id)
        .bind(record.kind().as_str())
        .bind(record.client_id)
        .bind(record.scope_key())
        .bind(record.source.as_str())
        .bind(body)
        .bind(record.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some(true) => UpsertOutcome::Inserted,
            Some(false) => UpsertOutcome::Updated,
            None => UpsertOutcome::Conflict,
        })
    }

    async fn records_for_client(&self, client_id: Uuid) -> StoreResult<Vec<DependentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, client_id, source, body, updated_at
              FROM dependent_records
             WHERE client_id = $1
             ORDER BY kind, scope_key
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count_records(&self) -> StoreResult<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dependent_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    async fn apply_merge(&self, plan: &MergePlan) -> StoreResult<MergeApplied> {
        let mut tx = self.pool.begin().await?;
        let dup = plan.duplicate_id;
        let primary = plan.primary_id;

        let locked: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM clients WHERE id = ANY($1) FOR UPDATE")
            .bind(vec![dup, primary])
            .fetch_all(&mut *tx)
            .await?;
        for id in [primary, dup] {
            if !locked.contains(&id) {
                return Err(StoreError::NotFound { entity: "client", id });
            }
        }

        let mut applied = MergeApplied::default();

        let planned = sqlx::query("DELETE FROM dependent_records WHERE client_id = $1 AND id = ANY($2)")
            .bind(dup)
            .bind(&plan.discard)
            .execute(&mut *tx)
            .await?;
        // Rows that started colliding after the plan was made.
        let drifted = sqlx::query(
            r#"
            DELETE FROM dependent_records d
             WHERE d.client_id = $1
               AND EXISTS (
                    SELECT 1 FROM dependent_records p
                     WHERE p.client_id = $2 AND p.kind = d.kind AND p.scope_key = d.scope_key
               )
            "#,
        )
        .bind(dup)
        .bind(primary)
        .execute(&mut *tx)
        .await?;
        applied.discarded = (planned.rows_affected() + drifted.rows_affected()) as usize;

        let moved = sqlx::query("UPDATE dependent_records SET client_id = $2 WHERE client_id = $1")
            .bind(dup)
            .bind(primary)
            .execute(&mut *tx)
            .await?;
        applied.repointed = moved.rows_affected() as usize;

        // `new_aliases` already carries the duplicate's own aliases, retargeted.
        sqlx::query("DELETE FROM aliases WHERE client_id = $1")
            .bind(dup)
            .execute(&mut *tx)
            .await?;
        for alias in &plan.new_aliases {
            let created = sqlx::query(
                r#"
                INSERT INTO aliases (client_id, alias, source, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(primary)
            .bind(alias.alias.trim())
            .bind(alias.source.as_str())
            .bind(alias.created_at)
            .execute(&mut *tx)
            .await?;
            applied.aliases_created += created.rows_affected() as usize;
        }

        sqlx::query("DELETE FROM client_external_keys WHERE client_id = $1")
            .bind(dup)
            .execute(&mut *tx)
            .await?;
        for (provider, external_id) in &plan.backfill.external_ids {
            sqlx::query(
                r#"
                INSERT INTO client_external_keys (client_id, provider, external_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(primary)
            .bind(provider.as_str())
            .bind(external_id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            UPDATE clients
               SET start_date = COALESCE(start_date, $2),
                   industry = COALESCE(industry, $3),
                   notes = COALESCE(notes, $4),
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(primary)
        .bind(plan.backfill.start_date)
        .bind(&plan.backfill.industry)
        .bind(&plan.backfill.notes)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM clients WHERE id = $1")
            .bind(dup)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(duplicate = %dup, primary = %primary, ?applied, "merge committed");
        Ok(applied)
    }

    async fn insert_import(&self, import: &SyncImport) -> StoreResult<()> {
        let errors = serde_json::to_value(&import.errors).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO sync_imports ({IMPORT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(import.id)
        .bind(import.provider.as_str())
        .bind(&import.adapter)
        .bind(import.status.as_str())
        .bind(to_i64(import.records_found))
        .bind(to_i64(import.records_synced))
        .bind(to_i64(import.records_failed))
        .bind(to_i64(import.records_skipped))
        .bind(&import.current_step)
        .bind(errors)
        .bind(import.started_at)
        .bind(import.updated_at)
        .bind(import.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or(e, || format!("import {}", import.id)))?;
        Ok(())
    }

    async fn update_import(&self, import: &SyncImport) -> StoreResult<()> {
        let errors = serde_json::to_value(&import.errors).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let result = sqlx::query(
            r#"
            UPDATE sync_imports
               SET status = $2,
                   records_found = $3,
                   records_synced = $4,
                   records_failed = $5,
                   records_skipped = $6,
                   current_step = $7,
                   errors = $8,
                   updated_at = $9,
                   finished_at = $10
             WHERE id = $1
            "#,
        )
        .bind(import.id)
        .bind(import.status.as_str())
        .bind(to_i64(import.records_found))
        .bind(to_i64(import.records_synced))
        .bind(to_i64(import.records_failed))
        .bind(to_i64(import.records_skipped))
        .bind(&import.current_step)
        .bind(errors)
        .bind(import.updated_at)
        .bind(import.finished_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "import",
                id: import.id,
            });
        }
        Ok(())
    }

    async fn get_import(&self, id: Uuid) -> StoreResult<Option<SyncImport>> {
        let row = sqlx::query(&format!("SELECT {IMPORT_COLUMNS} FROM sync_imports WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(import_from_row).transpose()
    }

    async fn list_imports(&self, limit: usize) -> StoreResult<Vec<SyncImport>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMPORT_COLUMNS} FROM sync_imports ORDER BY started_at DESC, id DESC LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(import_from_row).collect()
    }

    async fn running_imports(&self, adapter: &str) -> StoreResult<Vec<SyncImport>> {
        let rows = sqlx::query(&format!(
            "SELECT {IMPORT_COLUMNS} FROM sync_imports WHERE adapter = $1 AND status = 'running'"
        ))
        .bind(adapter)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(import_from_row).collect()
    }
}
