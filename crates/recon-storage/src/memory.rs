//! In-process `Store` used by tests and store-less runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use recon_core::merge::MergePlan;
use recon_core::{Alias, Client, DependentRecord, NaturalKey, Provider, SyncImport, TeamMember};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{MergeApplied, Store, StoreError, StoreResult, UpsertOutcome};

#[derive(Debug, Default)]
struct State {
    clients: HashMap<Uuid, Client>,
    aliases: Vec<Alias>,
    team_members: HashMap<Uuid, TeamMember>,
    records: HashMap<Uuid, DependentRecord>,
    record_keys: HashMap<NaturalKey, Uuid>,
    imports: HashMap<Uuid, SyncImport>,
}

impl State {
    fn external_key_owner(&self, source: Provider, external_id: &str) -> Option<Uuid> {
        self.clients
            .values()
            .find(|c| c.external_id(source) == Some(external_id))
            .map(|c| c.id)
    }

    fn check_external_keys(&self, client: &Client) -> StoreResult<()> {
        for (source, key) in &client.external_ids {
            if let Some(owner) = self.external_key_owner(*source, key) {
                if owner != client.id {
                    return Err(StoreError::UniqueViolation(format!(
                        "client external key {source}:{key} belongs to {owner}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_member_keys(&self, member: &TeamMember) -> StoreResult<()> {
        for (source, key) in &member.external_ids {
            let taken = self
                .team_members
                .values()
                .any(|m| m.id != member.id && m.external_ids.get(source) == Some(key));
            if taken {
                return Err(StoreError::UniqueViolation(format!(
                    "team member external key {source}:{key}"
                )));
            }
        }
        Ok(())
    }

    fn remove_record(&mut self, id: Uuid) {
        if let Some(record) = self.records.remove(&id) {
            self.record_keys.remove(&record.natural_key());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn by_creation(a: &Client, b: &Client) -> std::cmp::Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_clients(&self) -> StoreResult<Vec<Client>> {
        let state = self.state.read().await;
        let mut clients = state.clients.values().cloned().collect::<Vec<_>>();
        clients.sort_by(by_creation);
        Ok(clients)
    }

    async fn get_client(&self, id: Uuid) -> StoreResult<Option<Client>> {
        Ok(self.state.read().await.clients.get(&id).cloned())
    }

    async fn find_client_by_external_id(&self, source: Provider, external_id: &str) -> StoreResult<Option<Client>> {
        let state = self.state.read().await;
        Ok(state
            .external_key_owner(source, external_id)
            .and_then(|id| state.clients.get(&id).cloned()))
    }

    async fn insert_client(&self, client: &Client) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.clients.contains_key(&client.id) {
            return Err(StoreError::UniqueViolation(format!("client id {}", client.id)));
        }
        state.check_external_keys(client)?;
        state.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn update_client(&self, client: &Client) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.clients.contains_key(&client.id) {
            return Err(StoreError::NotFound {
                entity: "client",
                id: client.id,
            });
        }
        state.check_external_keys(client)?;
        state.clients.insert(client.id, client.clone());
        Ok(())
    }

    async fn list_aliases(&self, source: Option<Provider>) -> StoreResult<Vec<Alias>> {
        let state = self.state.read().await;
        Ok(state
            .aliases
            .iter()
            .filter(|a| source.is_none_or(|s| a.source == s))
            .cloned()
            .collect())
    }

    async fn insert_alias(&self, alias: &Alias) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if !state.clients.contains_key(&alias.client_id) {
            return Err(StoreError::NotFound {
                entity: "client",
                id: alias.client_id,
            });
        }
        let key = alias.key();
        if state.aliases.iter().any(|a| a.key() == key) {
            return Ok(false);
        }
        state.aliases.push(alias.clone());
        Ok(true)
    }

    async fn list_team_members(&self) -> StoreResult<Vec<TeamMember>> {
        let state = self.state.read().await;
        let mut members = state.team_members.values().cloned().collect::<Vec<_>>();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(members)
    }

    async fn find_team_member_by_external_id(
        &self,
        source: Provider,
        external_id: &str,
    ) -> StoreResult<Option<TeamMember>> {
        let state = self.state.read().await;
        Ok(state
            .team_members
            .values()
            .find(|m| m.external_ids.get(&source).map(String::as_str) == Some(external_id))
            .cloned())
    }

    async fn upsert_team_member(&self, member: &TeamMember) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.check_member_keys(member)?;
        state.team_members.insert(member.id, member.clone());
        Ok(())
    }

    async fn upsert_record(&self, record: &DependentRecord) -> StoreResult<UpsertOutcome> {
        let mut state = self.state.write().await;
        if !state.clients.contains_key(&record.client_id) {
            return Err(StoreError::NotFound {
                entity: "client",
                id: record.client_id,
            });
        }
        let key = record.natural_key();
        if let Some(existing_id) = state.record_keys.get(&key).copied() {
            let Some(existing) = state.records.get_mut(&existing_id) else {
                return Err(StoreError::Corrupt(format!("dangling record key {existing_id}")));
            };
            if existing.source != record.source {
                return Ok(UpsertOutcome::Conflict);
            }
            existing.body = record.body.clone();
            existing.updated_at = record.updated_at;
            return Ok(UpsertOutcome::Updated);
        }
        state.record_keys.insert(key, record.id);
        state.records.insert(record.id, record.clone());
        Ok(UpsertOutcome::Inserted)
    }

    async fn records_for_client(&self, client_id: Uuid) -> StoreResult<Vec<DependentRecord>> {
        let state = self.state.read().await;
        let mut records = state
            .records
            .values()
            .filter(|r| r.client_id == client_id)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.kind().cmp(&b.kind()).then_with(|| a.scope_key().cmp(&b.scope_key())));
        Ok(records)
    }

    async fn count_records(&self) -> StoreResult<u64> {
        Ok(self.state.read().await.records.len() as u64)
    }

    async fn apply_merge(&self, plan: &MergePlan) -> StoreResult<MergeApplied> {
        let mut state = self.state.write().await;
        for id in [plan.primary_id, plan.duplicate_id] {
            if !state.clients.contains_key(&id) {
                return Err(StoreError::NotFound { entity: "client", id });
            }
        }

        let mut applied = MergeApplied::default();
        let discard = plan.discard.iter().copied().collect::<HashSet<_>>();
        let mut owned = state
            .records
            .values()
            .filter(|r| r.client_id == plan.duplicate_id)
            .map(|r| r.id)
            .collect::<Vec<_>>();
        owned.sort();

        for id in owned {
            if discard.contains(&id) {
                state.remove_record(id);
                applied.discarded += 1;
                continue;
            }
            let Some(mut record) = state.records.get(&id).cloned() else {
                continue;
            };
            record.client_id = plan.primary_id;
            let key = record.natural_key();
            if state.record_keys.contains_key(&key) {
                state.remove_record(id);
                applied.discarded += 1;
            } else {
                state.remove_record(id);
                state.record_keys.insert(key, id);
                state.records.insert(id, record);
                applied.repointed += 1;
            }
        }

        // `new_aliases` already carries the duplicate's own aliases, retargeted.
        state.aliases.retain(|a| a.client_id != plan.duplicate_id);
        for alias in &plan.new_aliases {
            let key = alias.key();
            if !state.aliases.iter().any(|a| a.key() == key) {
                state.aliases.push(alias.clone());
                applied.aliases_created += 1;
            }
        }

        state.clients.remove(&plan.duplicate_id);
        if let Some(primary) = state.clients.get_mut(&plan.primary_id) {
            plan.backfill.apply_to(primary);
            primary.updated_at = Utc::now();
        }
        Ok(applied)
    }

    async fn insert_import(&self, import: &SyncImport) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.imports.contains_key(&import.id) {
            return Err(StoreError::UniqueViolation(format!("import {}", import.id)));
        }
        state.imports.insert(import.id, import.clone());
        Ok(())
    }

    async fn update_import(&self, import: &SyncImport) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.imports.get_mut(&import.id) {
            Some(slot) => {
                *slot = import.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "import",
                id: import.id,
            }),
        }
    }

    async fn get_import(&self, id: Uuid) -> StoreResult<Option<SyncImport>> {
        Ok(self.state.read().await.imports.get(&id).cloned())
    }

    async fn list_imports(&self, limit: usize) -> StoreResult<Vec<SyncImport>> {
        let state = self.state.read().await;
        let mut imports = state.imports.values().cloned().collect::<Vec<_>>();
        imports.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        imports.truncate(limit);
        Ok(imports)
    }

    async fn running_imports(&self, adapter: &str) -> StoreResult<Vec<SyncImport>> {
        let state = self.state.read().await;
        Ok(state
            .imports
            .values()
            .filter(|i| i.adapter == adapter && i.is_running())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, TimeZone};
    use recon_core::merge::{plan_merge, ClientSnapshot};
    use recon_core::{ClientStatus, FinancialEntry, FinancialType, RecordBody, SyncStatus};
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 12, 0, 0).single().unwrap()
    }

    fn cost(client_id: Uuid, source: Provider, category: &str, amount: rust_decimal::Decimal) -> DependentRecord {
        DependentRecord::new(
            client_id,
            source,
            RecordBody::Financial(FinancialEntry {
                period: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                record_type: FinancialType::Cost,
                category: category.into(),
                amount,
                currency: "USD".into(),
            }),
            now(),
        )
    }

    async fn snapshot(store: &MemoryStore, client: &Client) -> ClientSnapshot {
        ClientSnapshot {
            client: store.get_client(client.id).await.unwrap().unwrap(),
            records: store.records_for_client(client.id).await.unwrap(),
            aliases: store
                .list_aliases(None)
                .await
                .unwrap()
                .into_iter()
                .filter(|a| a.client_id == client.id)
                .collect(),
        }
    }

    #[tokio::test]
    async fn external_keys_are_unique_across_clients() {
        let store = MemoryStore::new();
        let a = Client::new("Acme", ClientStatus::Active, now()).with_external_id(Provider::Hubspot, "42");
        let b = Client::new("Acme 2", ClientStatus::Active, now()).with_external_id(Provider::Hubspot, "42");
        store.insert_client(&a).await.unwrap();
        let err = store.insert_client(&b).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        let found = store.find_client_by_external_id(Provider::Hubspot, "42").await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(a.id));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_same_source() {
        let store = MemoryStore::new();
        let client = Client::new("Acme", ClientStatus::Active, now());
        store.insert_client(&client).await.unwrap();

        let first = cost(client.id, Provider::Sheets, "labor", dec!(100));
        assert_eq!(store.upsert_record(&first).await.unwrap(), UpsertOutcome::Inserted);
        let again = cost(client.id, Provider::Sheets, "Labor", dec!(120));
        assert_eq!(store.upsert_record(&again).await.unwrap(), UpsertOutcome::Updated);
        assert_eq!(store.count_records().await.unwrap(), 1);

        let rows = store.records_for_client(client.id).await.unwrap();
        assert_eq!(rows[0].id, first.id);
        match &rows[0].body {
            RecordBody::Financial(f) => assert_eq!(f.amount, dec!(120)),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn other_source_on_same_key_conflicts() {
        let store = MemoryStore::new();
        let client = Client::new("Acme", ClientStatus::Active, now());
        store.insert_client(&client).await.unwrap();
        store
            .upsert_record(&cost(client.id, Provider::Sheets, "labor", dec!(1)))
            .await
            .unwrap();
        let outcome = store
            .upsert_record(&cost(client.id, Provider::Quickbooks, "labor", dec!(2)))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Conflict);
        assert_eq!(store.count_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn aliases_unique_on_lowercase_and_source() {
        let store = MemoryStore::new();
        let client = Client::new("Acme", ClientStatus::Active, now());
        store.insert_client(&client).await.unwrap();
        let alias = |text: &str, source| Alias {
            client_id: client.id,
            alias: text.into(),
            source,
            created_at: now(),
        };
        assert!(store.insert_alias(&alias("ACME Co", Provider::Slack)).await.unwrap());
        assert!(!store.insert_alias(&alias("acme co", Provider::Slack)).await.unwrap());
        assert!(store.insert_alias(&alias("acme co", Provider::Gmail)).await.unwrap());
    }

    #[tokio::test]
    async fn merge_conserves_records_and_keeps_primary_on_conflict() {
        let store = MemoryStore::new();
        let primary = Client::new("Acme Co - Paid Content", ClientStatus::Active, now())
            .with_external_id(Provider::Hubspot, "d-1");
        let duplicate = Client::new("Acme Co", ClientStatus::Active, now())
            .with_external_id(Provider::Quickbooks, "c-1");
        store.insert_client(&primary).await.unwrap();
        store.insert_client(&duplicate).await.unwrap();

        let kept = cost(primary.id, Provider::Sheets, "labor", dec!(500));
        store.upsert_record(&kept).await.unwrap();
        store
            .upsert_record(&cost(duplicate.id, Provider::Quickbooks, "labor", dec!(900)))
            .await
            .unwrap();
        store
            .upsert_record(&cost(duplicate.id, Provider::Quickbooks, "software", dec!(50)))
            .await
            .unwrap();
        let before = store.count_records().await.unwrap();

        let plan = plan_merge(
            &snapshot(&store, &duplicate).await,
            &snapshot(&store, &primary).await,
            now(),
        );
        let applied = store.apply_merge(&plan).await.unwrap();

        assert_eq!(applied.discarded, 1);
        assert_eq!(applied.repointed, 1);
        assert_eq!(store.count_records().await.unwrap(), before - applied.discarded as u64);
        assert!(store.get_client(duplicate.id).await.unwrap().is_none());

        let survivor = store.get_client(primary.id).await.unwrap().unwrap();
        assert_eq!(survivor.external_id(Provider::Quickbooks), Some("c-1"));
        let rows = store.records_for_client(primary.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.id == kept.id));

        let aliases = store.list_aliases(Some(Provider::Quickbooks)).await.unwrap();
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].alias, "Acme Co");
        assert_eq!(aliases[0].client_id, primary.id);
    }

    #[tokio::test]
    async fn merge_moves_duplicate_aliases_to_primary() {
        let store = MemoryStore::new();
        let primary = Client::new("Initech", ClientStatus::Active, now()).with_external_id(Provider::Hubspot, "d-9");
        let duplicate = Client::new("Initech", ClientStatus::Active, now()).with_external_id(Provider::Slack, "C9");
        let bystander = Client::new("Intertrode", ClientStatus::Active, now());
        for c in [&primary, &duplicate, &bystander] {
            store.insert_client(c).await.unwrap();
        }
        let alias = |client_id, text: &str, source| Alias {
            client_id,
            alias: text.into(),
            source,
            created_at: now(),
        };
        store.insert_alias(&alias(duplicate.id, "Initech Software", Provider::Gmail)).await.unwrap();
        store.insert_alias(&alias(duplicate.id, "INTK", Provider::Slack)).await.unwrap();
        store.insert_alias(&alias(bystander.id, "Intertrode Ltd", Provider::Gmail)).await.unwrap();

        let plan = plan_merge(
            &snapshot(&store, &duplicate).await,
            &snapshot(&store, &primary).await,
            now(),
        );
        let applied = store.apply_merge(&plan).await.unwrap();

        assert_eq!(applied.aliases_created, 2);
        let aliases = store.list_aliases(None).await.unwrap();
        assert_eq!(aliases.len(), 3);
        assert!(aliases.iter().all(|a| a.client_id != duplicate.id));
        for (text, source) in [("Initech Software", Provider::Gmail), ("INTK", Provider::Slack)] {
            assert!(aliases
                .iter()
                .any(|a| a.alias == text && a.source == source && a.client_id == primary.id));
        }
        assert!(aliases.iter().any(|a| a.client_id == bystander.id));
    }

    #[tokio::test]
    async fn merge_repoints_records_added_after_planning() {
        let store = MemoryStore::new();
        let primary = Client::new("Globex", ClientStatus::Active, now());
        let duplicate = Client::new("Globex Inc", ClientStatus::Active, now());
        store.insert_client(&primary).await.unwrap();
        store.insert_client(&duplicate).await.unwrap();

        let plan = plan_merge(
            &snapshot(&store, &duplicate).await,
            &snapshot(&store, &primary).await,
            now(),
        );
        let late = cost(duplicate.id, Provider::Sheets, "travel", dec!(10));
        store.upsert_record(&late).await.unwrap();

        let applied = store.apply_merge(&plan).await.unwrap();
        assert_eq!(applied.repointed, 1);
        let rows = store.records_for_client(primary.id).await.unwrap();
        assert_eq!(rows[0].id, late.id);
    }

    #[tokio::test]
    async fn imports_list_newest_first_and_filter_running() {
        let store = MemoryStore::new();
        let older = SyncImport::start(Provider::Slack, "slack:messages", now());
        let mut newer = SyncImport::start(Provider::Slack, "slack:messages", now() + chrono::Duration::minutes(5));
        store.insert_import(&older).await.unwrap();
        store.insert_import(&newer).await.unwrap();

        newer.finish(SyncStatus::Completed, "done", now());
        store.update_import(&newer).await.unwrap();

        let listed = store.list_imports(10).await.unwrap();
        assert_eq!(listed[0].id, newer.id);
        let running = store.running_imports("slack:messages").await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, older.id);
        assert!(store.running_imports("gmail:messages").await.unwrap().is_empty());
    }
}
