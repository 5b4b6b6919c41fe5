//! Duplicate client resolution.
//!
//! Pass 1 folds secondary-source clients into clients that carry the primary
//! source key. Pass 2 folds same-name clients that are left into one survivor.
//! Near misses from pass 1 are reported for review, never merged.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use recon_core::matcher::{extract_company_name, normalize_name, CandidateSet, EntityMatcher};
use recon_core::merge::{pick_survivor, plan_merge, ClientSnapshot, MergePlan};
use recon_core::{Client, Provider};
use recon_storage::{MergeApplied, Store};
use serde::Serialize;
use strsim::jaro_winkler;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::runner::SyncError;

pub const DEFAULT_REVIEW_THRESHOLD: f64 = 0.85;

/// An unmatched client that looks a lot like an authoritative one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCandidate {
    pub client_id: Uuid,
    pub client_name: String,
    pub suggested_id: Uuid,
    pub suggested_name: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub dry_run: bool,
    pub merged_cross_source: usize,
    pub merged_same_source: usize,
    pub records_repointed: usize,
    pub records_discarded: usize,
    pub aliases_created: usize,
    pub unmatched: usize,
    pub review: Vec<ReviewCandidate>,
    pub plans: Vec<MergePlan>,
}

impl MergeReport {
    pub fn merged(&self) -> usize {
        self.merged_cross_source + self.merged_same_source
    }

    fn add(&mut self, plan: MergePlan, applied: MergeApplied) {
        self.records_repointed += applied.repointed;
        self.records_discarded += applied.discarded;
        self.aliases_created += applied.aliases_created;
        self.plans.push(plan);
    }
}

pub struct MergeResolver {
    store: Arc<dyn Store>,
    matcher: Arc<EntityMatcher>,
    primary_source: Provider,
    review_threshold: f64,
}

fn company_key(name: &str) -> String {
    normalize_name(&extract_company_name(name))
}

impl MergeResolver {
    pub fn new(store: Arc<dyn Store>, matcher: Arc<EntityMatcher>, primary_source: Provider) -> Self {
        Self {
            store,
            matcher,
            primary_source,
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
        }
    }

    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.review_threshold = threshold;
        self
    }

    pub async fn run(&self, dry_run: bool) -> Result<MergeReport, SyncError> {
        let span = info_span!("merge_run", dry_run, primary = %self.primary_source);
        async move {
            let mut report = MergeReport {
                dry_run,
                ..MergeReport::default()
            };
            let mut gone = HashSet::new();
            self.cross_source_pass(dry_run, &mut report, &mut gone).await?;
            self.same_source_pass(dry_run, &mut report, &gone).await?;
            info!(
                merged = report.merged(),
                repointed = report.records_repointed,
                discarded = report.records_discarded,
                unmatched = report.unmatched,
                review = report.review.len(),
                "merge finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn cross_source_pass(
        &self,
        dry_run: bool,
        report: &mut MergeReport,
        gone: &mut HashSet<Uuid>,
    ) -> Result<(), SyncError> {
        let mut clients = self.store.list_clients().await?;
        clients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let (authoritative, candidates): (Vec<Client>, Vec<Client>) =
            clients.into_iter().partition(|c| c.has_source(self.primary_source));
        if authoritative.is_empty() {
            report.unmatched += candidates.len();
            return Ok(());
        }

        let extracted = authoritative
            .iter()
            .map(|c| (c.id, extract_company_name(&c.name)))
            .collect::<Vec<_>>();
        let base = CandidateSet::new(extracted.iter().cloned());
        let aliases = self.store.list_aliases(None).await?;

        for candidate in &candidates {
            // Aliases only count under a source the candidate was imported from.
            let set = candidate
                .external_ids
                .keys()
                .fold(base.clone(), |set, source| set.with_aliases(&aliases, *source));
            let Some(primary_id) = self.resolve_candidate(&candidate.name, &set) else {
                report.unmatched += 1;
                if let Some(review) = self.review_candidate(candidate, &extracted, &authoritative) {
                    report.review.push(review);
                }
                continue;
            };
            if self.merge_one(candidate.id, primary_id, dry_run, report).await? {
                report.merged_cross_source += 1;
                gone.insert(candidate.id);
            }
        }
        Ok(())
    }

    /// Extracted company name first, then the raw name aliases are recorded under.
    fn resolve_candidate(&self, raw_name: &str, set: &CandidateSet) -> Option<Uuid> {
        let company = extract_company_name(raw_name);
        self.matcher.resolve(&company, set).or_else(|| {
            (company != raw_name.trim())
                .then(|| self.matcher.resolve(raw_name, set))
                .flatten()
        })
    }

    fn review_candidate(
        &self,
        candidate: &Client,
        extracted: &[(Uuid, String)],
        authoritative: &[Client],
    ) -> Option<ReviewCandidate> {
        let key = company_key(&candidate.name);
        let (best_id, score) = extracted
            .iter()
            .map(|(id, name)| (*id, jaro_winkler(&key, &normalize_name(name))))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        if score < self.review_threshold {
            return None;
        }
        let suggested = authoritative.iter().find(|c| c.id == best_id)?;
        debug!(client = %candidate.name, suggested = %suggested.name, score, "review candidate");
        Some(ReviewCandidate {
            client_id: candidate.id,
            client_name: candidate.name.clone(),
            suggested_id: suggested.id,
            suggested_name: suggested.name.clone(),
            score,
        })
    }

    async fn same_source_pass(
        &self,
        dry_run: bool,
        report: &mut MergeReport,
        gone: &HashSet<Uuid>,
    ) -> Result<(), SyncError> {
        let clients = self
            .store
            .list_clients()
            .await?
            .into_iter()
            .filter(|c| !gone.contains(&c.id))
            .collect::<Vec<_>>();

        let mut groups: BTreeMap<String, Vec<&Client>> = BTreeMap::new();
        for client in &clients {
            let key = company_key(&client.name);
            if !key.is_empty() {
                groups.entry(key).or_default().push(client);
            }
        }

        for group in groups.values().filter(|g| g.len() > 1) {
            let Some(survivor) = pick_survivor(group, self.primary_source) else {
                continue;
            };
            let mut rest = group.iter().filter(|c| c.id != survivor.id).copied().collect::<Vec<_>>();
            rest.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            for duplicate in rest {
                if self.merge_one(duplicate.id, survivor.id, dry_run, report).await? {
                    report.merged_same_source += 1;
                }
            }
        }
        Ok(())
    }

    async fn snapshot(&self, id: Uuid) -> Result<Option<ClientSnapshot>, SyncError> {
        let Some(client) = self.store.get_client(id).await? else {
            return Ok(None);
        };
        let records = self.store.records_for_client(id).await?;
        let aliases = self
            .store
            .list_aliases(None)
            .await?
            .into_iter()
            .filter(|a| a.client_id == id)
            .collect();
        Ok(Some(ClientSnapshot { client, records, aliases }))
    }

    /// Plan and, unless dry, apply one fold. False when either side vanished.
    async fn merge_one(
        &self,
        duplicate_id: Uuid,
        primary_id: Uuid,
        dry_run: bool,
        report: &mut MergeReport,
    ) -> Result<bool, SyncError> {
        if duplicate_id == primary_id {
            return Ok(false);
        }
        let (Some(duplicate), Some(primary)) = (self.snapshot(duplicate_id).await?, self.snapshot(primary_id).await?)
        else {
            return Ok(false);
        };
        let plan = plan_merge(&duplicate, &primary, Utc::now());
        let applied = if dry_run {
            MergeApplied {
                repointed: plan.repoint.len(),
                discarded: plan.discard.len(),
                aliases_created: plan.new_aliases.len(),
            }
        } else {
            self.store.apply_merge(&plan).await?
        };
        info!(
            duplicate = %plan.duplicate_name,
            primary = %plan.primary_name,
            repointed = applied.repointed,
            discarded = applied.discarded,
            dry_run,
            "merged client"
        );
        report.add(plan, applied);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, TimeZone};
    use recon_core::{
        ClientStatus, DependentRecord, FinancialEntry, FinancialType, RecordBody, TimeEntry,
    };
    use recon_storage::MemoryStore;
    use rust_decimal::Decimal;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, minute, 0).single().unwrap()
    }

    fn client(name: &str, source: Provider, key: &str, minute: u32) -> Client {
        let mut client = Client::new(name, ClientStatus::Active, at(minute)).with_external_id(source, key);
        client.created_at = at(minute);
        client
    }

    fn labor(client_id: Uuid, source: Provider, amount: i64) -> DependentRecord {
        DependentRecord::new(
            client_id,
            source,
            RecordBody::Financial(FinancialEntry {
                period: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                record_type: FinancialType::Cost,
                category: "labor".into(),
                amount: Decimal::new(amount, 0),
                currency: "USD".into(),
            }),
            at(30),
        )
    }

    fn time_entry(client_id: Uuid, id: &str) -> DependentRecord {
        DependentRecord::new(
            client_id,
            Provider::Monday,
            RecordBody::TimeEntry(TimeEntry {
                external_id: id.into(),
                team_member_id: None,
                date: None,
                hours: Some(1.0),
                description: None,
                incomplete: false,
            }),
            at(30),
        )
    }

    fn resolver(store: &Arc<MemoryStore>) -> MergeResolver {
        MergeResolver::new(store.clone(), Arc::new(EntityMatcher::standard()), Provider::Hubspot)
    }

    #[tokio::test]
    async fn secondary_folds_into_primary_and_conflict_keeps_primary_row() {
        let store = Arc::new(MemoryStore::new());
        let primary = client("Acme Co - Paid Content", Provider::Hubspot, "d-1", 0);
        let secondary = client("Acme Co", Provider::Quickbooks, "c-58", 1);
        store.insert_client(&primary).await.unwrap();
        store.insert_client(&secondary).await.unwrap();

        store.upsert_record(&labor(primary.id, Provider::Hubspot, 100)).await.unwrap();
        store.upsert_record(&labor(secondary.id, Provider::Quickbooks, 70)).await.unwrap();
        store.upsert_record(&time_entry(secondary.id, "t-1")).await.unwrap();
        let before = store.count_records().await.unwrap();

        let report = resolver(&store).run(false).await.unwrap();

        assert_eq!(report.merged_cross_source, 1);
        assert_eq!(report.records_discarded, 1);
        assert_eq!(report.records_repointed, 1);
        assert_eq!(store.count_records().await.unwrap(), before - 1);
        assert!(store.get_client(secondary.id).await.unwrap().is_none());

        let survivor = store.get_client(primary.id).await.unwrap().unwrap();
        assert_eq!(survivor.external_id(Provider::Quickbooks), Some("c-58"));
        let rows = store.records_for_client(primary.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let kept = rows
            .iter()
            .find_map(|r| match &r.body {
                RecordBody::Financial(f) => Some(f.amount),
                _ => None,
            })
            .unwrap();
        assert_eq!(kept, Decimal::new(100, 0));

        let aliases = store.list_aliases(Some(Provider::Quickbooks)).await.unwrap();
        assert!(aliases.iter().any(|a| a.alias == "Acme Co" && a.client_id == primary.id));
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_the_store() {
        let store = Arc::new(MemoryStore::new());
        let primary = client("Globex", Provider::Hubspot, "d-2", 0);
        let secondary = client("Globex Corporation", Provider::Sheets, "row-4", 1);
        store.insert_client(&primary).await.unwrap();
        store.insert_client(&secondary).await.unwrap();
        store.upsert_record(&time_entry(secondary.id, "t-9")).await.unwrap();

        let report = resolver(&store).run(true).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.merged_cross_source, 1);
        assert_eq!(report.records_repointed, 1);
        assert_eq!(report.plans.len(), 1);
        assert_eq!(report.plans[0].duplicate_id, secondary.id);
        assert_eq!(store.list_clients().await.unwrap().len(), 2);
        assert_eq!(store.records_for_client(secondary.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn learned_alias_folds_candidate_with_unrelated_name() {
        let store = Arc::new(MemoryStore::new());
        let primary = client("Umbrella Health", Provider::Hubspot, "d-7", 0);
        let renamed = client("UMB Holdings LLC", Provider::Quickbooks, "c-77", 1);
        let elsewhere = client("UMB Holdings LLC", Provider::Sheets, "row-2", 2);
        for c in [&primary, &renamed, &elsewhere] {
            store.insert_client(c).await.unwrap();
        }
        let alias = recon_core::Alias {
            client_id: primary.id,
            alias: "umb holdings llc".into(),
            source: Provider::Quickbooks,
            created_at: at(5),
        };
        assert!(store.insert_alias(&alias).await.unwrap());

        let report = resolver(&store).run(true).await.unwrap();

        assert_eq!(report.merged_cross_source, 1);
        assert_eq!(report.plans[0].duplicate_id, renamed.id);
        assert_eq!(report.plans[0].primary_id, primary.id);
        assert_eq!(report.unmatched, 1);
    }

    #[tokio::test]
    async fn near_miss_goes_to_review_not_merge() {
        let store = Arc::new(MemoryStore::new());
        let primary = client("Initech Systems", Provider::Hubspot, "d-3", 0);
        let lookalike = client("Initek Systems", Provider::Quickbooks, "c-9", 1);
        let stranger = client("Vandelay Industries", Provider::Quickbooks, "c-10", 2);
        for c in [&primary, &lookalike, &stranger] {
            store.insert_client(c).await.unwrap();
        }

        let report = resolver(&store).run(false).await.unwrap();

        assert_eq!(report.merged(), 0);
        assert_eq!(report.unmatched, 2);
        assert_eq!(report.review.len(), 1);
        assert_eq!(report.review[0].client_id, lookalike.id);
        assert_eq!(report.review[0].suggested_id, primary.id);
        assert!(report.review[0].score >= DEFAULT_REVIEW_THRESHOLD);
        assert_eq!(store.list_clients().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn same_source_duplicates_fold_into_shortest_name() {
        let store = Arc::new(MemoryStore::new());
        let long = client("Hooli - SEO", Provider::Monday, "i-1", 0);
        let short = client("Hooli", Provider::Monday, "i-2", 1);
        let other = client("Pied Piper", Provider::Monday, "i-3", 2);
        for c in [&long, &short, &other] {
            store.insert_client(c).await.unwrap();
        }
        store.upsert_record(&time_entry(long.id, "t-1")).await.unwrap();
        store.upsert_record(&time_entry(short.id, "t-2")).await.unwrap();

        let report = resolver(&store).run(false).await.unwrap();

        assert_eq!(report.merged_cross_source, 0);
        assert_eq!(report.merged_same_source, 1);
        let left = store.list_clients().await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|c| c.id == short.id));
        assert_eq!(store.records_for_client(short.id).await.unwrap().len(), 2);
        assert_eq!(store.count_records().await.unwrap(), 2);
    }
}
