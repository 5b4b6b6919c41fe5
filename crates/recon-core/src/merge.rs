//! Pure merge planning: what folding one client into another would do.
//!
//! Planning reads snapshots only; applying a plan is the store's job.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Alias, Client, DependentRecord, Provider, RecordKind};

/// A client together with everything that hangs off it.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub client: Client,
    pub records: Vec<DependentRecord>,
    pub aliases: Vec<Alias>,
}

/// Fields copied onto the survivor because it had none of its own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Backfill {
    pub external_ids: BTreeMap<Provider, String>,
    pub start_date: Option<NaiveDate>,
    pub industry: Option<String>,
    pub notes: Option<String>,
}

impl Backfill {
    pub fn is_empty(&self) -> bool {
        self.external_ids.is_empty()
            && self.start_date.is_none()
            && self.industry.is_none()
            && self.notes.is_none()
    }

    pub fn apply_to(&self, client: &mut Client) {
        for (source, key) in &self.external_ids {
            client.external_ids.entry(*source).or_insert_with(|| key.clone());
        }
        if client.start_date.is_none() {
            client.start_date = self.start_date;
        }
        if client.industry.is_none() {
            client.industry = self.industry.clone();
        }
        if client.notes.is_none() {
            client.notes = self.notes.clone();
        }
    }
}

/// Every action needed to fold `duplicate_id` into `primary_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub duplicate_id: Uuid,
    pub duplicate_name: String,
    pub primary_id: Uuid,
    pub primary_name: String,
    /// Duplicate records moved onto the primary.
    pub repoint: Vec<Uuid>,
    /// Duplicate records dropped because the primary already owns the same key.
    pub discard: Vec<Uuid>,
    pub new_aliases: Vec<Alias>,
    pub backfill: Backfill,
}

impl MergePlan {
    pub fn record_count(&self) -> usize {
        self.repoint.len() + self.discard.len()
    }
}

/// Build the plan for folding `duplicate` into `primary`. Primary wins every conflict.
pub fn plan_merge(duplicate: &ClientSnapshot, primary: &ClientSnapshot, now: DateTime<Utc>) -> MergePlan {
    let mut owned: HashSet<(RecordKind, String)> = primary
        .records
        .iter()
        .map(|r| (r.kind(), r.scope_key()))
        .collect();

    let mut repoint = Vec::new();
    let mut discard = Vec::new();
    for record in &duplicate.records {
        if owned.insert((record.kind(), record.scope_key())) {
            repoint.push(record.id);
        } else {
            discard.push(record.id);
        }
    }

    let dup = &duplicate.client;
    let prim = &primary.client;

    // Sources the duplicate's name was seen under: its keys, then its records.
    let sources: BTreeSet<Provider> = dup
        .external_ids
        .keys()
        .copied()
        .chain(duplicate.records.iter().map(|r| r.source))
        .collect();

    let mut taken: HashSet<(String, Provider)> = primary.aliases.iter().map(Alias::key).collect();
    let mut new_aliases = Vec::new();
    if !dup.name.trim().eq_ignore_ascii_case(prim.name.trim()) {
        for source in sources {
            push_alias(&mut new_aliases, &mut taken, prim.id, dup.name.trim(), source, now);
        }
    }
    // Variants the duplicate had already learned move to the primary.
    for alias in &duplicate.aliases {
        if !alias.alias.trim().eq_ignore_ascii_case(prim.name.trim()) {
            push_alias(&mut new_aliases, &mut taken, prim.id, alias.alias.trim(), alias.source, alias.created_at);
        }
    }

    let mut backfill = Backfill::default();
    for (source, key) in &dup.external_ids {
        if !prim.external_ids.contains_key(source) {
            backfill.external_ids.insert(*source, key.clone());
        }
    }
    if prim.start_date.is_none() {
        backfill.start_date = dup.start_date;
    }
    if prim.industry.is_none() {
        backfill.industry = dup.industry.clone();
    }
    if prim.notes.is_none() {
        backfill.notes = dup.notes.clone();
    }

    MergePlan {
        duplicate_id: dup.id,
        duplicate_name: dup.name.clone(),
        primary_id: prim.id,
        primary_name: prim.name.clone(),
        repoint,
        discard,
        new_aliases,
        backfill,
    }
}

fn push_alias(
    aliases: &mut Vec<Alias>,
    taken: &mut HashSet<(String, Provider)>,
    client_id: Uuid,
    name: &str,
    source: Provider,
    created_at: DateTime<Utc>,
) {
    let alias = Alias {
        client_id,
        alias: name.to_string(),
        source,
        created_at,
    };
    if taken.insert(alias.key()) {
        aliases.push(alias);
    }
}

/// Survivor of a same-name group: carries the primary-source key, else has the
/// shortest display name, else comes first by creation time and id.
pub fn pick_survivor<'a>(group: &[&'a Client], primary_source: Provider) -> Option<&'a Client> {
    group.iter().copied().min_by(|a, b| {
        let a_primary = a.has_source(primary_source);
        let b_primary = b.has_source(primary_source);
        b_primary
            .cmp(&a_primary)
            .then_with(|| a.name.trim().chars().count().cmp(&b.name.trim().chars().count()))
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    })
}
