//! Canonical entity model shared by every recon crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod matcher;
pub mod merge;

pub const CRATE_NAME: &str = "recon-core";

/// External system a record was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Hubspot,
    Monday,
    Quickbooks,
    Sheets,
    Slack,
    Calendar,
    Gmail,
}

impl Provider {
    pub const ALL: [Provider; 7] = [
        Provider::Hubspot,
        Provider::Monday,
        Provider::Quickbooks,
        Provider::Sheets,
        Provider::Slack,
        Provider::Calendar,
        Provider::Gmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Hubspot => "hubspot",
            Provider::Monday => "monday",
            Provider::Quickbooks => "quickbooks",
            Provider::Sheets => "sheets",
            Provider::Slack => "slack",
            Provider::Calendar => "calendar",
            Provider::Gmail => "gmail",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Provider {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "provider",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    #[default]
    Prospect,
    Active,
    Churned,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Prospect => "prospect",
            ClientStatus::Active => "active",
            ClientStatus::Churned => "churned",
        }
    }
}

impl FromStr for ClientStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prospect" => Ok(ClientStatus::Prospect),
            "active" => Ok(ClientStatus::Active),
            "churned" => Ok(ClientStatus::Churned),
            _ => Err(ParseEnumError {
                kind: "client status",
                value: s.to_string(),
            }),
        }
    }
}

/// One real-world client organization, regardless of how many sources mention it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub status: ClientStatus,
    /// At most one key per source; each `(source, key)` pair is globally unique.
    pub external_ids: BTreeMap<Provider, String>,
    pub industry: Option<String>,
    pub notes: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn new(name: impl Into<String>, status: ClientStatus, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status,
            external_ids: BTreeMap::new(),
            industry: None,
            notes: None,
            start_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_external_id(mut self, source: Provider, external_id: impl Into<String>) -> Self {
        self.external_ids.insert(source, external_id.into());
        self
    }

    pub fn external_id(&self, source: Provider) -> Option<&str> {
        self.external_ids.get(&source).map(String::as_str)
    }

    pub fn has_source(&self, source: Provider) -> bool {
        self.external_ids.contains_key(&source)
    }
}

/// A name variant seen in one source that resolves to a canonical client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub client_id: Uuid,
    pub alias: String,
    pub source: Provider,
    pub created_at: DateTime<Utc>,
}

impl Alias {
    /// Aliases are unique on `(lower(alias), source)`.
    pub fn key(&self) -> (String, Provider) {
        (self.alias.trim().to_lowercase(), self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub external_ids: BTreeMap<Provider, String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TeamMember {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: None,
            external_ids: BTreeMap::new(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Financial,
    TimeEntry,
    Deliverable,
    Communication,
    Meeting,
    RoleAssignment,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Financial => "financial",
            RecordKind::TimeEntry => "time_entry",
            RecordKind::Deliverable => "deliverable",
            RecordKind::Communication => "communication",
            RecordKind::Meeting => "meeting",
            RecordKind::RoleAssignment => "role_assignment",
        }
    }
}

impl FromStr for RecordKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RecordKind::Financial,
            RecordKind::TimeEntry,
            RecordKind::Deliverable,
            RecordKind::Communication,
            RecordKind::Meeting,
            RecordKind::RoleAssignment,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| ParseEnumError {
            kind: "record kind",
            value: s.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinancialType {
    Revenue,
    Cost,
    Budget,
}

impl FinancialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinancialType::Revenue => "revenue",
            FinancialType::Cost => "cost",
            FinancialType::Budget => "budget",
        }
    }
}

impl FromStr for FinancialType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "revenue" | "income" => Ok(FinancialType::Revenue),
            "cost" | "expense" | "expenses" => Ok(FinancialType::Cost),
            "budget" => Ok(FinancialType::Budget),
            _ => Err(ParseEnumError {
                kind: "financial type",
                value: s.to_string(),
            }),
        }
    }
}

/// Monthly figure for one client; unique per `(client, period, type, category)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialEntry {
    /// Always the first day of the month.
    pub period: NaiveDate,
    pub record_type: FinancialType,
    pub category: String,
    pub amount: Decimal,
    pub currency: String,
}

impl FinancialEntry {
    pub fn month_of(date: NaiveDate) -> NaiveDate {
        date.with_day(1).unwrap_or(date)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEntry {
    pub external_id: String,
    pub team_member_id: Option<Uuid>,
    pub date: Option<NaiveDate>,
    pub hours: Option<f64>,
    pub description: Option<String>,
    /// Set when the duration could not be interpreted; the row is still kept.
    pub incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub external_id: String,
    pub title: String,
    pub status: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub labels: Vec<String>,
    pub budget: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Communication {
    pub external_id: String,
    pub channel: String,
    pub author: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub external_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub team_member_id: Uuid,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordBody {
    Financial(FinancialEntry),
    TimeEntry(TimeEntry),
    Deliverable(Deliverable),
    Communication(Communication),
    Meeting(Meeting),
    RoleAssignment(RoleAssignment),
}

impl RecordBody {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordBody::Financial(_) => RecordKind::Financial,
            RecordBody::TimeEntry(_) => RecordKind::TimeEntry,
            RecordBody::Deliverable(_) => RecordKind::Deliverable,
            RecordBody::Communication(_) => RecordKind::Communication,
            RecordBody::Meeting(_) => RecordKind::Meeting,
            RecordBody::RoleAssignment(_) => RecordKind::RoleAssignment,
        }
    }
}

/// Uniqueness key that makes dependent-record upserts idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub kind: RecordKind,
    pub client_id: Uuid,
    pub scope_key: String,
}

/// A row owned by exactly one canonical client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentRecord {
    pub id: Uuid,
    pub client_id: Uuid,
    pub source: Provider,
    pub body: RecordBody,
    pub updated_at: DateTime<Utc>,
}

impl DependentRecord {
    pub fn new(client_id: Uuid, source: Provider, body: RecordBody, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            source,
            body,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.body.kind()
    }

    /// `period|type|category` for financial rows, `source:external_id` for everything else.
    pub fn scope_key(&self) -> String {
        match &self.body {
            RecordBody::Financial(f) => format!(
                "{}|{}|{}",
                f.period.format("%Y-%m"),
                f.record_type.as_str(),
                f.category.trim().to_lowercase()
            ),
            RecordBody::TimeEntry(t) => format!("{}:{}", self.source, t.external_id),
            RecordBody::Deliverable(d) => format!("{}:{}", self.source, d.external_id),
            RecordBody::Communication(c) => format!("{}:{}", self.source, c.external_id),
            RecordBody::Meeting(m) => format!("{}:{}", self.source, m.external_id),
            RecordBody::RoleAssignment(r) => {
                format!("{}:{}/{}", self.source, r.team_member_id, r.role.to_lowercase())
            }
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            kind: self.kind(),
            client_id: self.client_id,
            scope_key: self.scope_key(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(ParseEnumError {
                kind: "sync status",
                value: s.to_string(),
            }),
        }
    }
}

/// Progress record for one orchestrator run, polled by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncImport {
    #[serde(rename = "importId")]
    pub id: Uuid,
    pub provider: Provider,
    pub adapter: String,
    pub status: SyncStatus,
    pub records_found: u64,
    pub records_synced: u64,
    pub records_failed: u64,
    pub records_skipped: u64,
    pub current_step: String,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncImport {
    pub fn start(provider: Provider, adapter: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            adapter: adapter.into(),
            status: SyncStatus::Running,
            records_found: 0,
            records_synced: 0,
            records_failed: 0,
            records_skipped: 0,
            current_step: "starting".to_string(),
            errors: Vec::new(),
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SyncStatus::Running
    }

    pub fn finish(&mut self, status: SyncStatus, step: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.current_step = step.into();
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn provider_round_trips_through_str() {
        for p in Provider::ALL {
            assert_eq!(p.as_str().parse::<Provider>().unwrap(), p);
        }
        assert!("salesforce".parse::<Provider>().is_err());
    }

    #[test]
    fn financial_scope_key_is_month_type_category() {
        let client_id = Uuid::new_v4();
        let record = DependentRecord::new(
            client_id,
            Provider::Sheets,
            RecordBody::Financial(FinancialEntry {
                period: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                record_type: FinancialType::Cost,
                category: " Labor ".into(),
                amount: dec!(1200.50),
                currency: "USD".into(),
            }),
            now(),
        );
        assert_eq!(record.scope_key(), "2024-01|cost|labor");
        assert_eq!(record.natural_key().client_id, client_id);
    }

    #[test]
    fn financial_scope_ignores_source() {
        let client_id = Uuid::new_v4();
        let entry = FinancialEntry {
            period: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            record_type: FinancialType::Revenue,
            category: "retainer".into(),
            amount: dec!(10),
            currency: "USD".into(),
        };
        let a = DependentRecord::new(client_id, Provider::Sheets, RecordBody::Financial(entry.clone()), now());
        let b = DependentRecord::new(client_id, Provider::Quickbooks, RecordBody::Financial(entry), now());
        assert_eq!(a.natural_key(), b.natural_key());
    }

    #[test]
    fn external_scope_key_includes_source() {
        let record = DependentRecord::new(
            Uuid::new_v4(),
            Provider::Slack,
            RecordBody::Communication(Communication {
                external_id: "C1:1700000000.0001".into(),
                channel: "C1".into(),
                author: None,
                sent_at: now(),
                summary: "hi".into(),
            }),
            now(),
        );
        assert_eq!(record.scope_key(), "slack:C1:1700000000.0001");
        assert_eq!(record.kind(), RecordKind::Communication);
    }

    #[test]
    fn month_of_truncates_to_first_day() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 17).unwrap();
        assert_eq!(FinancialEntry::month_of(d), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn sync_import_serializes_for_pollers() {
        let import = SyncImport::start(Provider::Hubspot, "hubspot:deals", now());
        let json = serde_json::to_value(&import).unwrap();
        assert_eq!(json["status"], "running");
        assert!(json.get("importId").is_some());
        assert!(json.get("recordsFound").is_some());
        assert!(json.get("currentStep").is_some());
    }
}
