//! Free-text name → canonical client resolution.
//!
//! Strategies run in order and the first hit wins:
//! alias, exact name, normalized containment, first significant word.
//! A miss is a miss; callers decide whether to create or flag.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::{Alias, Client, Provider};

/// Shorter side of a containment match must have at least this many chars.
pub const MIN_CONTAINMENT_LEN: usize = 4;
/// First-word matching only considers tokens at least this long.
pub const MIN_FIRST_WORD_LEN: usize = 5;

const SERVICE_KEYWORDS: &[&str] = &[
    "ad",
    "ads",
    "advertising",
    "audit",
    "brand",
    "branding",
    "campaign",
    "consulting",
    "content",
    "design",
    "development",
    "email",
    "expansion",
    "influencer",
    "launch",
    "management",
    "marketing",
    "media",
    "paid",
    "phase",
    "pilot",
    "ppc",
    "project",
    "redesign",
    "renewal",
    "retainer",
    "round",
    "search",
    "seo",
    "services",
    "social",
    "strategy",
    "support",
    "upsell",
    "web",
    "website",
];

static TRAILING_PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*[\(\[][^\)\]]*[\)\]]\s*$").expect("static regex"));
static TRAILING_ROUND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)[\s\-–—|:,]*\b(?:(?:round|phase|wave|part)\s*#?\d+|renewal|q[1-4](?:\s*\d{2,4})?)\s*$",
    )
    .expect("static regex")
});
static TRAILING_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-–—|:,]+(19|20)\d{2}\s*$").expect("static regex"));
static SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+[\-–—|:]\s+|\s*\|\s*").expect("static regex"));

/// Lowercase, `&` → `and`, drop punctuation, collapse whitespace.
pub fn normalize_name(input: &str) -> String {
    input
        .to_lowercase()
        .replace('&', " and ")
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip service-line decorations ("- Paid Content", "(Ads Management)", "Round 2")
/// that sources append to the company name.
pub fn extract_company_name(name: &str) -> String {
    let mut current = name.trim().to_string();
    loop {
        let before = current.clone();

        if let Some(m) = TRAILING_PARENTHETICAL.find(&current) {
            if m.start() > 0 {
                current.truncate(m.start());
            }
        }
        if let Some(m) = TRAILING_ROUND.find(&current) {
            if m.start() > 0 {
                current.truncate(m.start());
            }
        }
        if let Some(m) = TRAILING_YEAR.find(&current) {
            if m.start() > 0 {
                current.truncate(m.start());
            }
        }
        if let Some(m) = SEPARATOR.find(&current) {
            let head = current[..m.start()].trim();
            let tail = &current[m.end()..];
            if !head.is_empty() && looks_like_service_line(tail) {
                current = head.to_string();
            }
        }

        current = current.trim().trim_end_matches([',', '-', '|', ':']).trim().to_string();
        if current == before {
            break;
        }
    }
    if current.is_empty() {
        name.trim().to_string()
    } else {
        current
    }
}

fn looks_like_service_line(tail: &str) -> bool {
    normalize_name(tail)
        .split_whitespace()
        .any(|token| SERVICE_KEYWORDS.contains(&token))
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: Uuid,
    pub name: String,
    normalized: String,
}

#[derive(Debug, Clone)]
struct AliasEntry {
    alias_lower: String,
    client_id: Uuid,
}

/// Candidates a name may resolve to, kept in a stable order (lowercase name, then id).
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
    aliases: Vec<AliasEntry>,
}

impl CandidateSet {
    pub fn new(candidates: impl IntoIterator<Item = (Uuid, String)>) -> Self {
        let mut set = Self::default();
        for (id, name) in candidates {
            set.push(id, name);
        }
        set
    }

    /// Clients plus the aliases recorded for `source` that point at one of them.
    pub fn from_clients<'a>(
        clients: impl IntoIterator<Item = &'a Client>,
        aliases: &[Alias],
        source: Provider,
    ) -> Self {
        Self::new(clients.into_iter().map(|c| (c.id, c.name.clone()))).with_aliases(aliases, source)
    }

    /// Adds the aliases recorded for `source` that point at a member.
    pub fn with_aliases(mut self, aliases: &[Alias], source: Provider) -> Self {
        let aliases = aliases
            .iter()
            .filter(|a| a.source == source && self.contains(a.client_id))
            .map(|a| (a.alias.clone(), a.client_id))
            .collect::<Vec<_>>();
        for (alias, client_id) in aliases {
            self.push_alias(alias, client_id);
        }
        self
    }

    pub fn push(&mut self, id: Uuid, name: String) {
        let candidate = Candidate {
            id,
            normalized: normalize_name(&name),
            name,
        };
        let sort_key = |c: &Candidate| (c.name.to_lowercase(), c.id);
        let pos = self
            .candidates
            .partition_point(|c| sort_key(c) <= sort_key(&candidate));
        self.candidates.insert(pos, candidate);
    }

    pub fn push_alias(&mut self, alias: String, client_id: Uuid) {
        self.aliases.push(AliasEntry {
            alias_lower: alias.trim().to_lowercase(),
            client_id,
        });
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.candidates.iter().any(|c| c.id == id)
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn try_match(&self, name: &str, candidates: &CandidateSet) -> Option<Uuid>;
}

pub struct AliasMatch;

impl MatchStrategy for AliasMatch {
    fn name(&self) -> &'static str {
        "alias"
    }

    fn try_match(&self, name: &str, candidates: &CandidateSet) -> Option<Uuid> {
        let needle = name.trim().to_lowercase();
        candidates
            .aliases
            .iter()
            .find(|a| a.alias_lower == needle)
            .map(|a| a.client_id)
    }
}

pub struct ExactNameMatch;

impl MatchStrategy for ExactNameMatch {
    fn name(&self) -> &'static str {
        "exact_name"
    }

    fn try_match(&self, name: &str, candidates: &CandidateSet) -> Option<Uuid> {
        let needle = name.trim().to_lowercase();
        candidates
            .candidates
            .iter()
            .find(|c| c.name.trim().to_lowercase() == needle)
            .map(|c| c.id)
    }
}

pub struct ContainmentMatch {
    pub min_len: usize,
}

impl MatchStrategy for ContainmentMatch {
    fn name(&self) -> &'static str {
        "containment"
    }

    fn try_match(&self, name: &str, candidates: &CandidateSet) -> Option<Uuid> {
        let input = normalize_name(name);
        if input.chars().count() < self.min_len {
            return None;
        }
        let mut best: Option<&Candidate> = None;
        for candidate in &candidates.candidates {
            let (shorter, longer) = if candidate.normalized.len() <= input.len() {
                (candidate.normalized.as_str(), input.as_str())
            } else {
                (input.as_str(), candidate.normalized.as_str())
            };
            if shorter.chars().count() < self.min_len {
                continue;
            }
            if longer.starts_with(shorter) || longer.contains(shorter) {
                // Most specific candidate wins; ties keep set order.
                if best.is_none_or(|b| candidate.normalized.len() > b.normalized.len()) {
                    best = Some(candidate);
                }
            }
        }
        best.map(|c| c.id)
    }
}

pub struct FirstWordMatch {
    pub min_len: usize,
}

impl MatchStrategy for FirstWordMatch {
    fn name(&self) -> &'static str {
        "first_word"
    }

    fn try_match(&self, name: &str, candidates: &CandidateSet) -> Option<Uuid> {
        let input = normalize_name(name);
        let first = input.split_whitespace().next()?;
        if first.chars().count() < self.min_len {
            return None;
        }
        candidates
            .candidates
            .iter()
            .find(|c| c.normalized.split_whitespace().next() == Some(first))
            .map(|c| c.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchHit {
    pub client_id: Uuid,
    pub strategy: &'static str,
}

pub struct EntityMatcher {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl Default for EntityMatcher {
    fn default() -> Self {
        Self::standard()
    }
}

impl EntityMatcher {
    pub fn new(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(AliasMatch),
            Box::new(ExactNameMatch),
            Box::new(ContainmentMatch {
                min_len: MIN_CONTAINMENT_LEN,
            }),
            Box::new(FirstWordMatch {
                min_len: MIN_FIRST_WORD_LEN,
            }),
        ])
    }

    pub fn resolve(&self, name: &str, candidates: &CandidateSet) -> Option<Uuid> {
        self.resolve_detailed(name, candidates).map(|hit| hit.client_id)
    }

    pub fn resolve_detailed(&self, name: &str, candidates: &CandidateSet) -> Option<MatchHit> {
        if name.trim().is_empty() {
            return None;
        }
        self.strategies.iter().find_map(|strategy| {
            strategy.try_match(name, candidates).map(|client_id| MatchHit {
                client_id,
                strategy: strategy.name(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    #[test]
    fn normalize_handles_ampersand_and_punctuation() {
        assert_eq!(normalize_name("  Smith & Sons, Inc. "), "smith and sons inc");
        assert_eq!(normalize_name("A.I.   Co"), "ai co");
    }

    #[test]
    fn extract_company_name_strips_service_suffixes() {
        assert_eq!(extract_company_name("Acme Co - Paid Content"), "Acme Co");
        assert_eq!(extract_company_name("Globex (Ads Management)"), "Globex");
        assert_eq!(extract_company_name("Initech Round 2"), "Initech");
        assert_eq!(extract_company_name("Umbrella | SEO Retainer - 2024"), "Umbrella");
        assert_eq!(extract_company_name("Hooli"), "Hooli");
    }

    #[test]
    fn extract_company_name_keeps_non_service_dash_names() {
        assert_eq!(extract_company_name("Smith - Jones"), "Smith - Jones");
    }

    #[test]
    fn alias_wins_before_exact_name() {
        let mut set = CandidateSet::new([(id(1), "Acme Corporation".into()), (id(2), "ACME".into())]);
        set.push_alias("acme".into(), id(1));
        let hit = EntityMatcher::standard().resolve_detailed("Acme", &set).unwrap();
        assert_eq!(hit.client_id, id(1));
        assert_eq!(hit.strategy, "alias");
    }

    #[test]
    fn exact_name_is_case_insensitive() {
        let set = CandidateSet::new([(id(1), "Globex".into())]);
        let hit = EntityMatcher::standard().resolve_detailed("GLOBEX", &set).unwrap();
        assert_eq!(hit.strategy, "exact_name");
    }

    #[test]
    fn containment_matches_service_suffixed_name() {
        let set = CandidateSet::new([(id(7), "Acme Co".into())]);
        let hit = EntityMatcher::standard()
            .resolve_detailed("Acme Co - Paid Content", &set)
            .unwrap();
        assert_eq!(hit.client_id, id(7));
        assert_eq!(hit.strategy, "containment");
    }

    #[test]
    fn containment_never_fires_below_four_chars() {
        let set = CandidateSet::new([(id(1), "AI Labs Worldwide".into())]);
        let strategy = ContainmentMatch { min_len: 4 };
        assert_eq!(strategy.try_match("AI", &set), None);
        assert_eq!(strategy.try_match("A.I.", &set), None);
        assert_eq!(EntityMatcher::standard().resolve("Co.", &set), None);
    }

    #[test]
    fn containment_prefers_most_specific_candidate() {
        let set = CandidateSet::new([(id(1), "Acme".into()), (id(2), "Acme Rockets".into())]);
        assert_eq!(EntityMatcher::standard().resolve("Acme Rockets West", &set), Some(id(2)));
    }

    #[test]
    fn first_word_requires_five_chars() {
        let set = CandidateSet::new([(id(1), "Team Alpha Partners".into()), (id(2), "Stark Industries".into())]);
        let matcher = EntityMatcher::standard();
        assert_eq!(matcher.resolve("Team Beta", &set), None);
        let hit = matcher.resolve_detailed("Stark Solar", &set).unwrap();
        assert_eq!(hit.client_id, id(2));
        assert_eq!(hit.strategy, "first_word");
    }

    #[test]
    fn unmatched_returns_none() {
        let set = CandidateSet::new([(id(1), "Wayne Enterprises".into())]);
        assert_eq!(EntityMatcher::standard().resolve("Cyberdyne", &set), None);
        assert_eq!(EntityMatcher::standard().resolve("   ", &set), None);
    }

    #[test]
    fn resolution_is_independent_of_insertion_order() {
        let a = CandidateSet::new([(id(1), "Acme West".into()), (id(2), "Acme East".into())]);
        let b = CandidateSet::new([(id(2), "Acme East".into()), (id(1), "Acme West".into())]);
        let matcher = EntityMatcher::standard();
        for name in ["Acme", "acme holdings", "Acme West", "Acmes"] {
            assert_eq!(matcher.resolve(name, &a), matcher.resolve(name, &b), "{name}");
        }
    }

    #[test]
    fn from_clients_only_keeps_aliases_for_source_and_members() {
        let now = chrono::Utc::now();
        let client = Client::new("Acme Co", crate::ClientStatus::Active, now);
        let outsider = Uuid::new_v4();
        let aliases = vec![
            Alias { client_id: client.id, alias: "ACME".into(), source: Provider::Slack, created_at: now },
            Alias { client_id: client.id, alias: "Acme Rockets".into(), source: Provider::Monday, created_at: now },
            Alias { client_id: outsider, alias: "Other".into(), source: Provider::Slack, created_at: now },
        ];
        let set = CandidateSet::from_clients([&client], &aliases, Provider::Slack);
        let alias = AliasMatch;
        assert_eq!(alias.try_match("acme", &set), Some(client.id));
        assert_eq!(alias.try_match("Acme Rockets", &set), None);
        assert_eq!(alias.try_match("Other", &set), None);
    }
}
