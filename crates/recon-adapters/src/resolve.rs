//! Owner resolution for adapters: external key first, then the matcher, then
//! the adapter's creation policy.

use chrono::Utc;
use recon_core::matcher::{extract_company_name, CandidateSet, EntityMatcher};
use recon_core::{Alias, Client, ClientStatus, Provider, TeamMember};
use recon_storage::{Store, StoreError};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    Never,
    Create(ClientStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Existing { client_id: Uuid, via: &'static str },
    Created(Uuid),
    Unmatched,
}

impl Resolution {
    pub fn client_id(&self) -> Option<Uuid> {
        match self {
            Resolution::Existing { client_id, .. } => Some(*client_id),
            Resolution::Created(id) => Some(*id),
            Resolution::Unmatched => None,
        }
    }
}

/// Resolves free-text client names for one batch of one source.
///
/// The candidate set is loaded once and grows as clients are created, so later
/// items in the same batch see clients created by earlier ones.
pub struct ClientResolver<'a> {
    store: &'a dyn Store,
    matcher: &'a EntityMatcher,
    source: Provider,
    candidates: CandidateSet,
}

impl<'a> ClientResolver<'a> {
    pub async fn load(store: &'a dyn Store, matcher: &'a EntityMatcher, source: Provider) -> Result<Self, StoreError> {
        let clients = store.list_clients().await?;
        let aliases = store.list_aliases(Some(source)).await?;
        Ok(Self {
            store,
            matcher,
            source,
            candidates: CandidateSet::from_clients(&clients, &aliases, source),
        })
    }

    pub async fn resolve(
        &mut self,
        raw_name: &str,
        external_id: Option<&str>,
        policy: CreatePolicy,
    ) -> Result<Resolution, StoreError> {
        if let Some(external_id) = external_id {
            if let Some(client) = self.store.find_client_by_external_id(self.source, external_id).await? {
                return Ok(Resolution::Existing {
                    client_id: client.id,
                    via: "external_id",
                });
            }
        }

        let company = extract_company_name(raw_name);
        let hit = self
            .matcher
            .resolve_detailed(&company, &self.candidates)
            .or_else(|| {
                (company != raw_name.trim())
                    .then(|| self.matcher.resolve_detailed(raw_name, &self.candidates))
                    .flatten()
            });

        if let Some(hit) = hit {
            self.learn(hit.client_id, raw_name, hit.strategy, external_id).await?;
            return Ok(Resolution::Existing {
                client_id: hit.client_id,
                via: hit.strategy,
            });
        }

        let CreatePolicy::Create(status) = policy else {
            debug!(name = raw_name, source = %self.source, "no client match");
            return Ok(Resolution::Unmatched);
        };
        if company.trim().is_empty() {
            return Ok(Resolution::Unmatched);
        }

        let mut client = Client::new(company.clone(), status, Utc::now());
        if let Some(external_id) = external_id {
            client = client.with_external_id(self.source, external_id);
        }
        match self.store.insert_client(&client).await {
            Ok(()) => {}
            Err(StoreError::UniqueViolation(_)) if external_id.is_some() => {
                // Another run created it first.
                let key = external_id.unwrap_or_default();
                if let Some(existing) = self.store.find_client_by_external_id(self.source, key).await? {
                    return Ok(Resolution::Existing {
                        client_id: existing.id,
                        via: "external_id",
                    });
                }
                return Err(StoreError::UniqueViolation(format!("{}:{key}", self.source)));
            }
            Err(err) => return Err(err),
        }
        info!(client = %client.name, source = %self.source, "created client");
        self.candidates.push(client.id, client.name.clone());
        Ok(Resolution::Created(client.id))
    }

    /// Remember what the match taught us: the source key, and the name as an alias.
    async fn learn(
        &mut self,
        client_id: Uuid,
        raw_name: &str,
        strategy: &'static str,
        external_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let Some(mut client) = self.store.get_client(client_id).await? else {
            return Ok(());
        };
        if let Some(external_id) = external_id {
            if !client.has_source(self.source) {
                client.external_ids.insert(self.source, external_id.to_string());
                client.updated_at = Utc::now();
                match self.store.update_client(&client).await {
                    Ok(()) | Err(StoreError::UniqueViolation(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        let name = raw_name.trim();
        if strategy != "alias" && !name.is_empty() && !name.eq_ignore_ascii_case(client.name.trim()) {
            let alias = Alias {
                client_id,
                alias: name.to_string(),
                source: self.source,
                created_at: Utc::now(),
            };
            if self.store.insert_alias(&alias).await? {
                self.candidates.push_alias(alias.alias, client_id);
            }
        }
        Ok(())
    }
}

/// Find a team member by source user id, then case-insensitive name, then email.
pub async fn find_team_member(
    store: &dyn Store,
    source: Provider,
    external_id: Option<&str>,
    name: Option<&str>,
    email: Option<&str>,
) -> Result<Option<TeamMember>, StoreError> {
    if let Some(external_id) = external_id {
        if let Some(member) = store.find_team_member_by_external_id(source, external_id).await? {
            return Ok(Some(member));
        }
    }
    let members = store.list_team_members().await?;
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        if let Some(member) = members.iter().find(|m| m.name.trim().eq_ignore_ascii_case(name)) {
            return Ok(Some(member.clone()));
        }
    }
    if let Some(email) = email.map(str::trim).filter(|e| !e.is_empty()) {
        if let Some(member) = members
            .iter()
            .find(|m| m.email.as_deref().is_some_and(|e| e.eq_ignore_ascii_case(email)))
        {
            return Ok(Some(member.clone()));
        }
    }
    Ok(None)
}
