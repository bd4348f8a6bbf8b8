//! Scripted stand-ins for the remote seams, shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cache::CacheMode;
use crate::collection::Collection;
use crate::config::{
    CacheSettings, CollectionSettings, CoordinatePart, FieldTarget, HarvestSettings, TemplateRule,
};
use crate::entity::EntityId;
use crate::error::RemoteError;
use crate::query::ArticleRequirement;
use crate::registry::PropertyRegistry;
use crate::remote::{
    ClaimValue, Credentials, EntitySnapshot, GraphEntityApi, GraphQueryApi, GraphWriteApi,
    PageTemplates, Provenance, TemplateInvocation, WikiPageApi,
};
use crate::retry::RetryPolicy;

pub const MOCK_MODIFIED: &str = "2024-01-01T00:00:00Z";

/// French churches with `frwiki` rules for the templates the tests use. Rules whose
/// target is not among `properties` are left out.
pub fn test_settings(properties: &[u32]) -> CollectionSettings {
    let has = |property: u32| properties.contains(&property);
    let mut rules = BTreeMap::new();
    if has(373) {
        rules.insert("commonscat".to_string(), TemplateRule::Positional(373));
    }
    if has(625) {
        rules.insert("coord".to_string(), TemplateRule::Coordinates);
    }
    let named = [
        ("image", 18, None),
        ("commons", 373, None),
        ("latitude", 625, Some(CoordinatePart::Latitude)),
        ("longitude", 625, Some(CoordinatePart::Longitude)),
        ("diocèse", 708, None),
        ("protection", 1435, None),
        ("mérimée", 380, None),
        ("audio", 51, None),
    ]
    .into_iter()
    .filter(|(_, property, _)| has(*property))
    .map(|(key, property, part)| (key.to_string(), FieldTarget { property, part }))
    .collect::<BTreeMap<_, _>>();
    if !named.is_empty() {
        rules.insert("infobox monument".to_string(), TemplateRule::Named(named));
    }

    CollectionSettings {
        name: "churches".to_string(),
        types: vec![EntityId(16970)],
        properties: properties.to_vec(),
        languages: vec!["fr".to_string()],
        country: Some(EntityId(142)),
        article_requirement: ArticleRequirement::OptionalPerLanguage,
        cache: CacheSettings {
            ttl_days: 1,
            mode: CacheMode::ServeIfFresh,
        },
        harvest: HarvestSettings {
            freshness: Duration::from_secs(30 * 86_400),
            chunk_size: 4,
            min_value_len: 3,
        },
        commit_every: 10,
        retry: RetryPolicy::immediate(3),
        templates: BTreeMap::from([("frwiki".to_string(), rules)]),
    }
}

pub fn test_collection(dir: &Path, properties: &[u32]) -> Collection {
    Collection::open(
        test_settings(properties),
        PropertyRegistry::builtin(),
        &dir.join("data").join("collections.db"),
        &dir.join("cache"),
    )
    .expect("open test collection")
}

#[derive(Debug, Default)]
pub struct MockQuery {
    pub responses: VecDeque<Result<String, RemoteError>>,
    pub queries: Vec<String>,
}

impl MockQuery {
    pub fn with_responses(responses: Vec<Result<String, RemoteError>>) -> Self {
        Self {
            responses: responses.into(),
            queries: Vec::new(),
        }
    }
}

impl GraphQueryApi for MockQuery {
    fn run_query(&mut self, query: &str) -> Result<String, RemoteError> {
        self.queries.push(query.to_string());
        self.responses
            .pop_front()
            .unwrap_or_else(|| Err(RemoteError::terminal("no scripted response")))
    }

    fn request_count(&self) -> usize {
        self.queries.len()
    }
}

#[derive(Debug, Default)]
pub struct MockGraph {
    pub entities: HashMap<EntityId, EntitySnapshot>,
    pub redirects: HashMap<EntityId, EntityId>,
    pub entity_fetches: usize,
    pub entity_failures: VecDeque<RemoteError>,
    pub logged_in: bool,
    pub login_calls: usize,
    pub login_failure: Option<RemoteError>,
    pub claims_written: Vec<(EntityId, u32, ClaimValue, Provenance)>,
    pub write_failures: HashMap<(EntityId, u32), RemoteError>,
    /// Claims accepted per cell before further writes to it fail.
    pub write_limits: HashMap<(EntityId, u32), usize>,
}

impl MockGraph {
    pub fn add_entity(&mut self, id: EntityId, claims: &[(u32, &[&str])]) {
        let claims = claims
            .iter()
            .map(|(property, values)| {
                (
                    *property,
                    values.iter().map(|value| value.to_string()).collect(),
                )
            })
            .collect::<BTreeMap<_, _>>();
        self.entities.insert(
            id,
            EntitySnapshot {
                id,
                modified: Some(MOCK_MODIFIED.to_string()),
                claims,
                sitelinks: BTreeMap::new(),
            },
        );
    }

    pub fn add_redirect(&mut self, from: EntityId, to: EntityId) {
        self.redirects.insert(from, to);
    }
}

impl GraphEntityApi for MockGraph {
    fn get_entity(&mut self, id: EntityId) -> Result<Option<EntitySnapshot>, RemoteError> {
        self.entity_fetches += 1;
        if let Some(error) = self.entity_failures.pop_front() {
            return Err(error);
        }
        let target = self.redirects.get(&id).copied().unwrap_or(id);
        Ok(self.entities.get(&target).cloned())
    }
}

impl GraphWriteApi for MockGraph {
    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn login(&mut self, _credentials: &Credentials) -> Result<(), RemoteError> {
        self.login_calls += 1;
        if let Some(error) = self.login_failure.clone() {
            return Err(error);
        }
        self.logged_in = true;
        Ok(())
    }

    fn add_claim(
        &mut self,
        item: EntityId,
        property: u32,
        value: &ClaimValue,
        provenance: &Provenance,
    ) -> Result<(), RemoteError> {
        if let Some(error) = self.write_failures.get(&(item, property)) {
            return Err(error.clone());
        }
        if let Some(limit) = self.write_limits.get(&(item, property)) {
            let accepted = self
                .claims_written
                .iter()
                .filter(|(written, written_property, ..)| {
                    *written == item && *written_property == property
                })
                .count();
            if accepted >= *limit {
                return Err(RemoteError::terminal("modification-failed"));
            }
        }
        self.claims_written
            .push((item, property, value.clone(), provenance.clone()));
        let entity = self.entities.entry(item).or_insert_with(|| EntitySnapshot {
            id: item,
            modified: None,
            claims: BTreeMap::new(),
            sitelinks: BTreeMap::new(),
        });
        entity
            .claims
            .entry(property)
            .or_default()
            .push(value.local_text());
        entity.modified = Some("2024-06-01T00:00:00Z".to_string());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockPages {
    pub pages: HashMap<(String, String), PageTemplates>,
    pub items: HashMap<(String, String), EntityId>,
    pub existing: HashSet<(String, String)>,
    pub failures: HashMap<(String, String), RemoteError>,
    pub requests: AtomicUsize,
}

impl MockPages {
    pub fn add_page(&mut self, site: &str, title: &str, templates: Vec<TemplateInvocation>) {
        self.pages.insert(
            key(site, title),
            PageTemplates {
                exists: true,
                redirect: None,
                templates,
            },
        );
    }

    pub fn bind_item(&mut self, site: &str, title: &str, item: EntityId) {
        self.items.insert(key(site, title), item);
    }

    pub fn add_existing(&mut self, site: &str, title: &str) {
        self.existing.insert(key(site, title));
    }

    pub fn fail_page(&mut self, site: &str, title: &str, error: RemoteError) {
        self.failures.insert(key(site, title), error);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl WikiPageApi for MockPages {
    fn page_templates(&self, site: &str, title: &str) -> Result<PageTemplates, RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.get(&key(site, title)) {
            return Err(error.clone());
        }
        Ok(self.pages.get(&key(site, title)).cloned().unwrap_or_default())
    }

    fn page_item(&self, site: &str, title: &str) -> Result<Option<EntityId>, RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.get(&key(site, title)).copied())
    }

    fn page_exists(&self, site: &str, title: &str) -> Result<bool, RemoteError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let key = key(site, title);
        Ok(self.existing.contains(&key) || self.pages.contains_key(&key))
    }
}

fn key(site: &str, title: &str) -> (String, String) {
    (site.to_string(), title.to_string())
}
