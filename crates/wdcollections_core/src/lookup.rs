use std::collections::HashMap;
use std::hash::Hash;

use tracing::debug;

use crate::entity::EntityId;
use crate::error::RetryError;
use crate::registry::{PROPERTY_INSTANCE_OF, PROPERTY_SUBCLASS_OF};
use crate::remote::{GraphEntityApi, WikiPageApi};
use crate::retry::RetryPolicy;

/// Get-or-fetch memo owned by whoever runs a phase. Failed fetches are not cached.
#[derive(Debug, Clone)]
pub struct LookupCache<K, V> {
    entries: HashMap<K, V>,
    hits: usize,
    misses: usize,
}

impl<K, V> Default for LookupCache<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> LookupCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_fetch<E, F>(&mut self, key: &K, fetch: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        if let Some(value) = self.entries.get(key) {
            self.hits += 1;
            return Ok(value.clone());
        }
        self.misses += 1;
        let value = fetch(key)?;
        self.entries.insert(key.clone(), value.clone());
        Ok(value)
    }

    pub fn invalidate(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }
}

/// Resolves wiki pages to graph items and checks class constraints, memoizing every
/// remote answer for the lifetime of one phase.
#[derive(Debug, Clone)]
pub struct EntityResolver {
    retry: RetryPolicy,
    page_items: LookupCache<(String, String), Option<EntityId>>,
    classes: LookupCache<EntityId, Vec<EntityId>>,
    superclasses: LookupCache<EntityId, Vec<EntityId>>,
}

impl EntityResolver {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            page_items: LookupCache::new(),
            classes: LookupCache::new(),
            superclasses: LookupCache::new(),
        }
    }

    pub fn page_item<P: WikiPageApi + ?Sized>(
        &mut self,
        pages: &P,
        site: &str,
        title: &str,
    ) -> Result<Option<EntityId>, RetryError> {
        let key = (site.to_string(), normalize_title(title));
        let retry = &self.retry;
        self.page_items.get_or_fetch(&key, |(site, title)| {
            retry.run("resolve page item", || pages.page_item(site, title))
        })
    }

    /// `P31` classes of an item.
    pub fn classes_of<G: GraphEntityApi + ?Sized>(
        &mut self,
        graph: &mut G,
        item: EntityId,
    ) -> Result<Vec<EntityId>, RetryError> {
        let retry = &self.retry;
        self.classes.get_or_fetch(&item, |item| {
            fetch_entity_values(retry, graph, *item, PROPERTY_INSTANCE_OF)
        })
    }

    /// Direct `P279` superclasses of a class.
    pub fn superclasses_of<G: GraphEntityApi + ?Sized>(
        &mut self,
        graph: &mut G,
        class: EntityId,
    ) -> Result<Vec<EntityId>, RetryError> {
        let retry = &self.retry;
        self.superclasses.get_or_fetch(&class, |class| {
            fetch_entity_values(retry, graph, *class, PROPERTY_SUBCLASS_OF)
        })
    }

    /// A candidate passes when one of its classes, or a direct superclass of one of
    /// them, is in `constraints`. An empty constraint set accepts everything.
    pub fn satisfies_constraints<G: GraphEntityApi + ?Sized>(
        &mut self,
        graph: &mut G,
        candidate: EntityId,
        constraints: &[EntityId],
    ) -> Result<bool, RetryError> {
        if constraints.is_empty() {
            return Ok(true);
        }
        let classes = self.classes_of(graph, candidate)?;
        if classes.iter().any(|class| constraints.contains(class)) {
            return Ok(true);
        }
        for class in classes {
            let parents = self.superclasses_of(graph, class)?;
            if parents.iter().any(|parent| constraints.contains(parent)) {
                return Ok(true);
            }
        }
        debug!(candidate = %candidate, "candidate fails class constraints");
        Ok(false)
    }

    pub fn invalidate_item(&mut self, item: EntityId) {
        self.classes.invalidate(&item);
        self.superclasses.invalidate(&item);
    }
}

fn fetch_entity_values<G: GraphEntityApi + ?Sized>(
    retry: &RetryPolicy,
    graph: &mut G,
    item: EntityId,
    property: u32,
) -> Result<Vec<EntityId>, RetryError> {
    let snapshot = retry.run("fetch entity", || graph.get_entity(item))?;
    Ok(snapshot
        .map(|snapshot| snapshot.entity_values(property))
        .unwrap_or_default())
}

/// Page titles compare with underscores as spaces and a capitalized first letter.
pub fn normalize_title(title: &str) -> String {
    let spaced = title.replace('_', " ");
    let trimmed = spaced.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
