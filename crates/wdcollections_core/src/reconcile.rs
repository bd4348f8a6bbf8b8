use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, CacheMode};
use crate::collection::Collection;
use crate::entity::EntityId;
use crate::error::{RemoteError, RetryError};
use crate::query::{VAR_DEPOT, VAR_ITEM, VAR_MODIFIED, description_var, label_var, title_var};
use crate::registry::{DEPOT_SITE, property_column, wiki_site_for_language};
use crate::remote::{GraphEntityApi, GraphQueryApi, QueryRow, parse_query_rows};
use crate::wikitext::has_category_prefix;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Overrides the configured cache mode for this run.
    pub cache_mode: Option<CacheMode>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub cache_mode: String,
    /// `hit`, `stale`, `miss` or `bypassed`.
    pub cache: String,
    pub skipped_cycle: bool,
    pub rows: usize,
    pub items: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub values_written: usize,
    pub links_written: usize,
    pub labels_written: usize,
    pub warnings: Vec<String>,
    pub request_count: usize,
    pub write_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutdatedReport {
    pub checked: usize,
    pub refreshed: usize,
    pub renamed: usize,
    pub merged: usize,
    pub missing: usize,
    pub values_written: usize,
    pub errors: Vec<String>,
}

/// Pull the collection's query result and fold it into the local store. Items whose
/// upstream timestamp equals the stored one are left alone.
pub fn sync_with_api<Q: GraphQueryApi + ?Sized>(
    collection: &mut Collection,
    options: &SyncOptions,
    api: &mut Q,
) -> Result<SyncReport> {
    let mode = options.cache_mode.unwrap_or(collection.settings.cache.mode);
    let query = collection.query_builder().build();
    let mut report = SyncReport {
        cache_mode: mode.as_str().to_string(),
        ..SyncReport::default()
    };
    let writes_before = collection.store.write_count();

    let lookup = match mode {
        CacheMode::Refresh => None,
        CacheMode::SkipIfFresh | CacheMode::ServeIfFresh => Some(collection.cache.lookup(&query)?),
    };
    report.cache = match &lookup {
        None => "bypassed",
        Some(CacheLookup::Fresh(_)) => "hit",
        Some(CacheLookup::Stale) => "stale",
        Some(CacheLookup::Missing) => "miss",
    }
    .to_string();
    debug!(collection = collection.name(), cache = %report.cache, "cache decision");

    let cached_rows = match (mode, lookup) {
        (CacheMode::SkipIfFresh, Some(CacheLookup::Fresh(_))) => {
            info!(collection = collection.name(), "query result is fresh, skipping sync cycle");
            report.skipped_cycle = true;
            return Ok(report);
        }
        (CacheMode::ServeIfFresh, Some(CacheLookup::Fresh(payload))) => {
            match parse_query_rows(&payload) {
                Ok(rows) => Some(rows),
                Err(error) => {
                    let message = format!("ignoring unreadable cache entry: {error}");
                    warn!(collection = collection.name(), "{message}");
                    report.warnings.push(message);
                    None
                }
            }
        }
        _ => None,
    };

    let rows = match cached_rows {
        Some(rows) => rows,
        None => {
            let (body, rows) = collection
                .settings
                .retry
                .run("graph query", || {
                    let body = api.run_query(&query)?;
                    let rows = parse_query_rows(&body)
                        .map_err(|error| RemoteError::from_json("graph query results", &error))?;
                    Ok((body, rows))
                })
                .with_context(|| format!("failed to query collection {}", collection.name()))?;
            collection.cache.put(&query, &body)?;
            rows
        }
    };
    report.rows = rows.len();
    report.request_count = api.request_count();

    let grouped = group_rows(rows, &mut report.warnings);
    report.items = grouped.len();
    let local = collection.store.last_modified_map()?;
    let total = grouped.len();

    for (index, (item, rows)) in grouped.into_iter().enumerate() {
        let modified = rows
            .iter()
            .find_map(|row| row.get(VAR_MODIFIED))
            .cloned();
        match local.get(&item) {
            Some(stored) if stored.is_some() && *stored == modified => {
                report.unchanged += 1;
                continue;
            }
            Some(_) => report.updated += 1,
            None => report.created += 1,
        }
        info!(index = index + 1, total, item = %item, "syncing item");
        apply_rows(collection, item, modified.as_deref(), &rows, &mut report)?;
    }

    collection.store.flush()?;
    report.write_count = collection.store.write_count() - writes_before;
    info!(
        collection = collection.name(),
        items = report.items,
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        "sync finished"
    );
    Ok(report)
}

fn group_rows(
    rows: Vec<QueryRow>,
    warnings: &mut Vec<String>,
) -> BTreeMap<EntityId, Vec<QueryRow>> {
    let mut grouped: BTreeMap<EntityId, Vec<QueryRow>> = BTreeMap::new();
    for row in rows {
        let Some(item) = row.get(VAR_ITEM).and_then(|value| EntityId::parse(value)) else {
            warnings.push(format!(
                "skipping result row without a usable item: {:?}",
                row.get(VAR_ITEM)
            ));
            continue;
        };
        grouped.entry(item).or_default().push(row);
    }
    grouped
}

fn apply_rows(
    collection: &mut Collection,
    item: EntityId,
    modified: Option<&str>,
    rows: &[QueryRow],
    report: &mut SyncReport,
) -> Result<()> {
    collection.store.upsert_item(item, modified)?;

    for property in collection.settings.properties.clone() {
        let (kind, multiple) = match collection.registry.get(property) {
            Ok(spec) => (spec.kind, spec.multiple),
            Err(error) => {
                warn!(property, "{error}");
                report.warnings.push(error.to_string());
                continue;
            }
        };
        let column = property_column(property);
        let mut values: Vec<String> = Vec::new();
        for raw in rows.iter().filter_map(|row| row.get(&column)) {
            if let Some(value) = kind.decode_query_value(raw)
                && !values.contains(&value)
            {
                values.push(value);
            }
        }
        let Some(first) = values.first() else {
            continue;
        };
        let stored = if multiple {
            serde_json::to_string(&values).context("failed to encode multi-valued property")?
        } else {
            first.clone()
        };
        collection
            .store
            .set_item_value(item, property, Some(&stored))?;
        report.values_written += 1;
    }

    for language in collection.settings.languages.clone() {
        if let Some(title) = first_value(rows, &title_var(&language)) {
            collection
                .store
                .upsert_interwiki(item, &wiki_site_for_language(&language), title)?;
            report.links_written += 1;
        }
        let label = first_value(rows, &label_var(&language));
        let description = first_value(rows, &description_var(&language));
        if label.is_some() || description.is_some() {
            collection
                .store
                .upsert_label(item, &language, label, description)?;
            report.labels_written += 1;
        }
    }
    if let Some(depot) = first_value(rows, VAR_DEPOT) {
        collection.store.upsert_interwiki(item, DEPOT_SITE, depot)?;
        report.links_written += 1;
    }
    Ok(())
}

fn first_value<'a>(rows: &'a [QueryRow], variable: &str) -> Option<&'a str> {
    rows.iter()
        .find_map(|row| row.get(variable))
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}

/// Refresh every row whose `last_modified` is null from the entity itself, following
/// identity redirects.
pub fn update_outdated_with_api<G: GraphEntityApi + ?Sized>(
    collection: &mut Collection,
    api: &mut G,
) -> Result<OutdatedReport> {
    let mut report = OutdatedReport::default();
    let outdated = collection.store.outdated_items()?;
    let total = outdated.len();

    for (index, item) in outdated.into_iter().enumerate() {
        report.checked += 1;
        let fetched = collection
            .settings
            .retry
            .run("fetch entity", || api.get_entity(item));
        let snapshot = match fetched {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                warn!(item = %item, "entity no longer exists upstream");
                report.missing += 1;
                report.errors.push(format!("{item}: missing upstream"));
                continue;
            }
            Err(error @ RetryError::RetryExhausted { .. }) => {
                collection.store.flush()?;
                return Err(error).context("graph is unavailable, stopping outdated refresh");
            }
            Err(error) => {
                warn!(item = %item, "{error}");
                report.errors.push(format!("{item}: {error}"));
                continue;
            }
        };

        let mut target = item;
        if snapshot.id != item {
            if collection.store.contains_item(snapshot.id)? {
                info!(from = %item, to = %snapshot.id, "dropping redirected duplicate");
                collection.store.delete_item(item)?;
                report.merged += 1;
                continue;
            }
            info!(from = %item, to = %snapshot.id, "renaming redirected item");
            collection.store.rename_item(item, snapshot.id)?;
            report.renamed += 1;
            target = snapshot.id;
        }

        info!(index = index + 1, total, item = %target, "refreshing outdated item");
        for property in collection.settings.properties.clone() {
            let multiple = match collection.registry.is_multiple(property) {
                Ok(multiple) => multiple,
                Err(error) => {
                    warn!(property, "{error}");
                    continue;
                }
            };
            let values = snapshot.values(property);
            let Some(first) = values.first() else {
                continue;
            };
            let stored = if multiple {
                serde_json::to_string(values).context("failed to encode multi-valued property")?
            } else {
                first.clone()
            };
            collection
                .store
                .set_item_value(target, property, Some(&stored))?;
            report.values_written += 1;
        }
        for language in collection.settings.languages.clone() {
            let site = wiki_site_for_language(&language);
            if let Some(title) = snapshot.sitelinks.get(&site) {
                collection.store.upsert_interwiki(target, &site, title)?;
            }
        }
        if let Some(depot) = snapshot.sitelinks.get(DEPOT_SITE)
            && has_category_prefix(depot)
        {
            collection.store.upsert_interwiki(target, DEPOT_SITE, depot)?;
        }
        collection
            .store
            .upsert_item(target, snapshot.modified.as_deref())?;
        report.refreshed += 1;
    }

    collection.store.flush()?;
    info!(
        collection = collection.name(),
        checked = report.checked,
        refreshed = report.refreshed,
        renamed = report.renamed,
        merged = report.merged,
        "outdated refresh finished"
    );
    Ok(report)
}
