use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::collection::Collection;
use crate::config::{CoordinatePart, FieldTarget, TemplateRule};
use crate::entity::EntityId;
use crate::error::RetryError;
use crate::geo::{combine_halves, coordinates_from_parts, format_coordinates, parse_coordinates};
use crate::lookup::EntityResolver;
use crate::registry::{
    PROPERTY_COMMONS_CATEGORY, PROPERTY_COORDINATES, PropertyKind, PropertyRegistry,
    PropertySpec,
};
use crate::remote::{GraphEntityApi, PageTemplates, WikiPageApi};
use crate::retry::RetryPolicy;
use crate::store::unix_timestamp;
use crate::wikitext::{
    link_target_or_text, link_targets, normalize_template_name, strip_category_prefix,
    strip_file_prefix,
};

#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    /// Harvest only this site instead of every configured one.
    pub site: Option<String>,
    /// Maximum number of pages per site.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestReport {
    pub sites: Vec<String>,
    pub pages_selected: usize,
    pub pages_fetched: usize,
    pub pages_missing: usize,
    pub pages_failed: usize,
    pub values_staged: usize,
    pub parameter_errors: usize,
    pub errors: Vec<String>,
}

/// Values pulled from one page, before staging.
#[derive(Debug, Default)]
struct PageHarvest {
    values: BTreeMap<u32, Vec<String>>,
    latitude: Option<String>,
    longitude: Option<String>,
    errors: Vec<String>,
}

impl PageHarvest {
    fn push(&mut self, property: u32, value: String, multiple: bool) {
        let values = self.values.entry(property).or_default();
        if values.contains(&value) || (!multiple && !values.is_empty()) {
            return;
        }
        values.push(value);
    }

    fn is_settled(&self, property: u32, multiple: bool) -> bool {
        !multiple && self.values.contains_key(&property)
    }
}

/// Borrowed view of what extraction needs while the store is written elsewhere.
struct Extractor<'a, P: ?Sized, G: ?Sized> {
    registry: &'a PropertyRegistry,
    resolver: EntityResolver,
    pages: &'a P,
    graph: &'a mut G,
    site: &'a str,
    min_value_len: usize,
}

impl<P, G> Extractor<'_, P, G>
where
    P: WikiPageApi + ?Sized,
    G: GraphEntityApi + ?Sized,
{
    fn extract_page(
        &mut self,
        page: &PageTemplates,
        rules: &BTreeMap<String, TemplateRule>,
        filled: &BTreeSet<u32>,
    ) -> PageHarvest {
        let mut harvest = PageHarvest::default();
        for template in &page.templates {
            let Some(rule) = rules.get(&normalize_template_name(&template.name)) else {
                continue;
            };
            match rule {
                TemplateRule::Named(params) => {
                    for (key, value) in template.named_params() {
                        let Some(target) = params.get(&key) else {
                            continue;
                        };
                        self.extract_named(&mut harvest, *target, &key, &value, filled);
                    }
                }
                TemplateRule::Positional(property) => {
                    let Some(value) = template.positional_params().into_iter().next() else {
                        continue;
                    };
                    if !filled.contains(property) {
                        self.extract_value(&mut harvest, *property, &value);
                    }
                }
                TemplateRule::Coordinates => {
                    if filled.contains(&PROPERTY_COORDINATES)
                        || harvest.values.contains_key(&PROPERTY_COORDINATES)
                    {
                        continue;
                    }
                    match coordinates_from_parts(&template.positional_params()) {
                        Some((latitude, longitude)) => harvest.push(
                            PROPERTY_COORDINATES,
                            format_coordinates(latitude, longitude),
                            false,
                        ),
                        None => harvest.errors.push(format!(
                            "{}: cannot read coordinates from {}",
                            template.name,
                            template.positional_params().join("|")
                        )),
                    }
                }
            }
        }
        self.combine_coordinate_halves(&mut harvest);
        harvest
    }

    fn extract_named(
        &mut self,
        harvest: &mut PageHarvest,
        target: FieldTarget,
        key: &str,
        value: &str,
        filled: &BTreeSet<u32>,
    ) {
        if filled.contains(&target.property) {
            return;
        }
        if value.chars().count() < self.min_value_len {
            return;
        }
        match target.part {
            Some(CoordinatePart::Latitude) => {
                harvest.latitude.get_or_insert_with(|| value.to_string());
            }
            Some(CoordinatePart::Longitude) => {
                harvest.longitude.get_or_insert_with(|| value.to_string());
            }
            None => {
                if let Err(error) = self.try_extract(harvest, target.property, value) {
                    harvest.errors.push(format!("{key}: {error}"));
                }
            }
        }
    }

    fn extract_value(&mut self, harvest: &mut PageHarvest, property: u32, value: &str) {
        if value.chars().count() < self.min_value_len {
            return;
        }
        if let Err(error) = self.try_extract(harvest, property, value) {
            harvest.errors.push(format!("P{property}: {error}"));
        }
    }

    fn try_extract(
        &mut self,
        harvest: &mut PageHarvest,
        property: u32,
        value: &str,
    ) -> std::result::Result<(), String> {
        let registry = self.registry;
        let spec = registry.get(property).map_err(|error| error.to_string())?;
        if harvest.is_settled(property, spec.multiple) {
            return Ok(());
        }
        let extracted = match spec.kind {
            PropertyKind::Entity => {
                return self.extract_entities(harvest, spec, value);
            }
            PropertyKind::Image | PropertyKind::Sound => strip_file_prefix(value),
            PropertyKind::Coordinates => parse_coordinates(value)
                .map(|(latitude, longitude)| format_coordinates(latitude, longitude))
                .ok_or_else(|| format!("cannot read coordinates from `{value}`"))?,
            PropertyKind::String if property == PROPERTY_COMMONS_CATEGORY => {
                strip_category_prefix(value)
            }
            PropertyKind::String => value.trim().to_string(),
            PropertyKind::Integer => {
                let digits = value
                    .chars()
                    .filter(|ch| !ch.is_whitespace() && *ch != '.' && *ch != ',')
                    .collect::<String>();
                if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
                    return Err(format!("`{value}` is not an integer"));
                }
                digits
            }
        };
        if extracted.is_empty() {
            return Err(format!("empty value after cleanup of `{value}`"));
        }
        harvest.push(property, extracted, spec.multiple);
        Ok(())
    }

    /// Every linked page is a candidate. A single-valued property keeps the first one that
    /// passes the constraints, a multi-valued one keeps all that pass.
    fn extract_entities(
        &mut self,
        harvest: &mut PageHarvest,
        spec: &PropertySpec,
        value: &str,
    ) -> std::result::Result<(), String> {
        let mut titles = link_targets(value);
        if titles.is_empty() {
            titles.push(link_target_or_text(value));
        }
        let mut accepted = false;
        let mut rejected = Vec::new();
        for title in titles {
            match self.resolve_entity(&title, &spec.constraints) {
                Ok(candidate) => {
                    harvest.push(spec.id, candidate.to_string(), spec.multiple);
                    accepted = true;
                    if !spec.multiple {
                        break;
                    }
                }
                Err(error) => rejected.push(error),
            }
        }
        if rejected.is_empty() || (accepted && !spec.multiple) {
            Ok(())
        } else {
            Err(rejected.join("; "))
        }
    }

    fn resolve_entity(
        &mut self,
        title: &str,
        constraints: &[EntityId],
    ) -> std::result::Result<EntityId, String> {
        let candidate = self
            .resolver
            .page_item(self.pages, self.site, title)
            .map_err(|error| error.to_string())?
            .ok_or_else(|| format!("no graph item for page `{title}`"))?;
        let accepted = self
            .resolver
            .satisfies_constraints(self.graph, candidate, constraints)
            .map_err(|error| error.to_string())?;
        if !accepted {
            return Err(format!("{candidate} ({title}) fails the class constraints"));
        }
        Ok(candidate)
    }

    fn combine_coordinate_halves(&self, harvest: &mut PageHarvest) {
        let coordinate = PROPERTY_COORDINATES;
        match (harvest.latitude.take(), harvest.longitude.take()) {
            (Some(latitude), Some(longitude)) => {
                if harvest.values.contains_key(&coordinate) {
                    return;
                }
                match combine_halves(&latitude, &longitude) {
                    Some(combined) => harvest.push(coordinate, combined, false),
                    None => harvest
                        .errors
                        .push(format!("cannot combine coordinates `{latitude}` / `{longitude}`")),
                }
            }
            (Some(_), None) => harvest.errors.push("latitude without longitude".to_string()),
            (None, Some(_)) => harvest.errors.push("longitude without latitude".to_string()),
            (None, None) => {}
        }
    }
}

/// Fetch the linked pages of each configured site and stage the values their templates
/// carry for fields the collection has not filled yet.
pub fn harvest_with_api<P, G>(
    collection: &mut Collection,
    options: &HarvestOptions,
    pages: &P,
    graph: &mut G,
) -> Result<HarvestReport>
where
    P: WikiPageApi + ?Sized,
    G: GraphEntityApi + ?Sized,
{
    let Collection {
        settings,
        registry,
        store,
        ..
    } = collection;
    let mut report = HarvestReport::default();
    let sites = match &options.site {
        Some(site) => {
            if !settings.templates.contains_key(site) {
                warn!(site = %site, "no template rules configured for site");
            }
            vec![site.clone()]
        }
        None => settings.templates.keys().cloned().collect(),
    };
    let retry = settings.retry.clone();
    let registry: &PropertyRegistry = registry;
    let mut extractor = Extractor {
        registry,
        resolver: EntityResolver::new(retry.clone()),
        pages,
        graph,
        site: "",
        min_value_len: settings.harvest.min_value_len,
    };

    for site in &sites {
        let Some(rules) = settings.templates.get(site) else {
            continue;
        };
        let targets = settings.site_targets(site).into_iter().collect::<Vec<_>>();
        let now = unix_timestamp()?;
        let cutoff = now.saturating_sub(settings.harvest.freshness.as_secs());
        let selected = store.harvest_candidates(site, &targets, cutoff, options.limit)?;
        report.sites.push(site.clone());
        report.pages_selected += selected.len();
        info!(site = %site, pages = selected.len(), "harvesting site");

        extractor.site = site.as_str();
        let total = selected.len();
        let chunk_size = settings.harvest.chunk_size.max(1);
        for (chunk_index, chunk) in selected.chunks(chunk_size).enumerate() {
            let fetched = fetch_chunk(&retry, pages, site, chunk);
            for (offset, ((item, title), result)) in chunk.iter().zip(fetched).enumerate() {
                let index = chunk_index * chunk_size + offset + 1;
                let page = match result {
                    Ok(page) => page,
                    Err(error) => {
                        warn!(index, total, item = %item, site = %site, title = %title, "{error}");
                        report.pages_failed += 1;
                        report.errors.push(format!("{item} {site}:{title}: {error}"));
                        continue;
                    }
                };
                report.pages_fetched += 1;
                info!(index, total, item = %item, site = %site, title = %title, "harvesting page");

                let now = unix_timestamp()?;
                if !page.exists {
                    report.pages_missing += 1;
                    store.record_harvest_attempt(*item, site, now, "page does not exist")?;
                    continue;
                }
                let filled = store.filled_properties(*item, &targets)?;
                let harvest = extractor.extract_page(&page, rules, &filled);

                for (property, values) in &harvest.values {
                    let multiple = registry.is_multiple(*property)?;
                    let Some(first) = values.first() else {
                        continue;
                    };
                    let staged = if multiple {
                        serde_json::to_string(values)
                            .context("failed to encode multi-valued property")?
                    } else {
                        first.clone()
                    };
                    store.stage_harvested(*item, site, *property, &staged, now)?;
                    report.values_staged += 1;
                }
                if !harvest.errors.is_empty() {
                    warn!(
                        item = %item,
                        site = %site,
                        errors = harvest.errors.len(),
                        "page had extraction errors"
                    );
                    report.parameter_errors += harvest.errors.len();
                }
                store.record_harvest_attempt(*item, site, now, &harvest.errors.join("; "))?;
            }
        }
    }

    store.flush()?;
    info!(
        pages = report.pages_fetched,
        staged = report.values_staged,
        failed = report.pages_failed,
        "harvest finished"
    );
    Ok(report)
}

/// One scoped thread per page, all joined before the chunk is processed.
fn fetch_chunk<P: WikiPageApi + ?Sized>(
    retry: &RetryPolicy,
    pages: &P,
    site: &str,
    chunk: &[(EntityId, String)],
) -> Vec<Result<PageTemplates, RetryError>> {
    thread::scope(|scope| {
        let handles = chunk
            .iter()
            .map(|(_, title)| {
                scope.spawn(move || retry.run("fetch page", || pages.page_templates(site, title)))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(RetryError::Terminal {
                        operation: "fetch page".to_string(),
                        message: "page fetch thread panicked".to_string(),
                    })
                })
            })
            .collect()
    })
}
