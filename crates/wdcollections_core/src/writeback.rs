use std::collections::HashSet;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::collection::Collection;
use crate::entity::EntityId;
use crate::error::RetryError;
use crate::geo::parse_coordinates;
use crate::lookup::{EntityResolver, LookupCache, normalize_title};
use crate::registry::{
    DEPOT_SITE, LEGACY_IMAGE_PROPERTIES, PROPERTY_COMMONS_CATEGORY, PropertyKind, PropertySpec,
    known_site,
};
use crate::remote::{
    ClaimValue, Credentials, EntitySnapshot, GraphEntityApi, GraphWriteApi, Provenance,
    WikiPageApi,
};
use crate::retry::RetryPolicy;
use crate::wikitext::{has_category_prefix, strip_category_prefix, strip_file_prefix};

const IMAGE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "gif", "svg", "tif", "tiff", "webp", "xcf"];
const SOUND_EXTENSIONS: &[&str] = &["ogg", "oga", "mp3", "wav", "flac", "opus", "webm"];
const PROPERTY_MERIMEE: u32 = 380;

#[derive(Debug, Clone, Default)]
pub struct WriteBackOptions {
    /// Write only this property instead of every collection property.
    pub property: Option<u32>,
    /// Report what would be written without logging in or writing.
    pub dry_run: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteAction {
    pub item: EntityId,
    pub property: u32,
    pub value: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WriteBackReport {
    pub dry_run: bool,
    pub candidates: usize,
    pub written: usize,
    pub would_write: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Multi-valued cells where some claims were written before a failure.
    pub partial: usize,
    /// Set when the graph stopped answering and the batch was cut short.
    pub aborted: bool,
    pub actions: Vec<WriteAction>,
    pub errors: Vec<String>,
}

/// A value that may fill an empty canonical cell.
#[derive(Debug, Clone)]
struct Candidate {
    item: EntityId,
    property: u32,
    source: String,
    value: String,
    /// `false` for values read from a depot link rather than a harvested row.
    staged: bool,
}

enum Rejection {
    Invalid(String),
    Remote(RetryError),
}

impl From<RetryError> for Rejection {
    fn from(error: RetryError) -> Self {
        Self::Remote(error)
    }
}

/// Push harvested values, and depot categories, to the graph for cells the graph does
/// not fill yet.
pub fn write_back_with_api<G, P>(
    collection: &mut Collection,
    options: &WriteBackOptions,
    graph: &mut G,
    pages: &P,
    credentials: Option<&Credentials>,
) -> Result<WriteBackReport>
where
    G: GraphEntityApi + GraphWriteApi + ?Sized,
    P: WikiPageApi + ?Sized,
{
    let properties = match options.property {
        Some(property) => {
            if !collection.settings.has_property(property) {
                bail!(
                    "P{property} is not one of the properties of collection {}",
                    collection.name()
                );
            }
            vec![property]
        }
        None => collection.settings.properties.clone(),
    };
    let mut report = WriteBackReport {
        dry_run: options.dry_run,
        ..WriteBackReport::default()
    };

    let mut candidates = collect_candidates(collection, &properties, options.limit)?;
    if let Some(limit) = options.limit {
        candidates.truncate(limit);
    }
    report.candidates = candidates.len();
    if candidates.is_empty() {
        info!(collection = collection.name(), "nothing to write back");
        return Ok(report);
    }

    let retry = collection.settings.retry.clone();
    if !options.dry_run && !graph.is_logged_in() {
        let credentials = credentials
            .context("writing needs credentials: set WDC_BOT_USER and WDC_BOT_PASS")?;
        retry
            .run("login", || graph.login(credentials))
            .context("failed to log in to the graph")?;
    }

    let Collection {
        registry, store, ..
    } = collection;
    let mut snapshots: LookupCache<EntityId, Option<EntitySnapshot>> = LookupCache::new();
    let mut resolver = EntityResolver::new(retry.clone());
    let mut done: HashSet<(EntityId, u32)> = HashSet::new();
    let total = candidates.len();

    for (index, candidate) in candidates.into_iter().enumerate() {
        let Candidate {
            item,
            property,
            ref source,
            ref value,
            staged,
        } = candidate;
        if done.contains(&(item, property)) {
            report.skipped += 1;
            continue;
        }
        let spec = registry.get(property)?;

        let snapshot = match snapshots.get_or_fetch(&item, |item| {
            retry.run("fetch entity", || graph.get_entity(*item))
        }) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                report.failed += 1;
                report.errors.push(format!("{item}: missing upstream"));
                continue;
            }
            Err(error @ RetryError::RetryExhausted { .. }) => {
                abort(&mut report, &error);
                break;
            }
            Err(error) => {
                report.failed += 1;
                report.errors.push(format!("{item}: {error}"));
                continue;
            }
        };
        if snapshot.has_property(property) {
            info!(item = %item, property, "already present upstream, skipping");
            report.skipped += 1;
            if !options.dry_run {
                store.mark_outdated(item)?;
            }
            continue;
        }

        let claims = match encode_candidate(
            spec,
            value,
            &snapshot,
            &retry,
            &mut resolver,
            graph,
            pages,
        ) {
            Ok(claims) => claims,
            Err(Rejection::Remote(error @ RetryError::RetryExhausted { .. })) => {
                abort(&mut report, &error);
                break;
            }
            Err(Rejection::Remote(error)) => {
                report.failed += 1;
                report.errors.push(format!("{item} P{property} from {source}: {error}"));
                continue;
            }
            Err(Rejection::Invalid(message)) => {
                warn!(item = %item, property, source = %source, "{message}");
                report.failed += 1;
                report.errors.push(format!("{item} P{property} from {source}: {message}"));
                continue;
            }
        };

        let provenance = known_site(source)
            .map(|site| Provenance::Site {
                site: site.id.to_string(),
                item: site.item,
            })
            .unwrap_or_else(|| Provenance::Url(source.clone()));
        let action = WriteAction {
            item,
            property,
            value: claims
                .iter()
                .map(ClaimValue::local_text)
                .collect::<Vec<_>>()
                .join(", "),
            source: provenance.source_label().to_string(),
        };

        if options.dry_run {
            report.would_write += 1;
            report.actions.push(action);
            done.insert((item, property));
            continue;
        }

        info!(index = index + 1, total, item = %item, property, "writing claim");
        let mut written = Vec::new();
        let mut failure = None;
        for claim in &claims {
            match retry.run("add claim", || graph.add_claim(item, property, claim, &provenance)) {
                Ok(()) => written.push(claim.local_text()),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        snapshots.invalidate(&item);
        resolver.invalidate_item(item);
        if !written.is_empty() {
            let text = if spec.multiple {
                serde_json::to_string(&written).context("failed to encode written values")?
            } else {
                written.join(", ")
            };
            store.set_item_value(item, property, Some(&text))?;
            store.mark_outdated(item)?;
            done.insert((item, property));
        }
        let Some(error) = failure else {
            report.written += 1;
            report.actions.push(action);
            if staged {
                store.clear_harvested(item, source, property)?;
            }
            continue;
        };
        if !written.is_empty() {
            report.partial += 1;
            report.errors.push(format!(
                "{item} P{property} from {source}: wrote {} of {} values before failing",
                written.len(),
                claims.len()
            ));
            report.actions.push(WriteAction {
                value: written.join(", "),
                ..action
            });
        }
        if matches!(error, RetryError::RetryExhausted { .. }) {
            abort(&mut report, &error);
            break;
        }
        report.failed += 1;
        report.errors.push(format!("{item} P{property} from {source}: {error}"));
    }

    store.flush()?;
    info!(
        written = report.written,
        would_write = report.would_write,
        skipped = report.skipped,
        failed = report.failed,
        aborted = report.aborted,
        "write back finished"
    );
    Ok(report)
}

fn abort(report: &mut WriteBackReport, error: &RetryError) {
    warn!("{error}; stopping write back");
    report.aborted = true;
    report.errors.push(error.to_string());
}

fn collect_candidates(
    collection: &Collection,
    properties: &[u32],
    limit: Option<usize>,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for property in properties {
        if let Err(error) = collection.registry.get(*property) {
            warn!(property, "{error}");
            continue;
        }
        for staged in collection.store.staged_candidates(*property, limit)? {
            candidates.push(Candidate {
                item: staged.item,
                property: staged.property,
                source: staged.source,
                value: staged.value,
                staged: true,
            });
        }
        if *property == PROPERTY_COMMONS_CATEGORY {
            for (item, title) in collection
                .store
                .depot_links_missing(DEPOT_SITE, PROPERTY_COMMONS_CATEGORY)?
            {
                if has_category_prefix(&title) {
                    candidates.push(Candidate {
                        item,
                        property: *property,
                        source: DEPOT_SITE.to_string(),
                        value: title,
                        staged: false,
                    });
                }
            }
        }
    }
    Ok(candidates)
}

fn encode_candidate<G, P>(
    spec: &PropertySpec,
    value: &str,
    snapshot: &EntitySnapshot,
    retry: &RetryPolicy,
    resolver: &mut EntityResolver,
    graph: &mut G,
    pages: &P,
) -> std::result::Result<Vec<ClaimValue>, Rejection>
where
    G: GraphEntityApi + ?Sized,
    P: WikiPageApi + ?Sized,
{
    let value = value.trim();
    match spec.kind {
        PropertyKind::Entity => {
            let mut claims = Vec::new();
            for raw in staged_values(value, spec.multiple) {
                let candidate = EntityId::parse(&raw)
                    .ok_or_else(|| Rejection::Invalid(format!("`{raw}` is not an item id")))?;
                if !resolver.satisfies_constraints(graph, candidate, &spec.constraints)? {
                    return Err(Rejection::Invalid(format!(
                        "{candidate} fails the class constraints"
                    )));
                }
                claims.push(ClaimValue::Item(candidate));
            }
            if claims.is_empty() {
                return Err(Rejection::Invalid("no item to write".to_string()));
            }
            Ok(claims)
        }
        PropertyKind::Image => {
            let file = strip_file_prefix(value);
            check_extension(&file, IMAGE_EXTENSIONS)?;
            let normalized = normalize_title(&file);
            let attached = LEGACY_IMAGE_PROPERTIES.iter().any(|legacy| {
                snapshot
                    .values(*legacy)
                    .iter()
                    .any(|existing| normalize_title(existing) == normalized)
            });
            if attached {
                return Err(Rejection::Invalid(format!(
                    "{file} is already attached as an image"
                )));
            }
            require_depot_page(retry, pages, &format!("File:{file}"))?;
            Ok(vec![ClaimValue::CommonsMedia(file)])
        }
        PropertyKind::Sound => {
            let file = strip_file_prefix(value);
            check_extension(&file, SOUND_EXTENSIONS)?;
            require_depot_page(retry, pages, &format!("File:{file}"))?;
            Ok(vec![ClaimValue::CommonsMedia(file)])
        }
        PropertyKind::Coordinates => parse_coordinates(value)
            .map(|(latitude, longitude)| {
                vec![ClaimValue::GlobeCoordinate {
                    latitude,
                    longitude,
                }]
            })
            .ok_or_else(|| Rejection::Invalid(format!("cannot read coordinates from `{value}`"))),
        PropertyKind::String if spec.id == PROPERTY_COMMONS_CATEGORY => {
            let category = strip_category_prefix(value);
            if category.is_empty() {
                return Err(Rejection::Invalid("empty category".to_string()));
            }
            require_depot_page(retry, pages, &format!("Category:{category}"))?;
            Ok(vec![ClaimValue::String(category)])
        }
        PropertyKind::String => {
            if spec.id == PROPERTY_MERIMEE && !is_merimee_id(value) {
                return Err(Rejection::Invalid(format!(
                    "`{value}` is not a Mérimée identifier"
                )));
            }
            if value.is_empty() {
                return Err(Rejection::Invalid("empty value".to_string()));
            }
            Ok(vec![ClaimValue::String(value.to_string())])
        }
        PropertyKind::Integer => value
            .parse::<i64>()
            .ok()
            .filter(|_| value.bytes().all(|byte| byte.is_ascii_digit()))
            .map(|amount| vec![ClaimValue::Quantity(amount)])
            .ok_or_else(|| Rejection::Invalid(format!("`{value}` is not an integer"))),
    }
}

/// Multi-valued cells hold a JSON list; single values are plain text.
fn staged_values(value: &str, multiple: bool) -> Vec<String> {
    if multiple
        && value.starts_with('[')
        && let Ok(values) = serde_json::from_str::<Vec<String>>(value)
    {
        return values;
    }
    vec![value.to_string()]
}

fn check_extension(file: &str, allowed: &[&str]) -> std::result::Result<(), Rejection> {
    let extension = file
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_lowercase())
        .unwrap_or_default();
    if allowed.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(Rejection::Invalid(format!(
            "{file} does not have an accepted extension"
        )))
    }
}

fn require_depot_page<P: WikiPageApi + ?Sized>(
    retry: &RetryPolicy,
    pages: &P,
    title: &str,
) -> std::result::Result<(), Rejection> {
    if retry.run("check depot page", || pages.page_exists(DEPOT_SITE, title))? {
        Ok(())
    } else {
        Err(Rejection::Invalid(format!("{title} does not exist on {DEPOT_SITE}")))
    }
}

/// Two uppercase letters followed by eight digits, e.g. `PA00088801`.
fn is_merimee_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes[..2].iter().all(u8::is_ascii_uppercase)
        && bytes[2..].iter().all(u8::is_ascii_digit)
}
