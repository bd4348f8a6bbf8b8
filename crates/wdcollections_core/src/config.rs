use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::cache::CacheMode;
use crate::entity::EntityId;
use crate::query::ArticleRequirement;
use crate::registry::{PROPERTY_COORDINATES, PropertyKind, PropertyRegistry, known_site};
use crate::remote::Credentials;
use crate::retry::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
    RetryPolicy,
};
use crate::store::{DEFAULT_COMMIT_EVERY, RESERVED_TABLES, is_valid_table_name};
use crate::wikitext::normalize_template_name;

pub const DEFAULT_SPARQL_URL: &str = "https://query.wikidata.org/sparql";
pub const DEFAULT_API_URL: &str = "https://www.wikidata.org/w/api.php";
pub const DEFAULT_USER_AGENT: &str = "wdcollections/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CACHE_TTL_DAYS: u64 = 1;
pub const DEFAULT_FRESHNESS_DAYS: u64 = 30;
pub const DEFAULT_CHUNK_SIZE: usize = 8;
pub const DEFAULT_MIN_VALUE_LEN: usize = 3;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CollectionConfig {
    #[serde(default)]
    pub collection: CollectionSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub harvest: HarvestSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub endpoints: EndpointsSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// `[templates.<site>.<Template>]`
    #[serde(default)]
    pub templates: BTreeMap<String, BTreeMap<String, RawTemplateRule>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct CollectionSection {
    pub name: Option<String>,
    #[serde(default)]
    pub types: Vec<RawEntityId>,
    #[serde(default)]
    pub properties: Vec<u32>,
    #[serde(default)]
    pub languages: Vec<String>,
    pub country: Option<RawEntityId>,
    pub article_requirement: Option<ArticleRequirement>,
}

/// Entity ids may be written as `16970` or `"Q16970"`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawEntityId {
    Number(u64),
    Text(String),
}

impl RawEntityId {
    fn resolve(&self) -> Option<EntityId> {
        match self {
            Self::Number(value) => EntityId::parse(&value.to_string()),
            Self::Text(value) => EntityId::parse(value),
        }
    }

    fn display(&self) -> String {
        match self {
            Self::Number(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub ttl_days: Option<u64>,
    pub mode: Option<CacheMode>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HarvestSection {
    pub freshness_days: Option<u64>,
    pub chunk_size: Option<usize>,
    pub min_value_len: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub commit_every: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct EndpointsSection {
    pub sparql_url: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RetrySection {
    pub max_attempts: Option<usize>,
    pub delay_ms: Option<u64>,
    pub backoff_factor: Option<u32>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RawTemplateRule {
    pub positional: Option<u32>,
    pub coordinates: Option<bool>,
    pub params: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatePart {
    Latitude,
    Longitude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldTarget {
    pub property: u32,
    pub part: Option<CoordinatePart>,
}

/// How values are pulled out of one template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateRule {
    /// Lowercased parameter name → target field.
    Named(BTreeMap<String, FieldTarget>),
    /// The first positional parameter fills this property.
    Positional(u32),
    /// Positional degree/minute/second parameters fill the coordinate property.
    Coordinates,
}

impl TemplateRule {
    pub fn targets(&self) -> BTreeSet<u32> {
        match self {
            Self::Named(params) => params.values().map(|target| target.property).collect(),
            Self::Positional(property) => BTreeSet::from([*property]),
            Self::Coordinates => BTreeSet::from([PROPERTY_COORDINATES]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestSettings {
    pub freshness: Duration,
    pub chunk_size: usize,
    pub min_value_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl_days: u64,
    pub mode: CacheMode,
}

/// Everything a phase needs about one collection, validated once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSettings {
    pub name: String,
    pub types: Vec<EntityId>,
    pub properties: Vec<u32>,
    pub languages: Vec<String>,
    pub country: Option<EntityId>,
    pub article_requirement: ArticleRequirement,
    pub cache: CacheSettings,
    pub harvest: HarvestSettings,
    pub commit_every: usize,
    pub retry: RetryPolicy,
    /// Site id → normalized template name → rule.
    pub templates: BTreeMap<String, BTreeMap<String, TemplateRule>>,
}

impl CollectionSettings {
    pub fn from_config(config: &CollectionConfig, registry: &PropertyRegistry) -> Result<Self> {
        let section = &config.collection;
        let name = section
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "collection.name is required (run `wdcollections init` for a template)"
                )
            })?
            .to_string();
        if !is_valid_table_name(&name) {
            bail!(
                "collection.name `{name}` is not a valid table name: use [a-z0-9_], do not start with a digit, avoid {}",
                RESERVED_TABLES.join(", ")
            );
        }

        let mut types = BTreeSet::new();
        for raw in &section.types {
            let id = raw.resolve().ok_or_else(|| {
                anyhow::anyhow!("collection.types: invalid entity id `{}`", raw.display())
            })?;
            types.insert(id);
        }
        if types.is_empty() {
            bail!("collection.types must list at least one class id");
        }

        let properties = section.properties.iter().copied().collect::<BTreeSet<_>>();
        if properties.is_empty() {
            bail!("collection.properties must list at least one property id");
        }
        for property in &properties {
            registry
                .get(*property)
                .with_context(|| format!("collection.properties: cannot use P{property}"))?;
        }

        let languages = section
            .languages
            .iter()
            .map(|language| language.trim().to_ascii_lowercase())
            .filter(|language| !language.is_empty())
            .collect::<BTreeSet<_>>();
        if languages.is_empty() {
            bail!("collection.languages must list at least one language code");
        }
        for language in &languages {
            if !language
                .bytes()
                .all(|byte| byte.is_ascii_lowercase() || byte == b'-')
            {
                bail!("collection.languages: invalid language code `{language}`");
            }
        }

        let country = match &section.country {
            Some(raw) => Some(raw.resolve().ok_or_else(|| {
                anyhow::anyhow!("collection.country: invalid entity id `{}`", raw.display())
            })?),
            None => None,
        };

        let mut templates = BTreeMap::new();
        for (site, rules) in &config.templates {
            if known_site(site).is_none() {
                bail!("templates.{site}: unsupported site");
            }
            let mut site_rules = BTreeMap::new();
            for (template, raw) in rules {
                let rule = validate_rule(site, template, raw, &properties, registry)?;
                site_rules.insert(normalize_template_name(template), rule);
            }
            templates.insert(site.clone(), site_rules);
        }

        let harvest = HarvestSettings {
            freshness: Duration::from_secs(
                config
                    .harvest
                    .freshness_days
                    .unwrap_or(DEFAULT_FRESHNESS_DAYS)
                    .saturating_mul(86_400),
            ),
            chunk_size: config.harvest.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            min_value_len: config.harvest.min_value_len.unwrap_or(DEFAULT_MIN_VALUE_LEN),
        };
        if harvest.chunk_size == 0 {
            bail!("harvest.chunk_size must be at least 1");
        }

        let commit_every = config.store.commit_every.unwrap_or(DEFAULT_COMMIT_EVERY);
        if commit_every == 0 {
            bail!("store.commit_every must be at least 1");
        }

        let retry = RetryPolicy {
            max_attempts: config.retry.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_delay: Duration::from_millis(config.retry.delay_ms.unwrap_or(DEFAULT_DELAY_MS)),
            backoff_factor: config
                .retry
                .backoff_factor
                .unwrap_or(DEFAULT_BACKOFF_FACTOR),
            max_delay: Duration::from_millis(
                config.retry.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS),
            ),
        };
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }

        Ok(Self {
            name,
            types: types.into_iter().collect(),
            properties: properties.into_iter().collect(),
            languages: languages.into_iter().collect(),
            country,
            article_requirement: section.article_requirement.unwrap_or_default(),
            cache: CacheSettings {
                ttl_days: config.cache.ttl_days.unwrap_or(DEFAULT_CACHE_TTL_DAYS),
                mode: config.cache.mode.unwrap_or_default(),
            },
            harvest,
            commit_every,
            retry,
            templates,
        })
    }

    pub fn has_property(&self, property: u32) -> bool {
        self.properties.contains(&property)
    }

    /// Properties some template rule of `site` can fill.
    pub fn site_targets(&self, site: &str) -> BTreeSet<u32> {
        self.templates
            .get(site)
            .map(|rules| rules.values().flat_map(TemplateRule::targets).collect())
            .unwrap_or_default()
    }
}

fn validate_rule(
    site: &str,
    template: &str,
    raw: &RawTemplateRule,
    properties: &BTreeSet<u32>,
    registry: &PropertyRegistry,
) -> Result<TemplateRule> {
    let location = format!("templates.{site}.\"{template}\"");
    if normalize_template_name(template).is_empty() {
        bail!("{location}: template name is empty");
    }
    let require_property = |property: u32| -> Result<()> {
        registry
            .get(property)
            .with_context(|| format!("{location}: cannot target P{property}"))?;
        if !properties.contains(&property) {
            bail!("{location}: P{property} is not one of collection.properties");
        }
        Ok(())
    };

    let rule = match (raw.positional, raw.coordinates, &raw.params) {
        (Some(property), None, None) => {
            require_property(property)?;
            TemplateRule::Positional(property)
        }
        (None, Some(true), None) => {
            require_property(PROPERTY_COORDINATES)?;
            TemplateRule::Coordinates
        }
        (None, None, Some(params)) => {
            if params.is_empty() {
                bail!("{location}: params must map at least one parameter");
            }
            let mut targets = BTreeMap::new();
            for (key, target) in params {
                let target = parse_field_target(target).ok_or_else(|| {
                    anyhow::anyhow!(
                        "{location}: parameter `{key}` has invalid target `{target}` (expected a property id such as \"373\", or \"625a\"/\"625b\")"
                    )
                })?;
                require_property(target.property)?;
                if target.part.is_some()
                    && registry.kind_of(target.property)? != PropertyKind::Coordinates
                {
                    bail!(
                        "{location}: parameter `{key}` splits P{} which is not a coordinate property",
                        target.property
                    );
                }
                targets.insert(key.trim().to_lowercase(), target);
            }
            TemplateRule::Named(targets)
        }
        _ => bail!("{location}: set exactly one of positional, coordinates = true, or params"),
    };
    Ok(rule)
}

/// `"373"`, `"P373"`, `"625a"` (latitude half), `"625b"` (longitude half).
pub fn parse_field_target(value: &str) -> Option<FieldTarget> {
    let trimmed = value.trim();
    let trimmed = trimmed
        .strip_prefix('P')
        .or_else(|| trimmed.strip_prefix('p'))
        .unwrap_or(trimmed);
    let (digits, part) = match trimmed.as_bytes().last()? {
        b'a' => (&trimmed[..trimmed.len() - 1], Some(CoordinatePart::Latitude)),
        b'b' => (&trimmed[..trimmed.len() - 1], Some(CoordinatePart::Longitude)),
        _ => (trimmed, None),
    };
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let property = digits.parse::<u32>().ok().filter(|id| *id > 0)?;
    Some(FieldTarget { property, part })
}

/// Load the TOML config. A missing file yields the empty default.
pub fn load_config(config_path: &Path) -> Result<CollectionConfig> {
    if !config_path.exists() {
        return Ok(CollectionConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: CollectionConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSettings {
    pub sparql_url: String,
    pub api_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

/// Resolve endpoints: env > config > default.
pub fn resolve_endpoints(section: &EndpointsSection) -> EndpointSettings {
    resolve_endpoints_with_lookup(section, |key| env::var(key).ok())
}

pub fn resolve_endpoints_with_lookup<F>(
    section: &EndpointsSection,
    lookup_env: F,
) -> EndpointSettings
where
    F: Fn(&str) -> Option<String>,
{
    let pick = |key: &str, configured: &Option<String>, default: &str| -> String {
        env_value(&lookup_env, key)
            .or_else(|| configured.clone())
            .unwrap_or_else(|| default.to_string())
    };
    let timeout_ms = env_value(&lookup_env, "WDC_HTTP_TIMEOUT_MS")
        .and_then(|value| value.parse::<u64>().ok())
        .or(section.timeout_ms)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    EndpointSettings {
        sparql_url: pick("WDC_SPARQL_URL", &section.sparql_url, DEFAULT_SPARQL_URL),
        api_url: pick("WDC_API_URL", &section.api_url, DEFAULT_API_URL),
        user_agent: pick("WDC_USER_AGENT", &section.user_agent, DEFAULT_USER_AGENT),
        timeout: Duration::from_millis(timeout_ms),
    }
}

/// Bot credentials are only read from the environment.
pub fn credentials_from_env() -> Option<Credentials> {
    credentials_with_lookup(|key| env::var(key).ok())
}

pub fn credentials_with_lookup<F>(lookup_env: F) -> Option<Credentials>
where
    F: Fn(&str) -> Option<String>,
{
    let user = env_value(&lookup_env, "WDC_BOT_USER")?;
    let password = env_value(&lookup_env, "WDC_BOT_PASS")?;
    Some(Credentials { user, password })
}

fn env_value<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;

    const SAMPLE: &str = r#"
[collection]
name = "churches"
types = [16970, "Q2977"]
properties = [625, 373, 18]
languages = ["fr", "en"]
country = 142
article_requirement = "at_least_one"

[cache]
mode = "refresh"

[harvest]
chunk_size = 4

[templates.frwiki.Commonscat]
positional = 373

[templates.frwiki.Coord]
coordinates = true

[templates.frwiki."Infobox Édifice religieux"]
params = { Commons = "373", image = "P18", latitude = "625a", longitude = "625b" }
"#;

    fn settings_from(text: &str) -> Result<CollectionSettings> {
        let config: CollectionConfig = toml::from_str(text).expect("parse toml");
        CollectionSettings::from_config(&config, &PropertyRegistry::builtin())
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, CollectionConfig::default());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[collection\nname = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn sample_config_validates_with_defaults_filled_in() {
        let settings = settings_from(SAMPLE).expect("valid settings");
        assert_eq!(settings.name, "churches");
        assert_eq!(settings.types, vec![EntityId(2977), EntityId(16970)]);
        assert_eq!(settings.properties, vec![18, 373, 625]);
        assert_eq!(settings.languages, vec!["en".to_string(), "fr".to_string()]);
        assert_eq!(settings.country, Some(EntityId(142)));
        assert_eq!(settings.article_requirement, ArticleRequirement::AtLeastOne);
        assert_eq!(settings.cache.mode, CacheMode::Refresh);
        assert_eq!(settings.cache.ttl_days, DEFAULT_CACHE_TTL_DAYS);
        assert_eq!(settings.harvest.chunk_size, 4);
        assert_eq!(settings.harvest.min_value_len, 3);
        assert_eq!(settings.commit_every, 50);
        assert_eq!(settings.retry.max_attempts, 5);

        let frwiki = settings.templates.get("frwiki").expect("frwiki rules");
        assert_eq!(frwiki.get("commonscat"), Some(&TemplateRule::Positional(373)));
        assert_eq!(frwiki.get("coord"), Some(&TemplateRule::Coordinates));
        let TemplateRule::Named(params) = frwiki
            .get("infobox édifice religieux")
            .expect("infobox rule")
        else {
            panic!("expected named rule");
        };
        assert_eq!(
            params.get("commons"),
            Some(&FieldTarget {
                property: 373,
                part: None
            })
        );
        assert_eq!(
            params.get("latitude"),
            Some(&FieldTarget {
                property: 625,
                part: Some(CoordinatePart::Latitude)
            })
        );
        assert_eq!(
            settings.site_targets("frwiki"),
            BTreeSet::from([18, 373, 625])
        );
        assert!(settings.site_targets("enwiki").is_empty());
    }

    #[test]
    fn configuration_errors_name_the_offending_entry() {
        let missing_name =
            settings_from("[collection]\ntypes=[1]\nproperties=[373]\nlanguages=[\"fr\"]")
                .expect_err("no name");
        assert!(missing_name.to_string().contains("collection.name is required"));

        let bad_table = settings_from(
            "[collection]\nname=\"interwiki\"\ntypes=[1]\nproperties=[373]\nlanguages=[\"fr\"]",
        )
        .expect_err("reserved");
        assert!(bad_table.to_string().contains("not a valid table name"));

        let unknown = settings_from(
            "[collection]\nname=\"c\"\ntypes=[1]\nproperties=[9999]\nlanguages=[\"fr\"]",
        )
        .expect_err("unknown property");
        assert!(format!("{unknown:#}").contains("P9999 is not implemented"));

        let site = settings_from(
            "[collection]\nname=\"c\"\ntypes=[1]\nproperties=[373]\nlanguages=[\"fr\"]\n[templates.klingonwiki.Foo]\npositional=373",
        )
        .expect_err("unsupported site");
        assert!(site.to_string().contains("templates.klingonwiki: unsupported site"));

        let outside = settings_from(
            "[collection]\nname=\"c\"\ntypes=[1]\nproperties=[373]\nlanguages=[\"fr\"]\n[templates.frwiki.Coord]\ncoordinates=true",
        )
        .expect_err("target outside collection");
        assert!(outside.to_string().contains("P625 is not one of collection.properties"));

        let ambiguous = settings_from(
            "[collection]\nname=\"c\"\ntypes=[1]\nproperties=[373]\nlanguages=[\"fr\"]\n[templates.frwiki.Foo]\npositional=373\ncoordinates=true",
        )
        .expect_err("two rule kinds");
        assert!(ambiguous.to_string().contains("set exactly one of"));

        let split = settings_from(
            "[collection]\nname=\"c\"\ntypes=[1]\nproperties=[373]\nlanguages=[\"fr\"]\n[templates.frwiki.Foo]\nparams={ a = \"373a\" }",
        )
        .expect_err("split non-coordinate");
        assert!(split.to_string().contains("not a coordinate property"));
    }

    #[test]
    fn field_targets_parse_halves_and_prefixes() {
        assert_eq!(
            parse_field_target("625b"),
            Some(FieldTarget {
                property: 625,
                part: Some(CoordinatePart::Longitude)
            })
        );
        assert_eq!(
            parse_field_target("P373"),
            Some(FieldTarget {
                property: 373,
                part: None
            })
        );
        assert_eq!(parse_field_target("abc"), None);
        assert_eq!(parse_field_target("a"), None);
    }

    #[test]
    fn endpoints_prefer_env_over_config_over_default() {
        let section = EndpointsSection {
            sparql_url: Some("https://sparql.example/query".to_string()),
            user_agent: Some("configured/1.0".to_string()),
            timeout_ms: Some(5_000),
            ..EndpointsSection::default()
        };
        let env = HashMap::from([
            ("WDC_USER_AGENT".to_string(), "from-env/2.0".to_string()),
            ("WDC_API_URL".to_string(), "  ".to_string()),
        ]);
        let endpoints = resolve_endpoints_with_lookup(&section, |key| env.get(key).cloned());
        assert_eq!(endpoints.sparql_url, "https://sparql.example/query");
        assert_eq!(endpoints.api_url, DEFAULT_API_URL);
        assert_eq!(endpoints.user_agent, "from-env/2.0");
        assert_eq!(endpoints.timeout, Duration::from_millis(5_000));
    }

    #[test]
    fn credentials_need_both_variables() {
        let env = HashMap::from([("WDC_BOT_USER".to_string(), "Bot".to_string())]);
        assert!(credentials_with_lookup(|key| env.get(key).cloned()).is_none());
        let env = HashMap::from([
            ("WDC_BOT_USER".to_string(), "Bot".to_string()),
            ("WDC_BOT_PASS".to_string(), "secret".to_string()),
        ]);
        assert_eq!(
            credentials_with_lookup(|key| env.get(key).cloned()),
            Some(Credentials {
                user: "Bot".to_string(),
                password: "secret".to_string()
            })
        );
    }
}
