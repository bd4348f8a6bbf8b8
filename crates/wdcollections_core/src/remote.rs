//! Seams to the remote graph and the wiki sites, plus the values crossing them.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::entity::EntityId;
use crate::error::RemoteError;
use crate::registry::{PROPERTY_IMPORTED_FROM, PROPERTY_REFERENCE_URL};

/// Precision written with coordinate claims; matches the five stored decimals.
pub const COORDINATE_PRECISION: f64 = 0.00001;
const EARTH_GLOBE: &str = "http://www.wikidata.org/entity/Q2";

pub trait GraphQueryApi {
    /// Run a graph query and return the raw JSON result body.
    fn run_query(&mut self, query: &str) -> Result<String, RemoteError>;
    fn request_count(&self) -> usize;
}

pub trait GraphEntityApi {
    /// Current state of an entity, following redirects. `None` when it does not exist.
    fn get_entity(&mut self, id: EntityId) -> Result<Option<EntitySnapshot>, RemoteError>;
}

pub trait GraphWriteApi {
    fn is_logged_in(&self) -> bool;
    fn login(&mut self, credentials: &Credentials) -> Result<(), RemoteError>;
    fn add_claim(
        &mut self,
        item: EntityId,
        property: u32,
        value: &ClaimValue,
        provenance: &Provenance,
    ) -> Result<(), RemoteError>;
}

/// Page access on the wiki sites. Pages of one harvest chunk are fetched from scoped
/// threads, so implementations take `&self` and must be shareable.
pub trait WikiPageApi: Sync {
    fn page_templates(&self, site: &str, title: &str) -> Result<PageTemplates, RemoteError>;
    /// Graph item bound to a page, after following redirects.
    fn page_item(&self, site: &str, title: &str) -> Result<Option<EntityId>, RemoteError>;
    fn page_exists(&self, site: &str, title: &str) -> Result<bool, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    /// Identity after redirects; differs from the requested id for merged items.
    pub id: EntityId,
    pub modified: Option<String>,
    /// Main-snak values per property, in the local text form.
    pub claims: BTreeMap<u32, Vec<String>>,
    pub sitelinks: BTreeMap<String, String>,
}

impl EntitySnapshot {
    pub fn values(&self, property: u32) -> &[String] {
        self.claims
            .get(&property)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_property(&self, property: u32) -> bool {
        !self.values(property).is_empty()
    }

    pub fn entity_values(&self, property: u32) -> Vec<EntityId> {
        self.values(property)
            .iter()
            .filter_map(|value| EntityId::parse(value))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TemplateInvocation {
    pub name: String,
    /// Raw parameters in order; named ones keep their `key=value` text.
    pub params: Vec<String>,
}

impl TemplateInvocation {
    pub fn new(name: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            params: params.iter().map(|param| param.to_string()).collect(),
        }
    }

    /// Named parameters with trimmed, lowercased keys.
    pub fn named_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .filter_map(|param| {
                let (key, value) = param.split_once('=')?;
                let key = key.trim();
                if key.is_empty() || key.contains(['[', '{']) {
                    return None;
                }
                Some((key.to_lowercase(), value.trim().to_string()))
            })
            .collect()
    }

    pub fn positional_params(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|param| match param.split_once('=') {
                Some((key, _)) => key.contains(['[', '{']) || key.trim().is_empty(),
                None => true,
            })
            .map(|param| param.trim().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageTemplates {
    pub exists: bool,
    /// Final title when the requested one redirected.
    pub redirect: Option<String>,
    pub templates: Vec<TemplateInvocation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimValue {
    Item(EntityId),
    CommonsMedia(String),
    String(String),
    Quantity(i64),
    GlobeCoordinate { latitude: f64, longitude: f64 },
}

impl ClaimValue {
    /// The `value` parameter of a claim creation request.
    pub fn datavalue(&self) -> Value {
        match self {
            Self::Item(id) => json!({ "entity-type": "item", "numeric-id": id.numeric() }),
            Self::CommonsMedia(value) | Self::String(value) => json!(value),
            Self::Quantity(amount) => json!({ "amount": format!("{amount:+}"), "unit": "1" }),
            Self::GlobeCoordinate {
                latitude,
                longitude,
            } => json!({
                "latitude": latitude,
                "longitude": longitude,
                "precision": COORDINATE_PRECISION,
                "globe": EARTH_GLOBE,
            }),
        }
    }

    /// Datavalue type tag used inside a statement's main snak.
    pub fn value_type(&self) -> &'static str {
        match self {
            Self::Item(_) => "wikibase-entityid",
            Self::CommonsMedia(_) | Self::String(_) => "string",
            Self::Quantity(_) => "quantity",
            Self::GlobeCoordinate { .. } => "globecoordinate",
        }
    }

    pub fn local_text(&self) -> String {
        match self {
            Self::Item(id) => id.to_string(),
            Self::CommonsMedia(value) | Self::String(value) => value.clone(),
            Self::Quantity(amount) => amount.to_string(),
            Self::GlobeCoordinate {
                latitude,
                longitude,
            } => crate::geo::format_coordinates(*latitude, *longitude),
        }
    }
}

/// Where a written claim came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Imported from a known wiki site, cited by the site's own graph item.
    Site { site: String, item: EntityId },
    Url(String),
}

impl Provenance {
    pub fn property(&self) -> u32 {
        match self {
            Self::Site { .. } => PROPERTY_IMPORTED_FROM,
            Self::Url(_) => PROPERTY_REFERENCE_URL,
        }
    }

    /// Reference snaks, keyed by property, as a statement reference carries them.
    pub fn snaks(&self) -> Value {
        let property = format!("P{}", self.property());
        let datavalue = match self {
            Self::Site { item, .. } => json!({
                "type": "wikibase-entityid",
                "value": { "entity-type": "item", "numeric-id": item.numeric() },
            }),
            Self::Url(url) => json!({ "type": "string", "value": url }),
        };
        let snak = json!({
            "snaktype": "value",
            "property": property.clone(),
            "datavalue": datavalue,
        });
        let mut snaks = Map::new();
        snaks.insert(property, Value::Array(vec![snak]));
        Value::Object(snaks)
    }

    pub fn source_label(&self) -> &str {
        match self {
            Self::Site { site, .. } => site,
            Self::Url(url) => url,
        }
    }
}

/// Complete statement for `wbsetclaim`: main snak and reference travel in one request.
///
/// The statement id is derived from its content, so re-sending the same statement
/// replaces it instead of adding a second copy.
pub fn claim_statement(
    item: EntityId,
    property: u32,
    value: &ClaimValue,
    provenance: &Provenance,
) -> Value {
    let property_key = format!("P{property}");
    json!({
        "id": claim_guid(item, property, value, provenance),
        "type": "statement",
        "rank": "normal",
        "mainsnak": {
            "snaktype": "value",
            "property": property_key,
            "datavalue": { "type": value.value_type(), "value": value.datavalue() },
        },
        "references": [{
            "snaks": provenance.snaks(),
            "snaks-order": [format!("P{}", provenance.property())],
        }],
    })
}

/// `Q42$xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`, stable for identical inputs.
pub fn claim_guid(
    item: EntityId,
    property: u32,
    value: &ClaimValue,
    provenance: &Provenance,
) -> String {
    let seed = format!(
        "{item}|P{property}|{}|{}",
        value.datavalue(),
        provenance.source_label()
    );
    let digest = Sha256::digest(seed.as_bytes());
    let hex = digest[..16]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!(
        "{item}${}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    results: QueryResultsBody,
}

#[derive(Debug, Deserialize)]
struct QueryResultsBody {
    #[serde(default)]
    bindings: Vec<BTreeMap<String, QueryBinding>>,
}

#[derive(Debug, Deserialize)]
struct QueryBinding {
    value: String,
}

pub type QueryRow = BTreeMap<String, String>;

/// Flatten a SPARQL JSON result body into variable → value rows.
pub fn parse_query_rows(payload: &str) -> Result<Vec<QueryRow>, serde_json::Error> {
    let response: QueryResponse = serde_json::from_str(payload)?;
    Ok(response
        .results
        .bindings
        .into_iter()
        .map(|binding| {
            binding
                .into_iter()
                .map(|(name, value)| (name, value.value))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        ClaimValue, Provenance, TemplateInvocation, claim_guid, claim_statement, parse_query_rows,
    };
    use crate::entity::EntityId;

    #[test]
    fn query_rows_flatten_bindings() {
        let payload = r#"{"head":{"vars":["item","P373"]},"results":{"bindings":[
            {"item":{"type":"uri","value":"http://www.wikidata.org/entity/Q42"},
             "P373":{"type":"literal","value":"Foo"}},
            {"item":{"type":"uri","value":"http://www.wikidata.org/entity/Q43"}}
        ]}}"#;
        let rows = parse_query_rows(payload).expect("parse");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("P373").map(String::as_str), Some("Foo"));
        assert!(!rows[1].contains_key("P373"));
        assert!(parse_query_rows("{\"results\":").is_err());
    }

    #[test]
    fn template_params_split_into_named_and_positional() {
        let invocation = TemplateInvocation::new(
            "Infobox",
            &["Foo", " Commons = Bar ", "[[a|b=c]]", "=x"],
        );
        assert_eq!(
            invocation.named_params(),
            vec![("commons".to_string(), "Bar".to_string())]
        );
        assert_eq!(
            invocation.positional_params(),
            vec!["Foo".to_string(), "[[a|b=c]]".to_string(), "=x".to_string()]
        );
    }

    #[test]
    fn claim_values_encode_datavalues() {
        assert_eq!(
            ClaimValue::Item(EntityId(142)).datavalue(),
            json!({"entity-type": "item", "numeric-id": 142})
        );
        assert_eq!(ClaimValue::Quantity(1200).datavalue()["amount"], json!("+1200"));
        assert_eq!(
            ClaimValue::GlobeCoordinate {
                latitude: 48.85806,
                longitude: 2.29444
            }
            .local_text(),
            "48.85806|2.29444|0"
        );
    }

    #[test]
    fn provenance_picks_reference_property() {
        let site = Provenance::Site {
            site: "frwiki".to_string(),
            item: EntityId(8447),
        };
        assert_eq!(site.property(), 143);
        assert_eq!(
            site.snaks()["P143"][0]["datavalue"]["value"]["numeric-id"],
            json!(8447)
        );
        let url = Provenance::Url("https://example.org/list".to_string());
        assert_eq!(url.property(), 854);
        assert_eq!(
            url.snaks()["P854"][0]["datavalue"]["value"],
            json!("https://example.org/list")
        );
    }

    #[test]
    fn statements_carry_their_reference_and_a_stable_id() {
        let provenance = Provenance::Site {
            site: "frwiki".to_string(),
            item: EntityId(8447),
        };
        let value = ClaimValue::String("Foo Category".to_string());
        let statement = claim_statement(EntityId(42), 373, &value, &provenance);
        assert_eq!(statement["mainsnak"]["property"], json!("P373"));
        assert_eq!(statement["mainsnak"]["datavalue"]["type"], json!("string"));
        assert_eq!(statement["mainsnak"]["datavalue"]["value"], json!("Foo Category"));
        assert_eq!(
            statement["references"][0]["snaks"]["P143"][0]["datavalue"]["value"]["numeric-id"],
            json!(8447)
        );
        assert_eq!(statement["references"][0]["snaks-order"], json!(["P143"]));

        let id = statement["id"].as_str().expect("statement id");
        assert_eq!(id, claim_guid(EntityId(42), 373, &value, &provenance));
        let (entity, guid) = id.split_once('$').expect("entity prefix");
        assert_eq!(entity, "Q42");
        let groups = guid.split('-').map(str::len).collect::<Vec<_>>();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);

        let other = ClaimValue::String("Other Category".to_string());
        assert_ne!(id, claim_guid(EntityId(42), 373, &other, &provenance));
    }
}
