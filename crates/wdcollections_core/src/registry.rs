//! Closed catalogue of the graph properties this tool knows how to read, harvest and
//! write, plus the wiki sites it can harvest from.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::entity::EntityId;
use crate::error::RegistryError;
use crate::geo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Entity,
    Image,
    Sound,
    Coordinates,
    String,
    Integer,
}

impl PropertyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Image => "image",
            Self::Sound => "sound",
            Self::Coordinates => "coordinates",
            Self::String => "string",
            Self::Integer => "integer",
        }
    }

    /// Turn one raw value of a query result binding into the text stored locally.
    pub fn decode_query_value(self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        match self {
            Self::Entity | Self::Image | Self::Sound => {
                let tail = raw.rsplit('/').next().unwrap_or(raw);
                let decoded = urlencoding::decode(tail)
                    .map(|value| value.into_owned())
                    .unwrap_or_else(|_| tail.to_string());
                let decoded = decoded.trim().to_string();
                if decoded.is_empty() { None } else { Some(decoded) }
            }
            Self::Coordinates => geo::parse_wkt_point(raw)
                .map(|(latitude, longitude)| geo::format_coordinates(latitude, longitude)),
            Self::String | Self::Integer => Some(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertySpec {
    pub id: u32,
    pub label: &'static str,
    pub kind: PropertyKind,
    pub constraints: Vec<EntityId>,
    pub multiple: bool,
}

impl PropertySpec {
    pub fn column(&self) -> String {
        property_column(self.id)
    }

    pub fn is_constrained(&self) -> bool {
        !self.constraints.is_empty()
    }
}

pub fn property_column(id: u32) -> String {
    format!("P{id}")
}

/// Properties holding a picture of the item; an image candidate already attached to
/// any of them is not written again.
pub const LEGACY_IMAGE_PROPERTIES: &[u32] = &[18, 1801, 3451, 4291, 5775];

pub const PROPERTY_COMMONS_CATEGORY: u32 = 373;
pub const PROPERTY_COORDINATES: u32 = 625;
pub const PROPERTY_INSTANCE_OF: u32 = 31;
pub const PROPERTY_SUBCLASS_OF: u32 = 279;
pub const PROPERTY_IMPORTED_FROM: u32 = 143;
pub const PROPERTY_REFERENCE_URL: u32 = 854;

/// Site id of the media repository whose category sitelinks are "depot" links.
pub const DEPOT_SITE: &str = "commonswiki";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownSite {
    pub id: &'static str,
    pub host: &'static str,
    pub item: EntityId,
}

impl KnownSite {
    pub fn api_url(&self) -> String {
        format!("https://{}/w/api.php", self.host)
    }

    pub fn base_url(&self) -> String {
        format!("https://{}/", self.host)
    }
}

const KNOWN_SITES: &[KnownSite] = &[
    KnownSite { id: "commonswiki", host: "commons.wikimedia.org", item: EntityId(565) },
    KnownSite { id: "dewiki", host: "de.wikipedia.org", item: EntityId(48183) },
    KnownSite { id: "enwiki", host: "en.wikipedia.org", item: EntityId(328) },
    KnownSite { id: "eswiki", host: "es.wikipedia.org", item: EntityId(8449) },
    KnownSite { id: "frwiki", host: "fr.wikipedia.org", item: EntityId(8447) },
    KnownSite { id: "frwikivoyage", host: "fr.wikivoyage.org", item: EntityId(15303838) },
    KnownSite { id: "itwiki", host: "it.wikipedia.org", item: EntityId(11920) },
    KnownSite { id: "nlwiki", host: "nl.wikipedia.org", item: EntityId(10000) },
    KnownSite { id: "plwiki", host: "pl.wikipedia.org", item: EntityId(1551807) },
    KnownSite { id: "ptwiki", host: "pt.wikipedia.org", item: EntityId(11921) },
];

pub fn known_site(id: &str) -> Option<&'static KnownSite> {
    KNOWN_SITES.iter().find(|site| site.id == id)
}

pub fn known_sites() -> &'static [KnownSite] {
    KNOWN_SITES
}

/// Sitelink id of the Wikipedia edition for a language code (`fr` → `frwiki`).
pub fn wiki_site_for_language(language: &str) -> String {
    format!("{}wiki", language.trim().to_ascii_lowercase().replace('-', "_"))
}

/// Host serving a language's Wikipedia edition.
pub fn wiki_host_for_language(language: &str) -> String {
    format!("{}.wikipedia.org", language.trim().to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct PropertyRegistry {
    specs: BTreeMap<u32, PropertySpec>,
}

impl PropertyRegistry {
    pub fn builtin() -> Self {
        let entries = [
            spec(17, "country", PropertyKind::Entity, &[6256, 3624078], false),
            spec(18, "image", PropertyKind::Image, &[], false),
            spec(31, "instance of", PropertyKind::Entity, &[], true),
            spec(51, "audio", PropertyKind::Sound, &[], false),
            spec(
                131,
                "located in the administrative territorial entity",
                PropertyKind::Entity,
                &[56061],
                false,
            ),
            spec(373, "Commons category", PropertyKind::String, &[], false),
            spec(380, "Mérimée ID", PropertyKind::String, &[], false),
            spec(625, "coordinate location", PropertyKind::Coordinates, &[], false),
            spec(708, "diocese", PropertyKind::Entity, &[665487], false),
            spec(1082, "population", PropertyKind::Integer, &[], false),
            spec(1435, "heritage designation", PropertyKind::Entity, &[], true),
            spec(1644, "messes.info Catholic church ID", PropertyKind::String, &[], false),
        ];
        Self {
            specs: entries.into_iter().map(|spec| (spec.id, spec)).collect(),
        }
    }

    pub fn get(&self, property: u32) -> Result<&PropertySpec, RegistryError> {
        self.specs
            .get(&property)
            .ok_or(RegistryError::UnknownProperty(property))
    }

    pub fn kind_of(&self, property: u32) -> Result<PropertyKind, RegistryError> {
        self.get(property).map(|spec| spec.kind)
    }

    pub fn constraints_of(&self, property: u32) -> Result<&[EntityId], RegistryError> {
        self.get(property).map(|spec| spec.constraints.as_slice())
    }

    pub fn is_multiple(&self, property: u32) -> Result<bool, RegistryError> {
        self.get(property).map(|spec| spec.multiple)
    }

    pub fn contains(&self, property: u32) -> bool {
        self.specs.contains_key(&property)
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.specs.keys().copied()
    }
}

fn spec(
    id: u32,
    label: &'static str,
    kind: PropertyKind,
    constraints: &[u64],
    multiple: bool,
) -> PropertySpec {
    PropertySpec {
        id,
        label,
        kind,
        constraints: constraints.iter().copied().map(EntityId).collect(),
        multiple,
    }
}
