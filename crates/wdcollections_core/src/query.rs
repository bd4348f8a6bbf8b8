use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;
use crate::registry::{PROPERTY_INSTANCE_OF, property_column, wiki_host_for_language};

pub const VAR_ITEM: &str = "item";
pub const VAR_MODIFIED: &str = "modified";
pub const VAR_DEPOT: &str = "depot";

const DEPOT_BASE_URL: &str = "https://commons.wikimedia.org/";

/// How per-language article presence restricts the selected items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleRequirement {
    /// Every configured language must have an article.
    Mandatory,
    /// Articles are looked up independently per language; none is required.
    #[default]
    OptionalPerLanguage,
    /// Articles are optional per language but at least one must exist.
    AtLeastOne,
}

impl ArticleRequirement {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mandatory => "mandatory",
            Self::OptionalPerLanguage => "optional_per_language",
            Self::AtLeastOne => "at_least_one",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuilder {
    types: BTreeSet<EntityId>,
    properties: BTreeSet<u32>,
    languages: BTreeSet<String>,
    country: Option<EntityId>,
    article_requirement: ArticleRequirement,
}

impl QueryBuilder {
    pub fn new(types: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            types: types.into_iter().collect(),
            properties: BTreeSet::new(),
            languages: BTreeSet::new(),
            country: None,
            article_requirement: ArticleRequirement::default(),
        }
    }

    pub fn properties(mut self, properties: impl IntoIterator<Item = u32>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn languages<S: AsRef<str>>(mut self, languages: impl IntoIterator<Item = S>) -> Self {
        self.languages.extend(
            languages
                .into_iter()
                .map(|language| language.as_ref().trim().to_ascii_lowercase())
                .filter(|language| !language.is_empty()),
        );
        self
    }

    pub fn country(mut self, country: Option<EntityId>) -> Self {
        self.country = country;
        self
    }

    pub fn article_requirement(mut self, requirement: ArticleRequirement) -> Self {
        self.article_requirement = requirement;
        self
    }

    pub fn language_list(&self) -> Vec<String> {
        self.languages.iter().cloned().collect()
    }

    /// Render the query. Inputs are kept in sorted sets, so equal inputs always give
    /// byte-identical text, which the result cache relies on.
    pub fn build(&self) -> String {
        let mut select = vec![format!("?{VAR_ITEM}"), format!("?{VAR_MODIFIED}")];
        select.extend(self.properties.iter().map(|id| format!("?{}", property_column(*id))));
        select.push(format!("?{VAR_DEPOT}"));
        for language in &self.languages {
            select.push(format!("?{}", label_var(language)));
            select.push(format!("?{}", description_var(language)));
            select.push(format!("?{}", title_var(language)));
        }

        let mut query = String::new();
        let _ = writeln!(query, "SELECT {} WHERE {{", select.join(" "));

        let types = self.types.iter().copied().collect::<Vec<_>>();
        match types.as_slice() {
            [single] => {
                let _ = writeln!(query, "  ?{VAR_ITEM} wdt:P{PROPERTY_INSTANCE_OF} wd:{single} .");
            }
            many => {
                let values = many
                    .iter()
                    .map(|id| format!("wd:{id}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                let _ = writeln!(query, "  VALUES ?type {{ {values} }}");
                let _ = writeln!(query, "  ?{VAR_ITEM} wdt:P{PROPERTY_INSTANCE_OF} ?type .");
            }
        }
        if let Some(country) = self.country {
            let _ = writeln!(query, "  ?{VAR_ITEM} wdt:P17 wd:{country} .");
        }
        let _ = writeln!(query, "  ?{VAR_ITEM} schema:dateModified ?{VAR_MODIFIED} .");

        for id in &self.properties {
            let column = property_column(*id);
            let _ = writeln!(query, "  OPTIONAL {{ ?{VAR_ITEM} wdt:{column} ?{column} . }}");
        }
        let _ = writeln!(
            query,
            "  OPTIONAL {{ ?depot_page schema:about ?{VAR_ITEM} ; schema:isPartOf <{DEPOT_BASE_URL}> ; schema:name ?{VAR_DEPOT} . }}"
        );

        for language in &self.languages {
            let label = label_var(language);
            let description = description_var(language);
            let title = title_var(language);
            let _ = writeln!(
                query,
                "  OPTIONAL {{ ?{VAR_ITEM} rdfs:label ?{label} . FILTER(LANG(?{label}) = \"{language}\") }}"
            );
            let _ = writeln!(
                query,
                "  OPTIONAL {{ ?{VAR_ITEM} schema:description ?{description} . FILTER(LANG(?{description}) = \"{language}\") }}"
            );
            let article = format!(
                "?article_{} schema:about ?{VAR_ITEM} ; schema:isPartOf <https://{}/> ; schema:name ?{title} .",
                var_suffix(language),
                wiki_host_for_language(language)
            );
            match self.article_requirement {
                ArticleRequirement::Mandatory => {
                    let _ = writeln!(query, "  {article}");
                }
                ArticleRequirement::OptionalPerLanguage | ArticleRequirement::AtLeastOne => {
                    let _ = writeln!(query, "  OPTIONAL {{ {article} }}");
                }
            }
        }

        if self.article_requirement == ArticleRequirement::AtLeastOne && !self.languages.is_empty()
        {
            let bound = self
                .languages
                .iter()
                .map(|language| format!("BOUND(?{})", title_var(language)))
                .collect::<Vec<_>>()
                .join(" || ");
            let _ = writeln!(query, "  FILTER({bound})");
        }
        query.push('}');
        query
    }
}

pub fn label_var(language: &str) -> String {
    format!("label_{}", var_suffix(language))
}

pub fn description_var(language: &str) -> String {
    format!("description_{}", var_suffix(language))
}

pub fn title_var(language: &str) -> String {
    format!("title_{}", var_suffix(language))
}

fn var_suffix(language: &str) -> String {
    language.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::{ArticleRequirement, QueryBuilder};
    use crate::entity::EntityId;

    #[test]
    fn query_text_is_independent_of_input_order() {
        let left = QueryBuilder::new([EntityId(16970)])
            .properties([625, 17, 373])
            .languages(["fr", "en"])
            .build();
        let right = QueryBuilder::new([EntityId(16970)])
            .properties([373, 625, 17, 17])
            .languages(["en", "FR"])
            .build();
        assert_eq!(left, right);
    }

    #[test]
    fn single_type_uses_direct_pattern_and_sets_use_values() {
        let single = QueryBuilder::new([EntityId(16970)]).build();
        assert!(single.contains("?item wdt:P31 wd:Q16970 ."));
        assert!(!single.contains("VALUES"));

        let set = QueryBuilder::new([EntityId(2977), EntityId(16970)]).build();
        assert!(set.contains("VALUES ?type { wd:Q2977 wd:Q16970 }"));
        assert!(set.contains("?item wdt:P31 ?type ."));
    }

    #[test]
    fn query_selects_properties_labels_links_depot_and_timestamp() {
        let query = QueryBuilder::new([EntityId(16970)])
            .properties([373, 625])
            .languages(["fr"])
            .country(Some(EntityId(142)))
            .build();
        assert!(query.starts_with(
            "SELECT ?item ?modified ?P373 ?P625 ?depot ?label_fr ?description_fr ?title_fr WHERE {"
        ));
        assert!(query.contains("?item wdt:P17 wd:Q142 ."));
        assert!(query.contains("?item schema:dateModified ?modified ."));
        assert!(query.contains("OPTIONAL { ?item wdt:P625 ?P625 . }"));
        assert!(query.contains("schema:isPartOf <https://commons.wikimedia.org/>"));
        assert!(query.contains("OPTIONAL { ?article_fr schema:about ?item ; schema:isPartOf <https://fr.wikipedia.org/> ; schema:name ?title_fr . }"));
    }

    #[test]
    fn article_requirement_changes_join_semantics() {
        let base = QueryBuilder::new([EntityId(16970)]).languages(["en", "fr"]);

        let mandatory = base
            .clone()
            .article_requirement(ArticleRequirement::Mandatory)
            .build();
        assert!(mandatory.contains(
            "\n  ?article_en schema:about ?item ; schema:isPartOf <https://en.wikipedia.org/> ; schema:name ?title_en .\n"
        ));
        assert!(!mandatory.contains("BOUND("));

        let optional = base.clone().build();
        assert!(optional.contains("OPTIONAL { ?article_en"));
        assert!(!optional.contains("BOUND("));

        let at_least_one = base
            .article_requirement(ArticleRequirement::AtLeastOne)
            .build();
        assert!(at_least_one.contains("OPTIONAL { ?article_fr"));
        assert!(at_least_one.contains("FILTER(BOUND(?title_en) || BOUND(?title_fr))"));
    }
}
