use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cache::ResultCache;
use crate::config::CollectionSettings;
use crate::harvest::{HarvestOptions, HarvestReport, harvest_with_api};
use crate::query::QueryBuilder;
use crate::reconcile::{
    OutdatedReport, SyncOptions, SyncReport, sync_with_api, update_outdated_with_api,
};
use crate::registry::PropertyRegistry;
use crate::remote::{Credentials, GraphEntityApi, GraphQueryApi, GraphWriteApi, WikiPageApi};
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreCounts};
use crate::writeback::{WriteBackOptions, WriteBackReport, write_back_with_api};

/// One configured collection: the unit every phase operates on.
pub struct Collection {
    pub settings: CollectionSettings,
    pub registry: PropertyRegistry,
    pub store: Store,
    pub cache: ResultCache,
}

impl Collection {
    pub fn open(
        settings: CollectionSettings,
        registry: PropertyRegistry,
        db_path: &Path,
        cache_dir: &Path,
    ) -> Result<Self> {
        let store = Store::open(
            db_path,
            &settings.name,
            &settings.properties,
            settings.commit_every,
        )
        .with_context(|| format!("failed to open store for collection {}", settings.name))?;
        let cache = ResultCache::for_collection(
            cache_dir,
            &settings.name,
            &settings.languages,
            settings.cache.ttl_days,
        );
        Ok(Self {
            settings,
            registry,
            store,
            cache,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    pub fn query_builder(&self) -> QueryBuilder {
        QueryBuilder::new(self.settings.types.iter().copied())
            .properties(self.settings.properties.iter().copied())
            .languages(&self.settings.languages)
            .country(self.settings.country)
            .article_requirement(self.settings.article_requirement)
    }

    pub fn status(&self) -> Result<CollectionStatus> {
        Ok(CollectionStatus {
            name: self.settings.name.clone(),
            properties: self.settings.properties.clone(),
            languages: self.settings.languages.clone(),
            sites: self.settings.templates.keys().cloned().collect(),
            counts: self.store.counts()?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub properties: Vec<u32>,
    pub languages: Vec<String>,
    pub sites: Vec<String>,
    pub counts: StoreCounts,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub sync: SyncOptions,
    pub harvest: HarvestOptions,
    pub write_back: WriteBackOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub sync: SyncReport,
    pub outdated: OutdatedReport,
    pub harvest: HarvestReport,
    pub write_back: WriteBackReport,
}

/// Sync, refresh outdated rows, harvest, then write back, in that order.
pub fn run_pipeline_with_api<Q, G, P>(
    collection: &mut Collection,
    options: &PipelineOptions,
    query_api: &mut Q,
    graph: &mut G,
    pages: &P,
    credentials: Option<&Credentials>,
) -> Result<PipelineReport>
where
    Q: GraphQueryApi + ?Sized,
    G: GraphEntityApi + GraphWriteApi + ?Sized,
    P: WikiPageApi + ?Sized,
{
    info!(collection = collection.name(), "pipeline: sync");
    let sync = sync_with_api(collection, &options.sync, query_api)?;
    info!(collection = collection.name(), "pipeline: update outdated");
    let outdated = update_outdated_with_api(collection, graph)?;
    info!(collection = collection.name(), "pipeline: harvest");
    let harvest = harvest_with_api(collection, &options.harvest, pages, graph)?;
    info!(collection = collection.name(), "pipeline: write back");
    let write_back =
        write_back_with_api(collection, &options.write_back, graph, pages, credentials)?;
    Ok(PipelineReport {
        sync,
        outdated,
        harvest,
        write_back,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{PipelineOptions, run_pipeline_with_api};
    use crate::cache::CacheMode;
    use crate::entity::EntityId;
    use crate::reconcile::SyncOptions;
    use crate::remote::{Credentials, TemplateInvocation};
    use crate::testing::{MockGraph, MockPages, MockQuery, test_collection};

    const PAYLOAD: &str = r#"{"head":{"vars":[]},"results":{"bindings":[
        {"item":{"type":"uri","value":"http://www.wikidata.org/entity/Q42"},
         "modified":{"type":"literal","value":"2024-01-01T00:00:00Z"},
         "title_fr":{"type":"literal","value":"Foo"}}
    ]}}"#;

    #[test]
    fn pipeline_mirrors_harvests_and_writes_back() {
        let temp = tempdir().expect("tempdir");
        let mut collection = test_collection(temp.path(), &[373, 625]);
        let mut query = MockQuery::with_responses(vec![Ok(PAYLOAD.to_string())]);
        let mut graph = MockGraph::default();
        graph.add_entity(EntityId(42), &[]);
        let mut pages = MockPages::default();
        pages.add_page(
            "frwiki",
            "Foo",
            vec![
                TemplateInvocation::new("Commonscat", &["Foo Category"]),
                TemplateInvocation::new("Coord", &["48", "51", "29", "N", "2", "17", "40", "E"]),
            ],
        );
        pages.add_existing("commonswiki", "Category:Foo Category");
        let credentials = Credentials {
            user: "Bot".to_string(),
            password: "secret".to_string(),
        };
        let options = PipelineOptions {
            sync: SyncOptions {
                cache_mode: Some(CacheMode::Refresh),
            },
            ..PipelineOptions::default()
        };

        let report = run_pipeline_with_api(
            &mut collection,
            &options,
            &mut query,
            &mut graph,
            &pages,
            Some(&credentials),
        )
        .expect("pipeline");
        assert_eq!(report.sync.created, 1);
        assert_eq!(report.harvest.values_staged, 2);
        assert_eq!(report.write_back.written, 2);
        assert!(!report.write_back.aborted);
        assert_eq!(graph.claims_written.len(), 2);
        let store = &collection.store;
        assert_eq!(
            store.item_value(EntityId(42), 373).expect("P373").as_deref(),
            Some("Foo Category")
        );
        assert_eq!(
            store.item_value(EntityId(42), 625).expect("P625").as_deref(),
            Some("48.85806|2.29444|0")
        );
        assert_eq!(store.outdated_items().expect("outdated"), vec![EntityId(42)]);

        let status = collection.status().expect("status");
        assert_eq!(status.name, "churches");
        assert_eq!(status.sites, vec!["frwiki".to_string()]);
    }
}
