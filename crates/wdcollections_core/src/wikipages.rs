use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Deserialize;
use serde_json::Value;

use crate::config::EndpointSettings;
use crate::entity::EntityId;
use crate::error::RemoteError;
use crate::registry::known_site;
use crate::remote::{PageTemplates, WikiPageApi};
use crate::wikibase::{build_http_client, read_api_response};
use crate::wikitext::extract_templates;

/// Read-only MediaWiki client for the known wiki sites. Shared by the harvest threads.
pub struct WikiPagesClient {
    client: Client,
    user_agent: String,
    request_count: AtomicUsize,
}

impl WikiPagesClient {
    pub fn new(endpoints: &EndpointSettings) -> Result<Self> {
        Ok(Self {
            client: build_http_client(endpoints)?,
            user_agent: endpoints.user_agent.clone(),
            request_count: AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    fn query_page(
        &self,
        site: &str,
        title: &str,
        params: &[(&str, &str)],
        context: &str,
    ) -> Result<PageQueryResponse, RemoteError> {
        let site_info = known_site(site)
            .ok_or_else(|| RemoteError::terminal(format!("{context}: unsupported site {site}")))?;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let mut pairs = vec![
            ("format", "json"),
            ("formatversion", "2"),
            ("action", "query"),
            ("redirects", "1"),
            ("titles", title),
        ];
        pairs.extend_from_slice(params);
        let response = self
            .client
            .get(site_info.api_url())
            .header(USER_AGENT, self.user_agent.clone())
            .query(&pairs)
            .send();
        let payload: Value = read_api_response(response, context)?;
        serde_json::from_value(payload).map_err(|error| RemoteError::from_json(context, &error))
    }
}

impl WikiPageApi for WikiPagesClient {
    fn page_templates(&self, site: &str, title: &str) -> Result<PageTemplates, RemoteError> {
        let context = format!("fetch {site}:{title}");
        let parsed = self.query_page(
            site,
            title,
            &[
                ("prop", "revisions"),
                ("rvprop", "content"),
                ("rvslots", "main"),
            ],
            &context,
        )?;
        let redirect = parsed.query.redirects.last().map(|redirect| redirect.to.clone());
        let Some(page) = parsed.query.pages.into_iter().next() else {
            return Ok(PageTemplates::default());
        };
        if page.missing || page.invalid {
            return Ok(PageTemplates::default());
        }
        let content = page
            .revisions
            .into_iter()
            .next()
            .map(|revision| revision.slots.main.content)
            .unwrap_or_default();
        Ok(PageTemplates {
            exists: true,
            redirect,
            templates: extract_templates(&content),
        })
    }

    fn page_item(&self, site: &str, title: &str) -> Result<Option<EntityId>, RemoteError> {
        let context = format!("resolve {site}:{title}");
        let parsed = self.query_page(
            site,
            title,
            &[("prop", "pageprops"), ("ppprop", "wikibase_item")],
            &context,
        )?;
        Ok(parsed
            .query
            .pages
            .into_iter()
            .next()
            .filter(|page| !page.missing && !page.invalid)
            .and_then(|page| page.pageprops)
            .and_then(|props| props.wikibase_item)
            .and_then(|item| EntityId::parse(&item)))
    }

    fn page_exists(&self, site: &str, title: &str) -> Result<bool, RemoteError> {
        let context = format!("check {site}:{title}");
        let parsed = self.query_page(site, title, &[], &context)?;
        Ok(parsed
            .query
            .pages
            .first()
            .is_some_and(|page| !page.missing && !page.invalid))
    }
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryResponse {
    #[serde(default)]
    query: PageQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct PageQueryPayload {
    #[serde(default)]
    pages: Vec<PagePayload>,
    #[serde(default)]
    redirects: Vec<RedirectPayload>,
}

#[derive(Debug, Deserialize)]
struct RedirectPayload {
    to: String,
}

#[derive(Debug, Deserialize, Default)]
struct PagePayload {
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionPayload>,
    pageprops: Option<PagePropsPayload>,
}

#[derive(Debug, Deserialize)]
struct RevisionPayload {
    slots: RevisionSlots,
}

#[derive(Debug, Deserialize)]
struct RevisionSlots {
    main: RevisionMainSlot,
}

#[derive(Debug, Deserialize)]
struct RevisionMainSlot {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct PagePropsPayload {
    wikibase_item: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::PageQueryResponse;

    #[test]
    fn page_query_payload_decodes_content_redirects_and_props() {
        let payload = json!({
            "query": {
                "redirects": [{"from": "Foo bar", "to": "Foo"}],
                "pages": [{
                    "pageid": 1,
                    "title": "Foo",
                    "revisions": [{"slots": {"main": {"content": "{{Commonscat|Foo Category}}"}}}],
                    "pageprops": {"wikibase_item": "Q42"}
                }]
            }
        });
        let parsed: PageQueryResponse = serde_json::from_value(payload).expect("decode");
        assert_eq!(parsed.query.redirects[0].to, "Foo");
        let page = &parsed.query.pages[0];
        assert!(!page.missing);
        assert_eq!(page.revisions[0].slots.main.content, "{{Commonscat|Foo Category}}");
        assert_eq!(
            page.pageprops
                .as_ref()
                .and_then(|props| props.wikibase_item.as_deref()),
            Some("Q42")
        );

        let missing: PageQueryResponse = serde_json::from_value(json!({
            "query": {"pages": [{"title": "Nope", "missing": true}]}
        }))
        .expect("decode");
        assert!(missing.query.pages[0].missing);
    }
}
