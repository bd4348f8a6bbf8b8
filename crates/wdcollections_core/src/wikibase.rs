//! HTTP clients for the graph: the SPARQL query service and the Wikibase action API.
//! Each call is a single attempt whose failure is classified; retrying is left to the
//! caller's `RetryPolicy`.

use std::collections::BTreeMap;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::EndpointSettings;
use crate::entity::EntityId;
use crate::error::RemoteError;
use crate::geo::format_coordinates;
use crate::remote::{
    ClaimValue, Credentials, EntitySnapshot, GraphEntityApi, GraphQueryApi, GraphWriteApi,
    Provenance, claim_statement,
};
use crate::retry::{classify_api_error, classify_status, classify_transport};

const READ_INTERVAL_MS: u64 = 100;
const WRITE_INTERVAL_MS: u64 = 1_000;
const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

pub fn build_http_client(endpoints: &EndpointSettings) -> Result<Client> {
    Client::builder()
        .timeout(endpoints.timeout)
        .cookie_store(true)
        .build()
        .context("failed to build HTTP client")
}

/// Status, transport, JSON and API-level errors of one action API response,
/// classified for retrying.
pub(crate) fn read_api_response(
    response: reqwest::Result<Response>,
    context: &str,
) -> Result<Value, RemoteError> {
    let response = response.map_err(|error| classify_transport(&error, context))?;
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(status, context));
    }
    let body = response
        .text()
        .map_err(|error| classify_transport(&error, context))?;
    let payload: Value =
        serde_json::from_str(&body).map_err(|error| RemoteError::from_json(context, &error))?;
    if let Some(error) = payload.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        let info = error
            .get("info")
            .and_then(Value::as_str)
            .unwrap_or("unknown info");
        return Err(classify_api_error(code, info));
    }
    Ok(payload)
}

pub struct SparqlClient {
    client: Client,
    endpoint: String,
    user_agent: String,
    request_count: usize,
}

impl SparqlClient {
    pub fn new(endpoints: &EndpointSettings) -> Result<Self> {
        Ok(Self {
            client: build_http_client(endpoints)?,
            endpoint: endpoints.sparql_url.clone(),
            user_agent: endpoints.user_agent.clone(),
            request_count: 0,
        })
    }
}

impl GraphQueryApi for SparqlClient {
    fn run_query(&mut self, query: &str) -> Result<String, RemoteError> {
        self.request_count += 1;
        let context = "graph query";
        let response = self
            .client
            .post(&self.endpoint)
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT, SPARQL_RESULTS_JSON)
            .form(&[("query", query)])
            .send()
            .map_err(|error| classify_transport(&error, context))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, context));
        }
        response
            .text()
            .map_err(|error| classify_transport(&error, context))
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub struct WikibaseClient {
    client: Client,
    api_url: String,
    user_agent: String,
    last_request_at: Option<Instant>,
    request_count: usize,
    csrf_token: Option<String>,
    logged_in: bool,
}

impl WikibaseClient {
    pub fn new(endpoints: &EndpointSettings) -> Result<Self> {
        Ok(Self {
            client: build_http_client(endpoints)?,
            api_url: endpoints.api_url.clone(),
            user_agent: endpoints.user_agent.clone(),
            last_request_at: None,
            request_count: 0,
            csrf_token: None,
            logged_in: false,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    fn request_get(
        &mut self,
        params: &[(&str, String)],
        context: &str,
    ) -> Result<Value, RemoteError> {
        self.apply_rate_limit(false);
        let pairs = with_format(params);
        let response = self
            .client
            .get(&self.api_url)
            .header(USER_AGENT, self.user_agent.clone())
            .query(&pairs)
            .send();
        read_api_response(response, context)
    }

    fn request_post(
        &mut self,
        params: &[(&str, String)],
        context: &str,
    ) -> Result<Value, RemoteError> {
        self.apply_rate_limit(true);
        let pairs = with_format(params);
        let response = self
            .client
            .post(&self.api_url)
            .header(USER_AGENT, self.user_agent.clone())
            .form(&pairs)
            .send();
        read_api_response(response, context).inspect_err(|error| {
            if error.to_string().contains("[badtoken]") {
                self.csrf_token = None;
            }
        })
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = Duration::from_millis(if is_write {
            WRITE_INTERVAL_MS
        } else {
            READ_INTERVAL_MS
        });
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn ensure_csrf_token(&mut self) -> Result<String, RemoteError> {
        if let Some(token) = &self.csrf_token {
            return Ok(token.clone());
        }
        let response = self.request_get(
            &[("action", "query".to_string()), ("meta", "tokens".to_string())],
            "csrf token",
        )?;
        let parsed: TokenQueryResponse = serde_json::from_value(response)
            .map_err(|error| RemoteError::from_json("csrf token", &error))?;
        let token = parsed
            .query
            .tokens
            .and_then(|tokens| tokens.csrftoken)
            .ok_or_else(|| RemoteError::terminal("no csrf token in response"))?;
        self.csrf_token = Some(token.clone());
        Ok(token)
    }
}

impl GraphEntityApi for WikibaseClient {
    fn get_entity(&mut self, id: EntityId) -> Result<Option<EntitySnapshot>, RemoteError> {
        let context = format!("fetch {id}");
        let response = self.request_get(
            &[
                ("action", "wbgetentities".to_string()),
                ("ids", id.to_string()),
                ("redirects", "yes".to_string()),
                ("props", "info|claims|sitelinks".to_string()),
            ],
            &context,
        )?;
        let parsed: EntitiesResponse = serde_json::from_value(response)
            .map_err(|error| RemoteError::from_json(&context, &error))?;
        let Some(entity) = parsed.entities.into_values().next() else {
            return Ok(None);
        };
        if entity.missing.is_some() {
            return Ok(None);
        }
        let resolved = entity
            .id
            .as_deref()
            .and_then(EntityId::parse)
            .unwrap_or(id);
        if resolved != id {
            debug!(requested = %id, resolved = %resolved, "entity redirect");
        }
        Ok(Some(entity.into_snapshot(resolved)))
    }
}

impl GraphWriteApi for WikibaseClient {
    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn login(&mut self, credentials: &Credentials) -> Result<(), RemoteError> {
        let token_response = self.request_get(
            &[
                ("action", "query".to_string()),
                ("meta", "tokens".to_string()),
                ("type", "login".to_string()),
            ],
            "login token",
        )?;
        let token_payload: TokenQueryResponse = serde_json::from_value(token_response)
            .map_err(|error| RemoteError::from_json("login token", &error))?;
        let login_token = token_payload
            .query
            .tokens
            .and_then(|tokens| tokens.logintoken)
            .ok_or_else(|| RemoteError::terminal("no login token in response"))?;

        let login_response = self.request_post(
            &[
                ("action", "login".to_string()),
                ("lgname", credentials.user.clone()),
                ("lgpassword", credentials.password.clone()),
                ("lgtoken", login_token),
            ],
            "login",
        )?;
        let login_payload: LoginResponse = serde_json::from_value(login_response)
            .map_err(|error| RemoteError::from_json("login", &error))?;
        match login_payload.login.result.as_deref() {
            Some("Success") => {
                self.csrf_token = None;
                self.logged_in = true;
                Ok(())
            }
            other => Err(RemoteError::terminal(format!(
                "login failed: {}",
                login_payload
                    .login
                    .reason
                    .or_else(|| other.map(ToString::to_string))
                    .unwrap_or_else(|| "unknown error".to_string())
            ))),
        }
    }

    fn add_claim(
        &mut self,
        item: EntityId,
        property: u32,
        value: &ClaimValue,
        provenance: &Provenance,
    ) -> Result<(), RemoteError> {
        let context = format!("write P{property} on {item}");
        let token = self.ensure_csrf_token()?;
        let params = set_claim_params(item, property, value, provenance, token);
        let response = self.request_post(&params, &context)?;
        if response.get("claim").is_none() {
            return Err(RemoteError::terminal(format!("{context}: no claim in response")));
        }
        Ok(())
    }
}

/// One `wbsetclaim` request carrying the statement with its reference, so a retried
/// write never leaves an unreferenced duplicate behind.
fn set_claim_params(
    item: EntityId,
    property: u32,
    value: &ClaimValue,
    provenance: &Provenance,
    token: String,
) -> Vec<(&'static str, String)> {
    vec![
        ("action", "wbsetclaim".to_string()),
        ("claim", claim_statement(item, property, value, provenance).to_string()),
        ("bot", "1".to_string()),
        ("token", token),
    ]
}

fn with_format(params: &[(&str, String)]) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(params.len() + 2);
    pairs.push(("format".to_string(), "json".to_string()));
    pairs.push(("formatversion".to_string(), "2".to_string()));
    for (key, value) in params {
        if !value.is_empty() {
            pairs.push(((*key).to_string(), value.clone()));
        }
    }
    pairs
}

/// Local text form of a claim datavalue.
pub fn datavalue_text(datavalue: &Value) -> Option<String> {
    let value = datavalue.get("value")?;
    match datavalue.get("type").and_then(Value::as_str)? {
        "wikibase-entityid" => value
            .get("id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| {
                value
                    .get("numeric-id")
                    .and_then(Value::as_u64)
                    .map(|id| EntityId(id).to_string())
            }),
        "string" => value.as_str().map(ToString::to_string),
        "globecoordinate" => {
            let latitude = value.get("latitude").and_then(Value::as_f64)?;
            let longitude = value.get("longitude").and_then(Value::as_f64)?;
            Some(format_coordinates(latitude, longitude))
        }
        "quantity" => value
            .get("amount")
            .and_then(Value::as_str)
            .map(|amount| amount.trim_start_matches('+').to_string()),
        "monolingualtext" => value
            .get("text")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        "time" => value
            .get("time")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        _ => None,
    }
}

#[derive(Debug, Deserialize, Default)]
struct EntitiesResponse {
    #[serde(default)]
    entities: BTreeMap<String, EntityPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct EntityPayload {
    id: Option<String>,
    missing: Option<Value>,
    modified: Option<String>,
    #[serde(default)]
    claims: BTreeMap<String, Vec<StatementPayload>>,
    #[serde(default)]
    sitelinks: BTreeMap<String, SitelinkPayload>,
}

impl EntityPayload {
    fn into_snapshot(self, id: EntityId) -> EntitySnapshot {
        let mut claims = BTreeMap::new();
        for (property, statements) in self.claims {
            let Some(property) = property
                .strip_prefix('P')
                .and_then(|digits| digits.parse::<u32>().ok())
            else {
                continue;
            };
            let values = statements
                .iter()
                .filter_map(|statement| statement.mainsnak.datavalue.as_ref())
                .filter_map(datavalue_text)
                .collect::<Vec<_>>();
            if !values.is_empty() {
                claims.insert(property, values);
            }
        }
        EntitySnapshot {
            id,
            modified: self.modified,
            claims,
            sitelinks: self
                .sitelinks
                .into_iter()
                .map(|(site, link)| (site, link.title))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatementPayload {
    mainsnak: SnakPayload,
}

#[derive(Debug, Deserialize)]
struct SnakPayload {
    datavalue: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SitelinkPayload {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    logintoken: Option<String>,
    csrftoken: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    login: LoginPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LoginPayload {
    result: Option<String>,
    reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EntitiesResponse, datavalue_text, set_claim_params};
    use crate::entity::EntityId;
    use crate::remote::{ClaimValue, Provenance};

    #[test]
    fn datavalues_convert_to_local_text() {
        assert_eq!(
            datavalue_text(&json!({
                "type": "wikibase-entityid",
                "value": {"entity-type": "item", "numeric-id": 142, "id": "Q142"}
            })),
            Some("Q142".to_string())
        );
        assert_eq!(
            datavalue_text(&json!({"type": "string", "value": "Foo.jpg"})),
            Some("Foo.jpg".to_string())
        );
        assert_eq!(
            datavalue_text(&json!({
                "type": "globecoordinate",
                "value": {"latitude": 48.858, "longitude": 2.294}
            })),
            Some("48.85800|2.29400|0".to_string())
        );
        assert_eq!(
            datavalue_text(&json!({"type": "quantity", "value": {"amount": "+2150", "unit": "1"}})),
            Some("2150".to_string())
        );
        assert_eq!(datavalue_text(&json!({"type": "unknown", "value": 1})), None);
    }

    #[test]
    fn entity_payload_becomes_snapshot() {
        let payload = json!({
            "entities": {
                "Q2": {
                    "id": "Q2",
                    "modified": "2024-02-03T04:05:06Z",
                    "claims": {
                        "P31": [
                            {"mainsnak": {
                                "snaktype": "value",
                                "datavalue": {
                                    "type": "wikibase-entityid",
                                    "value": {"id": "Q16970"}
                                }
                            }},
                            {"mainsnak": {"snaktype": "novalue"}}
                        ],
                        "P373": [{"mainsnak": {"datavalue": {"type": "string", "value": "Foo"}}}]
                    },
                    "sitelinks": {"frwiki": {"site": "frwiki", "title": "Foo"}}
                }
            }
        });
        let parsed: EntitiesResponse = serde_json::from_value(payload).expect("decode");
        let entity = parsed.entities.into_values().next().expect("entity");
        let snapshot = entity.into_snapshot(EntityId(2));
        assert_eq!(snapshot.modified.as_deref(), Some("2024-02-03T04:05:06Z"));
        assert_eq!(snapshot.values(31), &["Q16970".to_string()]);
        assert_eq!(snapshot.values(373), &["Foo".to_string()]);
        assert_eq!(snapshot.sitelinks.get("frwiki").map(String::as_str), Some("Foo"));
    }

    #[test]
    fn claim_and_reference_go_out_in_one_request() {
        let provenance = Provenance::Site {
            site: "frwiki".to_string(),
            item: EntityId(8447),
        };
        let value = ClaimValue::GlobeCoordinate {
            latitude: 48.85806,
            longitude: 2.29444,
        };
        let first = set_claim_params(EntityId(42), 625, &value, &provenance, "tok".to_string());
        let actions = first
            .iter()
            .filter(|(key, _)| *key == "action")
            .map(|(_, action)| action.as_str())
            .collect::<Vec<_>>();
        assert_eq!(actions, vec!["wbsetclaim"]);

        let claim = first
            .iter()
            .find(|(key, _)| *key == "claim")
            .map(|(_, claim)| claim.clone())
            .expect("claim param");
        let statement: serde_json::Value = serde_json::from_str(&claim).expect("statement json");
        assert_eq!(statement["mainsnak"]["datavalue"]["type"], json!("globecoordinate"));
        assert!(statement["references"][0]["snaks"]["P143"].is_array());

        // A retry re-sends the same statement id, which replaces rather than duplicates.
        let retried = set_claim_params(EntityId(42), 625, &value, &provenance, "tok2".to_string());
        let retried_claim = retried
            .iter()
            .find(|(key, _)| *key == "claim")
            .map(|(_, claim)| claim.clone())
            .expect("claim param");
        let retried_statement: serde_json::Value =
            serde_json::from_str(&retried_claim).expect("statement json");
        assert_eq!(statement["id"], retried_statement["id"]);
    }
}
