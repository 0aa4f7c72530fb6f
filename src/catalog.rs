use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::domain::{Collections, Predicate, TimeRange};
use crate::error::ClimateError;

const PAGE_LIMIT: usize = 100;
const MAX_PAGES: usize = 1000;

/// One retrievable resource of a catalog item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub href: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(flatten)]
    pub extra_fields: Map<String, Value>,
}

impl Asset {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            media_type: None,
            extra_fields: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub assets: BTreeMap<String, Asset>,
}

impl CatalogItem {
    pub fn asset(&self, name: &str) -> Option<&Asset> {
        self.assets.get(name)
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub endpoint: String,
    pub collections: Collections,
    pub time_range: Option<TimeRange>,
    pub predicate: Predicate,
}

impl CatalogQuery {
    pub fn search_body(&self) -> Value {
        let mut body = Map::new();
        if !self.collections.is_empty() {
            body.insert("collections".to_string(), json!(self.collections.as_slice()));
        }
        if let Some(range) = &self.time_range {
            body.insert("datetime".to_string(), Value::String(range.to_interval()));
        }
        if !self.predicate.is_empty() {
            body.insert("query".to_string(), self.predicate.to_value());
        }
        body.insert("limit".to_string(), json!(PAGE_LIMIT));
        Value::Object(body)
    }
}

pub trait CatalogClient: Send + Sync {
    /// Items in catalog order.
    fn search(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>, ClimateError>;
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    features: Vec<CatalogItem>,
    #[serde(default)]
    links: Vec<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Clone)]
pub struct StacHttpClient {
    client: Client,
}

impl StacHttpClient {
    pub fn new() -> Result<Self, ClimateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("climate-eed/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ClimateError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| ClimateError::CatalogHttp(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn search_url(endpoint: &str) -> String {
        format!("{}/search", endpoint.trim_end_matches('/'))
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, ClimateError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(ClimateError::CatalogStatus { status, message })
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, ClimateError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(ClimateError::CatalogHttp(err.to_string()));
                }
            }
        }
    }

    fn fetch_page(&self, href: &str, body: Option<&Value>) -> Result<SearchPage, ClimateError> {
        let response = self.send_with_retries(|| match body {
            Some(body) => self.client.post(href).json(body),
            None => self.client.get(href),
        })?;
        let response = Self::handle_status(response)?;
        response
            .json::<SearchPage>()
            .map_err(|err| ClimateError::CatalogHttp(err.to_string()))
    }
}

impl CatalogClient for StacHttpClient {
    fn search(&self, query: &CatalogQuery) -> Result<Vec<CatalogItem>, ClimateError> {
        let mut href = Self::search_url(&query.endpoint);
        let mut body = Some(query.search_body());
        let mut items = Vec::new();

        for page_number in 0..MAX_PAGES {
            let page = self.fetch_page(&href, body.as_ref())?;
            debug!(
                page = page_number,
                features = page.features.len(),
                "catalog page received"
            );
            items.extend(page.features);

            let Some(next) = page.links.into_iter().find(|link| link.rel == "next") else {
                break;
            };
            let is_post = next
                .method
                .as_deref()
                .map(|method| method.eq_ignore_ascii_case("POST"))
                .unwrap_or(false);
            body = if is_post {
                Some(next.body.unwrap_or_else(|| query.search_body()))
            } else {
                None
            };
            href = next.href;
        }
        Ok(items)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
