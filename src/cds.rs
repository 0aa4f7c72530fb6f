use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::CdsConfig;
use crate::error::ClimateError;
use crate::store::Store;

const MAX_POLLS: usize = 10_000;

/// Passthrough to the Climate Data Store retrieval API.
pub trait CdsClient: Send + Sync {
    /// Submits `request` for `dataset`, waits for completion and writes the
    /// result to `destination`. Returns the number of bytes written.
    fn retrieve(
        &self,
        dataset: &str,
        request: &Value,
        destination: &Utf8Path,
    ) -> Result<u64, ClimateError>;
}

#[derive(Debug, Deserialize)]
struct TaskReply {
    #[serde(default)]
    state: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct CdsHttpClient {
    client: Client,
    url: String,
    uid: String,
    secret: String,
    poll_interval: Duration,
}

impl CdsHttpClient {
    pub fn new(config: &CdsConfig) -> Result<Self, ClimateError> {
        let key = config.key.as_deref().ok_or_else(|| {
            ClimateError::MissingCredentials("CDS API key not configured (CDSAPI_KEY)".to_string())
        })?;
        let (uid, secret) = key.split_once(':').ok_or_else(|| {
            ClimateError::MissingCredentials("CDS API key must look like <uid>:<key>".to_string())
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("climate-eed/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ClimateError::CdsHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|err| ClimateError::CdsHttp(err.to_string()))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            uid: uid.trim().to_string(),
            secret: secret.trim().to_string(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
        })
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
            .unwrap_or_else(|_| "CDS request failed".to_string());
        Err(ClimateError::CdsStatus { status, message })
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
            match make_req().send() {
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
                    return Err(ClimateError::CdsHttp(err.to_string()));
                }
            }
        }
    }

    fn submit(&self, dataset: &str, request: &Value) -> Result<TaskReply, ClimateError> {
        let url = format!("{}/resources/{dataset}", self.url);
        let response = self.send_with_retries(|| {
            self.client
                .post(&url)
                .basic_auth(&self.uid, Some(&self.secret))
                .json(request)
        })?;
        Self::handle_status(response)?
            .json::<TaskReply>()
            .map_err(|err| ClimateError::CdsHttp(err.to_string()))
    }

    fn poll(&self, request_id: &str) -> Result<TaskReply, ClimateError> {
        let url = format!("{}/tasks/{request_id}", self.url);
        let response = self.send_with_retries(|| {
            self.client
                .get(&url)
                .basic_auth(&self.uid, Some(&self.secret))
        })?;
        Self::handle_status(response)?
            .json::<TaskReply>()
            .map_err(|err| ClimateError::CdsHttp(err.to_string()))
    }

    fn wait(&self, mut reply: TaskReply) -> Result<String, ClimateError> {
        for _ in 0..MAX_POLLS {
            match reply.state.as_str() {
                "completed" => {
                    return reply.location.ok_or_else(|| {
                        ClimateError::CdsHttp("completed task has no download location".to_string())
                    });
                }
                "failed" => {
                    let message = reply
                        .error
                        .map(|error| error.to_string())
                        .unwrap_or_else(|| "request failed".to_string());
                    return Err(ClimateError::CdsHttp(message));
                }
                state => {
                    let request_id = reply.request_id.clone().ok_or_else(|| {
                        ClimateError::CdsHttp(format!("task in state {state:?} has no request id"))
                    })?;
                    debug!(request_id = %request_id, state, "waiting for CDS task");
                    thread::sleep(self.poll_interval);
                    reply = self.poll(&request_id)?;
                }
            }
        }
        Err(ClimateError::CdsHttp("gave up waiting for CDS task".to_string()))
    }
}

impl CdsClient for CdsHttpClient {
    fn retrieve(
        &self,
        dataset: &str,
        request: &Value,
        destination: &Utf8Path,
    ) -> Result<u64, ClimateError> {
        let reply = self.submit(dataset, request)?;
        let location = self.wait(reply)?;
        let location = if location.starts_with("http") {
            location
        } else {
            format!("{}/{}", self.url, location.trim_start_matches('/'))
        };
        info!(dataset, location = %location, "downloading CDS result");

        let response = self.send_with_retries(|| self.client.get(&location))?;
        let mut response = Self::handle_status(response)?;
        let mut written = 0u64;
        Store::write_with(destination, |file| {
            written = std::io::copy(&mut response, file)
                .map_err(|err| ClimateError::Filesystem(err.to_string()))?;
            Ok(())
        })?;
        Ok(written)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
