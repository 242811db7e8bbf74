//! `http`: make an HTTP request.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, Url};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{OrchestratorError, Result};

use super::{optional_str, require_str, string_map, Primitive, StepContext};

/// Headers kept as arrays since they legitimately repeat
const MULTI_VALUE_HEADERS: &[&str] = &["set-cookie"];

/// HTTP request primitive.
///
/// Input: `url`, optional `method` (default GET), `headers` map and
/// `body`. A string body is sent as-is; any other JSON body is sent as
/// `application/json`.
///
/// Output: `status`, `status_code`, `headers`, `body`, `body_json` (when the
/// body parses as JSON), `started_at` and `finished_at`. Non-2xx statuses
/// are primitive failures.
pub struct Http {
    client: Client,
}

impl Http {
    pub fn new(timeout_seconds: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| OrchestratorError::internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn method(input: &Value) -> Result<Method> {
        let method = optional_str(input, "method").unwrap_or("GET").to_uppercase();
        Method::from_str(&method)
            .map_err(|_| OrchestratorError::bad_request(format!("Invalid HTTP method: {}", method)))
    }

    fn url(input: &Value) -> Result<Url> {
        let url = require_str(input, "url", "http")?;
        let parsed = Url::parse(url)
            .map_err(|_| OrchestratorError::bad_request(format!("Invalid url: {}", url)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            scheme => Err(OrchestratorError::bad_request(format!(
                "Unsupported url scheme '{}': {}",
                scheme, url
            ))),
        }
    }
}

#[async_trait]
impl Primitive for Http {
    fn name(&self) -> &str {
        "http"
    }

    fn validate_input(&self, input: &Value) -> Result<()> {
        Self::url(input)?;
        Self::method(input)?;
        string_map(input, "headers", "http")?;
        Ok(())
    }

    async fn run(&self, ctx: &StepContext, input: &Value) -> Result<Value> {
        let url = Self::url(input)?;
        let method = Self::method(input)?;
        debug!(step = %ctx.step_name, %method, %url, "Sending request");

        let mut request = self.client.request(method, url.clone());
        for (name, value) in string_map(input, "headers", "http")? {
            request = request.header(name, value);
        }
        request = match input.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(body)) => request.body(body.clone()),
            Some(body) => request.json(body),
        };

        let started_at = Utc::now();
        let response = tokio::select! {
            response = request.send() => response.map_err(|e| {
                OrchestratorError::primitive(format!("Request to {} failed: {}", url, e))
            })?,
            _ = ctx.cancel.cancelled() => {
                return Err(OrchestratorError::primitive("Request canceled"));
            }
        };

        let status = response.status();
        let mut headers = Map::new();
        for (name, value) in response.headers() {
            let key = name.as_str().to_string();
            let value = Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned());
            if MULTI_VALUE_HEADERS.contains(&key.as_str()) {
                if let Value::Array(values) = headers.entry(key).or_insert_with(|| json!([])) {
                    values.push(value);
                }
            } else {
                // First value wins
                headers.entry(key).or_insert(value);
            }
        }

        let body = response.text().await.map_err(|e| {
            OrchestratorError::primitive(format!("Failed to read response from {}: {}", url, e))
        })?;
        let finished_at = Utc::now();

        if !status.is_success() {
            return Err(OrchestratorError::primitive(format!(
                "HTTP {} from {}",
                status, url
            )));
        }

        let body_json = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
        Ok(json!({
            "status": status.to_string(),
            "status_code": status.as_u16(),
            "headers": headers,
            "body": body,
            "body_json": body_json,
            "started_at": started_at,
            "finished_at": finished_at,
        }))
    }
}
