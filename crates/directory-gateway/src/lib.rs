//! Client-side forwarding of templated directory queries.
//!
//! A call resolves a named template, binds the caller's parameters as
//! variables, posts `{query, variables}` to the configured upstream endpoint and
//! unwraps the `{data, errors}` envelope it gets back. Calls are independent:
//! no caching, no retries, no shared state beyond the HTTP client pool.

use std::time::Duration;

use directory_core::{Record, RecordId, SearchKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::Instrument;
use ulid::Ulid;

mod registry;

pub use registry::{QueryTemplateRegistry, RECORDS_BY_NAME, RECORD_BY_ID};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4020/v1/query";
const DEFAULT_TIMEOUT_MS: u64 = 5_000;
const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 30_000;
const MAX_ERROR_BODY_CHARS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("query template not found: {0}")]
    TemplateNotFound(String),
    #[error("upstream returned errors: {}", summarize(.0))]
    Upstream(Vec<UpstreamErrorEntry>),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

/// One failure descriptor from the upstream `errors` list, kept verbatim.
///
/// No shape is imposed on the payload; `message` and `extensions.code` are read
/// when present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct UpstreamErrorEntry(pub Value);

impl UpstreamErrorEntry {
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.0
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.0.get("message")?.as_str()
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.0.get("extensions")?.get("code")?.as_str()
    }

    fn summary(&self) -> String {
        match self.message() {
            Some(message) => message.to_string(),
            None => self.0.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { endpoint: DEFAULT_ENDPOINT.to_string(), timeout_ms: DEFAULT_TIMEOUT_MS }
    }
}

impl GatewayConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// # Errors
    /// Returns the JSON error when `raw` is not a valid config document.
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS))
    }
}

#[derive(Debug, Serialize)]
struct OutboundQuery<'a> {
    query: &'a str,
    variables: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Option<Vec<UpstreamErrorEntry>>,
}

#[derive(Debug, Clone)]
pub struct ForwardingGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    templates: QueryTemplateRegistry,
}

impl ForwardingGateway {
    /// # Errors
    /// Returns [`GatewayError::Transport`] when the HTTP client cannot be built.
    pub fn new(
        config: GatewayConfig,
        templates: QueryTemplateRegistry,
    ) -> Result<Self, GatewayError> {
        let client =
            reqwest::Client::builder().timeout(config.timeout()).build().map_err(|err| {
                GatewayError::Transport(format!("failed to build HTTP client: {err}"))
            })?;
        Ok(Self { client, config, templates })
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn templates(&self) -> &QueryTemplateRegistry {
        &self.templates
    }

    /// Forward one templated query and return the envelope's `data`.
    ///
    /// A non-empty `errors` list fails the call even when `data` is also present.
    /// Nothing is retried. Dropping the returned future abandons the request.
    ///
    /// # Errors
    /// - [`GatewayError::TemplateNotFound`] before any network traffic.
    /// - [`GatewayError::Transport`] on connect failure, timeout or non-2xx status.
    /// - [`GatewayError::Decode`] when a 2xx body is not an envelope.
    /// - [`GatewayError::Upstream`] carrying the upstream `errors` list.
    pub async fn call(
        &self,
        template: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, GatewayError> {
        let query = self.templates.get(template)?;
        let correlation_id = Ulid::new();
        let span = tracing::info_span!("gateway_call", template, correlation_id = %correlation_id);

        async move {
            let body = OutboundQuery { query, variables: params };
            let response = self
                .client
                .post(&self.config.endpoint)
                .header(CORRELATION_HEADER, correlation_id.to_string())
                .json(&body)
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                tracing::warn!(status = status.as_u16(), "upstream rejected query");
                return Err(GatewayError::Transport(format!(
                    "upstream returned HTTP {}: {}",
                    status.as_u16(),
                    truncate(&text)
                )));
            }

            let bytes = response.bytes().await.map_err(transport_error)?;
            let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|err| {
                GatewayError::Decode(format!("response is not a query envelope: {err}"))
            })?;
            let outcome = unwrap_envelope(envelope);
            match &outcome {
                Ok(_) => tracing::debug!("upstream query succeeded"),
                Err(err) => tracing::info!(error = %err, "upstream query failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Forward one query and deserialize `data[field]` into `T`.
    ///
    /// # Errors
    /// Any error from [`Self::call`], or [`GatewayError::Decode`] when the field
    /// is missing or has the wrong shape.
    pub async fn call_as<T>(
        &self,
        template: &str,
        params: &Map<String, Value>,
        field: &str,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
    {
        let mut data = self.call(template, params).await?;
        let value = data
            .get_mut(field)
            .map(Value::take)
            .ok_or_else(|| GatewayError::Decode(format!("data has no `{field}` field")))?;
        serde_json::from_value(value)
            .map_err(|err| GatewayError::Decode(format!("`{field}` has unexpected shape: {err}")))
    }

    /// # Errors
    /// See [`Self::call_as`].
    pub async fn records_by_name(&self, key: &SearchKey) -> Result<Vec<Record>, GatewayError> {
        let mut params = Map::new();
        params.insert("firstName".to_string(), Value::String(key.first_name.clone()));
        params.insert("lastName".to_string(), Value::String(key.last_name.clone()));
        if let Some(gender) = &key.gender {
            params.insert("gender".to_string(), Value::String(gender.clone()));
        }
        self.call_as(RECORDS_BY_NAME, &params, RECORDS_BY_NAME).await
    }

    /// # Errors
    /// See [`Self::call_as`]; an unknown id surfaces as [`GatewayError::Upstream`].
    pub async fn record_by_id(&self, id: &RecordId) -> Result<Record, GatewayError> {
        let mut params = Map::new();
        params.insert("id".to_string(), Value::String(id.as_str().to_string()));
        self.call_as(RECORD_BY_ID, &params, RECORD_BY_ID).await
    }
}

fn unwrap_envelope(envelope: Envelope) -> Result<Value, GatewayError> {
    match envelope.errors {
        Some(errors) if !errors.is_empty() => Err(GatewayError::Upstream(errors)),
        _ => Ok(envelope.data.unwrap_or(Value::Null)),
    }
}

#[allow(clippy::needless_pass_by_value)]
fn transport_error(err: reqwest::Error) -> GatewayError {
    let kind = if err.is_timeout() {
        "request timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    tracing::warn!(error = %err, kind, "upstream transport failure");
    GatewayError::Transport(format!("{kind}: {err}"))
}

fn summarize(errors: &[UpstreamErrorEntry]) -> String {
    errors.iter().map(UpstreamErrorEntry::summary).collect::<Vec<_>>().join("; ")
}

fn truncate(value: &str) -> String {
    let mut out = value.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
    if value.chars().count() > MAX_ERROR_BODY_CHARS {
        out.push_str("...");
    }
    out
}
