//! Remote record store access: the `RecordStore` seam, its REST client and an
//! in-memory store for tests.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::RequestBuilder;
use sekou_core::{field_codes, RemoteRecordHandle};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub mod memory;

pub const CRATE_NAME: &str = "sekou-remote";

/// Records requested per page when listing.
pub const PAGE_SIZE: usize = 500;

const TOKEN_HEADER: &str = "X-Cybozu-API-Token";
const MAX_ERROR_BODY: usize = 2048;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            Self::Decode(_) => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// One field of a fetched record, as `{"type": ..., "value": ...}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteField {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Value,
}

/// A record as returned by the remote store, keyed by field code.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord {
    pub fields: BTreeMap<String, RemoteField>,
}

impl RemoteRecord {
    pub fn id(&self) -> Option<&str> {
        self.fields
            .get(field_codes::RECORD_ID)
            .and_then(|f| f.value.as_str())
    }

    pub fn value(&self, code: &str) -> Option<&Value> {
        self.fields
            .get(code)
            .map(|f| &f.value)
            .filter(|v| !v.is_null())
    }

    /// Scalar field rendered as trimmed text; `None` when missing or blank.
    pub fn text(&self, code: &str) -> Option<String> {
        let text = match self.value(code)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Write envelope: every field is sent as `{"value": ...}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct RecordPayload {
    fields: BTreeMap<String, Value>,
}

impl RecordPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, code: &str, value: impl Into<Value>) {
        self.fields
            .insert(code.to_string(), json!({ "value": value.into() }));
    }

    /// Unwrapped value of a field.
    pub fn get(&self, code: &str) -> Option<&Value> {
        self.fields.get(code).and_then(|v| v.get("value"))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.get("value").map(|inner| (k.as_str(), inner)))
    }
}

/// Primitives offered by one app of the remote store. No call is
/// transactional with any other, and delivery is at-least-once.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record matching `query`, across all pages.
    async fn list(&self, query: &str) -> Result<Vec<RemoteRecord>, RemoteError>;

    /// A single page of records matching `query`.
    async fn get(&self, query: &str) -> Result<Vec<RemoteRecord>, RemoteError>;

    async fn insert(&self, record: &RecordPayload) -> Result<RemoteRecordHandle, RemoteError>;

    async fn update(
        &self,
        handle: &RemoteRecordHandle,
        record: &RecordPayload,
    ) -> Result<(), RemoteError>;
}

/// Quote a value for use inside a query expression.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// `code = "value" and ...` over every clause.
pub fn equals_query(clauses: &[(&str, &str)]) -> String {
    clauses
        .iter()
        .map(|(code, value)| format!("{code} = {}", quote(value)))
        .collect::<Vec<_>>()
        .join(" and ")
}

fn page_query(filter: &str, after_id: u64) -> String {
    let seek = format!("$id > {after_id} order by $id asc limit {PAGE_SIZE}");
    if filter.trim().is_empty() {
        seek
    } else {
        format!("({filter}) and {seek}")
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("sekou-sync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    records: Vec<RemoteRecord>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: String,
}

/// REST client bound to one app and its API token.
pub struct AppClient {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    api_token: String,
}

impl fmt::Debug for AppClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppClient")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .field("api_token", &"[REDACTED]")
            .finish()
    }
}

impl AppClient {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        api_token: impl Into<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: app_id.into(),
            api_token: api_token.into(),
        })
    }

    /// `https://<domain>.cybozu.com` for a bare subdomain; full URLs pass through.
    pub fn base_url_for_domain(domain: &str) -> String {
        let domain = domain.trim().trim_end_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{domain}.cybozu.com")
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/k/v1/{path}", self.base_url)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, RemoteError> {
        let resp = request.header(TOKEN_HEADER, &self.api_token).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let mut body = body;
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RecordStore for AppClient {
    async fn list(&self, query: &str) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut out = Vec::new();
        let mut after_id = 0u64;

        loop {
            let page = self.get(&page_query(query, after_id)).await?;
            let page_len = page.len();
            for record in &page {
                let id = record
                    .id()
                    .and_then(|id| id.parse::<u64>().ok())
                    .ok_or_else(|| RemoteError::Decode("record without numeric $id".into()))?;
                after_id = after_id.max(id);
            }
            out.extend(page);
            debug!(app = %self.app_id, page_len, total = out.len(), "listed page");

            if page_len < PAGE_SIZE {
                break;
            }
        }

        Ok(out)
    }

    async fn get(&self, query: &str) -> Result<Vec<RemoteRecord>, RemoteError> {
        let request = self
            .client
            .get(self.endpoint("records.json"))
            .query(&[("app", self.app_id.as_str()), ("query", query)]);
        let resp: RecordsResponse = self.send_json(request).await?;
        Ok(resp.records)
    }

    async fn insert(&self, record: &RecordPayload) -> Result<RemoteRecordHandle, RemoteError> {
        let request = self
            .client
            .post(self.endpoint("record.json"))
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "app": self.app_id, "record": record }));
        let resp: InsertResponse = self.send_json(request).await?;
        Ok(RemoteRecordHandle { id: resp.id })
    }

    async fn update(
        &self,
        handle: &RemoteRecordHandle,
        record: &RecordPayload,
    ) -> Result<(), RemoteError> {
        let request = self
            .client
            .put(self.endpoint("record.json"))
            .header(CONTENT_TYPE, "application/json")
            .json(&json!({ "app": self.app_id, "id": handle.id, "record": record }));
        let _: Value = self.send_json(request).await?;
        Ok(())
    }
}
