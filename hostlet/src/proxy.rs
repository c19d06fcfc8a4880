//! Proxy-fetch: HTTP relay between sibling capabilities.
//!
//! Children address each other by private `*.internal` names. The agent side
//! rewrites such requests into `fetch` control-channel calls; the supervisor
//! resolves the name to the sibling's discovered URL and performs the real
//! request. Bodies travel base64-encoded inside JSON frames.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Reserved top-level domain for sibling addressing.
pub const INTERNAL_TLD: &str = "internal";

/// HTTP request forwarded over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    /// Base64-encoded body, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, bytes: &[u8]) -> Self {
        self.body = Some(base64::engine::general_purpose::STANDARD.encode(bytes));
        self
    }

    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.body
            .as_deref()
            .map(|b| base64::engine::general_purpose::STANDARD.decode(b))
            .transpose()
    }

    /// The capability name when the request targets `<name>.internal`.
    pub fn internal_host(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.url).ok()?;
        let host = url.host_str()?;
        host.strip_suffix(&format!(".{INTERNAL_TLD}"))
            .map(str::to_string)
    }
}

/// HTTP response relayed back over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    /// Base64-encoded body.
    #[serde(default)]
    pub body: String,
}

impl FetchResponse {
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("`{url}` does not address the {INTERNAL_TLD} domain")]
    NotInternal { url: String },
    #[error("no started capability named `{host}`")]
    UnknownHost { host: String },
    #[error("invalid method `{0}`")]
    Method(String),
    #[error("invalid header `{0}`")]
    Header(String),
    #[error("invalid request body: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("fetch failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Maps a capability name to its discovered URL.
///
/// The orchestrator's capability directory implements this; the supervisor
/// only sees the narrow lookup it needs.
pub trait SiblingResolver: Send + Sync {
    fn url_for(&self, capability: &str) -> Option<String>;
}

/// Resolver with no siblings; every internal fetch fails with `UnknownHost`.
pub struct NullResolver;

impl SiblingResolver for NullResolver {
    fn url_for(&self, _capability: &str) -> Option<String> {
        None
    }
}

/// Fixed name-to-URL table, for tests and single-shot hosts.
pub struct StaticResolver {
    urls: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(urls: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            urls: urls.into_iter().collect(),
        }
    }
}

impl SiblingResolver for StaticResolver {
    fn url_for(&self, capability: &str) -> Option<String> {
        self.urls.get(capability).cloned()
    }
}

/// Supervisor-side performer for relayed fetches.
#[derive(Clone)]
pub struct ProxyFetcher {
    client: reqwest::Client,
    resolver: Arc<dyn SiblingResolver>,
}

impl ProxyFetcher {
    pub fn new(resolver: Arc<dyn SiblingResolver>) -> Self {
        Self {
            client: reqwest::Client::new(),
            resolver,
        }
    }

    /// Resolve the private host and perform the real request.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, ProxyError> {
        let original = reqwest::Url::parse(&request.url).map_err(|e| ProxyError::InvalidUrl {
            url: request.url.clone(),
            message: e.to_string(),
        })?;

        let host = request.internal_host().ok_or_else(|| ProxyError::NotInternal {
            url: request.url.clone(),
        })?;
        let base = self
            .resolver
            .url_for(&host)
            .ok_or(ProxyError::UnknownHost { host })?;

        let mut target = reqwest::Url::parse(&base).map_err(|e| ProxyError::InvalidUrl {
            url: base.clone(),
            message: e.to_string(),
        })?;
        target.set_path(original.path());
        target.set_query(original.query());

        tracing::debug!(from = %request.url, to = %target, "Relaying proxy fetch");
        perform_fetch(&self.client, target, &request).await
    }
}

/// Execute `request` against `target` and shape the response for the wire.
pub(crate) async fn perform_fetch(
    client: &reqwest::Client,
    target: reqwest::Url,
    request: &FetchRequest,
) -> Result<FetchResponse, ProxyError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|_| ProxyError::Method(request.method.clone()))?;

    let mut builder = client.request(method, target);
    for (name, value) in &request.headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProxyError::Header(name.clone()))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|_| ProxyError::Header(value.clone()))?;
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body_bytes()? {
        builder = builder.body(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let body = response.bytes().await?;

    Ok(FetchResponse {
        status,
        headers,
        body: base64::engine::general_purpose::STANDARD.encode(&body),
    })
}
