//! HTTP transport backed by `reqwest`.

use crate::feed::next_from_link_header;
use crate::transport::{OutboundRequest, Transport, TransportResponse};
use crate::{Result, SyncError};
use async_trait::async_trait;
use refsync_common::sanitizer::LogSanitizer;
use refsync_config::Config;
use refsync_store::HttpMethod;
use std::collections::HashMap;

const API_VERSION_HEADER: &str = "Zotero-API-Version";
const WRITE_TOKEN_HEADER: &str = "Zotero-Write-Token";

pub struct HttpTransport {
    client: reqwest::Client,
    /// `{base_url}/{library_prefix}`, no trailing slash
    library_url: String,
    api_version: u32,
    /// Credential profile name to API key
    credentials: HashMap<String, Option<String>>,
    sanitizer: LogSanitizer,
}

impl HttpTransport {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.server.timeout())
            .user_agent(concat!("refsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("HTTP client setup: {}", e)))?;

        let mut credentials = HashMap::new();
        credentials.insert(config.sync.credential.clone(), config.server.api_key.clone());

        Ok(Self {
            client,
            library_url: library_url(&config.server.base_url, &config.server.library_prefix),
            api_version: config.server.api_version,
            credentials,
            sanitizer: LogSanitizer::new(),
        })
    }

    /// Register another credential profile
    pub fn with_credential(mut self, profile: impl Into<String>, api_key: Option<String>) -> Self {
        self.credentials.insert(profile.into(), api_key);
        self
    }

    fn url_for(&self, request: &OutboundRequest) -> String {
        if request.is_absolute() {
            request.path.clone()
        } else if request.path.starts_with('/') {
            format!("{}{}", self.library_url, request.path)
        } else {
            format!("{}/{}", self.library_url, request.path)
        }
    }
}

fn library_url(base_url: &str, prefix: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, prefix)
    }
}

fn method_for(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        let api_key = self.credentials.get(&request.credential).ok_or_else(|| {
            SyncError::transport_fatal(format!(
                "unknown credential profile '{}'",
                request.credential
            ))
        })?;

        let url = self.url_for(request);
        tracing::debug!("{} {}", request.method, self.sanitizer.sanitize(&url));

        let mut builder = self
            .client
            .request(method_for(request.method), &url)
            .header(API_VERSION_HEADER, self.api_version.to_string());
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }
        if let Some(etag) = &request.if_match {
            builder = builder.header(reqwest::header::IF_MATCH, etag);
        }
        if let Some(token) = &request.write_token {
            builder = builder.header(WRITE_TOKEN_HEADER, token);
        }
        if let Some(body) = &request.body {
            let content_type = if request.plain_text {
                "text/plain"
            } else {
                "application/json"
            };
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            let message = self.sanitizer.sanitize(&e.to_string());
            if e.is_timeout() || e.is_connect() || e.is_request() {
                SyncError::transport_retryable(message)
            } else {
                SyncError::transport_fatal(message)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let next_link = headers
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_from_link_header);
        let etag = headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|e| SyncError::transport_retryable(self.sanitizer.sanitize(&e.to_string())))?;

        tracing::debug!(
            "{} {} -> {} ({} bytes)",
            request.method,
            self.sanitizer.sanitize(&url),
            status,
            body.len()
        );

        Ok(TransportResponse {
            status,
            body,
            next_link,
            etag,
        })
    }
}
