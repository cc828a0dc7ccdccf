// src/services/fetcher.rs

//! HTTP fetch boundary.
//!
//! A [`Fetcher`] turns an [`ApiRequest`] into parsed JSON or a classified
//! [`FetchError`]. Retrying is the scheduler's job; a fetcher makes exactly
//! one attempt.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::{ApiConfig, Cursor};

/// Failure of a single fetch attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("client error: HTTP {status}")]
    Client { status: u16 },

    /// Response body was not valid JSON
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Classifies errors as transient or permanent.
pub trait IsRetryable {
    /// Returns true if the attempt may succeed when repeated.
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout
            | FetchError::Network(_)
            | FetchError::Server { .. }
            | FetchError::RateLimited { .. } => true,
            FetchError::Client { .. }
            | FetchError::Malformed(_)
            | FetchError::InvalidRequest(_) => false,
        }
    }
}

impl FetchError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            FetchError::RateLimited { retry_after }
        } else if status.is_server_error() {
            FetchError::Server {
                status: status.as_u16(),
            }
        } else {
            FetchError::Client {
                status: status.as_u16(),
            }
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_builder() {
            FetchError::InvalidRequest(err.to_string())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// A GET request relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Value of a query parameter, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl std::fmt::Display for ApiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)?;
        for (i, (k, v)) in self.query.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, k, v)?;
        }
        Ok(())
    }
}

/// Builds the requests of the traversal from configured path templates.
#[derive(Debug, Clone)]
pub struct Endpoints {
    events: String,
    event: String,
    laps: String,
    announcements: String,
    sport_category: String,
}

impl Endpoints {
    pub fn from_config(config: &ApiConfig) -> Self {
        Self {
            events: config.paths.events.clone(),
            event: config.paths.event.clone(),
            laps: config.paths.laps.clone(),
            announcements: config.paths.announcements.clone(),
            sport_category: config.sport_category.clone(),
        }
    }

    /// One page of an organization's events.
    pub fn events(&self, org_id: u64, cursor: Cursor, page_size: usize) -> ApiRequest {
        ApiRequest::new(self.events.replace("{org_id}", &org_id.to_string()))
            .param("count", page_size)
            .param("offset", cursor.offset())
            .param("sportCategory", &self.sport_category)
    }

    /// Event detail including its sessions.
    pub fn event_sessions(&self, event_id: u64) -> ApiRequest {
        ApiRequest::new(self.event.replace("{event_id}", &event_id.to_string()))
            .param("sessions", "true")
    }

    /// One page of a session's laps.
    pub fn laps(&self, session_id: u64, cursor: Cursor, page_size: usize) -> ApiRequest {
        ApiRequest::new(self.laps.replace("{session_id}", &session_id.to_string()))
            .param("count", page_size)
            .param("offset", cursor.offset())
    }

    pub fn announcements(&self, session_id: u64) -> ApiRequest {
        ApiRequest::new(
            self.announcements
                .replace("{session_id}", &session_id.to_string()),
        )
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::from_config(&ApiConfig::default())
    }
}

/// Performs a single fetch attempt.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &ApiRequest) -> std::result::Result<Value, FetchError>;
}

/// [`Fetcher`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpFetcher {
    /// Create a configured asynchronous HTTP fetcher.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .build()?;

        // A trailing slash makes `Url::join` append instead of replacing the last segment.
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base).map_err(|e| {
            AppError::config(format!("invalid api.base_url {}: {e}", config.base_url))
        })?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    fn url_for(&self, request: &ApiRequest) -> std::result::Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(request.path.trim_start_matches('/'))
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.path)))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &ApiRequest) -> std::result::Result<Value, FetchError> {
        let url = self.url_for(request)?;
        log::debug!("GET {}", url);

        let mut builder = self.client.get(url).header(ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(FetchError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::from_status(status, retry_after));
        }

        let body = response.bytes().await.map_err(FetchError::from_reqwest)?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}
