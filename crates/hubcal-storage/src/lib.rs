//! Canonical event store + upstream HTTP fetch utilities for hubcal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

mod memory;
mod postgres;
mod store;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;
pub use store::{EventStore, FeedFilter, SourceScope, StoreError};

pub const CRATE_NAME: &str = "hubcal-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    UpstreamUnreachable,
    Timeout,
    HttpStatus,
    ParseFailure,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FetchErrorKind::UpstreamUnreachable => "upstream unreachable",
            FetchErrorKind::Timeout => "upstream timed out",
            FetchErrorKind::HttpStatus => "upstream returned an error status",
            FetchErrorKind::ParseFailure => "unrecognized upstream payload",
        })
    }
}

/// Source-level failure. The only error class that fails a whole sync run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parse_failure(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ParseFailure, message)
    }

    fn from_reqwest(err: &reqwest::Error, url: &str) -> Self {
        Self::new(classify_reqwest_error(err), format!("{url}: {err}"))
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> FetchErrorKind {
    if err.is_timeout() {
        FetchErrorKind::Timeout
    } else {
        FetchErrorKind::UpstreamUnreachable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Timeout-bounded fetcher shared by every adapter.
///
/// Each call makes exactly one attempt: a failed source is retried by the
/// next scheduled or manual run, never inside the current one.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", source_id, url);
        async move {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| FetchError::from_reqwest(&err, url))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::new(
                    FetchErrorKind::HttpStatus,
                    format!("http status {} for {}", status.as_u16(), final_url),
                ));
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp
                .bytes()
                .await
                .map_err(|err| FetchError::from_reqwest(&err, &final_url))?
                .to_vec();

            debug!(bytes = body.len(), status = status.as_u16(), "fetched upstream payload");
            Ok(FetchedResponse {
                status,
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
