//! JSON-over-HTTP transport with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

use crate::rate_limit::RateLimiter;

/// Capped exponential delay between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// 401/403 mean the credentials are wrong, not that the page is.
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 401 | 403, .. })
    }

    /// Throttling, server faults and dropped connections; never a bad payload.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::Decode { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    None,
    /// `Authorization: Bearer <token>`
    Bearer(&'a SecretString),
    /// `Authorization: <token>` (monday.com style)
    Raw(&'a SecretString),
}

#[derive(Debug)]
pub struct JsonRequest<'a> {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    pub auth: Auth<'a>,
    /// Provider limiter the transport waits on before every attempt.
    pub limiter: Option<&'a RateLimiter>,
}

impl<'a> JsonRequest<'a> {
    pub fn get(url: impl Into<String>, auth: Auth<'a>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            query: Vec::new(),
            body: None,
            auth,
            limiter: None,
        }
    }

    pub fn post(url: impl Into<String>, auth: Auth<'a>, body: JsonValue) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            query: Vec::new(),
            body: Some(body),
            auth,
            limiter: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn throttled(mut self, limiter: &'a RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Everything an adapter needs from the network: send one JSON request, get one JSON document.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn send(&self, request: JsonRequest<'_>) -> Result<JsonValue, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    retry: RetryPolicy,
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
            retry: config.retry,
        })
    }

    fn build(&self, request: &JsonRequest<'_>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        builder = match request.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token.expose_secret()),
            Auth::Raw(token) => builder.header(reqwest::header::AUTHORIZATION, token.expose_secret()),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    async fn exchange(&self, request: &JsonRequest<'_>) -> Result<JsonValue, FetchError> {
        // Closed only on drop, which cannot happen while `self` is borrowed.
        let _global = self.global_limit.acquire().await.ok();

        let resp = self.build(request).send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn send_with_retries(&self, request: &JsonRequest<'_>) -> Result<JsonValue, FetchError> {
        let mut retry = 0;
        loop {
            // Every attempt takes a limiter slot, retries included.
            if let Some(limiter) = request.limiter {
                limiter.acquire().await;
            }
            match self.exchange(request).await {
                Err(err) if err.is_retryable() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay_before(retry);
                    debug!(error = %err, retry, delay_ms = delay.as_millis() as u64, "retrying request");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn send(&self, request: JsonRequest<'_>) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", method = %request.method, url = %request.url);
        self.send_with_retries(&request).instrument(span).await
    }
}
