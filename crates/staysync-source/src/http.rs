use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use staysync_core::RegionCode;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

use crate::{decode_page_bytes, PageRequest, PageSource, RecordPage, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Client-side request pacing shared by every region on one source.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new((config.capacity.max(1), Instant::now())),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let (tokens, last_refill) = &mut *state;
            let elapsed = last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                *tokens = tokens.saturating_add(refills).min(self.capacity);
                *last_refill = Instant::now();
            }
            if *tokens > 0 {
                *tokens -= 1;
                return;
            }
            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    /// Bearer token per region, sent as `Authorization: JWT <token>`.
    pub tokens: BTreeMap<RegionCode, String>,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("staysync/{}", env!("CARGO_PKG_VERSION"))),
            concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
            tokens: BTreeMap::new(),
        }
    }

    /// Reads `STAYSYNC_TOKEN_<REGION>` for each region; regions without one
    /// fail at request time.
    pub fn with_tokens_from_env<'a>(mut self, regions: impl IntoIterator<Item = &'a RegionCode>) -> Self {
        for region in regions {
            let var = format!("STAYSYNC_TOKEN_{}", region.as_str().to_ascii_uppercase());
            if let Ok(token) = std::env::var(&var) {
                if !token.trim().is_empty() {
                    self.tokens.insert(region.clone(), token.trim().to_string());
                }
            }
        }
        self
    }
}

#[derive(Debug)]
pub struct HttpPageSource {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    token_bucket: Option<SimpleTokenBucket>,
    backoff: BackoffPolicy,
    tokens: BTreeMap<RegionCode, String>,
}

impl HttpPageSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            token_bucket: config.token_bucket.map(SimpleTokenBucket::new),
            backoff: config.backoff,
            tokens: config.tokens,
        })
    }

    pub fn url_for(&self, request: &PageRequest) -> String {
        format!("{}/{}", self.base_url, request.endpoint.trim_start_matches('/'))
    }

    fn query(request: &PageRequest) -> Vec<(String, String)> {
        let mut query = vec![
            ("limit".to_string(), request.page_size.to_string()),
            ("page".to_string(), request.page.to_string()),
        ];
        query.extend(request.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        query
    }

    async fn fetch_with_retry(&self, request: &PageRequest, token: &str) -> Result<Vec<u8>, SourceError> {
        let url = self.url_for(request);
        let query = Self::query(request);
        let mut attempt = 0;

        loop {
            let result = self
                .client
                .get(&url)
                .query(&query)
                .header(reqwest::header::ACCEPT, "application/json")
                .header(reqwest::header::AUTHORIZATION, format!("JWT {token}"))
                .send()
                .await;

            let retry = match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                        return Err(SourceError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || attempt >= self.backoff.max_retries {
                        return Err(SourceError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, ?delay, reason = %retry, "retrying page fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, SourceError> {
        let token = self
            .tokens
            .get(&request.region)
            .ok_or_else(|| SourceError::MissingToken(request.region.to_string()))?;

        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!(
            "http_page",
            region = %request.region,
            endpoint = %request.endpoint,
            page = request.page
        );
        let body = self.fetch_with_retry(request, token).instrument(span).await?;
        decode_page_bytes(&body, &self.url_for(request))
    }
}
