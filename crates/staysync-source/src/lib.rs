//! Extractor side of staysync: the `PageSource` contract, page-shape decoding
//! and the pagination loop shared by the HTTP and fixture sources.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use staysync_core::RegionCode;
use thiserror::Error;
use tracing::debug;

mod fixture;
mod http;

pub use fixture::FixturePageSource;
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpPageSource, HttpSourceConfig, RetryDisposition,
    SimpleTokenBucket, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "staysync-source";

/// Query parameter carrying the incremental cutoff.
pub const INCREMENTAL_PARAM: &str = "updated_since";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding page from {origin}: {source}")]
    Decode {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected page shape from {origin}")]
    UnexpectedShape { origin: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no API token configured for region {0}")]
    MissingToken(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub region: RegionCode,
    pub endpoint: String,
    pub page: u32,
    pub page_size: u32,
    /// Extra query parameters (partition filter, incremental cutoff).
    pub params: BTreeMap<String, String>,
}

impl PageRequest {
    pub fn first(region: RegionCode, endpoint: impl Into<String>, page_size: u32) -> Self {
        Self {
            region,
            endpoint: endpoint.into(),
            page: 1,
            page_size,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordPage {
    pub records: Vec<Value>,
    pub total_pages: Option<u32>,
    /// False for bare-list responses, which never paginate.
    pub paginated: bool,
}

/// Accepts `{"results": [...], "total_pages": n}`, `{"data": [...]}` or a bare array.
pub fn decode_page(body: Value, origin: &str) -> Result<RecordPage, SourceError> {
    match body {
        Value::Array(records) => Ok(RecordPage {
            records,
            total_pages: None,
            paginated: false,
        }),
        Value::Object(mut map) => {
            let total_pages = map
                .get("total_pages")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok());
            let records = match map.remove("results").or_else(|| map.remove("data")) {
                Some(Value::Array(records)) => records,
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(SourceError::UnexpectedShape {
                        origin: origin.to_string(),
                    })
                }
            };
            Ok(RecordPage {
                records,
                total_pages,
                paginated: true,
            })
        }
        _ => Err(SourceError::UnexpectedShape {
            origin: origin.to_string(),
        }),
    }
}

pub fn decode_page_bytes(bytes: &[u8], origin: &str) -> Result<RecordPage, SourceError> {
    let body: Value = serde_json::from_slice(bytes).map_err(|source| SourceError::Decode {
        origin: origin.to_string(),
        source,
    })?;
    decode_page(body, origin)
}

#[async_trait]
pub trait PageSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, SourceError>;
}

/// Walk pages from `first` until an empty page, the last advertised page, or a
/// bare-list response.
pub async fn collect_all(source: &dyn PageSource, first: PageRequest) -> Result<Vec<Value>, SourceError> {
    let mut request = first;
    let mut records = Vec::new();
    loop {
        let page = source.fetch_page(&request).await?;
        debug!(
            source = source.name(),
            endpoint = %request.endpoint,
            page = request.page,
            count = page.records.len(),
            "fetched page"
        );
        if page.records.is_empty() {
            break;
        }
        records.extend(page.records);
        let last_advertised = page.total_pages.is_some_and(|total| request.page >= total);
        if !page.paginated || last_advertised {
            break;
        }
        request = request.next();
    }
    Ok(records)
}
