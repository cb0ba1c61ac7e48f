use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::{decode_page_bytes, PageRequest, PageSource, RecordPage, SourceError, INCREMENTAL_PARAM};

/// Serves captured API pages from disk:
/// `{root}/{region}/{endpoint-slug}[/{param}-{value}...]/page-{n}.json`.
///
/// A missing page file reads as an empty page, which ends pagination.
#[derive(Debug, Clone)]
pub struct FixturePageSource {
    root: PathBuf,
}

impl FixturePageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `/task/42/comments` becomes `task_42_comments`.
    pub fn endpoint_slug(endpoint: &str) -> String {
        endpoint
            .trim_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    pub fn page_path(&self, request: &PageRequest) -> PathBuf {
        let mut dir = self
            .root
            .join(request.region.as_str())
            .join(Self::endpoint_slug(&request.endpoint));
        for (key, value) in &request.params {
            if key == INCREMENTAL_PARAM {
                continue;
            }
            dir = dir.join(format!("{key}-{}", Self::endpoint_slug(value)));
        }
        dir.join(format!("page-{}.json", request.page))
    }
}

#[async_trait]
impl PageSource for FixturePageSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<RecordPage, SourceError> {
        let path = self.page_path(request);
        match fs::read(&path).await {
            Ok(bytes) => decode_page_bytes(&bytes, &path.display().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(RecordPage::default()),
            Err(source) => Err(SourceError::Io { path, source }),
        }
    }
}
