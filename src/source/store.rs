//! Key/value access to Zarr stores.
//!
//! Remote stores are read anonymously over HTTPS; `s3://bucket/prefix`
//! locations are mapped onto the bucket's public endpoint. Local stores are
//! plain directories.
//!
//! Remote requests that time out, fail to connect or get a 5xx answer are
//! retried a bounded number of times with a fixed pause.

use super::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// Pause between retries of a failed request.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// A read-only key/value view of a Zarr store.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Fetch the object at `key`. Missing objects are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Human-readable location for logs and reports.
    fn location(&self) -> &str;
}

/// Anonymous HTTP(S) store.
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
    timeout_seconds: u64,
    retries: u32,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout_seconds: u64, retries: u32) -> Result<Self, StoreError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| StoreError::Http {
                url: base_url.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            base_url,
            client,
            timeout_seconds,
            retries,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    async fn fetch(&self, url: &str) -> Result<Option<Bytes>, StoreError> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.request_error(url, e))?;

        let status = response.status();
        // S3 answers 403 rather than 404 for absent keys on anonymous buckets
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // The client timeout also covers the body, so a stalled download is a timeout too
        response
            .bytes()
            .await
            .map(Some)
            .map_err(|e| self.request_error(url, e))
    }

    fn request_error(&self, url: &str, e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout {
                url: url.to_string(),
                seconds: self.timeout_seconds,
            }
        } else if e.is_connect() {
            StoreError::Connect {
                url: url.to_string(),
            }
        } else {
            StoreError::Http {
                url: url.to_string(),
                message: e.to_string(),
            }
        }
    }
}

fn is_transient(error: &StoreError) -> bool {
    match error {
        StoreError::Timeout { .. } | StoreError::Connect { .. } => true,
        StoreError::Status { status, .. } => *status >= 500,
        StoreError::Http { .. } | StoreError::Io { .. } => false,
    }
}

#[async_trait]
impl ChunkStore for HttpStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let url = self.url_for(key);
        let mut attempt = 0;

        loop {
            match self.fetch(&url).await {
                Err(e) if attempt < self.retries && is_transient(&e) => {
                    attempt += 1;
                    warn!("{} (attempt {}/{}), retrying", e, attempt, self.retries + 1);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    fn location(&self) -> &str {
        &self.base_url
    }
}

/// Directory-backed store.
pub struct FileStore {
    root: PathBuf,
    display: String,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let display = root.display().to_string();
        Self { root, display }
    }
}

#[async_trait]
impl ChunkStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let path = self.root.join(key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    fn location(&self) -> &str {
        &self.display
    }
}

/// Map `s3://bucket/prefix` onto the bucket's virtual-hosted HTTPS endpoint.
pub fn s3_to_https(location: &str) -> Option<String> {
    let rest = location.strip_prefix("s3://")?;
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return None;
    }
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        Some(format!("https://{}.s3.amazonaws.com", bucket))
    } else {
        Some(format!("https://{}.s3.amazonaws.com/{}", bucket, prefix))
    }
}

/// Open a store from a URL, an `s3://` location or a local path.
pub fn open_store(
    location: &str,
    timeout_seconds: u64,
    retries: u32,
) -> Result<Box<dyn ChunkStore>, StoreError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Ok(Box::new(HttpStore::new(location, timeout_seconds, retries)?));
    }
    if let Some(url) = s3_to_https(location) {
        return Ok(Box::new(HttpStore::new(&url, timeout_seconds, retries)?));
    }

    let path = location.strip_prefix("file://").unwrap_or(location);
    Ok(Box::new(FileStore::new(path)))
}

/// Whether a location refers to a remote store.
pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://") || location.starts_with("s3://")
}
