use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::StoreError;

/// Metadata from a cheap HEAD probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub etag: Option<String>,
    pub size: u64,
}

/// Result of a conditional text fetch.
#[derive(Debug)]
pub enum TextFetch {
    NotModified,
    Fresh { body: String, etag: Option<String> },
}

/// Remote-object reads against the artifact bucket. Implementations are the
/// HTTP bucket endpoint and a local directory mirror (tests, offline runs).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head(&self, name: &str) -> Result<ObjectMeta, StoreError>;

    /// Fetch a small text artifact, revalidating against `if_none_match`
    /// when the caller holds a previous ETag.
    async fn get_text(
        &self,
        name: &str,
        if_none_match: Option<&str>,
    ) -> Result<TextFetch, StoreError>;

    /// Stream an artifact to `sink`. Callers own atomicity (temp + rename).
    async fn get_blob(&self, name: &str, sink: &Path) -> Result<(), StoreError>;
}

/// Object store over an HTTP bucket endpoint (e.g. a public S3 bucket).
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, name: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, name);
        let mut req = self
            .client
            .request(method, url)
            .timeout(Duration::from_secs(120));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    fn check_status(name: &str, resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                name: name.to_string(),
                status,
            });
        }
        Ok(resp)
    }
}

fn etag_of(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn head(&self, name: &str) -> Result<ObjectMeta, StoreError> {
        let resp = self.request(reqwest::Method::HEAD, name).send().await?;
        let resp = Self::check_status(name, resp)?;
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ObjectMeta {
            etag: etag_of(&resp),
            size,
        })
    }

    async fn get_text(
        &self,
        name: &str,
        if_none_match: Option<&str>,
    ) -> Result<TextFetch, StoreError> {
        let mut req = self.request(reqwest::Method::GET, name);
        if let Some(etag) = if_none_match {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(TextFetch::NotModified);
        }
        let resp = Self::check_status(name, resp)?;
        let etag = etag_of(&resp);
        let body = resp.text().await?;
        Ok(TextFetch::Fresh { body, etag })
    }

    async fn get_blob(&self, name: &str, sink: &Path) -> Result<(), StoreError> {
        let resp = self.request(reqwest::Method::GET, name).send().await?;
        let resp = Self::check_status(name, resp)?;

        let mut file = tokio::fs::File::create(sink).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

/// Object store over a local directory laid out like the bucket. Used by
/// the test suites and by deployments that mirror artifacts to local disk.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn meta_of(&self, name: &str) -> Result<(ObjectMeta, PathBuf), StoreError> {
        let path = self.path_of(name);
        let meta = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(name.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok((
            ObjectMeta {
                etag: Some(format!("{}-{}", mtime, meta.len())),
                size: meta.len(),
            },
            path,
        ))
    }
}

#[async_trait]
impl ObjectStore for DirStore {
    async fn head(&self, name: &str) -> Result<ObjectMeta, StoreError> {
        Ok(self.meta_of(name)?.0)
    }

    async fn get_text(
        &self,
        name: &str,
        if_none_match: Option<&str>,
    ) -> Result<TextFetch, StoreError> {
        let (meta, path) = self.meta_of(name)?;
        if if_none_match.is_some() && meta.etag.as_deref() == if_none_match {
            return Ok(TextFetch::NotModified);
        }
        let body = tokio::fs::read_to_string(&path).await?;
        Ok(TextFetch::Fresh {
            body,
            etag: meta.etag,
        })
    }

    async fn get_blob(&self, name: &str, sink: &Path) -> Result<(), StoreError> {
        let (_, path) = self.meta_of(name)?;
        tokio::fs::copy(&path, sink).await?;
        Ok(())
    }
}

struct CachedText {
    body: String,
    etag: Option<String>,
    fetched_at: Instant,
}

/// Freshness window for cached text artifacts; within it the active-cycle
/// check costs nothing, past it a conditional GET revalidates the ETag.
const TEXT_FRESHNESS: Duration = Duration::from_secs(15);

const RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Artifact client: retry-with-backoff and pointer-artifact caching layered
/// over an [`ObjectStore`] backend.
pub struct ArtifactStore {
    backend: Arc<dyn ObjectStore>,
    text_cache: tokio::sync::Mutex<HashMap<String, CachedText>>,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            text_cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Pick the backend matching a bucket URL: anything that parses as an
    /// http(s) URL goes over the network, otherwise it is a local mirror.
    pub fn from_url(bucket_url: &str, token: Option<String>) -> Self {
        if bucket_url.starts_with("http://") || bucket_url.starts_with("https://") {
            Self::new(Arc::new(HttpStore::new(bucket_url, token)))
        } else {
            Self::new(Arc::new(DirStore::new(bucket_url)))
        }
    }

    async fn with_retries<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < RETRIES => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    warn!(
                        "store request for {} failed (attempt {}): {}; retrying in {:?}",
                        name,
                        attempt + 1,
                        err,
                        delay
                    );
                    metrics::counter!("artifact_store.retries").increment(1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn head(&self, name: &str) -> Result<ObjectMeta, StoreError> {
        self.with_retries(name, || self.backend.head(name)).await
    }

    /// Small text artifact with 15 s freshness plus ETag revalidation.
    pub async fn get_text(&self, name: &str) -> Result<String, StoreError> {
        let mut cache = self.text_cache.lock().await;

        let etag = match cache.get(name) {
            Some(cached) if cached.fetched_at.elapsed() < TEXT_FRESHNESS => {
                metrics::counter!("artifact_store.text_cache_hits").increment(1);
                return Ok(cached.body.clone());
            }
            Some(cached) => cached.etag.clone(),
            None => None,
        };

        let fetch = self
            .with_retries(name, || self.backend.get_text(name, etag.as_deref()))
            .await?;

        match fetch {
            TextFetch::NotModified => {
                let cached = cache.get_mut(name).expect("revalidated without cache entry");
                cached.fetched_at = Instant::now();
                debug!("revalidated {} via etag", name);
                Ok(cached.body.clone())
            }
            TextFetch::Fresh { body, etag } => {
                cache.insert(
                    name.to_string(),
                    CachedText {
                        body: body.clone(),
                        etag,
                        fetched_at: Instant::now(),
                    },
                );
                Ok(body)
            }
        }
    }

    /// Streaming download to a sink path. The disk cache owns the atomic
    /// temp + rename protocol around this.
    pub async fn get_blob(&self, name: &str, sink: &Path) -> Result<(), StoreError> {
        let start = Instant::now();
        self.with_retries(name, || self.backend.get_blob(name, sink))
            .await?;
        metrics::histogram!("artifact_store.download_seconds")
            .record(start.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_stack(root: &Path) -> ArtifactStore {
        ArtifactStore::new(Arc::new(DirStore::new(root)))
    }

    #[tokio::test]
    async fn head_reports_size_and_etag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("active_cycle"), "2024010100").unwrap();

        let store = dir_stack(dir.path());
        let meta = store.head("active_cycle").await.unwrap();
        assert_eq!(meta.size, 10);
        assert!(meta.etag.is_some());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir_stack(dir.path());
        assert!(matches!(
            store.head("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn text_cache_serves_within_freshness_window() {
        let dir = tempfile::tempdir().unwrap();
        let pointer = dir.path().join("active_cycle");
        std::fs::write(&pointer, "2024010100").unwrap();

        let store = dir_stack(dir.path());
        assert_eq!(store.get_text("active_cycle").await.unwrap(), "2024010100");

        // A rewrite inside the freshness window is not observed.
        std::fs::write(&pointer, "2024010106").unwrap();
        assert_eq!(store.get_text("active_cycle").await.unwrap(), "2024010100");
    }

    #[tokio::test]
    async fn get_blob_lands_bytes_at_sink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob"), b"payload").unwrap();

        let store = dir_stack(dir.path());
        let sink = dir.path().join("sink");
        store.get_blob("blob", &sink).await.unwrap();
        assert_eq!(std::fs::read(&sink).unwrap(), b"payload");
    }
}
