//! Remote model sources: the model hub and object storage.
//!
//! Both are reached through small async traits so the resolver never talks to
//! the network directly and tests can substitute in-memory fakes:
//! - [`HubClient`]: repository snapshots and single files from the model hub
//! - [`ObjectStoreClient`]: listing and downloading objects under a URI prefix

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use hf_hub::api::tokio::{ApiBuilder, ApiError, ApiRepo};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Hub request failed: {0}")]
    Hub(String),

    #[error("Object store request failed: {0}")]
    ObjectStore(String),

    #[error("Invalid object store URI: {0}")]
    InvalidUri(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ApiError> for SourceError {
    fn from(err: ApiError) -> Self {
        SourceError::Hub(err.to_string())
    }
}

impl From<object_store::Error> for SourceError {
    fn from(err: object_store::Error) -> Self {
        SourceError::ObjectStore(err.to_string())
    }
}

// ─── Model Hub ─────────────────────────────────────────────────────────────

/// Client for a remote model hub.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Download every file of `repo_id` into `dest`, preserving relative paths.
    ///
    /// Returns the paths written, relative to `dest`.
    async fn snapshot(
        &self,
        repo_id: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<Vec<PathBuf>, SourceError>;

    /// Download a single file of `repo_id` to `dest`.
    async fn fetch_file(
        &self,
        repo_id: &str,
        token: Option<&str>,
        filename: &str,
        dest: &Path,
    ) -> Result<(), SourceError>;
}

/// [`HubClient`] backed by the Hugging Face hub.
///
/// Files are downloaded into the hub cache and then hard-linked (or copied,
/// across filesystems) into the destination.
pub struct HfHubClient {
    cache_dir: PathBuf,
}

impl HfHubClient {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn repo(&self, repo_id: &str, token: Option<&str>) -> Result<ApiRepo, SourceError> {
        let api = ApiBuilder::new()
            .with_cache_dir(self.cache_dir.clone())
            .with_token(token.map(str::to_owned))
            .with_progress(false)
            .build()?;
        Ok(api.model(repo_id.to_string()))
    }
}

#[async_trait]
impl HubClient for HfHubClient {
    async fn snapshot(
        &self,
        repo_id: &str,
        token: Option<&str>,
        dest: &Path,
    ) -> Result<Vec<PathBuf>, SourceError> {
        let repo = self.repo(repo_id, token)?;
        let info = repo.info().await?;

        info!(
            repo_id,
            files = info.siblings.len(),
            revision = %info.sha,
            "Downloading hub snapshot"
        );

        let mut written = Vec::with_capacity(info.siblings.len());
        for sibling in &info.siblings {
            let cached = repo.get(&sibling.rfilename).await?;
            let target = dest.join(&sibling.rfilename);
            link_or_copy(&cached, &target).await?;
            debug!(file = sibling.rfilename, "Fetched");
            written.push(PathBuf::from(&sibling.rfilename));
        }

        Ok(written)
    }

    async fn fetch_file(
        &self,
        repo_id: &str,
        token: Option<&str>,
        filename: &str,
        dest: &Path,
    ) -> Result<(), SourceError> {
        info!(repo_id, filename, "Downloading single file from hub");
        let repo = self.repo(repo_id, token)?;
        let cached = repo.get(filename).await?;
        link_or_copy(&cached, dest).await
    }
}

/// Place the cached blob at `dest`, hard-linking when possible.
async fn link_or_copy(cached: &Path, dest: &Path) -> Result<(), SourceError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::try_exists(dest).await? {
        fs::remove_file(dest).await?;
    }

    // Cache entries are symlinks into the blob store; link the blob itself.
    let blob = fs::canonicalize(cached).await?;
    if fs::hard_link(&blob, dest).await.is_err() {
        fs::copy(&blob, dest).await?;
    }
    Ok(())
}

// ─── Object Storage ────────────────────────────────────────────────────────

/// A parsed `s3://bucket/prefix` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
    pub bucket: String,
    pub prefix: String,
}

impl ObjectUri {
    pub const SCHEME: &'static str = "s3://";

    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let rest = uri
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| SourceError::InvalidUri(uri.to_string()))?;
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SourceError::InvalidUri(uri.to_string()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Key of `filename` directly under this prefix.
    pub fn child_key(&self, filename: &str) -> String {
        let base = self.prefix.trim_end_matches('/');
        if base.is_empty() {
            filename.to_string()
        } else {
            format!("{base}/{filename}")
        }
    }

    /// Path of `key` relative to this prefix, used as the local file name.
    ///
    /// When the URI names a single object the key equals the prefix; the
    /// object's base name is used instead.
    pub fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        let base = self.prefix.trim_end_matches('/');
        match key.strip_prefix(base) {
            Some("") => key.rsplit('/').next().unwrap_or(key),
            Some(rel) if base.is_empty() => rel,
            Some(rel) if rel.starts_with('/') => rel.trim_start_matches('/'),
            _ => key,
        }
    }
}

impl std::fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}/{}", Self::SCHEME, self.bucket, self.prefix)
    }
}

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// Client for an object store.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// List every object under `uri`, excluding directory placeholders.
    async fn list(&self, uri: &ObjectUri) -> Result<Vec<ObjectEntry>, SourceError>;

    /// Download object `key` from `uri`'s bucket to `dest`.
    async fn download(&self, uri: &ObjectUri, key: &str, dest: &Path) -> Result<(), SourceError>;
}

/// [`ObjectStoreClient`] for Amazon S3, configured from the standard AWS
/// environment variables.
#[derive(Debug, Default)]
pub struct S3ObjectStore;

impl S3ObjectStore {
    fn store(&self, bucket: &str) -> Result<AmazonS3, SourceError> {
        Ok(AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()?)
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    async fn list(&self, uri: &ObjectUri) -> Result<Vec<ObjectEntry>, SourceError> {
        let store = self.store(&uri.bucket)?;
        let prefix = ObjectPath::from(uri.prefix.as_str());
        let prefix = (!uri.prefix.trim_matches('/').is_empty()).then_some(prefix);

        let metas: Vec<_> = store.list(prefix.as_ref()).try_collect().await?;
        let mut entries: Vec<ObjectEntry> = metas
            .into_iter()
            .map(|m| ObjectEntry {
                key: m.location.to_string(),
                size: m.size as u64,
            })
            .filter(|e| !e.key.ends_with('/'))
            .collect();

        // Listing is segment-based; a URI naming one object lists nothing.
        if entries.is_empty() {
            if let Some(prefix) = prefix {
                if let Ok(meta) = store.head(&prefix).await {
                    entries.push(ObjectEntry {
                        key: meta.location.to_string(),
                        size: meta.size as u64,
                    });
                }
            }
        }

        info!(uri = %uri, objects = entries.len(), "Listed object store prefix");
        Ok(entries)
    }

    async fn download(&self, uri: &ObjectUri, key: &str, dest: &Path) -> Result<(), SourceError> {
        let store = self.store(&uri.bucket)?;
        let result = store.get(&ObjectPath::from(key)).await?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut partial = dest.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        let mut file = fs::File::create(&partial).await?;
        let mut stream = result.into_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        fs::rename(&partial, dest).await?;

        debug!(key, bytes = written, dest = %dest.display(), "Downloaded object");
        Ok(())
    }
}
