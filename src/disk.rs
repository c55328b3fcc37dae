//! Persistent cache storage on the local filesystem.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<bucket-id>/bucket.toml          bucket name and creation time
//! <root>/<bucket-id>/<key-id>.json        entry metadata, the commit point
//! <root>/<bucket-id>/<key-id>-<uuid>.body response body
//! ```
//!
//! `bucket-id` and `key-id` are SHA-256 digests of the bucket name and the
//! cache key. An entry exists once its `.json` file exists; body files are
//! written under fresh names first, so a reader never sees a half-written
//! body.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::http::{CacheKey, Response};
use crate::store::CacheStore;

const MANIFEST: &str = "bucket.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketManifest {
    name: String,
    created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    body_file: String,
    stored: DateTime<Utc>,
    seq: u64,
}

/// One staged entry of a batch.
struct Commit {
    /// Metadata written under a temporary name.
    tmp: PathBuf,
    /// Where the metadata is published.
    target: PathBuf,
    /// Entry the batch replaces, if any.
    previous: Option<EntryMeta>,
}

/// Lowercase hex of a SHA-256 digest, truncated to `len` bytes.
fn digest_hex(input: &str, len: usize) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hash.iter().take(len).map(|b| format!("{b:02x}")).collect()
}

fn tmp_name() -> String {
    format!(".{}.tmp", uuid::Uuid::new_v4())
}

/// Writes `contents` to `path` atomically (write tmp + rename).
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(tmp_name().trim_start_matches('.'));
    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Cache storage that keeps buckets as directories under a root.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Creates a store rooted at `root`. The directory is created on first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(digest_hex(bucket, 8))
    }

    fn entry_path(dir: &Path, key: &CacheKey) -> PathBuf {
        dir.join(format!("{}.json", digest_hex(key.as_str(), 32)))
    }

    async fn read_manifest(dir: &Path) -> Result<Option<BucketManifest>> {
        match tokio::fs::read_to_string(dir.join(MANIFEST)).await {
            Ok(text) => Ok(Some(toml::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads the bucket manifest and checks it belongs to `bucket`.
    async fn existing_bucket_dir(&self, bucket: &str) -> Result<Option<PathBuf>> {
        let dir = self.bucket_dir(bucket);
        match Self::read_manifest(&dir).await? {
            Some(manifest) if manifest.name == bucket => Ok(Some(dir)),
            Some(manifest) => Err(Error::Storage(format!(
                "bucket directory {} holds {:?}, expected {bucket:?}",
                dir.display(),
                manifest.name
            ))),
            None => Ok(None),
        }
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all_meta(dir: &Path) -> Result<Vec<EntryMeta>> {
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut metas = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && entry.file_type().await?.is_file()
                && let Some(meta) = Self::read_meta(&path).await?
            {
                metas.push(meta);
            }
        }
        metas.sort_by_key(|m| m.seq);
        Ok(metas)
    }

    /// Removes files left behind by a failed batch.
    async fn discard(paths: &[PathBuf]) {
        for path in paths {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Restores the metadata that published entries replaced.
    async fn roll_back(published: &[Commit]) {
        for commit in published {
            let restored: std::io::Result<()> = match &commit.previous {
                Some(meta) => match serde_json::to_vec(meta) {
                    Ok(raw) => write_atomic(&commit.target, &raw).await,
                    Err(e) => Err(e.into()),
                },
                None => tokio::fs::remove_file(&commit.target).await,
            };
            if let Err(e) = restored {
                log::warn!("Could not roll back {}: {e}", commit.target.display());
            }
        }
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn open(&self, bucket: &str) -> Result<()> {
        if self.existing_bucket_dir(bucket).await?.is_some() {
            return Ok(());
        }
        let dir = self.bucket_dir(bucket);
        tokio::fs::create_dir_all(&dir).await?;
        let manifest = BucketManifest {
            name: bucket.to_string(),
            created: Utc::now(),
        };
        let text = toml::to_string(&manifest)?;
        write_atomic(&dir.join(MANIFEST), text.as_bytes()).await?;
        log::debug!("Created bucket {bucket} at {}", dir.display());
        Ok(())
    }

    async fn put_all(&self, bucket: &str, entries: Vec<(CacheKey, Response)>) -> Result<()> {
        let dir = self
            .existing_bucket_dir(bucket)
            .await?
            .ok_or_else(|| Error::Storage(format!("bucket {bucket} is not open")))?;

        // A key repeated within the batch keeps its last response.
        let mut batch: Vec<(CacheKey, Response)> = Vec::with_capacity(entries.len());
        for (key, response) in entries {
            if let Some(slot) = batch.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = response;
            } else {
                batch.push((key, response));
            }
        }

        let existing = Self::read_all_meta(&dir).await?;
        let mut next_seq = existing.iter().map(|m| m.seq + 1).max().unwrap_or(0);

        // Phase 1: write bodies under fresh names and metadata to temporaries.
        let mut written: Vec<PathBuf> = Vec::new();
        let mut commits: Vec<Commit> = Vec::new();
        for (key, response) in &batch {
            let key_id = digest_hex(key.as_str(), 32);
            let body_file = format!("{key_id}-{}.body", uuid::Uuid::new_v4());
            let body_path = dir.join(&body_file);
            if let Err(e) = tokio::fs::write(&body_path, &response.body).await {
                Self::discard(&written).await;
                return Err(e.into());
            }
            written.push(body_path);

            let previous = existing.iter().find(|m| m.url == key.as_str()).cloned();
            let seq = previous.as_ref().map_or_else(
                || {
                    let s = next_seq;
                    next_seq += 1;
                    s
                },
                |m| m.seq,
            );
            let meta = EntryMeta {
                url: key.as_str().to_string(),
                status: response.status,
                headers: response.headers.clone(),
                body_file,
                stored: Utc::now(),
                seq,
            };
            let tmp = dir.join(format!("{key_id}{}", tmp_name()));
            let raw = match serde_json::to_vec(&meta) {
                Ok(raw) => raw,
                Err(e) => {
                    Self::discard(&written).await;
                    return Err(e.into());
                }
            };
            if let Err(e) = tokio::fs::write(&tmp, raw).await {
                Self::discard(&written).await;
                return Err(e.into());
            }
            written.push(tmp.clone());
            commits.push(Commit {
                tmp,
                target: Self::entry_path(&dir, key),
                previous,
            });
        }

        // Phase 2: publish every entry by renaming its metadata into place.
        // Readers may see part of the batch while this loop runs; a failure
        // restores the entries published so far.
        for (published, commit) in commits.iter().enumerate() {
            if let Err(e) = tokio::fs::rename(&commit.tmp, &commit.target).await {
                Self::roll_back(&commits[..published]).await;
                Self::discard(&written).await;
                return Err(e.into());
            }
        }

        // Old bodies are only dropped once nothing can roll back to them.
        for commit in &commits {
            if let Some(previous) = &commit.previous {
                let _ = tokio::fs::remove_file(dir.join(&previous.body_file)).await;
            }
        }
        log::debug!("Stored {} entries in bucket {bucket}", batch.len());
        Ok(())
    }

    async fn match_key(&self, bucket: &str, key: &CacheKey) -> Result<Option<Response>> {
        let Some(dir) = self.existing_bucket_dir(bucket).await? else {
            return Ok(None);
        };
        let Some(meta) = Self::read_meta(&Self::entry_path(&dir, key)).await? else {
            return Ok(None);
        };
        if meta.url != key.as_str() {
            return Ok(None);
        }
        match tokio::fs::read(dir.join(&meta.body_file)).await {
            Ok(body) => Ok(Some(Response {
                status: meta.status,
                headers: meta.headers,
                body: Bytes::from(body),
            })),
            // Replaced between reading the metadata and the body.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<CacheKey>> {
        let Some(dir) = self.existing_bucket_dir(bucket).await? else {
            return Ok(Vec::new());
        };
        Ok(Self::read_all_meta(&dir)
            .await?
            .into_iter()
            .map(|m| CacheKey::from_stored(m.url))
            .collect())
    }

    async fn bucket_names(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut manifests = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match Self::read_manifest(&entry.path()).await {
                Ok(Some(manifest)) => manifests.push(manifest),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable bucket {}: {e}", entry.path().display()),
            }
        }
        manifests.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        Ok(manifests.into_iter().map(|m| m.name).collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        let Some(dir) = self.existing_bucket_dir(bucket).await? else {
            return Ok(false);
        };
        tokio::fs::remove_dir_all(&dir).await?;
        log::debug!("Deleted bucket {bucket}");
        Ok(true)
    }
}
