//! Cache storage abstraction and the in-memory implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};
use crate::disk::DiskStore;
use crate::error::{Error, Result};
use crate::http::{CacheKey, Response};

/// Named buckets mapping request identity to a stored response.
///
/// Implementations must be safe for concurrent use: many fetch reactions
/// read while an install may be writing.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Creates the bucket if it does not exist yet.
    async fn open(&self, bucket: &str) -> Result<()>;

    /// Stores a batch of entries. Either every entry becomes visible or none does.
    ///
    /// Entries replace any existing entry with the same key. A key repeated
    /// within the batch keeps its last response. Readers running while the
    /// batch is committed may see part of it; after an error none of it
    /// remains visible.
    async fn put_all(&self, bucket: &str, entries: Vec<(CacheKey, Response)>) -> Result<()>;

    /// Looks up a key in one bucket. A missing bucket is a miss.
    async fn match_key(&self, bucket: &str, key: &CacheKey) -> Result<Option<Response>>;

    /// Returns the keys stored in a bucket, in insertion order.
    async fn keys(&self, bucket: &str) -> Result<Vec<CacheKey>>;

    /// Returns every bucket name, in creation order.
    async fn bucket_names(&self) -> Result<Vec<String>>;

    /// Deletes a bucket and its entries. Returns false if it did not exist.
    async fn delete_bucket(&self, bucket: &str) -> Result<bool>;
}

macro_rules! delegate_cache_store {
    ($ty:ty) => {
        #[async_trait]
        impl<T: CacheStore + ?Sized> CacheStore for $ty {
            async fn open(&self, bucket: &str) -> Result<()> {
                (**self).open(bucket).await
            }

            async fn put_all(&self, bucket: &str, entries: Vec<(CacheKey, Response)>) -> Result<()> {
                (**self).put_all(bucket, entries).await
            }

            async fn match_key(&self, bucket: &str, key: &CacheKey) -> Result<Option<Response>> {
                (**self).match_key(bucket, key).await
            }

            async fn keys(&self, bucket: &str) -> Result<Vec<CacheKey>> {
                (**self).keys(bucket).await
            }

            async fn bucket_names(&self) -> Result<Vec<String>> {
                (**self).bucket_names().await
            }

            async fn delete_bucket(&self, bucket: &str) -> Result<bool> {
                (**self).delete_bucket(bucket).await
            }
        }
    };
}

delegate_cache_store!(Box<T>);
delegate_cache_store!(Arc<T>);

/// Opens the storage backend selected by the configuration.
#[must_use]
pub fn open_store(storage: &StorageConfig) -> Box<dyn CacheStore> {
    match storage.backend {
        StorageBackend::Disk => Box::new(DiskStore::new(&storage.dir)),
        StorageBackend::Memory => Box::new(MemoryStore::new()),
    }
}

#[derive(Debug, Default)]
struct Bucket {
    name: String,
    entries: Vec<(CacheKey, Response)>,
}

impl Bucket {
    fn insert(&mut self, key: CacheKey, response: Response) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = response;
        } else {
            self.entries.push((key, response));
        }
    }
}

/// Process-local cache storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<Vec<Bucket>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Bucket>>> {
        self.buckets
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn open(&self, bucket: &str) -> Result<()> {
        let mut buckets = self.lock()?;
        if !buckets.iter().any(|b| b.name == bucket) {
            buckets.push(Bucket {
                name: bucket.to_string(),
                entries: Vec::new(),
            });
        }
        Ok(())
    }

    async fn put_all(&self, bucket: &str, entries: Vec<(CacheKey, Response)>) -> Result<()> {
        // Everything happens under one lock, so readers see all or nothing.
        let mut buckets = self.lock()?;
        let target = buckets
            .iter_mut()
            .find(|b| b.name == bucket)
            .ok_or_else(|| Error::Storage(format!("bucket {bucket} is not open")))?;
        for (key, response) in entries {
            target.insert(key, response);
        }
        Ok(())
    }

    async fn match_key(&self, bucket: &str, key: &CacheKey) -> Result<Option<Response>> {
        let buckets = self.lock()?;
        Ok(buckets
            .iter()
            .find(|b| b.name == bucket)
            .and_then(|b| b.entries.iter().find(|(k, _)| k == key))
            .map(|(_, resp)| resp.clone()))
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<CacheKey>> {
        let buckets = self.lock()?;
        Ok(buckets
            .iter()
            .find(|b| b.name == bucket)
            .map(|b| b.entries.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default())
    }

    async fn bucket_names(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.iter().map(|b| b.name.clone()).collect())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        let mut buckets = self.lock()?;
        let before = buckets.len();
        buckets.retain(|b| b.name != bucket);
        Ok(buckets.len() != before)
    }
}
