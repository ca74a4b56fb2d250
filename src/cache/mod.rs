//! Directory-backed output cache keyed by request descriptor.
//!
//! Layout under the cache directory:
//! - `<cache_key>.artifact`: the serialized output
//! - `<cache_key>.json`: sidecar with the full descriptor
//! - `.lock`: taken while an entry is published
//!
//! An entry moves `absent -> populating -> populated`. Populating entries
//! live in an in-process slot table holding the `SharedArtifact` being
//! filled, so a second request for the same descriptor follows the first
//! instead of serializing again. Artifacts are written to a temporary file
//! and renamed into place, so a populated entry is always complete.

pub mod buffer;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::domain::RequestDescriptor;

pub use buffer::{ArtifactReader, SharedArtifact};

const ARTIFACT_EXTENSION: &str = "artifact";
const SIDECAR_EXTENSION: &str = "json";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("output {0} is already being cached")]
    AlreadyCaching(String),

    #[error("cache population abandoned: {0}")]
    Abandoned(String),

    #[error("cache worker failed: {0}")]
    Worker(String),
}

/// Sidecar record of a populated entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub descriptor: RequestDescriptor,
    pub cache_key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Outcome of claiming a descriptor
pub enum Claim {
    /// A populated entry exists; open it with `DiskCacheManager::open`
    Replay,

    /// Another request is populating the entry
    Follow(ArtifactReader),

    /// The caller now owns population of the entry
    Populate(CacheWriter),
}

/// Process-wide output cache
#[derive(Debug)]
pub struct DiskCacheManager {
    dir: PathBuf,
    chunk_size: usize,
    slots: Mutex<HashMap<RequestDescriptor, Arc<SharedArtifact>>>,
}

impl DiskCacheManager {
    /// Open a cache directory, creating it if needed.
    ///
    /// `chunk_size` is the read size used when replaying artifacts.
    pub fn new(dir: impl Into<PathBuf>, chunk_size: usize) -> Result<Arc<Self>, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        Ok(Arc::new(Self {
            dir,
            chunk_size: chunk_size.max(1),
            slots: Mutex::new(HashMap::new()),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<RequestDescriptor, Arc<SharedArtifact>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn artifact_path(&self, cache_key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", cache_key, ARTIFACT_EXTENSION))
    }

    fn sidecar_path(&self, cache_key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", cache_key, SIDECAR_EXTENSION))
    }

    /// Sidecar of a populated entry for exactly this descriptor
    fn lookup(&self, descriptor: &RequestDescriptor) -> Result<Option<CacheEntryMeta>, CacheError> {
        let cache_key = descriptor.cache_key();
        let sidecar = match std::fs::read(self.sidecar_path(&cache_key)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let meta: CacheEntryMeta = serde_json::from_slice(&sidecar)?;
        if meta.descriptor != *descriptor {
            debug!(cache_key = %cache_key, "Cache key collision, treating as absent");
            return Ok(None);
        }
        if !self.artifact_path(&cache_key).is_file() {
            return Ok(None);
        }

        Ok(Some(meta))
    }

    /// Whether a populated entry exists for this descriptor
    pub fn contains(&self, descriptor: &RequestDescriptor) -> Result<bool, CacheError> {
        Ok(self.lookup(descriptor)?.is_some())
    }

    /// Decide how a request for `descriptor` is served.
    ///
    /// Atomic per descriptor: at most one caller receives `Populate`
    /// while an entry is absent. Filesystem work runs on the blocking pool
    /// and never under the slot table lock.
    pub async fn claim(self: &Arc<Self>, descriptor: &RequestDescriptor) -> Result<Claim, CacheError> {
        if let Some(reader) = self.follow(descriptor) {
            return Ok(Claim::Follow(reader));
        }

        let manager = Arc::clone(self);
        let key = descriptor.clone();
        let prepared = blocking(move || {
            if manager.contains(&key)? {
                return Ok(None);
            }
            CacheWriter::create(&manager, key).map(Some)
        })
        .await?;
        let Some(writer) = prepared else {
            return Ok(Claim::Replay);
        };

        let mut slots = self.slots();
        if let Some(artifact) = slots.get(descriptor) {
            // Another request claimed the entry while the writer was prepared
            let reader = artifact.reader();
            drop(slots);
            writer.abort("claimed by a concurrent request");
            return Ok(Claim::Follow(reader));
        }
        slots.insert(descriptor.clone(), Arc::clone(&writer.artifact));
        Ok(Claim::Populate(writer))
    }

    /// Reader on an in-flight population, if one exists
    pub fn follow(&self, descriptor: &RequestDescriptor) -> Option<ArtifactReader> {
        self.slots().get(descriptor).map(|artifact| artifact.reader())
    }

    /// Begin populating an entry that is neither populated nor populating
    pub async fn start_caching(self: &Arc<Self>, descriptor: &RequestDescriptor) -> Result<CacheWriter, CacheError> {
        match self.claim(descriptor).await? {
            Claim::Populate(writer) => Ok(writer),
            Claim::Replay | Claim::Follow(_) => Err(CacheError::AlreadyCaching(descriptor.cache_key())),
        }
    }

    /// Open a populated entry for replay
    pub async fn open(self: &Arc<Self>, descriptor: &RequestDescriptor) -> Result<Option<CachedArtifact>, CacheError> {
        let manager = Arc::clone(self);
        let key = descriptor.clone();
        let Some(meta) = blocking(move || manager.lookup(&key)).await? else {
            return Ok(None);
        };

        let file = tokio::fs::File::open(self.artifact_path(&meta.cache_key)).await?;
        Ok(Some(CachedArtifact {
            file,
            chunk_size: self.chunk_size,
            meta,
        }))
    }

    /// All populated entries
    pub fn entries(&self) -> Result<Vec<CacheEntryMeta>, CacheError> {
        let mut entries = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SIDECAR_EXTENSION) {
                continue;
            }

            let meta: CacheEntryMeta = match std::fs::read(&path)
                .map_err(CacheError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::from))
            {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable cache sidecar");
                    continue;
                }
            };
            if self.artifact_path(&meta.cache_key).is_file() {
                entries.push(meta);
            }
        }

        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// Drop the slot for `descriptor` if it still holds `artifact`
    fn release(&self, descriptor: &RequestDescriptor, artifact: &Arc<SharedArtifact>) {
        let mut slots = self.slots();
        if slots.get(descriptor).is_some_and(|current| Arc::ptr_eq(current, artifact)) {
            slots.remove(descriptor);
        }
    }

    /// Write the sidecar and move the artifact into place under the cache lock
    fn publish(&self, temp: NamedTempFile, meta: &CacheEntryMeta, artifact: &SharedArtifact) -> Result<(), CacheError> {
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        lock.lock_exclusive()?;

        std::fs::write(self.sidecar_path(&meta.cache_key), serde_json::to_vec_pretty(meta)?)?;
        let target = self.artifact_path(&meta.cache_key);
        artifact.relocate(|| {
            temp.persist(&target)
                .map(|_| target.clone())
                .map_err(|err| CacheError::Io(err.error))
        })?;

        // Lock is released when the file is dropped
        drop(lock);
        Ok(())
    }
}

/// Run filesystem work on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| CacheError::Worker(err.to_string()))?
}

/// Owns the population of one cache entry.
///
/// Dropping the writer without calling `finish` rolls the entry back to
/// absent and fails any followers.
pub struct CacheWriter {
    manager: Arc<DiskCacheManager>,
    descriptor: RequestDescriptor,
    artifact: Arc<SharedArtifact>,
    temp: Option<NamedTempFile>,
    file: Option<tokio::fs::File>,
    written: u64,
}

impl CacheWriter {
    fn create(manager: &Arc<DiskCacheManager>, descriptor: RequestDescriptor) -> Result<Self, CacheError> {
        let temp = NamedTempFile::new_in(&manager.dir)?;
        let file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        let artifact = SharedArtifact::new(temp.path(), manager.chunk_size);

        Ok(Self {
            manager: Arc::clone(manager),
            descriptor,
            artifact,
            temp: Some(temp),
            file: Some(file),
            written: 0,
        })
    }

    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append a chunk to the entry and publish it to followers
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), CacheError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CacheError::Abandoned("writer already settled".to_string()))?;
        file.write_all(&chunk).await?;
        // Followers read the file, so the bytes must leave the write buffer first
        file.flush().await?;

        self.written += chunk.len() as u64;
        self.artifact.advance(chunk.len() as u64);
        Ok(())
    }

    /// Mark the entry populated
    pub async fn finish(mut self) -> Result<CacheEntryMeta, CacheError> {
        let (Some(temp), Some(mut file)) = (self.temp.take(), self.file.take()) else {
            return Err(CacheError::Abandoned("writer already settled".to_string()));
        };

        let result = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);

            let meta = CacheEntryMeta {
                cache_key: self.descriptor.cache_key(),
                descriptor: self.descriptor.clone(),
                size_bytes: self.written,
                created_at: Utc::now(),
            };
            let manager = Arc::clone(&self.manager);
            let artifact = Arc::clone(&self.artifact);
            let published = meta.clone();
            blocking(move || manager.publish(temp, &published, &artifact)).await?;
            Ok::<_, CacheError>(meta)
        }
        .await;

        match &result {
            Ok(meta) => {
                self.artifact.complete();
                info!(cache_key = %meta.cache_key, bytes = meta.size_bytes, "Cache entry populated");
            }
            Err(err) => self.artifact.abort(err.to_string()),
        }
        self.manager.release(&self.descriptor, &self.artifact);
        result
    }

    /// Roll the entry back to absent
    pub fn abort(mut self, reason: &str) {
        self.rollback(reason);
    }

    fn rollback(&mut self, reason: &str) {
        self.file.take();
        if let Some(temp) = self.temp.take() {
            if let Err(err) = temp.close() {
                warn!(error = %err, "Failed to remove partial cache file");
            }
        }

        self.artifact.abort(reason);
        self.manager.release(&self.descriptor, &self.artifact);
        debug!(cache_key = %self.descriptor.cache_key(), reason, "Cache population rolled back");
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.temp.is_some() {
            self.rollback("population abandoned");
        }
    }
}

/// Open handle on a populated entry
#[derive(Debug)]
pub struct CachedArtifact {
    file: tokio::fs::File,
    chunk_size: usize,
    meta: CacheEntryMeta,
}

impl CachedArtifact {
    pub fn meta(&self) -> &CacheEntryMeta {
        &self.meta
    }

    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CacheError> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let read = self.file.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}
