//! Single-writer broadcast state for artifacts that are still being produced.
//!
//! The bytes live only in the artifact's backing file. The writer appends to
//! the file and then advances the shared length; followers read the file
//! from their own offset and wait on a `Notify` for more until the writer
//! completes or aborts. Nothing is buffered in memory, so a population with
//! no followers costs no more than the file itself.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Notify;

use super::CacheError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Filling,
    Complete,
    Aborted(String),
}

#[derive(Debug)]
struct Inner {
    /// Current location of the backing file
    path: PathBuf,
    /// Bytes flushed to the backing file
    written: u64,
    status: Status,
}

/// Artifact shared between its producer and followers
#[derive(Debug)]
pub struct SharedArtifact {
    inner: Mutex<Inner>,
    notify: Notify,
    chunk_size: usize,
}

impl SharedArtifact {
    /// Track a file being filled at `path`; followers read `chunk_size` at a time
    pub fn new(path: impl Into<PathBuf>, chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                path: path.into(),
                written: 0,
                status: Status::Filling,
            }),
            notify: Notify::new(),
            chunk_size: chunk_size.max(1),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish `len` more bytes that are already flushed to the file.
    /// Ignored once the artifact is settled.
    pub fn advance(&self, len: u64) {
        {
            let mut inner = self.inner();
            if inner.status != Status::Filling {
                return;
            }
            inner.written += len;
        }
        self.notify.notify_waiters();
    }

    pub fn complete(&self) {
        self.settle(Status::Complete);
    }

    pub fn abort(&self, reason: impl Into<String>) {
        self.settle(Status::Aborted(reason.into()));
    }

    fn settle(&self, status: Status) {
        {
            let mut inner = self.inner();
            if inner.status != Status::Filling {
                return;
            }
            inner.status = status;
        }
        self.notify.notify_waiters();
    }

    /// Move the backing file. No reader opens it while `rename` runs.
    pub(crate) fn relocate<E>(&self, rename: impl FnOnce() -> Result<PathBuf, E>) -> Result<(), E> {
        let mut inner = self.inner();
        inner.path = rename()?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.inner().status == Status::Complete
    }

    /// Bytes published so far
    pub fn len(&self) -> u64 {
        self.inner().written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reader starting at the first byte
    pub fn reader(self: &Arc<Self>) -> ArtifactReader {
        ArtifactReader {
            artifact: Arc::clone(self),
            file: None,
            position: 0,
        }
    }
}

/// Follows a `SharedArtifact` from the beginning
#[derive(Debug)]
pub struct ArtifactReader {
    artifact: Arc<SharedArtifact>,
    file: Option<tokio::fs::File>,
    position: u64,
}

impl ArtifactReader {
    /// Bytes returned so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Next chunk, waiting for the writer if necessary.
    ///
    /// Fails once the writer aborted, even when earlier chunks were read.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CacheError> {
        loop {
            let artifact = Arc::clone(&self.artifact);
            let notified = artifact.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so an advance in between is not missed
            notified.as_mut().enable();

            let (available, path) = {
                let inner = self.artifact.inner();
                match &inner.status {
                    Status::Aborted(reason) => return Err(CacheError::Abandoned(reason.clone())),
                    Status::Complete if self.position >= inner.written => return Ok(None),
                    _ => {}
                }
                (inner.written.saturating_sub(self.position), inner.path.clone())
            };

            if available == 0 {
                notified.await;
                continue;
            }

            if self.file.is_none() && !self.open(&path).await? {
                // Renamed or removed between reading the path and opening it
                continue;
            }
            let Some(file) = self.file.as_mut() else {
                continue;
            };

            let want = available.min(self.artifact.chunk_size as u64) as usize;
            let mut buf = vec![0u8; want];
            file.read_exact(&mut buf).await?;
            self.position += want as u64;
            return Ok(Some(Bytes::from(buf)));
        }
    }

    /// Open the backing file at the current offset. `Ok(false)` if it moved.
    async fn open(&mut self, path: &Path) -> Result<bool, CacheError> {
        match tokio::fs::File::open(path).await {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(self.position)).await?;
                self.file = Some(file);
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let inner = self.artifact.inner();
                if inner.path != path || inner.status != Status::Filling {
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Backing {
        _temp: TempDir,
        path: PathBuf,
        file: std::fs::File,
    }

    impl Backing {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("artifact.tmp");
            let file = std::fs::File::create(&path).unwrap();
            Self { _temp: temp, path, file }
        }

        fn append(&mut self, artifact: &SharedArtifact, bytes: &[u8]) {
            self.file.write_all(bytes).unwrap();
            self.file.flush().unwrap();
            artifact.advance(bytes.len() as u64);
        }
    }

    async fn read_all(mut reader: ArtifactReader) -> Result<Vec<u8>, CacheError> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_reader_after_complete_sees_everything() {
        let mut backing = Backing::new();
        let artifact = SharedArtifact::new(&backing.path, 3);
        backing.append(&artifact, b"ab");
        backing.append(&artifact, b"cd");
        artifact.complete();

        assert!(artifact.is_complete());
        assert_eq!(artifact.len(), 4);
        assert_eq!(read_all(artifact.reader()).await.unwrap(), b"abcd");
        // Readers are independent
        assert_eq!(read_all(artifact.reader()).await.unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_reader_follows_writer() {
        let mut backing = Backing::new();
        let artifact = SharedArtifact::new(&backing.path, 64);
        let reader = tokio::spawn(read_all(artifact.reader()));

        for chunk in [&b"one "[..], b"two ", b"three"] {
            tokio::time::sleep(Duration::from_millis(5)).await;
            backing.append(&artifact, chunk);
        }
        artifact.complete();

        assert_eq!(reader.await.unwrap().unwrap(), b"one two three");
    }

    #[tokio::test]
    async fn test_late_reader_gets_prefix_from_file() {
        let mut backing = Backing::new();
        let artifact = SharedArtifact::new(&backing.path, 1024);
        for _ in 0..256 {
            backing.append(&artifact, &[7u8; 1024]);
        }

        let mut reader = artifact.reader();
        let first = reader.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 1024);
        assert_eq!(reader.position(), 1024);

        artifact.complete();
        let rest = read_all(reader).await.unwrap();
        assert_eq!(rest.len(), 255 * 1024);
    }

    #[tokio::test]
    async fn test_reader_survives_relocation() {
        let mut backing = Backing::new();
        let artifact = SharedArtifact::new(&backing.path, 2);
        backing.append(&artifact, b"abcdef");

        let mut early = artifact.reader();
        assert_eq!(early.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"ab"));

        let target = backing.path.with_extension("artifact");
        artifact
            .relocate(|| std::fs::rename(&backing.path, &target).map(|_| target.clone()))
            .unwrap();
        artifact.complete();

        assert_eq!(read_all(early).await.unwrap(), b"cdef");
        assert_eq!(read_all(artifact.reader()).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_abort_fails_waiting_readers() {
        let mut backing = Backing::new();
        let artifact = SharedArtifact::new(&backing.path, 64);
        backing.append(&artifact, b"partial");
        let reader = tokio::spawn(read_all(artifact.reader()));

        tokio::time::sleep(Duration::from_millis(5)).await;
        artifact.abort("serializer failed");

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::Abandoned(reason) if reason == "serializer failed"));
    }

    #[test]
    fn test_settled_artifact_ignores_writes() {
        let artifact = SharedArtifact::new("unused", 64);
        artifact.complete();
        artifact.advance(4);
        artifact.abort("late");

        assert!(artifact.is_empty());
        assert!(artifact.is_complete());
    }
}
