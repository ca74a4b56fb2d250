//! Pull-based output handles and the per-request result record.
//!
//! An `OutputHandle` is a lazy, finite, non-restartable sequence of chunks.
//! It owns the request's `CompletionGuard`: the request finishes when the
//! handle is drained, fails when production fails, and fails when the
//! handle is dropped early.

use std::fmt;

use bytes::Bytes;
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cache::{ArtifactReader, CacheError, CacheWriter, CachedArtifact};
use crate::domain::SerializerId;
use crate::serializers::{MessagingSerializer, Serializer};

use super::completion::{Completion, CompletionGuard};
use super::error::CheckoutError;

/// How the bytes of a handle are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// Read back from a populated cache entry
    Replay,
    /// Read from another request's in-flight population
    Follow,
    /// Produced by a serializer and stored in the cache as it goes
    Populate,
    /// Produced by a serializer, not cached
    Direct,
    /// Discrete messages from a messaging serializer
    Messages,
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryKind::Replay => "replay",
            DeliveryKind::Follow => "follow",
            DeliveryKind::Populate => "populate",
            DeliveryKind::Direct => "direct",
            DeliveryKind::Messages => "messages",
        };
        f.write_str(name)
    }
}

/// Builds the serializer for a request on demand
pub(crate) type BuildSerializer = Box<dyn FnOnce() -> Result<Box<dyn Serializer>, CheckoutError> + Send>;

/// Where a handle's chunks come from
pub(crate) enum Source {
    Replay(CachedArtifact),
    /// Another request's population; `fallback` takes over if it is abandoned
    Follow {
        reader: ArtifactReader,
        fallback: Option<BuildSerializer>,
    },
    Populate {
        serializer: Box<dyn Serializer>,
        writer: Option<CacheWriter>,
    },
    Direct(Box<dyn Serializer>),
    /// Serializer output whose first `skip` bytes were already handed out
    Resume {
        serializer: Box<dyn Serializer>,
        skip: u64,
    },
    Messages(Box<dyn MessagingSerializer>),
}

impl Source {
    fn kind(&self) -> DeliveryKind {
        match self {
            Source::Replay(_) => DeliveryKind::Replay,
            Source::Follow { .. } => DeliveryKind::Follow,
            Source::Populate { .. } => DeliveryKind::Populate,
            Source::Direct(_) | Source::Resume { .. } => DeliveryKind::Direct,
            Source::Messages(_) => DeliveryKind::Messages,
        }
    }

    pub(crate) async fn next(&mut self) -> Result<Option<Bytes>, CheckoutError> {
        loop {
            let resumed = match self {
                Source::Replay(artifact) => return Ok(artifact.next_chunk().await?),
                Source::Direct(serializer) => return Ok(serializer.next_chunk()?),
                Source::Messages(serializer) => return Ok(serializer.next_message()?),
                Source::Follow { reader, fallback } => {
                    let err = match reader.next_chunk().await {
                        Ok(chunk) => return Ok(chunk),
                        Err(err) => err,
                    };
                    let build = match (err, fallback.take()) {
                        (CacheError::Abandoned(reason), Some(build)) => {
                            warn!(%reason, delivered = reader.position(), "Followed population abandoned, serializing here");
                            build
                        }
                        (err, _) => return Err(err.into()),
                    };

                    // Serializers are deterministic, so the regenerated
                    // output continues exactly where the follower stopped
                    Source::Resume {
                        serializer: build()?,
                        skip: reader.position(),
                    }
                }
                Source::Resume { serializer, skip } => {
                    while let Some(chunk) = serializer.next_chunk()? {
                        let len = chunk.len() as u64;
                        if *skip >= len {
                            *skip -= len;
                            continue;
                        }
                        let rest = chunk.slice(*skip as usize..);
                        *skip = 0;
                        return Ok(Some(rest));
                    }
                    return Ok(None);
                }
                Source::Populate { serializer, writer } => {
                    return match serializer.next_chunk()? {
                        Some(chunk) => {
                            if let Some(active) = writer.as_mut() {
                                if let Err(err) = active.write(chunk.clone()).await {
                                    // The consumer still gets its bytes; only the cache entry is lost
                                    warn!(error = %err, "Cache write failed, continuing uncached");
                                    if let Some(failed) = writer.take() {
                                        failed.abort(&err.to_string());
                                    }
                                }
                            }
                            Ok(Some(chunk))
                        }
                        None => {
                            if let Some(finished) = writer.take() {
                                if let Err(err) = finished.finish().await {
                                    warn!(error = %err, "Failed to publish cache entry");
                                }
                            }
                            Ok(None)
                        }
                    };
                }
            };
            *self = resumed;
        }
    }
}

/// The output of one request
pub struct OutputHandle {
    name: Option<String>,
    kind: DeliveryKind,
    source: Option<Source>,
    produced: u64,
    // Declared after `source` so a populating entry is rolled back
    // before the request is marked failed
    guard: Option<CompletionGuard>,
}

impl fmt::Debug for OutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("drained", &self.is_drained())
            .field("produced", &self.produced)
            .finish()
    }
}

impl OutputHandle {
    pub(crate) fn new(name: Option<String>, source: Source, guard: CompletionGuard) -> Self {
        Self {
            name,
            kind: source.kind(),
            source: Some(source),
            produced: 0,
            guard: Some(guard),
        }
    }

    /// Model name, when the model was loaded for this request
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> DeliveryKind {
        self.kind
    }

    /// Bytes handed out so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    pub fn is_drained(&self) -> bool {
        self.source.is_none()
    }

    /// Next chunk, or `None` once drained.
    ///
    /// For `DeliveryKind::Messages` each chunk is one message.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, CheckoutError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };

        match source.next().await {
            Ok(Some(chunk)) => {
                self.produced += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.source = None;
                debug!(kind = %self.kind, bytes = self.produced, "Output drained");
                if let Some(guard) = self.guard.take() {
                    guard.finish();
                }
                Ok(None)
            }
            Err(err) => {
                self.abort(&err.to_string());
                Err(err)
            }
        }
    }

    fn abort(&mut self, reason: &str) {
        self.source = None;
        if let Some(guard) = self.guard.take() {
            guard.fail(reason);
        }
    }

    /// Drain everything into memory
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, CheckoutError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Drain into `writer`, returning the bytes written.
    ///
    /// Messages are written one per line; the count includes the newlines.
    pub async fn write_to<W>(mut self, writer: &mut W) -> Result<u64, CheckoutError>
    where
        W: AsyncWrite + Unpin,
    {
        let separator: &[u8] = if self.kind == DeliveryKind::Messages { b"\n" } else { b"" };
        let mut written = 0u64;
        while let Some(chunk) = self.next_chunk().await? {
            let result = async {
                writer.write_all(&chunk).await?;
                writer.write_all(separator).await?;
                Ok::<_, std::io::Error>(())
            }
            .await;

            if let Err(err) = result {
                self.abort(&format!("transport closed: {}", err));
                return Err(err.into());
            }
            written += (chunk.len() + separator.len()) as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Adapt into a `Stream` of chunks
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, CheckoutError>> {
        stream::unfold(self, |mut handle| async move {
            match handle.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), handle)),
                Ok(None) => None,
                Err(err) => Some((Err(err), handle)),
            }
        })
    }
}

/// Result record of a checkout or download
#[derive(Debug)]
pub struct CheckoutResult {
    pub serializer_id: SerializerId,

    /// Set only when the model loaded cleanly
    pub project_name: Option<String>,

    /// Set only when the model loaded cleanly
    pub revision_number: Option<u32>,

    output: Option<OutputHandle>,
    completion: Completion,
}

impl CheckoutResult {
    pub(crate) fn new(serializer_id: SerializerId, completion: Completion) -> Self {
        Self {
            serializer_id,
            project_name: None,
            revision_number: None,
            output: None,
            completion,
        }
    }

    pub(crate) fn with_model(mut self, project_name: impl Into<String>, revision_number: u32) -> Self {
        self.project_name = Some(project_name.into());
        self.revision_number = Some(revision_number);
        self
    }

    pub(crate) fn with_output(mut self, output: OutputHandle) -> Self {
        self.output = Some(output);
        self
    }

    /// An empty result means the request failed without raising
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn output(&self) -> Option<&OutputHandle> {
        self.output.as_ref()
    }

    pub fn take_output(&mut self) -> Option<OutputHandle> {
        self.output.take()
    }

    /// The output, if this request took the messaging path
    pub fn take_messaging_stream(&mut self) -> Option<OutputHandle> {
        if self.output.as_ref()?.kind() == DeliveryKind::Messages {
            self.output.take()
        } else {
            None
        }
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Shorthand for `completion().on_finished(..)`
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&crate::domain::ActionState) + Send + 'static,
    {
        self.completion.on_finished(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionState;
    use crate::serializers::SerializerError;
    use futures::StreamExt;

    /// Yields chunks from the back; fails when `fail_at` chunks remain
    struct Chunks {
        chunks: Vec<Bytes>,
        fail_at: Option<usize>,
    }

    impl Serializer for Chunks {
        fn allow_caching(&self) -> bool {
            false
        }

        fn extension(&self) -> &str {
            "bin"
        }

        fn next_chunk(&mut self) -> Result<Option<Bytes>, SerializerError> {
            if self.fail_at == Some(self.chunks.len()) {
                return Err(SerializerError::InvalidParameter {
                    name: "chunk".to_string(),
                    reason: "broken".to_string(),
                });
            }
            Ok(self.chunks.pop())
        }
    }

    struct Lines(Vec<Bytes>);

    impl MessagingSerializer for Lines {
        fn next_message(&mut self) -> Result<Option<Bytes>, SerializerError> {
            Ok(self.0.pop())
        }
    }

    fn handle(chunks: &[&'static str], fail_at: Option<usize>) -> (OutputHandle, Completion) {
        let completion = Completion::default();
        let chunks = chunks.iter().rev().map(|c| Bytes::from_static(c.as_bytes())).collect();
        let source = Source::Direct(Box::new(Chunks { chunks, fail_at }));
        let handle = OutputHandle::new(Some("model".to_string()), source, CompletionGuard::new(completion.clone()));
        (handle, completion)
    }

    #[tokio::test]
    async fn test_finishes_only_after_drain() {
        let (mut output, completion) = handle(&["a", "b"], None);
        assert_eq!(output.kind(), DeliveryKind::Direct);

        assert_eq!(output.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(output.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        assert_eq!(completion.state(), ActionState::Pending);

        assert!(output.next_chunk().await.unwrap().is_none());
        assert!(output.is_drained());
        assert_eq!(output.produced(), 2);
        assert_eq!(completion.state(), ActionState::Finished);

        // Not restartable
        assert!(output.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_production_error_fails_request() {
        let (output, completion) = handle(&["a", "b"], Some(1));

        let err = output.read_to_end().await.unwrap_err();
        assert!(matches!(err, CheckoutError::Serializer(_)));
        assert!(matches!(completion.state(), ActionState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_write_to_and_stream() {
        let (output, completion) = handle(&["hello ", "world"], None);
        let mut sink = Vec::new();
        assert_eq!(output.write_to(&mut sink).await.unwrap(), 11);
        assert_eq!(sink, b"hello world");
        assert!(completion.state().is_finished());

        let (output, completion) = handle(&["1", "2"], None);
        let chunks: Vec<_> = output.into_stream().collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(completion.state().is_finished());
    }

    #[tokio::test]
    async fn test_result_accessors() {
        let (output, completion) = handle(&["x"], None);
        let mut result = CheckoutResult::new(SerializerId(7), completion.clone())
            .with_model("site", 3)
            .with_output(output);

        assert!(result.has_output());
        assert_eq!(result.revision_number, Some(3));
        assert!(result.take_messaging_stream().is_none());
        assert!(result.take_output().is_some());
        assert!(!result.has_output());

        // The taken handle was dropped undrained
        assert!(matches!(completion.state(), ActionState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_write_to_counts_message_separators() {
        let completion = Completion::default();
        let messages = Lines(vec![Bytes::from_static(b"c"), Bytes::from_static(b"ab")]);
        let output = OutputHandle::new(None, Source::Messages(Box::new(messages)), CompletionGuard::new(completion.clone()));
        assert_eq!(output.kind(), DeliveryKind::Messages);

        let mut sink = Vec::new();
        let written = output.write_to(&mut sink).await.unwrap();
        assert_eq!(sink, b"ab\nc\n");
        assert_eq!(written, sink.len() as u64);
        assert!(completion.state().is_finished());
    }

    #[tokio::test]
    async fn test_resume_skips_delivered_prefix() {
        // Skip ends inside the second chunk
        let chunks = vec![Bytes::from_static(b"ef"), Bytes::from_static(b"cd"), Bytes::from_static(b"ab")];
        let mut source = Source::Resume {
            serializer: Box::new(Chunks { chunks, fail_at: None }),
            skip: 3,
        };
        assert_eq!(source.kind(), DeliveryKind::Direct);

        let mut out = Vec::new();
        while let Some(chunk) = source.next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"def");
    }
}
