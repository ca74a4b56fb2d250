//! Chooses between replay, follow, populate and direct delivery.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{Claim, DiskCacheManager};
use crate::domain::RequestDescriptor;
use crate::serializers::Serializer;

use super::error::CheckoutError;
use super::output::Source;

/// Plan delivery for a plain serializer.
///
/// `build` is only called when bytes must actually be produced, so a
/// replayed entry never constructs a serializer. A follower keeps `build`
/// and uses it only if the population it follows is abandoned. A failed
/// `build` drops the claimed writer, rolling the entry back to absent.
pub(crate) async fn plan<F>(
    cache: &Arc<DiskCacheManager>,
    descriptor: &RequestDescriptor,
    caching: bool,
    build: F,
) -> Result<Source, CheckoutError>
where
    F: FnOnce() -> Result<Box<dyn Serializer>, CheckoutError> + Send + 'static,
{
    if !caching {
        debug!("Caching not applicable, streaming directly");
        return Ok(Source::Direct(build()?));
    }

    let cache_key = descriptor.cache_key();
    match cache.claim(descriptor).await? {
        Claim::Replay => match cache.open(descriptor).await? {
            Some(artifact) => {
                info!(%cache_key, bytes = artifact.meta().size_bytes, "Replaying cached output");
                Ok(Source::Replay(artifact))
            }
            // Removed from outside the process between claim and open
            None => Ok(Source::Direct(build()?)),
        },
        Claim::Follow(reader) => {
            info!(%cache_key, "Following in-flight cache population");
            Ok(Source::Follow {
                reader,
                fallback: Some(Box::new(build)),
            })
        }
        Claim::Populate(writer) => {
            let serializer = build()?;
            if !serializer.allow_caching() {
                writer.abort("serializer declined caching");
                return Ok(Source::Direct(serializer));
            }
            info!(%cache_key, "Populating cache while streaming");
            Ok(Source::Populate {
                serializer,
                writer: Some(writer),
            })
        }
    }
}

/// Serve a descriptor from the cache alone, with no serializer available
pub(crate) async fn replay_only(
    cache: &Arc<DiskCacheManager>,
    descriptor: &RequestDescriptor,
) -> Result<Source, CheckoutError> {
    if let Some(artifact) = cache.open(descriptor).await? {
        return Ok(Source::Replay(artifact));
    }
    if let Some(reader) = cache.follow(descriptor) {
        return Ok(Source::Follow { reader, fallback: None });
    }

    Err(CheckoutError::NotFound {
        kind: "cached output",
        id: descriptor.cache_key(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RevisionId, SerializerId};
    use crate::serializers::SerializerError;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct Fixed {
        remaining: Option<Bytes>,
        cacheable: bool,
    }

    impl Serializer for Fixed {
        fn allow_caching(&self) -> bool {
            self.cacheable
        }

        fn extension(&self) -> &str {
            "txt"
        }

        fn next_chunk(&mut self) -> Result<Option<Bytes>, SerializerError> {
            Ok(self.remaining.take())
        }
    }

    fn builder(
        builds: &Arc<AtomicUsize>,
        cacheable: bool,
    ) -> impl FnOnce() -> Result<Box<dyn Serializer>, CheckoutError> + Send + 'static {
        let builds = Arc::clone(builds);
        move || -> Result<Box<dyn Serializer>, CheckoutError> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Fixed {
                remaining: Some(Bytes::from_static(b"payload")),
                cacheable,
            }))
        }
    }

    fn kind(source: &Source) -> &'static str {
        match source {
            Source::Replay(_) => "replay",
            Source::Follow { .. } => "follow",
            Source::Populate { .. } => "populate",
            Source::Direct(_) | Source::Resume { .. } => "direct",
            Source::Messages(_) => "messages",
        }
    }

    async fn drain(mut source: Source) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = source.next().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn test_populate_then_replay_without_building() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCacheManager::new(temp.path(), 1024).unwrap();
        let descriptor = RequestDescriptor::new(RevisionId(42), SerializerId(7));
        let builds = Arc::new(AtomicUsize::new(0));

        let first = plan(&cache, &descriptor, true, builder(&builds, true)).await.unwrap();
        assert_eq!(kind(&first), "populate");
        assert_eq!(drain(first).await, b"payload");

        let second = plan(&cache, &descriptor, true, builder(&builds, true)).await.unwrap();
        assert_eq!(kind(&second), "replay");
        assert_eq!(drain(second).await, b"payload");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_serializer_leaves_no_entry() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCacheManager::new(temp.path(), 1024).unwrap();
        let descriptor = RequestDescriptor::new(RevisionId(42), SerializerId(7));
        let builds = Arc::new(AtomicUsize::new(0));

        let source = plan(&cache, &descriptor, true, builder(&builds, false)).await.unwrap();
        assert_eq!(kind(&source), "direct");
        drain(source).await;
        assert!(!cache.contains(&descriptor).unwrap());

        let source = plan(&cache, &descriptor, false, builder(&builds, true)).await.unwrap();
        assert_eq!(kind(&source), "direct");
        drain(source).await;
        assert!(!cache.contains(&descriptor).unwrap());
    }

    #[tokio::test]
    async fn test_build_failure_rolls_back_claim() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCacheManager::new(temp.path(), 1024).unwrap();
        let descriptor = RequestDescriptor::new(RevisionId(42), SerializerId(7));

        let result = plan(&cache, &descriptor, true, || {
            Err(CheckoutError::SerializerInit {
                serializer_id: SerializerId(7),
                reason: "bad params".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(CheckoutError::SerializerInit { .. })));

        // Entry is absent again, not stuck in populating
        assert!(cache.follow(&descriptor).is_none());
        assert!(matches!(cache.claim(&descriptor).await.unwrap(), Claim::Populate(_)));
    }

    #[tokio::test]
    async fn test_replay_only() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCacheManager::new(temp.path(), 1024).unwrap();
        let descriptor = RequestDescriptor::new(RevisionId(42), SerializerId(7));

        let err = replay_only(&cache, &descriptor).await.err().unwrap();
        assert!(matches!(err, CheckoutError::NotFound { kind: "cached output", .. }));

        let builds = Arc::new(AtomicUsize::new(0));
        drain(plan(&cache, &descriptor, true, builder(&builds, true)).await.unwrap()).await;

        let source = replay_only(&cache, &descriptor).await.unwrap();
        assert_eq!(kind(&source), "replay");
        assert_eq!(drain(source).await, b"payload");
    }

    #[tokio::test]
    async fn test_follower_takes_over_abandoned_population() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCacheManager::new(temp.path(), 1024).unwrap();
        let descriptor = RequestDescriptor::new(RevisionId(42), SerializerId(7));
        let builds = Arc::new(AtomicUsize::new(0));

        let Claim::Populate(mut writer) = cache.claim(&descriptor).await.unwrap() else {
            panic!("expected to populate");
        };
        let mut follower = plan(&cache, &descriptor, true, builder(&builds, true)).await.unwrap();
        assert_eq!(kind(&follower), "follow");

        writer.write(Bytes::from_static(b"pay")).await.unwrap();
        assert_eq!(follower.next().await.unwrap().unwrap(), Bytes::from_static(b"pay"));
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        drop(writer);
        assert_eq!(drain(follower).await, b"load");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
