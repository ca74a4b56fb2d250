//! Checkout/download orchestrator.
//!
//! A request runs as a two-phase protocol on blocking workers:
//! 1. Phase 1 resolves the revision and commits the caller's action
//! 2. Phase 2 reads the serializer configuration in a new read-only session
//!
//! The orchestrator then picks a delivery strategy and returns a result
//! whose output handle settles the request's completion when drained.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::cache::DiskCacheManager;
use crate::config::{ResolvedConfig, ServerSettings};
use crate::domain::RequestDescriptor;
use crate::plugins::{PluginManager, PluginRegistry};
use crate::serializers::{PluginSerializerFactory, SerializerContext, SerializerFactory};
use crate::store::{CheckoutAction, Database, DatabaseAction, DownloadAction, SqliteDatabase};

use super::completion::{Completion, CompletionGuard};
use super::coordinator;
use super::error::CheckoutError;
use super::executor::{self, Handoff};
use super::output::{CheckoutResult, OutputHandle, Source};
use super::selector::{self, SerializerSelection};

const CANCELLED: &str = "request cancelled before its output was ready";

/// A checkout or download request
pub struct CheckoutRequest {
    pub descriptor: RequestDescriptor,
    pub username: String,

    /// Action committed in phase 1; `None` serves cached output only
    pub action: Option<Arc<dyn DatabaseAction>>,

    completion: Completion,
}

impl CheckoutRequest {
    pub fn new(
        descriptor: RequestDescriptor,
        username: impl Into<String>,
        action: Option<Arc<dyn DatabaseAction>>,
    ) -> Self {
        Self {
            descriptor,
            username: username.into(),
            action,
            completion: Completion::default(),
        }
    }

    /// Load the revision and record the checkout
    pub fn checkout(descriptor: RequestDescriptor, username: impl Into<String>) -> Self {
        let username = username.into();
        let action = CheckoutAction::new(descriptor.revision_id, descriptor.serializer_id, username.clone());
        Self::new(descriptor, username, Some(Arc::new(action)))
    }

    /// Load the revision without writing
    pub fn download(descriptor: RequestDescriptor, username: impl Into<String>) -> Self {
        let action = DownloadAction::new(descriptor.revision_id);
        Self::new(descriptor, username, Some(Arc::new(action)))
    }

    /// Serve previously cached output only
    pub fn replay(descriptor: RequestDescriptor, username: impl Into<String>) -> Self {
        Self::new(descriptor, username, None)
    }

    /// The request's completion signal, settled exactly once
    pub fn completion(&self) -> &Completion {
        &self.completion
    }
}

/// Outcome of a request that did not raise
enum Outcome {
    Delivered(CheckoutResult),
    /// No output could be produced; the request settles as failed
    Degraded { result: CheckoutResult, reason: String },
}

/// Coordinates sessions, serializers and the output cache
pub struct CheckoutOrchestrator {
    database: Arc<dyn Database>,
    plugins: Arc<dyn PluginManager>,
    serializers: Arc<dyn SerializerFactory>,
    cache: Arc<DiskCacheManager>,
    settings: ServerSettings,
}

impl CheckoutOrchestrator {
    pub fn new(
        database: Arc<dyn Database>,
        plugins: Arc<dyn PluginManager>,
        serializers: Arc<dyn SerializerFactory>,
        cache: Arc<DiskCacheManager>,
        settings: ServerSettings,
    ) -> Self {
        Self {
            database,
            plugins,
            serializers,
            cache,
            settings,
        }
    }

    /// SQLite database, built-in plugins and serializers, disk cache
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, CheckoutError> {
        let database = SqliteDatabase::open(&config.database)?;
        let cache = DiskCacheManager::new(&config.cache_dir, config.server.replay_chunk_size)?;

        Ok(Self::new(
            Arc::new(database),
            Arc::new(PluginRegistry::default()),
            Arc::new(PluginSerializerFactory),
            cache,
            config.server.clone(),
        ))
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<DiskCacheManager> {
        &self.cache
    }

    /// Run a request.
    ///
    /// Raises for missing entities and serializer initialization failures.
    /// Other failures return a result without output. Either way the
    /// request's completion reaches a terminal state.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %request.completion.request_id(),
            revision_id = %request.descriptor.revision_id,
            serializer_id = %request.descriptor.serializer_id,
        )
    )]
    pub async fn checkout(&self, request: CheckoutRequest) -> Result<CheckoutResult, CheckoutError> {
        // Settles the request if this future is dropped or unwinds before an
        // output handle takes over
        let pending = CompletionGuard::with_reason(request.completion.clone(), CANCELLED);

        match self.run(request).await {
            Ok(Outcome::Delivered(result)) => {
                if let Some(output) = result.output() {
                    info!(kind = %output.kind(), "Output ready");
                }
                pending.disarm();
                Ok(result)
            }
            Ok(Outcome::Degraded { result, reason }) => {
                warn!(%reason, "Request produced no output");
                pending.fail(reason);
                Ok(result)
            }
            Err(err) => {
                error!(error = %err, "Request failed");
                pending.fail(err.to_string());
                Err(err)
            }
        }
    }

    async fn run(&self, request: CheckoutRequest) -> Result<Outcome, CheckoutError> {
        let CheckoutRequest {
            descriptor,
            username,
            action,
            completion,
        } = request;
        let serializer_id = descriptor.serializer_id;

        let Some(action) = action else {
            let source = coordinator::replay_only(&self.cache, &descriptor).await?;
            let output = OutputHandle::new(None, source, CompletionGuard::new(completion.clone()));
            return Ok(Outcome::Delivered(
                CheckoutResult::new(serializer_id, completion).with_output(output),
            ));
        };

        let database = Arc::clone(&self.database);
        let revision_id = descriptor.revision_id;
        let handoff = blocking(move || executor::execute(database.as_ref(), revision_id, action.as_ref())).await?;
        info!(
            model = %handoff.model.name,
            objects = handoff.model.objects.len(),
            valid = handoff.model.is_valid(),
            "Action committed"
        );

        let database = Arc::clone(&self.database);
        let plugins = Arc::clone(&self.plugins);
        let selection =
            match blocking(move || selector::select(database.as_ref(), plugins.as_ref(), serializer_id)).await {
                Ok(selection) => selection,
                Err(CheckoutError::Store(err)) => {
                    return Ok(Outcome::Degraded {
                        result: CheckoutResult::new(serializer_id, completion),
                        reason: format!("reading serializer configuration failed: {}", err),
                    });
                }
                Err(err) => return Err(err),
            };

        let mut result = CheckoutResult::new(serializer_id, completion.clone());
        if handoff.model.is_valid() {
            result = result.with_model(handoff.project.name.clone(), handoff.model.revision_number);
        }

        match selection {
            SerializerSelection::Missing => Ok(Outcome::Degraded {
                result,
                reason: format!("serializer configuration {} not found", serializer_id),
            }),
            SerializerSelection::Messaging { configuration } => {
                let serializer = self
                    .serializers
                    .create_messaging_serializer(&configuration, &username, Arc::clone(&handoff.model), &descriptor.params)
                    .map_err(|err| CheckoutError::SerializerInit {
                        serializer_id,
                        reason: err.to_string(),
                    })?;

                let output = OutputHandle::new(
                    Some(handoff.model.name.clone()),
                    Source::Messages(serializer),
                    CompletionGuard::new(completion),
                );
                Ok(Outcome::Delivered(result.with_output(output)))
            }
            SerializerSelection::Plain {
                configuration,
                render_engine,
            } => {
                if !handoff.model.is_valid() {
                    return Ok(Outcome::Degraded {
                        result,
                        reason: format!("model of revision {} is invalid", revision_id),
                    });
                }

                let caching = self.settings.cache_output_files && self.serializers.allows_caching(&configuration);
                let Handoff { revision, model, .. } = handoff;
                let name = model.name.clone();
                let context = SerializerContext {
                    revision,
                    username,
                    model,
                    render_engine,
                    params: descriptor.params.clone(),
                };

                let serializers = Arc::clone(&self.serializers);
                let source = coordinator::plan(&self.cache, &descriptor, caching, move || {
                    match serializers.create(&configuration, context) {
                        Ok(Some(serializer)) => Ok(serializer),
                        Ok(None) => Err(CheckoutError::SerializerInit {
                            serializer_id,
                            reason: format!("plugin '{}' is not available", configuration.plugin_class),
                        }),
                        Err(err) => Err(CheckoutError::SerializerInit {
                            serializer_id,
                            reason: err.to_string(),
                        }),
                    }
                })
                .await?;

                let output = OutputHandle::new(Some(name), source, CompletionGuard::new(completion));
                Ok(Outcome::Delivered(result.with_output(output)))
            }
        }
    }
}

/// Run a session phase on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, CheckoutError>
where
    F: FnOnce() -> Result<T, CheckoutError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| CheckoutError::Worker(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ActionState, NewObject, NewPluginConfiguration, RevisionId, SerializerId};
    use crate::store::MemoryDatabase;
    use tempfile::TempDir;

    fn orchestrator(db: &MemoryDatabase, temp: &TempDir) -> CheckoutOrchestrator {
        CheckoutOrchestrator::new(
            Arc::new(db.clone()),
            Arc::new(PluginRegistry::default()),
            Arc::new(PluginSerializerFactory),
            DiskCacheManager::new(temp.path(), 1024).unwrap(),
            ServerSettings::default(),
        )
    }

    fn seed() -> (MemoryDatabase, RevisionId) {
        let db = MemoryDatabase::new();
        let project = db.add_project("site");
        let revision = db.add_revision(
            project.id,
            vec![NewObject {
                type_name: "Wall".to_string(),
                attributes: Default::default(),
            }],
        );
        db.add_plugin_configuration(NewPluginConfiguration::serializer("JSON", "json").into_configuration(SerializerId(7)));
        (db, revision.id)
    }

    #[tokio::test]
    async fn test_checkout_populates_then_finishes() {
        let temp = TempDir::new().unwrap();
        let (db, revision_id) = seed();
        let orchestrator = orchestrator(&db, &temp);

        let request = CheckoutRequest::checkout(RequestDescriptor::new(revision_id, SerializerId(7)), "alice");
        let completion = request.completion().clone();
        let mut result = orchestrator.checkout(request).await.unwrap();

        assert_eq!(result.project_name.as_deref(), Some("site"));
        assert_eq!(result.revision_number, Some(1));
        assert_eq!(db.checkouts().len(), 1);
        assert_eq!(completion.state(), ActionState::Pending);

        let bytes = result.take_output().unwrap().read_to_end().await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(completion.state(), ActionState::Finished);
        assert_eq!(db.sessions_open(), 0);
    }

    #[tokio::test]
    async fn test_missing_serializer_degrades() {
        let temp = TempDir::new().unwrap();
        let (db, revision_id) = seed();
        let orchestrator = orchestrator(&db, &temp);

        let request = CheckoutRequest::download(RequestDescriptor::new(revision_id, SerializerId(99)), "alice");
        let result = orchestrator.checkout(request).await.unwrap();

        assert!(!result.has_output());
        assert!(matches!(result.completion().state(), ActionState::Failed { .. }));
    }
}
