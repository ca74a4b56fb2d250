//! modelout - Checkout and download orchestrator for versioned models
//!
//! Serves a stored model revision to a client through a configured
//! serializer, optionally recording a checkout and caching the produced
//! bytes so identical requests can be replayed without re-serializing.
//!
//! # Architecture
//!
//! A request runs in two database phases on blocking workers:
//! - Phase 1 executes the caller's action (checkout or download) and
//!   commits it, yielding the revision's model
//! - Phase 2 reads the serializer configuration in a fresh read-only session
//!
//! Output is then delivered by one of four strategies: replay from the
//! disk cache, follow an in-flight population, populate while streaming,
//! or stream directly. Draining the output settles the request's
//! completion exactly once.
//!
//! # Modules
//!
//! - `cache`: Disk cache of serialized output
//! - `core`: Orchestration logic (Executor, Selector, Coordinator, Output)
//! - `domain`: Data structures (Revision, Model, PluginConfiguration)
//! - `plugins`: Render engine registry
//! - `serializers`: Built-in serializers and the serializer factory
//! - `store`: Database sessions (SQLite and in-memory)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! modelout init
//! modelout import --project site objects.json
//! modelout checkout 1 --serializer 1 --output site.json
//! modelout replay 1 --serializer 1
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod plugins;
pub mod serializers;
pub mod store;

// Re-export main types at crate root for convenience
pub use cache::DiskCacheManager;
pub use core::{CheckoutError, CheckoutOrchestrator, CheckoutRequest, CheckoutResult, Completion, DeliveryKind, OutputHandle};
pub use domain::{ActionState, RequestDescriptor, RevisionId, SerializerId};
