//! Core orchestration logic.
//!
//! This module contains:
//! - Executor: Phase 1, run and commit the caller's action
//! - Selector: Phase 2, resolve the serializer configuration
//! - Coordinator: Cache-aware delivery planning
//! - Output: Pull-based output handles and result records
//! - Completion: Exactly-once request settlement
//! - Orchestrator: Main entry point tying the phases together

pub mod completion;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod output;
pub mod selector;

// Re-export commonly used types
pub use completion::{Completion, CompletionGuard};
pub use error::CheckoutError;
pub use executor::Handoff;
pub use orchestrator::{CheckoutOrchestrator, CheckoutRequest};
pub use output::{CheckoutResult, DeliveryKind, OutputHandle};
pub use selector::SerializerSelection;
