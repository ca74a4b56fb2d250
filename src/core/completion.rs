//! Exactly-once completion signal for a single request.
//!
//! A request starts `Pending` and settles once, to `Finished` or `Failed`.
//! Later settle attempts are ignored. Observers can poll `state()`, await
//! `wait()`, subscribe to the watch channel, or register `on_finished`
//! callbacks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::ActionState;

type Callback = Box<dyn FnOnce(&ActionState) + Send>;

struct Inner {
    request_id: Uuid,
    settled: AtomicBool,
    state: watch::Sender<ActionState>,
    callbacks: Mutex<Vec<Callback>>,
}

/// Shared handle on a request's terminal state
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("request_id", &self.inner.request_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

impl Completion {
    pub fn new(request_id: Uuid) -> Self {
        let (state, _) = watch::channel(ActionState::Pending);
        Self {
            inner: Arc::new(Inner {
                request_id,
                settled: AtomicBool::new(false),
                state,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.inner.request_id
    }

    pub fn state(&self) -> ActionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<ActionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the request settles
    pub async fn wait(&self) -> ActionState {
        let mut receiver = self.subscribe();
        let state = match receiver.wait_for(ActionState::is_terminal).await {
            Ok(state) => state.clone(),
            // The sender lives as long as `self`
            Err(_) => self.state(),
        };
        state
    }

    fn callbacks(&self) -> MutexGuard<'_, Vec<Callback>> {
        self.inner.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `callback` once the request settles, or now if it already has
    pub fn on_finished<F>(&self, callback: F)
    where
        F: FnOnce(&ActionState) + Send + 'static,
    {
        let mut callbacks = self.callbacks();
        if self.is_settled() {
            drop(callbacks);
            callback(&self.state());
        } else {
            callbacks.push(Box::new(callback));
        }
    }

    /// Settle as finished. Returns false if already settled.
    pub fn finish(&self) -> bool {
        self.settle(ActionState::Finished)
    }

    /// Settle as failed. Returns false if already settled.
    pub fn fail(&self, error: impl Into<String>) -> bool {
        self.settle(ActionState::Failed { error: error.into() })
    }

    fn settle(&self, state: ActionState) -> bool {
        let callbacks = {
            let mut callbacks = self.callbacks();
            if self
                .inner
                .settled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            self.inner.state.send_replace(state.clone());
            std::mem::take(&mut *callbacks)
        };

        debug!(request_id = %self.inner.request_id, ?state, "Request settled");
        for callback in callbacks {
            callback(&state);
        }
        true
    }
}

const DEFAULT_ABANDON_REASON: &str = "output stream dropped before it was fully drained";

/// Fails the request on drop unless settled explicitly
#[derive(Debug)]
pub struct CompletionGuard {
    completion: Option<Completion>,
    abandon_reason: &'static str,
}

impl CompletionGuard {
    pub fn new(completion: Completion) -> Self {
        Self::with_reason(completion, DEFAULT_ABANDON_REASON)
    }

    /// Guard that fails with `abandon_reason` when dropped unsettled
    pub fn with_reason(completion: Completion, abandon_reason: &'static str) -> Self {
        Self {
            completion: Some(completion),
            abandon_reason,
        }
    }

    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    pub fn finish(mut self) {
        if let Some(completion) = self.completion.take() {
            completion.finish();
        }
    }

    pub fn fail(mut self, error: impl Into<String>) {
        if let Some(completion) = self.completion.take() {
            completion.fail(error);
        }
    }

    /// Give up responsibility without settling; another guard owns it now
    pub fn disarm(mut self) -> Option<Completion> {
        self.completion.take()
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            if completion.fail(self.abandon_reason) {
                warn!(request_id = %completion.request_id(), reason = self.abandon_reason, "Request abandoned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_settles_exactly_once() {
        let completion = Completion::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        completion.on_finished(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(completion.finish());
        assert!(!completion.finish());
        assert!(!completion.fail("too late"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(completion.state(), ActionState::Finished);
    }

    #[test]
    fn test_late_callback_runs_immediately() {
        let completion = Completion::default();
        completion.fail("boom");

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        completion.on_finished(move |state| {
            *slot.lock().unwrap() = Some(state.clone());
        });

        assert_eq!(
            *seen.lock().unwrap(),
            Some(ActionState::Failed {
                error: "boom".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_wait_resolves_on_settle() {
        let completion = Completion::default();
        let waiter = {
            let completion = completion.clone();
            tokio::spawn(async move { completion.wait().await })
        };

        tokio::task::yield_now().await;
        assert_eq!(completion.state(), ActionState::Pending);
        completion.finish();

        assert_eq!(waiter.await.unwrap(), ActionState::Finished);
        // Already settled
        assert_eq!(completion.wait().await, ActionState::Finished);
    }

    #[test]
    fn test_guard_fails_on_drop() {
        let completion = Completion::default();
        drop(CompletionGuard::new(completion.clone()));

        assert!(matches!(completion.state(), ActionState::Failed { error } if error.contains("dropped")));
    }

    #[test]
    fn test_disarmed_guard_leaves_request_pending() {
        let completion = Completion::default();
        let guard = CompletionGuard::with_reason(completion.clone(), "cancelled");

        assert!(guard.disarm().is_some());
        assert_eq!(completion.state(), ActionState::Pending);

        drop(CompletionGuard::with_reason(completion.clone(), "cancelled"));
        assert_eq!(
            completion.state(),
            ActionState::Failed {
                error: "cancelled".to_string()
            }
        );
    }

    #[test]
    fn test_guard_finish() {
        let completion = Completion::default();
        let guard = CompletionGuard::new(completion.clone());
        assert!(guard.completion().is_some());

        guard.finish();
        assert!(completion.state().is_finished());
    }
}
