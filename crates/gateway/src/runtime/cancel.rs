//! Per-job cancellation tokens.
//!
//! Every running job registers a token here. Cancelling a job signals its
//! executor loop to stop issuing changes and proceed to rollback; the token
//! is checked at every suspension boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

/// A cancellation token checked by the executor between operations.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Tracks active cancellation tokens per job id.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a job starting to run.
    pub fn register(&self, job_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(job_id, token.clone());
        token
    }

    /// Signal cancellation. Returns true if the job was running.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        if let Some(token) = self.tokens.lock().get(&job_id) {
            token.cancel();
            return true;
        }
        false
    }

    /// Remove the token when a job reaches a terminal state.
    pub fn remove(&self, job_id: Uuid) {
        self.tokens.lock().remove(&job_id);
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn map_register_cancel_remove() {
        let map = CancelMap::new();
        let job = Uuid::new_v4();
        let token = map.register(job);

        assert!(map.is_running(job));
        assert!(map.cancel(job));
        assert!(token.is_cancelled());

        map.remove(job);
        assert!(!map.is_running(job));
        assert!(!map.cancel(job));
    }

    #[test]
    fn cancel_unknown_job_is_false() {
        let map = CancelMap::new();
        assert!(!map.cancel(Uuid::new_v4()));
    }
}
