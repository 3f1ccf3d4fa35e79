//! Outstanding request bookkeeping
//!
//! Each broker request gets a [`RequestId`] that stays inside this process.
//! The `handle_token` on the bus is generated by ashpd per request. A
//! response is only acted on if its id is still registered. Cancelling a
//! session clears the table, so a late response for a cancelled request is
//! recognised and dropped instead of advancing the flow.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Correlates one outstanding broker request with its response
///
/// Ids come from a process-wide counter and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocate a fresh id
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Set of ids whose responses are still expected
#[derive(Debug, Default)]
pub struct PendingRequests {
    ids: Mutex<HashSet<RequestId>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request about to be sent
    pub async fn register(&self, id: RequestId) {
        self.ids.lock().await.insert(id);
    }

    /// Consume a response
    ///
    /// Returns `false` when the id was never registered or was cancelled,
    /// in which case the caller must discard the response.
    pub async fn complete(&self, id: RequestId) -> bool {
        let known = self.ids.lock().await.remove(&id);
        if !known {
            debug!("Dropping response for stale request {}", id);
        }
        known
    }

    /// Invalidate every outstanding request, returning how many were dropped
    pub async fn cancel_all(&self) -> usize {
        let mut ids = self.ids.lock().await;
        let count = ids.len();
        ids.clear();
        count
    }

    /// Number of requests still waiting for a response
    pub async fn len(&self) -> usize {
        self.ids.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ids.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_never_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(RequestId::next()));
        }
    }

    #[test]
    fn test_ids_increase() {
        let first = RequestId::next();
        let second = RequestId::next();
        assert!(second.get() > first.get());
    }

    #[tokio::test]
    async fn test_complete_registered() {
        let pending = PendingRequests::new();
        let id = RequestId::next();

        pending.register(id).await;
        assert_eq!(pending.len().await, 1);
        assert!(pending.complete(id).await);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_response_completes_once() {
        let pending = PendingRequests::new();
        let id = RequestId::next();

        pending.register(id).await;
        assert!(pending.complete(id).await);
        assert!(!pending.complete(id).await);
    }

    #[tokio::test]
    async fn test_cancelled_response_dropped() {
        let pending = PendingRequests::new();
        let first = RequestId::next();
        let second = RequestId::next();

        pending.register(first).await;
        pending.register(second).await;
        assert_eq!(pending.cancel_all().await, 2);

        assert!(!pending.complete(first).await);
        assert!(!pending.complete(second).await);
    }
}
