//! Cooperative cancellation.
//!
//! The first stop request asks the engine to wind down gracefully at the
//! next checkpoint; a second request marks the stop as forced so callers
//! can skip cleanup that needs a live session.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{info, warn};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    requests: AtomicU32,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                requests: AtomicU32::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn request_stop(&self) {
        let prior = self.inner.requests.fetch_add(1, Ordering::SeqCst);
        match prior {
            0 => info!("Stop requested, finishing current step"),
            _ => warn!("Stop requested again, treating as forced"),
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.requests.load(Ordering::SeqCst) > 0
    }

    pub fn is_forced(&self) -> bool {
        self.inner.requests.load(Ordering::SeqCst) > 1
    }

    /// Resolve once cancellation has been requested. Completes immediately
    /// if it already was.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Route Ctrl-C presses into this token for the life of the process.
    pub fn listen_for_ctrl_c(&self) {
        let token = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                token.request_stop();
            }
        });
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_after_request() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        token.request_stop();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("waiter should resolve")
            .unwrap();
        assert!(token.is_cancelled());
        assert!(!token.is_forced());
    }

    #[tokio::test]
    async fn second_request_marks_forced() {
        let token = CancelToken::new();
        token.request_stop();
        token.request_stop();
        assert!(token.is_forced());
    }

    #[tokio::test]
    async fn cancelled_is_immediate_when_already_requested() {
        let token = CancelToken::new();
        token.request_stop();
        token.cancelled().await;
    }
}
