// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::CommError;

/// Process-wide, job-scoped cancellation flag. Monotonic: once set, stays
/// set until a new job re-creates it. Cheap to clone; all clones observe
/// the same underlying flag.
#[derive(Clone)]
pub struct CancellationFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self { flag: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    /// Non-blocking predicate, safe to poll at high frequency.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail-fast check for call sites that want to bail immediately.
    pub fn check(&self) -> Result<(), CommError> {
        if self.is_cancelled() {
            Err(CommError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Resolves once cancellation has been requested. Intended to sit
    /// alongside other branches in a `tokio::select!`.
    pub async fn wait(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_resolves_immediately_if_already_cancelled() {
        let flag = CancellationFlag::new();
        flag.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), flag.wait())
            .await
            .expect("wait() should not block once cancelled");
    }

    #[tokio::test]
    async fn wait_wakes_on_cancel_from_another_task() {
        let flag = CancellationFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        flag.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("waiter task should complete after cancel()")
            .unwrap();
    }

    #[test]
    fn check_returns_cancelled_error_once_set() {
        let flag = CancellationFlag::new();
        assert!(flag.check().is_ok());
        flag.cancel();
        assert!(matches!(flag.check(), Err(CommError::Cancelled)));
    }
}
