// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::LaunchError;

#[derive(Debug, Clone)]
pub enum JobLockState {
    Idle,
    Running { job_id: String, started_at: Instant },
}

/// Single-entry exclusion lock on the master: at most one job may be
/// `running` at any wall instant (P4). `acquire` is scoped — the returned
/// guard releases the lock back to `idle` on every exit path, including
/// panics, because release happens in `Drop`.
#[derive(Clone)]
pub struct JobLock {
    state: Arc<Mutex<JobLockState>>,
}

impl JobLock {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(JobLockState::Idle)) }
    }

    pub fn acquire(&self, job_id: String) -> Result<JobLockGuard, LaunchError> {
        let mut state = self.state.lock().expect("job lock mutex poisoned");
        match &*state {
            JobLockState::Idle => {
                *state = JobLockState::Running { job_id, started_at: Instant::now() };
                Ok(JobLockGuard { state: self.state.clone() })
            }
            JobLockState::Running { .. } => Err(LaunchError::Busy),
        }
    }

    pub fn current(&self) -> JobLockState {
        self.state.lock().expect("job lock mutex poisoned").clone()
    }
}

impl Default for JobLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct JobLockGuard {
    state: Arc<Mutex<JobLockState>>,
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("job lock mutex poisoned");
        *state = JobLockState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_fails_busy_while_a_job_is_running() {
        let lock = JobLock::new();
        let guard = lock.acquire("job-1".into()).unwrap();
        assert!(matches!(lock.acquire("job-2".into()), Err(LaunchError::Busy)));
        drop(guard);
        assert!(lock.acquire("job-3".into()).is_ok());
    }

    #[test]
    fn release_happens_even_if_guard_is_dropped_via_panic_unwind() {
        let lock = JobLock::new();
        let lock2 = lock.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = lock2.acquire("job-1".into()).unwrap();
            panic!("simulated kernel error mid-job");
        });
        assert!(result.is_err());
        assert!(matches!(lock.current(), JobLockState::Idle));
    }
}
