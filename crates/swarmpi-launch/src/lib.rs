// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod cancel_socket;
pub mod dispatch;
pub mod error;
pub mod joblock;
pub mod launcher;
pub mod worker;

pub use cancel_socket::trigger_cancel;
pub use dispatch::KernelDispatch;
pub use error::LaunchError;
pub use joblock::{JobLock, JobLockGuard, JobLockState};
pub use launcher::{launch, LaunchSettings, RunningJob};
pub use worker::{run_worker, WorkerBootstrapArgs};
