// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;

use swarmpi_comm::Communicator;
use swarmpi_wire::Payload;

/// Runs one named kernel given a communicator and its argument blob.
/// `swarmpi-launch` depends on this trait, not on `swarmpi-kernels`
/// directly, so the worker bootstrap and launcher stay ignorant of which
/// concrete kernels exist — the binary that wires real kernels in owns
/// that mapping.
#[async_trait]
pub trait KernelDispatch: Send + Sync {
    /// Returns the kernel's result payload (meaningful only on rank 0 in
    /// distributed mode; other ranks may return `Payload::Empty`), or an
    /// error reason string suitable for a `FAIL{reason}` envelope.
    async fn dispatch(
        &self,
        kernel_name: &str,
        kernel_args_blob: &[u8],
        comm: Arc<dyn Communicator>,
    ) -> Result<Payload, String>;
}
