// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Maps a job descriptor's `kernel_name` to one of the three kernels in
//! `swarmpi-kernels`, for use by a worker's bootstrap dispatch loop (C7).
//!
//! A worker never holds the kernel's real inputs (§9 Q3): `prime` and
//! `montecarlo` carry their scalar configuration in `kernel_args_blob`
//! (identical across every rank, matching the job descriptor invariant);
//! `matmul` carries nothing because only rank 0 ever has `A`/`B` — rank 0
//! calls `matmul_distributed` directly with its own data instead of going
//! through this dispatch table (see `main.rs::run_kernel`).

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use swarmpi_comm::Communicator;
use swarmpi_kernels::{
    is_prime_distributed, matmul_distributed, monte_carlo_distributed, KernelError, MonteCarloConfig, MonteCarloReducer,
};
use swarmpi_launch::KernelDispatch;
use swarmpi_wire::Payload;

pub const KERNEL_PRIME: &str = "prime";
pub const KERNEL_MATMUL: &str = "matmul";
pub const KERNEL_MONTECARLO: &str = "montecarlo";

pub struct SwarmKernelDispatch;

fn render_err(err: KernelError) -> String {
    err.as_reason()
}

#[async_trait]
impl KernelDispatch for SwarmKernelDispatch {
    async fn dispatch(
        &self,
        kernel_name: &str,
        kernel_args_blob: &[u8],
        comm: Arc<dyn Communicator>,
    ) -> Result<Payload, String> {
        match kernel_name {
            KERNEL_PRIME => {
                let n: u64 = serde_json::from_slice(kernel_args_blob)
                    .map_err(|e| format!("protocol_violation: malformed prime args: {e}"))?;
                is_prime_distributed(n, comm.as_ref())
                    .await
                    .map(|_| Payload::Empty)
                    .map_err(render_err)
            }
            KERNEL_MATMUL => matmul_distributed(None, comm.as_ref())
                .await
                .map(|_| Payload::Empty)
                .map_err(render_err),
            KERNEL_MONTECARLO => {
                let cfg: MonteCarloConfig = serde_json::from_slice(kernel_args_blob)
                    .map_err(|e| format!("protocol_violation: malformed montecarlo args: {e}"))?;
                let reducer = MonteCarloReducer::default_stats();
                monte_carlo_distributed(cfg, |rng| rng.gen::<f64>(), |x| x, &reducer, comm.as_ref())
                    .await
                    .map(|_| Payload::Empty)
                    .map_err(render_err)
            }
            other => Err(format!("protocol_violation: unknown kernel '{other}'")),
        }
    }
}
