// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The three algorithm kernels that exercise `swarmpi-comm`'s contracts
//! end-to-end: primality testing, dense matrix multiply, and a generic
//! Monte Carlo estimator.

pub mod error;
pub mod matmul;
pub mod montecarlo;
pub mod primality;

pub use error::KernelError;
pub use matmul::{matmul_distributed, MatMulInput, MatMulResult};
pub use montecarlo::{monte_carlo_distributed, MonteCarloConfig, MonteCarloReducer, MonteCarloResult};
pub use primality::is_prime_distributed;
