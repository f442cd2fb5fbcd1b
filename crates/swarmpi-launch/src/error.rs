// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("invalid_config: {0}")]
    InvalidConfig(String),
    #[error("busy: a job is already running")]
    Busy,
    #[error("bootstrap_timeout: only {got}/{expected} workers dialed back in time")]
    BootstrapTimeout { got: usize, expected: usize },
    #[error("handshake_failure: {0}")]
    HandshakeFailure(String),
    #[error("peer_lost: {0}")]
    PeerLost(String),
    #[error("kernel_error: {0}")]
    KernelError(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Comm(#[from] swarmpi_comm::CommError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("internal: {0}")]
    Internal(String),
}
