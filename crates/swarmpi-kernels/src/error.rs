// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid_shape: {0}")]
    InvalidShape(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Comm(#[from] swarmpi_comm::CommError),
    #[error("kernel_error: {0}")]
    Internal(String),
}

impl KernelError {
    /// Rendered for a `FAIL{reason}` envelope.
    pub fn as_reason(&self) -> String {
        self.to_string()
    }
}
