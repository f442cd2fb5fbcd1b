// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("peer_lost: link to rank {0} is broken")]
    PeerLost(u32),
    #[error("cancelled")]
    Cancelled,
    #[error("no_peer: local fallback communicator has no peers")]
    NoPeer,
    #[error("protocol_violation: {0}")]
    ProtocolViolation(String),
    #[error("collective_mismatch: {0}")]
    CollectiveMismatch(String),
    #[error("invalid_shape: {0}")]
    InvalidShape(String),
    #[error("handshake_failure: {0}")]
    HandshakeFailure(String),
    #[error("bootstrap_timeout")]
    BootstrapTimeout,
    #[error(transparent)]
    Wire(#[from] swarmpi_wire::WireError),
    #[error("internal: {0}")]
    Internal(String),
}
