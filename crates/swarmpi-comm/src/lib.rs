// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod cancel;
pub mod communicator;
pub mod error;
pub mod link;
pub mod local;

pub use cancel::CancellationFlag;
pub use communicator::{ClusterCommunicator, Communicator, ReduceOp};
pub use error::CommError;
pub use link::{Link, LinkState};
pub use local::LocalCommunicator;
