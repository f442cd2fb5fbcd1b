// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use swarmpi_wire::{Payload, Rank};

use crate::cancel::CancellationFlag;
use crate::communicator::{Communicator, ReduceOp};
use crate::error::CommError;

/// `size = 1` in-process communicator. `send`/`recv` always fail with
/// `no_peer`; collectives degenerate to identity since the single rank is
/// simultaneously root and only member. Used so kernel code runs unmodified
/// in unit tests with no cluster configured.
pub struct LocalCommunicator {
    cancel: CancellationFlag,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self { cancel: CancellationFlag::new() }
    }
}

impl Default for LocalCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn size(&self) -> u32 {
        1
    }

    fn rank(&self) -> Rank {
        0
    }

    fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    async fn send(&self, _to: Rank, _payload: Payload) -> Result<(), CommError> {
        Err(CommError::NoPeer)
    }

    async fn recv(&self, _from: Rank) -> Result<Payload, CommError> {
        Err(CommError::NoPeer)
    }

    async fn bcast(&self, _root: Rank, value: Option<Payload>) -> Result<Payload, CommError> {
        value.ok_or_else(|| CommError::ProtocolViolation("bcast root must supply a value".into()))
    }

    async fn scatter(&self, _root: Rank, chunks: Option<Vec<Payload>>) -> Result<Payload, CommError> {
        let mut chunks = chunks
            .ok_or_else(|| CommError::ProtocolViolation("scatter root must supply chunks".into()))?;
        if chunks.len() != 1 {
            return Err(CommError::CollectiveMismatch(format!(
                "scatter expected 1 chunk, got {}",
                chunks.len()
            )));
        }
        Ok(chunks.remove(0))
    }

    async fn gather(&self, _root: Rank, value: Payload) -> Result<Option<Vec<Payload>>, CommError> {
        Ok(Some(vec![value]))
    }

    async fn reduce(&self, _root: Rank, value: Payload, _op: ReduceOp) -> Result<Option<Payload>, CommError> {
        Ok(Some(value))
    }

    async fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }

    async fn request_cancellation(&self) -> Result<(), CommError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmpi_wire::ScalarValue;

    #[tokio::test]
    async fn send_and_recv_fail_with_no_peer() {
        let comm = LocalCommunicator::new();
        assert!(matches!(
            comm.send(0, Payload::Scalar(ScalarValue::I64(1))).await,
            Err(CommError::NoPeer)
        ));
        assert!(matches!(comm.recv(0).await, Err(CommError::NoPeer)));
    }

    #[tokio::test]
    async fn collectives_degenerate_to_identity() {
        let comm = LocalCommunicator::new();
        let v = Payload::Scalar(ScalarValue::F64(3.5));
        let bcast = comm.bcast(0, Some(v.clone())).await.unwrap();
        assert_eq!(bcast, v);
        let gathered = comm.gather(0, v.clone()).await.unwrap().unwrap();
        assert_eq!(gathered, vec![v.clone()]);
        comm.barrier().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_remains_observable() {
        let comm = LocalCommunicator::new();
        assert!(!comm.cancellation().is_cancelled());
        comm.cancellation().cancel();
        assert!(comm.cancellation().is_cancelled());
    }
}
