// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use swarmpi_wire::{read_envelope, write_envelope, Envelope, Rank};

use crate::error::CommError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Draining,
    Closed,
    Broken,
}

/// One reliable, ordered, full-duplex stream to a single peer. Owns a writer
/// task (drains an outbound queue, single writer so writes never interleave)
/// and a reader task (parses frames and forwards them to whatever dispatcher
/// the owning communicator wired up). The two tasks outlive this handle;
/// dropping the handle only drops the sending side of the outbound queue,
/// which drains and then ends the writer task.
pub struct Link {
    peer: Rank,
    outbound_tx: mpsc::Sender<Envelope>,
    state_rx: watch::Receiver<LinkState>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl Link {
    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Hands out a clone of the state watch so callers (the owning
    /// communicator's peer-lost monitor) can react to `Broken` without
    /// taking `self` away from the sender side.
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), CommError> {
        if self.state() == LinkState::Broken {
            return Err(CommError::PeerLost(self.peer));
        }
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| CommError::PeerLost(self.peer))
    }

    /// Waits until the link's state changes away from `Open`/`Connecting`,
    /// i.e. until it is draining, closed, or broken.
    pub async fn wait_until_finished(&mut self) -> LinkState {
        loop {
            let state = *self.state_rx.borrow();
            if !matches!(state, LinkState::Connecting | LinkState::Open) {
                return state;
            }
            if self.state_rx.changed().await.is_err() {
                return LinkState::Broken;
            }
        }
    }

    pub async fn close(mut self) {
        drop(self.outbound_tx.clone());
        if let Some(task) = self.writer_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Splits a TCP socket into its reader/writer tasks. The reader forwards
/// every parsed envelope to `inbound_tx`; the writer drains envelopes
/// enqueued via the returned [`Link`]. `outbound_capacity` bounds the
/// per-link send queue (backpressure point for `send`).
pub fn spawn_tcp_link(
    peer: Rank,
    stream: TcpStream,
    inbound_tx: mpsc::Sender<Envelope>,
    outbound_capacity: usize,
) -> Link {
    stream.set_nodelay(true).ok();
    let (read_half, write_half) = stream.into_split();
    spawn_link(peer, read_half, write_half, inbound_tx, outbound_capacity)
}

fn spawn_link<R, W>(
    peer: Rank,
    mut reader: R,
    mut writer: W,
    inbound_tx: mpsc::Sender<Envelope>,
    outbound_capacity: usize,
) -> Link
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(outbound_capacity);
    let (state_tx, state_rx) = watch::channel(LinkState::Open);

    let writer_state_tx = state_tx.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if let Err(err) = write_envelope(&mut writer, &envelope).await {
                tracing::warn!(rank = peer, error = %err, "link writer failed, marking broken");
                writer_state_tx.send_replace(LinkState::Broken);
                return;
            }
        }
        writer_state_tx.send_replace(LinkState::Closed);
    });

    let reader_state_tx = state_tx;
    let reader_task = tokio::spawn(async move {
        loop {
            match read_envelope(&mut reader).await {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).await.is_err() {
                        return;
                    }
                }
                Err(swarmpi_wire::WireError::ConnectionClosed) => {
                    reader_state_tx.send_replace(LinkState::Closed);
                    return;
                }
                Err(err) => {
                    tracing::warn!(rank = peer, error = %err, "link reader failed, marking broken");
                    reader_state_tx.send_replace(LinkState::Broken);
                    return;
                }
            }
        }
    });

    Link {
        peer,
        outbound_tx,
        state_rx,
        reader_task: Some(reader_task),
        writer_task: Some(writer_task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmpi_wire::{EnvelopeKind, Payload};
    use tokio::io::duplex;

    #[tokio::test]
    async fn send_then_dispatches_through_inbound_channel() {
        let (client, server) = duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let client_link = spawn_link(1, client_r, client_w, mpsc::channel(8).0, 8);
        let _server_link = spawn_link(0, server_r, server_w, inbound_tx, 8);

        let env = Envelope::new(EnvelopeKind::Data, 1, 0, 0, Payload::Scalar(swarmpi_wire::ScalarValue::I64(7)));
        client_link.send(env).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.from_rank, 1);
    }

    #[tokio::test]
    async fn closed_peer_marks_link_broken_or_closed() {
        let (client, server) = duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        drop(server);

        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let mut client_link = spawn_link(1, client_r, client_w, inbound_tx, 8);
        let final_state = client_link.wait_until_finished().await;
        assert!(matches!(final_state, LinkState::Closed | LinkState::Broken));
    }
}
