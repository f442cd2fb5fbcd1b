// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! §9 Q4: a minimal loopback control endpoint so a second `swarmpi cancel`
//! CLI invocation can reach a job already running on the master. Not part
//! of the distilled spec's communicator or launch contracts — purely a
//! side channel the CLI's `cancel` subcommand needs something to call.
//! Loopback-only, unauthenticated, matching the isolated-cluster-network
//! assumption already made for the TCP transport (§1 Non-goals: transport
//! security is out of scope).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use swarmpi_comm::ClusterCommunicator;

pub fn cancel_socket_path(working_dir: &str) -> PathBuf {
    Path::new(working_dir).join("swarmpi.sock")
}

/// Binds the control socket and spawns the accept loop. Each connection's
/// first byte (any byte) triggers [`ClusterCommunicator::broadcast_cancel`].
/// Bind failure is logged and treated as non-fatal to the job: the job
/// simply becomes uncancellable via the socket for its lifetime.
pub fn spawn_cancel_listener(comm: Arc<ClusterCommunicator>, working_dir: String) -> Option<JoinHandle<()>> {
    let path = cancel_socket_path(&working_dir);
    let _ = std::fs::remove_file(&path);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "failed to bind cancel control socket");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let mut buf = [0u8; 1];
                    if stream.read(&mut buf).await.is_ok() {
                        tracing::info!("cancel requested over control socket");
                        if let Err(err) = comm.broadcast_cancel().await {
                            tracing::warn!(%err, "failed to broadcast cancel");
                        }
                        let _ = stream.write_all(b"ok").await;
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "cancel control socket accept failed, stopping listener");
                    return;
                }
            }
        }
    }))
}

/// Client side: connects to a running job's control socket and requests
/// cancellation. Used by the CLI's `cancel` subcommand.
pub async fn trigger_cancel(working_dir: &str) -> std::io::Result<()> {
    let path = cancel_socket_path(working_dir);
    let mut stream = tokio::net::UnixStream::connect(&path).await?;
    stream.write_all(b"c").await?;
    let mut ack = [0u8; 2];
    let _ = stream.read(&mut ack).await;
    Ok(())
}
