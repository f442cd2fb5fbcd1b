// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;

use swarmpi_comm::link::spawn_tcp_link;
use swarmpi_comm::{CancellationFlag, ClusterCommunicator, Communicator};
use swarmpi_config::ClusterConfig;
use swarmpi_wire::{read_envelope, EnvelopeKind, Payload, Rank};

use crate::cancel_socket::spawn_cancel_listener;
use crate::error::LaunchError;
use crate::joblock::{JobLock, JobLockGuard};

#[derive(Debug, Clone, Copy)]
pub struct LaunchSettings {
    pub bootstrap_timeout: Duration,
    pub drain_timeout: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(15),
        }
    }
}

/// A fully connected, handshaked job. Tearing it down (`teardown`) sends
/// `SHUTDOWN` to every worker, closes links, reaps the remote shells, and —
/// via the job lock guard's `Drop` — releases the lock.
pub struct RunningJob {
    pub comm: Arc<ClusterCommunicator>,
    pub job_id: String,
    children: Vec<(Rank, Child)>,
    cancel_listener: Option<tokio::task::JoinHandle<()>>,
    working_dir: String,
    _guard: JobLockGuard,
}

impl RunningJob {
    pub async fn teardown(mut self, settings: &LaunchSettings) -> Result<(), LaunchError> {
        if let Some(handle) = self.cancel_listener.take() {
            handle.abort();
        }
        let _ = std::fs::remove_file(crate::cancel_socket::cancel_socket_path(&self.working_dir));
        let _ = self.comm.shutdown_all().await;
        for rank in 1..self.comm.size() {
            if let Some(link) = self.comm.take_link(rank).await {
                link.close().await;
            }
        }
        self.comm.abort_router();
        for (rank, mut child) in self.children.drain(..) {
            match timeout(settings.drain_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(rank, ?status, "worker process exited");
                }
                Ok(Err(err)) => tracing::warn!(rank, %err, "failed to wait on worker process"),
                Err(_) => {
                    tracing::warn!(rank, "worker process did not exit before drain_timeout, killing");
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }
}

fn worker_invocation(config: &ClusterConfig, master_port: u16, job_id: &str, auth_nonce: &str, rank: Rank, size: u32) -> String {
    format!(
        "cd {wd} && {exe} worker --master-host {mh} --master-port {port} --expected-rank {rank} --size {size} --job-id {jid} --auth-nonce {nonce}",
        wd = config.working_dir,
        exe = config.python_executable,
        mh = config.master_node,
        port = master_port,
        rank = rank,
        size = size,
        jid = job_id,
        nonce = auth_nonce,
    )
}

async fn kill_all(children: &mut [(Rank, Child)]) {
    for (_, child) in children.iter_mut() {
        let _ = child.kill().await;
    }
}

/// Runs the seven launch steps of the distilled spec: listener, invocation
/// string, fan-out, accept-with-timeout, handshake, (caller then runs the
/// kernel on the returned communicator), teardown is a separate call
/// (`RunningJob::teardown`) so the kernel can run with the job lock held.
pub async fn launch(
    config: &ClusterConfig,
    job_lock: &JobLock,
    settings: &LaunchSettings,
    kernel_name: &str,
    kernel_args_blob: Vec<u8>,
) -> Result<RunningJob, LaunchError> {
    let job_id = uuid::Uuid::new_v4().to_string();
    let auth_nonce = uuid::Uuid::new_v4().to_string();
    let size = 1 + config.num_worker_nodes;

    let guard = job_lock.acquire(job_id.clone())?;

    let listener = TcpListener::bind("0.0.0.0:0").await?;
    let master_port = listener.local_addr()?.port();

    let mut children: Vec<(Rank, Child)> = Vec::with_capacity(config.hosts.len());
    for (i, host) in config.hosts.iter().enumerate() {
        let rank = (i + 1) as Rank;
        let invocation = worker_invocation(config, master_port, &job_id, &auth_nonce, rank, size);
        let remote = format!("{}@{}", config.ssh_user, host);
        let spawned = Command::new("ssh")
            .arg(&remote)
            .arg(invocation)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn();
        match spawned {
            Ok(child) => children.push((rank, child)),
            Err(err) => {
                kill_all(&mut children).await;
                return Err(LaunchError::HandshakeFailure(format!(
                    "failed to spawn remote shell for host {host}: {err}"
                )));
            }
        }
    }

    let expected = config.num_worker_nodes as usize;
    let mut pending: HashMap<Rank, TcpStream> = HashMap::with_capacity(expected);
    let accept_result = timeout(settings.bootstrap_timeout, async {
        while pending.len() < expected {
            let (mut socket, _addr) = listener.accept().await?;
            let envelope = match read_envelope(&mut socket).await {
                Ok(e) => e,
                Err(_) => continue, // malformed first frame: drop and keep waiting on others
            };
            match envelope.payload {
                Payload::Hello { job_id: hello_job, auth_nonce: hello_nonce, claimed_rank }
                    if envelope.kind == EnvelopeKind::Hello
                        && hello_job == job_id
                        && hello_nonce == auth_nonce =>
                {
                    pending.insert(claimed_rank, socket);
                }
                _ => continue, // mismatch: count as failure by simply not admitting it
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;

    if accept_result.is_err() || pending.len() != expected {
        kill_all(&mut children).await;
        return Err(LaunchError::BootstrapTimeout { got: pending.len(), expected });
    }

    let (router_tx, router_rx) = mpsc::channel(1024);
    let mut links = HashMap::with_capacity(expected);
    for (rank, stream) in pending {
        links.insert(rank, spawn_tcp_link(rank, stream, router_tx.clone(), 256));
    }

    let cancel = CancellationFlag::new();
    let comm = ClusterCommunicator::new(0, size, links, router_rx, cancel);

    for rank in 1..size {
        let descriptor = Payload::JobDescriptor {
            job_id: job_id.clone(),
            kernel_name: kernel_name.to_string(),
            kernel_args_blob: kernel_args_blob.clone(),
            size,
            rank,
            cancellation_epoch: 0,
        };
        if let Err(err) = comm.send_control(rank, EnvelopeKind::JobDescriptor, descriptor).await {
            kill_all(&mut children).await;
            return Err(LaunchError::HandshakeFailure(format!(
                "failed to send JOB_DESCRIPTOR to rank {rank}: {err}"
            )));
        }
        if let Err(err) = comm.send_control(rank, EnvelopeKind::Go, Payload::Empty).await {
            kill_all(&mut children).await;
            return Err(LaunchError::HandshakeFailure(format!(
                "failed to send GO to rank {rank}: {err}"
            )));
        }
    }

    let mut control = comm.subscribe_control();
    let mut ready: std::collections::HashSet<Rank> = std::collections::HashSet::with_capacity(expected);
    let wait_ready = timeout(settings.bootstrap_timeout, async {
        while ready.len() < expected {
            match control.recv().await {
                Ok(env) if env.kind == EnvelopeKind::Ready => {
                    ready.insert(env.from_rank);
                }
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
    })
    .await;

    if wait_ready.is_err() {
        let _ = comm.shutdown_all().await;
        kill_all(&mut children).await;
        return Err(LaunchError::HandshakeFailure(
            "timed out waiting for READY from every worker".into(),
        ));
    }

    let cancel_listener = spawn_cancel_listener(comm.clone(), config.working_dir.clone());

    Ok(RunningJob {
        comm,
        job_id,
        children,
        cancel_listener,
        working_dir: config.working_dir.clone(),
        _guard: guard,
    })
}
