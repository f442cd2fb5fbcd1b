// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use swarmpi_comm::link::spawn_tcp_link;
use swarmpi_comm::{CancellationFlag, ClusterCommunicator, CommError, Communicator};
use swarmpi_wire::{EnvelopeKind, Payload, Rank};

use crate::dispatch::KernelDispatch;

pub const EXIT_OK: i32 = 0;
pub const EXIT_OTHER_FATAL: i32 = 1;
pub const EXIT_CANCELLED: i32 = 2;
pub const EXIT_PROTOCOL_VIOLATION: i32 = 10;
pub const EXIT_HANDSHAKE_FAILURE: i32 = 20;

#[derive(Debug, Clone)]
pub struct WorkerBootstrapArgs {
    pub master_host: String,
    pub master_port: u16,
    pub expected_rank: Rank,
    pub size: u32,
    pub job_id: String,
    pub auth_nonce: String,
    pub handshake_timeout: Duration,
}

impl Default for WorkerBootstrapArgs {
    fn default() -> Self {
        Self {
            master_host: String::new(),
            master_port: 0,
            expected_rank: 0,
            size: 1,
            job_id: String::new(),
            auth_nonce: String::new(),
            handshake_timeout: Duration::from_secs(60),
        }
    }
}

/// Dials the master, performs the HELLO/JOB_DESCRIPTOR/READY/GO handshake,
/// dispatches the named kernel, sends DONE or FAIL, waits for SHUTDOWN, and
/// returns the process exit code — never panics, so `main` can call this
/// and pass the result straight to `std::process::exit`.
pub async fn run_worker(args: WorkerBootstrapArgs, dispatch: Arc<dyn KernelDispatch>) -> i32 {
    let stream = match TcpStream::connect((args.master_host.as_str(), args.master_port)).await {
        Ok(s) => s,
        Err(err) => {
            tracing::error!(%err, "failed to dial master");
            return EXIT_HANDSHAKE_FAILURE;
        }
    };

    let (router_tx, router_rx) = mpsc::channel(64);
    let mut links = HashMap::with_capacity(1);
    links.insert(0, spawn_tcp_link(0, stream, router_tx, 256));
    let cancel = CancellationFlag::new();
    let comm = ClusterCommunicator::new(args.expected_rank, args.size, links, router_rx, cancel.clone());
    let mut control = comm.subscribe_control();

    let hello = Payload::Hello {
        job_id: args.job_id.clone(),
        auth_nonce: args.auth_nonce.clone(),
        claimed_rank: args.expected_rank,
    };
    if let Err(err) = comm.send_control(0, EnvelopeKind::Hello, hello).await {
        tracing::error!(%err, "failed to send HELLO");
        return EXIT_HANDSHAKE_FAILURE;
    }

    let descriptor = match timeout(args.handshake_timeout, async {
        loop {
            match control.recv().await {
                Ok(env) if env.kind == EnvelopeKind::JobDescriptor => return Ok(env.payload),
                Ok(_) => continue,
                Err(_) => return Err(()),
            }
        }
    })
    .await
    {
        Ok(Ok(payload)) => payload,
        _ => {
            tracing::error!("did not receive JOB_DESCRIPTOR before handshake_timeout");
            return EXIT_HANDSHAKE_FAILURE;
        }
    };

    let (kernel_name, kernel_args_blob) = match descriptor {
        Payload::JobDescriptor { kernel_name, kernel_args_blob, .. } => (kernel_name, kernel_args_blob),
        _ => return EXIT_PROTOCOL_VIOLATION,
    };

    if let Err(err) = comm.send_control(0, EnvelopeKind::Ready, Payload::Empty).await {
        tracing::error!(%err, "failed to send READY");
        return EXIT_HANDSHAKE_FAILURE;
    }

    let go_received = timeout(args.handshake_timeout, async {
        loop {
            match control.recv().await {
                Ok(env) if env.kind == EnvelopeKind::Go => return Ok(()),
                Ok(_) => continue,
                Err(_) => return Err(()),
            }
        }
    })
    .await;
    if !matches!(go_received, Ok(Ok(()))) {
        tracing::error!("did not receive GO before handshake_timeout");
        return EXIT_HANDSHAKE_FAILURE;
    }

    let comm_dyn: Arc<dyn Communicator> = comm.clone();
    let outcome = dispatch.dispatch(&kernel_name, &kernel_args_blob, comm_dyn).await;

    let exit_code = match outcome {
        Ok(result) => {
            if let Err(err) = comm.send_control(0, EnvelopeKind::Done, result).await {
                tracing::error!(%err, "failed to send DONE");
                return EXIT_HANDSHAKE_FAILURE;
            }
            EXIT_OK
        }
        Err(reason) => {
            let code = if cancel.is_cancelled() {
                EXIT_CANCELLED
            } else if reason.starts_with("protocol_violation") {
                EXIT_PROTOCOL_VIOLATION
            } else {
                EXIT_OTHER_FATAL
            };
            let _ = comm
                .send_control(0, EnvelopeKind::Fail, Payload::Fail { reason })
                .await;
            code
        }
    };

    let _ = timeout(args.handshake_timeout, async {
        loop {
            match control.recv().await {
                Ok(env) if env.kind == EnvelopeKind::Shutdown => return,
                Ok(_) => continue,
                Err(_) => return,
            }
        }
    })
    .await;

    let _ = comm;
    exit_code
}

// `CommError` is re-exported purely so downstream binaries matching on
// dispatch failures don't need a second dependency on `swarmpi-comm`.
pub type WorkerCommError = CommError;
