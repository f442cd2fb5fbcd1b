// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Exercises the distributed kernels over a real multi-rank communicator
//! mesh, without going through the launcher's remote-shell fan-out (no
//! `sshd` is available in CI). Each test builds a star topology directly
//! on loopback TCP — the same `spawn_tcp_link`/`ClusterCommunicator::new`
//! pair `swarmpi-launch::launcher::launch` uses once its handshake has
//! assigned ranks — and skips straight to running a kernel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use swarmpi_comm::link::spawn_tcp_link;
use swarmpi_comm::{CancellationFlag, ClusterCommunicator, CommError, Communicator};
use swarmpi_kernels::{
    is_prime_distributed, matmul_distributed, monte_carlo_distributed, MatMulInput, MonteCarloConfig, MonteCarloReducer,
};

/// Builds a `size`-rank star cluster on loopback TCP: rank 0 is the
/// listener, ranks 1..size dial in. Each worker announces its rank as a
/// 4-byte big-endian prefix before handing the raw stream to
/// `spawn_tcp_link`, since this harness has no HELLO handshake to learn
/// the mapping from.
async fn build_star_cluster(size: u32) -> Vec<Arc<ClusterCommunicator>> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut connectors = Vec::with_capacity((size - 1) as usize);
    for rank in 1..size {
        connectors.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_u32(rank).await.unwrap();
            stream
        }));
    }

    let (master_tx, master_rx) = mpsc::channel(1024);
    let mut master_links = HashMap::with_capacity((size - 1) as usize);
    for _ in 1..size {
        let (mut stream, _addr) = listener.accept().await.unwrap();
        let rank = stream.read_u32().await.unwrap();
        master_links.insert(rank, spawn_tcp_link(rank, stream, master_tx.clone(), 256));
    }
    let master = ClusterCommunicator::new(0, size, master_links, master_rx, CancellationFlag::new());

    let mut comms = vec![master];
    for (rank, handle) in (1..size).zip(connectors) {
        let stream = handle.await.unwrap();
        let (tx, rx) = mpsc::channel(256);
        let mut links = HashMap::with_capacity(1);
        links.insert(0, spawn_tcp_link(0, stream, tx, 256));
        comms.push(ClusterCommunicator::new(rank, size, links, rx, CancellationFlag::new()));
    }
    comms
}

#[tokio::test]
async fn distributed_is_prime_agrees_on_a_known_prime() {
    let comms = build_star_cluster(4).await;
    let futures = comms.iter().enumerate().map(|(rank, comm)| {
        let comm = comm.clone();
        async move { (rank, is_prime_distributed(104_729, comm.as_ref()).await) }
    });
    let results = futures::future::join_all(futures).await;
    for (rank, result) in results {
        let result = result.unwrap();
        if rank == 0 {
            assert_eq!(result, Some(true));
        } else {
            assert_eq!(result, None);
        }
    }
}

#[tokio::test]
async fn distributed_is_prime_agrees_on_a_known_composite() {
    let comms = build_star_cluster(5).await;
    let futures = comms.iter().map(|comm| {
        let comm = comm.clone();
        async move { is_prime_distributed(999_983 * 7, comm.as_ref()).await }
    });
    let results = futures::future::join_all(futures).await;
    assert_eq!(results[0].as_ref().unwrap(), &Some(false));
    for result in &results[1..] {
        assert_eq!(result.as_ref().unwrap(), &None);
    }
}

#[tokio::test]
async fn distributed_matmul_matches_the_naive_product() {
    let comms = build_star_cluster(4).await;
    // 3x2 times 2x4, small enough that `best_grid` will still spread work
    // across more ranks than rows.
    let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let b = vec![1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
    let (m, k, n) = (3, 2, 4);

    let mut futures = Vec::new();
    for (rank, comm) in comms.iter().enumerate() {
        let comm = comm.clone();
        let input = if rank == 0 {
            Some(MatMulInput { m, k, n, a: a.clone(), b: b.clone() })
        } else {
            None
        };
        futures.push(async move { matmul_distributed(input, comm.as_ref()).await });
    }
    let results = futures::future::join_all(futures).await;

    let rank0 = results[0].as_ref().unwrap().clone().unwrap();
    assert_eq!(rank0.m, m);
    assert_eq!(rank0.n, n);

    let mut expected = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for p in 0..k {
                acc += a[i * k + p] * b[p * n + j];
            }
            expected[i * n + j] = acc;
        }
    }
    for (got, want) in rank0.c.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-9, "got {got}, want {want}");
    }

    for result in &results[1..] {
        assert_eq!(result.as_ref().unwrap(), &None);
    }
}

#[tokio::test]
async fn distributed_monte_carlo_is_bit_identical_across_two_runs_with_the_same_seed() {
    async fn run_once() -> swarmpi_kernels::MonteCarloResult {
        let comms = build_star_cluster(3).await;
        let futures = comms.iter().map(|comm| {
            let comm = comm.clone();
            let config = MonteCarloConfig { num_samples: 30_000, seed: Some(42), cancel_check_every: 4096 };
            let reducer = MonteCarloReducer::default_stats();
            async move {
                monte_carlo_distributed(config, |rng| rand::Rng::gen::<f64>(rng), |x| x, &reducer, comm.as_ref()).await
            }
        });
        let results = futures::future::join_all(futures).await;
        results[0].as_ref().unwrap().clone().unwrap()
    }

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first.samples, second.samples);
    assert_eq!(first.mean.to_bits(), second.mean.to_bits());
    assert_eq!(first.variance.to_bits(), second.variance.to_bits());

    // A seeded uniform[0,1) mean over 30k samples should land close to 0.5.
    assert!((first.mean - 0.5).abs() < 0.05, "mean {} too far from 0.5", first.mean);
}

#[tokio::test]
async fn cancellation_request_from_a_worker_propagates_to_every_rank() {
    let comms = build_star_cluster(4).await;
    // Let the router tasks finish wiring up before we race a cancel in.
    tokio::time::sleep(Duration::from_millis(20)).await;

    comms[2].request_cancellation().await.unwrap();

    for comm in &comms {
        tokio::time::timeout(Duration::from_secs(1), comm.cancellation().wait())
            .await
            .expect("every rank should observe the cancellation within the timeout");
        assert!(comm.cancellation().is_cancelled());
    }
}

// The sampling loop is CPU-bound with no await points between cancellation
// checks, so this needs a real second OS thread to deliver the CANCEL
// envelope while the loop is spinning; the default current-thread test
// runtime would starve the router task and the loop would never observe it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_long_running_monte_carlo_job_stops_early_once_cancelled() {
    let comms = build_star_cluster(2).await;
    let worker = comms[1].clone();
    let config = MonteCarloConfig { num_samples: u64::MAX, seed: Some(7), cancel_check_every: 1 };

    let reducer = MonteCarloReducer::default_stats();
    let handle = tokio::spawn(async move {
        monte_carlo_distributed(config, |rng| rand::Rng::gen::<f64>(rng), |x| x, &reducer, worker.as_ref()).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    comms[0].broadcast_cancel().await.unwrap();

    // The worker is not rank 0, so it stops sampling, hands its partial
    // accumulator off via `gather`, and returns `Ok(None)` without ever
    // blocking on a master that (in this test) never finishes its own side.
    let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("the worker's sampling loop should notice cancellation and return promptly")
        .unwrap();
    assert_eq!(outcome.unwrap(), None);
}

#[tokio::test]
async fn send_to_a_rank_whose_link_was_dropped_reports_peer_lost() {
    let comms = build_star_cluster(3).await;
    let master = comms[0].clone();

    if let Some(link) = master.take_link(1).await {
        link.close().await;
    }

    let err = master.send(1, swarmpi_wire::Payload::Empty).await.unwrap_err();
    assert!(matches!(err, CommError::PeerLost(1)));
}

// Unlike `send_to_a_rank_whose_link_was_dropped_reports_peer_lost` above
// (which only exercises the `send` side by removing the link out from
// under the master), this kills the connection from the *worker's* side
// while the master is genuinely blocked inside `recv` via `gather`, the
// way a real crashed worker process would.
#[tokio::test]
async fn a_worker_dying_mid_gather_unblocks_the_master_with_peer_lost() {
    let comms = build_star_cluster(3).await;
    let master = comms[0].clone();
    let worker1 = comms[1].clone();

    let gather_task = {
        let master = master.clone();
        tokio::spawn(async move { master.gather(0, swarmpi_wire::Payload::Empty).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    if let Some(link) = worker1.take_link(0).await {
        link.close().await;
    }

    let err = tokio::time::timeout(Duration::from_secs(2), gather_task)
        .await
        .expect("the master should notice the dead peer instead of hanging in gather")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, CommError::PeerLost(1)));
}

#[tokio::test]
async fn barrier_releases_every_rank_once_all_have_arrived() {
    let comms = build_star_cluster(5).await;
    let futures = comms.iter().map(|comm| {
        let comm = comm.clone();
        async move { comm.barrier().await }
    });
    let results = tokio::time::timeout(Duration::from_secs(2), futures::future::join_all(futures))
        .await
        .expect("barrier should release all ranks, not deadlock");
    for result in results {
        result.unwrap();
    }
}
