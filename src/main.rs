// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands, RunKernel};
use swarmpi::SwarmKernelDispatch;
use swarmpi_comm::LocalCommunicator;
use swarmpi_kernels::{
    is_prime_distributed, matmul_distributed, monte_carlo_distributed, MatMulInput, MonteCarloConfig, MonteCarloReducer,
};
use swarmpi_launch::{JobLock, LaunchSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // A cluster config's `log_level` is pure logging plumbing (SPEC_FULL.md
    // §6 addition), so it's worth a best-effort load even for subcommands
    // that don't otherwise touch the cluster config. A missing/invalid
    // config here is not an error — it just means "no override".
    let config_log_level = swarmpi_config::load(cli.config.as_deref()).ok().and_then(|c| c.log_level);
    init_logging(cli.verbose, config_log_level.as_deref());

    match &cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            Ok(())
        }
        Commands::ShowConfig => show_config(cli.config.as_deref()),
        Commands::Cancel => cancel_job(cli.config.as_deref()).await,
        Commands::Worker { master_host, master_port, expected_rank, size, job_id, auth_nonce } => {
            let args = swarmpi_launch::WorkerBootstrapArgs {
                master_host: master_host.clone(),
                master_port: *master_port,
                expected_rank: *expected_rank,
                size: *size,
                job_id: job_id.clone(),
                auth_nonce: auth_nonce.clone(),
                handshake_timeout: Duration::from_secs(60),
            };
            let code = swarmpi_launch::run_worker(args, Arc::new(SwarmKernelDispatch)).await;
            std::process::exit(code);
        }
        Commands::Run { kernel } => run_kernel(cli.config.as_deref(), kernel).await,
    }
}

/// Priority, highest first: `RUST_LOG` env var, then a cluster config's
/// `log_level`, then `-v`/`-vv` verbosity, then `warn` by default.
fn init_logging(verbosity: u8, config_log_level: Option<&str>) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_log_level.unwrap_or(level)))
        .unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn show_config(explicit: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = swarmpi_config::load(explicit).context("loading cluster configuration")?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn cancel_job(explicit: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = swarmpi_config::load(explicit)
        .context("a cluster configuration is required to locate the running job's control socket")?;
    swarmpi_launch::trigger_cancel(&config.working_dir)
        .await
        .context("failed to reach the job's control socket; is a job running on this master?")?;
    println!("cancellation requested");
    Ok(())
}

/// Row-major dense matrix on disk: `{"rows": m, "cols": n, "data": [f64; m*n]}`.
#[derive(Debug, Serialize, Deserialize)]
struct MatrixFile {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

fn read_matrix(path: &PathBuf) -> anyhow::Result<MatrixFile> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {} as a matrix JSON file", path.display()))
}

async fn run_kernel(explicit: Option<&std::path::Path>, kernel: &RunKernel) -> anyhow::Result<()> {
    match swarmpi_config::load(explicit) {
        Ok(config) => run_kernel_distributed(config, kernel).await,
        Err(err) => {
            tracing::debug!(%err, "no cluster configuration found, falling back to the local single-rank communicator");
            run_kernel_local(kernel).await
        }
    }
}

/// A fresh `JobLock` per CLI invocation is sufficient here: this binary is
/// one process per job, not a long-running master daemon, so "at most one
/// running job" (P4) holds trivially across invocations — there is nothing
/// left in the process for a second job to collide with once this one
/// returns.
async fn run_kernel_distributed(config: swarmpi_config::ClusterConfig, kernel: &RunKernel) -> anyhow::Result<()> {
    let job_lock = JobLock::new();
    let settings = LaunchSettings::default();

    match kernel {
        RunKernel::Prime { n } => {
            let args_blob = serde_json::to_vec(n)?;
            let job = swarmpi_launch::launch(&config, &job_lock, &settings, swarmpi::kernel_dispatch::KERNEL_PRIME, args_blob)
                .await
                .context("launching cluster job")?;
            let result = is_prime_distributed(*n, job.comm.as_ref()).await;
            job.teardown(&settings).await.context("tearing down job")?;
            match result.context("running is_prime kernel")? {
                Some(is_prime) => println!("{is_prime}"),
                None => unreachable!("rank 0 always gets Some"),
            }
            Ok(())
        }
        RunKernel::Matmul { a, b, out } => {
            let a_mat = read_matrix(a)?;
            let b_mat = read_matrix(b)?;
            if a_mat.cols != b_mat.rows {
                anyhow::bail!("invalid_shape: A is {}x{} but B has {} rows", a_mat.rows, a_mat.cols, b_mat.rows);
            }
            let job = swarmpi_launch::launch(&config, &job_lock, &settings, swarmpi::kernel_dispatch::KERNEL_MATMUL, Vec::new())
                .await
                .context("launching cluster job")?;
            let input = MatMulInput { m: a_mat.rows, k: a_mat.cols, n: b_mat.cols, a: a_mat.data, b: b_mat.data };
            let result = matmul_distributed(Some(input), job.comm.as_ref()).await;
            job.teardown(&settings).await.context("tearing down job")?;
            let result = result.context("running matmul kernel")?.expect("rank 0 always gets Some");
            write_matrix_result(out.as_ref(), result.m, result.n, &result.c)
        }
        RunKernel::Montecarlo { n, seed, cancel_check_every } => {
            let mc_config = MonteCarloConfig { num_samples: *n, seed: *seed, cancel_check_every: *cancel_check_every };
            let args_blob = serde_json::to_vec(&mc_config)?;
            let job = swarmpi_launch::launch(
                &config,
                &job_lock,
                &settings,
                swarmpi::kernel_dispatch::KERNEL_MONTECARLO,
                args_blob,
            )
            .await
            .context("launching cluster job")?;
            let reducer = MonteCarloReducer::default_stats();
            let result = monte_carlo_distributed(mc_config, |rng| rng.gen::<f64>(), |x| x, &reducer, job.comm.as_ref()).await;
            job.teardown(&settings).await.context("tearing down job")?;
            print_montecarlo_result(result.context("running monte carlo kernel")?.expect("rank 0 always gets Some"));
            Ok(())
        }
    }
}

async fn run_kernel_local(kernel: &RunKernel) -> anyhow::Result<()> {
    let comm = LocalCommunicator::new();
    match kernel {
        RunKernel::Prime { n } => {
            let is_prime = is_prime_distributed(*n, &comm).await.context("running is_prime kernel")?;
            println!("{}", is_prime.expect("size()==1 always returns Some"));
        }
        RunKernel::Matmul { a, b, out } => {
            let a_mat = read_matrix(a)?;
            let b_mat = read_matrix(b)?;
            if a_mat.cols != b_mat.rows {
                anyhow::bail!("invalid_shape: A is {}x{} but B has {} rows", a_mat.rows, a_mat.cols, b_mat.rows);
            }
            let input = MatMulInput { m: a_mat.rows, k: a_mat.cols, n: b_mat.cols, a: a_mat.data, b: b_mat.data };
            let result = matmul_distributed(Some(input), &comm).await.context("running matmul kernel")?;
            let result = result.expect("size()==1 always returns Some");
            write_matrix_result(out.as_ref(), result.m, result.n, &result.c)?;
        }
        RunKernel::Montecarlo { n, seed, cancel_check_every } => {
            let mc_config = MonteCarloConfig { num_samples: *n, seed: *seed, cancel_check_every: *cancel_check_every };
            let reducer = MonteCarloReducer::default_stats();
            let result = monte_carlo_distributed(mc_config, |rng| rng.gen::<f64>(), |x| x, &reducer, &comm)
                .await
                .context("running monte carlo kernel")?;
            print_montecarlo_result(result.expect("size()==1 always returns Some"));
        }
    }
    Ok(())
}

fn write_matrix_result(out: Option<&PathBuf>, rows: usize, cols: usize, data: &[f64]) -> anyhow::Result<()> {
    let file = MatrixFile { rows, cols, data: data.to_vec() };
    let json = serde_json::to_string_pretty(&file)?;
    match out {
        Some(path) => std::fs::write(path, json).with_context(|| format!("writing {}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn print_montecarlo_result(result: swarmpi_kernels::MonteCarloResult) {
    println!(
        "{}",
        serde_json::json!({
            "samples": result.samples,
            "mean": result.mean,
            "variance": result.variance,
            "stderr": result.stderr,
        })
    );
}
