// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "swarmpi",
    about = "A minimal MPI-style distributed runtime for cluster computing over commodity Ethernet",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the cluster config file (overrides the default search path).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace). Default is warn.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum RunKernel {
    /// Distributed primality test by divisor-range partitioning.
    Prime {
        /// The integer to test.
        n: u64,
    },
    /// Dense matrix multiply C = A . B by 2-D block decomposition.
    ///
    /// A and B are read as JSON `{"rows": m, "cols": k, "data": [f64; m*k]}`
    /// (row-major). The product is written the same way.
    Matmul {
        /// Path to A's JSON matrix file.
        #[arg(long)]
        a: PathBuf,
        /// Path to B's JSON matrix file.
        #[arg(long)]
        b: PathBuf,
        /// Where to write the product; stdout if omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generic Monte Carlo estimator over i.i.d. uniform[0,1) samples.
    Montecarlo {
        /// Number of samples to draw across the whole group.
        n: u64,
        /// Deterministic seed; omit for an unpredictable per-run seed.
        #[arg(long)]
        seed: Option<u64>,
        /// How often each rank polls the cancellation flag.
        #[arg(long, default_value_t = 1024)]
        cancel_check_every: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Launch (or, with no cluster configured, run locally) one of the
    /// built-in kernels.
    Run {
        #[command(subcommand)]
        kernel: RunKernel,
    },
    /// Print the effective cluster configuration and exit.
    ShowConfig,
    /// Request cancellation of the job currently running on this master,
    /// via its loopback control socket (see SPEC_FULL.md §9 Q4).
    Cancel,
    /// Generate a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Worker bootstrap entry point (C7). Not meant to be invoked by hand —
    /// this is what the launcher's remote-shell invocation string runs on
    /// each worker host.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        master_host: String,
        #[arg(long)]
        master_port: u16,
        #[arg(long)]
        expected_rank: u32,
        #[arg(long)]
        size: u32,
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        auth_nonce: String,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "swarmpi", &mut std::io::stdout());
}
