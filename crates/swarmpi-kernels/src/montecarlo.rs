// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use swarmpi_comm::Communicator;
use swarmpi_wire::{Payload, Rank, ScalarValue};

use crate::error::KernelError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    pub num_samples: u64,
    pub seed: Option<u64>,
    pub cancel_check_every: u64,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self { num_samples: 0, seed: None, cancel_check_every: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonteCarloResult {
    pub samples: u64,
    pub mean: f64,
    pub variance: f64,
    pub stderr: f64,
}

/// Splitmix64-style combine so each rank's stream is deterministic from
/// `(seed, rank)` alone, independent of group size.
fn hash_seed_rank(seed: u64, rank: Rank) -> u64 {
    let mut x = seed ^ (rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// The capability set a caller threads through [`monte_carlo_distributed`]
/// (§9 "Reducer closures"): `init`/`reduce` build each rank's local
/// accumulator sample by sample, `combine` folds the gathered accumulators
/// left-to-right by ascending rank (same determinism rule as
/// [`crate::ReduceOp`] in `swarmpi-comm`, re-derived here since the
/// accumulator shape is caller-defined rather than a fixed scalar), and
/// `finalize` turns the combined accumulator into the caller's result type
/// `R`. [`MonteCarloReducer::default_stats`] is the built-in
/// `(count, sum, sum_sq)` → `{mean, variance, stderr}` reducer every CLI path
/// uses; a caller wanting a custom estimator (e.g. a running min/max, or a
/// histogram) supplies their own accumulator shape via `Payload` instead.
pub struct MonteCarloReducer<R> {
    pub init: Box<dyn Fn() -> Payload + Send + Sync>,
    pub reduce: Box<dyn Fn(Payload, f64) -> Payload + Send + Sync>,
    pub combine: Box<dyn Fn(Payload, Payload) -> Payload + Send + Sync>,
    pub finalize: Box<dyn Fn(Payload) -> R + Send + Sync>,
}

fn decode_stats(payload: &Payload) -> (u64, f64, f64) {
    match payload {
        Payload::List(items) => match items.as_slice() {
            [Payload::Scalar(ScalarValue::U64(c)), Payload::Scalar(ScalarValue::F64(s)), Payload::Scalar(ScalarValue::F64(ss))] => {
                (*c, *s, *ss)
            }
            _ => panic!("malformed default monte carlo accumulator shape"),
        },
        _ => panic!("malformed default monte carlo accumulator shape"),
    }
}

fn encode_stats(count: u64, sum: f64, sum_sq: f64) -> Payload {
    Payload::List(vec![
        Payload::Scalar(ScalarValue::U64(count)),
        Payload::Scalar(ScalarValue::F64(sum)),
        Payload::Scalar(ScalarValue::F64(sum_sq)),
    ])
}

impl MonteCarloReducer<MonteCarloResult> {
    /// The `(count, sum, sum_sq)` accumulator every built-in CLI path uses:
    /// element-wise sum to combine, `{mean, variance, stderr}` to finalize.
    pub fn default_stats() -> Self {
        Self {
            init: Box::new(|| encode_stats(0, 0.0, 0.0)),
            reduce: Box::new(|acc, x| {
                let (count, sum, sum_sq) = decode_stats(&acc);
                encode_stats(count + 1, sum + x, sum_sq + x * x)
            }),
            combine: Box::new(|a, b| {
                let (ca, sa, ssa) = decode_stats(&a);
                let (cb, sb, ssb) = decode_stats(&b);
                encode_stats(ca + cb, sa + sb, ssa + ssb)
            }),
            finalize: Box::new(|acc| {
                let (count, sum, sum_sq) = decode_stats(&acc);
                if count == 0 {
                    return MonteCarloResult { samples: 0, mean: f64::NAN, variance: f64::NAN, stderr: f64::NAN };
                }
                let mean = sum / count as f64;
                let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
                let stderr = (variance / count as f64).sqrt();
                MonteCarloResult { samples: count, mean, variance, stderr }
            }),
        }
    }
}

impl Default for MonteCarloReducer<MonteCarloResult> {
    fn default() -> Self {
        Self::default_stats()
    }
}

/// Distributed Monte Carlo estimator. Each rank draws its share of
/// `config.num_samples`, folding them into an accumulator via `reducer`;
/// accumulators are gathered to rank 0 and combined left-to-right by
/// ascending rank, then finalized into `R`. `sample_fn`/`eval_fn` run locally
/// on every rank's own process — only the scalar configuration travels the
/// wire.
pub async fn monte_carlo_distributed<S, E, R>(
    config: MonteCarloConfig,
    mut sample_fn: S,
    eval_fn: E,
    reducer: &MonteCarloReducer<R>,
    comm: &dyn Communicator,
) -> Result<Option<R>, KernelError>
where
    S: FnMut(&mut ChaCha8Rng) -> f64,
    E: Fn(f64) -> f64,
{
    let rank = comm.rank();
    let size = comm.size();
    let rank_u64 = rank as u64;

    let base = config.num_samples / size as u64;
    let rem = config.num_samples % size as u64;
    let my_count = base + u64::from(rank_u64 < rem);
    let cancel_every = config.cancel_check_every.max(1);

    let mut rng = match config.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(hash_seed_rank(seed, rank)),
        None => ChaCha8Rng::from_entropy(),
    };

    let mut acc = (reducer.init)();
    for i in 0..my_count {
        let value = eval_fn(sample_fn(&mut rng));
        acc = (reducer.reduce)(acc, value);
        if (i + 1) % cancel_every == 0 && comm.cancellation().is_cancelled() {
            break;
        }
    }

    let gathered = comm.gather(0, acc).await?;
    match gathered {
        Some(accumulators) => {
            let mut iter = accumulators.into_iter();
            let first = iter.next().expect("gather always returns one entry per rank, and size >= 1");
            let combined = iter.fold(first, |a, b| (reducer.combine)(a, b));
            Ok(Some((reducer.finalize)(combined)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use swarmpi_comm::LocalCommunicator;

    #[tokio::test]
    async fn zero_samples_yields_nan_everywhere() {
        let comm = LocalCommunicator::new();
        let reducer = MonteCarloReducer::default_stats();
        let result = monte_carlo_distributed(
            MonteCarloConfig { num_samples: 0, ..Default::default() },
            |rng| rng.gen::<f64>(),
            |x| x,
            &reducer,
            &comm,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.samples, 0);
        assert!(result.mean.is_nan());
        assert!(result.variance.is_nan());
        assert!(result.stderr.is_nan());
    }

    #[tokio::test]
    async fn seeded_run_estimates_uniform_mean_near_one_half() {
        let comm = LocalCommunicator::new();
        let reducer = MonteCarloReducer::default_stats();
        let result = monte_carlo_distributed(
            MonteCarloConfig { num_samples: 100_000, seed: Some(1234), ..Default::default() },
            |rng| rng.gen::<f64>(),
            |x| x,
            &reducer,
            &comm,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.samples, 100_000);
        assert!((result.mean - 0.5).abs() < 0.01, "mean was {}", result.mean);
    }

    #[tokio::test]
    async fn same_seed_is_bit_identical_across_runs() {
        let comm = LocalCommunicator::new();
        let reducer = MonteCarloReducer::default_stats();
        let cfg = MonteCarloConfig { num_samples: 10_000, seed: Some(42), ..Default::default() };
        let first = monte_carlo_distributed(cfg.clone(), |rng| rng.gen::<f64>(), |x| x, &reducer, &comm)
            .await
            .unwrap()
            .unwrap();
        let second = monte_carlo_distributed(cfg, |rng| rng.gen::<f64>(), |x| x, &reducer, &comm)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.mean.to_bits(), second.mean.to_bits());
        assert_eq!(first.variance.to_bits(), second.variance.to_bits());
    }

    #[tokio::test]
    async fn a_custom_reducer_can_track_a_running_maximum_instead_of_the_default_stats() {
        let comm = LocalCommunicator::new();
        let reducer: MonteCarloReducer<f64> = MonteCarloReducer {
            init: Box::new(|| Payload::Scalar(ScalarValue::F64(f64::NEG_INFINITY))),
            reduce: Box::new(|acc, x| match acc {
                Payload::Scalar(ScalarValue::F64(m)) => Payload::Scalar(ScalarValue::F64(m.max(x))),
                other => other,
            }),
            combine: Box::new(|a, b| match (a, b) {
                (Payload::Scalar(ScalarValue::F64(a)), Payload::Scalar(ScalarValue::F64(b))) => {
                    Payload::Scalar(ScalarValue::F64(a.max(b)))
                }
                (other, _) => other,
            }),
            finalize: Box::new(|acc| match acc {
                Payload::Scalar(ScalarValue::F64(m)) => m,
                _ => f64::NAN,
            }),
        };
        let result = monte_carlo_distributed(
            MonteCarloConfig { num_samples: 1_000, seed: Some(9), ..Default::default() },
            |rng| rng.gen::<f64>(),
            |x| x,
            &reducer,
            &comm,
        )
        .await
        .unwrap()
        .unwrap();
        assert!((0.0..=1.0).contains(&result));
    }
}
