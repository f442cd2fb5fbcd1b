// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use swarmpi_comm::{CommError, Communicator, ReduceOp};
use swarmpi_wire::{Payload, ScalarValue};

use crate::error::KernelError;

/// How often the divisor-search loop re-checks the cancellation flag.
pub const CANCEL_POLL_INTERVAL: u64 = 1024;

/// Distributed primality test by divisor-range partitioning. Only rank 0's
/// return value is meaningful in distributed mode (`Some`); other ranks get
/// `None`. In local (`size() == 1`) mode rank 0 is the only rank and always
/// gets `Some`.
pub async fn is_prime_distributed(n: u64, comm: &dyn Communicator) -> Result<Option<bool>, KernelError> {
    let rank = comm.rank();
    let size = comm.size();

    // Trivial cases are decided on rank 0 and broadcast: -1 means "not
    // trivial, proceed to divisor search"; 0/1 encode the decided answer.
    let trivial_code: i64 = if n < 2 {
        0
    } else if n <= 3 {
        1
    } else if n % 2 == 0 {
        0
    } else {
        -1
    };

    let bcast_input = if rank == 0 { Some(Payload::Scalar(ScalarValue::I64(trivial_code))) } else { None };
    let decided = comm.bcast(0, bcast_input).await?;
    let code = match decided {
        Payload::Scalar(ScalarValue::I64(c)) => c,
        other => return Err(KernelError::Internal(format!("unexpected bcast payload {other:?}"))),
    };
    if code != -1 {
        return Ok(if rank == 0 { Some(code == 1) } else { None });
    }

    let sqrt_n = integer_sqrt(n);
    let divisor_count = if sqrt_n < 3 { 0 } else { (sqrt_n - 3) / 2 + 1 };

    let base = divisor_count / size as u64;
    let rem = divisor_count % size as u64;
    let rank_u64 = rank as u64;
    let start_idx = rank_u64 * base + rank_u64.min(rem);
    let my_len = base + u64::from(rank_u64 < rem);

    let mut found_divisor = false;
    let mut i = 0u64;
    while i < my_len {
        let divisor = 3 + 2 * (start_idx + i);
        if n % divisor == 0 {
            found_divisor = true;
            // Short-circuit (§9 Q2): stop our own scan and ask the rest of
            // the group to stop theirs rather than wait for the full range.
            comm.request_cancellation().await?;
            break;
        }
        i += 1;
        if i % CANCEL_POLL_INTERVAL == 0 && comm.cancellation().is_cancelled() {
            break;
        }
    }

    let local = Payload::Scalar(ScalarValue::Bool(found_divisor));
    match comm.reduce(0, local, ReduceOp::Any).await {
        Ok(Some(Payload::Scalar(ScalarValue::Bool(any_found)))) => Ok(Some(!any_found)),
        Ok(Some(other)) => Err(KernelError::Internal(format!("unexpected reduce payload {other:?}"))),
        Ok(None) => Ok(None),
        // A peer's short-circuit interrupted our own wait on the reduce —
        // the only thing that cancels mid-reduce in this kernel is exactly
        // that, so it is itself the answer: composite.
        Err(CommError::Cancelled) => Ok(if rank == 0 { Some(false) } else { None }),
        Err(err) => Err(err.into()),
    }
}

fn integer_sqrt(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut x = (n as f64).sqrt() as u64;
    while x > 0 && x * x > n {
        x -= 1;
    }
    while (x + 1) * (x + 1) <= n {
        x += 1;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmpi_comm::LocalCommunicator;

    #[tokio::test]
    async fn boundary_values_below_two_are_not_prime() {
        let comm = LocalCommunicator::new();
        assert_eq!(is_prime_distributed(0, &comm).await.unwrap(), Some(false));
        assert_eq!(is_prime_distributed(1, &comm).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn two_is_prime() {
        let comm = LocalCommunicator::new();
        assert_eq!(is_prime_distributed(2, &comm).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn even_composite_is_rejected_trivially() {
        let comm = LocalCommunicator::new();
        assert_eq!(is_prime_distributed(1_000_000, &comm).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn large_prime_is_identified_in_local_mode() {
        let comm = LocalCommunicator::new();
        assert_eq!(is_prime_distributed(999_983, &comm).await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn odd_composite_with_small_factor() {
        let comm = LocalCommunicator::new();
        assert_eq!(is_prime_distributed(9, &comm).await.unwrap(), Some(false));
        assert_eq!(is_prime_distributed(15, &comm).await.unwrap(), Some(false));
    }

    #[test]
    fn integer_sqrt_is_exact_at_perfect_squares() {
        assert_eq!(integer_sqrt(81), 9);
        assert_eq!(integer_sqrt(80), 8);
        assert_eq!(integer_sqrt(999_983), 999);
    }
}
