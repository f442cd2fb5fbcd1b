// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use ndarray::Array2;

use swarmpi_comm::Communicator;
use swarmpi_wire::{Payload, ScalarValue};

use crate::error::KernelError;

/// Dense `A (m×k) · B (k×n)` inputs, meaningful only on rank 0 (§9 Q3: other
/// ranks must not pass arrays — pass `None`).
#[derive(Debug, Clone)]
pub struct MatMulInput {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub a: Vec<f64>, // row-major, len == m*k
    pub b: Vec<f64>, // row-major, len == k*n
}

/// The assembled `m×n` product, meaningful only on rank 0.
#[derive(Debug, Clone, PartialEq)]
pub struct MatMulResult {
    pub m: usize,
    pub n: usize,
    pub c: Vec<f64>, // row-major, len == m*n
}

const STATUS_INVALID_SHAPE: i64 = -2;
const STATUS_EMPTY: i64 = -1;
const STATUS_OK: i64 = 0;

pub async fn matmul_distributed(
    input: Option<MatMulInput>,
    comm: &dyn Communicator,
) -> Result<Option<MatMulResult>, KernelError> {
    let rank = comm.rank();
    let size = comm.size();

    let (status, m, k, n) = if rank == 0 {
        let input = input
            .as_ref()
            .ok_or_else(|| KernelError::Internal("rank 0 must supply matmul input".into()))?;
        let status = if input.a.len() != input.m * input.k || input.b.len() != input.k * input.n {
            STATUS_INVALID_SHAPE
        } else if input.m == 0 || input.n == 0 {
            STATUS_EMPTY
        } else {
            STATUS_OK
        };
        (status, input.m, input.k, input.n)
    } else {
        (0, 0, 0, 0)
    };

    let announce = if rank == 0 {
        Some(Payload::List(vec![
            Payload::Scalar(ScalarValue::I64(status)),
            Payload::Scalar(ScalarValue::I64(m as i64)),
            Payload::Scalar(ScalarValue::I64(k as i64)),
            Payload::Scalar(ScalarValue::I64(n as i64)),
        ]))
    } else {
        None
    };
    let announced = comm.bcast(0, announce).await?;
    let (status, m, k, n) = match announced {
        Payload::List(items) => match items.as_slice() {
            [Payload::Scalar(ScalarValue::I64(s)), Payload::Scalar(ScalarValue::I64(m)), Payload::Scalar(ScalarValue::I64(k)), Payload::Scalar(ScalarValue::I64(n))] => {
                (*s, *m as usize, *k as usize, *n as usize)
            }
            _ => return Err(KernelError::Internal("malformed matmul announcement".into())),
        },
        other => return Err(KernelError::Internal(format!("unexpected bcast payload {other:?}"))),
    };

    if status == STATUS_INVALID_SHAPE {
        return Err(KernelError::InvalidShape(format!(
            "A is {m}x{k} but B's row count does not match (expected {k} rows)"
        )));
    }
    if status == STATUS_EMPTY {
        return Ok(if rank == 0 { Some(MatMulResult { m, n, c: Vec::new() }) } else { None });
    }

    comm.cancellation().check().map_err(|_| KernelError::Cancelled)?;

    let (pr, pc) = best_grid(size, m, n);
    let row_ranges = partition_ranges(m, pr);
    let col_ranges = partition_ranges(n, pc);

    let my_pr = (rank / pc) as usize;
    let my_pc = (rank % pc) as usize;
    let (my_row_start, my_row_len) = row_ranges[my_pr];
    let (my_col_start, my_col_len) = col_ranges[my_pc];

    let my_chunk = if rank == 0 {
        let input = input.expect("validated above");
        let chunks: Vec<Payload> = (0..size)
            .map(|r| {
                let pr_idx = (r / pc) as usize;
                let pc_idx = (r % pc) as usize;
                let (row_start, row_len) = row_ranges[pr_idx];
                let (col_start, col_len) = col_ranges[pc_idx];
                let a_strip = extract_row_strip(&input.a, k, row_start, row_len);
                let b_strip = extract_col_strip(&input.b, k, n, col_start, col_len);
                Payload::List(vec![
                    Payload::numeric_array_f64_with_shape(&a_strip, vec![row_len, k]),
                    Payload::numeric_array_f64_with_shape(&b_strip, vec![k, col_len]),
                ])
            })
            .collect();
        comm.scatter(0, Some(chunks)).await?
    } else {
        comm.scatter(0, None).await?
    };

    let (a_arr, b_arr) = match my_chunk {
        Payload::List(items) => match items.as_slice() {
            [a_payload, b_payload] => {
                let (a_shape, a_values) = a_payload.as_f64_array_with_shape()?;
                let (b_shape, b_values) = b_payload.as_f64_array_with_shape()?;
                let a_arr = Array2::from_shape_vec((a_shape[0], a_shape[1]), a_values)
                    .map_err(|e| KernelError::Internal(e.to_string()))?;
                let b_arr = Array2::from_shape_vec((b_shape[0], b_shape[1]), b_values)
                    .map_err(|e| KernelError::Internal(e.to_string()))?;
                (a_arr, b_arr)
            }
            _ => return Err(KernelError::Internal("malformed scatter chunk".into())),
        },
        other => return Err(KernelError::Internal(format!("unexpected scatter payload {other:?}"))),
    };

    let c_block = a_arr.dot(&b_arr);
    let block_payload = Payload::numeric_array_f64_with_shape(
        c_block.as_slice().expect("row-major contiguous"),
        vec![my_row_len, my_col_len],
    );

    let gathered = comm.gather(0, block_payload).await?;
    match gathered {
        Some(blocks) => {
            let mut c = vec![0.0f64; m * n];
            for (r, block) in blocks.into_iter().enumerate() {
                let pr_idx = (r as u32 / pc) as usize;
                let pc_idx = (r as u32 % pc) as usize;
                let (row_start, row_len) = row_ranges[pr_idx];
                let (col_start, col_len) = col_ranges[pc_idx];
                let (_, values) = block.as_f64_array_with_shape()?;
                for local_row in 0..row_len {
                    for local_col in 0..col_len {
                        let dst = (row_start + local_row) * n + (col_start + local_col);
                        c[dst] = values[local_row * col_len + local_col];
                    }
                }
            }
            Ok(Some(MatMulResult { m, n, c }))
        }
        None => Ok(None),
    }
}

fn best_grid(size: u32, m: usize, n: usize) -> (u32, u32) {
    let mut best: Option<(u32, u32, u64, u32)> = None;
    for pr in 1..=size {
        if size % pr != 0 {
            continue;
        }
        let pc = size / pr;
        let cost = ceil_div(m as u64, pr as u64).max(ceil_div(n as u64, pc as u64));
        let diff = pr.abs_diff(pc);
        let is_better = match best {
            None => true,
            Some((_, _, best_cost, best_diff)) => cost < best_cost || (cost == best_cost && diff < best_diff),
        };
        if is_better {
            best = Some((pr, pc, cost, diff));
        }
    }
    let (pr, pc, _, _) = best.expect("size >= 1 guarantees at least one grid");
    (pr, pc)
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// `(start, len)` per part for an even split of `total` items across
/// `parts`, remainder spread to the lowest-indexed parts.
fn partition_ranges(total: usize, parts: u32) -> Vec<(usize, usize)> {
    let parts = parts as usize;
    let base = total / parts;
    let rem = total % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut cursor = 0;
    for p in 0..parts {
        let len = base + usize::from(p < rem);
        ranges.push((cursor, len));
        cursor += len;
    }
    ranges
}

fn extract_row_strip(a: &[f64], k: usize, row_start: usize, row_len: usize) -> Vec<f64> {
    a[row_start * k..(row_start + row_len) * k].to_vec()
}

fn extract_col_strip(b: &[f64], k: usize, n: usize, col_start: usize, col_len: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(k * col_len);
    for row in 0..k {
        out.extend_from_slice(&b[row * n + col_start..row * n + col_start + col_len]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmpi_comm::LocalCommunicator;

    fn reference_matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for p in 0..k {
                    sum += a[i * k + p] * b[p * n + j];
                }
                c[i * n + j] = sum;
            }
        }
        c
    }

    #[tokio::test]
    async fn single_rank_matches_reference_product() {
        let comm = LocalCommunicator::new();
        let (m, k, n) = (5, 7, 3);
        let a: Vec<f64> = (0..m * k).map(|i| i as f64 * 0.5).collect();
        let b: Vec<f64> = (0..k * n).map(|i| i as f64 * 0.25 - 1.0).collect();
        let expected = reference_matmul(&a, &b, m, k, n);

        let result = matmul_distributed(Some(MatMulInput { m, k, n, a, b }), &comm)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.m, m);
        assert_eq!(result.n, n);
        for (got, want) in result.c.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-9, "{got} vs {want}");
        }
    }

    #[tokio::test]
    async fn empty_matrix_yields_zero_dimensional_result() {
        let comm = LocalCommunicator::new();
        let result = matmul_distributed(
            Some(MatMulInput { m: 0, k: 4, n: 3, a: vec![], b: vec![0.0; 12] }),
            &comm,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.m, 0);
        assert!(result.c.is_empty());
    }

    #[tokio::test]
    async fn mismatched_shapes_are_rejected() {
        let comm = LocalCommunicator::new();
        let err = matmul_distributed(
            Some(MatMulInput { m: 2, k: 2, n: 2, a: vec![0.0; 3], b: vec![0.0; 4] }),
            &comm,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KernelError::InvalidShape(_)));
    }

    #[test]
    fn best_grid_prefers_balanced_split() {
        assert_eq!(best_grid(4, 100, 100), (2, 2));
        assert_eq!(best_grid(6, 100, 10), (6, 1));
    }
}
