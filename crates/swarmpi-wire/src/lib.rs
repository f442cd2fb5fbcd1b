// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire codec for the swarmpi cluster protocol.
//!
//! Frame format: a 4-byte big-endian length prefix followed by a CBOR-encoded
//! [`Envelope`]. The prefix excludes itself from the count. Frames above
//! [`MAX_FRAME_LEN`] are rejected before the payload is even read.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type Rank = u32;

/// Largest payload a single frame may carry, matching the length prefix's
/// usable range (`2^31 - 1`, i.e. `i32::MAX`).
pub const MAX_FRAME_LEN: u32 = i32::MAX as u32;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("frame of {0} bytes exceeds max frame length {max}", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    Hello,
    JobDescriptor,
    Ready,
    Go,
    Data,
    Cancel,
    Shutdown,
    Done,
    Fail,
    Routed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    I64,
    U64,
    F64,
    Bool,
    U8,
}

impl ElementKind {
    pub fn size_of(self) -> usize {
        match self {
            ElementKind::I64 | ElementKind::U64 | ElementKind::F64 => 8,
            ElementKind::Bool | ElementKind::U8 => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
}

/// The dynamically-typed body carried by an envelope. `Data` envelopes carry
/// one of the generic variants (`Scalar`, `NumericArray`, `List`, `Blob`);
/// control envelopes carry the variant matching their `EnvelopeKind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Scalar(ScalarValue),
    /// Always little-endian bytes regardless of host order.
    NumericArray {
        element_kind: ElementKind,
        shape: Vec<usize>,
        bytes: Vec<u8>,
    },
    List(Vec<Payload>),
    Blob(Vec<u8>),
    Text(String),
    Hello {
        job_id: String,
        auth_nonce: String,
        claimed_rank: Rank,
    },
    JobDescriptor {
        job_id: String,
        kernel_name: String,
        kernel_args_blob: Vec<u8>,
        size: u32,
        rank: Rank,
        cancellation_epoch: u64,
    },
    Fail {
        reason: String,
    },
}

impl Payload {
    pub fn numeric_array_f64(values: &[f64]) -> Self {
        Self::numeric_array_f64_with_shape(values, vec![values.len()])
    }

    pub fn numeric_array_f64_with_shape(values: &[f64], shape: Vec<usize>) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 8);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Payload::NumericArray { element_kind: ElementKind::F64, shape, bytes }
    }

    pub fn as_f64_array(&self) -> Result<Vec<f64>, WireError> {
        Ok(self.as_f64_array_with_shape()?.1)
    }

    pub fn as_f64_array_with_shape(&self) -> Result<(Vec<usize>, Vec<f64>), WireError> {
        match self {
            Payload::NumericArray { element_kind: ElementKind::F64, bytes, shape } => {
                if bytes.len() % 8 != 0 {
                    return Err(WireError::ProtocolViolation(
                        "f64 array byte length not a multiple of 8".into(),
                    ));
                }
                let values = bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                    .collect();
                Ok((shape.clone(), values))
            }
            _ => Err(WireError::ProtocolViolation(
                "expected a NumericArray(F64) payload".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub from_rank: Rank,
    pub to_rank: Rank,
    pub seq: u64,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from_rank: Rank, to_rank: Rank, seq: u64, payload: Payload) -> Self {
        Self { kind, from_rank, to_rank, seq, payload }
    }

    pub fn cancel(from_rank: Rank, to_rank: Rank, seq: u64) -> Self {
        Self::new(EnvelopeKind::Cancel, from_rank, to_rank, seq, Payload::Empty)
    }

    pub fn shutdown(from_rank: Rank, to_rank: Rank, seq: u64) -> Self {
        Self::new(EnvelopeKind::Shutdown, from_rank, to_rank, seq, Payload::Empty)
    }
}

/// Writes one framed envelope: `[u32 BE length][CBOR payload]`.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(envelope, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    if buf.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(WireError::FrameTooLarge(buf.len()));
    }
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed envelope, or `Err(WireError::ConnectionClosed)` on a
/// clean EOF at a frame boundary.
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Envelope, WireError> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::ProtocolViolation("truncated frame payload".into())
        } else {
            WireError::Io(e)
        }
    })?;
    ciborium::from_reader(&buf[..]).map_err(|e| WireError::ProtocolViolation(e.to_string()))
}
