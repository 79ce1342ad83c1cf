//! Sealed store records.
//!
//! Every value a store writes (operations and snapshots) goes through the
//! same envelope:
//! ```text
//! ┌──────┬──────────┬──────────┬─────────────────────────────┐
//! │ kind │ seq      │ checksum │ body (LZ4, size-prepended)  │
//! │ 1 B  │ varint   │ u32      │ bincode(serde value)        │
//! └──────┴──────────┴──────────┴─────────────────────────────┘
//! ```
//! The checksum covers kind, seq and the compressed body, so a torn or
//! bit-flipped record is reported as [`StoreError::Corrupted`] instead of
//! silently decoding into a different operation.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::protocol::Seq;

/// What a record holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordKind {
    Operation = 1,
    Snapshot = 2,
}

/// Checksummed, compressed envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    kind: RecordKind,
    seq: Seq,
    checksum: u32,
    body: Vec<u8>,
}

/// FNV-1a over the record header and body.
fn checksum(kind: RecordKind, seq: Seq, body: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET;
    let header = [kind as u8];
    for byte in header.iter().chain(seq.to_le_bytes().iter()).chain(body.iter()) {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Encode `value` into a sealed record.
pub fn seal<T: Serialize>(kind: RecordKind, seq: Seq, value: &T) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let body = lz4_flex::compress_prepend_size(&raw);
    let record = Record {
        kind,
        seq,
        checksum: checksum(kind, seq, &body),
        body,
    };
    bincode::serde::encode_to_vec(&record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Verify and decode a sealed record of the expected kind.
pub fn open<T: DeserializeOwned>(kind: RecordKind, bytes: &[u8]) -> Result<(Seq, T), StoreError> {
    let (record, _): (Record, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    if record.kind != kind || record.checksum != checksum(record.kind, record.seq, &record.body) {
        return Err(StoreError::Corrupted { seq: record.seq });
    }
    let raw = lz4_flex::decompress_size_prepended(&record.body)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok((record.seq, value))
}

/// Compressed size over raw size for a value (diagnostics and benches).
pub fn compression_ratio<T: Serialize>(value: &T) -> Result<f64, StoreError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    if raw.is_empty() {
        return Ok(1.0);
    }
    let compressed = lz4_flex::compress_prepend_size(&raw);
    Ok(raw.len() as f64 / compressed.len() as f64)
}
