//! Stored values.
//!
//! A key maps either to a [`VectorRecord`] (full-precision embedding plus opaque
//! metadata bytes) or to a tombstone. The binary encoding below is shared by WAL
//! payloads and segment entries.
//!
//! # Record encoding
//!
//! ```text
//! ┌──────────────┬─────────────────────┬───────────────┬──────────────────┐
//! │ dim (u32 LE) │ f32 LE × dim        │ meta_len (u32)│ metadata bytes   │
//! └──────────────┴─────────────────────┴───────────────┴──────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance metric used for search. Lower distance means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Squared Euclidean distance
    #[default]
    Euclidean,
    /// `1 - cosine similarity`
    Cosine,
    /// Negated inner product
    DotProduct,
}

impl DistanceMetric {
    /// Stable byte tag used in on-disk headers.
    pub fn to_byte(self) -> u8 {
        match self {
            DistanceMetric::Euclidean => 0,
            DistanceMetric::Cosine => 1,
            DistanceMetric::DotProduct => 2,
        }
    }

    /// Parse an on-disk byte tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DistanceMetric::Euclidean),
            1 => Some(DistanceMetric::Cosine),
            2 => Some(DistanceMetric::DotProduct),
            _ => None,
        }
    }
}

/// A full-precision vector with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Embedding values
    pub vector: Vec<f32>,
    /// Opaque caller metadata
    pub metadata: Vec<u8>,
}

impl VectorRecord {
    /// Create a record.
    pub fn new(vector: Vec<f32>, metadata: Vec<u8>) -> Self {
        VectorRecord { vector, metadata }
    }

    /// Record without metadata.
    pub fn from_vector(vector: Vec<f32>) -> Self {
        VectorRecord {
            vector,
            metadata: Vec::new(),
        }
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Size of [`VectorRecord::encode`] output.
    pub fn encoded_len(&self) -> usize {
        4 + self.vector.len() * 4 + 4 + self.metadata.len()
    }

    /// Serialize into the shared record encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoding to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.vector.len() as u32).to_le_bytes());
        for x in &self.vector {
            buf.extend_from_slice(&x.to_le_bytes());
        }
        buf.extend_from_slice(&(self.metadata.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.metadata);
    }

    /// Deserialize from the shared record encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, ValueDecodeError> {
        let dim = read_u32(bytes, 0)? as usize;
        let vec_end = 4usize
            .checked_add(dim.checked_mul(4).ok_or(ValueDecodeError::Truncated)?)
            .ok_or(ValueDecodeError::Truncated)?;
        if bytes.len() < vec_end {
            return Err(ValueDecodeError::Truncated);
        }
        let vector = bytes[4..vec_end]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let meta_len = read_u32(bytes, vec_end)? as usize;
        let meta_start = vec_end + 4;
        let meta_end = meta_start
            .checked_add(meta_len)
            .ok_or(ValueDecodeError::Truncated)?;
        if bytes.len() < meta_end {
            return Err(ValueDecodeError::Truncated);
        }
        if bytes.len() != meta_end {
            return Err(ValueDecodeError::TrailingBytes(bytes.len() - meta_end));
        }
        Ok(VectorRecord {
            vector,
            metadata: bytes[meta_start..meta_end].to_vec(),
        })
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, ValueDecodeError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or(ValueDecodeError::Truncated)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

/// Value-or-tombstone stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Live record
    Record(VectorRecord),
    /// Deletion marker
    Tombstone,
}

impl Value {
    /// Whether this is a deletion marker.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    /// Live record, if any.
    pub fn as_record(&self) -> Option<&VectorRecord> {
        match self {
            Value::Record(r) => Some(r),
            Value::Tombstone => None,
        }
    }

    /// Consume into the live record, if any.
    pub fn into_record(self) -> Option<VectorRecord> {
        match self {
            Value::Record(r) => Some(r),
            Value::Tombstone => None,
        }
    }

    /// Approximate in-memory footprint, used for flush accounting.
    pub fn approximate_size(&self) -> usize {
        match self {
            Value::Record(r) => r.encoded_len(),
            Value::Tombstone => 1,
        }
    }
}

/// A value paired with the LSN that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue {
    /// Value or tombstone
    pub value: Value,
    /// LSN of the mutation
    pub lsn: crate::types::Lsn,
}

/// Record decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueDecodeError {
    /// Input ended early
    #[error("Truncated vector record")]
    Truncated,
    /// Extra bytes after the record
    #[error("Vector record has {0} trailing bytes")]
    TrailingBytes(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip_with_metadata() {
        let record = VectorRecord::new(vec![1.5, -2.0, 0.25], b"tag=a".to_vec());
        let bytes = record.encode();
        assert_eq!(bytes.len(), record.encoded_len());
        assert_eq!(VectorRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_decode_truncated() {
        let record = VectorRecord::from_vector(vec![1.0; 8]);
        let bytes = record.encode();
        assert_eq!(
            VectorRecord::decode(&bytes[..bytes.len() - 1]),
            Err(ValueDecodeError::Truncated)
        );
        assert_eq!(VectorRecord::decode(&[1, 0]), Err(ValueDecodeError::Truncated));
    }

    #[test]
    fn test_record_decode_huge_dimension_does_not_overflow() {
        let bytes = u32::MAX.to_le_bytes();
        assert_eq!(VectorRecord::decode(&bytes), Err(ValueDecodeError::Truncated));
    }

    #[test]
    fn test_metric_byte_tags() {
        for m in [
            DistanceMetric::Euclidean,
            DistanceMetric::Cosine,
            DistanceMetric::DotProduct,
        ] {
            assert_eq!(DistanceMetric::from_byte(m.to_byte()), Some(m));
        }
        assert_eq!(DistanceMetric::from_byte(9), None);
    }

    #[test]
    fn test_tombstone_helpers() {
        assert!(Value::Tombstone.is_tombstone());
        assert!(Value::Tombstone.as_record().is_none());
        let v = Value::Record(VectorRecord::from_vector(vec![1.0]));
        assert!(!v.is_tombstone());
        assert_eq!(v.into_record().unwrap().dimension(), 1);
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_arbitrary_bytes_never_panics(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)) {
            let _ = VectorRecord::decode(&bytes);
        }
    }
}
