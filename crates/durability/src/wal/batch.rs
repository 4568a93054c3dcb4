//! Group-commit accumulator.
//!
//! Appended records are packed back to back into one buffer. Sealing pads the
//! buffer with zeros up to the next sector boundary so the batch can be issued
//! as a single aligned write; the padding decodes as [`WalRecordError::Padding`].
//!
//! [`WalRecordError::Padding`]: crate::format::WalRecordError::Padding

use crate::format::WalRecord;
use quiver_core::platform::align_up;
use quiver_core::Lsn;

/// Start offset of one record inside a sealed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordBoundary {
    /// LSN of the record
    pub lsn: Lsn,
    /// Byte offset within the batch
    pub offset: u32,
}

/// Records waiting to be written.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    buf: Vec<u8>,
    boundaries: Vec<RecordBoundary>,
}

impl BatchAccumulator {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. LSNs must be pushed in increasing order.
    pub fn push(&mut self, record: &WalRecord) {
        debug_assert!(self
            .boundaries
            .last()
            .map_or(true, |last| last.lsn < record.lsn));
        self.boundaries.push(RecordBoundary {
            lsn: record.lsn,
            offset: self.buf.len() as u32,
        });
        record.encode_into(&mut self.buf);
    }

    /// Unpadded bytes buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    /// Records buffered.
    pub fn record_count(&self) -> usize {
        self.boundaries.len()
    }

    /// First buffered LSN.
    pub fn first_lsn(&self) -> Option<Lsn> {
        self.boundaries.first().map(|b| b.lsn)
    }

    /// Size the sealed batch would have.
    pub fn padded_len(&self, sector_size: usize) -> usize {
        align_up(self.buf.len(), sector_size)
    }

    /// Take the buffered records as one batch padded to `sector_size`.
    pub fn seal(&mut self, sector_size: usize) -> Option<SealedBatch> {
        if self.boundaries.is_empty() {
            return None;
        }
        let padded = self.padded_len(sector_size);
        let mut data = std::mem::take(&mut self.buf);
        data.resize(padded, 0);
        let boundaries = std::mem::take(&mut self.boundaries);
        Some(SealedBatch { data, boundaries })
    }

    /// Drop everything buffered, returning the LSNs that were discarded.
    pub fn discard(&mut self) -> Vec<Lsn> {
        self.buf.clear();
        self.boundaries.drain(..).map(|b| b.lsn).collect()
    }
}

/// A sector-aligned group of records ready for one physical write.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    /// Encoded records followed by zero padding
    pub data: Vec<u8>,
    /// Per-record LSN boundaries, in order
    pub boundaries: Vec<RecordBoundary>,
}

impl SealedBatch {
    /// First LSN in the batch.
    pub fn first_lsn(&self) -> Lsn {
        self.boundaries.first().map_or(0, |b| b.lsn)
    }

    /// Last LSN in the batch.
    pub fn last_lsn(&self) -> Lsn {
        self.boundaries.last().map_or(0, |b| b.lsn)
    }
}
