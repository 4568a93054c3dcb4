//! MANIFEST log
//!
//! The manifest is the durable list of live segments plus the checkpoint LSN
//! above which the WAL must be replayed. It is an append-only log of
//! transactions; each transaction is one checksummed frame, so a multi-edit
//! change (compaction outputs added, inputs removed, checkpoint advanced) is
//! applied entirely or not at all.
//!
//! # Format
//!
//! ```text
//! +--------------------+
//! | Magic: "QMAN"      | 4 bytes
//! | Format Version     | 4 bytes (u32 LE)
//! | Shard UUID         | 16 bytes
//! +--------------------+
//! | Frame length       | 4 bytes (u32 LE)   ┐
//! | Frame CRC32        | 4 bytes (u32 LE)   │ repeated
//! | MessagePack txn    | variable           ┘
//! +--------------------+
//! ```
//!
//! A frame that is short or fails its checksum ends the log; on open it is
//! truncated away. The log is periodically rewritten to a single snapshot
//! transaction with write-fsync-rename.

use crate::format::sync_dir;
use quiver_core::Lsn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// MANIFEST magic bytes: "QMAN"
pub const MANIFEST_MAGIC: [u8; 4] = *b"QMAN";

/// Current MANIFEST format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// File name of the manifest inside a shard directory
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

const HEADER_SIZE: usize = 24;
const FRAME_HEADER_SIZE: usize = 8;

/// Everything the manifest records about one live segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Segment id, unique within the shard
    pub id: u64,
    /// LSM level
    pub level: u32,
    /// Smallest key
    pub min_key: Vec<u8>,
    /// Largest key
    pub max_key: Vec<u8>,
    /// Smallest LSN covered
    pub min_lsn: Lsn,
    /// Largest LSN covered
    pub max_lsn: Lsn,
    /// Entry count, tombstones included
    pub entries: u64,
    /// Tombstone count
    pub tombstones: u64,
    /// File size in bytes
    pub file_size: u64,
}

impl SegmentDescriptor {
    /// Fraction of entries that are tombstones.
    pub fn tombstone_ratio(&self) -> f64 {
        if self.entries == 0 {
            0.0
        } else {
            self.tombstones as f64 / self.entries as f64
        }
    }

    /// Whether the key ranges of two segments intersect.
    pub fn overlaps(&self, other: &SegmentDescriptor) -> bool {
        self.min_key <= other.max_key && other.min_key <= self.max_key
    }

    /// Whether `key` falls inside this segment's key range.
    pub fn covers_key(&self, key: &[u8]) -> bool {
        self.min_key.as_slice() <= key && key <= self.max_key.as_slice()
    }
}

/// One change recorded by a manifest transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManifestEdit {
    /// A segment became live
    AddSegment(SegmentDescriptor),
    /// A segment stopped being live
    RemoveSegment {
        /// Segment id
        id: u64,
    },
    /// Everything at or below `lsn` is captured in live segments
    Checkpoint {
        /// Checkpoint LSN
        lsn: Lsn,
    },
    /// A segment failed verification and was moved aside. Its key range
    /// stays unreadable until a `Repaired` edit clears it.
    Quarantine {
        /// Descriptor of the segment as it was live
        segment: SegmentDescriptor,
        /// Why it was quarantined
        reason: String,
    },
    /// A quarantined key range was resupplied
    Repaired {
        /// Quarantined segment id
        id: u64,
    },
    /// Lower bound for the next allocated segment id
    NextSegmentId {
        /// Next id
        id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Transaction {
    seq: u64,
    edits: Vec<ManifestEdit>,
}

/// A segment moved aside after failing verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantinedSegment {
    /// Descriptor it had while live
    pub segment: SegmentDescriptor,
    /// Why it was quarantined
    pub reason: String,
}

/// State reconstructed by replaying the manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestState {
    /// Shard UUID from the header
    pub shard_uuid: [u8; 16],
    /// Live segments by id
    pub segments: BTreeMap<u64, SegmentDescriptor>,
    /// WAL records at or below this LSN are captured in segments
    pub checkpoint_lsn: Lsn,
    /// Next segment id to allocate
    pub next_segment_id: u64,
    /// Quarantined segments awaiting repair, by id
    pub quarantined: BTreeMap<u64, QuarantinedSegment>,
    /// Sequence number of the last applied transaction
    pub last_seq: u64,
}

impl ManifestState {
    fn apply(&mut self, edit: &ManifestEdit) {
        match edit {
            ManifestEdit::AddSegment(desc) => {
                self.next_segment_id = self.next_segment_id.max(desc.id + 1);
                self.segments.insert(desc.id, desc.clone());
            }
            ManifestEdit::RemoveSegment { id } => {
                self.segments.remove(id);
            }
            ManifestEdit::Checkpoint { lsn } => {
                self.checkpoint_lsn = self.checkpoint_lsn.max(*lsn);
            }
            ManifestEdit::Quarantine { segment, reason } => {
                self.segments.remove(&segment.id);
                self.quarantined.insert(
                    segment.id,
                    QuarantinedSegment {
                        segment: segment.clone(),
                        reason: reason.clone(),
                    },
                );
            }
            ManifestEdit::Repaired { id } => {
                self.quarantined.remove(id);
            }
            ManifestEdit::NextSegmentId { id } => {
                self.next_segment_id = self.next_segment_id.max(*id);
            }
        }
    }

    /// Edits that recreate this state from nothing.
    fn snapshot_edits(&self) -> Vec<ManifestEdit> {
        let mut edits = vec![
            ManifestEdit::NextSegmentId {
                id: self.next_segment_id,
            },
            ManifestEdit::Checkpoint {
                lsn: self.checkpoint_lsn,
            },
        ];
        edits.extend(self.segments.values().cloned().map(ManifestEdit::AddSegment));
        edits.extend(
            self.quarantined
                .values()
                .map(|q| ManifestEdit::Quarantine {
                    segment: q.segment.clone(),
                    reason: q.reason.clone(),
                }),
        );
        edits
    }

    /// Live segments at `level`, ordered by id.
    pub fn segments_at_level(&self, level: u32) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.values().filter(move |d| d.level == level)
    }
}

/// Errors that can occur with MANIFEST operations
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// MANIFEST file too short for its header
    #[error("MANIFEST too short")]
    TooShort,

    /// Invalid magic bytes
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unknown format version
    #[error("Unsupported MANIFEST version {0}")]
    UnsupportedVersion(u32),

    /// Transaction could not be encoded
    #[error("MANIFEST encode error: {0}")]
    Encode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append-only manifest with atomic multi-edit transactions.
pub struct ManifestLog {
    path: PathBuf,
    file: File,
    state: ManifestState,
    transactions_since_rewrite: usize,
}

impl ManifestLog {
    /// Open the manifest in `dir`, creating an empty one if absent.
    ///
    /// A torn final transaction is truncated away.
    pub fn open(dir: &Path) -> Result<Self, ManifestError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(MANIFEST_FILE_NAME);
        if !path.exists() {
            let uuid = *uuid::Uuid::new_v4().as_bytes();
            let state = ManifestState {
                shard_uuid: uuid,
                next_segment_id: 1,
                ..ManifestState::default()
            };
            write_snapshot_file(&path, &state)?;
            info!(target: "quiver::manifest", path = %path.display(), "Created MANIFEST");
        }

        let bytes = std::fs::read(&path)?;
        let (state, valid_end, transactions) = decode_log(&bytes)?;
        if valid_end < bytes.len() {
            warn!(
                target: "quiver::manifest",
                discarded_bytes = bytes.len() - valid_end,
                "Discarding torn MANIFEST transaction"
            );
            let f = OpenOptions::new().write(true).open(&path)?;
            f.set_len(valid_end as u64)?;
            f.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(&path)?;
        debug!(
            target: "quiver::manifest",
            segments = state.segments.len(),
            checkpoint_lsn = state.checkpoint_lsn,
            transactions,
            "Opened MANIFEST"
        );
        Ok(ManifestLog {
            path,
            file,
            state,
            transactions_since_rewrite: transactions,
        })
    }

    /// Read-only replay of the manifest at `path`.
    pub fn replay(path: &Path) -> Result<ManifestState, ManifestError> {
        let bytes = std::fs::read(path)?;
        decode_log(&bytes).map(|(state, _, _)| state)
    }

    /// Durably append one transaction, then apply it to the in-memory state.
    pub fn commit(&mut self, edits: Vec<ManifestEdit>) -> Result<(), ManifestError> {
        if edits.is_empty() {
            return Ok(());
        }
        let txn = Transaction {
            seq: self.state.last_seq + 1,
            edits,
        };
        let frame = encode_frame(&txn)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        for edit in &txn.edits {
            self.state.apply(edit);
        }
        self.state.last_seq = txn.seq;
        self.transactions_since_rewrite += 1;
        Ok(())
    }

    /// Replace the log with a single snapshot transaction (write-fsync-rename).
    pub fn rewrite(&mut self) -> Result<(), ManifestError> {
        write_snapshot_file(&self.path, &self.state)?;
        self.state.last_seq += 1;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.transactions_since_rewrite = 1;
        info!(
            target: "quiver::manifest",
            segments = self.state.segments.len(),
            checkpoint_lsn = self.state.checkpoint_lsn,
            "Rewrote MANIFEST"
        );
        Ok(())
    }

    /// Rewrite once the log holds more than `threshold` transactions.
    pub fn maybe_rewrite(&mut self, threshold: usize) -> Result<bool, ManifestError> {
        if self.transactions_since_rewrite > threshold {
            self.rewrite()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Allocate a segment id (persisted by the `AddSegment` that uses it).
    pub fn allocate_segment_id(&mut self) -> u64 {
        let id = self.state.next_segment_id.max(1);
        self.state.next_segment_id = id + 1;
        id
    }

    /// Current state.
    pub fn state(&self) -> &ManifestState {
        &self.state
    }

    /// Checkpoint LSN.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.state.checkpoint_lsn
    }

    /// Path of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_header(uuid: &[u8; 16]) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MANIFEST_MAGIC);
    header[4..8].copy_from_slice(&MANIFEST_FORMAT_VERSION.to_le_bytes());
    header[8..24].copy_from_slice(uuid);
    header
}

fn encode_frame(txn: &Transaction) -> Result<Vec<u8>, ManifestError> {
    let payload = rmp_serde::to_vec(txn).map_err(|e| ManifestError::Encode(e.to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode header and frames; returns state, end of the valid prefix and
/// number of transactions applied.
fn decode_log(bytes: &[u8]) -> Result<(ManifestState, usize, usize), ManifestError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ManifestError::TooShort);
    }
    if bytes[0..4] != MANIFEST_MAGIC {
        return Err(ManifestError::InvalidMagic);
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != MANIFEST_FORMAT_VERSION {
        return Err(ManifestError::UnsupportedVersion(version));
    }
    let mut state = ManifestState {
        next_segment_id: 1,
        ..ManifestState::default()
    };
    state.shard_uuid.copy_from_slice(&bytes[8..24]);

    let mut pos = HEADER_SIZE;
    let mut transactions = 0;
    while pos + FRAME_HEADER_SIZE <= bytes.len() {
        let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let crc = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]);
        let start = pos + FRAME_HEADER_SIZE;
        let Some(payload) = start.checked_add(len).and_then(|end| bytes.get(start..end)) else {
            break;
        };
        if crc32fast::hash(payload) != crc {
            break;
        }
        let Ok(txn) = rmp_serde::from_slice::<Transaction>(payload) else {
            break;
        };
        for edit in &txn.edits {
            state.apply(edit);
        }
        state.last_seq = txn.seq;
        transactions += 1;
        pos = start + len;
    }
    Ok((state, pos, transactions))
}

fn write_snapshot_file(path: &Path, state: &ManifestState) -> Result<(), ManifestError> {
    let temp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)?;
    file.write_all(&encode_header(&state.shard_uuid))?;
    let txn = Transaction {
        seq: state.last_seq + 1,
        edits: state.snapshot_edits(),
    };
    file.write_all(&encode_frame(&txn)?)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

impl From<ManifestError> for quiver_core::Error {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Io(io) => quiver_core::Error::Io(io),
            ManifestError::Encode(_) => quiver_core::Error::Internal(e.to_string()),
            other => quiver_core::Error::Corruption(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn desc(id: u64, level: u32, min: &str, max: &str) -> SegmentDescriptor {
        SegmentDescriptor {
            id,
            level,
            min_key: min.as_bytes().to_vec(),
            max_key: max.as_bytes().to_vec(),
            min_lsn: id * 10,
            max_lsn: id * 10 + 9,
            entries: 10,
            tombstones: 1,
            file_size: 4096,
        }
    }

    #[test]
    fn test_fresh_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = ManifestLog::open(dir.path()).unwrap();
        assert!(log.state().segments.is_empty());
        assert_eq!(log.checkpoint_lsn(), 0);
        assert_eq!(log.state().next_segment_id, 1);
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = ManifestLog::open(dir.path()).unwrap();
            log.commit(vec![
                ManifestEdit::AddSegment(desc(1, 0, "a", "m")),
                ManifestEdit::Checkpoint { lsn: 19 },
            ])
            .unwrap();
            log.commit(vec![ManifestEdit::AddSegment(desc(2, 0, "c", "z"))])
                .unwrap();
        }
        let log = ManifestLog::open(dir.path()).unwrap();
        assert_eq!(log.state().segments.len(), 2);
        assert_eq!(log.checkpoint_lsn(), 19);
        assert_eq!(log.state().next_segment_id, 3);
        assert_eq!(log.state().last_seq, 3);
    }

    #[test]
    fn test_torn_transaction_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        {
            let mut log = ManifestLog::open(dir.path()).unwrap();
            log.commit(vec![ManifestEdit::AddSegment(desc(1, 0, "a", "f"))])
                .unwrap();
        }
        let committed_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut log = ManifestLog::open(dir.path()).unwrap();
            // Compaction: replace 1 with 2 and 3 in one transaction.
            log.commit(vec![
                ManifestEdit::AddSegment(desc(2, 1, "a", "c")),
                ManifestEdit::AddSegment(desc(3, 1, "d", "f")),
                ManifestEdit::RemoveSegment { id: 1 },
                ManifestEdit::Checkpoint { lsn: 40 },
            ])
            .unwrap();
        }
        let full_len = std::fs::metadata(&path).unwrap().len();
        // Tear the second transaction at every possible point.
        for cut in committed_len..full_len {
            let bytes = std::fs::read(&path).unwrap();
            let torn_dir = TempDir::new().unwrap();
            std::fs::write(
                torn_dir.path().join(MANIFEST_FILE_NAME),
                &bytes[..cut as usize],
            )
            .unwrap();
            let log = ManifestLog::open(torn_dir.path()).unwrap();
            let ids: Vec<u64> = log.state().segments.keys().copied().collect();
            assert_eq!(ids, vec![1], "cut at {}", cut);
            assert_eq!(log.checkpoint_lsn(), 0);
        }
        let log = ManifestLog::open(dir.path()).unwrap();
        let ids: Vec<u64> = log.state().segments.keys().copied().collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_torn_tail_truncated_then_appendable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        {
            let mut log = ManifestLog::open(dir.path()).unwrap();
            log.commit(vec![ManifestEdit::Checkpoint { lsn: 5 }]).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        let mut log = ManifestLog::open(dir.path()).unwrap();
        log.commit(vec![ManifestEdit::Checkpoint { lsn: 8 }]).unwrap();
        drop(log);
        assert_eq!(ManifestLog::replay(&path).unwrap().checkpoint_lsn, 8);
    }

    #[test]
    fn test_rewrite_preserves_state() {
        let dir = TempDir::new().unwrap();
        let mut log = ManifestLog::open(dir.path()).unwrap();
        for id in 1..=5 {
            log.commit(vec![ManifestEdit::AddSegment(desc(id, 0, "a", "b"))])
                .unwrap();
        }
        log.commit(vec![
            ManifestEdit::RemoveSegment { id: 2 },
            ManifestEdit::Quarantine {
                segment: desc(4, 0, "a", "b"),
                reason: "crc".into(),
            },
            ManifestEdit::Checkpoint { lsn: 77 },
        ])
        .unwrap();
        let before = log.state().clone();
        assert!(log.maybe_rewrite(3).unwrap());
        drop(log);
        let after = ManifestLog::open(dir.path()).unwrap();
        assert_eq!(after.state().segments, before.segments);
        assert_eq!(after.state().quarantined, before.quarantined);
        assert_eq!(after.checkpoint_lsn(), 77);
        assert_eq!(after.state().next_segment_id, 6);
        assert_eq!(after.state().shard_uuid, before.shard_uuid);
    }

    #[test]
    fn test_quarantine_keeps_range_until_repaired() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = ManifestLog::open(dir.path()).unwrap();
            log.commit(vec![ManifestEdit::AddSegment(desc(1, 0, "c", "k"))])
                .unwrap();
            log.commit(vec![ManifestEdit::Quarantine {
                segment: desc(1, 0, "c", "k"),
                reason: "block crc".into(),
            }])
            .unwrap();
        }
        let mut log = ManifestLog::open(dir.path()).unwrap();
        assert!(log.state().segments.is_empty());
        let q = &log.state().quarantined[&1];
        assert_eq!(q.segment.min_key, b"c".to_vec());
        assert_eq!(q.segment.max_lsn, 19);
        assert_eq!(q.reason, "block crc");

        log.commit(vec![
            ManifestEdit::AddSegment(desc(2, 0, "c", "k")),
            ManifestEdit::Repaired { id: 1 },
        ])
        .unwrap();
        drop(log);
        let log = ManifestLog::open(dir.path()).unwrap();
        assert!(log.state().quarantined.is_empty());
        assert!(log.state().segments.contains_key(&2));
    }

    #[test]
    fn test_invalid_magic() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), [0u8; 32]).unwrap();
        assert!(matches!(
            ManifestLog::open(dir.path()),
            Err(ManifestError::InvalidMagic)
        ));
    }

    #[test]
    fn test_descriptor_overlap() {
        assert!(desc(1, 0, "a", "f").overlaps(&desc(2, 0, "f", "k")));
        assert!(!desc(1, 0, "a", "e").overlaps(&desc(2, 0, "f", "k")));
        assert!(desc(1, 0, "a", "e").covers_key(b"c"));
        assert!((desc(1, 0, "a", "e").tombstone_ratio() - 0.1).abs() < 1e-9);
    }
}
