//! WAL file and record format.
//!
//! WAL files are named `wal-NNNNNN.log` where `NNNNNN` is a zero-padded file number.
//!
//! # File Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ File Header (one sector)           │
//! ├────────────────────────────────────┤
//! │ Batch 1 (records, zero padded)     │  ← every batch starts on a sector boundary
//! ├────────────────────────────────────┤
//! │ Batch 2                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬─────────────┬─────────────────┬──────────┐
//! │ LSN (8)  │ Kind (1)│ Rsvd (1) │ KeyLen (2)  │ PayloadLen (4)  │ CRC32 (4)│
//! └──────────┴─────────┴──────────┴─────────────┴─────────────────┴──────────┘
//! followed by key bytes and payload bytes
//! ```
//!
//! The CRC covers the first 16 header bytes, the key and the payload. A header
//! whose LSN is zero is padding: LSNs start at 1.

use crc32fast::Hasher;
use quiver_core::{CommandKind, Key, Lsn, Value, VectorRecord};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a WAL file: "QWAL"
pub const WAL_MAGIC: [u8; 4] = *b"QWAL";

/// Current WAL format version
pub const WAL_FORMAT_VERSION: u32 = 1;

/// Encoded size of [`WalFileHeader`]; the header occupies a full sector on disk
pub const WAL_FILE_HEADER_SIZE: usize = 48;

/// Fixed record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 20;

/// WAL file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFileHeader {
    /// Magic bytes: "QWAL"
    pub magic: [u8; 4],
    /// Format version
    pub format_version: u32,
    /// File number (monotonically increasing)
    pub file_number: u64,
    /// Shard UUID, shared by every file of one shard
    pub shard_uuid: [u8; 16],
    /// Sector size the file was written with
    pub sector_size: u32,
    /// First LSN that may appear in this file
    pub first_lsn: Lsn,
}

impl WalFileHeader {
    /// Create a new file header.
    pub fn new(file_number: u64, shard_uuid: [u8; 16], sector_size: u32, first_lsn: Lsn) -> Self {
        WalFileHeader {
            magic: WAL_MAGIC,
            format_version: WAL_FORMAT_VERSION,
            file_number,
            shard_uuid,
            sector_size,
            first_lsn,
        }
    }

    /// Serialize header to bytes (CRC in the last four bytes).
    pub fn to_bytes(&self) -> [u8; WAL_FILE_HEADER_SIZE] {
        let mut bytes = [0u8; WAL_FILE_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.file_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.shard_uuid);
        bytes[32..36].copy_from_slice(&self.sector_size.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.first_lsn.to_le_bytes());
        let crc = crc32fast::hash(&bytes[0..44]);
        bytes[44..48].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize and validate header bytes.
    pub fn from_bytes(bytes: &[u8; WAL_FILE_HEADER_SIZE]) -> Result<Self, WalRecordError> {
        let expected = u32::from_le_bytes([bytes[44], bytes[45], bytes[46], bytes[47]]);
        let computed = crc32fast::hash(&bytes[0..44]);
        if expected != computed {
            return Err(WalRecordError::ChecksumMismatch { expected, computed });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != WAL_MAGIC {
            return Err(WalRecordError::InvalidFormat("bad WAL magic"));
        }
        let format_version = le_u32(&bytes[4..8]);
        if format_version != WAL_FORMAT_VERSION {
            return Err(WalRecordError::UnsupportedVersion(format_version));
        }
        let mut shard_uuid = [0u8; 16];
        shard_uuid.copy_from_slice(&bytes[16..32]);
        Ok(WalFileHeader {
            magic,
            format_version,
            file_number: le_u64(&bytes[8..16]),
            shard_uuid,
            sector_size: le_u32(&bytes[32..36]),
            first_lsn: le_u64(&bytes[36..44]),
        })
    }
}

/// A single logged mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Mutation kind (`Upsert` or `Delete`)
    pub kind: CommandKind,
    /// Target key
    pub key: Key,
    /// Encoded [`VectorRecord`] for upserts, empty for deletes
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Upsert record.
    pub fn upsert(lsn: Lsn, key: Key, record: &VectorRecord) -> Self {
        WalRecord {
            lsn,
            kind: CommandKind::Upsert,
            key,
            payload: record.encode(),
        }
    }

    /// Delete record.
    pub fn delete(lsn: Lsn, key: Key) -> Self {
        WalRecord {
            lsn,
            kind: CommandKind::Delete,
            key,
            payload: Vec::new(),
        }
    }

    /// Encoded size without padding.
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.len() + self.payload.len()
    }

    /// Append the encoded record to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.push(self.kind.as_byte());
        buf.push(0);
        buf.extend_from_slice(&(self.key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&buf[start..start + 16]);
        hasher.update(self.key.as_bytes());
        hasher.update(&self.payload);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Serialize to a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Parse one record from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), WalRecordError> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(WalRecordError::InsufficientData);
        }
        let lsn = le_u64(&bytes[0..8]);
        if lsn == 0 {
            return Err(WalRecordError::Padding);
        }
        let kind = CommandKind::from_byte(bytes[8])
            .filter(|k| k.is_mutation())
            .ok_or(WalRecordError::InvalidFormat("unknown record kind"))?;
        let key_len = u16::from_le_bytes([bytes[10], bytes[11]]) as usize;
        let payload_len = le_u32(&bytes[12..16]) as usize;
        let expected = le_u32(&bytes[16..20]);

        let total = RECORD_HEADER_SIZE + key_len + payload_len;
        if bytes.len() < total {
            return Err(WalRecordError::InsufficientData);
        }
        let key_bytes = &bytes[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_len];
        let payload = &bytes[RECORD_HEADER_SIZE + key_len..total];

        let mut hasher = Hasher::new();
        hasher.update(&bytes[0..16]);
        hasher.update(key_bytes);
        hasher.update(payload);
        let computed = hasher.finalize();
        if expected != computed {
            return Err(WalRecordError::ChecksumMismatch { expected, computed });
        }

        Ok((
            WalRecord {
                lsn,
                kind,
                key: Key::new(key_bytes),
                payload: payload.to_vec(),
            },
            total,
        ))
    }

    /// Decode the payload into the value it logs.
    pub fn value(&self) -> Result<Value, WalRecordError> {
        match self.kind {
            CommandKind::Delete => Ok(Value::Tombstone),
            CommandKind::Upsert => VectorRecord::decode(&self.payload)
                .map(Value::Record)
                .map_err(|_| WalRecordError::InvalidFormat("undecodable upsert payload")),
            _ => Err(WalRecordError::InvalidFormat("non-mutation record")),
        }
    }
}

/// WAL file handle used by the writer.
pub struct WalFile {
    file: File,
    file_number: u64,
    path: PathBuf,
    header: WalFileHeader,
}

impl WalFile {
    /// Path of WAL file `file_number` in `dir`.
    pub fn file_path(dir: &Path, file_number: u64) -> PathBuf {
        dir.join(format!("wal-{:06}.log", file_number))
    }

    /// Parse a file number out of a WAL file name.
    pub fn parse_file_number(name: &str) -> Option<u64> {
        name.strip_prefix("wal-")?
            .strip_suffix(".log")?
            .parse()
            .ok()
    }

    /// Create a new WAL file with its header sector, synced.
    pub fn create(
        dir: &Path,
        file_number: u64,
        shard_uuid: [u8; 16],
        sector_size: usize,
        first_lsn: Lsn,
    ) -> std::io::Result<Self> {
        let path = Self::file_path(dir, file_number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let header = WalFileHeader::new(file_number, shard_uuid, sector_size as u32, first_lsn);
        let mut sector = vec![0u8; sector_size];
        sector[..WAL_FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        file.write_all(&sector)?;
        file.sync_all()?;
        sync_dir(dir)?;
        Ok(WalFile {
            file,
            file_number,
            path,
            header,
        })
    }

    /// Open an existing WAL file for appending.
    pub fn open_append(dir: &Path, file_number: u64) -> std::io::Result<Self> {
        let path = Self::file_path(dir, file_number);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = read_header(&mut file)?;
        if header.file_number != file_number {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "WAL file number mismatch: expected {}, got {}",
                    file_number, header.file_number
                ),
            ));
        }
        Ok(WalFile {
            file,
            file_number,
            path,
            header,
        })
    }

    /// File number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Header.
    pub fn header(&self) -> &WalFileHeader {
        &self.header
    }

    /// Path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length on disk.
    pub fn len(&self) -> std::io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Whether the file holds no bytes (never true once created).
    pub fn is_empty(&self) -> std::io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Underlying handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Duplicate the handle for an I/O driver.
    pub fn try_clone_file(&self) -> std::io::Result<File> {
        self.file.try_clone()
    }
}

/// Read and validate the header of an open WAL file.
pub fn read_header(file: &mut File) -> std::io::Result<WalFileHeader> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = [0u8; WAL_FILE_HEADER_SIZE];
    file.read_exact(&mut bytes)?;
    WalFileHeader::from_bytes(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// fsync a directory so that created, renamed or removed entries persist.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// WAL format errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalRecordError {
    /// Not enough bytes for a complete record
    #[error("Insufficient data for WAL record")]
    InsufficientData,

    /// Zeroed header: batch padding rather than a record
    #[error("Padding")]
    Padding,

    /// Structurally invalid record
    #[error("Invalid WAL record format: {0}")]
    InvalidFormat(&'static str),

    /// CRC mismatch
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// CRC stored in the record
        expected: u32,
        /// CRC computed over the bytes read
        computed: u32,
    },

    /// Unknown format version
    #[error("Unsupported WAL format version: {0}")]
    UnsupportedVersion(u32),
}
