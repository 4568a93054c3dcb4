//! Crash-simulation helpers for tests
//!
//! These operate on closed files, the way a crash leaves them: a tail cut
//! mid-record, a flipped byte inside a record, or a record located by LSN so a
//! test can damage exactly that one.

use crate::format::{read_header, WalFile, WalRecord, WalRecordError};
use crate::wal::WalReader;
use quiver_core::platform::align_up;
use quiver_core::Lsn;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Location of one record inside a WAL file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    /// LSN of the record
    pub lsn: Lsn,
    /// Offset of the record header
    pub offset: u64,
    /// Encoded length (without padding)
    pub len: u64,
}

/// Remove the last `bytes` bytes of a file.
pub fn tear_tail(path: &Path, bytes: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(bytes))?;
    file.sync_all()
}

/// Truncate a file to exactly `len` bytes.
pub fn truncate_to(path: &Path, len: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()
}

/// XOR one byte at `offset` with `0xFF`.
pub fn corrupt_byte(path: &Path, offset: u64) -> std::io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut b = [0u8; 1];
    file.read_exact(&mut b)?;
    b[0] ^= 0xFF;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&b)?;
    file.sync_all()
}

/// Paths of every WAL file in `dir`, oldest first.
pub fn wal_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    Ok(WalReader::list_files(dir)?
        .into_iter()
        .map(|n| WalFile::file_path(dir, n))
        .collect())
}

/// Locate every valid record in one WAL file.
pub fn locate_records(path: &Path) -> std::io::Result<Vec<RecordLocation>> {
    let mut file = std::fs::File::open(path)?;
    let header = read_header(&mut file)?;
    let data = std::fs::read(path)?;
    let sector = header.sector_size as usize;
    let mut pos = sector;
    let mut out = Vec::new();
    while pos < data.len() {
        match WalRecord::decode(&data[pos..]) {
            Ok((record, consumed)) => {
                out.push(RecordLocation {
                    lsn: record.lsn,
                    offset: pos as u64,
                    len: consumed as u64,
                });
                pos += consumed;
            }
            Err(WalRecordError::Padding) => pos = align_up(pos + 1, sector),
            Err(_) => break,
        }
    }
    Ok(out)
}

/// Find the file and location of the record with `lsn`.
pub fn find_record(dir: &Path, lsn: Lsn) -> std::io::Result<Option<(PathBuf, RecordLocation)>> {
    for path in wal_files(dir)? {
        if let Some(loc) = locate_records(&path)?.into_iter().find(|l| l.lsn == lsn) {
            return Ok(Some((path, loc)));
        }
    }
    Ok(None)
}
