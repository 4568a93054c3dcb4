//! WAL reader for recovery and replay.
//!
//! Records are validated one at a time. In the final WAL file the first invalid
//! record (bad checksum, short read, LSN discontinuity) marks the torn tail:
//! everything from there on is treated as absent. The same condition in any
//! earlier file is mid-log corruption and is reported as an error.
//!
//! A bad record is only a torn tail if nothing valid follows it. Past a bad
//! record the reader checks the position its header claims the next record
//! starts at, then every later sector boundary (where each batch starts); a
//! record there with a valid checksum and a later LSN means acknowledged
//! writes sit behind the damage, and the file is reported as corrupt rather
//! than truncated.

use crate::format::{
    WalFile, WalFileHeader, WalRecord, WalRecordError, RECORD_HEADER_SIZE, WAL_FILE_HEADER_SIZE,
};
use quiver_core::platform::align_up;
use quiver_core::Lsn;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Why reading a file stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Reached the end of the file cleanly
    EndOfFile,
    /// A record failed to decode at `offset`
    InvalidRecord {
        /// File offset of the bad record
        offset: u64,
        /// Decoding failure
        error: WalRecordError,
    },
    /// A valid record carried an unexpected LSN
    LsnDiscontinuity {
        /// File offset of the record
        offset: u64,
        /// LSN that should have come next
        expected: Lsn,
        /// LSN found
        found: Lsn,
    },
    /// A record failed to decode but valid records follow it
    ValidRecordsFollow {
        /// File offset of the bad record
        offset: u64,
        /// Decoding failure
        error: WalRecordError,
        /// File offset of the first valid record past it
        next_offset: u64,
        /// LSN of that record
        next_lsn: Lsn,
    },
    /// The file header itself is unreadable
    InvalidHeader,
}

impl ReadStopReason {
    /// Whether the file ended without a torn or inconsistent suffix.
    pub fn is_clean(&self) -> bool {
        matches!(self, ReadStopReason::EndOfFile)
    }

    /// Whether this stop may be a torn final write, safe to truncate when it
    /// is in the last file.
    pub fn may_be_torn_tail(&self) -> bool {
        !matches!(self, ReadStopReason::ValidRecordsFollow { .. })
    }

    fn offset(&self) -> u64 {
        match self {
            ReadStopReason::InvalidRecord { offset, .. }
            | ReadStopReason::LsnDiscontinuity { offset, .. }
            | ReadStopReason::ValidRecordsFollow { offset, .. } => *offset,
            ReadStopReason::EndOfFile | ReadStopReason::InvalidHeader => 0,
        }
    }

    fn into_mid_log(self, file_number: u64) -> WalReaderError {
        WalReaderError::MidLogCorruption {
            file_number,
            offset: self.offset(),
            reason: format!("{:?}", self),
        }
    }
}

/// Result of scanning one WAL file.
#[derive(Debug, Clone)]
pub struct WalFileInfo {
    /// File number
    pub file_number: u64,
    /// Path on disk
    pub path: PathBuf,
    /// Parsed header, absent when unreadable
    pub header: Option<WalFileHeader>,
    /// LSN of the first valid record
    pub first_record_lsn: Option<Lsn>,
    /// LSN of the last valid record
    pub last_record_lsn: Option<Lsn>,
    /// Offset just past the last valid record
    pub valid_end: u64,
    /// File length on disk
    pub file_len: u64,
    /// Why reading stopped
    pub stop: ReadStopReason,
}

impl WalFileInfo {
    /// Sector size recorded in the header.
    pub fn sector_size(&self) -> Option<usize> {
        self.header.map(|h| h.sector_size as usize)
    }

    /// Next LSN this file expects: one past its last record, or its header's first LSN.
    pub fn next_lsn(&self) -> Option<Lsn> {
        match (self.last_record_lsn, self.header) {
            (Some(last), _) => Some(last + 1),
            (None, Some(h)) => Some(h.first_lsn),
            (None, None) => None,
        }
    }
}

/// All WAL files of a shard, in order.
#[derive(Debug, Clone, Default)]
pub struct WalLayout {
    /// Files sorted by number
    pub files: Vec<WalFileInfo>,
}

impl WalLayout {
    /// Highest valid LSN in the log (0 when empty).
    pub fn last_lsn(&self) -> Lsn {
        self.files
            .iter()
            .filter_map(|f| f.last_record_lsn)
            .max()
            .unwrap_or(0)
    }

    /// LSN the next append should receive.
    pub fn next_lsn(&self) -> Option<Lsn> {
        self.files.last().and_then(|f| f.next_lsn())
    }

    /// The final file, which is the only one that may carry a torn tail.
    pub fn last_file(&self) -> Option<&WalFileInfo> {
        self.files.last()
    }

    /// Shard UUID from the first readable header.
    pub fn shard_uuid(&self) -> Option<[u8; 16]> {
        self.files.iter().find_map(|f| f.header.map(|h| h.shard_uuid))
    }
}

/// Reader errors.
#[derive(Debug, thiserror::Error)]
pub enum WalReaderError {
    /// I/O error
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header of a non-final file is unreadable
    #[error("WAL file {file_number} has an invalid header")]
    InvalidHeader {
        /// File number
        file_number: u64,
    },

    /// Invalid record followed by more log
    #[error("WAL file {file_number} is corrupt at offset {offset}: {reason}")]
    MidLogCorruption {
        /// File number
        file_number: u64,
        /// Offset of the bad record
        offset: u64,
        /// Description
        reason: String,
    },

    /// Log records needed for replay are missing
    #[error("WAL is missing records: expected LSN {expected}, found {found}")]
    MissingRange {
        /// LSN that should be present
        expected: Lsn,
        /// LSN that was found instead
        found: Lsn,
    },
}

enum Step {
    Record(WalRecord),
    End(ReadStopReason),
}

/// Sequential decoder over the bytes of one file.
struct FileCursor {
    data: Vec<u8>,
    pos: usize,
    sector_size: usize,
    expected_next: Lsn,
    valid_end: usize,
}

impl FileCursor {
    fn new(data: Vec<u8>, header: &WalFileHeader) -> Self {
        let sector_size = header.sector_size as usize;
        let start = sector_size.min(data.len());
        FileCursor {
            data,
            pos: start,
            sector_size,
            expected_next: header.first_lsn,
            valid_end: start,
        }
    }

    fn next_step(&mut self) -> Step {
        loop {
            if self.pos >= self.data.len() {
                return Step::End(ReadStopReason::EndOfFile);
            }
            let lsn_end = (self.pos + 8).min(self.data.len());
            if self.data[self.pos..lsn_end].iter().all(|b| *b == 0) {
                self.pos = align_up(self.pos + 1, self.sector_size);
                continue;
            }
            match WalRecord::decode(&self.data[self.pos..]) {
                Ok((record, consumed)) => {
                    if record.lsn != self.expected_next {
                        return Step::End(ReadStopReason::LsnDiscontinuity {
                            offset: self.pos as u64,
                            expected: self.expected_next,
                            found: record.lsn,
                        });
                    }
                    self.expected_next = record.lsn + 1;
                    self.pos += consumed;
                    self.valid_end = self.pos;
                    return Step::Record(record);
                }
                Err(WalRecordError::Padding) => {
                    self.pos = align_up(self.pos + 1, self.sector_size);
                }
                Err(error) => {
                    let offset = self.pos as u64;
                    return Step::End(match self.valid_record_after(self.pos) {
                        Some((next_offset, next_lsn)) => ReadStopReason::ValidRecordsFollow {
                            offset,
                            error,
                            next_offset: next_offset as u64,
                            next_lsn,
                        },
                        None => ReadStopReason::InvalidRecord { offset, error },
                    });
                }
            }
        }
    }

    /// First valid record past the bad one at `bad`, with an LSN at or past
    /// the one the bad record should have carried.
    fn valid_record_after(&self, bad: usize) -> Option<(usize, Lsn)> {
        let declared = declared_record_len(&self.data[bad..]).map(|len| bad + len);
        let boundaries = (align_up(bad + 1, self.sector_size)..self.data.len()).step_by(self.sector_size.max(1));
        declared
            .into_iter()
            .chain(boundaries)
            .find_map(|pos| match WalRecord::decode(self.data.get(pos..)?) {
                Ok((record, _)) if record.lsn >= self.expected_next => Some((pos, record.lsn)),
                _ => None,
            })
    }
}

/// Encoded length a record header claims, if the header is all there.
fn declared_record_len(data: &[u8]) -> Option<usize> {
    let header = data.get(..RECORD_HEADER_SIZE)?;
    let key_len = u16::from_le_bytes([header[10], header[11]]) as usize;
    let payload_len = u32::from_le_bytes([header[12], header[13], header[14], header[15]]) as usize;
    Some(RECORD_HEADER_SIZE + key_len + payload_len)
}

fn parse_header(data: &[u8]) -> Option<WalFileHeader> {
    let bytes: &[u8; WAL_FILE_HEADER_SIZE] = data.get(..WAL_FILE_HEADER_SIZE)?.try_into().ok()?;
    WalFileHeader::from_bytes(bytes).ok()
}

/// WAL reader over the files in one directory.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Reader for `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        WalReader { dir: dir.into() }
    }

    /// Sorted WAL file numbers in `dir`.
    pub fn list_files(dir: &Path) -> std::io::Result<Vec<u64>> {
        let mut numbers = Vec::new();
        if !dir.exists() {
            return Ok(numbers);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(n) = entry
                .file_name()
                .to_str()
                .and_then(WalFile::parse_file_number)
            {
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Validate every file and report where valid data ends.
    ///
    /// Fails on corruption anywhere but the final file's tail.
    pub fn scan(&self) -> Result<WalLayout, WalReaderError> {
        let numbers = Self::list_files(&self.dir)?;
        let mut layout = WalLayout::default();
        let count = numbers.len();

        for (i, file_number) in numbers.into_iter().enumerate() {
            let is_last = i + 1 == count;
            let path = WalFile::file_path(&self.dir, file_number);
            let data = std::fs::read(&path)?;
            let file_len = data.len() as u64;

            let header = match parse_header(&data) {
                Some(h) if h.file_number == file_number => h,
                _ if is_last => {
                    layout.files.push(WalFileInfo {
                        file_number,
                        path,
                        header: None,
                        first_record_lsn: None,
                        last_record_lsn: None,
                        valid_end: 0,
                        file_len,
                        stop: ReadStopReason::InvalidHeader,
                    });
                    break;
                }
                _ => return Err(WalReaderError::InvalidHeader { file_number }),
            };

            if let Some(expected) = layout.next_lsn() {
                if header.first_lsn != expected {
                    return Err(WalReaderError::MissingRange {
                        expected,
                        found: header.first_lsn,
                    });
                }
            }

            let mut cursor = FileCursor::new(data, &header);
            let mut first = None;
            let mut last = None;
            let stop = loop {
                match cursor.next_step() {
                    Step::Record(r) => {
                        first.get_or_insert(r.lsn);
                        last = Some(r.lsn);
                    }
                    Step::End(reason) => break reason,
                }
            };

            if !stop.is_clean() && (!is_last || !stop.may_be_torn_tail()) {
                return Err(stop.into_mid_log(file_number));
            }

            debug!(
                target: "quiver::wal",
                file_number,
                first_lsn = ?first,
                last_lsn = ?last,
                valid_end = cursor.valid_end,
                clean = stop.is_clean(),
                "Scanned WAL file"
            );

            layout.files.push(WalFileInfo {
                file_number,
                path,
                header: Some(header),
                first_record_lsn: first,
                last_record_lsn: last,
                valid_end: cursor.valid_end as u64,
                file_len,
                stop,
            });
        }
        Ok(layout)
    }

    /// Lazily replay every record with LSN greater than `from_lsn`.
    ///
    /// Records come back in LSN order. Iteration ends quietly at the torn tail
    /// of the final file.
    pub fn replay(&self, from_lsn: Lsn) -> Result<WalReplay, WalReaderError> {
        let numbers = Self::list_files(&self.dir)?;
        Ok(WalReplay {
            dir: self.dir.clone(),
            last_file: numbers.last().copied(),
            files: numbers.into(),
            from_lsn,
            current: None,
            expected_next: None,
            finished: false,
            stop: None,
        })
    }

    /// Eagerly collect [`WalReader::replay`].
    pub fn read_all(&self, from_lsn: Lsn) -> Result<Vec<WalRecord>, WalReaderError> {
        self.replay(from_lsn)?.collect()
    }
}

/// Lazy record sequence produced by [`WalReader::replay`].
pub struct WalReplay {
    dir: PathBuf,
    files: VecDeque<u64>,
    last_file: Option<u64>,
    from_lsn: Lsn,
    current: Option<(u64, FileCursor)>,
    expected_next: Option<Lsn>,
    finished: bool,
    stop: Option<ReadStopReason>,
}

impl WalReplay {
    /// Why the final file stopped, once iteration has finished.
    pub fn stop_reason(&self) -> Option<&ReadStopReason> {
        self.stop.as_ref()
    }

    fn open_next(&mut self) -> Result<bool, WalReaderError> {
        let Some(file_number) = self.files.pop_front() else {
            return Ok(false);
        };
        let is_last = Some(file_number) == self.last_file;
        let data = std::fs::read(WalFile::file_path(&self.dir, file_number))?;
        let header = match parse_header(&data) {
            Some(h) if h.file_number == file_number => h,
            _ if is_last => {
                self.stop = Some(ReadStopReason::InvalidHeader);
                return Ok(false);
            }
            _ => return Err(WalReaderError::InvalidHeader { file_number }),
        };
        match self.expected_next {
            Some(expected) if header.first_lsn != expected => {
                return Err(WalReaderError::MissingRange {
                    expected,
                    found: header.first_lsn,
                });
            }
            None if header.first_lsn > self.from_lsn + 1 => {
                return Err(WalReaderError::MissingRange {
                    expected: self.from_lsn + 1,
                    found: header.first_lsn,
                });
            }
            _ => {}
        }
        self.expected_next = Some(header.first_lsn);
        self.current = Some((file_number, FileCursor::new(data, &header)));
        Ok(true)
    }
}

impl Iterator for WalReplay {
    type Item = Result<WalRecord, WalReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.current.is_none() {
                match self.open_next() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.finished = true;
                        return None;
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
            let Some((file_number, cursor)) = self.current.as_mut() else {
                continue;
            };
            match cursor.next_step() {
                Step::Record(record) => {
                    self.expected_next = Some(record.lsn + 1);
                    if record.lsn > self.from_lsn {
                        return Some(Ok(record));
                    }
                }
                Step::End(reason) => {
                    let file_number = *file_number;
                    self.current = None;
                    if reason.is_clean() {
                        continue;
                    }
                    self.finished = true;
                    if Some(file_number) == self.last_file && reason.may_be_torn_tail() {
                        self.stop = Some(reason);
                        return None;
                    }
                    return Some(Err(reason.into_mid_log(file_number)));
                }
            }
        }
    }
}
