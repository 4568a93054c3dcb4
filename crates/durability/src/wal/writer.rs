//! Group-commit WAL writer.
//!
//! `append` assigns the next LSN and buffers the record synchronously.
//! `submit` seals buffered records into one sector-aligned batch and hands it
//! to the [`IoDriver`]. Completions may arrive in any order, but
//! [`Wal::durable_lsn`] only ever advances over a contiguous prefix of batches,
//! so a later append is never reported durable before an earlier one.

use super::batch::BatchAccumulator;
use super::config::{WalConfig, WalConfigError};
use super::io::{BatchId, Completion, IoDriver, WriteRequest};
use super::reader::{WalLayout, WalReaderError};
use crate::format::{sync_dir, WalFile, WalRecord};
use quiver_core::platform::align_up;
use quiver_core::{Key, Lsn, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Cumulative WAL operation counters.
///
/// Never reset over the lifetime of a [`Wal`].
#[derive(Debug, Clone, Default)]
pub struct WalCounters {
    /// Records appended
    pub records_appended: u64,
    /// Batches handed to the driver (first attempts only)
    pub batches_submitted: u64,
    /// Bytes handed to the driver, padding included
    pub bytes_written: u64,
    /// Batch resubmissions after a failed write
    pub write_retries: u64,
    /// Batches failed after exhausting retries
    pub write_failures: u64,
    /// File rotations
    pub rotations: u64,
    /// WAL files removed after a checkpoint
    pub files_removed: u64,
}

/// Durability progress reported by [`Wal::poll_completions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEvent {
    /// Every LSN up to and including `through` is on stable storage
    Durable {
        /// New durable watermark
        through: Lsn,
    },
    /// LSNs in `first..=last` will never become durable; the WAL is degraded
    Failed {
        /// First failed LSN
        first: Lsn,
        /// Last failed LSN
        last: Lsn,
        /// Final I/O error
        error: String,
    },
}

/// WAL errors.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    /// I/O error
    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("WAL config error: {0}")]
    Config(#[from] WalConfigError),

    /// Existing log is unreadable
    #[error("WAL read error: {0}")]
    Reader(#[from] WalReaderError),

    /// A batch exhausted its retries; no further appends are accepted
    #[error("WAL degraded: {0}")]
    Degraded(String),

    /// Key does not fit the record header
    #[error("Key of {0} bytes exceeds the WAL record limit")]
    KeyTooLong(usize),

    /// `open` was given a layout whose tail has not been truncated
    #[error("WAL file {0} has an untruncated torn tail")]
    UntruncatedTail(u64),

    /// `sync_all` gave up waiting for completions
    #[error("Timed out waiting for WAL durability")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BatchState {
    Submitted,
    Written,
    RetryAt(Instant),
}

#[derive(Debug)]
struct InFlightBatch {
    id: BatchId,
    first_lsn: Lsn,
    last_lsn: Lsn,
    file: Arc<File>,
    offset: u64,
    data: Arc<Vec<u8>>,
    attempts: u32,
    state: BatchState,
}

struct ActiveFile {
    number: u64,
    file: Arc<File>,
    write_pos: u64,
    sector_size: usize,
    last_lsn: Option<Lsn>,
}

/// Segmented, group-committing write-ahead log.
pub struct Wal {
    dir: PathBuf,
    config: WalConfig,
    shard_uuid: [u8; 16],
    active: ActiveFile,
    /// Closed files: number → last LSN they hold
    closed: BTreeMap<u64, Option<Lsn>>,
    accumulator: BatchAccumulator,
    in_flight: VecDeque<InFlightBatch>,
    next_batch_id: BatchId,
    next_lsn: Lsn,
    durable_lsn: Lsn,
    driver: Box<dyn IoDriver>,
    failure: Option<String>,
    counters: WalCounters,
    scratch: Vec<Completion>,
}

impl Wal {
    /// Open the log in `dir` for appending.
    ///
    /// `layout` must come from a scan whose torn tail has already been
    /// truncated (see `RecoveryManager`). An empty layout creates file 1.
    pub fn open(
        dir: &Path,
        config: WalConfig,
        driver: Box<dyn IoDriver>,
        layout: &WalLayout,
    ) -> Result<Self, WalError> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;

        let mut closed = BTreeMap::new();
        let (active, shard_uuid, next_lsn) = match layout.last_file() {
            None => {
                let uuid = *uuid::Uuid::new_v4().as_bytes();
                let wal_file = WalFile::create(dir, 1, uuid, config.sector_size, 1)?;
                info!(target: "quiver::wal", dir = %dir.display(), "Created new WAL");
                (active_from(wal_file, config.sector_size, None)?, uuid, 1)
            }
            Some(last) => {
                if !last.stop.is_clean() {
                    return Err(WalError::UntruncatedTail(last.file_number));
                }
                for info in &layout.files[..layout.files.len() - 1] {
                    closed.insert(info.file_number, info.last_record_lsn);
                }
                let wal_file = WalFile::open_append(dir, last.file_number)?;
                let sector = wal_file.header().sector_size as usize;
                let uuid = wal_file.header().shard_uuid;
                let next = last.next_lsn().unwrap_or(1);
                let mut active = active_from(wal_file, sector, last.last_record_lsn)?;
                active.write_pos = align_up(last.valid_end as usize, sector) as u64;
                (active, uuid, next)
            }
        };

        debug!(
            target: "quiver::wal",
            active_file = active.number,
            write_pos = active.write_pos,
            next_lsn,
            driver = driver.name(),
            "WAL opened"
        );

        Ok(Wal {
            dir: dir.to_path_buf(),
            config,
            shard_uuid,
            active,
            closed,
            accumulator: BatchAccumulator::new(),
            in_flight: VecDeque::new(),
            next_batch_id: 1,
            next_lsn,
            durable_lsn: next_lsn - 1,
            driver,
            failure: None,
            counters: WalCounters::default(),
            scratch: Vec::new(),
        })
    }

    /// Assign the next LSN to a mutation and buffer its record.
    ///
    /// Acceptance is synchronous; durability is reported later through
    /// [`Wal::poll_completions`].
    pub fn append(&mut self, key: &Key, value: &Value) -> Result<Lsn, WalError> {
        if let Some(reason) = &self.failure {
            return Err(WalError::Degraded(reason.clone()));
        }
        if key.len() > u16::MAX as usize {
            return Err(WalError::KeyTooLong(key.len()));
        }
        let lsn = self.next_lsn;
        let record = match value {
            Value::Record(r) => WalRecord::upsert(lsn, key.clone(), r),
            Value::Tombstone => WalRecord::delete(lsn, key.clone()),
        };
        self.accumulator.push(&record);
        self.next_lsn += 1;
        self.counters.records_appended += 1;
        Ok(lsn)
    }

    /// Seal buffered records into one batch and hand it to the driver.
    ///
    /// Returns `None` when nothing is buffered or the in-flight window is full;
    /// in the latter case records keep accumulating into the next batch.
    pub fn submit(&mut self) -> Result<Option<BatchId>, WalError> {
        if let Some(reason) = &self.failure {
            return Err(WalError::Degraded(reason.clone()));
        }
        if self.accumulator.is_empty() || self.in_flight.len() >= self.config.max_in_flight_batches
        {
            return Ok(None);
        }
        self.rotate_if_needed()?;

        let Some(batch) = self.accumulator.seal(self.active.sector_size) else {
            return Ok(None);
        };
        let id = self.next_batch_id;
        self.next_batch_id += 1;
        let offset = self.active.write_pos;
        self.active.write_pos += batch.data.len() as u64;
        self.active.last_lsn = Some(batch.last_lsn());
        self.counters.batches_submitted += 1;
        self.counters.bytes_written += batch.data.len() as u64;

        let mut inflight = InFlightBatch {
            id,
            first_lsn: batch.first_lsn(),
            last_lsn: batch.last_lsn(),
            file: Arc::clone(&self.active.file),
            offset,
            data: Arc::new(batch.data),
            attempts: 0,
            state: BatchState::Submitted,
        };
        if let Err(e) = self.driver.submit(request_for(&inflight)) {
            warn!(target: "quiver::wal", batch_id = id, error = %e, "Driver rejected batch");
            inflight.attempts = 1;
            inflight.state = BatchState::RetryAt(Instant::now() + self.config.retry_backoff);
        }
        self.in_flight.push_back(inflight);
        Ok(Some(id))
    }

    /// Collect driver completions and advance the durable watermark.
    pub fn poll_completions(&mut self) -> Vec<WalEvent> {
        let mut completions = std::mem::take(&mut self.scratch);
        self.driver.poll(&mut completions);
        let mut events = Vec::new();
        for completion in completions.drain(..) {
            events.extend(self.on_completion(completion));
        }
        self.scratch = completions;
        events
    }

    /// Apply one completion.
    ///
    /// Success marks the batch written and advances `durable_lsn` over the
    /// contiguous prefix of written batches. Failure schedules a retry with
    /// exponential backoff or, once retries are exhausted, fails this batch
    /// and everything after it.
    pub fn on_completion(&mut self, completion: Completion) -> Vec<WalEvent> {
        let Some(idx) = self
            .in_flight
            .iter()
            .position(|b| b.id == completion.batch_id)
        else {
            return Vec::new();
        };

        match completion.result {
            Ok(()) => {
                self.in_flight[idx].state = BatchState::Written;
            }
            Err(e) => {
                let max_retries = self.config.max_write_retries;
                let backoff = self.config.retry_backoff;
                let batch = &mut self.in_flight[idx];
                batch.attempts += 1;
                if batch.attempts > max_retries {
                    return self.fail_from(idx, e.to_string());
                }
                let delay = backoff * 2u32.saturating_pow(batch.attempts - 1);
                batch.state = BatchState::RetryAt(Instant::now() + delay);
                self.counters.write_retries += 1;
                warn!(
                    target: "quiver::wal",
                    batch_id = batch.id,
                    attempt = batch.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "WAL write failed, retrying"
                );
            }
        }
        self.advance().into_iter().collect()
    }

    /// Resubmit batches whose retry backoff has elapsed.
    pub fn poll_retries(&mut self, now: Instant) -> usize {
        let mut resubmitted = 0;
        for i in 0..self.in_flight.len() {
            let due = matches!(self.in_flight[i].state, BatchState::RetryAt(at) if at <= now);
            if !due {
                continue;
            }
            let request = request_for(&self.in_flight[i]);
            match self.driver.submit(request) {
                Ok(()) => {
                    self.in_flight[i].state = BatchState::Submitted;
                    resubmitted += 1;
                }
                Err(e) => {
                    warn!(target: "quiver::wal", error = %e, "Driver rejected retry");
                    self.in_flight[i].state = BatchState::RetryAt(now + self.config.retry_backoff);
                }
            }
        }
        resubmitted
    }

    /// Pop written batches off the front of the window.
    fn advance(&mut self) -> Option<WalEvent> {
        let before = self.durable_lsn;
        while self
            .in_flight
            .front()
            .map_or(false, |b| b.state == BatchState::Written)
        {
            if let Some(batch) = self.in_flight.pop_front() {
                self.durable_lsn = batch.last_lsn;
            }
        }
        (self.durable_lsn > before).then_some(WalEvent::Durable {
            through: self.durable_lsn,
        })
    }

    fn fail_from(&mut self, idx: usize, error_msg: String) -> Vec<WalEvent> {
        let first = self.in_flight[idx].first_lsn;
        let last = self.next_lsn - 1;
        self.in_flight.truncate(idx);
        self.accumulator.discard();
        self.counters.write_failures += 1;
        error!(
            target: "quiver::wal",
            first_lsn = first,
            last_lsn = last,
            error = %error_msg,
            "WAL write retries exhausted, degrading"
        );
        self.failure = Some(error_msg.clone());
        let mut events: Vec<WalEvent> = self.advance().into_iter().collect();
        events.push(WalEvent::Failed {
            first,
            last,
            error: error_msg,
        });
        events
    }

    /// Start a new file when the next batch would overflow the active one.
    ///
    /// Only rotates with nothing in flight, so every closed file is complete.
    pub fn rotate_if_needed(&mut self) -> Result<bool, WalError> {
        if !self.in_flight.is_empty() || self.active.last_lsn.is_none() {
            return Ok(false);
        }
        let projected = self.active.write_pos
            + self.accumulator.padded_len(self.config.sector_size) as u64;
        if projected <= self.config.segment_size {
            return Ok(false);
        }
        let first_lsn = self.accumulator.first_lsn().unwrap_or(self.next_lsn);
        let number = self.active.number + 1;
        let wal_file = WalFile::create(
            &self.dir,
            number,
            self.shard_uuid,
            self.config.sector_size,
            first_lsn,
        )?;
        let new_active = active_from(wal_file, self.config.sector_size, None)?;
        let old = std::mem::replace(&mut self.active, new_active);
        self.closed.insert(old.number, old.last_lsn);
        self.counters.rotations += 1;
        info!(
            target: "quiver::wal",
            closed_file = old.number,
            new_file = number,
            first_lsn,
            "Rotated WAL file"
        );
        Ok(true)
    }

    /// Remove closed files whose records are all at or below `checkpoint`.
    pub fn remove_segments_through(&mut self, checkpoint: Lsn) -> Result<usize, WalError> {
        let removable: Vec<u64> = self
            .closed
            .iter()
            .take_while(|(_, last)| last.map_or(true, |l| l <= checkpoint))
            .map(|(n, _)| *n)
            .collect();
        for number in &removable {
            std::fs::remove_file(WalFile::file_path(&self.dir, *number))?;
            self.closed.remove(number);
        }
        if !removable.is_empty() {
            sync_dir(&self.dir)?;
            self.counters.files_removed += removable.len() as u64;
            debug!(
                target: "quiver::wal",
                checkpoint,
                removed = removable.len(),
                "Removed checkpointed WAL files"
            );
        }
        Ok(removable.len())
    }

    /// Submit and wait until everything appended so far is durable.
    ///
    /// Blocking; meant for shutdown and tests, never the shard hot path.
    pub fn sync_all(&mut self, timeout: Duration) -> Result<Vec<WalEvent>, WalError> {
        let target = self.next_lsn - 1;
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while self.durable_lsn < target {
            if let Some(reason) = &self.failure {
                return Err(WalError::Degraded(reason.clone()));
            }
            self.submit()?;
            events.extend(self.poll_completions());
            self.poll_retries(Instant::now());
            if Instant::now() >= deadline {
                return Err(WalError::Timeout);
            }
            if self.durable_lsn < target {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        Ok(events)
    }

    /// Highest LSN known to be on stable storage.
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn
    }

    /// LSN the next append will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    /// Whether more records can be appended without growing the backlog past
    /// one group-commit batch beyond a full in-flight window.
    pub fn has_capacity(&self) -> bool {
        self.failure.is_none()
            && (self.in_flight.len() < self.config.max_in_flight_batches
                || self.accumulator.len() < self.config.group_commit_bytes)
    }

    /// Batches handed to the driver and not yet durable.
    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.len()
    }

    /// Records appended but not yet submitted.
    pub fn buffered_records(&self) -> usize {
        self.accumulator.record_count()
    }

    /// Whether retries were exhausted.
    pub fn is_degraded(&self) -> bool {
        self.failure.is_some()
    }

    /// Number of the file currently appended to.
    pub fn active_file_number(&self) -> u64 {
        self.active.number
    }

    /// Number of WAL files on disk.
    pub fn file_count(&self) -> usize {
        self.closed.len() + 1
    }

    /// Shard UUID stamped into every file header.
    pub fn shard_uuid(&self) -> [u8; 16] {
        self.shard_uuid
    }

    /// Counters.
    pub fn counters(&self) -> &WalCounters {
        &self.counters
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn active_from(
    wal_file: WalFile,
    sector_size: usize,
    last_lsn: Option<Lsn>,
) -> std::io::Result<ActiveFile> {
    let number = wal_file.file_number();
    let write_pos = wal_file.len()?;
    Ok(ActiveFile {
        number,
        file: Arc::new(wal_file.try_clone_file()?),
        write_pos,
        sector_size,
        last_lsn,
    })
}

fn request_for(batch: &InFlightBatch) -> WriteRequest {
    WriteRequest {
        batch_id: batch.id,
        file: Arc::clone(&batch.file),
        offset: batch.offset,
        data: Arc::clone(&batch.data),
    }
}

impl From<WalError> for quiver_core::Error {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(io) => quiver_core::Error::Io(io),
            WalError::Config(c) => quiver_core::Error::InvalidConfig(c.to_string()),
            WalError::KeyTooLong(_) => quiver_core::Error::InvalidCommand(e.to_string()),
            WalError::Reader(_) | WalError::UntruncatedTail(_) => {
                quiver_core::Error::Corruption(e.to_string())
            }
            WalError::Degraded(_) | WalError::Timeout => {
                quiver_core::Error::Durability(e.to_string())
            }
        }
    }
}
