//! Background flush and compaction.
//!
//! Each shard owns one maintenance thread. The shard loop hands it frozen
//! MemTables and compaction requests over a channel and collects outcomes
//! from a second channel on its next tick, so segment writes, index builds
//! and merges never run on the hot path.
//!
//! A flush or compaction publishes its index slices through the shared
//! [`SnapshotCell`] around its manifest install:
//! - flush: install the segment, then add its slice (the frozen MemTable
//!   keeps covering the keys until the shard drops it)
//! - compaction: add output slices, install, then drop input slices

use crate::shard::panic_message;
use crate::slices;
use quiver_core::{Error, IndexSettings, Lsn};
use quiver_index::{IndexSlice, SnapshotCell};
use quiver_storage::{
    compact, CompactInfo, CompactionJob, CompactionPicker, CompactionThrottle, LsmStore, MemTable,
    Segment, StorageError,
};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Compaction jobs run per request before the thread checks for new work.
const MAX_JOBS_PER_REQUEST: usize = 8;

/// Work for the maintenance thread.
pub enum MaintenanceTask {
    /// Write a frozen MemTable to a segment and advance the checkpoint
    Flush {
        /// Frozen table
        memtable: Arc<MemTable>,
        /// Checkpoint to record once the segment is installed
        checkpoint: Lsn,
    },
    /// Run compaction jobs until none is due
    Compact,
}

/// Outcome reported back to the shard loop.
#[derive(Debug)]
pub enum MaintenanceEvent {
    /// Flush installed
    Flushed {
        /// Checkpoint now in the manifest
        checkpoint: Lsn,
        /// New segment, `None` for an empty table
        segment_id: Option<u64>,
    },
    /// Flush failed; the frozen table stays readable and is retried
    FlushFailed {
        /// Checkpoint that was not recorded
        checkpoint: Lsn,
        /// Cause
        error: Error,
    },
    /// Compaction request finished
    Compacted {
        /// Statistics per installed job
        jobs: Vec<CompactInfo>,
    },
    /// Compaction request stopped on an error
    CompactionFailed {
        /// Jobs installed before the error
        jobs: Vec<CompactInfo>,
        /// Cause
        error: Error,
    },
    /// A corrupt segment was quarantined
    Quarantined {
        /// Segment id
        segment_id: u64,
    },
}

struct Worker {
    store: Arc<LsmStore>,
    snapshot: Arc<SnapshotCell>,
    index: IndexSettings,
    picker: CompactionPicker,
    throttle: CompactionThrottle,
    events: Sender<MaintenanceEvent>,
}

/// Handle to a shard's maintenance thread.
pub struct MaintenanceWorker {
    tasks: Option<Sender<MaintenanceTask>>,
    events: Receiver<MaintenanceEvent>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Start the thread for shard `shard_id`.
    pub fn spawn(
        shard_id: usize,
        store: Arc<LsmStore>,
        snapshot: Arc<SnapshotCell>,
        index: IndexSettings,
        throttle: CompactionThrottle,
    ) -> std::io::Result<Self> {
        let (task_tx, task_rx) = mpsc::channel::<MaintenanceTask>();
        let (event_tx, event_rx) = mpsc::channel();
        let picker = CompactionPicker::new(store.settings().clone());
        let worker = Worker {
            store,
            snapshot,
            index,
            picker,
            throttle,
            events: event_tx,
        };
        let handle = std::thread::Builder::new()
            .name(format!("quiver-maint-{}", shard_id))
            .spawn(move || worker.run(task_rx))?;
        Ok(MaintenanceWorker {
            tasks: Some(task_tx),
            events: event_rx,
            handle: Some(handle),
        })
    }

    /// Queue a task. Returns `false` if the thread has exited.
    pub fn submit(&self, task: MaintenanceTask) -> bool {
        self.tasks
            .as_ref()
            .map_or(false, |tx| tx.send(task).is_ok())
    }

    /// Collect finished outcomes without blocking.
    pub fn poll(&self, out: &mut Vec<MaintenanceEvent>) -> usize {
        let before = out.len();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out.len() - before
    }

    /// Close the task channel and join the thread after it finishes its
    /// current task.
    pub fn shutdown(&mut self) {
        self.tasks.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(target: "quiver::engine", "Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Failure of one compaction job.
enum JobError {
    /// Storage failure, kept typed so corruption can be traced to a segment
    Storage(StorageError),
    /// Anything else
    Other(Error),
}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        JobError::Storage(e)
    }
}

impl From<Error> for JobError {
    fn from(e: Error) -> Self {
        JobError::Other(e)
    }
}

impl Worker {
    fn run(mut self, tasks: Receiver<MaintenanceTask>) {
        while let Ok(task) = tasks.recv() {
            let flush_checkpoint = match &task {
                MaintenanceTask::Flush { checkpoint, .. } => Some(*checkpoint),
                MaintenanceTask::Compact => None,
            };
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match task {
                MaintenanceTask::Flush {
                    memtable,
                    checkpoint,
                } => self.flush(&memtable, checkpoint),
                MaintenanceTask::Compact => self.compact(),
            }));
            let events = outcome.unwrap_or_else(|panic| {
                let msg = panic_message(panic.as_ref());
                error!(target: "quiver::engine", panic = %msg, "Maintenance task panicked");
                let error = Error::internal(format!("maintenance task panicked: {}", msg));
                vec![match flush_checkpoint {
                    Some(checkpoint) => MaintenanceEvent::FlushFailed { checkpoint, error },
                    None => MaintenanceEvent::CompactionFailed {
                        jobs: Vec::new(),
                        error,
                    },
                }]
            });
            for event in events {
                if self.events.send(event).is_err() {
                    return;
                }
            }
        }
        debug!(target: "quiver::engine", "Maintenance thread exiting");
    }

    fn flush(&mut self, memtable: &MemTable, checkpoint: Lsn) -> Vec<MaintenanceEvent> {
        match self.try_flush(memtable, checkpoint) {
            Ok(segment_id) => vec![MaintenanceEvent::Flushed {
                checkpoint,
                segment_id,
            }],
            Err(error) => {
                warn!(target: "quiver::engine", checkpoint, error = %error, "Flush failed");
                vec![MaintenanceEvent::FlushFailed { checkpoint, error }]
            }
        }
    }

    fn try_flush(&mut self, memtable: &MemTable, checkpoint: Lsn) -> Result<Option<u64>, Error> {
        let info = self.store.flush_memtable(memtable)?;
        let slice = match &info {
            Some(info) => Some(slices::build_for_flush(
                memtable,
                info.id,
                &info.path,
                &self.index,
            )?),
            None => None,
        };
        self.store.install_flush(info.as_ref(), checkpoint)?;
        if let Some(slice) = slice {
            self.snapshot.apply(vec![slice], &[]);
        }
        Ok(info.map(|i| i.id))
    }

    fn compact(&mut self) -> Vec<MaintenanceEvent> {
        let mut jobs = Vec::new();
        let mut events = Vec::new();
        for _ in 0..MAX_JOBS_PER_REQUEST {
            let Some(job) = self.picker.pick(&self.store.version()) else {
                break;
            };
            match self.run_job(&job) {
                Ok(info) => jobs.push(info),
                Err(JobError::Storage(e)) => {
                    if let Some(segment_id) = self.quarantine_if_corrupt(&e) {
                        events.push(MaintenanceEvent::Quarantined { segment_id });
                    }
                    events.push(MaintenanceEvent::CompactionFailed {
                        jobs,
                        error: e.into(),
                    });
                    return events;
                }
                Err(JobError::Other(error)) => {
                    events.push(MaintenanceEvent::CompactionFailed { jobs, error });
                    return events;
                }
            }
        }
        if !jobs.is_empty() {
            info!(
                target: "quiver::compaction",
                jobs = jobs.len(),
                segments = self.store.version().segment_count(),
                "Compaction round complete"
            );
        }
        events.push(MaintenanceEvent::Compacted { jobs });
        events
    }

    fn run_job(&mut self, job: &CompactionJob) -> Result<CompactInfo, JobError> {
        let output = compact(&self.store, job, &mut self.throttle)?;

        let mut added: Vec<Arc<IndexSlice>> = Vec::with_capacity(output.outputs.len());
        for info in &output.outputs {
            let segment = Segment::open(&info.path, info.id).map_err(StorageError::from)?;
            added.push(slices::build_for_segment(&segment, &self.index)?);
        }
        let output_ids: Vec<u64> = output.outputs.iter().map(|o| o.id).collect();

        self.snapshot.apply(added, &[]);
        if let Err(e) = self.store.install_compaction(&output) {
            self.snapshot.apply(Vec::new(), &output_ids);
            return Err(e.into());
        }
        self.snapshot.apply(Vec::new(), &job.input_ids());
        Ok(output.info)
    }

    fn quarantine_if_corrupt(&self, e: &StorageError) -> Option<u64> {
        let id = e.corrupt_segment()?;
        match self.store.quarantine(id, &e.to_string()) {
            Ok(true) => {
                self.snapshot.apply(Vec::new(), &[id]);
                Some(id)
            }
            Ok(false) => None,
            Err(qe) => {
                error!(target: "quiver::engine", segment_id = id, error = %qe, "Quarantine failed");
                None
            }
        }
    }
}
