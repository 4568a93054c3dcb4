//! Completion-based I/O drivers.
//!
//! The shard loop never blocks on the disk: sealed batches are handed to an
//! [`IoDriver`] and their outcomes are collected later with [`IoDriver::poll`].
//!
//! - [`ThreadedDriver`]: a dedicated I/O thread doing positioned write + `fdatasync`
//! - [`ManualDriver`]: holds requests until a test releases, fails or tears them

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Identifier of one submitted batch, unique per WAL instance.
pub type BatchId = u64;

/// One positioned write followed by a data sync.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Batch being written
    pub batch_id: BatchId,
    /// Target file
    pub file: Arc<File>,
    /// Absolute file offset (sector aligned)
    pub offset: u64,
    /// Sector-aligned bytes
    pub data: Arc<Vec<u8>>,
}

/// Outcome of a [`WriteRequest`].
#[derive(Debug)]
pub struct Completion {
    /// Batch the outcome belongs to
    pub batch_id: BatchId,
    /// `Ok` once the bytes are on stable storage
    pub result: io::Result<()>,
}

/// Asynchronous write submission with polled completions.
pub trait IoDriver: Send {
    /// Queue a write. Must not block on the disk.
    fn submit(&mut self, request: WriteRequest) -> io::Result<()>;

    /// Move every available completion into `out`; returns how many were added.
    fn poll(&mut self, out: &mut Vec<Completion>) -> usize;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Perform a request synchronously: positioned write, then `sync_data`.
pub fn write_and_sync(request: &WriteRequest) -> io::Result<()> {
    write_all_at(&request.file, &request.data, request.offset)?;
    request.file.sync_data()
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Driver backed by one I/O thread per WAL.
///
/// Requests are executed strictly in submission order.
pub struct ThreadedDriver {
    requests: Option<Sender<WriteRequest>>,
    completions: Receiver<Completion>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedDriver {
    /// Spawn the I/O thread with the given name.
    pub fn spawn(thread_name: impl Into<String>) -> io::Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<WriteRequest>();
        let (done_tx, done_rx) = mpsc::channel::<Completion>();
        let handle = std::thread::Builder::new()
            .name(thread_name.into())
            .spawn(move || {
                while let Ok(request) = req_rx.recv() {
                    let result = write_and_sync(&request);
                    if let Err(ref e) = result {
                        warn!(
                            target: "quiver::wal",
                            batch_id = request.batch_id,
                            offset = request.offset,
                            error = %e,
                            "WAL write failed"
                        );
                    }
                    let completion = Completion {
                        batch_id: request.batch_id,
                        result,
                    };
                    if done_tx.send(completion).is_err() {
                        break;
                    }
                }
                debug!(target: "quiver::wal", "WAL I/O thread exiting");
            })?;
        Ok(ThreadedDriver {
            requests: Some(req_tx),
            completions: done_rx,
            handle: Some(handle),
        })
    }
}

impl IoDriver for ThreadedDriver {
    fn submit(&mut self, request: WriteRequest) -> io::Result<()> {
        let sender = self
            .requests
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread stopped"))?;
        sender
            .send(request)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread stopped"))
    }

    fn poll(&mut self, out: &mut Vec<Completion>) -> usize {
        let mut n = 0;
        loop {
            match self.completions.try_recv() {
                Ok(c) => {
                    out.push(c);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        n
    }

    fn name(&self) -> &'static str {
        "threaded"
    }
}

impl Drop for ThreadedDriver {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Default)]
struct ManualState {
    queued: VecDeque<WriteRequest>,
    completed: Vec<Completion>,
    failures_to_inject: u32,
    submitted: u64,
}

/// Test driver: requests sit in a queue until the test decides their fate.
///
/// Cloning yields another handle to the same queue, so a test can keep one
/// handle while the WAL owns the other.
#[derive(Debug, Clone, Default)]
pub struct ManualDriver {
    state: Arc<Mutex<ManualState>>,
}

impl ManualDriver {
    /// New empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests submitted but not yet released.
    pub fn pending(&self) -> usize {
        self.state.lock().queued.len()
    }

    /// Total requests ever submitted (including resubmissions).
    pub fn submitted(&self) -> u64 {
        self.state.lock().submitted
    }

    /// Make the next `n` released requests fail with an I/O error.
    pub fn inject_failures(&self, n: u32) {
        self.state.lock().failures_to_inject = n;
    }

    /// Release the oldest request: perform it and queue its completion.
    pub fn complete_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.queued.pop_front() {
            Some(request) => {
                let result = if state.failures_to_inject > 0 {
                    state.failures_to_inject -= 1;
                    Err(io::Error::new(io::ErrorKind::Other, "injected write failure"))
                } else {
                    write_and_sync(&request)
                };
                state.completed.push(Completion {
                    batch_id: request.batch_id,
                    result,
                });
                true
            }
            None => false,
        }
    }

    /// Release the request at queue position `index`, leaving older ones pending.
    pub fn complete_at(&self, index: usize) -> bool {
        let mut state = self.state.lock();
        match state.queued.remove(index) {
            Some(request) => {
                let result = write_and_sync(&request);
                state.completed.push(Completion {
                    batch_id: request.batch_id,
                    result,
                });
                true
            }
            None => false,
        }
    }

    /// Release every pending request in order; returns how many were released.
    pub fn complete_all(&self) -> usize {
        let mut n = 0;
        while self.complete_next() {
            n += 1;
        }
        n
    }

    /// Fail the oldest request without writing it.
    pub fn fail_next(&self) -> bool {
        let mut state = self.state.lock();
        match state.queued.pop_front() {
            Some(request) => {
                state.completed.push(Completion {
                    batch_id: request.batch_id,
                    result: Err(io::Error::new(io::ErrorKind::Other, "injected write failure")),
                });
                true
            }
            None => false,
        }
    }

    /// Simulate a crash mid-write: persist only the first `keep` bytes of the
    /// oldest request and never report a completion for it.
    pub fn tear_next(&self, keep: usize) -> io::Result<bool> {
        let mut state = self.state.lock();
        match state.queued.pop_front() {
            Some(request) => {
                let keep = keep.min(request.data.len());
                let partial = WriteRequest {
                    data: Arc::new(request.data[..keep].to_vec()),
                    ..request
                };
                write_and_sync(&partial)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every pending request without writing (power loss before I/O).
    pub fn drop_pending(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.queued.len();
        state.queued.clear();
        n
    }
}

impl IoDriver for ManualDriver {
    fn submit(&mut self, request: WriteRequest) -> io::Result<()> {
        let mut state = self.state.lock();
        state.submitted += 1;
        state.queued.push_back(request);
        Ok(())
    }

    fn poll(&mut self, out: &mut Vec<Completion>) -> usize {
        let mut state = self.state.lock();
        let n = state.completed.len();
        out.append(&mut state.completed);
        n
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn request(file: &Arc<File>, id: BatchId, offset: u64, byte: u8) -> WriteRequest {
        WriteRequest {
            batch_id: id,
            file: Arc::clone(file),
            offset,
            data: Arc::new(vec![byte; 512]),
        }
    }

    fn temp_file(dir: &tempfile::TempDir) -> Arc<File> {
        Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(dir.path().join("f"))
                .unwrap(),
        )
    }

    #[test]
    fn test_threaded_driver_completes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = temp_file(&dir);
        let mut driver = ThreadedDriver::spawn("test-wal-io").unwrap();
        for i in 0..4u64 {
            driver.submit(request(&file, i, i * 512, i as u8 + 1)).unwrap();
        }
        let mut out = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(10);
        while out.len() < 4 && Instant::now() < deadline {
            driver.poll(&mut out);
            std::thread::sleep(Duration::from_millis(1));
        }
        let ids: Vec<_> = out.iter().map(|c| c.batch_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(out.iter().all(|c| c.result.is_ok()));

        let mut contents = Vec::new();
        std::fs::File::open(dir.path().join("f"))
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents.len(), 2048);
        assert_eq!(contents[1536], 4);
    }

    #[test]
    fn test_manual_driver_holds_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let file = temp_file(&dir);
        let handle = ManualDriver::new();
        let mut driver: Box<dyn IoDriver> = Box::new(handle.clone());
        driver.submit(request(&file, 1, 0, 9)).unwrap();
        let mut out = Vec::new();
        assert_eq!(driver.poll(&mut out), 0);
        assert_eq!(handle.pending(), 1);
        assert!(handle.complete_next());
        assert_eq!(driver.poll(&mut out), 1);
        assert!(out[0].result.is_ok());
    }

    #[test]
    fn test_manual_driver_injected_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = temp_file(&dir);
        let handle = ManualDriver::new();
        let mut driver = handle.clone();
        driver.submit(request(&file, 1, 0, 9)).unwrap();
        driver.submit(request(&file, 2, 512, 9)).unwrap();
        handle.inject_failures(1);
        assert_eq!(handle.complete_all(), 2);
        let mut out = Vec::new();
        driver.poll(&mut out);
        assert!(out[0].result.is_err());
        assert!(out[1].result.is_ok());
    }

    #[test]
    fn test_tear_writes_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = temp_file(&dir);
        let handle = ManualDriver::new();
        let mut driver = handle.clone();
        driver.submit(request(&file, 1, 0, 7)).unwrap();
        assert!(handle.tear_next(100).unwrap());
        let mut out = Vec::new();
        assert_eq!(driver.poll(&mut out), 0);
        assert_eq!(std::fs::metadata(dir.path().join("f")).unwrap().len(), 100);
    }
}
