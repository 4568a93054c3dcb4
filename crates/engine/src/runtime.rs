//! Multi-shard runtime
//!
//! One named thread per shard, each running its own [`Shard`] loop. Shards
//! are joined by a [`ShardMesh`] so a command handed to the wrong shard is
//! forwarded to its owner. Every thread opens (and recovers) its shard, then
//! waits for a start signal, so `spawn` returns only once all shards are
//! serving or one has failed to open. A failed open stops every shard.

use crate::mesh::{shard_for, ShardMesh};
use crate::shard::{panic_message, Shard};
use quiver_core::{Command, Error, Response, Result, SearchHit, ShardConfig, ShardId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long a stopping shard waits for pending mutations.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Called on each shard thread before the shard opens, e.g. to pin it to a core.
pub type ThreadHook = Arc<dyn Fn(ShardId) + Send + Sync>;

/// Directory of shard `id` under `base`.
pub fn shard_dir(base: &Path, id: ShardId) -> PathBuf {
    base.join(format!("shard-{}", id))
}

/// Running shards and the channels into and out of them.
pub struct ShardRuntime {
    ingress: Vec<Sender<Command>>,
    responses: Receiver<(ShardId, Response)>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ShardRuntime {
    /// Open `shards` shards under `base_dir` and start their loops.
    pub fn spawn(base_dir: &Path, shards: usize, config: ShardConfig) -> Result<Self> {
        Self::spawn_with_hook(base_dir, shards, config, None)
    }

    /// Like [`ShardRuntime::spawn`], running `hook` first on every shard thread.
    pub fn spawn_with_hook(
        base_dir: &Path,
        shards: usize,
        config: ShardConfig,
        hook: Option<ThreadHook>,
    ) -> Result<Self> {
        if shards == 0 {
            return Err(Error::InvalidConfig("runtime needs at least one shard".into()));
        }
        config.validate()?;

        let links = ShardMesh::new(shards, config.scheduler.route_queue_capacity);
        let stop = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = mpsc::channel::<(ShardId, Result<()>)>();
        let (response_tx, response_rx) = mpsc::channel::<(ShardId, Response)>();

        let mut ingress = Vec::with_capacity(shards);
        let mut starts = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);
        for (id, link) in links.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel::<Command>();
            ingress.push(tx);
            let (start_tx, start_rx) = mpsc::channel::<bool>();
            starts.push(start_tx);

            let dir = shard_dir(base_dir, id);
            let config = config.clone();
            let stop = Arc::clone(&stop);
            let status_tx = status_tx.clone();
            let response_tx = response_tx.clone();
            let hook = hook.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("quiver-shard-{}", id))
                .spawn(move || {
                    if let Some(hook) = hook {
                        hook(id);
                    }
                    let opened = Shard::open(id, &dir, config);
                    let shard = match opened {
                        Ok(mut shard) => {
                            shard.attach_link(link);
                            let _ = status_tx.send((id, Ok(())));
                            Some(shard)
                        }
                        Err(e) => {
                            let _ = status_tx.send((id, Err(e)));
                            None
                        }
                    };
                    let go = start_rx.recv().unwrap_or(false);
                    if let (true, Some(shard)) = (go, shard) {
                        run_shard(shard, rx, response_tx, stop);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Closing the start channels releases the threads already running
                    drop(starts);
                    join_all(handles);
                    return Err(Error::Io(e));
                }
            }
        }
        drop(status_tx);

        let mut failure = None;
        for _ in 0..shards {
            match status_rx.recv() {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(e))) => {
                    error!(target: "quiver::engine", shard = id, error = %e, "Shard failed to open");
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    failure.get_or_insert(Error::internal("shard thread exited during open"));
                }
            }
        }
        for start in &starts {
            let _ = start.send(failure.is_none());
        }

        if let Some(e) = failure {
            join_all(handles);
            return Err(e);
        }
        info!(target: "quiver::engine", shards, "Runtime started");
        Ok(ShardRuntime {
            ingress,
            responses: response_rx,
            stop,
            handles,
        })
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.ingress.len()
    }

    /// Send a command to the shard that owns it.
    ///
    /// Searches go to every shard, each answering with its local hits under
    /// the command's correlation token (see [`merge_hits`]). Returns how many
    /// responses to expect.
    pub fn submit(&self, command: Command) -> Result<usize> {
        match command.routing_key() {
            Some(key) => {
                let owner = shard_for(key, self.shard_count());
                self.submit_to(owner, command)?;
                Ok(1)
            }
            None => {
                for shard in 0..self.shard_count() {
                    self.submit_to(shard, command.clone())?;
                }
                Ok(self.shard_count())
            }
        }
    }

    /// Send a command to a specific shard.
    pub fn submit_to(&self, shard: ShardId, command: Command) -> Result<()> {
        let tx = self
            .ingress
            .get(shard)
            .ok_or_else(|| Error::invalid_command(format!("no shard {}", shard)))?;
        tx.send(command)
            .map_err(|_| Error::Aborted(format!("shard {} has stopped", shard)))
    }

    /// Wait up to `timeout` for the next response.
    pub fn recv_response(&self, timeout: Duration) -> Option<(ShardId, Response)> {
        match self.responses.recv_timeout(timeout) {
            Ok(r) => Some(r),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next response, if one is ready.
    pub fn try_recv_response(&self) -> Option<(ShardId, Response)> {
        match self.responses.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Stop every shard and join its thread.
    pub fn shutdown(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(Error::internal(format!("{} shard threads panicked", panicked)));
        }
        info!(target: "quiver::engine", "Runtime stopped");
        Ok(())
    }
}

impl Drop for ShardRuntime {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            let _ = self.shutdown();
        }
    }
}

/// Combine per-shard hit lists into the global `k` nearest.
pub fn merge_hits(parts: impl IntoIterator<Item = Vec<SearchHit>>, k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = parts.into_iter().flatten().collect();
    hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.key.cmp(&b.key)));
    hits.truncate(k);
    hits
}

fn run_shard(
    mut shard: Shard,
    ingress: Receiver<Command>,
    responses: Sender<(ShardId, Response)>,
    stop: Arc<AtomicBool>,
) {
    let id = shard.id();
    let scheduler = shard.context().config().scheduler.clone();
    let idle_sleep = Duration::from_micros(scheduler.idle_sleep_micros);

    while !stop.load(Ordering::Acquire) {
        let mut progressed = false;
        for _ in 0..scheduler.max_ready_per_tick {
            let command = match ingress.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            progressed = true;
            let correlation = command.correlation;
            if let Err(e) = shard.submit(command) {
                let _ = responses.send((id, Response::error(correlation, &e)));
            }
        }

        match catch_unwind(AssertUnwindSafe(|| shard.tick())) {
            Ok(p) => progressed |= p,
            Err(panic) => {
                error!(
                    target: "quiver::engine",
                    shard = id,
                    panic = %panic_message(panic.as_ref()),
                    "Shard loop panicked"
                );
            }
        }
        for response in shard.drain_responses() {
            let _ = responses.send((id, response));
        }
        if !progressed {
            std::thread::sleep(idle_sleep);
        }
    }

    if let Err(e) = shard.shutdown(SHUTDOWN_GRACE) {
        warn!(target: "quiver::engine", shard = id, error = %e, "Shard stopped uncleanly");
    }
    for response in shard.drain_responses() {
        let _ = responses.send((id, response));
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::{CorrelationToken, Key, ResponsePayload, VectorRecord};
    use std::collections::HashMap;

    fn vector(seed: u64) -> Vec<f32> {
        (0..8).map(|i| ((seed * 13 + i * 7) % 101) as f32).collect()
    }

    fn collect(runtime: &ShardRuntime, n: usize) -> Vec<(ShardId, Response)> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match runtime.recv_response(Duration::from_secs(10)) {
                Some(r) => out.push(r),
                None => panic!("timed out after {} of {} responses", out.len(), n),
            }
        }
        out
    }

    #[test]
    fn test_spawn_submit_and_search_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = ShardRuntime::spawn(dir.path(), 3, ShardConfig::for_testing()).unwrap();

        for id in 0..60u64 {
            let expected = runtime
                .submit(Command::upsert(
                    id,
                    format!("key-{:02}", id),
                    VectorRecord::from_vector(vector(id)),
                ))
                .unwrap();
            assert_eq!(expected, 1);
        }
        let committed = collect(&runtime, 60);
        assert!(committed.iter().all(|(_, r)| r.status.is_ok()));
        let owners: HashMap<u64, ShardId> = committed
            .iter()
            .map(|(shard, r)| (r.correlation.0, *shard))
            .collect();
        for (id, shard) in &owners {
            assert_eq!(*shard, shard_for(&Key::from(format!("key-{:02}", id)), 3));
        }

        let expected = runtime.submit(Command::search(1000, vector(17), 3)).unwrap();
        assert_eq!(expected, 3);
        let parts: Vec<Vec<SearchHit>> = collect(&runtime, 3)
            .into_iter()
            .map(|(_, r)| match r.payload {
                ResponsePayload::Hits(h) => h,
                other => panic!("expected hits, got {:?}", other),
            })
            .collect();
        let hits = merge_hits(parts, 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].key, Key::from("key-17"));
        assert_eq!(hits[0].distance, 0.0);

        runtime.shutdown().unwrap();
    }

    #[test]
    fn test_misrouted_command_is_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ShardRuntime::spawn(dir.path(), 2, ShardConfig::for_testing()).unwrap();
        let key = (0..)
            .map(|i| Key::from(format!("k{}", i)))
            .find(|k| shard_for(k, 2) == 1)
            .unwrap();

        runtime
            .submit_to(
                0,
                Command::upsert(1, key.clone(), VectorRecord::from_vector(vector(1))),
            )
            .unwrap();
        let (shard, response) = collect(&runtime, 1).remove(0);
        assert_eq!(shard, 1);
        assert_eq!(response.correlation, CorrelationToken(1));
        assert!(response.status.is_ok());
    }

    #[test]
    fn test_restart_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut runtime =
                ShardRuntime::spawn(dir.path(), 2, ShardConfig::for_testing()).unwrap();
            for id in 0..10u64 {
                runtime
                    .submit(Command::upsert(
                        id,
                        format!("p{}", id),
                        VectorRecord::from_vector(vector(id)),
                    ))
                    .unwrap();
            }
            collect(&runtime, 10);
            runtime.shutdown().unwrap();
        }

        let runtime = ShardRuntime::spawn(dir.path(), 2, ShardConfig::for_testing()).unwrap();
        runtime.submit(Command::get(100, "p4")).unwrap();
        let (_, response) = collect(&runtime, 1).remove(0);
        assert_eq!(
            response.payload,
            ResponsePayload::Value(Some(VectorRecord::from_vector(vector(4))))
        );
    }

    #[test]
    fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A file where shard-1's directory should be
        std::fs::write(shard_dir(dir.path(), 1), b"not a directory").unwrap();
        let started = std::sync::atomic::AtomicUsize::new(0);
        let started = Arc::new(started);
        let counter = Arc::clone(&started);
        let hook: ThreadHook = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let result = ShardRuntime::spawn_with_hook(
            dir.path(),
            2,
            ShardConfig::for_testing(),
            Some(hook),
        );
        assert!(result.is_err());
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_shards_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShardRuntime::spawn(dir.path(), 0, ShardConfig::for_testing()).is_err());
    }
}
