//! Shard coordinator
//!
//! One [`Shard`] owns one keyspace partition and runs a cooperative loop on a
//! single thread. Each [`Shard::tick`]:
//!
//! 1. collects flush and compaction outcomes from the maintenance thread
//! 2. admits commands forwarded by other shards
//! 3. advances up to `max_ready_per_tick` ready commands: reads are answered,
//!    mutations are appended to the WAL
//! 4. polls WAL completions, committing mutations in LSN order (MemTable
//!    insert, then acknowledgment) and resubmits failed writes
//! 5. re-evaluates admission and schedules flushes and compactions
//!
//! # Backpressure
//!
//! `outstanding` counts mutations admitted and not yet durable or failed.
//! Admission closes when it reaches the WAL high watermark and reopens only
//! once it falls below the low watermark. Reads are never throttled.
//!
//! # Fault isolation
//!
//! Applying a command runs under `catch_unwind`. A panic fails that command,
//! aborts the commands still queued (none of them reached the WAL) and
//! recomputes `outstanding` from the commands awaiting durability. Everything
//! at or past `PendingDurability` is left untouched and still completes.

use crate::context::{RecoveryReport, ShardContext};
use crate::maintenance::{MaintenanceEvent, MaintenanceTask, MaintenanceWorker};
use crate::mesh::{RouteError, ShardLink};
use crate::state::{CommandMachine, CommandState};
use crate::stats::ShardStats;
use quiver_core::{
    Command, CommandPayload, CorrelationToken, Error, Key, Lsn, Response, ResponsePayload,
    Result, ShardConfig, ShardId, Value,
};
use quiver_durability::{IoDriver, ThreadedDriver, WalEvent};
use quiver_index::SearchParams;
use quiver_storage::{CompactionThrottle, ForegroundLoad, RepairRequest, StorageError};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Delay before a failed flush is retried.
const FLUSH_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Shard-wide lifecycle phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPhase {
    /// Replaying the WAL; nothing is admitted
    BootReplay,
    /// Accepting every command kind
    Serving,
    /// A WAL write failed for good; reads only
    ReadOnly(String),
    /// Shutting down; nothing new is admitted
    Terminating,
}

/// Observer called with each command just before it is applied.
pub type CommandHook = Box<dyn FnMut(&Command) + Send>;

/// A single shard: context, command queues and the maintenance thread.
pub struct Shard {
    ctx: ShardContext,
    phase: ShardPhase,
    /// Admitted, not yet applied
    ready: VecDeque<CommandMachine>,
    /// In the WAL, awaiting durability; LSN order
    pending: VecDeque<CommandMachine>,
    /// Acknowledged, awaiting capture in a segment; LSN order
    committed: VecDeque<CommandMachine>,
    responses: VecDeque<Response>,
    outstanding: usize,
    throttled: bool,
    foreground: ForegroundLoad,
    link: Option<ShardLink>,
    maintenance: MaintenanceWorker,
    flush_in_flight: Option<Lsn>,
    flush_retry_at: Option<Instant>,
    compaction_in_flight: bool,
    compaction_requested: bool,
    hook: Option<CommandHook>,
    stats: ShardStats,
    recovery: RecoveryReport,
    events: Vec<MaintenanceEvent>,
    routed: Vec<Command>,
}

impl Shard {
    /// Open shard `id` in `dir` with a threaded WAL driver.
    pub fn open(id: ShardId, dir: &Path, config: ShardConfig) -> Result<Self> {
        let driver = ThreadedDriver::spawn(format!("quiver-wal-{}", id))?;
        Self::open_with_driver(id, dir, config, Box::new(driver))
    }

    /// Open shard `id` in `dir` on the given WAL driver.
    pub fn open_with_driver(
        id: ShardId,
        dir: &Path,
        config: ShardConfig,
        driver: Box<dyn IoDriver>,
    ) -> Result<Self> {
        let (ctx, recovery) = ShardContext::open(id, dir, config, driver)?;

        let foreground: ForegroundLoad = Arc::new(AtomicUsize::new(0));
        let settings = &ctx.config.compaction;
        let throttle = CompactionThrottle::new(
            settings.rate_limit_bytes_per_sec,
            settings.burst_bytes,
            Arc::clone(&foreground),
            settings.foreground_yield_threshold,
        );
        let maintenance = MaintenanceWorker::spawn(
            id,
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.snapshot),
            ctx.config.index.clone(),
            throttle,
        )?;

        let mut shard = Shard {
            ctx,
            phase: ShardPhase::BootReplay,
            ready: VecDeque::new(),
            pending: VecDeque::new(),
            committed: VecDeque::new(),
            responses: VecDeque::new(),
            outstanding: 0,
            throttled: false,
            foreground,
            link: None,
            maintenance,
            flush_in_flight: None,
            flush_retry_at: None,
            compaction_in_flight: false,
            compaction_requested: true,
            hook: None,
            stats: ShardStats::default(),
            recovery,
            events: Vec::new(),
            routed: Vec::new(),
        };
        shard.phase = ShardPhase::Serving;
        info!(
            target: "quiver::engine",
            shard = id,
            durable_lsn = shard.ctx.wal.durable_lsn(),
            "Shard serving"
        );
        Ok(shard)
    }

    /// Join the routing mesh.
    pub fn attach_link(&mut self, link: ShardLink) {
        self.link = Some(link);
    }

    /// Install (or clear) the command hook.
    pub fn set_command_hook(&mut self, hook: Option<CommandHook>) {
        self.hook = hook;
    }

    /// Shard id.
    pub fn id(&self) -> ShardId {
        self.ctx.id
    }

    /// Lifecycle phase.
    pub fn phase(&self) -> &ShardPhase {
        &self.phase
    }

    /// What recovery found when the shard opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Per-shard state.
    pub fn context(&self) -> &ShardContext {
        &self.ctx
    }

    /// Offer a command to the shard.
    ///
    /// A command keyed to another shard is forwarded over the mesh. Otherwise
    /// it is validated and, for mutations, checked against admission control.
    /// On `Ok` exactly one response will eventually be produced for it (by
    /// this shard or the one it was forwarded to); on `Err` none will.
    pub fn submit(&mut self, command: Command) -> Result<()> {
        let owner = self
            .link
            .as_ref()
            .and_then(|link| link.foreign_owner(&command));
        match owner {
            Some(owner) => self.forward(owner, command),
            None => self.admit(command),
        }
    }

    fn forward(&mut self, owner: ShardId, command: Command) -> Result<()> {
        let Some(link) = self.link.as_ref() else {
            return self.admit(command);
        };
        match link.route(owner, command) {
            Ok(()) => {
                self.stats.routed_out += 1;
                Ok(())
            }
            Err(RouteError::Full(_)) => {
                self.stats.rejected_overloaded += 1;
                Err(Error::RouteFull(owner))
            }
            Err(RouteError::Disconnected(_)) => {
                Err(Error::Aborted(format!("shard {} is not running", owner)))
            }
        }
    }

    fn admit(&mut self, command: Command) -> Result<()> {
        let mut machine = CommandMachine::new(command);
        match &self.phase {
            ShardPhase::BootReplay => {
                return Err(Error::Aborted("shard is replaying its WAL".to_string()))
            }
            ShardPhase::Terminating => {
                return Err(Error::Aborted("shard is shutting down".to_string()))
            }
            ShardPhase::Serving | ShardPhase::ReadOnly(_) => {}
        }
        machine.ingest()?;

        if let Err(e) = self
            .ctx
            .config
            .limits
            .validate_command(machine.command(), self.ctx.config.index.dimension)
        {
            self.stats.rejected_invalid += 1;
            machine.transition(CommandState::Terminating)?;
            return Err(e.into());
        }

        if machine.command().is_mutation() {
            if let ShardPhase::ReadOnly(reason) = &self.phase {
                self.stats.rejected_read_only += 1;
                let err = Error::ReadOnly(reason.clone());
                machine.transition(CommandState::Terminating)?;
                return Err(err);
            }
            self.update_admission();
            if self.throttled {
                self.stats.rejected_overloaded += 1;
                machine.transition(CommandState::Throttled)?;
                machine.transition(CommandState::Terminating)?;
                return Err(Error::Overloaded {
                    outstanding: self.outstanding,
                    high_watermark: self.ctx.config.wal.high_watermark,
                });
            }
            self.set_outstanding(self.outstanding + 1);
        }

        self.stats.accepted += 1;
        self.ready.push_back(machine);
        Ok(())
    }

    /// Drop a command that has not reached the WAL (its caller went away).
    ///
    /// Returns `false` if no such command is queued; once a mutation is
    /// pending durability it always completes.
    pub fn cancel(&mut self, correlation: CorrelationToken) -> bool {
        let Some(pos) = self
            .ready
            .iter()
            .position(|m| m.correlation() == correlation && m.state().is_abandonable())
        else {
            return false;
        };
        let Some(mut machine) = self.ready.remove(pos) else {
            return false;
        };
        if machine.transition(CommandState::Terminating).is_err() {
            return false;
        }
        if machine.command().is_mutation() {
            self.set_outstanding(self.outstanding.saturating_sub(1));
        }
        self.stats.aborted += 1;
        debug!(target: "quiver::engine", command = %machine.id(), "Command cancelled");
        true
    }

    /// Run one loop iteration. Returns whether any work was done.
    pub fn tick(&mut self) -> bool {
        let mut progressed = self.poll_maintenance();
        progressed |= self.drain_routed();
        progressed |= self.process_ready();
        progressed |= self.drive_wal();
        self.update_admission();
        progressed |= self.schedule_maintenance();
        progressed
    }

    /// Tick until nothing is queued, in flight or being maintained.
    ///
    /// Returns `false` on timeout.
    pub fn run_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let idle_sleep = Duration::from_micros(self.ctx.config.scheduler.idle_sleep_micros);
        loop {
            let progressed = self.tick();
            if !progressed && self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if !progressed {
                std::thread::sleep(idle_sleep);
            }
        }
    }

    /// Whether there is no queued, pending or background work.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
            && self.pending.is_empty()
            && self.ctx.frozen.is_empty()
            && self.flush_in_flight.is_none()
            && !self.compaction_in_flight
            && !self.compaction_requested
    }

    /// Take every response produced so far, in production order.
    pub fn drain_responses(&mut self) -> Vec<Response> {
        self.responses.drain(..).collect()
    }

    /// Freeze the active MemTable now so the next ticks flush it.
    pub fn force_flush(&mut self) -> bool {
        match self.ctx.freeze_active() {
            Some(table) => {
                debug!(
                    target: "quiver::engine",
                    shard = self.ctx.id,
                    entries = table.len(),
                    "MemTable frozen on request"
                );
                true
            }
            None => false,
        }
    }

    /// Ask the maintenance thread to compact on a coming tick.
    pub fn request_compaction(&mut self) {
        self.compaction_requested = true;
    }

    /// Repair requests for quarantined segments, for the external replica.
    pub fn take_repair_requests(&self) -> Vec<RepairRequest> {
        self.ctx.store.take_repair_requests()
    }

    /// Counters plus current gauges.
    pub fn stats(&self) -> ShardStats {
        let mut stats = self.stats.clone();
        stats.outstanding = self.outstanding;
        stats.throttled = self.throttled;
        stats.read_only = matches!(self.phase, ShardPhase::ReadOnly(_));
        stats.durable_lsn = self.ctx.wal.durable_lsn();
        stats.checkpoint_lsn = self.ctx.store.checkpoint_lsn();
        stats.memtable_bytes = self.ctx.active.approximate_size();
        stats.frozen_memtables = self.ctx.frozen.len();
        stats.segments = self.ctx.store.version().segment_count();
        stats.index_nodes = self.ctx.snapshot.load().node_count();
        stats
    }

    /// Stop admitting, wait for pending mutations, then stop maintenance.
    ///
    /// Queued commands that never reached the WAL are aborted.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.phase = ShardPhase::Terminating;
        self.abort_ready("shard is shutting down");
        let deadline = Instant::now() + timeout;
        while !self.pending.is_empty() && !self.ctx.wal.is_degraded() {
            if !self.drive_wal() {
                if Instant::now() >= deadline {
                    return Err(Error::Durability(format!(
                        "{} mutations still pending at shutdown",
                        self.pending.len()
                    )));
                }
                std::thread::sleep(Duration::from_micros(100));
            }
        }
        self.maintenance.shutdown();
        info!(
            target: "quiver::engine",
            shard = self.ctx.id,
            durable_lsn = self.ctx.wal.durable_lsn(),
            "Shard stopped"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loop stages
    // ------------------------------------------------------------------

    fn drain_routed(&mut self) -> bool {
        let max = self.ctx.config.scheduler.max_routed_per_tick;
        let mut routed = std::mem::take(&mut self.routed);
        if let Some(link) = self.link.as_mut() {
            link.drain(max, &mut routed);
        }
        let progressed = !routed.is_empty();
        for command in routed.drain(..) {
            self.stats.routed_in += 1;
            let correlation = command.correlation;
            if let Err(e) = self.admit(command) {
                self.responses.push_back(Response::error(correlation, &e));
            }
        }
        self.routed = routed;
        progressed
    }

    fn process_ready(&mut self) -> bool {
        let budget = self.ctx.config.scheduler.max_ready_per_tick;
        let mut processed = 0;
        while processed < budget {
            let Some(mut machine) = self.ready.pop_front() else {
                break;
            };
            if machine.command().is_mutation() && !self.ctx.wal.has_capacity() {
                if self.ctx.wal.is_degraded() {
                    self.fail_command(machine, Error::ReadOnly(self.read_only_reason()));
                    processed += 1;
                    continue;
                }
                if machine.state() != CommandState::Throttled
                    && machine.transition(CommandState::Throttled).is_ok()
                {
                    self.stats.throttle_events += 1;
                }
                self.ready.push_front(machine);
                break;
            }
            if machine.state() == CommandState::Throttled {
                if let Err(e) = machine.transition(CommandState::Ingested) {
                    self.fail_command(machine, e.into());
                    processed += 1;
                    continue;
                }
            }
            processed += 1;

            let correlation = machine.correlation();
            let id = machine.id();
            let outcome = catch_unwind(AssertUnwindSafe(|| self.apply(machine)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err((machine, e))) => self.fail_command(machine, e),
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!(
                        target: "quiver::engine",
                        shard = self.ctx.id,
                        command = %id,
                        panic = %msg,
                        "Command panicked, resetting request tracking"
                    );
                    self.stats.faults += 1;
                    self.stats.failed += 1;
                    let err = Error::internal(format!("command panicked: {}", msg));
                    self.responses.push_back(Response::error(correlation, &err));
                    self.abort_ready("request tracking reset after an internal fault");
                    self.set_outstanding(self.pending.len());
                }
            }
        }
        processed > 0
    }

    /// Apply one ingested command. On error the machine is handed back.
    fn apply(
        &mut self,
        mut machine: CommandMachine,
    ) -> std::result::Result<(), (CommandMachine, Error)> {
        if let Some(hook) = self.hook.as_mut() {
            hook(machine.command());
        }
        if machine.command().is_mutation() {
            match self.log_mutation(&mut machine) {
                Ok(()) => {
                    self.pending.push_back(machine);
                    Ok(())
                }
                Err(e) => Err((machine, e)),
            }
        } else {
            match self.execute_read(&machine) {
                Ok(payload) => {
                    if let Err(e) = machine.transition(CommandState::Archived) {
                        return Err((machine, e.into()));
                    }
                    self.responses
                        .push_back(Response::ok(machine.correlation(), payload));
                    Ok(())
                }
                Err(e) => Err((machine, e)),
            }
        }
    }

    fn log_mutation(&mut self, machine: &mut CommandMachine) -> Result<()> {
        let lsn = {
            let (key, value) = mutation_entry(machine.command())
                .ok_or_else(|| Error::internal("not a mutation"))?;
            self.ctx.wal.append(key, &value)?
        };
        machine.mark_logged(lsn)?;
        Ok(())
    }

    fn execute_read(&mut self, machine: &CommandMachine) -> Result<ResponsePayload> {
        match &machine.command().payload {
            CommandPayload::Search(request) => {
                // Hits from a quarantined range are missing until it is repaired
                if let Some(q) = self.ctx.store.version().quarantined().first() {
                    return Err(Error::corruption(format!(
                        "segment {} is quarantined pending repair",
                        q.id
                    )));
                }
                let params =
                    SearchParams::new(&self.ctx.config.index, request.k, request.breadth);
                let snapshot = self.ctx.snapshot.load();
                let (result, storage_error) = {
                    let reader = self.ctx.reader();
                    let result = snapshot.search(&request.query, &params, &reader);
                    (result, reader.take_storage_error())
                };
                if let Some(e) = storage_error {
                    self.quarantine_on(&e);
                    return Err(e.into());
                }
                let hits = result?;
                self.stats.searches += 1;
                Ok(ResponsePayload::Hits(hits))
            }
            CommandPayload::Get { key } => {
                let result = self.ctx.reader().get(key);
                match result {
                    Ok(record) => {
                        self.stats.gets += 1;
                        Ok(ResponsePayload::Value(record))
                    }
                    Err(e) => {
                        self.quarantine_on(&e);
                        Err(e.into())
                    }
                }
            }
            CommandPayload::Upsert { .. } | CommandPayload::Delete { .. } => {
                Err(Error::internal("mutation routed to the read path"))
            }
        }
    }

    fn drive_wal(&mut self) -> bool {
        let mut progressed = false;
        let events = self.ctx.wal.poll_completions();
        progressed |= !events.is_empty();
        self.apply_wal_events(events);

        if self.ctx.wal.poll_retries(Instant::now()) > 0 {
            progressed = true;
        }

        if !self.ctx.wal.is_degraded() {
            match self.ctx.wal.submit() {
                Ok(Some(_)) => progressed = true,
                Ok(None) => {}
                Err(e) => warn!(
                    target: "quiver::wal",
                    shard = self.ctx.id,
                    error = %e,
                    "WAL submit failed"
                ),
            }
        }
        progressed
    }

    fn apply_wal_events(&mut self, events: Vec<WalEvent>) {
        for event in events {
            match event {
                WalEvent::Durable { through } => self.commit_through(through),
                WalEvent::Failed { first, last, error } => {
                    self.fail_range(first, last, &error);
                    self.enter_read_only(error);
                }
            }
        }
    }

    /// Commit pending mutations up to `through`: MemTable first, then the
    /// acknowledgment.
    fn commit_through(&mut self, through: Lsn) {
        while self
            .pending
            .front()
            .and_then(|m| m.lsn())
            .map_or(false, |lsn| lsn <= through)
        {
            let Some(mut machine) = self.pending.pop_front() else {
                break;
            };
            let Some(lsn) = machine.lsn() else {
                continue;
            };
            self.set_outstanding(self.outstanding.saturating_sub(1));

            let inserted = match mutation_entry(machine.command()) {
                Some((key, value)) => self
                    .ctx
                    .active
                    .insert(key.clone(), value, lsn)
                    .map_err(Error::from),
                None => Err(Error::internal("pending command is not a mutation")),
            };
            if let Err(e) = inserted.and_then(|_| {
                machine
                    .transition(CommandState::Committed)
                    .map_err(Error::from)
            }) {
                error!(
                    target: "quiver::engine",
                    shard = self.ctx.id,
                    lsn,
                    error = %e,
                    "Durable mutation could not be applied"
                );
                self.fail_command(machine, e);
                continue;
            }
            self.stats.committed += 1;
            self.responses.push_back(Response::ok(
                machine.correlation(),
                ResponsePayload::Committed { lsn },
            ));
            self.committed.push_back(machine);
        }
    }

    fn fail_range(&mut self, first: Lsn, last: Lsn, error: &str) {
        let err = Error::Durability(error.to_string());
        let mut kept = VecDeque::with_capacity(self.pending.len());
        for machine in std::mem::take(&mut self.pending) {
            let failed = machine
                .lsn()
                .map_or(false, |lsn| lsn >= first && lsn <= last);
            if failed {
                self.set_outstanding(self.outstanding.saturating_sub(1));
                self.stats.failed += 1;
                self.terminate(machine, &err);
            } else {
                kept.push_back(machine);
            }
        }
        self.pending = kept;
    }

    fn enter_read_only(&mut self, reason: String) {
        if matches!(self.phase, ShardPhase::ReadOnly(_)) {
            return;
        }
        error!(
            target: "quiver::engine",
            shard = self.ctx.id,
            reason = %reason,
            "WAL failed, shard is now read-only"
        );
        if self.phase != ShardPhase::Terminating {
            self.phase = ShardPhase::ReadOnly(reason.clone());
        }
        let err = Error::ReadOnly(reason);
        let mut reads = VecDeque::with_capacity(self.ready.len());
        for machine in std::mem::take(&mut self.ready) {
            if machine.command().is_mutation() {
                self.stats.aborted += 1;
                self.terminate(machine, &err);
            } else {
                reads.push_back(machine);
            }
        }
        self.ready = reads;
        self.set_outstanding(self.pending.len());
    }

    fn poll_maintenance(&mut self) -> bool {
        let mut events = std::mem::take(&mut self.events);
        let progressed = self.maintenance.poll(&mut events) > 0;
        for event in events.drain(..) {
            match event {
                MaintenanceEvent::Flushed {
                    checkpoint,
                    segment_id,
                } => {
                    self.flush_in_flight = None;
                    self.flush_retry_at = None;
                    self.ctx.retire_flushed();
                    self.stats.flushes += 1;
                    self.archive_through(checkpoint);
                    if let Err(e) = self.ctx.wal.remove_segments_through(checkpoint) {
                        warn!(
                            target: "quiver::wal",
                            shard = self.ctx.id,
                            checkpoint,
                            error = %e,
                            "Could not remove checkpointed WAL files"
                        );
                    }
                    self.compaction_requested = true;
                    debug!(
                        target: "quiver::engine",
                        shard = self.ctx.id,
                        checkpoint,
                        segment_id,
                        "Flush installed"
                    );
                }
                MaintenanceEvent::FlushFailed { checkpoint, error } => {
                    self.flush_in_flight = None;
                    self.flush_retry_at = Some(Instant::now() + FLUSH_RETRY_BACKOFF);
                    warn!(
                        target: "quiver::engine",
                        shard = self.ctx.id,
                        checkpoint,
                        error = %error,
                        "Flush failed, will retry"
                    );
                }
                MaintenanceEvent::Compacted { jobs } => {
                    self.compaction_in_flight = false;
                    self.stats.compactions += jobs.len() as u64;
                }
                MaintenanceEvent::CompactionFailed { jobs, error } => {
                    self.compaction_in_flight = false;
                    self.stats.compactions += jobs.len() as u64;
                    warn!(
                        target: "quiver::compaction",
                        shard = self.ctx.id,
                        error = %error,
                        "Compaction failed"
                    );
                }
                MaintenanceEvent::Quarantined { .. } => {
                    self.stats.quarantined += 1;
                }
            }
        }
        self.events = events;
        progressed
    }

    fn schedule_maintenance(&mut self) -> bool {
        let mut progressed = false;
        if self.ctx.active.approximate_size() >= self.ctx.config.memtable.flush_threshold_bytes
            && self.ctx.freeze_active().is_some()
        {
            debug!(
                target: "quiver::engine",
                shard = self.ctx.id,
                frozen = self.ctx.frozen.len(),
                "MemTable reached flush threshold"
            );
            progressed = true;
        }

        let retry_due = self
            .flush_retry_at
            .map_or(true, |at| Instant::now() >= at);
        if self.flush_in_flight.is_none() && retry_due {
            if let Some(oldest) = self.ctx.frozen.first() {
                let checkpoint = oldest.max_lsn().unwrap_or(0);
                let task = MaintenanceTask::Flush {
                    memtable: Arc::clone(oldest),
                    checkpoint,
                };
                if self.maintenance.submit(task) {
                    self.flush_in_flight = Some(checkpoint);
                    progressed = true;
                }
            }
        }

        if self.compaction_requested && !self.compaction_in_flight {
            self.compaction_requested = false;
            if self.maintenance.submit(MaintenanceTask::Compact) {
                self.compaction_in_flight = true;
                progressed = true;
            }
        }
        progressed
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn update_admission(&mut self) {
        let wal = &self.ctx.config.wal;
        if self.throttled {
            if self.outstanding < wal.low_watermark {
                self.throttled = false;
                debug!(
                    target: "quiver::engine",
                    shard = self.ctx.id,
                    outstanding = self.outstanding,
                    "Admission reopened"
                );
            }
        } else if self.outstanding >= wal.high_watermark {
            self.throttled = true;
            warn!(
                target: "quiver::engine",
                shard = self.ctx.id,
                outstanding = self.outstanding,
                high_watermark = wal.high_watermark,
                "Admission closed"
            );
        }
    }

    fn set_outstanding(&mut self, n: usize) {
        self.outstanding = n;
        self.foreground.store(n, Ordering::Relaxed);
    }

    fn archive_through(&mut self, checkpoint: Lsn) {
        while self
            .committed
            .front()
            .and_then(|m| m.lsn())
            .map_or(false, |lsn| lsn <= checkpoint)
        {
            if let Some(mut machine) = self.committed.pop_front() {
                if machine.transition(CommandState::Archived).is_ok() {
                    self.stats.archived += 1;
                }
            }
        }
    }

    fn abort_ready(&mut self, reason: &str) {
        let err = Error::Aborted(reason.to_string());
        for machine in std::mem::take(&mut self.ready) {
            if machine.command().is_mutation() {
                self.set_outstanding(self.outstanding.saturating_sub(1));
            }
            self.stats.aborted += 1;
            self.terminate(machine, &err);
        }
    }

    /// Fail a command that was admitted but never reached durability.
    fn fail_command(&mut self, machine: CommandMachine, err: Error) {
        if machine.command().is_mutation() && machine.state() != CommandState::PendingDurability {
            self.set_outstanding(self.outstanding.saturating_sub(1));
        }
        self.stats.failed += 1;
        debug!(
            target: "quiver::engine",
            shard = self.ctx.id,
            command = %machine.id(),
            error = %err,
            "Command failed"
        );
        self.terminate(machine, &err);
    }

    fn terminate(&mut self, mut machine: CommandMachine, err: &Error) {
        let _ = machine.transition(CommandState::Terminating);
        self.responses
            .push_back(Response::error(machine.correlation(), err));
    }

    fn quarantine_on(&mut self, e: &StorageError) {
        match self.ctx.store.quarantine_on_corruption(e) {
            Ok(Some(id)) => {
                self.ctx.snapshot.apply(Vec::new(), &[id]);
                self.stats.quarantined += 1;
            }
            Ok(None) => {}
            Err(qe) => error!(
                target: "quiver::engine",
                shard = self.ctx.id,
                error = %qe,
                "Quarantine failed"
            ),
        }
    }

    fn read_only_reason(&self) -> String {
        match &self.phase {
            ShardPhase::ReadOnly(reason) => reason.clone(),
            _ => "WAL is degraded".to_string(),
        }
    }
}

/// Key and logged value of a mutation.
fn mutation_entry(command: &Command) -> Option<(&Key, Value)> {
    match &command.payload {
        CommandPayload::Upsert { key, record } => Some((key, Value::Record(record.clone()))),
        CommandPayload::Delete { key } => Some((key, Value::Tombstone)),
        CommandPayload::Search(_) | CommandPayload::Get { .. } => None,
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "(non-string panic)".to_string())
}
