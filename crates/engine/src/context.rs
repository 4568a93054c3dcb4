//! Per-shard context
//!
//! Everything one shard owns, in one struct: its configuration, WAL,
//! MemTables, segment store and index snapshot. Opening a context performs
//! recovery; the shard loop never sees a half-recovered context.

use crate::reader::ShardReader;
use crate::slices;
use quiver_core::{Error, Lsn, Result, ShardConfig, ShardId};
use quiver_durability::{IoDriver, RecoveryError, RecoveryManager, Wal, WalConfig};
use quiver_index::{IndexSnapshot, SnapshotCell};
use quiver_storage::{LsmStore, MemTable};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// WAL directory under a shard directory.
pub const WAL_DIR: &str = "wal";

/// What recovery found while opening a shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Manifest checkpoint replay started above
    pub checkpoint_lsn: Lsn,
    /// WAL records replayed into the MemTable
    pub records_replayed: u64,
    /// Highest LSN in the WAL
    pub last_lsn: Lsn,
    /// Bytes of torn tail discarded
    pub truncated_bytes: u64,
    /// Live segments after open
    pub segments: usize,
    /// Segments quarantined at open
    pub quarantined: usize,
}

/// State owned by one shard.
pub struct ShardContext {
    pub(crate) id: ShardId,
    pub(crate) config: ShardConfig,
    pub(crate) dir: PathBuf,
    pub(crate) wal: Wal,
    pub(crate) active: Arc<MemTable>,
    /// Oldest first
    pub(crate) frozen: Vec<Arc<MemTable>>,
    pub(crate) store: Arc<LsmStore>,
    pub(crate) snapshot: Arc<SnapshotCell>,
}

impl ShardContext {
    /// Open the shard in `dir`, recovering whatever is on disk.
    pub fn open(
        id: ShardId,
        dir: &Path,
        config: ShardConfig,
        driver: Box<dyn IoDriver>,
    ) -> Result<(Self, RecoveryReport)> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        let sector = config.effective_sector_size(dir);

        let store = Arc::new(LsmStore::open(dir, config.compaction.clone(), sector)?);
        let checkpoint = store.checkpoint_lsn();
        let quarantined = store.pending_repairs();

        let active = Arc::new(MemTable::new());
        let wal_dir = dir.join(WAL_DIR);
        let recovery = RecoveryManager::new(&wal_dir).recover(checkpoint, |record, value| {
            active
                .replay_insert(record.key.clone(), value, record.lsn)
                .map(|_| ())
                .map_err(|e| RecoveryError::apply(e.to_string()))
        })?;

        if recovery.layout.files.is_empty() && checkpoint > 0 {
            return Err(Error::corruption(format!(
                "WAL in {} is missing but the manifest checkpoint is {}",
                wal_dir.display(),
                checkpoint
            )));
        }

        let wal = Wal::open(
            &wal_dir,
            WalConfig::from_settings(&config.wal, sector),
            driver,
            &recovery.layout,
        )?;

        let version = store.version();
        let mut loaded = Vec::with_capacity(version.segment_count());
        for live in version.segments() {
            loaded.push(slices::load_or_rebuild(live, &config.index)?);
        }
        let snapshot = Arc::new(SnapshotCell::new(
            IndexSnapshot::new().with_changes(loaded, &[]),
        ));

        let report = RecoveryReport {
            checkpoint_lsn: checkpoint,
            records_replayed: recovery.records_replayed,
            last_lsn: recovery.last_lsn,
            truncated_bytes: recovery.truncated.as_ref().map_or(0, |t| t.bytes_discarded()),
            segments: version.segment_count(),
            quarantined,
        };

        info!(
            target: "quiver::recovery",
            shard = id,
            checkpoint_lsn = report.checkpoint_lsn,
            replayed = report.records_replayed,
            segments = report.segments,
            memtable_entries = active.len(),
            "Shard recovered"
        );

        Ok((
            ShardContext {
                id,
                config,
                dir: dir.to_path_buf(),
                wal,
                active,
                frozen: Vec::new(),
                store,
                snapshot,
            },
            report,
        ))
    }

    /// Read view over MemTables and segments.
    pub fn reader(&self) -> ShardReader<'_> {
        ShardReader::new(&self.active, &self.frozen, &self.store)
    }

    /// Freeze the active MemTable and start a new one.
    ///
    /// Returns `None` if the active table is empty.
    pub fn freeze_active(&mut self) -> Option<Arc<MemTable>> {
        if self.active.is_empty() {
            return None;
        }
        self.active.freeze();
        let frozen = std::mem::replace(&mut self.active, Arc::new(MemTable::new()));
        self.frozen.push(Arc::clone(&frozen));
        Some(frozen)
    }

    /// Drop the oldest frozen table once its flush is installed.
    pub fn retire_flushed(&mut self) -> Option<Arc<MemTable>> {
        if self.frozen.is_empty() {
            None
        } else {
            Some(self.frozen.remove(0))
        }
    }

    /// Shard directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shard id.
    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ShardConfig {
        &self.config
    }
}
