//! Shard configuration via `quiver.toml`
//!
//! Every shard of a process shares one [`ShardConfig`]. Missing sections and
//! fields take their defaults, so an empty file is a valid configuration.

use crate::error::{Error, Result};
use crate::limits::{Limits, MAX_ENCODABLE_KEY_BYTES};
use crate::platform;
use crate::value::DistanceMetric;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "quiver.toml";

/// MemTable settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemTableSettings {
    /// Approximate size at which the active table is frozen and flushed
    pub flush_threshold_bytes: usize,
}

impl Default for MemTableSettings {
    fn default() -> Self {
        MemTableSettings {
            flush_threshold_bytes: 64 * 1024 * 1024,
        }
    }
}

/// WAL and admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSettings {
    /// Physical sector size; `None` detects it from the data directory
    pub sector_size: Option<usize>,
    /// Rotate to a new WAL file once the active one exceeds this size
    pub segment_size: u64,
    /// Upper bound on bytes coalesced into one group-commit write
    pub group_commit_bytes: usize,
    /// Maximum number of batches submitted to the I/O driver at once
    pub max_in_flight_batches: usize,
    /// Outstanding durability operations at which admission stops
    pub high_watermark: usize,
    /// Outstanding durability operations below which admission resumes
    pub low_watermark: usize,
    /// Write attempts after the first before a batch is failed
    pub max_write_retries: u32,
    /// Initial retry backoff; doubles per attempt
    pub retry_backoff_ms: u64,
}

impl Default for WalSettings {
    fn default() -> Self {
        WalSettings {
            sector_size: None,
            segment_size: 64 * 1024 * 1024,
            group_commit_bytes: 256 * 1024,
            max_in_flight_batches: 4,
            high_watermark: 256,
            low_watermark: 192,
            max_write_retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

/// Leveled compaction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Number of level-0 segments that triggers a compaction
    pub level0_trigger: usize,
    /// Size ratio between adjacent levels
    pub level_fanout: usize,
    /// Number of levels; the bottom level is `max_levels - 1`
    pub max_levels: usize,
    /// Byte budget of level 1; level `n` gets `fanout^(n-1)` times this
    pub level1_bytes: u64,
    /// Dead-entry fraction (tombstones plus overwritten versions) that
    /// forces a bottom-level merge
    pub tombstone_ratio: f64,
    /// Output segments are split at this size
    pub target_segment_bytes: u64,
    /// Sustained compaction I/O rate
    pub rate_limit_bytes_per_sec: u64,
    /// Token bucket capacity
    pub burst_bytes: u64,
    /// Compaction pauses while foreground outstanding operations exceed this
    pub foreground_yield_threshold: usize,
    /// Rewrite the manifest log once it holds this many transactions
    pub manifest_rewrite_after: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        CompactionSettings {
            level0_trigger: 4,
            level_fanout: 10,
            max_levels: 4,
            level1_bytes: 256 * 1024 * 1024,
            tombstone_ratio: 0.2,
            target_segment_bytes: 64 * 1024 * 1024,
            rate_limit_bytes_per_sec: 64 * 1024 * 1024,
            burst_bytes: 4 * 1024 * 1024,
            foreground_yield_threshold: 128,
            manifest_rewrite_after: 1024,
        }
    }
}

/// Vector index settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    /// Vector dimension of the shard
    pub dimension: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Max neighbors per node on layers > 0 (layer 0 gets `2 * m`)
    pub m: usize,
    /// Beam width during construction
    pub ef_construction: usize,
    /// Default beam width during search
    pub ef_search: usize,
    /// Candidates gathered per requested result before exact rerank
    pub rerank_factor: usize,
    /// Slices with at most this many nodes are scanned exhaustively
    pub exhaustive_threshold: usize,
    /// Seed for deterministic level assignment
    pub seed: u64,
}

impl Default for IndexSettings {
    fn default() -> Self {
        IndexSettings {
            dimension: 128,
            metric: DistanceMetric::Euclidean,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            rerank_factor: 4,
            exhaustive_threshold: 64,
            seed: 42,
        }
    }
}

/// Event loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Ready commands processed per loop iteration before yielding
    pub max_ready_per_tick: usize,
    /// Routed commands drained from peer queues per loop iteration
    pub max_routed_per_tick: usize,
    /// Capacity of each shard-to-shard routing queue
    pub route_queue_capacity: usize,
    /// Sleep when a loop iteration found no work
    pub idle_sleep_micros: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            max_ready_per_tick: 64,
            max_routed_per_tick: 64,
            route_queue_capacity: 1024,
            idle_sleep_micros: 50,
        }
    }
}

/// Complete shard configuration loaded from `quiver.toml`.
///
/// # Example
///
/// ```toml
/// [memtable]
/// flush_threshold_bytes = 67108864
///
/// [wal]
/// high_watermark = 256
/// low_watermark = 192
///
/// [index]
/// dimension = 384
/// metric = "cosine"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// MemTable settings
    pub memtable: MemTableSettings,
    /// WAL and admission settings
    pub wal: WalSettings,
    /// Compaction settings
    pub compaction: CompactionSettings,
    /// Vector index settings
    pub index: IndexSettings,
    /// Event loop settings
    pub scheduler: SchedulerSettings,
    /// Logical limits
    pub limits: Limits,
}

impl ShardConfig {
    /// Small thresholds so tests flush, rotate and compact quickly.
    pub fn for_testing() -> Self {
        ShardConfig {
            memtable: MemTableSettings {
                flush_threshold_bytes: 16 * 1024,
            },
            wal: WalSettings {
                sector_size: Some(512),
                segment_size: 64 * 1024,
                group_commit_bytes: 8 * 1024,
                max_in_flight_batches: 2,
                high_watermark: 256,
                low_watermark: 192,
                max_write_retries: 2,
                retry_backoff_ms: 0,
            },
            compaction: CompactionSettings {
                level0_trigger: 3,
                level_fanout: 4,
                max_levels: 3,
                level1_bytes: 256 * 1024,
                tombstone_ratio: 0.2,
                target_segment_bytes: 64 * 1024,
                rate_limit_bytes_per_sec: 1024 * 1024 * 1024,
                burst_bytes: 64 * 1024 * 1024,
                foreground_yield_threshold: 1_000_000,
                manifest_rewrite_after: 64,
            },
            index: IndexSettings {
                dimension: 8,
                m: 8,
                ef_construction: 64,
                ef_search: 32,
                ..IndexSettings::default()
            },
            scheduler: SchedulerSettings {
                idle_sleep_micros: 10,
                ..SchedulerSettings::default()
            },
            limits: Limits::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ShardConfig = toml::from_str(content)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `quiver.toml` from `dir`, or the defaults when the file is absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Serialize to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(format!("Failed to serialize config: {}", e)))
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        let wal = &self.wal;
        if let Some(sector) = wal.sector_size {
            if sector < 512 || !sector.is_power_of_two() {
                return Err(invalid(format!(
                    "wal.sector_size must be a power of two >= 512, got {}",
                    sector
                )));
            }
        }
        if wal.high_watermark == 0 {
            return Err(invalid("wal.high_watermark must be positive"));
        }
        if wal.low_watermark >= wal.high_watermark {
            return Err(invalid(format!(
                "wal.low_watermark ({}) must be below wal.high_watermark ({})",
                wal.low_watermark, wal.high_watermark
            )));
        }
        if wal.max_in_flight_batches == 0 {
            return Err(invalid("wal.max_in_flight_batches must be positive"));
        }
        if wal.group_commit_bytes == 0 || wal.segment_size == 0 {
            return Err(invalid("wal sizes must be positive"));
        }
        if self.memtable.flush_threshold_bytes == 0 {
            return Err(invalid("memtable.flush_threshold_bytes must be positive"));
        }

        let c = &self.compaction;
        if c.level0_trigger < 2 {
            return Err(invalid("compaction.level0_trigger must be at least 2"));
        }
        if c.max_levels < 2 {
            return Err(invalid("compaction.max_levels must be at least 2"));
        }
        if c.level_fanout < 2 {
            return Err(invalid("compaction.level_fanout must be at least 2"));
        }
        if !(c.tombstone_ratio > 0.0 && c.tombstone_ratio <= 1.0) {
            return Err(invalid(format!(
                "compaction.tombstone_ratio must be in (0, 1], got {}",
                c.tombstone_ratio
            )));
        }
        if c.rate_limit_bytes_per_sec == 0 || c.burst_bytes == 0 {
            return Err(invalid("compaction rate limits must be positive"));
        }

        let idx = &self.index;
        if idx.dimension == 0 || idx.dimension > self.limits.max_vector_dim {
            return Err(invalid(format!(
                "index.dimension must be in 1..={}, got {}",
                self.limits.max_vector_dim, idx.dimension
            )));
        }
        if idx.m < 2 {
            return Err(invalid("index.m must be at least 2"));
        }
        if idx.ef_construction == 0 || idx.ef_search == 0 || idx.rerank_factor == 0 {
            return Err(invalid("index beam widths must be positive"));
        }

        if self.scheduler.max_ready_per_tick == 0 || self.scheduler.route_queue_capacity == 0 {
            return Err(invalid("scheduler bounds must be positive"));
        }
        if self.limits.max_key_bytes > MAX_ENCODABLE_KEY_BYTES {
            return Err(invalid(format!(
                "limits.max_key_bytes cannot exceed {}",
                MAX_ENCODABLE_KEY_BYTES
            )));
        }
        Ok(())
    }

    /// Sector size to use for WAL and segment alignment in `dir`.
    pub fn effective_sector_size(&self, dir: &Path) -> usize {
        self.wal
            .sector_size
            .unwrap_or_else(|| platform::detect_sector_size(dir))
    }

    /// Default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Quiver shard configuration

[memtable]
# Freeze and flush the MemTable once it holds about this many bytes.
flush_threshold_bytes = 67108864

[wal]
# Physical sector size. Leave unset to detect it (fallback 4096).
# sector_size = 4096
segment_size = 67108864
group_commit_bytes = 262144
max_in_flight_batches = 4
# Admission stops at high_watermark outstanding durability operations
# and resumes below low_watermark.
high_watermark = 256
low_watermark = 192
max_write_retries = 3
retry_backoff_ms = 10

[compaction]
level0_trigger = 4
level_fanout = 10
max_levels = 4
tombstone_ratio = 0.2
rate_limit_bytes_per_sec = 67108864

[index]
dimension = 128
metric = "euclidean"   # "euclidean", "cosine" or "dot_product"
m = 16
ef_construction = 200
ef_search = 50
"#
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}
