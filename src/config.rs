use std::time::Duration;

use crate::date::{DAY_MILLIS, HOUR_MILLIS};
use crate::model::Timestamp;

/// 1990-01-01T00:00:00Z, the oldest date sync will ever ask about.
pub const OLDEST_SYNC_DATE: Timestamp = 631_152_000_000;

/// Configuration for a folder store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Estimated byte size at which a block gets split (default: 96KB)
    pub max_block_size: usize,

    /// Bytes kept by the newer half when splitting the newest block (default: 32KB)
    pub block_split_small_part: usize,

    /// Bytes kept by the newer half when splitting an interior block (default: 48KB)
    pub block_split_equal_part: usize,

    /// Bytes kept by the newer half when splitting the oldest block (default: 64KB)
    pub block_split_large_part: usize,

    /// Estimated cost of a single header (default: 200 bytes)
    pub header_est_size: usize,

    /// Keep a server id -> header block mapping (default: false)
    pub track_server_ids: bool,

    /// How far back sync keeps data around (default: 30 days)
    pub sync_horizon: Duration,

    /// Offset of the server's timezone from UTC in milliseconds (default: 0)
    pub tz_offset_ms: i64,

    /// Oldest date sync may ever reach (default: 1990-01-01)
    pub oldest_sync_date: Timestamp,

    /// Idle time on the folder mutex before excess cached blocks are flushed (default: 5s)
    pub idle_flush_interval: Duration,

    /// How often the purge task checks whether a purge is due (default: 60s)
    pub purge_interval: Duration,

    /// How often dirty state gets handed to the block store (default: 30s)
    pub checkpoint_interval: Duration,

    /// How often metrics are logged (default: 60s)
    pub metrics_interval: Duration,

    /// Purge configuration
    pub purge: PurgeConfig,

    /// Slice configuration
    pub slice: SliceConfig,
}

#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Schedule a purge every time this many body blocks were created (default: 32)
    pub every_n_new_body_blocks: u64,

    /// Only purge ranges that went unsynced for this long (default: 14 days)
    pub only_after_unsynced: Duration,

    /// Hard limit on the number of blocks in either directory (default: 1024)
    pub hard_max_block_limit: usize,
}

#[derive(Debug, Clone)]
pub struct SliceConfig {
    /// Headers a freshly opened slice is filled with (default: 15)
    pub initial_fill_size: usize,

    /// Default cap for range queries without an explicit limit (default: 2000)
    pub too_many_messages: usize,

    /// Pending notifications past which a slice flushes immediately (default: 5)
    pub flush_threshold: usize,

    /// Coverage younger than this is fresh enough when opening a slice (default: 10min)
    pub open_refresh_threshold: Duration,

    /// Coverage younger than this is fresh enough when growing a slice (default: 3h)
    pub grow_refresh_threshold: Duration,

    /// Slop added around refresh windows to absorb server date fuzz (default: 1 day)
    pub search_ambiguity: Duration,

    /// Days covered by the first sync of a folder (default: 3)
    pub initial_sync_days: u32,

    /// Days added when the user grows past the synced range (default: 3)
    pub initial_sync_growth_days: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            every_n_new_body_blocks: 32,
            only_after_unsynced: Duration::from_millis(14 * DAY_MILLIS as u64),
            hard_max_block_limit: 1024,
        }
    }
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            initial_fill_size: 15,
            too_many_messages: 2000,
            flush_threshold: 5,
            open_refresh_threshold: Duration::from_secs(10 * 60),
            grow_refresh_threshold: Duration::from_millis(3 * HOUR_MILLIS as u64),
            search_ambiguity: Duration::from_millis(DAY_MILLIS as u64),
            initial_sync_days: 3,
            initial_sync_growth_days: 3,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_block_size: 96 * 1024,         // 96KB
            block_split_small_part: 32 * 1024, // 32KB
            block_split_equal_part: 48 * 1024, // 48KB
            block_split_large_part: 64 * 1024, // 64KB
            header_est_size: 200,
            track_server_ids: false,
            sync_horizon: Duration::from_millis(30 * DAY_MILLIS as u64),
            tz_offset_ms: 0,
            oldest_sync_date: OLDEST_SYNC_DATE,
            idle_flush_interval: Duration::from_secs(5),
            purge_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            purge: PurgeConfig::default(),
            slice: SliceConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the block size that triggers a split
    pub fn max_block_size(mut self, size: usize) -> Self {
        self.max_block_size = size;
        self
    }

    /// Set the newer-half budgets used when splitting newest, interior and oldest blocks
    pub fn block_split_parts(mut self, small: usize, equal: usize, large: usize) -> Self {
        self.block_split_small_part = small;
        self.block_split_equal_part = equal;
        self.block_split_large_part = large;
        self
    }

    /// Set the estimated cost of one header
    pub fn header_est_size(mut self, size: usize) -> Self {
        self.header_est_size = size;
        self
    }

    /// Enable the server id mapping
    pub fn track_server_ids(mut self, enabled: bool) -> Self {
        self.track_server_ids = enabled;
        self
    }

    /// Set the sync horizon
    pub fn sync_horizon(mut self, horizon: Duration) -> Self {
        self.sync_horizon = horizon;
        self
    }

    /// Set the server timezone offset
    pub fn tz_offset_ms(mut self, offset: i64) -> Self {
        self.tz_offset_ms = offset;
        self
    }

    /// Set the idle flush interval
    pub fn idle_flush_interval(mut self, interval: Duration) -> Self {
        self.idle_flush_interval = interval;
        self
    }

    /// Set the purge check interval
    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = interval;
        self
    }

    /// Set the checkpoint interval
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Set the metrics interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Configure purge settings
    pub fn purge(mut self, config: PurgeConfig) -> Self {
        self.purge = config;
        self
    }

    /// Configure slice settings
    pub fn slice(mut self, config: SliceConfig) -> Self {
        self.slice = config;
        self
    }

    pub(crate) fn sync_horizon_ms(&self) -> i64 {
        self.sync_horizon.as_millis() as i64
    }
}

impl PurgeConfig {
    /// Set how many new body blocks schedule a purge
    pub fn every_n_new_body_blocks(mut self, n: u64) -> Self {
        self.every_n_new_body_blocks = n;
        self
    }

    /// Set how long a range must be unsynced before it can be purged
    pub fn only_after_unsynced(mut self, age: Duration) -> Self {
        self.only_after_unsynced = age;
        self
    }

    /// Set the hard block count limit
    pub fn hard_max_block_limit(mut self, limit: usize) -> Self {
        self.hard_max_block_limit = limit;
        self
    }
}

impl SliceConfig {
    /// Set the initial fill size
    pub fn initial_fill_size(mut self, size: usize) -> Self {
        self.initial_fill_size = size;
        self
    }

    /// Set the flush threshold for pending notifications
    pub fn flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Set the open and grow refresh thresholds
    pub fn refresh_thresholds(mut self, open: Duration, grow: Duration) -> Self {
        self.open_refresh_threshold = open;
        self.grow_refresh_threshold = grow;
        self
    }
}
