//! Engine configuration structures.
//!
//! These structures define every tunable aspect of a SortHeap relation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BLOCKS_PER_RANGE, DEFAULT_BLOCK_SIZE, DEFAULT_BUFFER_FRAMES,
    DEFAULT_COLUMN_BLOCK_SIZE, DEFAULT_MAX_GROUP_BYTES, DEFAULT_MAX_GROUP_ROWS, DEFAULT_MERGE_TRIGGER_LEVEL,
    DEFAULT_MIN_GROUP_BYTES, DEFAULT_MIN_GROUP_ROWS, DEFAULT_OUTLINE_THRESHOLD,
    DEFAULT_OVERSIZED_VALUE, DEFAULT_PREALLOC_CAP, DEFAULT_PREALLOC_START,
    DEFAULT_SORT_BUFFER_BYTES, DEFAULT_SORT_BUFFER_ROWS, DEFAULT_TAPESETS,
    DEFAULT_TAPES_PER_SET, MAX_BLOCK_SIZE, MAX_PREALLOC_CACHE, MAX_TAPESETS,
    MAX_TAPES_PER_SET, MIN_BLOCK_SIZE, MIN_BUFFER_FRAMES, MIN_TAPES_PER_SET,
};

/// Main engine configuration.
///
/// # Example
///
/// ```rust
/// use sortheap_common::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_sort_buffer_rows(1000)
///     .with_background_maintenance(false);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of each block in bytes. Must be a power of 2.
    /// Default: 8192 (8 KB)
    pub block_size: usize,

    /// Number of frames in the buffer pool.
    pub buffer_frames: usize,

    /// Rows buffered per relation and session before a run is dumped.
    pub sort_buffer_rows: usize,

    /// Encoded bytes buffered before a run is dumped.
    pub sort_buffer_bytes: usize,

    /// Tapes per TapeSet, including the merge output tape.
    pub tapes_per_set: usize,

    /// Number of TapeSets per relation.
    pub tapesets: usize,

    /// Polyphase level at which a merge becomes worthwhile.
    pub merge_trigger_level: u32,

    /// First tape preallocation batch.
    pub prealloc_start: usize,

    /// Largest tape preallocation batch.
    pub prealloc_cap: usize,

    /// Data blocks summarized by one block-range summary.
    pub blocks_per_range: usize,

    /// Fill percentage of B-tree pages (50..=100).
    pub btree_fill_percent: u8,

    /// Column compression settings.
    pub compression: CompressionConfig,

    /// Retry policy for contention and visibility waits.
    pub retry: RetryPolicy,

    /// Launch background merge/vacuum workers after dumps.
    pub background_maintenance: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            buffer_frames: DEFAULT_BUFFER_FRAMES,
            sort_buffer_rows: DEFAULT_SORT_BUFFER_ROWS,
            sort_buffer_bytes: DEFAULT_SORT_BUFFER_BYTES,
            tapes_per_set: DEFAULT_TAPES_PER_SET,
            tapesets: DEFAULT_TAPESETS,
            merge_trigger_level: DEFAULT_MERGE_TRIGGER_LEVEL,
            prealloc_start: DEFAULT_PREALLOC_START,
            prealloc_cap: DEFAULT_PREALLOC_CAP,
            blocks_per_range: DEFAULT_BLOCKS_PER_RANGE,
            btree_fill_percent: 90,
            compression: CompressionConfig::default(),
            retry: RetryPolicy::default(),
            background_maintenance: true,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a small configuration for testing: 4 KB blocks, tiny sort
    /// buffers and no background workers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            block_size: MIN_BLOCK_SIZE,
            buffer_frames: 256,
            sort_buffer_rows: 256,
            sort_buffer_bytes: 1024 * 1024,
            background_maintenance: false,
            retry: RetryPolicy {
                max_attempts: 20,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    /// Sets the block size.
    #[must_use]
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the number of buffer frames.
    #[must_use]
    pub fn with_buffer_frames(mut self, frames: usize) -> Self {
        self.buffer_frames = frames;
        self
    }

    /// Sets the sort buffer row limit.
    #[must_use]
    pub fn with_sort_buffer_rows(mut self, rows: usize) -> Self {
        self.sort_buffer_rows = rows;
        self
    }

    /// Sets the sort buffer byte limit.
    #[must_use]
    pub fn with_sort_buffer_bytes(mut self, bytes: usize) -> Self {
        self.sort_buffer_bytes = bytes;
        self
    }

    /// Sets the number of tapes per TapeSet.
    #[must_use]
    pub fn with_tapes_per_set(mut self, tapes: usize) -> Self {
        self.tapes_per_set = tapes;
        self
    }

    /// Sets the number of TapeSets.
    #[must_use]
    pub fn with_tapesets(mut self, count: usize) -> Self {
        self.tapesets = count;
        self
    }

    /// Sets the merge trigger level.
    #[must_use]
    pub fn with_merge_trigger_level(mut self, level: u32) -> Self {
        self.merge_trigger_level = level;
        self
    }

    /// Sets the tape preallocation batch bounds.
    #[must_use]
    pub fn with_prealloc(mut self, start: usize, cap: usize) -> Self {
        self.prealloc_start = start;
        self.prealloc_cap = cap;
        self
    }

    /// Sets the number of data blocks per range summary.
    #[must_use]
    pub fn with_blocks_per_range(mut self, blocks: usize) -> Self {
        self.blocks_per_range = blocks;
        self
    }

    /// Sets the B-tree fill percentage.
    #[must_use]
    pub fn with_btree_fill_percent(mut self, percent: u8) -> Self {
        self.btree_fill_percent = percent;
        self
    }

    /// Sets the compression configuration.
    #[must_use]
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables background merge/vacuum workers.
    #[must_use]
    pub fn with_background_maintenance(mut self, enabled: bool) -> Self {
        self.background_maintenance = enabled;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.block_size < MIN_BLOCK_SIZE || self.block_size > MAX_BLOCK_SIZE {
            return Err(format!(
                "block_size must be between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE} bytes"
            ));
        }
        if !self.block_size.is_power_of_two() {
            return Err("block_size must be a power of 2".to_string());
        }
        if self.buffer_frames < MIN_BUFFER_FRAMES {
            return Err(format!("buffer_frames must be at least {MIN_BUFFER_FRAMES}"));
        }
        if self.sort_buffer_rows == 0 || self.sort_buffer_bytes == 0 {
            return Err("sort buffer limits must be non-zero".to_string());
        }
        if !(MIN_TAPES_PER_SET..=MAX_TAPES_PER_SET).contains(&self.tapes_per_set) {
            return Err(format!(
                "tapes_per_set must be between {MIN_TAPES_PER_SET} and {MAX_TAPES_PER_SET}"
            ));
        }
        if self.tapesets == 0 || self.tapesets > MAX_TAPESETS {
            return Err(format!("tapesets must be between 1 and {MAX_TAPESETS}"));
        }
        if self.merge_trigger_level == 0 {
            return Err("merge_trigger_level must be at least 1".to_string());
        }
        if self.prealloc_start == 0
            || self.prealloc_start > self.prealloc_cap
            || self.prealloc_cap > MAX_PREALLOC_CACHE
        {
            return Err(format!(
                "prealloc batches must satisfy 0 < start <= cap <= {MAX_PREALLOC_CACHE}"
            ));
        }
        if self.blocks_per_range == 0 {
            return Err("blocks_per_range must be non-zero".to_string());
        }
        if !(50..=100).contains(&self.btree_fill_percent) {
            return Err("btree_fill_percent must be between 50 and 100".to_string());
        }
        self.compression.validate()?;
        self.retry.validate()
    }
}

/// Column compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Store large same-key groups column-wise.
    pub enabled: bool,

    /// Minimum rows for a group to be compressed.
    pub min_group_rows: usize,

    /// Minimum encoded bytes for a group to be compressed.
    pub min_group_bytes: usize,

    /// Maximum rows in one compressed group.
    pub max_group_rows: usize,

    /// Maximum encoded bytes accumulated into one compressed group.
    pub max_group_bytes: usize,

    /// Columns stored together in one chunk.
    pub column_block_size: usize,

    /// Chunks larger than this are stored out of line.
    pub outline_threshold: usize,

    /// A value larger than this ends the current group and is stored plain.
    pub oversized_value: usize,

    /// Compress chunks with LZ4.
    pub lz4: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_group_rows: DEFAULT_MIN_GROUP_ROWS,
            min_group_bytes: DEFAULT_MIN_GROUP_BYTES,
            max_group_rows: DEFAULT_MAX_GROUP_ROWS,
            max_group_bytes: DEFAULT_MAX_GROUP_BYTES,
            column_block_size: DEFAULT_COLUMN_BLOCK_SIZE,
            outline_threshold: DEFAULT_OUTLINE_THRESHOLD,
            oversized_value: DEFAULT_OVERSIZED_VALUE,
            lz4: true,
        }
    }
}

impl CompressionConfig {
    /// Returns an enabled configuration with default thresholds.
    #[must_use]
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    /// Sets the minimum group size in rows.
    #[must_use]
    pub fn with_min_group_rows(mut self, rows: usize) -> Self {
        self.min_group_rows = rows;
        self
    }

    /// Sets the minimum group size in bytes.
    #[must_use]
    pub fn with_min_group_bytes(mut self, bytes: usize) -> Self {
        self.min_group_bytes = bytes;
        self
    }

    /// Sets the maximum group size in rows.
    #[must_use]
    pub fn with_max_group_rows(mut self, rows: usize) -> Self {
        self.max_group_rows = rows;
        self
    }

    /// Sets the maximum group size in bytes.
    #[must_use]
    pub fn with_max_group_bytes(mut self, bytes: usize) -> Self {
        self.max_group_bytes = bytes;
        self
    }

    /// Sets the column block size.
    #[must_use]
    pub fn with_column_block_size(mut self, columns: usize) -> Self {
        self.column_block_size = columns;
        self
    }

    /// Sets the out-of-line threshold.
    #[must_use]
    pub fn with_outline_threshold(mut self, bytes: usize) -> Self {
        self.outline_threshold = bytes;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.min_group_rows < 2 {
            return Err("compression.min_group_rows must be at least 2".to_string());
        }
        if self.max_group_rows < self.min_group_rows || self.max_group_rows > u16::MAX as usize {
            return Err(
                "compression.max_group_rows must be between min_group_rows and 65535".to_string(),
            );
        }
        if self.max_group_bytes < self.min_group_bytes {
            return Err("compression.max_group_bytes must be at least min_group_bytes".to_string());
        }
        if self.column_block_size == 0 {
            return Err("compression.column_block_size must be non-zero".to_string());
        }
        if self.outline_threshold < 64 {
            return Err("compression.outline_threshold must be at least 64 bytes".to_string());
        }
        Ok(())
    }
}

/// Bounded retry with exponential backoff.
///
/// Used for TapeSet contention and for polling until a transaction becomes
/// visible to every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts before giving up.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound of the delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to sleep after `attempt` failures (0-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err("retry.initial_backoff must not exceed max_backoff".to_string());
        }
        Ok(())
    }
}

/// Serde helper for Duration using humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
