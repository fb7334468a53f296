//! System-wide constants for SortHeap.
//!
//! This module defines the on-disk format constants and default limits
//! shared by the storage and engine crates.

// =============================================================================
// Block Constants
// =============================================================================

/// Default block size in bytes (8 KB).
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// Minimum block size in bytes (4 KB).
pub const MIN_BLOCK_SIZE: usize = 4 * 1024;

/// Maximum block size in bytes (32 KB).
///
/// Slot offsets are 16-bit, so a block must stay addressable by `u16`.
pub const MAX_BLOCK_SIZE: usize = 32 * 1024;

/// Page header size in bytes.
///
/// The header contains: magic (2), block type (1), version (1), block id (8),
/// lsn (8), checksum (4), flags (2), slot count (2), free offset (2),
/// free end (2), next (8), prev (8) = 48 bytes.
pub const PAGE_HEADER_SIZE: usize = 48;

/// Slot size in the page slot array: offset (2) + length (2).
pub const SLOT_SIZE: usize = 4;

/// Magic number stamped into every formatted page.
pub const PAGE_MAGIC: u16 = 0x5348;

/// On-disk page format version.
pub const PAGE_FORMAT_VERSION: u8 = 1;

/// Magic number of the engine metadata block ("SHEAP").
pub const META_MAGIC: u64 = 0x0000_0050_4145_4853;

/// Engine metadata format version.
pub const META_FORMAT_VERSION: u32 = 1;

// =============================================================================
// Sorting Constants
// =============================================================================

/// Number of extracted sort-key values cached alongside each in-memory tuple.
pub const MAX_CACHED_KEYS: usize = 4;

/// Default number of rows buffered before a sorted run is dumped.
pub const DEFAULT_SORT_BUFFER_ROWS: usize = 100_000;

/// Default number of bytes buffered before a sorted run is dumped (16 MB).
pub const DEFAULT_SORT_BUFFER_BYTES: usize = 16 * 1024 * 1024;

// =============================================================================
// TapeSet Constants
// =============================================================================

/// Default number of tapes per TapeSet, including the merge output tape.
pub const DEFAULT_TAPES_PER_SET: usize = 5;

/// Minimum number of tapes per TapeSet (two inputs plus one output).
pub const MIN_TAPES_PER_SET: usize = 3;

/// Maximum number of tapes per TapeSet.
pub const MAX_TAPES_PER_SET: usize = 32;

/// Default number of TapeSets per relation.
pub const DEFAULT_TAPESETS: usize = 2;

/// Maximum number of TapeSets per relation.
pub const MAX_TAPESETS: usize = 16;

/// Default polyphase level at which a background merge becomes worthwhile.
pub const DEFAULT_MERGE_TRIGGER_LEVEL: u32 = 3;

// =============================================================================
// Tape Preallocation Constants
// =============================================================================

/// First preallocation batch of a tape.
pub const DEFAULT_PREALLOC_START: usize = 4;

/// Largest preallocation batch of a tape.
pub const DEFAULT_PREALLOC_CAP: usize = 64;

/// Hard upper bound for the preallocation cache stored in a tape header.
pub const MAX_PREALLOC_CACHE: usize = 128;

// =============================================================================
// Index Constants
// =============================================================================

/// Default number of data blocks summarized by one block-range summary.
pub const DEFAULT_BLOCKS_PER_RANGE: usize = 4;

/// Values whose encoding exceeds this many bytes are not summarized.
pub const MAX_SUMMARY_VALUE_SIZE: usize = 256;

// =============================================================================
// Column Compression Constants
// =============================================================================

/// Default minimum rows for a same-key group to be stored columnar.
pub const DEFAULT_MIN_GROUP_ROWS: usize = 16;

/// Default minimum encoded bytes for a same-key group to be stored columnar.
pub const DEFAULT_MIN_GROUP_BYTES: usize = 512;

/// Default maximum rows in one compressed group (member index is `u16`).
pub const DEFAULT_MAX_GROUP_ROWS: usize = 4096;

/// Default maximum encoded bytes accumulated into one compressed group (1 MB).
pub const DEFAULT_MAX_GROUP_BYTES: usize = 1024 * 1024;

/// Default number of columns stored together in one column chunk.
pub const DEFAULT_COLUMN_BLOCK_SIZE: usize = 8;

/// Default chunk size above which a chunk is moved out of line.
pub const DEFAULT_OUTLINE_THRESHOLD: usize = 1024;

/// Default size above which a single value is considered an oversized value
/// that breaks a group.
pub const DEFAULT_OVERSIZED_VALUE: usize = 2048;

// =============================================================================
// WAL Constants
// =============================================================================

/// WAL record header size.
pub const WAL_RECORD_HEADER_SIZE: usize = 32;

/// Maximum WAL record size (16 MB).
pub const MAX_WAL_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// WAL record format version.
pub const WAL_FORMAT_VERSION: u8 = 1;

// =============================================================================
// Buffer Pool Constants
// =============================================================================

/// Default number of buffer frames.
pub const DEFAULT_BUFFER_FRAMES: usize = 1024;

/// Minimum number of buffer frames.
pub const MIN_BUFFER_FRAMES: usize = 16;
