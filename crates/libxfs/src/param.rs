//! Tunables of the shim.

/// Number of log item descriptors in one chunk.
pub const LIC_NUM_SLOTS: usize = 15;

/// Granularity of the buffer log item dirty map in bytes.
pub const BLI_CHUNK: usize = 128;

/// Minimum number of inode hash buckets.
pub const IHASH_MIN: usize = 64;

/// Maximum number of inode hash buckets.
pub const IHASH_MAX: usize = 8192;

/// Minimum number of cluster hash buckets.
pub const CHASH_MIN: usize = 37;

/// Base block reservation for entering a name into a directory.
pub const DIRENTER_BASE_BLOCKS: u64 = 4;

/// Log space reserved by a rename transaction.
pub const RENAME_LOG_RES: u32 = 64 * 1024;

/// Log count of a rename transaction.
pub const RENAME_LOG_COUNT: u32 = 2;

/// Log space reserved by create/link/remove transactions.
pub const DIROP_LOG_RES: u32 = 32 * 1024;

/// Log count of create/link/remove transactions.
pub const DIROP_LOG_COUNT: u32 = 2;

/// Rename restarts tolerated before a diagnostic is logged.
pub const RENAME_RETRY_WARN: u64 = 100;

/// Default capacity of the directory name lookup cache.
pub const NAME_CACHE_SIZE: usize = 1024;
