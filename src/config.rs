//! Tunable constants for the managed arena and its GC threads.

use std::time::Duration;

/// Configuration for a root [`crate::arena::ManagedArena`].
///
/// Mirrors the specification's stated defaults exactly; see `SPEC_FULL.md`
/// §3/§4.1/§4.4/§4.5.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Default backing-block capacity in bytes.
    pub block_size: usize,
    /// Initial handle-table capacity (entries).
    pub table_init_capacity: u32,
    /// Fragmentation ratio (`dead_bytes / (live_bytes + dead_bytes)`) at or
    /// above which the compactor compacts an arena.
    pub compact_threshold: f64,
    /// Cleaner thread sleep interval.
    pub cleaner_interval: Duration,
    /// Compactor thread sleep interval.
    pub compactor_interval: Duration,
    /// Maximum number of arenas visited in one tree snapshot.
    pub max_snapshot_arenas: usize,
    /// Safety cap for `gc_flush`.
    pub gc_flush_timeout: Duration,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            table_init_capacity: 256,
            compact_threshold: 0.5,
            cleaner_interval: Duration::from_millis(10),
            compactor_interval: Duration::from_millis(100),
            max_snapshot_arenas: 64,
            gc_flush_timeout: Duration::from_millis(500),
        }
    }
}

impl ArenaConfig {
    /// Config with every default value; equivalent to [`Default::default`].
    pub fn new() -> Self {
        Self::default()
    }
}
