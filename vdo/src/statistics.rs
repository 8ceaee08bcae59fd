//! Counter snapshot exposed by the volume.

/// Point-in-time statistics. All counters are cumulative since load except
/// the gauges noted inline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VdoStatistics {
    /// Gauge: logical blocks currently mapped.
    pub logical_blocks_used: u64,
    /// Gauge: data blocks holding at least one reference.
    pub data_blocks_used: u64,
    /// Gauge: physical blocks holding block-map tree pages.
    pub block_map_data_blocks: u64,
    pub reads: u64,
    pub writes: u64,
    pub discards: u64,
    /// Writes satisfied by sharing an existing block.
    pub dedupe_hits: u64,
    /// Writes of all-zero blocks elided to unmapped entries.
    pub zero_block_elisions: u64,
    pub journal_blocks_committed: u64,
    pub journal_blocks_reaped: u64,
    pub page_cache_hits: u64,
    pub page_cache_misses: u64,
    pub page_cache_evictions: u64,
    pub page_cache_writes: u64,
    pub slabs_scrubbed: u64,
    pub flushes_completed: u64,
    pub complete_recoveries: u64,
    pub read_only_recoveries: u64,
}
