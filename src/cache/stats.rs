/// Point-in-time counters exposed for observability (spec §6, "Stats").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub blocks_read: u64,
    pub blocks_read_hit: u64,
    pub cache_size: u32,
    pub read_cache_size: u32,
    pub write_cache_size: u32,
}

/// Anything that can accept a stats snapshot. The block cache implements
/// `get_stats` directly; this trait exists so a session-level stats
/// collector can be handed a uniform reporting surface instead of reaching
/// into the cache's fields.
pub trait StatsReporter {
    fn get_stats(&self, status: &mut CacheStatus);
}
