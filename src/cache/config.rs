use serde::Deserialize;

/// Fixed block size the cache operates in, matching the BitTorrent wire
/// protocol's usual request size. Kept distinct from `crate::BLOCK_MAX`
/// (the peer-wire request-size constant) even though both are 16 KiB today,
/// since they describe different layers and could diverge.
pub const CACHE_BLOCK_SIZE: u32 = 1 << 14;

/// Cache-wide configuration, set at construction and partially mutable via
/// `BlockCache::resize`.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum resident blocks (read + write) across all pieces.
    pub max_size: u32,
    /// Default residency hint, in seconds, applied when a job doesn't
    /// specify its own `cache_min_time`.
    pub default_cache_min_time: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            default_cache_min_time: 0,
        }
    }
}
