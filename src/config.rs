/// Size of a page, both on disk and in a buffer pool frame.
pub const PAGE_SIZE: usize = 4096;

/// Default number of frames held by the buffer pool.
pub const DEFAULT_BUFFER_POOL_PAGES: usize = 128;

/// Which policy the buffer pool uses to pick an eviction victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Lru,
    Fifo,
}

/// Runtime knobs, read once at process start and passed to the components
/// that need them. There is no global configuration instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of frames in the buffer pool.
    pub buffer_pool_pages: usize,
    /// Worker threads serving read-ahead requests.
    pub io_worker_threads: usize,
    /// Upper bound on pages fetched by one batched `get_pages` call.
    pub io_batch_max: usize,
    /// Background flusher wake-up interval. 0 disables the flusher.
    pub flush_interval_ms: u64,
    /// Dirty pages written back per flusher cycle.
    pub max_flush_per_cycle: usize,
    /// Allow the pool to grow once when no victim is available.
    pub autoresize_enabled: bool,
    /// Prefetch pages ahead of a detected sequential scan.
    pub readahead_enabled: bool,
    /// How many pages a single read-ahead may prefetch.
    pub readahead_window: u32,
    pub replacement_policy: ReplacementPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_pool_pages: DEFAULT_BUFFER_POOL_PAGES,
            io_worker_threads: 1,
            io_batch_max: 64,
            flush_interval_ms: 200,
            max_flush_per_cycle: 64,
            autoresize_enabled: false,
            readahead_enabled: true,
            readahead_window: 4,
            replacement_policy: ReplacementPolicy::Lru,
        }
    }
}
