//! The cache-manager collaborator boundary.
//!
//! The pipeline never caches data itself; it tells the cache manager when
//! cached contents must be purged (before retrying a conflicted open) and
//! when a server reported sizes that invalidate what is cached.

use crate::fcb::Fcb;
use crate::sync_helpers::Arc;
use std::ops::Range;

/// File sizes as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileSizes {
    pub file_size: u64,
    pub allocation_size: u64,
}

/// Hooks the owning cache layer provides. Implementations must not call
/// back into the pipeline; they may be invoked while FCB locks are held.
pub trait CacheManager: Send + Sync {
    /// Purges cached data for the FCB (the whole file when `byte_range` is
    /// `None`). Returns whether anything was actually evicted.
    fn purge_cached_data(
        &self,
        _fcb: &Arc<Fcb>,
        _byte_range: Option<Range<u64>>,
        _force_flush: bool,
        _evict_clean_pages: bool,
    ) -> bool {
        false
    }

    /// Tells the cache layer the file's sizes changed (truncation on
    /// overwrite, or server-reported sizes diverging from cached state).
    fn notify_new_file_sizes(&self, _fcb: &Arc<Fcb>, _sizes: FileSizes) -> crate::Result<()> {
        Ok(())
    }

    /// Whether any cached data exists for the FCB.
    fn is_file_cached(&self, _fcb: &Arc<Fcb>) -> bool {
        false
    }
}

/// Cache manager for configurations without a cache layer.
pub struct NoopCacheManager;

impl CacheManager for NoopCacheManager {}
