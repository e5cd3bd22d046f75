use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

/// Auto-vacuum modes understood by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoVacuum {
    None,
    Full,
    Incremental,
}

impl AutoVacuum {
    pub fn as_str(self) -> &'static str {
        match self {
            AutoVacuum::None => "none",
            AutoVacuum::Full => "full",
            AutoVacuum::Incremental => "incremental",
        }
    }

    /// The integer the engine reports back when the pragma is read.
    pub fn as_pragma_int(self) -> i64 {
        match self {
            AutoVacuum::None => 0,
            AutoVacuum::Full => 1,
            AutoVacuum::Incremental => 2,
        }
    }
}

/// Called with (key_id, key) for every key removed by capacity trimming.
#[derive(Clone)]
pub struct EvictionHook(pub Arc<dyn Fn(i64, &str) + Send + Sync>);

impl fmt::Debug for EvictionHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EvictionHook(..)")
    }
}

/// Runtime configuration for a cache instance.
///
/// `path` empty with `memory` unset opens a private on-disk temporary
/// database owned by the cache; `memory` opens a shared in-memory instance
/// visible to every pooled connection of this cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub memory: bool,
    /// Total byte budget. `0` leaves the persisted setting as-is, negative
    /// removes any limit.
    pub capacity: i64,
    /// Database page size, applied to empty databases only. `0` picks the
    /// default of 1<<16.
    pub page_size: u32,
    pub set_auto_vacuum: Option<AutoVacuum>,
    /// Fail open() unless the database reports this auto-vacuum mode.
    pub require_auto_vacuum: Option<AutoVacuum>,
    pub set_journal_mode: Option<String>,
    /// Synchronous level 0..=3. Unset leaves the engine default.
    pub set_synchronous: Option<u8>,
    pub set_locking_mode: Option<String>,
    /// Memory-map budget in bytes; negative leaves the engine default.
    pub mmap_size: i64,
    /// Engine semantics: negative is KiB, positive is pages.
    pub cache_size: Option<i64>,
    /// Per-connection page-count ceiling. The engine may clamp this, so the
    /// applied value is not verified.
    pub max_page_count: Option<u32>,
    /// Upper bound on a single value segment.
    pub max_blob_size: i64,
    /// Engine-enforced maximum text/blob length.
    pub length_limit: Option<i32>,
    pub journal_size_limit: Option<i64>,
    /// Create the schema without the orphan-blob GC trigger; deletes then
    /// cascade in application code instead.
    pub no_triggers: bool,
    pub dont_init_schema: bool,
    pub busy_timeout: Duration,
    /// Fired once if the initial schema/pragma sequence on a new connection
    /// has to wait on a competing writer.
    pub conn_blocked_on_busy: Option<SyncSender<()>>,
    pub on_evict: Option<EvictionHook>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 1 << 16;
pub const DEFAULT_MAX_BLOB_SIZE: i64 = 1 << 20;

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            memory: false,
            capacity: 0,
            page_size: 0,
            set_auto_vacuum: None,
            require_auto_vacuum: None,
            set_journal_mode: None,
            set_synchronous: None,
            set_locking_mode: None,
            mmap_size: -1,
            cache_size: None,
            max_page_count: None,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            length_limit: None,
            journal_size_limit: None,
            no_triggers: false,
            dont_init_schema: false,
            busy_timeout: Duration::from_secs(10),
            conn_blocked_on_busy: None,
            on_evict: None,
        }
    }
}

impl CacheConfig {
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_memory(mut self) -> Self {
        self.memory = true;
        self
    }

    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_blob_size(mut self, max_blob_size: i64) -> Self {
        assert!(max_blob_size > 0, "max_blob_size must be positive");
        self.max_blob_size = max_blob_size;
        self
    }

    pub fn with_journal_mode(mut self, mode: impl Into<String>) -> Self {
        self.set_journal_mode = Some(mode.into());
        self
    }

    pub fn with_eviction_hook(
        mut self,
        hook: impl Fn(i64, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_evict = Some(EvictionHook(Arc::new(hook)));
        self
    }

    pub(crate) fn effective_page_size(&self) -> u32 {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AutoVacuum, CacheConfig, DEFAULT_MAX_BLOB_SIZE, DEFAULT_PAGE_SIZE};

    #[test]
    fn defaults_leave_settings_alone() {
        let cfg = CacheConfig::default();
        assert_eq!(cfg.capacity, 0);
        assert_eq!(cfg.effective_page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(cfg.max_blob_size, DEFAULT_MAX_BLOB_SIZE);
        assert!(cfg.set_journal_mode.is_none());
        assert!(!cfg.no_triggers);
    }

    #[test]
    fn auto_vacuum_pragma_ints_match_engine() {
        assert_eq!(AutoVacuum::None.as_pragma_int(), 0);
        assert_eq!(AutoVacuum::Full.as_pragma_int(), 1);
        assert_eq!(AutoVacuum::Incremental.as_pragma_int(), 2);
    }
}
