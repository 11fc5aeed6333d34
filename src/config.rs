use crate::{
    comparator::{BytewiseComparator, Comparator},
    event::{EventListener, LogEventListener},
    limiter::{CompactionLimiter, Unlimited},
    merge_operator::MergeOperator,
    table::{mem::MemTables, TableProvider},
    version::NUM_LEVELS,
    Store,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

const DEFAULT_FILE_FOLDER: &str = ".scree.data";

/// Store configuration
#[derive(Clone)]
pub struct Config {
    /// Folder path, used for the manifest
    pub path: PathBuf,

    /// User-key ordering; fixed for the lifetime of the store
    pub comparator: Arc<dyn Comparator>,

    /// Combine operator for `Merge` entries
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Sorted-table access; the table format is the embedder's business
    pub table_provider: Arc<dyn TableProvider>,

    /// Maximum size of the mutable memtable before it is sealed
    pub max_memtable_size: u32,

    /// Amount of L0 tables that trigger an L0 compaction
    ///
    /// Same as `level0_file_num_compaction_trigger` in RocksDB
    pub l0_compaction_trigger: usize,

    /// Maximum amount of data in the base level
    ///
    /// Same as `max_bytes_for_level_base` in RocksDB
    pub l_base_max_bytes: u64,

    /// Size ratio between levels of the LSM tree (a.k.a. fanout, growth rate)
    pub level_multiplier: u64,

    /// Target table size at the first level; doubles per level
    ///
    /// Same as `target_file_size_base` in RocksDB
    pub target_file_size_base: u64,

    /// Upper bound of compactions running simultaneously
    pub max_concurrent_compactions: usize,

    /// Whether an external write-ahead log is in use
    ///
    /// Enables the flush invariant checks on memtable log numbers.
    pub wal_enabled: bool,

    /// Write pacing, shared across all compactions
    pub limiter: Arc<dyn CompactionLimiter>,

    /// Listener for background events
    pub event_listener: Arc<dyn EventListener>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: DEFAULT_FILE_FOLDER.into(),
            comparator: Arc::new(BytewiseComparator),
            merge_operator: None,
            table_provider: MemTables::new(),
            max_memtable_size: 8 * 1_024 * 1_024,
            l0_compaction_trigger: 4,
            l_base_max_bytes: 64 * 1_024 * 1_024,
            level_multiplier: 10,
            target_file_size_base: 2 * 1_024 * 1_024,
            max_concurrent_compactions: 1,
            wal_enabled: true,
            limiter: Arc::new(Unlimited),
            event_listener: Arc::new(LogEventListener),
        }
    }
}

impl Config {
    /// Initializes a new config
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            ..Default::default()
        }
    }

    /// Sets the user-key comparator.
    ///
    /// The comparator name is recorded in the manifest; reopening with a
    /// different one is a fatal error.
    #[must_use]
    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Sets the merge operator for `Merge` entries.
    #[must_use]
    pub fn merge_operator(mut self, op: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(op);
        self
    }

    /// Sets the sorted-table provider.
    #[must_use]
    pub fn table_provider(mut self, provider: Arc<dyn TableProvider>) -> Self {
        self.table_provider = provider;
        self
    }

    /// Sets the maximum memtable size.
    ///
    /// Defaults to 8 MiB.
    #[must_use]
    pub fn max_memtable_size(mut self, size: u32) -> Self {
        self.max_memtable_size = size;
        self
    }

    /// Sets the amount of L0 tables that trigger an L0 compaction.
    ///
    /// Defaults to 4, like `LevelDB` and `RocksDB`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn l0_compaction_trigger(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.l0_compaction_trigger = n;
        self
    }

    /// Sets the size ratio between levels of the LSM tree (a.k.a. fanout, growth rate).
    ///
    /// Defaults to 10.
    ///
    /// # Panics
    ///
    /// Panics if `n` is less than 2.
    #[must_use]
    pub fn level_multiplier(mut self, n: u64) -> Self {
        assert!(n > 1);

        self.level_multiplier = n;
        self
    }

    /// Sets the target table size of the first level.
    ///
    /// Defaults to 2 MiB; each deeper level doubles it.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn target_file_size_base(mut self, n: u64) -> Self {
        assert!(n > 0);

        self.target_file_size_base = n;
        self
    }

    /// Sets the upper bound of compactions running simultaneously.
    ///
    /// Defaults to 1.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn max_concurrent_compactions(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.max_concurrent_compactions = n;
        self
    }

    /// Disables the flush invariant checks tied to the external WAL.
    #[must_use]
    pub fn disable_wal(mut self) -> Self {
        self.wal_enabled = false;
        self
    }

    /// Sets the compaction rate limiter.
    #[must_use]
    pub fn limiter(mut self, limiter: Arc<dyn CompactionLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Sets the event listener.
    #[must_use]
    pub fn event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.event_listener = listener;
        self
    }

    /// Target table size at `level`
    #[must_use]
    pub fn target_file_size(&self, level: usize) -> u64 {
        debug_assert!(level < NUM_LEVELS);
        self.target_file_size_base << level
    }

    /// Once a compaction at `level` would exceed this, growing its
    /// start-level input is refused
    #[must_use]
    pub fn expanded_compaction_byte_size_limit(&self, level: usize) -> u64 {
        25 * self.target_file_size(level)
    }

    /// Upper bound of grandparent overlap per output table at `level`
    #[must_use]
    pub fn max_grandparent_overlap_bytes(&self, level: usize) -> u64 {
        10 * self.target_file_size(level)
    }

    /// Opens a store using the config.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs, or if the manifest was
    /// written by a different comparator.
    pub fn open(self) -> crate::Result<Store> {
        Store::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn size_knobs() {
        let config = Config::default().target_file_size_base(1_024);

        assert_eq!(1_024, config.target_file_size(0));
        assert_eq!(2_048, config.target_file_size(1));
        assert_eq!(25 * 2_048, config.expanded_compaction_byte_size_limit(1));
        assert_eq!(10 * 4_096, config.max_grandparent_overlap_bytes(2));
    }
}
