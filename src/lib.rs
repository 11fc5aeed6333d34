//! Compaction core for a leveled LSM-tree storage engine.
//!
//! ##### NOTE
//!
//! > This crate provides the decision machinery of leveled compaction:
//! > version management, level-ordering checks, compaction picking and
//! > shaping, tombstone elision, the snapshot-aware merge, and the
//! > coordinator that admits and installs compactions.
//! > The write-ahead log, the block-based table format and the user-facing
//! > read iterator are collaborator contracts, supplied by the embedder.
//!
//! ##### About
//!
//! An LSM-tree accumulates sorted runs of immutable tables across levels.
//! L0 is an unsorted overlay ordered by write history; deeper levels are
//! sorted runs, disjoint in user-key space. Compaction merges overlapping
//! runs downward, bounded by per-level size targets and grandparent
//! overlap, while honoring snapshots and atomic units so that no user key
//! ever tears across compactions.
//!
//! # Example usage
//!
//! ```
//! use scree::{Config, SequenceNumberCounter};
//! #
//! # let folder = tempfile::tempdir()?;
//!
//! let store = Config::new(folder.path()).open()?;
//! let seqno = SequenceNumberCounter::default();
//!
//! store.insert("my_key", "my_value", seqno.next())?;
//!
//! let item = store.get("my_key", None)?;
//! assert_eq!(Some("my_value".as_bytes().into()), item);
//!
//! // Persist the memtable as an L0 table
//! store.flush_active_memtable()?;
//!
//! // Force everything overlapping [a, z] down the tree
//! store.compact_range("a", "z")?;
//!
//! let item = store.get("my_key", None)?;
//! assert_eq!(Some("my_value".as_bytes().into()), item);
//!
//! store.stop();
//! #
//! # Ok::<(), scree::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]

pub mod compaction;

mod comparator;
mod config;
mod serde;
mod error;
mod event;
mod file;
mod limiter;
mod memtable;
mod merge;
mod merge_operator;
mod seqno;
mod snapshot;
mod stop_signal;
mod store;
mod table;
mod value;
mod version;

/// Monotone number identifying a table, log or manifest file
pub type FileNum = u64;

pub use {
    comparator::{BytewiseComparator, Comparator},
    config::Config,
    error::{Error, Result},
    event::{EventListener, LogEventListener},
    limiter::{CompactionLimiter, Unlimited},
    memtable::MemTable,
    merge_operator::MergeOperator,
    seqno::SequenceNumberCounter,
    serde::{DeserializeError, SerializeError},
    snapshot::SnapshotList,
    store::{Snapshot, Store},
    table::{mem::MemTables, TableMeta, TableProvider, TableWriter},
    value::{InternalKey, InternalValue, RangeTombstone, SeqNo, UserKey, UserValue, ValueKind},
    version::{check::OrderingViolation, Version, VersionEdit, NUM_LEVELS},
};
