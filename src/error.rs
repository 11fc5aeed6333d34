use crate::{
    serde::{DeserializeError, SerializeError},
    version::check::OrderingViolation,
    FileNum,
};
use std::sync::Arc;

/// Represents errors that can occur in the compaction core
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Serialize(SerializeError),

    /// Deserialization failed
    Deserialize(DeserializeError),

    /// The store was created with a different comparator
    ComparatorMismatch {
        /// Name stored in the manifest
        expected: String,

        /// Name of the configured comparator
        found: String,
    },

    /// A version failed the level-ordering check
    ///
    /// This is fatal: the offending version edit is refused and the
    /// store is marked corrupt.
    Ordering(Box<OrderingViolation>),

    /// A `Merge` entry was encountered but no merge operator is configured
    MergeOperatorMissing,

    /// A `SingleDelete` found a `Merge` beneath it in the same snapshot stripe
    SingleDeleteOverMerge,

    /// A queued memtable violated the flush invariants
    ///
    /// Either its log number collides with the new log's number, or the
    /// file number counter was reset.
    FlushInvariant,

    /// A table referenced by a version is unknown to the table provider
    TableMissing(FileNum),

    /// A previous fatal background error; all further writes fail with this
    Latched(Arc<Error>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ordering(violation) => write!(f, "{violation}"),
            _ => write!(f, "CompactionError: {self:?}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SerializeError> for Error {
    fn from(value: SerializeError) -> Self {
        Self::Serialize(value)
    }
}

impl From<DeserializeError> for Error {
    fn from(value: DeserializeError) -> Self {
        Self::Deserialize(value)
    }
}

impl From<Box<OrderingViolation>> for Error {
    fn from(value: Box<OrderingViolation>) -> Self {
        Self::Ordering(value)
    }
}

/// Compaction core result
pub type Result<T> = std::result::Result<T, Error>;
