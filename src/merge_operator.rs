use crate::UserValue;

/// Embedder-provided operator that combines partial values
///
/// Written as `Merge` entries; compaction folds runs of merge operands
/// into a single value. The operation must be associative.
pub trait MergeOperator: Send + Sync {
    /// Combines the older value (or operand) with the newer operand
    /// for the given user key
    fn merge(&self, user_key: &[u8], older: &[u8], newer: &[u8]) -> UserValue;
}
