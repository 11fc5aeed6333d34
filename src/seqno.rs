use crate::SeqNo;
use std::sync::{
    atomic::{
        AtomicU64,
        Ordering::{Acquire, Release},
    },
    Arc,
};

/// Thread-safe sequence number generator
///
/// Values inserted with the same seqno are part of the same batch.
#[derive(Clone, Default, Debug)]
pub struct SequenceNumberCounter(Arc<AtomicU64>);

impl std::ops::Deref for SequenceNumberCounter {
    type Target = Arc<AtomicU64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl SequenceNumberCounter {
    /// Creates a new counter, setting it to some previous value
    #[must_use]
    pub fn new(prev: SeqNo) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    /// Gets the current sequence number.
    ///
    /// This should only be used when creating a snapshot.
    #[must_use]
    pub fn get(&self) -> SeqNo {
        self.load(Acquire)
    }

    /// Gets the next sequence number.
    #[must_use]
    pub fn next(&self) -> SeqNo {
        self.fetch_add(1, Release)
    }
}

/// Thread-safe file number generator
///
/// Tables, logs and the manifest share a single number space.
#[derive(Clone, Debug)]
pub struct FileNumCounter(Arc<AtomicU64>);

impl FileNumCounter {
    #[must_use]
    pub fn new(prev: u64) -> Self {
        Self(Arc::new(AtomicU64::new(prev)))
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Acquire)
    }

    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Release)
    }

    /// Only used by tests to provoke invariant violations
    #[doc(hidden)]
    pub fn reset(&self, value: u64) {
        self.0.store(value, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn seqno_counter() {
        let counter = SequenceNumberCounter::default();

        assert_eq!(0, counter.next());
        assert_eq!(1, counter.next());
        assert_eq!(2, counter.get());
    }
}
