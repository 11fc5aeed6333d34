use crate::value::InternalValue;
use min_max_heap::MinMaxHeap;

pub type BoxedIterator<'a> = Box<dyn Iterator<Item = crate::Result<InternalValue>> + 'a>;

type IteratorIndex = usize;

#[derive(Debug)]
struct IteratorValue((IteratorIndex, InternalValue));

impl std::ops::Deref for IteratorValue {
    type Target = InternalValue;

    fn deref(&self) -> &Self::Target {
        &self.0 .1
    }
}

impl PartialEq for IteratorValue {
    fn eq(&self, other: &Self) -> bool {
        self.0 .1 == other.0 .1
    }
}
impl Eq for IteratorValue {}

impl PartialOrd for IteratorValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IteratorValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0 .1.cmp(&other.0 .1)
    }
}

/// This iterator can iterate through N iterators simultaneously in order
/// This is achieved by advancing the iterators that yield the lowest item
/// and merging using a simple k-way merge algorithm.
///
/// All versions of all keys are yielded, in internal order; dropping
/// obsolete versions is the compaction iterator's business.
#[allow(clippy::module_name_repetitions)]
pub struct MergeIterator<'a> {
    iterators: Vec<BoxedIterator<'a>>,
    heap: MinMaxHeap<IteratorValue>,
    initialized: bool,
}

impl<'a> MergeIterator<'a> {
    /// Initializes a new merge iterator
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        Self {
            iterators,
            heap: MinMaxHeap::new(),
            initialized: false,
        }
    }

    fn advance_iter(&mut self, idx: usize) -> crate::Result<()> {
        let iterator = self.iterators.get_mut(idx).expect("iter should exist");

        if let Some(value) = iterator.next() {
            self.heap.push(IteratorValue((idx, value?)));
        }

        Ok(())
    }

    fn push_next(&mut self) -> crate::Result<()> {
        for idx in 0..self.iterators.len() {
            self.advance_iter(idx)?;
        }

        Ok(())
    }
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.initialized {
            if let Err(e) = self.push_next() {
                return Some(Err(e));
            };
            self.initialized = true;
        }

        let head = self.heap.pop_min()?;

        let (iter_idx_consumed, _) = head.0;
        if let Err(e) = self.advance_iter(iter_idx_consumed) {
            return Some(Err(e));
        }

        Some(Ok(head.0 .1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ValueKind;
    use test_log::test;

    #[test]
    fn test_non_overlapping() -> crate::Result<()> {
        let iter0 = (0u64..5)
            .map(|x| InternalValue::new(x.to_be_bytes(), *b"old", 0, ValueKind::Set));
        let iter1 = (5u64..10)
            .map(|x| InternalValue::new(x.to_be_bytes(), *b"new", 3, ValueKind::Set));
        let iter2 = (10u64..15)
            .map(|x| InternalValue::new(x.to_be_bytes(), *b"", 1, ValueKind::Delete));

        let iter0: BoxedIterator = Box::new(iter0.map(Ok));
        let iter1: BoxedIterator = Box::new(iter1.map(Ok));
        let iter2: BoxedIterator = Box::new(iter2.map(Ok));

        let merge_iter = MergeIterator::new(vec![iter0, iter1, iter2]);

        for (idx, item) in merge_iter.enumerate() {
            let item = item?;
            assert_eq!(item.key.user_key, (idx as u64).to_be_bytes().into());
        }

        Ok(())
    }

    #[test]
    fn test_all_versions_yielded() -> crate::Result<()> {
        let vec0 = vec![
            InternalValue::new(*b"a", *b"old", 0, ValueKind::Set),
            InternalValue::new(*b"b", *b"old", 0, ValueKind::Set),
        ];

        let vec1 = vec![
            InternalValue::new(*b"a", *b"new", 1, ValueKind::Set),
            InternalValue::new(*b"b", *b"new", 1, ValueKind::Set),
        ];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let merge_iter = MergeIterator::new(vec![iter0, iter1]);
        let items = merge_iter.collect::<crate::Result<Vec<_>>>()?;

        // Newest version of each key first
        assert_eq!(
            items,
            vec![
                InternalValue::new(*b"a", *b"new", 1, ValueKind::Set),
                InternalValue::new(*b"a", *b"old", 0, ValueKind::Set),
                InternalValue::new(*b"b", *b"new", 1, ValueKind::Set),
                InternalValue::new(*b"b", *b"old", 0, ValueKind::Set),
            ]
        );

        Ok(())
    }
}
