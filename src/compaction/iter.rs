use crate::{
    merge::MergeIterator,
    merge_operator::MergeOperator,
    value::{InternalKey, InternalValue, RangeTombstone, SeqNo, ValueKind},
    Error,
};
use std::sync::Arc;

/// Filters a merged stream of point entries down to what must survive
/// the compaction
///
/// Entries are partitioned by snapshot stripe: the versions of a key
/// whose seqnos fall between two adjacent live snapshots are
/// indistinguishable to readers, so only the newest per stripe is kept.
/// Tombstones in the bottom stripe are additionally dropped when the
/// elision predicate proves nothing beneath the output range can hold
/// the key.
///
/// The input must yield point entries only; range tombstones travel
/// beside the point merge.
pub struct CompactionIter<'a> {
    inner: MergeIterator<'a>,

    /// Live snapshot seqnos, ascending
    snapshots: Vec<SeqNo>,

    merge_operator: Option<Arc<dyn MergeOperator>>,

    /// `elide_tombstone` of the owning compaction
    elide: Box<dyn Fn(&[u8]) -> bool + 'a>,

    /// All range tombstones of the compaction's inputs; a point entry
    /// covered by a same-stripe newer tombstone is superseded
    tombstones: Vec<RangeTombstone>,

    /// Surviving bottom-stripe keys get their seqno rewritten to 0
    allow_zero_seqnum: bool,

    peeked: Option<InternalValue>,
}

impl<'a> CompactionIter<'a> {
    pub fn new(
        inner: MergeIterator<'a>,
        snapshots: Vec<SeqNo>,
        merge_operator: Option<Arc<dyn MergeOperator>>,
        elide: Box<dyn Fn(&[u8]) -> bool + 'a>,
        tombstones: Vec<RangeTombstone>,
        allow_zero_seqnum: bool,
    ) -> Self {
        debug_assert!(snapshots.windows(2).all(|w| w[0] < w[1]));

        Self {
            inner,
            snapshots,
            merge_operator,
            elide,
            tombstones,
            allow_zero_seqnum,
            peeked: None,
        }
    }

    /// Stripe index of a seqno; 0 is beneath the earliest snapshot
    fn stripe(&self, seqno: SeqNo) -> usize {
        self.snapshots.partition_point(|s| *s <= seqno)
    }

    /// Whether a newer range tombstone in the same stripe deletes this
    /// entry for every possible reader
    fn shadowed_by_tombstone(&self, key: &InternalKey) -> bool {
        let stripe = self.stripe(key.seqno);

        self.tombstones.iter().any(|t| {
            t.seqno > key.seqno
                && self.stripe(t.seqno) == stripe
                && *t.start <= *key.user_key
                && *key.user_key < *t.end
        })
    }

    fn next_entry(&mut self) -> Option<crate::Result<InternalValue>> {
        if let Some(item) = self.peeked.take() {
            return Some(Ok(item));
        }
        self.inner.next()
    }

    /// Next entry iff it is an older version of `key` within `stripe`
    fn next_in_stripe(
        &mut self,
        key: &InternalKey,
        stripe: usize,
    ) -> crate::Result<Option<InternalValue>> {
        let Some(item) = self.next_entry() else {
            return Ok(None);
        };
        let item = item?;

        if item.key.user_key == key.user_key && self.stripe(item.key.seqno) == stripe {
            Ok(Some(item))
        } else {
            self.peeked = Some(item);
            Ok(None)
        }
    }

    /// Drops the remaining versions of `key` within `stripe`
    fn skip_same_stripe(&mut self, key: &InternalKey, stripe: usize) -> crate::Result<()> {
        while self.next_in_stripe(key, stripe)?.is_some() {}
        Ok(())
    }

    /// Drops all remaining versions of `key`, regardless of stripe
    fn skip_user_key(&mut self, key: &InternalKey) -> crate::Result<()> {
        loop {
            let Some(item) = self.next_entry() else {
                return Ok(());
            };
            let item = item?;

            if item.key.user_key == key.user_key {
                continue;
            }

            self.peeked = Some(item);
            return Ok(());
        }
    }

    fn maybe_zero(&self, mut item: InternalValue, stripe: usize) -> InternalValue {
        if self.allow_zero_seqnum && stripe == 0 {
            item.key.seqno = 0;
        }
        item
    }

    /// `head` is a single delete, the newest entry of its stripe
    fn single_delete(
        &mut self,
        head: InternalValue,
        stripe: usize,
    ) -> crate::Result<Option<InternalValue>> {
        match self.next_in_stripe(&head.key, stripe)? {
            Some(next) => match next.key.kind {
                // A set that is already dead under a range tombstone is
                // not a cancellation target
                ValueKind::Set if self.shadowed_by_tombstone(&next.key) => {
                    self.peeked = Some(next);
                    Ok(None)
                }

                // The single delete consumes exactly the one write it was
                // issued against; both disappear
                ValueKind::Set => Ok(None),

                ValueKind::Merge => Err(Error::SingleDeleteOverMerge),

                // Nothing left to cancel; the full delete carries the
                // stripe's semantics, so the single delete folds away
                ValueKind::Delete => {
                    self.peeked = Some(next);
                    Ok(None)
                }

                _ => {
                    self.peeked = Some(next);
                    Ok(Some(self.maybe_zero(head, stripe)))
                }
            },
            None => {
                if stripe == 0 && (self.elide)(&head.key.user_key) {
                    self.skip_user_key(&head.key)?;
                    return Ok(None);
                }
                Ok(Some(self.maybe_zero(head, stripe)))
            }
        }
    }

    /// `head` is a merge operand, the newest entry of its stripe
    fn fold_merge(&mut self, head: InternalValue, stripe: usize) -> crate::Result<InternalValue> {
        let op = self
            .merge_operator
            .clone()
            .ok_or(Error::MergeOperatorMissing)?;

        let key = head.key.clone();
        let mut acc = head.value;
        let mut kind = ValueKind::Merge;

        while let Some(next) = self.next_in_stripe(&key, stripe)? {
            // Entries beneath a same-stripe range tombstone are dead;
            // the merge run ends on a tombstone either way
            if self.shadowed_by_tombstone(&next.key) {
                kind = ValueKind::Set;
                self.skip_same_stripe(&key, stripe)?;
                break;
            }

            match next.key.kind {
                ValueKind::Merge => {
                    acc = op.merge(&key.user_key, &next.value, &acc);
                }
                ValueKind::Set => {
                    acc = op.merge(&key.user_key, &next.value, &acc);
                    kind = ValueKind::Set;
                    self.skip_same_stripe(&key, stripe)?;
                    break;
                }
                ValueKind::Delete => {
                    // Merge over a tombstone is a full value
                    kind = ValueKind::Set;
                    self.skip_same_stripe(&key, stripe)?;
                    break;
                }
                _ => {
                    self.peeked = Some(next);
                    break;
                }
            }
        }

        // With nothing possibly existing beneath the output range, an
        // unfinished merge is a full value as well
        if kind == ValueKind::Merge && stripe == 0 && (self.elide)(&key.user_key) {
            kind = ValueKind::Set;
        }

        let item = InternalValue::from_key(
            InternalKey {
                user_key: key.user_key,
                seqno: key.seqno,
                kind,
            },
            acc,
        );

        Ok(self.maybe_zero(item, stripe))
    }
}

impl<'a> Iterator for CompactionIter<'a> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let head = match self.next_entry()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            let stripe = self.stripe(head.key.seqno);

            // A same-stripe newer range tombstone supersedes the entry
            // just like a newer point version would
            if self.shadowed_by_tombstone(&head.key) {
                continue;
            }

            match head.key.kind {
                ValueKind::RangeDelete => {
                    debug_assert!(false, "range tombstone in point merge");
                    continue;
                }

                ValueKind::Set => {
                    if let Err(e) = self.skip_same_stripe(&head.key, stripe) {
                        return Some(Err(e));
                    }
                    return Some(Ok(self.maybe_zero(head, stripe)));
                }

                ValueKind::Delete => {
                    if let Err(e) = self.skip_same_stripe(&head.key, stripe) {
                        return Some(Err(e));
                    }

                    if stripe == 0 && (self.elide)(&head.key.user_key) {
                        // No snapshot can see the key and nothing beneath
                        // the output range holds it; all older versions
                        // are bottom-stripe too, so the key vanishes
                        if let Err(e) = self.skip_user_key(&head.key) {
                            return Some(Err(e));
                        }
                        continue;
                    }

                    return Some(Ok(self.maybe_zero(head, stripe)));
                }

                ValueKind::SingleDelete => match self.single_delete(head, stripe) {
                    Ok(Some(item)) => return Some(Ok(item)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                },

                ValueKind::Merge => {
                    return Some(self.fold_merge(head, stripe));
                }
            }
        }
    }
}
