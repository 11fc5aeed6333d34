use crate::SeqNo;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// The ordered set of live snapshot seqnos
///
/// Consulted by compactions: data whose visibility differs between two
/// live snapshots must not be dropped.
#[derive(Clone, Default)]
pub struct SnapshotList(Arc<Mutex<BTreeMap<SeqNo, usize>>>);

impl SnapshotList {
    /// Registers a snapshot at `seqno`, returning an RAII handle
    #[must_use]
    pub fn open(&self, seqno: SeqNo) -> SnapshotHandle {
        let mut map = self.0.lock().expect("lock is poisoned");
        *map.entry(seqno).or_insert(0) += 1;

        log::debug!("Opening snapshot with seqno: {seqno}");

        SnapshotHandle {
            list: self.clone(),
            seqno,
        }
    }

    /// Live snapshot seqnos, ascending
    #[must_use]
    pub fn live(&self) -> Vec<SeqNo> {
        self.0
            .lock()
            .expect("lock is poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// The earliest live snapshot, if any
    #[must_use]
    pub fn earliest(&self) -> Option<SeqNo> {
        self.0
            .lock()
            .expect("lock is poisoned")
            .keys()
            .next()
            .copied()
    }

    /// Whether no snapshots are live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().expect("lock is poisoned").is_empty()
    }

    fn release(&self, seqno: SeqNo) {
        let mut map = self.0.lock().expect("lock is poisoned");

        if let Some(count) = map.get_mut(&seqno) {
            *count -= 1;
            if *count == 0 {
                map.remove(&seqno);
            }
        }
    }
}

/// Keeps a snapshot seqno alive; dropping it releases the snapshot
pub struct SnapshotHandle {
    list: SnapshotList,
    seqno: SeqNo,
}

impl SnapshotHandle {
    /// The seqno this snapshot reads at
    #[must_use]
    pub fn seqno(&self) -> SeqNo {
        self.seqno
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        log::debug!("Closing snapshot with seqno: {}", self.seqno);
        self.list.release(self.seqno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn snapshot_lifecycle() {
        let list = SnapshotList::default();
        assert!(list.is_empty());

        let a = list.open(5);
        let b = list.open(3);
        let c = list.open(5);

        assert_eq!(vec![3, 5], list.live());
        assert_eq!(Some(3), list.earliest());

        drop(b);
        assert_eq!(vec![5], list.live());

        drop(a);
        assert_eq!(vec![5], list.live(), "refcounted seqno stays alive");

        drop(c);
        assert!(list.is_empty());
    }
}
