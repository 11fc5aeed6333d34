use super::{picker::ManualRequest, Compaction};
use crate::{comparator::Comparator, value::UserKey, FileNum};
use std::{
    cmp::Ordering,
    collections::{HashSet, VecDeque},
    sync::{atomic::AtomicUsize, mpsc, Arc, Mutex},
};

/// A compaction that currently owns its input files
#[derive(Debug)]
pub struct InProgress {
    pub id: u64,

    pub start_level: usize,
    pub output_level: usize,

    pub files: HashSet<FileNum>,

    /// User-key span; `None` means the whole level is considered owned
    pub range: Option<(UserKey, UserKey)>,
}

/// A queued manual compaction
///
/// `retries` counts how often the request lost an admission race and
/// was re-queued; tests use it to observe waiting behavior.
pub struct ManualCompaction {
    pub request: ManualRequest,
    pub retries: AtomicUsize,

    pub(crate) done: Mutex<Option<mpsc::Sender<crate::Result<()>>>>,
}

impl ManualCompaction {
    pub(crate) fn new(request: ManualRequest) -> (Arc<Self>, mpsc::Receiver<crate::Result<()>>) {
        let (tx, rx) = mpsc::channel();

        (
            Arc::new(Self {
                request,
                retries: AtomicUsize::new(0),
                done: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    pub(crate) fn finish(&self, result: crate::Result<()>) {
        if let Some(tx) = self.done.lock().expect("lock is poisoned").take() {
            // The caller may have abandoned the wait; the compaction
            // still completed
            tx.send(result).ok();
        }
    }
}

/// Book-keeping of everything compacting right now
///
/// Lives under the store's state mutex; all methods are plain data
/// operations.
#[derive(Default)]
pub struct CompactState {
    pub in_progress: Vec<InProgress>,
    pub compacting_count: usize,
    pub manual_queue: VecDeque<Arc<ManualCompaction>>,
    next_id: u64,
}

impl CompactState {
    /// Files owned by any in-progress compaction
    #[must_use]
    pub fn compacting_files(&self) -> HashSet<FileNum> {
        self.in_progress
            .iter()
            .flat_map(|e| e.files.iter().copied())
            .collect()
    }

    fn ranges_overlap(
        cmp: &dyn Comparator,
        a: &(UserKey, UserKey),
        b: &(UserKey, UserKey),
    ) -> bool {
        cmp.compare(&a.0, &b.1) != Ordering::Greater && cmp.compare(&b.0, &a.1) != Ordering::Greater
    }

    /// Whether a picked compaction intersects an in-progress one
    ///
    /// Two compactions conflict when they share a file, or when they
    /// touch a common level with overlapping user-key spans.
    #[must_use]
    pub fn conflicts_with(&self, c: &Compaction, cmp: &dyn Comparator) -> bool {
        let range = (
            c.smallest.user_key.clone(),
            c.largest.user_key.clone(),
        );

        for e in &self.in_progress {
            if c.all_inputs().any(|f| e.files.contains(&f.file_num)) {
                return true;
            }

            let levels_touch = e.start_level == c.start_level
                || e.start_level == c.output_level
                || e.output_level == c.start_level
                || e.output_level == c.output_level;

            if levels_touch {
                match &e.range {
                    None => return true,
                    Some(r) if Self::ranges_overlap(cmp, r, &range) => return true,
                    Some(_) => {}
                }
            }
        }

        false
    }

    /// Whether a manual request's target overlaps an in-progress compaction
    #[must_use]
    pub fn manual_conflicts(&self, manual: &ManualRequest, cmp: &dyn Comparator) -> bool {
        let range = (manual.lo.clone(), manual.hi.clone());

        for e in &self.in_progress {
            let levels_touch = e.start_level == manual.level
                || e.start_level == manual.output_level
                || e.output_level == manual.level
                || e.output_level == manual.output_level;

            if levels_touch {
                match &e.range {
                    None => return true,
                    Some(r) if Self::ranges_overlap(cmp, r, &range) => return true,
                    Some(_) => {}
                }
            }
        }

        false
    }

    /// Takes ownership of a picked compaction's inputs
    pub fn register(&mut self, c: &Compaction) -> u64 {
        self.next_id += 1;
        let id = self.next_id;

        self.in_progress.push(InProgress {
            id,
            start_level: c.start_level,
            output_level: c.output_level,
            files: c.all_inputs().map(|f| f.file_num).collect(),
            range: Some((
                c.smallest.user_key.clone(),
                c.largest.user_key.clone(),
            )),
        });
        self.compacting_count += 1;

        id
    }

    /// Registers a rangeless placeholder compaction
    ///
    /// Only used by tests to simulate an ongoing compaction.
    #[doc(hidden)]
    pub fn register_raw(&mut self, start_level: usize, output_level: usize) -> u64 {
        self.next_id += 1;
        let id = self.next_id;

        self.in_progress.push(InProgress {
            id,
            start_level,
            output_level,
            files: HashSet::new(),
            range: None,
        });
        self.compacting_count += 1;

        id
    }

    /// Releases a compaction's inputs
    pub fn remove(&mut self, id: u64) {
        let before = self.in_progress.len();
        self.in_progress.retain(|e| e.id != id);

        if self.in_progress.len() < before {
            self.compacting_count -= 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::config::Config;
    use crate::table::TableMeta;
    use crate::value::InternalKey;
    use crate::version::Version;
    use test_log::test;

    fn meta(file_num: FileNum, smallest: &str, largest: &str) -> Arc<TableMeta> {
        let smallest = InternalKey::parse(smallest);
        let largest = InternalKey::parse(largest);
        Arc::new(TableMeta {
            file_num,
            size: 1,
            smallest_seqno: smallest.seqno.min(largest.seqno),
            largest_seqno: smallest.seqno.max(largest.seqno),
            smallest,
            largest,
        })
    }

    fn compaction(start_level: usize, files: Vec<Arc<TableMeta>>) -> Compaction {
        let mut v = Version::default();
        v.files[start_level] = files.clone();

        let mut c = Compaction::new(
            Arc::new(v),
            Arc::new(BytewiseComparator),
            &Config::default(),
            start_level,
            1,
        );
        c.inputs[0] = files;
        c.setup_inputs();
        c
    }

    #[test]
    fn shared_file_conflicts() {
        let cmp = BytewiseComparator;
        let mut state = CompactState::default();

        let c1 = compaction(1, vec![meta(1, "a.SET.1", "c.SET.2")]);
        state.register(&c1);

        let c2 = compaction(1, vec![meta(1, "a.SET.1", "c.SET.2")]);
        assert!(state.conflicts_with(&c2, &cmp));
    }

    #[test]
    fn disjoint_ranges_may_run_in_parallel() {
        let cmp = BytewiseComparator;
        let mut state = CompactState::default();

        let c1 = compaction(1, vec![meta(1, "a.SET.1", "c.SET.2")]);
        let id = state.register(&c1);

        // Same levels, disjoint user keys
        let c2 = compaction(1, vec![meta(2, "m.SET.1", "p.SET.2")]);
        assert!(!state.conflicts_with(&c2, &cmp));

        // Different levels entirely
        let c3 = compaction(3, vec![meta(3, "a.SET.1", "c.SET.2")]);
        assert!(!state.conflicts_with(&c3, &cmp));

        state.remove(id);
        assert_eq!(0, state.compacting_count);
    }

    #[test]
    fn rangeless_ongoing_blocks_level() {
        let cmp = BytewiseComparator;
        let mut state = CompactState::default();

        state.register_raw(0, 1);

        let manual = ManualRequest {
            level: 0,
            output_level: 1,
            lo: (*b"a").into(),
            hi: (*b"z").into(),
        };
        assert!(state.manual_conflicts(&manual, &cmp));

        let manual = ManualRequest {
            level: 3,
            output_level: 4,
            lo: (*b"a").into(),
            hi: (*b"z").into(),
        };
        assert!(!state.manual_conflicts(&manual, &cmp));
    }

    #[test]
    fn manual_done_channel_fires_once() {
        let (manual, rx) = ManualCompaction::new(ManualRequest {
            level: 1,
            output_level: 2,
            lo: (*b"a").into(),
            hi: (*b"z").into(),
        });

        manual.finish(Ok(()));
        manual.finish(Ok(()));

        assert!(rx.recv().expect("should get result").is_ok());
        assert!(rx.recv().is_err(), "sender must be consumed");
    }
}
