//! Compaction picking, shaping and execution

pub(crate) mod iter;
pub(crate) mod manager;
pub(crate) mod picker;
pub(crate) mod worker;

use crate::{
    comparator::Comparator,
    config::Config,
    memtable::MemTable,
    table::{key_range, TableMeta},
    value::{InternalKey, UserKey, ValueKind, SEQNO_MAX},
    version::{Version, NUM_LEVELS},
};
use std::{cmp::Ordering, sync::Arc};

/// A user-key interval occupied by tables beneath the output level
///
/// Tombstones covering only user keys outside these ranges may be
/// dropped at output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserKeyRange {
    /// First occupied user key (inclusive)
    pub start: UserKey,

    /// Last occupied user key (inclusive)
    pub end: UserKey,
}

pub(crate) fn total_size(files: &[Arc<TableMeta>]) -> u64 {
    files.iter().map(|f| f.size).sum()
}

/// A single picked compaction: its inputs, bounds and size limits
///
/// `inputs[0]` holds the start-level tables, `inputs[1]` the
/// output-level overlap. Both are closed under atomic-unit expansion,
/// so a user key never tears across two compactions.
pub struct Compaction {
    cmp: Arc<dyn Comparator>,
    version: Arc<Version>,

    /// Level the compaction reads from
    pub start_level: usize,

    /// Level the outputs land on
    pub output_level: usize,

    /// Start-level and output-level input tables
    pub inputs: [Vec<Arc<TableMeta>>; 2],

    /// Tables at `output_level + 1`, used to bound output table overlap
    pub grandparents: Vec<Arc<TableMeta>>,

    /// Lower bound over all inputs
    pub smallest: InternalKey,

    /// Upper bound over all inputs
    pub largest: InternalKey,

    /// Output tables are cut when they reach this size
    pub max_output_file_size: u64,

    /// Output tables are cut when their grandparent overlap would pass this
    pub max_overlap_bytes: u64,

    /// Growing the start-level input is refused beyond this total
    max_expanded_bytes: u64,

    inuse_key_ranges: Vec<UserKeyRange>,

    /// Memtables to merge; non-empty when this compaction is a flush
    pub flushing: Vec<Arc<MemTable>>,
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Compaction L{}->L{} ({} + {} tables)",
            self.start_level,
            self.output_level,
            self.inputs[0].len(),
            self.inputs[1].len()
        )
    }
}

impl Compaction {
    pub(crate) fn new(
        version: Arc<Version>,
        cmp: Arc<dyn Comparator>,
        config: &Config,
        start_level: usize,
        base_level: usize,
    ) -> Self {
        debug_assert!(start_level < NUM_LEVELS - 1);
        debug_assert!(base_level >= 1);

        let output_level = if start_level == 0 {
            base_level
        } else {
            start_level + 1
        };

        Self {
            cmp,
            version,
            start_level,
            output_level,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            smallest: InternalKey::new(*b"", 0, ValueKind::Set),
            largest: InternalKey::new(*b"", 0, ValueKind::Set),
            max_output_file_size: config.target_file_size(output_level),
            max_overlap_bytes: config.max_grandparent_overlap_bytes(output_level),
            max_expanded_bytes: config.expanded_compaction_byte_size_limit(output_level),
            inuse_key_ranges: Vec::new(),
            flushing: Vec::new(),
        }
    }

    /// A compaction that merges sealed memtables into L0
    pub(crate) fn new_flush(
        version: Arc<Version>,
        cmp: Arc<dyn Comparator>,
        config: &Config,
        memtables: Vec<Arc<MemTable>>,
    ) -> Self {
        debug_assert!(!memtables.is_empty());

        let mut smallest = InternalKey::new(*b"", 0, ValueKind::Set);
        let mut largest = InternalKey::new(*b"", 0, ValueKind::Set);

        let mut bounds: Option<(UserKey, UserKey)> = None;
        for memtable in &memtables {
            if let Some((lo, hi)) = memtable.key_range() {
                bounds = Some(match bounds {
                    None => (lo, hi),
                    Some((cur_lo, cur_hi)) => (
                        if cmp.compare(&lo, &cur_lo) == Ordering::Less {
                            lo
                        } else {
                            cur_lo
                        },
                        if cmp.compare(&hi, &cur_hi) == Ordering::Greater {
                            hi
                        } else {
                            cur_hi
                        },
                    ),
                });
            }
        }

        if let Some((lo, hi)) = bounds {
            smallest = InternalKey::new(lo, SEQNO_MAX, ValueKind::RangeDelete);
            largest = InternalKey::new(hi, 0, ValueKind::Delete);
        }

        Self {
            cmp,
            version,
            start_level: 0,
            output_level: 0,
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            smallest,
            largest,
            max_output_file_size: config.target_file_size(0),
            max_overlap_bytes: config.max_grandparent_overlap_bytes(0),
            max_expanded_bytes: config.expanded_compaction_byte_size_limit(0),
            inuse_key_ranges: Vec::new(),
            flushing: memtables,
        }
    }

    /// Whether this compaction persists memtables instead of tables
    #[must_use]
    pub fn is_flush(&self) -> bool {
        !self.flushing.is_empty()
    }

    pub(crate) fn comparator(&self) -> &Arc<dyn Comparator> {
        &self.cmp
    }

    /// All input tables of both levels
    pub(crate) fn all_inputs(&self) -> impl Iterator<Item = &Arc<TableMeta>> {
        self.inputs.iter().flatten()
    }

    /// Expands seed inputs into the final shape of the compaction:
    /// atomic units at both levels, L0 overlap grouping, opportunistic
    /// growing, grandparents and the in-use key ranges.
    pub(crate) fn setup_inputs(&mut self) {
        let seed = std::mem::take(&mut self.inputs[0]);
        self.inputs[0] = self.expand_inputs(self.start_level, seed);

        let Some((mut sm, mut la)) = key_range([&self.inputs[0], &[]]) else {
            return;
        };

        if self.start_level == 0 {
            // L0 tables overlap each other, so all transitively
            // overlapping tables must move together
            self.inputs[0] =
                self.version
                    .overlaps(0, &*self.cmp, &sm.user_key, &la.user_key);

            let (sm0, la0) =
                key_range([&self.inputs[0], &[]]).expect("L0 input cannot be empty");
            sm = sm0;
            la = la0;
        }

        self.inputs[1] = self.expand_inputs(
            self.output_level,
            self.version
                .overlaps(self.output_level, &*self.cmp, &sm.user_key, &la.user_key),
        );

        if let Some((sm1, la1)) = key_range([&self.inputs[0], &self.inputs[1]]) {
            sm = sm1;
            la = la1;
        }

        if self.grow(&sm, &la) {
            let (sm1, la1) = key_range([&self.inputs[0], &self.inputs[1]])
                .expect("grown inputs cannot be empty");
            sm = sm1;
            la = la1;
        }

        self.smallest = sm;
        self.largest = la;

        if self.output_level + 1 < NUM_LEVELS {
            self.grandparents = self.version.overlaps(
                self.output_level + 1,
                &*self.cmp,
                &self.smallest.user_key,
                &self.largest.user_key,
            );
        }

        self.setup_inuse_key_ranges();
    }

    /// Expands `inputs` on a sorted level to its enclosing atomic unit
    ///
    /// Neighboring tables that share a boundary user key hold versions
    /// of the same user key and must be compacted as a whole.
    pub(crate) fn expand_inputs(
        &self,
        level: usize,
        inputs: Vec<Arc<TableMeta>>,
    ) -> Vec<Arc<TableMeta>> {
        if level == 0 || inputs.is_empty() {
            return inputs;
        }

        let files = &self.version.files[level];

        let Some(mut i) = files
            .iter()
            .position(|f| f.file_num == inputs[0].file_num)
        else {
            return inputs;
        };
        let mut j = i + inputs.len();
        debug_assert!(j <= files.len());

        while i > 0 {
            let prev = &files[i - 1];
            if self
                .cmp
                .compare(&prev.largest.user_key, &files[i].smallest.user_key)
                == Ordering::Less
            {
                break;
            }
            i -= 1;
        }

        while j < files.len() {
            if self
                .cmp
                .compare(&files[j - 1].largest.user_key, &files[j].smallest.user_key)
                == Ordering::Less
            {
                break;
            }
            j += 1;
        }

        files[i..j].to_vec()
    }

    /// The user-key span of the atomic unit containing `file`
    ///
    /// Walks start-level neighbors for as long as their boundary user
    /// keys touch.
    #[must_use]
    pub fn atomic_unit_bounds(&self, file: &TableMeta) -> Option<(UserKey, UserKey)> {
        let files = &self.inputs[0];

        let idx = files.iter().position(|f| f.file_num == file.file_num)?;

        let mut lower = files[idx].smallest.user_key.clone();
        for k in (1..=idx).rev() {
            let cur = &files[k];
            let prev = &files[k - 1];
            if self
                .cmp
                .compare(&prev.largest.user_key, &cur.smallest.user_key)
                == Ordering::Less
            {
                break;
            }
            lower = prev.smallest.user_key.clone();
        }

        let mut upper = files[idx].largest.user_key.clone();
        for k in idx + 1..files.len() {
            let cur = &files[k - 1];
            let next = &files[k];
            if self
                .cmp
                .compare(&cur.largest.user_key, &next.smallest.user_key)
                == Ordering::Less
            {
                break;
            }
            upper = next.largest.user_key.clone();
        }

        Some((lower, upper))
    }

    /// Tries to pull more start-level tables into the compaction while
    /// the output-level overlap stays identical and the total size stays
    /// under the expansion limit
    fn grow(&mut self, sm: &InternalKey, la: &InternalKey) -> bool {
        if self.inputs[1].is_empty() {
            return false;
        }

        let grow0 = self
            .version
            .overlaps(self.start_level, &*self.cmp, &sm.user_key, &la.user_key);
        let grow0 = self.expand_inputs(self.start_level, grow0);

        if grow0.len() <= self.inputs[0].len() {
            return false;
        }
        if total_size(&grow0) + total_size(&self.inputs[1]) >= self.max_expanded_bytes {
            return false;
        }

        let Some((sm1, la1)) = key_range([&grow0, &[]]) else {
            return false;
        };

        let grow1 = self.version.overlaps(
            self.output_level,
            &*self.cmp,
            &sm1.user_key,
            &la1.user_key,
        );
        if grow1.len() != self.inputs[1].len() {
            return false;
        }

        log::trace!(
            "growing L{} input from {} to {} tables",
            self.start_level,
            self.inputs[0].len(),
            grow0.len()
        );

        self.inputs[0] = grow0;
        self.inputs[1] = grow1;
        true
    }

    /// First grandparent boundary after `start` at which an output table
    /// may be cut without passing the overlap cap
    ///
    /// Scans grandparents from the one covering `start`, accumulating
    /// size; returns `None` if the cap is never passed. The returned key
    /// is always strictly greater than `start`, which guarantees forward
    /// progress.
    #[must_use]
    pub fn find_grandparent_limit(&self, start: &[u8]) -> Option<UserKey> {
        let lower = self
            .grandparents
            .partition_point(|g| self.cmp.compare(start, &g.largest.user_key) == Ordering::Greater);

        let mut overlapped_bytes: u64 = 0;

        for g in &self.grandparents[lower..] {
            overlapped_bytes += g.size;

            if overlapped_bytes > self.max_overlap_bytes
                && self.cmp.compare(start, &g.largest.user_key) == Ordering::Less
            {
                return Some(g.largest.user_key.clone());
            }
        }

        None
    }

    /// Collects the disjoint user-key intervals occupied by tables
    /// beneath the output level, within the compaction bounds
    pub(crate) fn setup_inuse_key_ranges(&mut self) {
        let first_level = if self.output_level == 0 {
            // L0 tables overlap, so the output's own level counts too
            0
        } else {
            self.output_level + 1
        };

        let mut ranges = Vec::new();

        for level in first_level..NUM_LEVELS {
            for m in self.version.overlaps(
                level,
                &*self.cmp,
                &self.smallest.user_key,
                &self.largest.user_key,
            ) {
                ranges.push(UserKeyRange {
                    start: m.smallest.user_key.clone(),
                    end: m.largest.user_key.clone(),
                });
            }
        }

        ranges.sort_by(|a, b| self.cmp.compare(&a.start, &b.start));

        let mut merged: Vec<UserKeyRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            if let Some(last) = merged.last_mut() {
                if self.cmp.compare(&r.start, &last.end) != Ordering::Greater {
                    if self.cmp.compare(&r.end, &last.end) == Ordering::Greater {
                        last.end = r.end;
                    }
                    continue;
                }
            }
            merged.push(r);
        }

        self.inuse_key_ranges = merged;
    }

    /// Whether a point tombstone on `user_key` may be dropped at output
    ///
    /// True iff the key lies outside every in-use key range beneath the
    /// output level and nothing is flushing.
    #[must_use]
    pub fn elide_tombstone(&self, user_key: &[u8]) -> bool {
        if !self.flushing.is_empty() {
            return false;
        }

        for r in &self.inuse_key_ranges {
            if self.cmp.compare(user_key, &r.end) != Ordering::Greater {
                return self.cmp.compare(user_key, &r.start) == Ordering::Less;
            }
        }

        true
    }

    /// Whether a range tombstone over `[start, end)` may be dropped at output
    #[must_use]
    pub fn elide_range_tombstone(&self, start: &[u8], end: &[u8]) -> bool {
        if !self.flushing.is_empty() {
            return false;
        }

        let lower = self
            .inuse_key_ranges
            .partition_point(|r| self.cmp.compare(&r.end, start) == Ordering::Less);
        let upper = self
            .inuse_key_ranges
            .partition_point(|r| self.cmp.compare(&r.start, end) != Ordering::Greater);

        lower >= upper
    }

    /// Whether surviving keys may have their seqnos rewritten to zero
    ///
    /// Requires the output to be bottommost for the covered range; the
    /// compaction iterator additionally zeroes only keys beneath the
    /// earliest snapshot.
    #[must_use]
    pub fn allow_zero_seqnum(&self) -> bool {
        self.elide_range_tombstone(&self.smallest.user_key, &self.largest.user_key)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::picker::pick_auto_at;
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::FileNum;
    use std::collections::HashSet;
    use test_log::test;

    fn meta(file_num: FileNum, smallest: &str, largest: &str) -> Arc<TableMeta> {
        meta_sized(file_num, smallest, largest, 1)
    }

    fn meta_sized(file_num: FileNum, smallest: &str, largest: &str, size: u64) -> Arc<TableMeta> {
        let smallest = InternalKey::parse(smallest);
        let largest = InternalKey::parse(largest);
        Arc::new(TableMeta {
            file_num,
            size,
            smallest_seqno: smallest.seqno.min(largest.seqno),
            largest_seqno: smallest.seqno.max(largest.seqno),
            smallest,
            largest,
        })
    }

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn file_nums(files: &[Arc<TableMeta>]) -> String {
        let mut nums: Vec<_> = files.iter().map(|f| f.file_num.to_string()).collect();
        nums.sort();
        nums.join(",")
    }

    fn rendered(c: &Compaction) -> String {
        format!(
            "{} {} {}",
            file_nums(&c.inputs[0]),
            file_nums(&c.inputs[1]),
            file_nums(&c.grandparents)
        )
    }

    fn pick(version: &Arc<Version>, level: usize, base_level: usize) -> Option<Compaction> {
        pick_auto_at(
            version.clone(),
            cmp(),
            &Config::default(),
            level,
            base_level,
            &HashSet::new(),
        )
    }

    #[test]
    fn pick_single_l0_file() {
        let mut v = Version::default();
        v.files[0] = vec![meta(100, "i.SET.101", "j.SET.102")];
        let v = Arc::new(v);

        let c = pick(&v, 0, 1).expect("should pick");
        assert_eq!("100  ", rendered(&c));
    }

    #[test]
    fn pick_l0_no_user_key_overlap() {
        let mut v = Version::default();
        v.files[0] = vec![
            meta(100, "i.SET.101", "j.SET.102"),
            meta(110, "k.SET.111", "l.SET.112"),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 0, 1).expect("should pick");
        assert_eq!("100  ", rendered(&c));
    }

    #[test]
    fn pick_l0_ikey_overlap_groups_files() {
        let mut v = Version::default();
        v.files[0] = vec![
            meta(100, "i.SET.101", "p.SET.102"),
            meta(110, "j.SET.111", "q.SET.112"),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 0, 1).expect("should pick");
        assert_eq!("100,110  ", rendered(&c));
    }

    #[test]
    fn pick_l0_ukey_overlap_groups_files() {
        let mut v = Version::default();
        v.files[0] = vec![
            meta(100, "i.SET.101", "i.SET.102"),
            meta(110, "i.SET.111", "i.SET.112"),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 0, 1).expect("should pick");
        assert_eq!("100,110  ", rendered(&c));
    }

    #[test]
    fn pick_with_l1_and_grandparents() {
        let mut v = Version::default();
        v.files[0] = vec![meta(100, "i.SET.101", "t.SET.102")];
        v.files[1] = vec![
            meta(200, "a.SET.201", "e.SET.202"),
            meta(210, "f.SET.211", "j.SET.212"),
        ];
        v.files[2] = vec![
            meta(300, "a.SET.301", "b.SET.302"),
            meta(310, "c.SET.311", "g.SET.312"),
            meta(320, "h.SET.321", "m.SET.322"),
            meta(330, "n.SET.331", "z.SET.332"),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 0, 1).expect("should pick");
        assert_eq!("100 210 310,320,330", rendered(&c));
    }

    #[test]
    fn grow_accepted() {
        let mut v = Version::default();
        v.files[1] = vec![
            meta(200, "i1.SET.201", "i2.SET.202"),
            meta(210, "j1.SET.211", "j2.SET.212"),
            meta(220, "k1.SET.221", "k2.SET.222"),
            meta(230, "l1.SET.231", "l2.SET.232"),
        ];
        v.files[2] = vec![
            meta(300, "a0.SET.301", "l0.SET.302"),
            meta(310, "l2.SET.311", "z2.SET.312"),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 1, 1).expect("should pick");
        assert_eq!("200,210,220 300 ", rendered(&c));
    }

    #[test]
    fn grow_refused_on_range() {
        let mut v = Version::default();
        v.files[1] = vec![
            meta(200, "i1.SET.201", "i2.SET.202"),
            meta(210, "j1.SET.211", "j2.SET.212"),
            meta(220, "k1.SET.221", "k2.SET.222"),
            meta(230, "l1.SET.231", "l2.SET.232"),
        ];
        v.files[2] = vec![
            meta(300, "a0.SET.301", "j0.SET.302"),
            meta(310, "j2.SET.311", "z2.SET.312"),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 1, 1).expect("should pick");
        assert_eq!("200 300 ", rendered(&c));
    }

    #[test]
    fn grow_refused_on_size() {
        let config = Config::default();
        let lim1 = config.expanded_compaction_byte_size_limit(1);
        let lim2 = config.expanded_compaction_byte_size_limit(2);

        let mut v = Version::default();
        v.files[1] = vec![
            meta_sized(200, "i1.SET.201", "i2.SET.202", lim1 - 1),
            meta_sized(210, "j1.SET.211", "j2.SET.212", lim1 - 1),
            meta_sized(220, "k1.SET.221", "k2.SET.222", lim1 - 1),
            meta_sized(230, "l1.SET.231", "l2.SET.232", lim1 - 1),
        ];
        v.files[2] = vec![
            meta_sized(300, "a0.SET.301", "l0.SET.302", lim2 - 1),
            meta_sized(310, "l2.SET.311", "z2.SET.312", lim2 - 1),
        ];
        let v = Arc::new(v);

        let c = pick(&v, 1, 1).expect("should pick");
        assert_eq!("200 300 ", rendered(&c));
    }

    fn elide_fixture(start_level: usize) -> Compaction {
        let mut v = Version::default();
        v.files[1] = vec![
            meta(1, "c.SET.801", "g.SET.800"),
            meta(2, "x.SET.701", "y.SET.700"),
        ];
        v.files[2] = vec![
            meta(3, "d.SET.601", "h.SET.600"),
            meta(4, "r.SET.501", "t.SET.500"),
        ];
        v.files[3] = vec![
            meta(5, "f.SET.401", "g.SET.400"),
            meta(6, "w.SET.301", "x.SET.300"),
        ];
        v.files[4] = vec![
            meta(7, "f.SET.201", "m.SET.200"),
            meta(8, "t.SET.101", "t.SET.100"),
        ];

        let mut c = Compaction::new(Arc::new(v), cmp(), &Config::default(), start_level, 1);
        c.smallest = InternalKey::parse("a.SET.0");
        c.largest = InternalKey::parse("z.SET.0");
        c.setup_inuse_key_ranges();
        c
    }

    #[test]
    fn elide_tombstone_empty_version() {
        let mut c = Compaction::new(
            Arc::new(Version::default()),
            cmp(),
            &Config::default(),
            1,
            1,
        );
        c.smallest = InternalKey::parse("a.SET.0");
        c.largest = InternalKey::parse("z.SET.0");
        c.setup_inuse_key_ranges();

        assert!(c.elide_tombstone(b"x"));
    }

    #[test]
    fn elide_tombstone_boundaries() {
        let c = elide_fixture(1);

        // In-use beneath L2 here is [f,m], [t,t], [w,x]
        let wants = [
            ("b", true),
            ("c", true),
            ("d", true),
            ("e", true),
            ("f", false),
            ("g", false),
            ("h", false),
            ("l", false),
            ("m", false),
            ("n", true),
            ("q", true),
            ("r", true),
            ("s", true),
            ("t", false),
            ("u", true),
            ("v", true),
            ("w", false),
            ("x", false),
            ("y", true),
            ("z", true),
        ];

        for (key, expected) in wants {
            assert_eq!(
                expected,
                c.elide_tombstone(key.as_bytes()),
                "ukey={key:?}"
            );
        }
    }

    #[test]
    fn elide_tombstone_repeated_ukey() {
        let mut v = Version::default();
        v.files[6] = vec![
            meta(1, "i.SET.401", "i.SET.400"),
            meta(2, "i.SET.301", "k.SET.300"),
            meta(3, "k.SET.201", "m.SET.200"),
            meta(4, "m.SET.101", "m.SET.100"),
        ];

        let mut c = Compaction::new(Arc::new(v), cmp(), &Config::default(), 4, 1);
        c.smallest = InternalKey::parse("a.SET.0");
        c.largest = InternalKey::parse("z.SET.0");
        c.setup_inuse_key_ranges();

        let wants = [
            ("h", true),
            ("i", false),
            ("j", false),
            ("k", false),
            ("l", false),
            ("m", false),
            ("n", true),
        ];

        for (key, expected) in wants {
            assert_eq!(
                expected,
                c.elide_tombstone(key.as_bytes()),
                "ukey={key:?}"
            );
        }
    }

    #[test]
    fn elide_range_tombstone_boundaries() {
        let c = elide_fixture(1);

        let wants = [
            ("b", "c", true),
            ("c", "d", true),
            ("d", "e", true),
            ("e", "f", false),
            ("f", "g", false),
            ("g", "h", false),
            ("h", "i", false),
            ("l", "m", false),
            ("m", "n", false),
            ("n", "o", true),
            ("q", "r", true),
            ("r", "s", true),
            ("s", "t", false),
            ("t", "u", false),
            ("u", "v", true),
            ("v", "w", false),
            ("w", "x", false),
            ("x", "y", false),
            ("y", "z", true),
        ];

        for (start, end, expected) in wants {
            assert_eq!(
                expected,
                c.elide_range_tombstone(start.as_bytes(), end.as_bytes()),
                "keys={start:?}-{end:?}"
            );
        }
    }

    #[test]
    fn elide_refused_while_flushing() {
        let mut c = elide_fixture(1);
        c.flushing = vec![Arc::new(MemTable::default())];

        assert!(!c.elide_tombstone(b"b"));
        assert!(!c.elide_range_tombstone(b"m", b"n"));
        assert!(!c.allow_zero_seqnum());
    }

    #[test]
    fn atomic_unit_bounds_walks_neighbors() {
        let mut v = Version::default();
        let files = vec![
            meta(1, "a.SET.6", "b.SET.5"),
            meta(2, "b.SET.4", "d.SET.3"),
            meta(3, "d.SET.2", "f.SET.1"),
            meta(4, "h.SET.8", "j.SET.7"),
        ];
        v.files[1] = files.clone();

        let mut c = Compaction::new(Arc::new(v), cmp(), &Config::default(), 1, 1);
        c.inputs[0] = files.clone();

        let (lo, hi) = c.atomic_unit_bounds(&files[1]).expect("file is in inputs");
        assert_eq!((b"a".as_slice(), b"f".as_slice()), (&*lo, &*hi));

        let (lo, hi) = c.atomic_unit_bounds(&files[3]).expect("file is in inputs");
        assert_eq!((b"h".as_slice(), b"j".as_slice()), (&*lo, &*hi));
    }

    #[test]
    fn expand_inputs_closed_under_atomic_units() {
        let mut v = Version::default();
        v.files[1] = vec![
            meta(1, "a.SET.6", "b.SET.5"),
            meta(2, "b.SET.4", "d.SET.3"),
            meta(3, "d.SET.2", "f.SET.1"),
            meta(4, "h.SET.8", "j.SET.7"),
        ];
        let v = Arc::new(v);

        let c = Compaction::new(v.clone(), cmp(), &Config::default(), 1, 1);

        let expanded = c.expand_inputs(1, vec![v.files[1][1].clone()]);
        assert_eq!("1,2,3", file_nums(&expanded));

        let expanded = c.expand_inputs(1, vec![v.files[1][3].clone()]);
        assert_eq!("4", file_nums(&expanded));
    }

    #[test]
    fn grandparent_limit_accumulates_size() {
        let mut v = Version::default();
        v.files[3] = vec![
            meta_sized(1, "a.SET.1", "c.SET.1", 10),
            meta_sized(2, "d.SET.1", "f.SET.1", 10),
            meta_sized(3, "g.SET.1", "i.SET.1", 10),
            meta_sized(4, "j.SET.1", "l.SET.1", 10),
        ];

        let mut c = Compaction::new(Arc::new(v.clone()), cmp(), &Config::default(), 1, 1);
        c.grandparents = v.files[3].clone();
        c.max_overlap_bytes = 25;

        // 10 + 10 + 10 > 25 at the third grandparent
        let limit = c.find_grandparent_limit(b"a").expect("should cap");
        assert_eq!(b"i".as_slice(), &*limit);

        // Never returns a boundary <= start
        c.max_overlap_bytes = 5;
        let limit = c.find_grandparent_limit(b"i");
        assert_eq!(Some(UserKey::from(*b"l")), limit);

        // Cap never reached
        c.max_overlap_bytes = 1_000;
        assert_eq!(None, c.find_grandparent_limit(b"a"));
    }

    #[test]
    fn inuse_key_ranges_merge_intervals() {
        let mut v = Version::default();
        v.files[3] = vec![
            meta(1, "c.SET.1", "g.SET.1"),
            meta(2, "x.SET.1", "z.SET.1"),
        ];
        v.files[4] = vec![
            meta(3, "d.SET.1", "h.SET.1"),
            meta(4, "t.SET.1", "u.SET.1"),
        ];

        let mut c = Compaction::new(Arc::new(v), cmp(), &Config::default(), 1, 2);
        c.smallest = InternalKey::parse("a.SET.0");
        c.largest = InternalKey::parse("z.SET.0");
        c.setup_inuse_key_ranges();

        assert_eq!(
            vec![
                UserKeyRange {
                    start: (*b"c").into(),
                    end: (*b"h").into()
                },
                UserKeyRange {
                    start: (*b"t").into(),
                    end: (*b"u").into()
                },
                UserKeyRange {
                    start: (*b"x").into(),
                    end: (*b"z").into()
                },
            ],
            c.inuse_key_ranges
        );
    }

    #[test]
    fn zero_seqnum_only_when_bottommost() {
        // Tables beneath the output level block the rewrite
        let c = elide_fixture(1);
        assert!(!c.allow_zero_seqnum());

        // Bottommost for the covered range
        let mut v = Version::default();
        v.files[1] = vec![meta(1, "a.SET.9", "c.SET.8")];
        let mut c = Compaction::new(Arc::new(v), cmp(), &Config::default(), 1, 1);
        c.smallest = InternalKey::parse("a.SET.9");
        c.largest = InternalKey::parse("c.SET.8");
        c.setup_inuse_key_ranges();
        assert!(c.allow_zero_seqnum());
    }

    #[test]
    fn seed_skips_compacting_files() {
        let mut v = Version::default();
        v.files[1] = vec![
            meta(1, "a.SET.1", "b.SET.1"),
            meta(2, "d.SET.1", "e.SET.1"),
        ];
        let v = Arc::new(v);

        let mut compacting = HashSet::new();
        compacting.insert(1 as FileNum);

        let c = pick_auto_at(
            v.clone(),
            cmp(),
            &Config::default(),
            1,
            1,
            &compacting,
        )
        .expect("should pick");
        assert_eq!("2", file_nums(&c.inputs[0]));

        compacting.insert(2);
        assert!(pick_auto_at(v, cmp(), &Config::default(), 1, 1, &compacting).is_none());
    }

    #[test]
    fn output_level_and_file_size() {
        let config = Config::default();
        let v = Arc::new(Version::default());

        let c = Compaction::new(v.clone(), cmp(), &config, 0, 3);
        assert_eq!(3, c.output_level);
        assert_eq!(config.target_file_size(3), c.max_output_file_size);

        let c = Compaction::new(v, cmp(), &config, 2, 1);
        assert_eq!(3, c.output_level);
        assert_eq!(config.target_file_size(3), c.max_output_file_size);
    }
}
