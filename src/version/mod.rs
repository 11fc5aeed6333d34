pub mod check;

use crate::{
    comparator::Comparator,
    file::{rewrite_atomic, MANIFEST_FILE},
    seqno::FileNumCounter,
    serde::{Deserializable, DeserializeError, Serializable},
    table::{sort_by_smallest, TableMeta},
    value::{SeqNo, UserKey},
    Error, FileNum,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::{
    cmp::Ordering,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Amount of levels of the tree, like `LevelDB` and `RocksDB`
pub const NUM_LEVELS: usize = 7;

const MANIFEST_MAGIC: &[u8; 8] = b"SCREEMAN";
const MANIFEST_VERSION: u8 = 1;

/// Immutable snapshot of the level layout
///
/// L0 is an unsorted overlay: tables may overlap in user-key space and
/// are ordered by write history. L1 and deeper are sorted runs: tables
/// are disjoint in user-key space and sorted by smallest key.
///
/// Versions are never mutated; edits produce a new version. In-flight
/// compactions keep their version (and thereby its table handles) alive
/// through reference counting.
#[derive(Clone, Default)]
pub struct Version {
    /// Per-level ordered table lists
    pub files: [Vec<Arc<TableMeta>>; NUM_LEVELS],
}

impl Version {
    /// All tables on `level` whose user-key span intersects `[lo, hi]` (closed)
    ///
    /// For L0 the scan is repeated until the bounds stop growing, so that
    /// transitively overlapping tables end up in one group. For deeper
    /// levels the result is a contiguous run of the sorted level.
    #[must_use]
    pub fn overlaps(
        &self,
        level: usize,
        cmp: &dyn Comparator,
        lo: &[u8],
        hi: &[u8],
    ) -> Vec<Arc<TableMeta>> {
        if level == 0 {
            let mut lo: UserKey = lo.into();
            let mut hi: UserKey = hi.into();

            loop {
                let mut grown = false;
                let mut out = Vec::new();

                for f in &self.files[0] {
                    if !f.overlaps_range(cmp, &lo, &hi) {
                        continue;
                    }

                    if cmp.compare(&f.smallest.user_key, &lo) == Ordering::Less {
                        lo = f.smallest.user_key.clone();
                        grown = true;
                    }
                    if cmp.compare(&f.largest.user_key, &hi) == Ordering::Greater {
                        hi = f.largest.user_key.clone();
                        grown = true;
                    }

                    out.push(f.clone());
                }

                if !grown {
                    return out;
                }
            }
        }

        let files = &self.files[level];

        let start = files.partition_point(|f| cmp.compare(&f.largest.user_key, lo) == Ordering::Less);
        let end =
            files.partition_point(|f| cmp.compare(&f.smallest.user_key, hi) != Ordering::Greater);

        if start >= end {
            return Vec::new();
        }

        files[start..end].to_vec()
    }

    /// Byte size of a level
    #[must_use]
    pub fn level_size(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.size).sum()
    }

    /// Amount of tables, summed over all levels
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// Whether the version holds no tables at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-line rendering of a level, used in diagnostics
    #[must_use]
    pub fn level_summary(&self, level: usize) -> String {
        let files = self.files[level]
            .iter()
            .map(|f| format!("{f:?}"))
            .collect::<Vec<_>>()
            .join(" ");

        format!("L{level}: {files}")
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, files) in self.files.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            writeln!(f, "{}", self.level_summary(idx))?;
        }
        Ok(())
    }
}

/// Atomic transition between two versions
///
/// Carries the tables deleted and added per level; applied under the
/// manifest mutex.
#[derive(Debug, Default)]
pub struct VersionEdit {
    /// Tables removed, as (level, file number) pairs
    pub deleted: Vec<(usize, FileNum)>,

    /// Tables added per level
    pub added: Vec<(usize, Arc<TableMeta>)>,
}

impl VersionEdit {
    /// Records a table removal
    pub fn delete(&mut self, level: usize, file_num: FileNum) {
        self.deleted.push((level, file_num));
    }

    /// Records a table addition
    pub fn add(&mut self, level: usize, meta: Arc<TableMeta>) {
        self.added.push((level, meta));
    }
}

/// Owns the current version and the manifest file
///
/// All mutation goes through [`VersionSet::log_and_apply`]; each
/// published version is strictly newer than any prior one. Callers are
/// expected to serialize access (the store keeps this behind its state
/// mutex).
pub struct VersionSet {
    path: PathBuf,
    cmp: Arc<dyn Comparator>,
    current: Arc<Version>,
    file_nums: FileNumCounter,
    last_seqno: SeqNo,
}

impl VersionSet {
    /// Creates or recovers the version set inside `folder`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, or if the existing manifest was written with
    /// a different comparator.
    pub fn open<P: AsRef<Path>>(folder: P, cmp: Arc<dyn Comparator>) -> crate::Result<Self> {
        let path = folder.as_ref().join(MANIFEST_FILE);

        if path.try_exists()? {
            Self::recover(path, cmp)
        } else {
            std::fs::create_dir_all(folder.as_ref())?;

            let mut vs = Self {
                path,
                cmp,
                current: Arc::new(Version::default()),
                // File number 0 is reserved as the "no file" marker
                file_nums: FileNumCounter::new(1),
                last_seqno: 0,
            };
            vs.write_manifest()?;

            Ok(vs)
        }
    }

    fn recover(path: PathBuf, cmp: Arc<dyn Comparator>) -> crate::Result<Self> {
        log::debug!("Recovering manifest from {}", path.display());

        let bytes = std::fs::read(&path)?;
        let mut reader = &bytes[..];

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(DeserializeError::Io)?;
        if &magic != MANIFEST_MAGIC {
            return Err(DeserializeError::InvalidHeader.into());
        }
        let version = reader.read_u8().map_err(DeserializeError::Io)?;
        if version != MANIFEST_VERSION {
            return Err(DeserializeError::InvalidHeader.into());
        }

        let name_len = reader
            .read_u16::<BigEndian>()
            .map_err(DeserializeError::Io)?;
        let mut name = vec![0; name_len.into()];
        reader.read_exact(&mut name).map_err(DeserializeError::Io)?;
        let name = String::from_utf8_lossy(&name).into_owned();

        if name != cmp.name() {
            return Err(Error::ComparatorMismatch {
                expected: name,
                found: cmp.name().to_string(),
            });
        }

        let next_file_num = reader
            .read_u64::<BigEndian>()
            .map_err(DeserializeError::Io)?;
        let last_seqno = reader
            .read_u64::<BigEndian>()
            .map_err(DeserializeError::Io)?;

        let mut current = Version::default();

        for level in 0..NUM_LEVELS {
            let count = reader
                .read_u32::<BigEndian>()
                .map_err(DeserializeError::Io)?;

            for _ in 0..count {
                let meta = TableMeta::deserialize(&mut reader)?;
                current.files[level].push(Arc::new(meta));
            }
        }

        check::check_ordering(&current, &*cmp)?;

        Ok(Self {
            path,
            cmp,
            current: Arc::new(current),
            file_nums: FileNumCounter::new(next_file_num),
            last_seqno,
        })
    }

    #[must_use]
    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    #[must_use]
    pub fn file_nums(&self) -> FileNumCounter {
        self.file_nums.clone()
    }

    #[must_use]
    pub fn last_seqno(&self) -> SeqNo {
        self.last_seqno
    }

    pub fn set_last_seqno(&mut self, seqno: SeqNo) {
        self.last_seqno = self.last_seqno.max(seqno);
    }

    /// Applies a version edit, producing and installing a new version.
    ///
    /// The resulting version is checked against the level-ordering
    /// invariants; a violating edit is refused and nothing is installed.
    ///
    /// # Errors
    ///
    /// Fails on an ordering violation or an I/O error while persisting
    /// the manifest.
    pub fn log_and_apply(&mut self, edit: &VersionEdit) -> crate::Result<Arc<Version>> {
        let mut next = (*self.current).clone();

        for (level, file_num) in &edit.deleted {
            next.files[*level].retain(|f| f.file_num != *file_num);
        }

        for (level, meta) in &edit.added {
            debug_assert!(*level < NUM_LEVELS);
            next.files[*level].push(meta.clone());
        }

        // L0 order is write history; deeper levels are sorted runs
        next.files[0].sort_by_key(|f| (f.largest_seqno, f.smallest_seqno));
        for level in 1..NUM_LEVELS {
            sort_by_smallest(&mut next.files[level], &*self.cmp);
        }

        check::check_ordering(&next, &*self.cmp)?;

        let next = Arc::new(next);

        self.write_manifest_for(&next)?;
        self.current = next.clone();

        Ok(next)
    }

    fn write_manifest(&mut self) -> crate::Result<()> {
        let current = self.current.clone();
        self.write_manifest_for(&current)
    }

    fn write_manifest_for(&self, version: &Version) -> crate::Result<()> {
        log::trace!("Writing manifest to {}", self.path.display());

        let mut bytes = Vec::new();

        bytes.extend_from_slice(MANIFEST_MAGIC);
        bytes.push(MANIFEST_VERSION);

        let name = self.cmp.name().as_bytes();

        // NOTE: Truncation is okay, comparator names are short
        #[allow(clippy::cast_possible_truncation)]
        bytes
            .write_u16::<BigEndian>(name.len() as u16)
            .expect("vec write should not fail");
        bytes.extend_from_slice(name);

        bytes
            .write_u64::<BigEndian>(self.file_nums.get())
            .expect("vec write should not fail");
        bytes
            .write_u64::<BigEndian>(self.last_seqno)
            .expect("vec write should not fail");

        for level in 0..NUM_LEVELS {
            let files = &version.files[level];

            // NOTE: Truncation is okay, a level holds nowhere near 2^32 tables
            #[allow(clippy::cast_possible_truncation)]
            bytes
                .write_u32::<BigEndian>(files.len() as u32)
                .expect("vec write should not fail");

            for meta in files {
                meta.serialize(&mut bytes)?;
            }
        }

        // The manifest is rewritten as a whole; the rename keeps a crash
        // from ever exposing a truncated file
        rewrite_atomic(&self.path, &bytes)?;

        Ok(())
    }
}
