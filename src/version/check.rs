use super::{Version, NUM_LEVELS};
use crate::{
    comparator::{compare_internal, Comparator},
    file::fmt_file_num,
    table::TableMeta,
    FileNum,
};
use std::{cmp::Ordering, sync::Arc};

/// A level that failed its ordering invariants
///
/// Carries the two offending tables and a rendering of the whole level,
/// which ends up in the fatal diagnostic.
#[derive(Debug)]
pub struct OrderingViolation {
    /// Level on which the violation was found
    pub level: usize,

    /// First offending table
    pub file_a: FileNum,

    /// Second offending table
    pub file_b: FileNum,

    /// Human-readable description of the violated rule
    pub message: String,

    /// Rendering of the full level at the time of the check
    pub level_dump: String,
}

impl std::fmt::Display for OrderingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn violation(
    version_level: &str,
    level: usize,
    a: &TableMeta,
    b: &TableMeta,
    message: String,
) -> Box<OrderingViolation> {
    Box::new(OrderingViolation {
        level,
        file_a: a.file_num,
        file_b: b.file_num,
        message,
        level_dump: version_level.to_string(),
    })
}

fn seqno_window(f: &TableMeta) -> String {
    format!("<#{}-#{}>", f.smallest_seqno, f.largest_seqno)
}

/// Verifies the ordering invariants of a single level
///
/// # Errors
///
/// Returns the violation without touching anything; the caller refuses
/// the version edit.
pub fn check_level_ordering(
    level: usize,
    files: &[Arc<TableMeta>],
    cmp: &dyn Comparator,
    dump: &str,
) -> Result<(), Box<OrderingViolation>> {
    if level == 0 {
        for (i, f) in files.iter().enumerate().skip(1) {
            let prev = &files[i - 1];

            if f.largest_seqno < prev.largest_seqno {
                return Err(violation(
                    dump,
                    0,
                    prev,
                    f,
                    format!(
                        "L0 files {} and {} are not in increasing largest seqnum order: {} vs {}",
                        fmt_file_num(prev.file_num),
                        fmt_file_num(f.file_num),
                        seqno_window(prev),
                        seqno_window(f),
                    ),
                ));
            }

            // Coincident largest seqnums are only allowed when one seqno
            // interval is strictly nested inside the other
            if f.largest_seqno == prev.largest_seqno && f.smallest_seqno == prev.smallest_seqno {
                return Err(violation(
                    dump,
                    0,
                    prev,
                    f,
                    format!(
                        "L0 files {} and {} have coincident seqnum intervals: {} vs {}",
                        fmt_file_num(prev.file_num),
                        fmt_file_num(f.file_num),
                        seqno_window(prev),
                        seqno_window(f),
                    ),
                ));
            }
        }

        // Ingests are atomic, so no flushed table may share a seqno with
        // an ingested table's single seqno
        for (i, f) in files.iter().enumerate() {
            if f.is_ingested() {
                continue;
            }

            for g in files.iter().take(i) {
                if g.is_ingested() && f.smallest_seqno == g.smallest_seqno {
                    return Err(violation(
                        dump,
                        0,
                        f,
                        g,
                        format!(
                            "L0 flushed file {} has smallest sequence number coincident with an ingested file : {} vs {}",
                            fmt_file_num(f.file_num),
                            seqno_window(f),
                            seqno_window(g),
                        ),
                    ));
                }
            }
        }

        return Ok(());
    }

    for (i, f) in files.iter().enumerate() {
        if compare_internal(cmp, &f.smallest, &f.largest) == Ordering::Greater {
            return Err(violation(
                dump,
                level,
                f,
                f,
                format!(
                    "L{level} file {} has inconsistent bounds: {} vs {}",
                    fmt_file_num(f.file_num),
                    f.smallest,
                    f.largest,
                ),
            ));
        }

        if i == 0 {
            continue;
        }
        let prev = &files[i - 1];

        if compare_internal(cmp, &prev.smallest, &f.smallest) == Ordering::Greater {
            return Err(violation(
                dump,
                level,
                prev,
                f,
                format!(
                    "L{level} files {} and {} are not in increasing order: {} vs {}",
                    fmt_file_num(prev.file_num),
                    fmt_file_num(f.file_num),
                    prev.smallest,
                    f.smallest,
                ),
            ));
        }

        // Touching at a single user key is fine as long as the earlier
        // table's boundary entry is the newer one
        if compare_internal(cmp, &prev.largest, &f.smallest) != Ordering::Less {
            return Err(violation(
                dump,
                level,
                prev,
                f,
                format!(
                    "L{level} files {} and {} have overlapping ranges",
                    fmt_file_num(prev.file_num),
                    fmt_file_num(f.file_num),
                ),
            ));
        }
    }

    Ok(())
}

/// Verifies the per-level invariants of a whole version
///
/// Called after every version edit, including compaction install and
/// ingest.
///
/// # Errors
///
/// Returns the first violation found.
pub fn check_ordering(version: &Version, cmp: &dyn Comparator) -> Result<(), Box<OrderingViolation>> {
    for level in 0..NUM_LEVELS {
        let dump = version.level_summary(level);
        check_level_ordering(level, &version.files[level], cmp, &dump)?;
    }

    Ok(())
}
