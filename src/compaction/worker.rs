use super::{iter::CompactionIter, Compaction};
use crate::{
    comparator::Comparator,
    limiter::CompactionLimiter,
    merge::{BoxedIterator, MergeIterator},
    merge_operator::MergeOperator,
    seqno::FileNumCounter,
    stop_signal::StopSignal,
    table::{TableMeta, TableProvider, TableWriter},
    value::{ukey_successor, RangeTombstone, SeqNo, UserKey},
    version::check::check_level_ordering,
};
use std::{cmp::Ordering, sync::Arc, time::Instant};

/// Compaction worker options
pub struct Options {
    pub provider: Arc<dyn TableProvider>,

    /// Write pacing, shared across all compactions
    pub limiter: Arc<dyn CompactionLimiter>,

    /// Engine-wide shutdown flag, polled between entries
    pub stop_signal: StopSignal,

    /// File number allocator for output tables
    pub file_nums: FileNumCounter,

    /// Live snapshot seqnos at pick time, ascending
    pub snapshots: Vec<SeqNo>,

    pub merge_operator: Option<Arc<dyn MergeOperator>>,
}

/// How a compaction run ended
pub enum Outcome {
    /// All inputs merged; these are the output tables
    Finished(Vec<Arc<TableMeta>>),

    /// The stop signal fired; outputs were discarded
    Cancelled,
}

struct CurrentOutput {
    writer: Box<dyn TableWriter>,

    /// Grandparent boundary after which this table must be cut
    grandparent_limit: Option<UserKey>,

    last_user_key: UserKey,
}

/// Runs the merging I/O loop of a picked compaction.
///
/// Streams a single ordered merge over all inputs (and the flushable
/// queue, when flushing), cutting output tables on size, grandparent
/// overlap, and never between two versions of one user key.
///
/// # Errors
///
/// On error the partially written outputs are discarded and the inputs
/// remain; the caller decides whether the error is transient.
pub fn run_compaction(c: &Compaction, opts: &Options) -> crate::Result<Outcome> {
    let cmp = c.comparator();
    let start = Instant::now();

    log::debug!(
        "compactor: merging {} + {} tables (+{} memtables) into L{}",
        c.inputs[0].len(),
        c.inputs[1].len(),
        c.flushing.len(),
        c.output_level
    );

    // Inputs are re-checked right before reading; a malformed input set
    // would silently produce a corrupt output otherwise
    for (idx, files) in c.inputs.iter().enumerate() {
        let level = if idx == 0 { c.start_level } else { c.output_level };
        let dump = files
            .iter()
            .map(|f| format!("{f:?}"))
            .collect::<Vec<_>>()
            .join(" ");
        check_level_ordering(level, files, &**cmp, &format!("L{level}: {dump}"))?;
    }

    let mut iters: Vec<BoxedIterator<'_>> = Vec::new();
    let mut pending = Vec::new();

    for meta in c.all_inputs() {
        iters.push(Box::new(opts.provider.iter(meta, None)?));
        pending.extend(opts.provider.range_tombstones(meta)?);
    }

    for memtable in &c.flushing {
        iters.push(Box::new(memtable.point_entries().map(Ok)));
        pending.extend(memtable.range_tombstones());
    }

    let earliest_snapshot = opts.snapshots.first().copied().unwrap_or(SeqNo::MAX);

    // The full tombstone set shadows covered point entries; the shaped
    // set is what actually gets written out
    let all_tombstones = pending.clone();
    let mut pending = shape_range_tombstones(c, &**cmp, pending, earliest_snapshot);

    let allow_zero_seqnum = c.allow_zero_seqnum();

    let mut iter = CompactionIter::new(
        MergeIterator::new(iters),
        opts.snapshots.clone(),
        opts.merge_operator.clone(),
        Box::new(|user_key| c.elide_tombstone(user_key)),
        all_tombstones,
        allow_zero_seqnum,
    );

    let mut outputs: Vec<Arc<TableMeta>> = Vec::new();
    let mut current: Option<CurrentOutput> = None;

    let mut idx: usize = 0;
    loop {
        let Some(item) = iter.next() else { break };

        let item = match item {
            Ok(item) => item,
            Err(e) => {
                discard(current, &outputs, opts);
                return Err(e);
            }
        };

        if idx % 1_000 == 0 && opts.stop_signal.is_stopped() {
            log::debug!("compactor: stopping amidst compaction because of stop signal");
            discard(current, &outputs, opts);
            return Ok(Outcome::Cancelled);
        }
        idx += 1;

        // Decide whether the current output must be cut before this key.
        // Cutting inside a run of versions of one user key is never
        // allowed; it would tear the key across tables.
        if let Some(cur) = &current {
            let user_key_changed =
                cmp.compare(&item.key.user_key, &cur.last_user_key) == Ordering::Greater;

            let must_cut = user_key_changed
                && (cur.writer.estimated_size() >= c.max_output_file_size
                    || cur.grandparent_limit.as_ref().map_or(false, |limit| {
                        cmp.compare(&item.key.user_key, limit) == Ordering::Greater
                    }));

            if must_cut {
                let cut_at = item.key.user_key.clone();
                match finish_output(
                    current.take().expect("just checked"),
                    &mut pending,
                    Some(&cut_at),
                    &**cmp,
                ) {
                    Ok(meta) => outputs.push(meta),
                    Err(e) => {
                        discard(None, &outputs, opts);
                        return Err(e);
                    }
                }
            }
        }

        if current.is_none() {
            let file_num = opts.file_nums.next();
            current = Some(CurrentOutput {
                writer: match opts.provider.create(file_num) {
                    Ok(writer) => writer,
                    Err(e) => {
                        discard(None, &outputs, opts);
                        return Err(e);
                    }
                },
                grandparent_limit: c.find_grandparent_limit(&item.key.user_key),
                last_user_key: item.key.user_key.clone(),
            });
        }

        let cur = current.as_mut().expect("just created");

        let bytes = item.size() as u64;
        if !opts.limiter.allow(bytes) {
            opts.limiter.wait(bytes);
        }

        cur.last_user_key = item.key.user_key.clone();
        if let Err(e) = cur.writer.add(item) {
            discard(current, &outputs, opts);
            return Err(e);
        }
    }

    // Leftover range tombstones with no output to ride on still need a table
    if current.is_none() && !pending.is_empty() {
        let file_num = opts.file_nums.next();
        match opts.provider.create(file_num) {
            Ok(writer) => {
                current = Some(CurrentOutput {
                    writer,
                    grandparent_limit: None,
                    last_user_key: (*b"").into(),
                });
            }
            Err(e) => {
                discard(None, &outputs, opts);
                return Err(e);
            }
        }
    }

    if let Some(cur) = current.take() {
        match finish_output(cur, &mut pending, None, &**cmp) {
            Ok(meta) => outputs.push(meta),
            Err(e) => {
                discard(None, &outputs, opts);
                return Err(e);
            }
        }
    }

    log::debug!(
        "compactor: done in {}ms ({} tables created)",
        start.elapsed().as_millis(),
        outputs.len()
    );

    Ok(Outcome::Finished(outputs))
}

/// Elides droppable range tombstones and truncates the rest to the
/// compaction bounds
fn shape_range_tombstones(
    c: &Compaction,
    cmp: &dyn Comparator,
    tombstones: Vec<RangeTombstone>,
    earliest_snapshot: SeqNo,
) -> Vec<RangeTombstone> {
    let upper = ukey_successor(&c.largest.user_key);

    let mut out: Vec<RangeTombstone> = tombstones
        .into_iter()
        .filter(|t| {
            !(t.seqno < earliest_snapshot && c.elide_range_tombstone(&t.start, &t.end))
        })
        .map(|mut t| {
            if cmp.compare(&t.start, &c.smallest.user_key) == Ordering::Less {
                t.start = c.smallest.user_key.clone();
            }
            if cmp.compare(&t.end, &upper) == Ordering::Greater {
                t.end = upper.clone();
            }
            t
        })
        .filter(|t| cmp.compare(&t.start, &t.end) == Ordering::Less)
        .collect();

    out.sort_by(|a, b| {
        cmp.compare(&a.start, &b.start)
            .then_with(|| b.seqno.cmp(&a.seqno))
    });
    out
}

/// Seals an output table, handing it the pending range tombstones up to
/// `boundary` (the first user key of the next output)
fn finish_output(
    mut cur: CurrentOutput,
    pending: &mut Vec<RangeTombstone>,
    boundary: Option<&UserKey>,
    cmp: &dyn Comparator,
) -> crate::Result<Arc<TableMeta>> {
    let mut rest = Vec::with_capacity(pending.len());

    for t in pending.drain(..) {
        match boundary {
            Some(boundary) if cmp.compare(&t.start, boundary) != Ordering::Less => {
                // Entirely beyond the cut; belongs to a later output
                rest.push(t);
            }
            Some(boundary) => {
                let mut piece = t.clone();
                if cmp.compare(&piece.end, boundary) == Ordering::Greater {
                    piece.end = boundary.clone();
                }
                cur.writer.add_range_tombstone(piece)?;

                if cmp.compare(&t.end, boundary) == Ordering::Greater {
                    let mut remainder = t;
                    remainder.start = boundary.clone();
                    rest.push(remainder);
                }
            }
            None => {
                cur.writer.add_range_tombstone(t)?;
            }
        }
    }

    *pending = rest;

    cur.writer.finish()
}

/// Discards a cancelled or failed compaction's outputs
fn discard(current: Option<CurrentOutput>, outputs: &[Arc<TableMeta>], opts: &Options) {
    if let Some(cur) = current {
        if let Err(e) = cur.writer.abandon() {
            log::warn!("failed to abandon partial table: {e}");
        }
    }

    for meta in outputs {
        if let Err(e) = opts.provider.remove(meta.file_num) {
            log::warn!("failed to remove discarded table {}: {e}", meta.file_num);
        }
    }
}
