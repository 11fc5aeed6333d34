use super::Compaction;
use crate::{
    comparator::{compare_internal, Comparator},
    config::Config,
    value::UserKey,
    version::{Version, NUM_LEVELS},
    FileNum,
};
use std::{collections::HashSet, sync::Arc};

/// A queued manual compaction request
#[derive(Debug)]
pub struct ManualRequest {
    pub level: usize,
    pub output_level: usize,
    pub lo: UserKey,
    pub hi: UserKey,
}

/// Scores levels and selects compactions
///
/// Recomputed against the current version whenever a compaction may be
/// scheduled; cheap enough to rebuild rather than cache.
pub struct Picker {
    base_level: usize,
    level_max_bytes: [u64; NUM_LEVELS],
}

impl Picker {
    /// Computes the base level and per-level size targets for `version`
    ///
    /// The base level is the shallowest non-L0 level that receives L0
    /// output, chosen so level sizes grow geometrically toward the
    /// largest occupied level.
    #[must_use]
    pub fn new(version: &Version, config: &Config) -> Self {
        // Levels without an explicit target computed below never trigger
        // size compactions
        let mut level_max_bytes = [u64::MAX; NUM_LEVELS];

        let mut first_non_empty = None;
        let mut max_level_size: u64 = 0;

        for level in 1..NUM_LEVELS {
            let size = version.level_size(level);
            if size > 0 {
                if first_non_empty.is_none() {
                    first_non_empty = Some(level);
                }
                max_level_size = max_level_size.max(size);
            }
        }

        let Some(first_non_empty) = first_non_empty else {
            // No data below L0 yet; L0 compacts straight to the last level
            return Self {
                base_level: NUM_LEVELS - 1,
                level_max_bytes,
            };
        };

        let multiplier = config.level_multiplier as f64;
        let base_bytes_max = config.l_base_max_bytes;
        let base_bytes_min = (base_bytes_max as f64 / multiplier) as u64;

        let mut cur_level_size = max_level_size as f64;
        for _ in first_non_empty..NUM_LEVELS - 1 {
            cur_level_size /= multiplier;
        }

        let mut base_level = first_non_empty;
        if cur_level_size as u64 > base_bytes_min {
            // The tree has outgrown its first non-empty level; walk the
            // base level up until the projected size fits
            while base_level > 1 && cur_level_size as u64 > base_bytes_max {
                base_level -= 1;
                cur_level_size /= multiplier;
            }
        }

        let smoothed_multiplier = if base_level < NUM_LEVELS - 1 {
            (max_level_size as f64 / base_bytes_max as f64)
                .powf(1.0 / (NUM_LEVELS - base_level - 1) as f64)
        } else {
            1.0
        };

        let mut level_size = base_bytes_max as f64;
        for (level, slot) in level_max_bytes
            .iter_mut()
            .enumerate()
            .take(NUM_LEVELS)
            .skip(base_level)
        {
            if level > base_level && level_size > 0.0 {
                level_size *= smoothed_multiplier;
            }
            *slot = level_size.round().max(1.0) as u64;
        }

        Self {
            base_level,
            level_max_bytes,
        }
    }

    #[must_use]
    pub fn base_level(&self) -> usize {
        self.base_level
    }

    #[must_use]
    pub fn level_max_bytes(&self) -> &[u64; NUM_LEVELS] {
        &self.level_max_bytes
    }

    /// Per-level compaction pressure
    ///
    /// L0 is scored by table count against the trigger; deeper levels by
    /// size against their target. The bottom level never compacts on size.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scores(&self, version: &Version, config: &Config) -> [f64; NUM_LEVELS] {
        let mut scores = [0.0; NUM_LEVELS];

        scores[0] = version.files[0].len() as f64 / config.l0_compaction_trigger as f64;

        for level in self.base_level..NUM_LEVELS - 1 {
            scores[level] =
                version.level_size(level) as f64 / self.level_max_bytes[level] as f64;
        }

        scores
    }

    /// Picks the highest-pressure compaction, if any level scores >= 1
    ///
    /// Between equal scores the lower level wins.
    #[must_use]
    pub fn pick_auto(
        &self,
        version: &Arc<Version>,
        cmp: &Arc<dyn Comparator>,
        config: &Config,
        compacting: &HashSet<FileNum>,
    ) -> Option<Compaction> {
        let scores = self.scores(version, config);

        let mut best: Option<(usize, f64)> = None;
        for (level, score) in scores.iter().enumerate() {
            if *score >= 1.0 && best.map_or(true, |(_, s)| *score > s) {
                best = Some((level, *score));
            }
        }

        let (level, score) = best?;
        log::trace!("level {level} scored {score:.2}, picking compaction");

        pick_auto_at(
            version.clone(),
            cmp.clone(),
            config,
            level,
            self.base_level,
            compacting,
        )
    }

    /// Selects the files of a manual compaction over `[lo, hi]`
    ///
    /// Returns `(None, true)` when an overlapping file is currently being
    /// compacted; the coordinator re-queues the request.
    #[must_use]
    pub fn pick_manual(
        &self,
        version: &Arc<Version>,
        cmp: &Arc<dyn Comparator>,
        config: &Config,
        manual: &ManualRequest,
        compacting: &HashSet<FileNum>,
    ) -> (Option<Compaction>, bool) {
        let files = version.overlaps(manual.level, &**cmp, &manual.lo, &manual.hi);

        if files.is_empty() {
            return (None, false);
        }

        if files.iter().any(|f| compacting.contains(&f.file_num)) {
            return (None, true);
        }

        let mut c = Compaction::new(
            version.clone(),
            cmp.clone(),
            config,
            manual.level,
            self.base_level,
        );
        c.inputs[0] = files;
        c.setup_inputs();

        if c.all_inputs().any(|f| compacting.contains(&f.file_num)) {
            return (None, true);
        }

        (Some(c), false)
    }
}

/// Builds an auto compaction at `start_level`: seeds with the file
/// holding the smallest largest-key that is not already compacting,
/// then shapes the inputs.
pub(crate) fn pick_auto_at(
    version: Arc<Version>,
    cmp: Arc<dyn Comparator>,
    config: &Config,
    start_level: usize,
    base_level: usize,
    compacting: &HashSet<FileNum>,
) -> Option<Compaction> {
    let seed = version.files[start_level]
        .iter()
        .filter(|f| !compacting.contains(&f.file_num))
        .min_by(|a, b| compare_internal(&*cmp, &a.largest, &b.largest))?
        .clone();

    let mut c = Compaction::new(version, cmp, config, start_level, base_level);
    c.inputs[0] = vec![seed];
    c.setup_inputs();

    if c.all_inputs().any(|f| compacting.contains(&f.file_num)) {
        // Shaping pulled in a file some other compaction owns; skip this
        // round, the next pick will see a different version
        return None;
    }

    Some(c)
}
