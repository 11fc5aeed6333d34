use crate::{
    compaction::{
        manager::{CompactState, ManualCompaction},
        picker::{ManualRequest, Picker},
        worker::{run_compaction, Options as WorkerOptions, Outcome},
        Compaction,
    },
    config::Config,
    memtable::MemTable,
    seqno::{FileNumCounter, SequenceNumberCounter},
    snapshot::{SnapshotHandle, SnapshotList},
    stop_signal::StopSignal,
    value::{ukey_successor, InternalValue, SeqNo, UserKey, UserValue, ValueKind},
    version::{VersionEdit, VersionSet, NUM_LEVELS},
    Error,
};
use std::{
    cmp::Ordering,
    sync::{mpsc, Arc, Mutex, MutexGuard},
    thread::JoinHandle,
};

/// A sealed memtable waiting to be flushed
#[derive(Clone)]
struct FlushableEntry {
    memtable: Arc<MemTable>,

    /// Number of the WAL segment holding this memtable's writes;
    /// 0 when the WAL is disabled
    log_num: u64,
}

struct EngineState {
    versions: VersionSet,

    mutable: Arc<MemTable>,
    mutable_log_num: u64,

    /// Sealed memtables, oldest first; the head pops only after its
    /// flush installs
    queue: Vec<FlushableEntry>,

    compact: CompactState,
    flush_running: bool,

    /// A fatal background error; once set, every write fails with it
    latched: Option<Arc<Error>>,
}

struct StoreInner {
    config: Config,
    state: Mutex<EngineState>,
    seqno: SequenceNumberCounter,
    file_nums: FileNumCounter,
    snapshots: SnapshotList,
    stop_signal: StopSignal,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A leveled LSM-tree store built around its compaction core
///
/// The write path, WAL and table format belong to collaborators; this
/// type owns the versions, the flush queue and the compaction
/// coordinator, with an explicit `stop` for shutdown.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens (or creates) a store.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a comparator mismatch against the manifest.
    pub fn open(config: Config) -> crate::Result<Self> {
        let versions = VersionSet::open(&config.path, config.comparator.clone())?;
        let file_nums = versions.file_nums();
        let seqno = SequenceNumberCounter::new(versions.last_seqno());

        let mutable_log_num = if config.wal_enabled { file_nums.next() } else { 0 };

        let inner = StoreInner {
            config,
            state: Mutex::new(EngineState {
                versions,
                mutable: Arc::new(MemTable::default()),
                mutable_log_num,
                queue: Vec::new(),
                compact: CompactState::default(),
                flush_running: false,
                latched: None,
            }),
            seqno,
            file_nums,
            snapshots: SnapshotList::default(),
            stop_signal: StopSignal::default(),
            threads: Mutex::new(Vec::new()),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// The store's sequence number counter
    #[must_use]
    pub fn seqno(&self) -> &SequenceNumberCounter {
        &self.inner.seqno
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().expect("lock is poisoned")
    }

    fn check_latched(state: &EngineState) -> crate::Result<()> {
        match &state.latched {
            Some(e) => Err(Error::Latched(e.clone())),
            None => Ok(()),
        }
    }

    fn write(&self, item: InternalValue) -> crate::Result<()> {
        let memtable = {
            let state = self.lock_state();
            Self::check_latched(&state)?;
            state.mutable.clone()
        };

        let (_, size_after) = memtable.insert(item);

        if size_after > self.inner.config.max_memtable_size {
            self.seal_active_memtable()?;
        }

        Ok(())
    }

    /// Inserts a key-value pair.
    ///
    /// # Errors
    ///
    /// Fails if a fatal background error is latched.
    pub fn insert<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        seqno: SeqNo,
    ) -> crate::Result<()> {
        self.write(InternalValue::new(
            key.as_ref(),
            value.as_ref(),
            seqno,
            ValueKind::Set,
        ))
    }

    /// Deletes a key.
    pub fn remove<K: AsRef<[u8]>>(&self, key: K, seqno: SeqNo) -> crate::Result<()> {
        self.write(InternalValue::new(
            key.as_ref(),
            *b"",
            seqno,
            ValueKind::Delete,
        ))
    }

    /// Deletes the single most recent write of a key.
    pub fn single_remove<K: AsRef<[u8]>>(&self, key: K, seqno: SeqNo) -> crate::Result<()> {
        self.write(InternalValue::new(
            key.as_ref(),
            *b"",
            seqno,
            ValueKind::SingleDelete,
        ))
    }

    /// Writes a merge operand for a key.
    pub fn merge<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        value: V,
        seqno: SeqNo,
    ) -> crate::Result<()> {
        self.write(InternalValue::new(
            key.as_ref(),
            value.as_ref(),
            seqno,
            ValueKind::Merge,
        ))
    }

    /// Deletes all keys in `[start, end)`.
    pub fn remove_range<S: AsRef<[u8]>, E: AsRef<[u8]>>(
        &self,
        start: S,
        end: E,
        seqno: SeqNo,
    ) -> crate::Result<()> {
        self.write(InternalValue::new(
            start.as_ref(),
            end.as_ref(),
            seqno,
            ValueKind::RangeDelete,
        ))
    }

    /// Ingests a pre-sorted batch as a single L0 table
    ///
    /// The whole table gets one seqno, making the ingest atomic.
    ///
    /// # Errors
    ///
    /// Fails if the resulting version violates the L0 ordering rules.
    pub fn ingest<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        items: Vec<(K, V)>,
    ) -> crate::Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        let seqno = self.inner.seqno.next();
        let file_num = self.inner.file_nums.next();

        let mut writer = self.inner.config.table_provider.create(file_num)?;
        let mut sorted: Vec<InternalValue> = items
            .into_iter()
            .map(|(k, v)| InternalValue::new(k.as_ref(), v.as_ref(), seqno, ValueKind::Set))
            .collect();
        sorted.sort();

        for item in sorted {
            writer.add(item)?;
        }
        let meta = writer.finish()?;

        let mut state = self.lock_state();
        Self::check_latched(&state)?;

        let mut edit = VersionEdit::default();
        edit.add(0, meta.clone());

        state.versions.set_last_seqno(self.inner.seqno.get());
        if let Err(e) = state.versions.log_and_apply(&edit) {
            self.inner.config.table_provider.remove(meta.file_num).ok();
            let e = self.latch_if_fatal(&mut state, e);
            return Err(e);
        }

        maybe_schedule_compaction(&self.inner, &mut state);

        Ok(())
    }

    /// Point lookup at `seqno`, or at the latest visible state if `None`.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors from the table provider.
    pub fn get<K: AsRef<[u8]>>(
        &self,
        key: K,
        seqno: Option<SeqNo>,
    ) -> crate::Result<Option<UserValue>> {
        let key = key.as_ref();
        let upper = seqno.unwrap_or(SeqNo::MAX);

        let (version, memtables) = {
            let state = self.lock_state();

            let mut memtables = Vec::with_capacity(state.queue.len() + 1);
            memtables.push(state.mutable.clone());
            for entry in state.queue.iter().rev() {
                memtables.push(entry.memtable.clone());
            }

            (state.versions.current(), memtables)
        };

        let cmp = &self.inner.config.comparator;
        let provider = &self.inner.config.table_provider;

        // Every visible version of the key, plus every range tombstone
        // covering it, resolved globally by seqno
        let mut versions: Vec<(SeqNo, ValueKind, UserValue)> = Vec::new();

        for memtable in &memtables {
            for item in memtable.get_versions(key, upper) {
                versions.push((item.key.seqno, item.key.kind, item.value));
            }
            for t in memtable.range_tombstones() {
                if t.covers(key, upper) {
                    versions.push((t.seqno, ValueKind::Delete, (*b"").into()));
                }
            }
        }

        for level in 0..NUM_LEVELS {
            for meta in version.overlaps(level, &**cmp, key, key) {
                let bounds = Some((UserKey::from(key), ukey_successor(key)));
                for item in provider.iter(&meta, bounds)? {
                    let item = item?;
                    if item.key.seqno < upper {
                        versions.push((item.key.seqno, item.key.kind, item.value));
                    }
                }
                for t in provider.range_tombstones(&meta)? {
                    if t.covers(key, upper) {
                        versions.push((t.seqno, ValueKind::Delete, (*b"").into()));
                    }
                }
            }
        }

        versions.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| u8::from(b.1).cmp(&u8::from(a.1))));

        self.resolve(key, versions)
    }

    /// Walks versions newest to oldest, folding merge operands
    fn resolve(
        &self,
        key: &[u8],
        versions: Vec<(SeqNo, ValueKind, UserValue)>,
    ) -> crate::Result<Option<UserValue>> {
        let mut merges: Vec<UserValue> = Vec::new();
        let mut iter = versions.into_iter().peekable();

        while let Some((_, kind, value)) = iter.next() {
            match kind {
                ValueKind::Set => return self.fold_merges(key, merges, Some(value)),
                ValueKind::Delete | ValueKind::RangeDelete => {
                    return self.fold_merges(key, merges, None);
                }
                ValueKind::SingleDelete => {
                    if matches!(iter.peek(), Some((_, ValueKind::Set, _))) {
                        iter.next();
                    }
                }
                ValueKind::Merge => merges.push(value),
            }
        }

        self.fold_merges(key, merges, None)
    }

    fn fold_merges(
        &self,
        key: &[u8],
        merges: Vec<UserValue>,
        base: Option<UserValue>,
    ) -> crate::Result<Option<UserValue>> {
        if merges.is_empty() {
            return Ok(base);
        }

        let op = self
            .inner
            .config
            .merge_operator
            .clone()
            .ok_or(Error::MergeOperatorMissing)?;

        // Operands were collected newest first
        let mut iter = merges.into_iter().rev();
        let mut acc = match base {
            Some(base) => base,
            None => iter.next().expect("merges is non-empty"),
        };

        for operand in iter {
            acc = op.merge(key, &acc, &operand);
        }

        Ok(Some(acc))
    }

    /// Opens a snapshot at the current visible seqno
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let seqno = self.inner.seqno.get();
        Snapshot {
            store: self.clone(),
            handle: self.inner.snapshots.open(seqno),
        }
    }

    /// Seals the mutable memtable into the flushable queue and schedules
    /// a flush.
    ///
    /// # Errors
    ///
    /// Fails if a fatal background error is latched.
    pub fn seal_active_memtable(&self) -> crate::Result<()> {
        {
            let mut state = self.lock_state();
            Self::check_latched(&state)?;

            if state.mutable.is_empty() {
                return Ok(());
            }

            let log_num = state.mutable_log_num;
            let sealed = std::mem::take(&mut state.mutable);
            state.queue.push(FlushableEntry {
                memtable: sealed,
                log_num,
            });

            state.mutable_log_num = if self.inner.config.wal_enabled {
                self.inner.file_nums.next()
            } else {
                0
            };
        }

        let inner = self.inner.clone();
        let handle = std::thread::spawn(move || {
            if let Err(e) = flush_once(&inner) {
                log::error!("flush failed: {e}");
            }
        });
        self.inner
            .threads
            .lock()
            .expect("lock is poisoned")
            .push(handle);

        Ok(())
    }

    /// Persists the current mutable memtable, blocking until installed.
    ///
    /// # Errors
    ///
    /// Fails if the flush fails or a background error is latched.
    pub fn flush_active_memtable(&self) -> crate::Result<()> {
        let rx = self.async_flush()?;
        rx.recv().unwrap_or(Ok(()))
    }

    /// Seals and flushes asynchronously; the returned channel yields the
    /// flush result once the install (or failure) happened.
    ///
    /// # Errors
    ///
    /// Fails if a fatal background error is already latched.
    pub fn async_flush(&self) -> crate::Result<mpsc::Receiver<crate::Result<()>>> {
        {
            let mut state = self.lock_state();
            Self::check_latched(&state)?;

            if !state.mutable.is_empty() {
                let log_num = state.mutable_log_num;
                let sealed = std::mem::take(&mut state.mutable);
                state.queue.push(FlushableEntry {
                    memtable: sealed,
                    log_num,
                });
                state.mutable_log_num = if self.inner.config.wal_enabled {
                    self.inner.file_nums.next()
                } else {
                    0
                };
            }
        }

        let (tx, rx) = mpsc::channel();
        let inner = self.inner.clone();

        let handle = std::thread::spawn(move || {
            let result = flush_once(&inner);
            tx.send(result).ok();
        });
        self.inner
            .threads
            .lock()
            .expect("lock is poisoned")
            .push(handle);

        Ok(rx)
    }

    /// Compacts all levels overlapping `[lo, hi]` downward, forcing a
    /// flush first when memtable data overlaps the range. Returns when
    /// every resulting compaction has installed.
    ///
    /// # Errors
    ///
    /// Fails if any of the resulting compactions fails.
    pub fn compact_range<K: AsRef<[u8]>>(&self, lo: K, hi: K) -> crate::Result<()> {
        let lo: UserKey = lo.as_ref().into();
        let hi: UserKey = hi.as_ref().into();
        let cmp = self.inner.config.comparator.clone();

        // Flush-forced: memtable data inside the range must hit L0 first
        loop {
            let overlaps_memtable = {
                let state = self.lock_state();
                Self::check_latched(&state)?;

                let covers = |memtable: &MemTable| {
                    memtable.key_range().is_some_and(|(mlo, mhi)| {
                        cmp.compare(&mlo, &hi) != Ordering::Greater
                            && cmp.compare(&lo, &mhi) != Ordering::Greater
                    })
                };

                covers(&state.mutable)
                    || state.queue.iter().any(|entry| covers(&entry.memtable))
            };

            if !overlaps_memtable {
                break;
            }

            self.flush_active_memtable()?;
        }

        for level in 0..NUM_LEVELS - 1 {
            let (request, empty) = {
                let state = self.lock_state();
                let version = state.versions.current();

                let overlapping = version.overlaps(level, &*cmp, &lo, &hi);

                let output_level = if level == 0 {
                    Picker::new(&version, &self.inner.config).base_level()
                } else {
                    level + 1
                };

                (
                    ManualRequest {
                        level,
                        output_level,
                        lo: lo.clone(),
                        hi: hi.clone(),
                    },
                    overlapping.is_empty(),
                )
            };

            if empty {
                continue;
            }

            let (manual, rx) = ManualCompaction::new(request);

            {
                let mut state = self.lock_state();
                state.compact.manual_queue.push_back(manual);
                maybe_schedule_compaction(&self.inner, &mut state);
            }

            // The compaction completes even if we stopped waiting; only
            // a dropped sender without a result means shutdown
            match rx.recv() {
                Ok(result) => result?,
                Err(_) => return Ok(()),
            }
        }

        Ok(())
    }

    /// Stops background work and waits for in-flight compactions
    pub fn stop(&self) {
        self.inner.stop_signal.send();

        let handles: Vec<_> = self
            .inner
            .threads
            .lock()
            .expect("lock is poisoned")
            .drain(..)
            .collect();

        for handle in handles {
            handle.join().ok();
        }
    }

    /// Registers a placeholder ongoing compaction; returns its id
    #[doc(hidden)]
    pub fn debug_add_ongoing_compaction(&self, start_level: usize, output_level: usize) -> u64 {
        let mut state = self.lock_state();
        state.compact.register_raw(start_level, output_level)
    }

    /// Removes a placeholder compaction and re-runs scheduling
    #[doc(hidden)]
    pub fn debug_remove_ongoing_compaction(&self, id: u64) {
        let mut state = self.lock_state();
        state.compact.remove(id);
        maybe_schedule_compaction(&self.inner, &mut state);
    }

    /// Retry count of the oldest queued manual compaction
    #[doc(hidden)]
    #[must_use]
    pub fn debug_manual_retries(&self) -> Option<usize> {
        let state = self.lock_state();
        state
            .compact
            .manual_queue
            .front()
            .map(|m| m.retries.load(std::sync::atomic::Ordering::Acquire))
    }

    /// Table count per level of the current version
    #[must_use]
    pub fn level_table_counts(&self) -> [usize; NUM_LEVELS] {
        let state = self.lock_state();
        let version = state.versions.current();

        let mut counts = [0; NUM_LEVELS];
        for (level, files) in version.files.iter().enumerate() {
            counts[level] = files.len();
        }
        counts
    }

    fn latch_if_fatal(&self, state: &mut EngineState, e: Error) -> Error {
        if matches!(e, Error::Ordering(_)) {
            let e = Arc::new(e);
            state.latched = Some(e.clone());
            self.inner.config.event_listener.background_error(&e);
            Error::Latched(e)
        } else {
            e
        }
    }
}

/// A point-in-time read view; the seqno stays protected from garbage
/// collection while the snapshot is alive
pub struct Snapshot {
    store: Store,
    handle: SnapshotHandle,
}

impl Snapshot {
    /// Retrieves an item from the snapshot.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn get<K: AsRef<[u8]>>(&self, key: K) -> crate::Result<Option<UserValue>> {
        self.store.get(key, Some(self.handle.seqno()))
    }

    /// The seqno this snapshot reads at
    #[must_use]
    pub fn seqno(&self) -> SeqNo {
        self.handle.seqno()
    }
}

fn worker_options(inner: &Arc<StoreInner>) -> WorkerOptions {
    WorkerOptions {
        provider: inner.config.table_provider.clone(),
        limiter: inner.config.limiter.clone(),
        stop_signal: inner.stop_signal.clone(),
        file_nums: inner.file_nums.clone(),
        snapshots: inner.snapshots.live(),
        merge_operator: inner.config.merge_operator.clone(),
    }
}

/// Flushes the whole flushable queue into L0 tables
///
/// Flushes are serialized; a caller that finds another flush running
/// waits for it and re-checks the queue.
fn flush_once(inner: &Arc<StoreInner>) -> crate::Result<()> {
    let (compaction, batch_len) = loop {
        let mut state = inner.state.lock().expect("lock is poisoned");

        if let Some(e) = &state.latched {
            return Err(Error::Latched(e.clone()));
        }
        if state.queue.is_empty() {
            return Ok(());
        }
        if state.flush_running {
            drop(state);
            std::thread::sleep(std::time::Duration::from_millis(1));
            continue;
        }

        if inner.config.wal_enabled {
            // A reset file number counter or a memtable claiming the
            // current log would lose writes on recovery
            let invalid = inner.file_nums.get() == 0
                || state
                    .queue
                    .iter()
                    .any(|entry| entry.log_num >= state.mutable_log_num);

            if invalid {
                let e = Arc::new(Error::FlushInvariant);
                state.latched = Some(e.clone());
                inner.config.event_listener.background_error(&e);
                return Err(Error::Latched(e));
            }
        }

        let memtables: Vec<_> = state.queue.iter().map(|e| e.memtable.clone()).collect();
        let batch_len = memtables.len();

        let compaction = Compaction::new_flush(
            state.versions.current(),
            inner.config.comparator.clone(),
            &inner.config,
            memtables,
        );

        state.flush_running = true;
        break (compaction, batch_len);
    };

    inner.config.event_listener.flush_begin(batch_len);

    let result = run_compaction(&compaction, &worker_options(inner));

    let mut state = inner.state.lock().expect("lock is poisoned");
    state.flush_running = false;

    match result {
        Ok(Outcome::Finished(outputs)) => {
            let mut edit = VersionEdit::default();
            for meta in &outputs {
                edit.add(0, meta.clone());
            }

            state.versions.set_last_seqno(inner.seqno.get());

            if let Err(e) = state.versions.log_and_apply(&edit) {
                for meta in &outputs {
                    inner.config.table_provider.remove(meta.file_num).ok();
                }

                let e = Arc::new(e);
                state.latched = Some(e.clone());
                inner.config.event_listener.background_error(&e);
                return Err(Error::Latched(e));
            }

            state.queue.drain(0..batch_len);
            inner.config.event_listener.flush_end(outputs.len());

            maybe_schedule_compaction(inner, &mut state);
            Ok(())
        }
        Ok(Outcome::Cancelled) => Ok(()),
        Err(e) => {
            inner.config.event_listener.background_error(&e);
            Err(e)
        }
    }
}

/// Admits as many compactions as concurrency and disjointness allow
///
/// Runs under the state mutex. Manual compactions go first; one that
/// loses its admission race stays queued with `retries` bumped.
fn maybe_schedule_compaction(inner: &Arc<StoreInner>, state: &mut EngineState) {
    if inner.stop_signal.is_stopped() {
        return;
    }

    loop {
        if state.compact.compacting_count >= inner.config.max_concurrent_compactions {
            if let Some(manual) = state.compact.manual_queue.front() {
                // Head of queue is blocked by the concurrency cap
                manual
                    .retries
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            }
            return;
        }

        let version = state.versions.current();
        let picker = Picker::new(&version, &inner.config);
        let cmp = inner.config.comparator.clone();

        if let Some(manual) = state.compact.manual_queue.front().cloned() {
            if state.compact.manual_conflicts(&manual.request, &*cmp) {
                manual
                    .retries
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                return;
            }

            let (c, retry_later) = picker.pick_manual(
                &version,
                &cmp,
                &inner.config,
                &manual.request,
                &state.compact.compacting_files(),
            );

            match c {
                Some(c) if state.compact.conflicts_with(&c, &*cmp) => {
                    manual
                        .retries
                        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                    return;
                }
                Some(c) => {
                    state.compact.manual_queue.pop_front();
                    spawn_compaction(inner, state, c, Some(manual));
                    continue;
                }
                None if retry_later => {
                    manual
                        .retries
                        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                    return;
                }
                None => {
                    // Nothing overlaps the range on this level
                    state.compact.manual_queue.pop_front();
                    manual.finish(Ok(()));
                    continue;
                }
            }
        }

        let Some(c) = picker.pick_auto(
            &version,
            &cmp,
            &inner.config,
            &state.compact.compacting_files(),
        ) else {
            return;
        };

        if state.compact.conflicts_with(&c, &*cmp) {
            return;
        }

        spawn_compaction(inner, state, c, None);
    }
}

fn spawn_compaction(
    inner: &Arc<StoreInner>,
    state: &mut EngineState,
    c: Compaction,
    manual: Option<Arc<ManualCompaction>>,
) {
    let id = state.compact.register(&c);

    inner
        .config
        .event_listener
        .compaction_begin(c.start_level, c.output_level);

    let task_inner = inner.clone();
    let handle = std::thread::spawn(move || {
        let inner = task_inner;
        let result = run_compaction(&c, &worker_options(&inner));

        let mut state = inner.state.lock().expect("lock is poisoned");
        state.compact.remove(id);

        match result {
            Ok(Outcome::Finished(outputs)) => {
                let mut edit = VersionEdit::default();
                for (idx, files) in c.inputs.iter().enumerate() {
                    let level = if idx == 0 { c.start_level } else { c.output_level };
                    for f in files {
                        edit.delete(level, f.file_num);
                    }
                }
                for meta in &outputs {
                    edit.add(c.output_level, meta.clone());
                }

                match state.versions.log_and_apply(&edit) {
                    Ok(_) => {
                        inner.config.event_listener.compaction_end(
                            c.start_level,
                            c.output_level,
                            outputs.len(),
                        );

                        // Inputs are obsolete now; physical deletion is
                        // the provider's business
                        for f in c.all_inputs() {
                            inner.config.table_provider.remove(f.file_num).ok();
                        }

                        if let Some(manual) = manual {
                            manual.finish(Ok(()));
                        }
                    }
                    Err(e) => {
                        for meta in &outputs {
                            inner.config.table_provider.remove(meta.file_num).ok();
                        }

                        let e = Arc::new(e);
                        state.latched = Some(e.clone());
                        inner.config.event_listener.background_error(&e);

                        if let Some(manual) = manual {
                            manual.finish(Err(Error::Latched(e)));
                        }
                    }
                }
            }
            Ok(Outcome::Cancelled) => {
                if let Some(manual) = manual {
                    manual.finish(Ok(()));
                }
            }
            Err(e) => {
                // Transient; the next scheduling cycle retries
                inner.config.event_listener.background_error(&e);

                if let Some(manual) = manual {
                    manual.finish(Err(e));
                }
            }
        }

        maybe_schedule_compaction(&inner, &mut state);
    });

    inner
        .threads
        .lock()
        .expect("lock is poisoned")
        .push(handle);
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::Config;
    use test_log::test;

    #[test]
    fn write_flush_read() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        store.insert("a", "1", seqno.next())?;
        store.insert("b", "2", seqno.next())?;

        assert_eq!(Some((*b"1").into()), store.get("a", None)?);

        store.flush_active_memtable()?;

        assert_eq!(Some((*b"1").into()), store.get("a", None)?);
        assert_eq!(Some((*b"2").into()), store.get("b", None)?);
        assert_eq!(None, store.get("c", None)?);

        assert_eq!(1, store.level_table_counts()[0]);

        store.stop();
        Ok(())
    }

    #[test]
    fn tombstone_hides_key() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        store.insert("a", "1", seqno.next())?;
        store.flush_active_memtable()?;

        store.remove("a", seqno.next())?;
        assert_eq!(None, store.get("a", None)?);

        store.flush_active_memtable()?;
        assert_eq!(None, store.get("a", None)?);

        store.stop();
        Ok(())
    }

    #[test]
    fn range_tombstone_hides_span() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        store.insert("a", "1", seqno.next())?;
        store.insert("b", "2", seqno.next())?;
        store.insert("c", "3", seqno.next())?;
        store.flush_active_memtable()?;

        store.remove_range("a", "c", seqno.next())?;

        assert_eq!(None, store.get("a", None)?);
        assert_eq!(None, store.get("b", None)?);
        assert_eq!(Some((*b"3").into()), store.get("c", None)?);

        store.flush_active_memtable()?;

        assert_eq!(None, store.get("b", None)?);
        assert_eq!(Some((*b"3").into()), store.get("c", None)?);

        store.stop();
        Ok(())
    }

    #[test]
    fn snapshot_is_stable_across_compaction() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        store.insert("a", "old", seqno.next())?;
        store.flush_active_memtable()?;

        let snapshot = store.snapshot();

        store.insert("a", "new", seqno.next())?;
        store.flush_active_memtable()?;

        store.compact_range("a", "z")?;

        assert_eq!(Some((*b"old").into()), snapshot.get("a")?);
        assert_eq!(Some((*b"new").into()), store.get("a", None)?);

        store.stop();
        Ok(())
    }

    #[test]
    fn manual_compaction_moves_tables_down() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        for batch in 0..3 {
            for key in [b"a", b"h", b"p"] {
                store.insert(key, batch.to_string(), seqno.next())?;
            }
            store.flush_active_memtable()?;
        }

        assert_eq!(3, store.level_table_counts()[0]);

        store.compact_range("a", "z")?;

        let counts = store.level_table_counts();
        assert_eq!(0, counts[0]);
        assert_eq!(1, counts.iter().sum::<usize>());

        assert_eq!(Some((*b"2").into()), store.get("a", None)?);
        assert_eq!(Some((*b"2").into()), store.get("p", None)?);

        store.stop();
        Ok(())
    }

    #[test]
    fn flush_invariant_log_number() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        store.insert("hello", "world", seqno.next())?;

        // Contort the store: the sealed memtable claims the new log
        {
            let mut state = store.lock_state();
            let log_num = state.mutable_log_num;
            let sealed = std::mem::take(&mut state.mutable);
            state.queue.push(FlushableEntry {
                memtable: sealed,
                log_num: log_num + 1,
            });
        }

        let rx = store.async_flush()?;
        let result = rx.recv().expect("flush thread should answer");
        assert!(matches!(result, Err(Error::Latched(_))));

        // The error is latched: writes fail from now on
        assert!(matches!(
            store.insert("x", "y", seqno.next()),
            Err(Error::Latched(_))
        ));

        store.stop();
        Ok(())
    }

    #[test]
    fn flush_invariant_skipped_without_wal() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).disable_wal().open()?;
        let seqno = store.seqno().clone();

        store.insert("hello", "world", seqno.next())?;

        // Same contortion as above; with the WAL disabled it is benign
        {
            let mut state = store.lock_state();
            let log_num = state.mutable_log_num;
            let sealed = std::mem::take(&mut state.mutable);
            state.queue.push(FlushableEntry {
                memtable: sealed,
                log_num: log_num + 1,
            });
        }

        let rx = store.async_flush()?;
        assert!(rx.recv().expect("flush thread should answer").is_ok());

        assert_eq!(Some((*b"world").into()), store.get("hello", None)?);

        store.stop();
        Ok(())
    }

    #[test]
    fn flush_invariant_file_number_reset() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;
        let seqno = store.seqno().clone();

        store.insert("hello", "world", seqno.next())?;

        // Seal by hand so no flush races us, then reset the counter
        {
            let mut state = store.lock_state();
            let log_num = state.mutable_log_num;
            let sealed = std::mem::take(&mut state.mutable);
            state.queue.push(FlushableEntry {
                memtable: sealed,
                log_num,
            });
            state.mutable_log_num = store.inner.file_nums.next();
        }

        store.inner.file_nums.reset(0);

        let rx = store.async_flush()?;
        let result = rx.recv().expect("flush thread should answer");
        assert!(matches!(result, Err(Error::Latched(_))));

        store.stop();
        Ok(())
    }

    #[test]
    fn ingest_is_atomic_and_visible() -> crate::Result<()> {
        let folder = tempfile::tempdir()?;
        let store = Config::new(folder.path()).open()?;

        store.ingest(vec![(b"a", b"1"), (b"b", b"2")])?;

        assert_eq!(Some((*b"1").into()), store.get("a", None)?);
        assert_eq!(1, store.level_table_counts()[0]);

        store.stop();
        Ok(())
    }
}
