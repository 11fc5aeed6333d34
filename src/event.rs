use crate::Error;

/// Listener for background events
///
/// All methods default to no-ops; the default listener logs instead.
pub trait EventListener: Send + Sync {
    /// A fatal background error occurred (invariant violation, flush invariant)
    fn background_error(&self, _error: &Error) {}

    /// A compaction from `start_level` into `output_level` started
    fn compaction_begin(&self, _start_level: usize, _output_level: usize) {}

    /// A compaction finished, creating `outputs` tables
    fn compaction_end(&self, _start_level: usize, _output_level: usize, _outputs: usize) {}

    /// A memtable flush started
    fn flush_begin(&self, _memtables: usize) {}

    /// A memtable flush finished, creating `outputs` tables
    fn flush_end(&self, _outputs: usize) {}
}

/// Event listener that writes to the `log` facade
#[derive(Copy, Clone, Debug, Default)]
pub struct LogEventListener;

impl EventListener for LogEventListener {
    fn background_error(&self, error: &Error) {
        log::error!("background error: {error}");
    }

    fn compaction_begin(&self, start_level: usize, output_level: usize) {
        log::debug!("compacting L{start_level} into L{output_level}");
    }

    fn compaction_end(&self, start_level: usize, output_level: usize, outputs: usize) {
        log::debug!("compacted L{start_level} into L{output_level} ({outputs} tables created)");
    }

    fn flush_begin(&self, memtables: usize) {
        log::debug!("flushing {memtables} memtable(s)");
    }

    fn flush_end(&self, outputs: usize) {
        log::debug!("flushed into {outputs} table(s)");
    }
}
