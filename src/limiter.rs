/// Write rate limiter shared across all compactions
///
/// `allow` is the fast path and must succeed under non-pacing
/// configurations. `wait` may block if pacing is enabled.
pub trait CompactionLimiter: Send + Sync {
    /// Tries to reserve `n` bytes of write budget without blocking
    fn allow(&self, n: u64) -> bool;

    /// Reserves `n` bytes of write budget, blocking until available
    fn wait(&self, n: u64);
}

/// Limiter that never paces
#[derive(Copy, Clone, Debug, Default)]
pub struct Unlimited;

impl CompactionLimiter for Unlimited {
    fn allow(&self, _n: u64) -> bool {
        true
    }

    fn wait(&self, _n: u64) {}
}
