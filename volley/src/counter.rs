use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

/// Hands out iteration indices to every worker of a run.
///
/// Clones share the same storage, so a counter created once per run and cloned
/// into each worker thread yields `0, 1, 2, ...` across all of them with no
/// duplicates and no gaps.
#[derive(Clone, Debug, Default)]
pub struct IterationCounter {
    value: Arc<AtomicU64>,
}

impl IterationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next index. Strictly greater than every index claimed before.
    pub fn next(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel)
    }

    /// Number of indices claimed so far.
    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Start over from zero. Only valid while no worker is calling [`next`](Self::next).
    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}
