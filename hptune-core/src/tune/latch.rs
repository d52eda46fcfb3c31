use std::sync::atomic::{AtomicBool, Ordering};

/// One-way stop flag shared by every trial of an experiment.
#[derive(Debug, Default)]
pub struct StopLatch {
    latched: AtomicBool,
}

impl StopLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the latch. Returns `true` only for the call that tripped it.
    pub fn try_latch(&self) -> bool {
        self.latched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }
}
