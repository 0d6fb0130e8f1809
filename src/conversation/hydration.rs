use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct HydrationGate {
    ready: AtomicBool,
}

impl HydrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that performed the transition.
    pub fn open(&self) -> bool {
        self.ready
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
