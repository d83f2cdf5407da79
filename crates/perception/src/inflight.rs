//! Claim flags for work that has been submitted to the accelerator but not
//! yet read back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A claim that at most one holder owns at a time. Clones share the claim.
#[derive(Debug, Clone, Default)]
pub struct InflightFlag(Arc<AtomicBool>);

impl InflightFlag {
    #[must_use]
    pub fn try_acquire(&self) -> Option<InflightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InflightGuard(Arc::clone(&self.0)))
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the flag when dropped.
#[derive(Debug)]
pub struct InflightGuard(Arc<AtomicBool>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
