//! Connection Gate
//!
//! Bounds concurrent adapter access to one connection attempt at a time.
//! Waiters are served in arrival order. The gate is an ordinary value: the
//! owner (usually the service) creates one and hands clones to every channel
//! that must share it.

use parking_lot::{FairMutex, FairMutexGuard};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct ConnectionGate {
    inner: Arc<FairMutex<()>>,
}

/// Held for the duration of one attempt; released on drop.
pub struct GatePass<'a> {
    _guard: FairMutexGuard<'a, ()>,
}

impl ConnectionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the gate is free.
    pub fn acquire(&self) -> GatePass<'_> {
        GatePass {
            _guard: self.inner.lock(),
        }
    }

    pub fn try_acquire(&self) -> Option<GatePass<'_>> {
        self.inner.try_lock().map(|guard| GatePass { _guard: guard })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.is_locked()
    }
}
