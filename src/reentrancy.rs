//! Cascade depth tracking.
//!
//! Destruction notifications nest: finalizing one object can drop the last
//! strong reference to another while the first is still being torn down.
//! That is reentrancy, not concurrency, and it is allowed. The tracker only
//! records how deep the nesting goes so it can be logged and inspected; it
//! never limits it.

use core::cell::Cell;
use core::marker::PhantomData;

/// Per-heap nesting counter. Embed it and wrap each finalization with
/// `let _d = self.depth.enter();`.
#[derive(Debug)]
pub struct CascadeDepth {
    depth: Cell<u32>,
    max: Cell<u32>,
    // Keep !Send + !Sync in line with the single-threaded design.
    _nosend: PhantomData<*mut ()>,
}

impl CascadeDepth {
    pub const fn new() -> Self {
        Self {
            depth: Cell::new(0),
            max: Cell::new(0),
            _nosend: PhantomData,
        }
    }

    /// Enter one level of nesting; the level is left when the guard drops.
    #[inline]
    pub fn enter(&self) -> DepthGuard<'_> {
        let d = self.depth.get() + 1;
        self.depth.set(d);
        if d > self.max.get() {
            self.max.set(d);
        }
        DepthGuard { owner: self }
    }

    /// Current nesting level (0 outside any finalization).
    pub fn current(&self) -> u32 {
        self.depth.get()
    }

    /// Deepest nesting observed so far.
    pub fn max(&self) -> u32 {
        self.max.get()
    }
}

impl Default for CascadeDepth {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `CascadeDepth::enter`.
pub struct DepthGuard<'a> {
    owner: &'a CascadeDepth,
}

impl<'a> DepthGuard<'a> {
    pub fn level(&self) -> u32 {
        self.owner.depth.get()
    }
}

impl<'a> Drop for DepthGuard<'a> {
    fn drop(&mut self) {
        let d = self.owner.depth.get();
        debug_assert!(d > 0);
        self.owner.depth.set(d - 1);
    }
}
