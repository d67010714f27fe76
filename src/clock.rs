//! Process-wide commit clock.
//!
//! Strictly monotonic; incremented exactly once per transaction that
//! commits at least one write. The tick a commit draws becomes the new
//! `version` of every `Var` it writes, so all writes of one commit share a
//! timestamp.

use std::sync::atomic::{AtomicU64, Ordering};

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// Draw a fresh tick. Only call this once per committing transaction.
pub(crate) fn tick() -> u64 {
    CLOCK.fetch_add(1, Ordering::SeqCst) + 1
}

/// The most recently drawn tick, for diagnostics and tests.
#[cfg(test)]
pub(crate) fn current() -> u64 {
    CLOCK.load(Ordering::SeqCst)
}
