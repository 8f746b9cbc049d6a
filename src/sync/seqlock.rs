// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Sequence counter for the `coremap_seqctr` protocol.
//!
//! This is part of the external ABI shared with user space (spec §9):
//! a single `AtomicU32` that a writer bumps to odd before mutating the
//! vcoremap/pcoremap/`num_vcores` triple and back to even afterwards.
//! Readers outside the process lock (i.e. user space, or kernel code
//! that doesn't want to take `P.lock`) retry whenever they observe an
//! odd counter, or a counter that changed between the start and end of
//! their read.

use core::sync::atomic::{AtomicU32, Ordering};

/// Sequence counter guarding a block of fields mutated only under the
/// process lock but read-without-locking by user space.
#[derive(Debug)]
pub struct SeqCtr(AtomicU32);

impl SeqCtr {
    /// A fresh, even (unwritten) counter.
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Begin a write: bump to odd. Caller must already hold `P.lock`;
    /// this only exists to make the odd/even protocol visible to
    /// readers, not to provide mutual exclusion among writers.
    pub fn write_begin(&self) -> SeqWriteGuard<'_> {
        let prev = self.0.fetch_add(1, Ordering::Release);
        debug_assert_eq!(prev % 2, 0, "coremap_seqctr: write_begin on odd counter");
        SeqWriteGuard { ctr: self }
    }

    /// A consistent snapshot of the counter, for a reader about to spin
    /// on [`Self::read_retry`].
    pub fn read_begin(&self) -> u32 {
        loop {
            let v = self.0.load(Ordering::Acquire);
            if v % 2 == 0 {
                return v;
            }
            core::hint::spin_loop();
        }
    }

    /// Returns true if the reader must discard what it just read and
    /// retry: either a write was in flight when it finished reading, or
    /// one completed in between.
    pub fn read_retry(&self, start: u32) -> bool {
        self.0.load(Ordering::Acquire) != start
    }

    /// Current raw value, for tests and debug dumps only.
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for SeqCtr {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII end of a [`SeqCtr::write_begin`] critical section: bumps the
/// counter back to even on drop.
pub struct SeqWriteGuard<'a> {
    ctr: &'a SeqCtr,
}

impl<'a> Drop for SeqWriteGuard<'a> {
    fn drop(&mut self) {
        self.ctr.0.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_begin_then_drop_returns_to_even() {
        let ctr = SeqCtr::new();
        assert_eq!(ctr.raw() % 2, 0);
        {
            let _g = ctr.write_begin();
            assert_eq!(ctr.raw() % 2, 1);
        }
        assert_eq!(ctr.raw() % 2, 0);
    }

    #[test]
    fn reader_sees_retry_across_a_write() {
        let ctr = SeqCtr::new();
        let start = ctr.read_begin();
        {
            let _g = ctr.write_begin();
            assert!(ctr.read_retry(start));
        }
        assert!(ctr.read_retry(start));
        let start2 = ctr.read_begin();
        assert!(!ctr.read_retry(start2));
    }
}
