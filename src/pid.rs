// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process ID allocation (C1).
//!
//! A bitmap over `[0, PID_MAX]` with bit 0 permanently set (pid 0 is
//! reserved). `allocate` scans circularly from a persistent cursor so
//! that recently-freed pids are not handed out again immediately,
//! giving stale references a chance to notice their pid has turned
//! over. Both operations take a dedicated lock distinct from the
//! registry lock (spec §5: distinct lock domains).

use crate::config::PID_MAX;
use crate::status::{ProcError, Result};
use crate::sync::SpinMutex;
use alloc::vec;
use alloc::vec::Vec;

/// Process id type. `0` is never a valid live pid.
pub type ProcessId = u32;

const BITS_PER_WORD: u32 = u64::BITS;

fn word_count(max: u32) -> usize {
    ((max as usize) + 1 + BITS_PER_WORD as usize - 1) / BITS_PER_WORD as usize
}

struct Bitmap {
    words: Vec<u64>,
    cursor: u32,
}

impl Bitmap {
    fn new(max: u32) -> Self {
        let mut words = vec![0u64; word_count(max)];
        // Reserve pid 0.
        words[0] |= 1;
        Self { words, cursor: 1 }
    }

    fn is_set(&self, pid: u32) -> bool {
        let (w, b) = (pid / BITS_PER_WORD, pid % BITS_PER_WORD);
        self.words[w as usize] & (1u64 << b) != 0
    }

    fn set(&mut self, pid: u32) {
        let (w, b) = (pid / BITS_PER_WORD, pid % BITS_PER_WORD);
        self.words[w as usize] |= 1u64 << b;
    }

    fn clear(&mut self, pid: u32) {
        let (w, b) = (pid / BITS_PER_WORD, pid % BITS_PER_WORD);
        self.words[w as usize] &= !(1u64 << b);
    }
}

/// Allocator for [`ProcessId`]s in `[1, PID_MAX]`.
pub struct PidAllocator {
    inner: SpinMutex<Bitmap>,
    max: u32,
}

impl PidAllocator {
    /// Construct an allocator covering `[0, max]`, with pid 0 reserved.
    pub fn new(max: u32) -> Self {
        Self {
            inner: SpinMutex::new(Bitmap::new(max)),
            max,
        }
    }

    /// Allocate the next free pid, searching circularly from the
    /// cursor left by the previous call. Errs if the space is full.
    pub fn allocate(&self) -> Result<ProcessId> {
        let mut bm = self.inner.lock();
        let total = self.max + 1;
        let start = bm.cursor;
        let mut i = start;
        loop {
            if !bm.is_set(i) {
                bm.set(i);
                bm.cursor = (i + 1) % total;
                log::debug!("pid {} allocated", i);
                return Ok(i);
            }
            i = (i + 1) % total;
            if i == start {
                log::warn!("pid allocator exhausted at {} entries", total);
                return Err(ProcError::NoFreePid);
            }
        }
    }

    /// Return `pid` to the free pool. No-op (and logged) if it was not
    /// actually allocated — that indicates a double-free bug upstream
    /// but is not itself a memory-safety issue here.
    pub fn free(&self, pid: ProcessId) {
        if pid == 0 || pid > self.max {
            log::error!("pid_free: {} out of range", pid);
            return;
        }
        let mut bm = self.inner.lock();
        if !bm.is_set(pid) {
            log::warn!("pid_free: {} was already free", pid);
        }
        bm.clear(pid);
        log::debug!("pid {} freed", pid);
    }
}

/// Process-wide [`PidAllocator`] sized from [`crate::config::PID_MAX`].
pub fn global() -> &'static PidAllocator {
    lazy_static::lazy_static! {
        static ref ALLOCATOR: PidAllocator = PidAllocator::new(PID_MAX);
    }
    &ALLOCATOR
}
