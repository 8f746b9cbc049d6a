// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Vcore maps & lists (C5).
//!
//! `VcoreMaps` is the part of `ProcInfo` that is genuinely part of the
//! external ABI: a fixed-size vcoremap/pcoremap pair plus the
//! `coremap_seqctr` seqlock that lets user space (and kernel code that
//! doesn't want `P.lock`) read it without blocking. `VcoreLists` is
//! purely kernel-internal bookkeeping and is always accessed with
//! `P.lock` already held by the caller.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::config::{MAX_PCORES, MAX_VCORES};
use crate::sync::SeqCtr;

/// Index of a vcore within a process's vcoremap.
pub type VcoreId = u32;
/// Index of a physical core within the system's pcoremap.
pub type PcoreId = u32;

const NONE_PCORE: u32 = u32::MAX;
const NONE_VCORE: u32 = u32::MAX;

/// One `procinfo.vcoremap[i]` entry.
#[derive(Debug)]
pub struct VcoreEntry {
    pcoreid: AtomicU32,
    valid: AtomicBool,
    /// Absolute deadline set by `preempt_warn`; 0 means "none".
    pub preempt_pending: AtomicU64,
    /// Barrier flag: a `__preempt` for this vcore is in flight or
    /// executing. Any yielder observing this must abort (spec §5).
    pub preempt_served: AtomicBool,
}

impl VcoreEntry {
    const fn new() -> Self {
        Self {
            pcoreid: AtomicU32::new(NONE_PCORE),
            valid: AtomicBool::new(false),
            preempt_pending: AtomicU64::new(0),
            preempt_served: AtomicBool::new(false),
        }
    }

    /// Whether this vcore is currently mapped to a pcore.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// The pcore this vcore is mapped to, if any.
    pub fn pcoreid(&self) -> Option<PcoreId> {
        if self.is_valid() {
            let p = self.pcoreid.load(Ordering::Relaxed);
            debug_assert_ne!(p, NONE_PCORE);
            Some(p)
        } else {
            None
        }
    }
}

/// One `procinfo.pcoremap[i]` entry: the inverse of a [`VcoreEntry`].
#[derive(Debug)]
pub struct PcoreEntry {
    vcoreid: AtomicU32,
    valid: AtomicBool,
}

impl PcoreEntry {
    const fn new() -> Self {
        Self {
            vcoreid: AtomicU32::new(NONE_VCORE),
            valid: AtomicBool::new(false),
        }
    }

    /// The vcore currently mapped to this pcore, if any.
    pub fn vcoreid(&self) -> Option<VcoreId> {
        if self.valid.load(Ordering::Acquire) {
            let v = self.vcoreid.load(Ordering::Relaxed);
            debug_assert_ne!(v, NONE_VCORE);
            Some(v)
        } else {
            None
        }
    }
}

/// The bidirectional vcore<->pcore map plus its seqlock, exactly the
/// part of `procinfo` that user space may read without `P.lock`.
pub struct VcoreMaps {
    vcoremap: [VcoreEntry; MAX_VCORES],
    pcoremap: [PcoreEntry; MAX_PCORES],
    /// `coremap_seqctr`: bumped around every mutation below.
    pub seqctr: SeqCtr,
    /// Mirrors `|online_vcs|`; kept here (not just derived from the
    /// list) because it is itself part of the seqlock-guarded ABI.
    num_vcores: AtomicU32,
}

impl VcoreMaps {
    /// An all-unmapped map for a freshly created process.
    pub fn new() -> Self {
        Self {
            vcoremap: core::array::from_fn(|_| VcoreEntry::new()),
            pcoremap: core::array::from_fn(|_| PcoreEntry::new()),
            seqctr: SeqCtr::new(),
            num_vcores: AtomicU32::new(0),
        }
    }

    /// Read-only view of vcore `v`'s entry.
    pub fn vcore(&self, v: VcoreId) -> &VcoreEntry {
        &self.vcoremap[v as usize]
    }

    /// Read-only view of pcore `p`'s entry.
    pub fn pcore(&self, p: PcoreId) -> &PcoreEntry {
        &self.pcoremap[p as usize]
    }

    /// Number of currently-online vcores (`procinfo.num_vcores`).
    pub fn num_vcores(&self) -> u32 {
        self.num_vcores.load(Ordering::Acquire)
    }

    /// `get_vcoreid(p)`, valid **only** when the caller is the owning
    /// vcore running in-line on its own pcore with interrupts
    /// disabled (spec §4.5); any other caller may observe a stale
    /// mapping and must instead go through `P.lock` + the vcore lists.
    pub fn get_vcoreid_unchecked(&self, p: PcoreId) -> Option<VcoreId> {
        self.pcoremap[p as usize].vcoreid()
    }

    /// `map(v, p)`: caller holds `P.lock`. Spins until `vcoremap[v]`
    /// is unmapped (it may race against an in-flight, lock-free
    /// `__preempt`/`__death` unmap on the receiving pcore), then
    /// installs the mapping both ways under the seqlock.
    pub fn map(&self, v: VcoreId, p: PcoreId) {
        let ve = &self.vcoremap[v as usize];
        while ve.valid.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        let _w = self.seqctr.write_begin();
        ve.pcoreid.store(p, Ordering::Relaxed);
        core::sync::atomic::fence(Ordering::Release);
        ve.valid.store(true, Ordering::Release);

        let pe = &self.pcoremap[p as usize];
        pe.vcoreid.store(v, Ordering::Relaxed);
        pe.valid.store(true, Ordering::Release);
    }

    /// `unmap(v)`: caller holds `P.lock`, or is the owning vcore
    /// running lock-free in a message handler on its own pcore.
    pub fn unmap(&self, v: VcoreId) {
        let ve = &self.vcoremap[v as usize];
        let Some(p) = ve.pcoreid() else {
            log::warn!("unmap({}): already unmapped", v);
            return;
        };
        let _w = self.seqctr.write_begin();
        self.pcoremap[p as usize].valid.store(false, Ordering::Release);
        core::sync::atomic::fence(Ordering::Release);
        ve.valid.store(false, Ordering::Release);
    }

    /// Bump `num_vcores` by `n`. Caller must already hold the seqlock
    /// write guard (spec §4.6: "increment num_vcores inside the
    /// seqlock").
    pub fn inc_num_vcores(&self, n: u32) {
        self.num_vcores.fetch_add(n, Ordering::Release);
    }

    /// Lower `num_vcores` by `n`. Same locking obligation as
    /// [`Self::inc_num_vcores`].
    pub fn dec_num_vcores(&self, n: u32) {
        self.num_vcores.fetch_sub(n, Ordering::Release);
    }
}

impl Default for VcoreMaps {
    fn default() -> Self {
        Self::new()
    }
}

/// The three disjoint, ordered sets a vcore belongs to (spec §3/§4.5).
/// Always mutated with `P.lock` held; insertion order matters because
/// bulk grant draws from `bulk_preempted_vcs` in the order vcores were
/// preempted.
#[derive(Debug, Default)]
pub struct VcoreLists {
    /// Vcores currently mapped to a pcore.
    pub online: VecDeque<VcoreId>,
    /// Vcores unmapped by a *bulk* preempt (`take_allcores(preempt =
    /// true)`), preserved in preemption order for `give_cores` to
    /// restart preferentially.
    pub bulk_preempted: VecDeque<VcoreId>,
    /// Vcores unmapped by anything else (single preempt, hard death,
    /// a voluntary yield).
    pub inactive: VecDeque<VcoreId>,
}

impl VcoreLists {
    /// All vcores start inactive and unmapped.
    pub fn new_all_inactive(max_vcores: usize) -> Self {
        Self {
            online: VecDeque::new(),
            bulk_preempted: VecDeque::new(),
            inactive: (0..max_vcores as VcoreId).collect(),
        }
    }

    /// Total vcores tracked across all three lists (invariant: never
    /// changes after construction).
    pub fn total(&self) -> usize {
        self.online.len() + self.bulk_preempted.len() + self.inactive.len()
    }

    /// Which list currently holds `v`, for debugging/assertions.
    pub fn locate(&self, v: VcoreId) -> Option<&'static str> {
        if self.online.contains(&v) {
            Some("online")
        } else if self.bulk_preempted.contains(&v) {
            Some("bulk_preempted")
        } else if self.inactive.contains(&v) {
            Some("inactive")
        } else {
            None
        }
    }

    /// Pop one vcore to grant: bulk-preempted head first, else
    /// inactive head (spec §4.6, `__proc_give_a_pcore`'s draw order).
    /// Moves it onto `online` and returns it.
    pub fn take_one_for_grant(&mut self) -> Option<VcoreId> {
        let v = self
            .bulk_preempted
            .pop_front()
            .or_else(|| self.inactive.pop_front())?;
        self.online.push_back(v);
        Some(v)
    }

    /// Move `v` from `online` to `inactive` (single preempt/death/yield).
    pub fn move_online_to_inactive(&mut self, v: VcoreId) {
        self.remove_from(&v);
        self.inactive.push_back(v);
    }

    /// Move `v` from `online` to `inactive`, but at the *head* (yield
    /// restores it as the next to be redrawn, spec §4.7 step 7).
    pub fn move_online_to_inactive_front(&mut self, v: VcoreId) {
        self.remove_from(&v);
        self.inactive.push_front(v);
    }

    /// Move `v` from `online` to `bulk_preempted` (bulk preempt).
    pub fn move_online_to_bulk_preempted(&mut self, v: VcoreId) {
        self.remove_from(&v);
        self.bulk_preempted.push_back(v);
    }

    /// Remove `v` from `online` without reinserting it anywhere
    /// (caller will reinsert, e.g. `change_to_vcore`'s caller side).
    pub fn remove_online(&mut self, v: VcoreId) {
        let before = self.online.len();
        self.online.retain(|&x| x != v);
        debug_assert_eq!(self.online.len() + 1, before, "v was not online");
    }

    /// Remove `v` from `inactive` and push it onto `online` (used by
    /// `change_to_vcore` for the callee side).
    pub fn move_inactive_to_online(&mut self, v: VcoreId) {
        let before = self.inactive.len();
        self.inactive.retain(|&x| x != v);
        debug_assert_eq!(self.inactive.len() + 1, before, "v was not inactive");
        self.online.push_back(v);
    }

    /// Move `v` from `bulk_preempted` to `inactive` (draining the
    /// stragglers a bulk preempt left behind once `give_cores` has
    /// restarted everyone it could).
    pub fn move_bulk_preempted_to_inactive(&mut self, v: VcoreId) {
        let before = self.bulk_preempted.len();
        self.bulk_preempted.retain(|&x| x != v);
        debug_assert_eq!(self.bulk_preempted.len() + 1, before, "v was not bulk_preempted");
        self.inactive.push_back(v);
    }

    /// Reinsert `v` at the head of `online` (yield abort path, spec
    /// §4.7 step 6: "if now set, re-insert and abort").
    pub fn reinsert_online_front(&mut self, v: VcoreId) {
        self.online.push_front(v);
    }

    fn remove_from(&mut self, v: &VcoreId) {
        let before = self.total();
        self.online.retain(|x| x != v);
        debug_assert_eq!(self.total() + 1, before, "v was not online");
    }
}
