// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The `Process` type (C3's payload, C4/C5's home).
//!
//! Fields split the same way the concurrency model requires: anything
//! mutated only under `P.lock` lives in [`ProcessLocked`]; anything
//! user space reads without a lock (the vcore maps, `is_mcp`) lives
//! directly on `Process` behind its own seqlock or atomics.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::collab::{AddressSpace, AncillaryState, TrapFrame};
use crate::config::{EVENT_RING_SIZE, MAX_VCORES};
use crate::events::EventRing;
use crate::pid::ProcessId;
use crate::state::ProcState;
use crate::sync::SpinMutex;
use crate::vcore::{VcoreLists, VcoreMaps};
use crate::vcpd::Vcpd;

/// `resources[RES_CORES]`: desired vs. granted vcore count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resources {
    pub amt_wanted: u32,
    pub amt_granted: u32,
}

/// Everything mutated only with `P.lock` held.
pub struct ProcessLocked {
    pub state: ProcState,
    pub lists: VcoreLists,
    pub resources: Resources,
    pub exit_code: i32,
}

/// The `procinfo`/`procdata` split (spec §3), minus the parts
/// ([`VcoreMaps`], `is_mcp`) that live straight on [`Process`] because
/// they have their own lock-free reader protocol.
pub struct ProcData<F: TrapFrame, A: AncillaryState> {
    pub vcore_preempt_data: Vec<Vcpd<F, A>>,
    pub events: EventRing,
}

impl<F, A> ProcData<F, A>
where
    F: TrapFrame + Default,
    A: AncillaryState + Default,
{
    fn new() -> Self {
        Self {
            vcore_preempt_data: (0..MAX_VCORES).map(|_| Vcpd::new()).collect(),
            events: EventRing::new(EVENT_RING_SIZE),
        }
    }
}

/// A process (`P`). Generic over the host kernel's trap-frame and
/// ancillary-state types, since this crate never decodes either.
pub struct Process<F: TrapFrame, A: AncillaryState> {
    pub pid: ProcessId,
    pub ppid: ProcessId,
    /// Monotonically false -> true (invariant 6); read without the
    /// lock by anything deciding how to treat this process.
    is_mcp: AtomicBool,
    /// Bidirectional vcore/pcore map plus `coremap_seqctr`. Not behind
    /// `P.lock` — see [`crate::vcore::VcoreMaps`].
    pub maps: VcoreMaps,
    pub locked: SpinMutex<ProcessLocked>,
    pub procdata: ProcData<F, A>,
    /// Opaque page-table-root/region-list handle; `None` until the
    /// host kernel's VM manager installs one (`env_setup_vm`, out of
    /// scope here).
    pub address_space: SpinMutex<Option<Box<dyn AddressSpace>>>,
    pub argv: Vec<u8>,
    pub envp: Vec<u8>,
    pub max_vcores: u32,
    pub tsc_freq: u64,
    pub heap_bottom: usize,
    /// User-code entry address, set at load time (ELF loading is out
    /// of scope; the host kernel resolves this before `ready`).
    pub entry_point: u64,
    /// `p->env_tf`: the single-core trap frame, live only while
    /// `state ∈ {RUNNABLE_S, RUNNING_S}`. Saved by `yield`/`switch_to_m`
    /// and restored by `run_s`; always touched with `P.lock` held.
    env_tf: UnsafeCell<F>,
}

// Safety: `env_tf` is only ever read or written by code holding
// `P.lock` (run_s, yield, switch_to_m), the same discipline `Vcpd`
// relies on for its own trap-frame cells.
unsafe impl<F: TrapFrame, A: AncillaryState> Sync for Process<F, A> {}

impl<F, A> Process<F, A>
where
    F: TrapFrame + Default,
    A: AncillaryState + Default,
{
    /// Build a fresh `CREATED` process. `ppid == 0` for a parentless
    /// process (spec §3).
    pub fn new(
        pid: ProcessId,
        ppid: ProcessId,
        tsc_freq: u64,
        heap_bottom: usize,
        entry_point: u64,
    ) -> Self {
        log::info!("process {} created (parent {})", pid, ppid);
        Self {
            pid,
            ppid,
            is_mcp: AtomicBool::new(false),
            maps: VcoreMaps::new(),
            locked: SpinMutex::new(ProcessLocked {
                state: ProcState::Created,
                lists: VcoreLists::new_all_inactive(MAX_VCORES),
                resources: Resources::default(),
                exit_code: 0,
            }),
            procdata: ProcData::new(),
            address_space: SpinMutex::new(None),
            argv: Vec::new(),
            envp: Vec::new(),
            max_vcores: MAX_VCORES as u32,
            tsc_freq,
            heap_bottom,
            entry_point,
            env_tf: UnsafeCell::new(F::default()),
        }
    }

    /// Whether the process has ever become many-core.
    pub fn is_mcp(&self) -> bool {
        self.is_mcp.load(Ordering::Acquire)
    }

    /// Latch `is_mcp` to true. Invariant 6 forbids ever clearing it
    /// again, so there is no corresponding setter to `false`.
    pub fn mark_mcp(&self) {
        self.is_mcp.store(true, Ordering::Release);
    }

    /// `procinfo.num_vcores`, read without `P.lock` via the seqlock.
    pub fn num_vcores(&self) -> u32 {
        self.maps.num_vcores()
    }

    /// A snapshot of the saved single-core trap frame. Caller must hold
    /// `P.lock` (or otherwise know no concurrent writer exists).
    pub fn env_tf(&self) -> F {
        unsafe { (*self.env_tf.get()).clone() }
    }

    /// Overwrite the saved single-core trap frame. Same obligation as
    /// [`Self::env_tf`].
    pub fn set_env_tf(&self, tf: F) {
        unsafe { *self.env_tf.get() = tf };
    }
}

impl<F: TrapFrame, A: AncillaryState> Drop for Process<F, A> {
    /// The destructor hook (C3 [SUPPLEMENT]): returns the pid to the
    /// allocator and logs reclamation. Everything else named in spec
    /// §4.3 (VM regions, fs root/pwd, address space) belongs to the
    /// host kernel's collaborators and is torn down by `destroy`
    /// before the last reference drops, not here.
    fn drop(&mut self) {
        crate::pid::global().free(self.pid);
        log::info!("process {} reclaimed (refcount reached zero)", self.pid);
    }
}
