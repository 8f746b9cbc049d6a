// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! External collaborators (spec §1's "out of scope" list).
//!
//! The scheduler proper, address-space manager, arch trap frames, and
//! kernel-message transport are not implemented by this crate — they
//! are named here as traits so a host kernel can plug in its own
//! (teacher: `hadron-sched`, `hadron-mm`, architecture-specific trap
//! decoding all live in sibling crates to the core they serve). A core
//! built against these traits can be exercised in tests with trivial
//! fakes instead of real hardware.

use crate::pid::ProcessId;
use crate::vcore::{PcoreId, VcoreId};

/// An architecture's saved user-mode register frame. Opaque to this
/// crate: we only ever copy it wholesale between VCPD slots and the
/// per-core `cur_tf`/`actual_tf` storage.
pub trait TrapFrame: Clone + Send {
    /// Build a fresh frame that will, on return to user mode, begin
    /// executing `entry` on `stack_top`.
    fn fresh(entry: u64, stack_top: u64) -> Self;

    /// Strip or rewrite any fields a receiving process must not be
    /// able to forge (segment selectors, privilege bits). Called by
    /// `__startcore` before a saved frame is reinstalled.
    fn sanitize(&mut self);
}

/// An architecture's saved floating-point/vector state.
pub trait AncillaryState: Clone + Send {
    /// Capture the current hardware FP/vector register state into a
    /// fresh value (`save_fp_state`). Called by `__preempt` before the
    /// vcore is unmapped.
    fn save() -> Self
    where
        Self: Sized;

    /// Reinstall this saved FP/vector state into hardware
    /// (`restore_fp_state`). Called by `__startcore`'s restart branch
    /// once `preempt_anc` has been copied out.
    fn restore(&self);
}

/// A process's virtual address space: opaque handle managed entirely
/// by the host kernel's memory manager.
pub trait AddressSpace: Send {
    /// Install this address space as the active one on the calling
    /// pcore (`lcr3`-equivalent).
    fn activate(&self);

    /// Flush the given virtual range from the local TLB
    /// (`__tlbshootdown`'s target operation).
    fn tlb_shootdown(&self, start: usize, end: usize);
}

/// The kernel scheduler (`schedule_scp`, `put_idle_core`) and the
/// idle-core pool it draws from.
pub trait Scheduler: Send + Sync {
    /// Enqueue a newly `RUNNABLE_S` process for the single-core
    /// scheduler to eventually run.
    fn schedule_scp(&self, pid: ProcessId);

    /// Return a freed pcore to the idle pool.
    fn put_idle_core(&self, pcore: PcoreId);

    /// Notify the scheduler that `pid` has transitioned to `WAITING`.
    fn on_process_waiting(&self, pid: ProcessId);
}

/// Handler identifiers for the kernel-message ABI (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgPriority {
    /// Cannot be deferred; runs before any `Routine` message on the
    /// same pcore.
    Immediate,
    /// May be deferred behind `Immediate` messages.
    Routine,
}

/// Transport for the cross-core kernel-message protocol. Assumed to
/// deliver messages reliably, in order per priority class, with
/// interrupts disabled on the receiver (spec §1); this crate does not
/// implement IPIs or mailboxes itself.
pub trait MessageTransport: Send + Sync {
    /// Send a message to `dst_pcore`. `handler` identifies which of
    /// `__startcore`/`__notify`/`__preempt`/`__death`/`__tlbshootdown`
    /// the receiver should invoke; `a0..a2` are its raw arguments.
    fn send(
        &self,
        dst_pcore: PcoreId,
        handler: HandlerId,
        a0: u64,
        a1: u64,
        a2: u64,
        priority: MsgPriority,
    );
}

/// Which cross-core handler a kernel message should invoke on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerId {
    /// `__startcore`
    StartCore,
    /// `__notify`
    Notify,
    /// `__preempt`
    Preempt,
    /// `__death`
    Death,
    /// `__tlbshootdown`
    TlbShootdown,
}

/// Events posted to user space via the system-event ring (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    /// `EV_PREEMPT_PENDING(vcoreid)`: an advisory preemption deadline
    /// has been set for this vcore.
    PreemptPending(VcoreId),
    /// `EV_VCORE_PREEMPT(vcoreid)`: the caller's own vcore context was
    /// just saved away by `change_to_vcore`.
    VcorePreempt(VcoreId),
    /// `EV_CHECK_MSGS(vcoreid)`: the vcore should check for pending
    /// kernel messages.
    CheckMsgs(VcoreId),
}
