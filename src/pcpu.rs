// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-pcore kernel state (PCPUI).
//!
//! One of these exists per physical core and is mutated only by code
//! running on that core with interrupts disabled (spec §5); nothing
//! here needs its own lock. It tracks two independent strong
//! references — `owning_proc` (the process whose user code this pcore
//! is executing or about to) and `cur_proc` (the process whose address
//! space is installed) — since spec §3 allows them to differ briefly
//! around `__startcore`, plus the two trap-frame slots the
//! kernel-message handlers juggle between.

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::collab::{AncillaryState, TrapFrame};
use crate::pid::ProcessId;
use crate::process::Process;
use crate::refcount::ProcRef;
use crate::vcore::VcoreId;

const NONE_PID: u32 = u32::MAX;
const NONE_VCORE: u32 = u32::MAX;

/// A pending kernel message queued for local dispatch (spec §6). The
/// real argument payload is handler-specific; this crate only needs to
/// preserve ordering within a priority class, so it stores the already
/// resolved handler id and its three raw arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedMessage {
    pub handler: crate::collab::HandlerId,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
}

/// Per-pcore kernel bookkeeping.
pub struct PerCpuInfo<F, A>
where
    F: TrapFrame,
    A: AncillaryState,
{
    owning_proc_pid: AtomicU32,
    cur_proc_pid: AtomicU32,
    cur_vcoreid: AtomicU32,
    /// The strong reference backing `owning_proc_pid`, if any. Per
    /// invariant 8, holding this keeps the process's refcount above
    /// zero for as long as this pcore claims to own it.
    owning_ref: Option<ProcRef<Process<F, A>>>,
    /// The strong reference backing `cur_proc_pid`, if any.
    cur_ref: Option<ProcRef<Process<F, A>>>,
    /// The trap frame the core will return to user mode with next.
    pub cur_tf: Option<F>,
    /// A second frame slot used while a handler is swapping contexts
    /// (e.g. `__preempt` saving the old frame before installing a new
    /// one from `__startcore`).
    pub actual_tf: Option<F>,
    /// Messages that must run before any `Routine` message below.
    pub immediate_q: VecDeque<QueuedMessage>,
    /// Messages deferrable behind `immediate_q`.
    pub routine_q: VecDeque<QueuedMessage>,
}

impl<F, A> PerCpuInfo<F, A>
where
    F: TrapFrame,
    A: AncillaryState,
{
    /// An idle core: no owner, no vcore, empty queues.
    pub const fn new() -> Self {
        Self {
            owning_proc_pid: AtomicU32::new(NONE_PID),
            cur_proc_pid: AtomicU32::new(NONE_PID),
            cur_vcoreid: AtomicU32::new(NONE_VCORE),
            owning_ref: None,
            cur_ref: None,
            cur_tf: None,
            actual_tf: None,
            immediate_q: VecDeque::new(),
            routine_q: VecDeque::new(),
        }
    }

    /// The process currently assigned to this core, if any. Cheap
    /// atomic read, safe to call from a diagnostic context without
    /// `&mut`.
    pub fn owning_proc(&self) -> Option<ProcessId> {
        match self.owning_proc_pid.load(Ordering::Acquire) {
            NONE_PID => None,
            pid => Some(pid),
        }
    }

    /// The process whose address space is currently installed here, if
    /// any. May briefly differ from `owning_proc` (spec §3).
    pub fn cur_proc(&self) -> Option<ProcessId> {
        match self.cur_proc_pid.load(Ordering::Acquire) {
            NONE_PID => None,
            pid => Some(pid),
        }
    }

    /// The vcore of `owning_proc` currently scheduled here, if any.
    pub fn cur_vcoreid(&self) -> Option<VcoreId> {
        match self.cur_vcoreid.load(Ordering::Acquire) {
            NONE_VCORE => None,
            v => Some(v),
        }
    }

    /// Install `proc`/`vcoreid` as this core's owner (`__startcore`).
    /// Panics if a owner is already installed, mirroring the source's
    /// `assert(!pcpui->owning_proc)`.
    pub fn set_owner(&mut self, proc: ProcRef<Process<F, A>>, vcoreid: VcoreId) {
        assert!(self.owning_ref.is_none(), "set_owner: pcore already owned");
        self.owning_proc_pid.store(proc.pid, Ordering::Release);
        self.cur_vcoreid.store(vcoreid, Ordering::Release);
        self.owning_ref = Some(proc);
    }

    /// Update which vcore of the already-installed owner is running
    /// here, without touching ownership (`change_to_vcore`'s local
    /// bookkeeping once the switch itself has been committed).
    pub fn set_cur_vcoreid(&mut self, vcoreid: VcoreId) {
        debug_assert!(self.owning_ref.is_some(), "set_cur_vcoreid: no owner installed");
        self.cur_vcoreid.store(vcoreid, Ordering::Release);
    }

    /// Install `proc` as `cur_proc` if no process is currently
    /// installed; otherwise hand `proc` straight back so the caller can
    /// drop the now-redundant reference (the "sender pre-paid both, the
    /// handler drops one" rule of spec §4.6).
    pub fn install_cur_proc(
        &mut self,
        proc: ProcRef<Process<F, A>>,
    ) -> Result<(), ProcRef<Process<F, A>>> {
        if self.cur_ref.is_some() {
            return Err(proc);
        }
        self.cur_proc_pid.store(proc.pid, Ordering::Release);
        self.cur_ref = Some(proc);
        Ok(())
    }

    /// `__set_proc_current`: install `proc` as `cur_proc` if it differs
    /// from whatever is already installed here. On success, returns
    /// whatever reference was evicted (if any) so the caller can drop
    /// it; the caller must also `activate()` the new address space,
    /// since the installed process actually changed. On failure
    /// (`proc` was already `cur_proc`), hands `proc` itself back to
    /// drop, and no address-space switch is needed.
    pub fn set_cur_proc(
        &mut self,
        proc: ProcRef<Process<F, A>>,
    ) -> Result<Option<ProcRef<Process<F, A>>>, ProcRef<Process<F, A>>> {
        if self.cur_proc() == Some(proc.pid) {
            return Err(proc);
        }
        self.cur_proc_pid.store(proc.pid, Ordering::Release);
        Ok(self.cur_ref.replace(proc))
    }

    /// Clear ownership, returning the strong reference this core was
    /// holding so the caller can decref it (`clear_owning_proc`).
    pub fn clear_owner(&mut self) -> Option<ProcRef<Process<F, A>>> {
        self.owning_proc_pid.store(NONE_PID, Ordering::Release);
        self.cur_vcoreid.store(NONE_VCORE, Ordering::Release);
        self.cur_tf = None;
        self.owning_ref.take()
    }

    /// Clear `cur_proc`, returning its strong reference for the caller
    /// to decref (`switch_to`/`switch_back`'s uncounted-ref dance, made
    /// explicit here since Rust won't let us just drop a borrowed ref).
    pub fn clear_cur_proc(&mut self) -> Option<ProcRef<Process<F, A>>> {
        self.cur_proc_pid.store(NONE_PID, Ordering::Release);
        self.cur_ref.take()
    }

    /// Enqueue a message, honoring its priority class.
    pub fn enqueue(&mut self, msg: QueuedMessage, priority: crate::collab::MsgPriority) {
        match priority {
            crate::collab::MsgPriority::Immediate => self.immediate_q.push_back(msg),
            crate::collab::MsgPriority::Routine => self.routine_q.push_back(msg),
        }
    }

    /// Pop the next message to run: all of `immediate_q` drains before
    /// `routine_q` is touched.
    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.immediate_q.pop_front().or_else(|| self.routine_q.pop_front())
    }

    /// Whether any message is queued (`EV_CHECK_MSGS` trigger).
    pub fn has_pending(&self) -> bool {
        !self.immediate_q.is_empty() || !self.routine_q.is_empty()
    }
}

impl<F, A> Default for PerCpuInfo<F, A>
where
    F: TrapFrame,
    A: AncillaryState,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{HandlerId, MsgPriority};

    #[derive(Clone, Default)]
    struct FakeFrame;
    impl TrapFrame for FakeFrame {
        fn fresh(_entry: u64, _stack_top: u64) -> Self {
            FakeFrame
        }
        fn sanitize(&mut self) {}
    }

    #[derive(Clone, Default)]
    struct FakeAnc;
    impl AncillaryState for FakeAnc {
        fn save() -> Self {
            Self
        }
        fn restore(&self) {}
    }

    type TestPcpu = PerCpuInfo<FakeFrame, FakeAnc>;

    #[test]
    fn idle_core_has_no_owner() {
        let pcpu = TestPcpu::new();
        assert_eq!(pcpu.owning_proc(), None);
        assert_eq!(pcpu.cur_vcoreid(), None);
    }

    #[test]
    fn set_and_clear_owner_roundtrip() {
        let mut pcpu = TestPcpu::new();
        let p = ProcRef::new(Process::new(42, 0, 0, 0, 0));
        pcpu.set_owner(p, 3);
        assert_eq!(pcpu.owning_proc(), Some(42));
        assert_eq!(pcpu.cur_vcoreid(), Some(3));
        let released = pcpu.clear_owner();
        assert!(released.is_some());
        assert_eq!(pcpu.owning_proc(), None);
    }

    #[test]
    fn set_cur_proc_replaces_a_different_occupant() {
        let mut pcpu = TestPcpu::new();
        let p1 = ProcRef::new(Process::new(21, 0, 0, 0, 0));
        let p2 = ProcRef::new(Process::new(22, 0, 0, 0, 0));
        assert!(pcpu.set_cur_proc(p1).unwrap().is_none());
        let evicted = pcpu.set_cur_proc(p2).unwrap().expect("p1 should be evicted");
        assert_eq!(evicted.pid, 21);
        assert_eq!(pcpu.cur_proc(), Some(22));
    }

    #[test]
    fn set_cur_proc_bounces_back_the_same_occupant() {
        let mut pcpu = TestPcpu::new();
        let p = ProcRef::new(Process::new(23, 0, 0, 0, 0));
        assert!(pcpu.set_cur_proc(p.clone()).unwrap().is_none());
        let bounced = pcpu.set_cur_proc(p).expect_err("same pid must bounce");
        assert_eq!(bounced.pid, 23);
    }

    #[test]
    fn second_cur_proc_install_is_rejected() {
        let mut pcpu = TestPcpu::new();
        let p1 = ProcRef::new(Process::new(1, 0, 0, 0, 0));
        let p2 = ProcRef::new(Process::new(2, 0, 0, 0, 0));
        assert!(pcpu.install_cur_proc(p1).is_ok());
        let bounced = pcpu.install_cur_proc(p2).expect_err("second install must bounce");
        assert_eq!(bounced.pid, 2);
    }

    #[test]
    fn immediate_messages_drain_before_routine() {
        let mut pcpu = TestPcpu::new();
        let routine = QueuedMessage { handler: HandlerId::Notify, a0: 1, a1: 0, a2: 0 };
        let immediate = QueuedMessage { handler: HandlerId::Preempt, a0: 2, a1: 0, a2: 0 };
        pcpu.enqueue(routine, MsgPriority::Routine);
        pcpu.enqueue(immediate, MsgPriority::Immediate);

        assert!(pcpu.has_pending());
        let first = pcpu.dequeue().unwrap();
        assert_eq!(first.handler, HandlerId::Preempt);
        let second = pcpu.dequeue().unwrap();
        assert_eq!(second.handler, HandlerId::Notify);
        assert!(!pcpu.has_pending());
    }
}
