// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Bulk/single grant-revoke (C6).
//!
//! `give_cores` hands pcores to a process, dispatching on its current
//! state exactly as spec §4.6 describes: forbidden (fatal) for an SCP,
//! a no-op return-to-idle for `DYING`/`WAITING`, a quiet map for
//! `RUNNABLE_M`, and a `__startcore`-sending map for `RUNNING_M`
//! (which additionally pre-pays the "+2 per pcore" refcount). `take_*`
//! is the inverse: unmap directly if the process isn't actually
//! running anywhere, or send `__preempt`/`__death` and let the
//! receiving handler (`kmsg.rs`) perform the unmap once it has saved
//! whatever state needs saving.

use alloc::vec::Vec;

use crate::collab::{AncillaryState, HandlerId, MessageTransport, MsgPriority, Scheduler, TrapFrame, UserEvent};
use crate::kmsg;
use crate::process::{Process, ProcessLocked};
use crate::refcount::ProcRef;
use crate::state::ProcState;
use crate::status::{ProcError, Result};
use crate::vcore::{PcoreId, VcoreId};

/// Hand `pcores` to `proc`. Mirrors `give_cores(P, pc_arr, n)` (spec
/// §4.6): the caller supplies no explicit `n`, since it is always
/// `pcores.len()`.
pub fn give_cores<F, A>(
    proc: &ProcRef<Process<F, A>>,
    pcores: &[PcoreId],
    scheduler: &dyn Scheduler,
    transport: &dyn MessageTransport,
) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    if pcores.is_empty() {
        return Err(ProcError::InvalidArgs);
    }
    let mut locked = proc.locked.lock();
    match locked.state {
        ProcState::RunnableS | ProcState::RunningS => {
            panic!("give_cores: forbidden on an SCP in state {}", locked.state)
        }
        ProcState::Created => Err(ProcError::BadState),
        ProcState::Dying | ProcState::Waiting => {
            drop(locked);
            for &pcoreid in pcores {
                scheduler.put_idle_core(pcoreid);
            }
            Ok(())
        }
        ProcState::RunnableM => {
            let drawn = draw_n(&mut locked, pcores, true)?;
            map_drawn(proc, &drawn);
            locked.resources.amt_granted += drawn.len() as u32;
            Ok(())
        }
        ProcState::RunningM => {
            debug_assert!(
                locked.lists.bulk_preempted.is_empty(),
                "give_cores: RUNNING_M must draw only from inactive_vcs"
            );
            let drawn = draw_n(&mut locked, pcores, false)?;
            map_drawn(proc, &drawn);
            locked.resources.amt_granted += drawn.len() as u32;
            drop(locked);
            for &(_, pcoreid) in &drawn {
                // +2: one materialized here, one paid manually for
                // `cur_proc` (spec §4.6's rationale).
                proc.manual_incref();
                kmsg::send(
                    transport,
                    pcoreid,
                    HandlerId::StartCore,
                    proc.clone(),
                    MsgPriority::Immediate,
                );
            }
            Ok(())
        }
    }
}

/// Start (or restart) an `RUNNABLE_M` process whose online vcores were
/// already mapped by a prior `give_cores`. Mirrors `__proc_run_m`: a
/// no-op on `DYING`/`RUNNING_M`/`WAITING`, otherwise sends one
/// `__startcore` per online vcore and drains any leftover
/// `bulk_preempted_vcs` stragglers into `EV_VCORE_PREEMPT` events
/// before switching to `RUNNING_M`.
pub fn run_m<F, A>(proc: &ProcRef<Process<F, A>>, transport: &dyn MessageTransport) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    match locked.state {
        ProcState::Dying => {
            log::warn!("run_m: {} not starting, already dying", proc.pid);
            return Ok(());
        }
        ProcState::RunningM | ProcState::Waiting => Ok(()),
        ProcState::RunnableM => {
            if proc.num_vcores() == 0 {
                log::warn!("run_m: {} has no online vcores to run", proc.pid);
                return Err(ProcError::BadState);
            }
            drain_bulk_preempted(proc, &mut locked);
            locked.state.set(ProcState::RunningM);
            let online: Vec<PcoreId> = locked
                .lists
                .online
                .iter()
                .filter_map(|&v| proc.maps.vcore(v).pcoreid())
                .collect();
            drop(locked);
            for pcoreid in online {
                // +2 per pcore, same rationale as `give_cores`'s
                // `RUNNING_M` branch: one for `owning_proc`, one for
                // `cur_proc`.
                proc.manual_incref();
                kmsg::send(transport, pcoreid, HandlerId::StartCore, proc.clone(), MsgPriority::Immediate);
            }
            Ok(())
        }
        _ => panic!("run_m: invalid state {} for process {}", locked.state, proc.pid),
    }
}

/// Tell user space about any vcore still sitting in `bulk_preempted_vcs`
/// once `run_m` has restarted everyone it has pcores for
/// (`__send_bulkp_events`): each one posts `EV_VCORE_PREEMPT` and moves
/// to `inactive_vcs`, since no further message is coming for it.
fn drain_bulk_preempted<F, A>(proc: &ProcRef<Process<F, A>>, locked: &mut ProcessLocked)
where
    F: TrapFrame,
    A: AncillaryState,
{
    let stragglers: Vec<VcoreId> = locked.lists.bulk_preempted.iter().copied().collect();
    for v in stragglers {
        proc.procdata.events.post(UserEvent::VcorePreempt(v));
        locked.lists.move_bulk_preempted_to_inactive(v);
    }
}

/// Draw `pcores.len()` vcores to grant. `allow_bulk` controls whether
/// `bulk_preempted_vcs` may be drawn from first (`RUNNABLE_M`) or must
/// stay untouched (`RUNNING_M`, which asserts it empty instead).
fn draw_n(
    locked: &mut ProcessLocked,
    pcores: &[PcoreId],
    allow_bulk: bool,
) -> Result<Vec<(VcoreId, PcoreId)>> {
    let mut drawn = Vec::with_capacity(pcores.len());
    for &pcoreid in pcores {
        let vcoreid = if allow_bulk {
            locked.lists.take_one_for_grant()
        } else {
            match locked.lists.inactive.pop_front() {
                Some(v) => {
                    locked.lists.online.push_back(v);
                    Some(v)
                }
                None => None,
            }
        }
        .ok_or(ProcError::NoResources)?;
        drawn.push((vcoreid, pcoreid));
    }
    Ok(drawn)
}

fn map_drawn<F, A>(proc: &ProcRef<Process<F, A>>, drawn: &[(VcoreId, PcoreId)])
where
    F: TrapFrame,
    A: AncillaryState,
{
    // `map` runs its own seqlock write for the vcoremap/pcoremap pair;
    // `num_vcores` gets a second, separate write once all of them land.
    for &(vcoreid, pcoreid) in drawn {
        proc.maps.map(vcoreid, pcoreid);
    }
    let _w = proc.maps.seqctr.write_begin();
    proc.maps.inc_num_vcores(drawn.len() as u32);
}

/// Revoke exactly the vcores mapped to `pcores`. If the process is
/// `RUNNING_M`, sends `__death` (if `kill`) or `__preempt` (otherwise)
/// to each pcore and lets the handler unmap; if `RUNNABLE_M`, unmaps
/// directly since nothing is actually executing there. `bulk_dest`
/// selects which list the revoked vcores land in: `bulk_preempted_vcs`
/// for a bulk preempt, `inactive_vcs` otherwise.
pub fn take_corelist<F, A>(
    proc: &ProcRef<Process<F, A>>,
    pcores: &[PcoreId],
    bulk_dest: bool,
    kill: bool,
    transport: &dyn MessageTransport,
) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    if pcores.is_empty() {
        return Err(ProcError::InvalidArgs);
    }
    let mut locked = proc.locked.lock();
    let running = locked.state == ProcState::RunningM;

    let mut taken = Vec::with_capacity(pcores.len());
    for &pcoreid in pcores {
        let vcoreid = proc.maps.pcore(pcoreid).vcoreid().ok_or(ProcError::NotMapped)?;
        debug_assert_eq!(proc.maps.vcore(vcoreid).pcoreid(), Some(pcoreid));
        if running && !kill {
            let vcpd = &proc.procdata.vcore_preempt_data[vcoreid as usize];
            vcpd.flags.set(crate::vcpd::VcpdFlags::VC_K_LOCK);
            proc.maps.vcore(vcoreid).preempt_served.store(true, core::sync::atomic::Ordering::Release);
        }
        if bulk_dest {
            locked.lists.move_online_to_bulk_preempted(vcoreid);
        } else {
            locked.lists.move_online_to_inactive(vcoreid);
        }
        taken.push((vcoreid, pcoreid));
    }

    {
        let _w = proc.maps.seqctr.write_begin();
        proc.maps.dec_num_vcores(taken.len() as u32);
    }
    locked.resources.amt_granted -= taken.len() as u32;
    drop(locked);

    for &(vcoreid, pcoreid) in &taken {
        if running {
            // Single passed reference, unlike `__startcore`'s +2: the
            // handler's lone `drop(p)` balances this lone `clone`.
            let handler = if kill { HandlerId::Death } else { HandlerId::Preempt };
            kmsg::send(transport, pcoreid, handler, proc.clone(), MsgPriority::Immediate);
        } else {
            proc.maps.unmap(vcoreid);
        }
    }
    Ok(())
}

/// Revoke every vcore `proc` currently holds online. `preempt` selects
/// a soft bulk-preempt (sends `__preempt`, lands in `bulk_preempted_vcs`)
/// versus a hard kill (sends `__death`, lands in `inactive_vcs`).
/// Mirrors `__proc_take_allcores`; returns the count revoked.
pub fn take_allcores<F, A>(
    proc: &ProcRef<Process<F, A>>,
    preempt: bool,
    transport: &dyn MessageTransport,
) -> Result<usize>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let pcores: Vec<PcoreId> = {
        let locked = proc.locked.lock();
        locked
            .lists
            .online
            .iter()
            .filter_map(|&v| proc.maps.vcore(v).pcoreid())
            .collect()
    };
    if pcores.is_empty() {
        return Ok(0);
    }
    let n = pcores.len();
    take_corelist(proc, &pcores, preempt, !preempt, transport)?;
    Ok(n)
}

/// `preempt_warn(P, v, t)`: set an advisory deadline on `v` and post
/// `EV_PREEMPT_PENDING` so user space gets a chance to yield cleanly
/// before the kernel revokes the pcore out from under it (spec §4.10).
/// `deadline` is an opaque absolute tick value from the host kernel's
/// clock/alarm collaborator; this crate never reads a clock itself.
pub fn preempt_warn<F, A>(proc: &ProcRef<Process<F, A>>, v: VcoreId, deadline: u64)
where
    F: TrapFrame,
    A: AncillaryState,
{
    proc.maps.vcore(v).preempt_pending.store(deadline, core::sync::atomic::Ordering::Release);
    proc.procdata.events.post(UserEvent::PreemptPending(v));
}

/// `preempt_core(P, p, deadline)`: warn `p`'s vcore, then immediately
/// revoke it via a single (non-bulk) preempt. Mirrors the source's
/// `proc_preempt_core`, which does not actually wait out the deadline
/// itself — an external alarm facility is what makes a warning and its
/// revocation different points in time.
pub fn preempt_core<F, A>(
    proc: &ProcRef<Process<F, A>>,
    pcoreid: PcoreId,
    deadline: u64,
    transport: &dyn MessageTransport,
) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let vcoreid = proc.maps.pcore(pcoreid).vcoreid().ok_or(ProcError::NotMapped)?;
    preempt_warn(proc, vcoreid, deadline);
    take_corelist(proc, &[pcoreid], false, false, transport)
}

/// `preempt_all(P, deadline)`: warn every online vcore, then bulk-revoke
/// them all as a soft preempt. If that empties `online_vcs`, the
/// process has no way to make further progress until some vcore is
/// granted back, so it drops to `RUNNABLE_M` (spec §4.10's closing
/// sentence).
pub fn preempt_all<F, A>(
    proc: &ProcRef<Process<F, A>>,
    deadline: u64,
    transport: &dyn MessageTransport,
) -> Result<usize>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let online: Vec<VcoreId> = proc.locked.lock().lists.online.iter().copied().collect();
    for v in online {
        preempt_warn(proc, v, deadline);
    }
    let n = take_allcores(proc, true, transport)?;
    if proc.num_vcores() == 0 {
        let mut locked = proc.locked.lock();
        if locked.state == ProcState::RunningM {
            locked.state.set(ProcState::RunnableM);
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

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

    #[derive(Default)]
    struct RecordingTransport {
        sent: AtomicUsize,
    }
    impl MessageTransport for RecordingTransport {
        fn send(
            &self,
            _dst_pcore: PcoreId,
            _handler: HandlerId,
            _a0: u64,
            _a1: u64,
            _a2: u64,
            _priority: MsgPriority,
        ) {
            self.sent.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        idled: AtomicUsize,
    }
    impl Scheduler for RecordingScheduler {
        fn schedule_scp(&self, _pid: crate::pid::ProcessId) {}
        fn put_idle_core(&self, _pcore: PcoreId) {
            self.idled.fetch_add(1, Ordering::SeqCst);
        }
        fn on_process_waiting(&self, _pid: crate::pid::ProcessId) {}
    }

    fn mcp(pid: u32, state: ProcState) -> ProcRef<Process<FakeFrame, FakeAnc>> {
        let p = ProcRef::new(Process::new(pid, 0, 0, 0, 0));
        p.mark_mcp();
        p.locked.lock().state = state;
        p
    }

    #[test]
    fn give_cores_running_m_maps_and_sends_startcore() {
        let p = mcp(1, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[4, 5, 6], &sched, &transport).unwrap();

        assert_eq!(p.num_vcores(), 3);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 3);
        assert_eq!(p.locked.lock().lists.online.len(), 3);
    }

    #[test]
    fn give_cores_runnable_m_maps_without_sending_messages() {
        let p = mcp(2, ProcState::RunnableM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[9, 10], &sched, &transport).unwrap();
        assert_eq!(p.num_vcores(), 2);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn give_cores_to_dying_process_returns_pcores_to_idle() {
        let p = mcp(3, ProcState::Dying);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2], &sched, &transport).unwrap();
        assert_eq!(p.num_vcores(), 0);
        assert_eq!(sched.idled.load(Ordering::SeqCst), 2);
    }

    #[test]
    #[should_panic(expected = "forbidden")]
    fn give_cores_to_scp_panics() {
        let p = mcp(4, ProcState::RunningS);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        let _ = give_cores(&p, &[1], &sched, &transport);
    }

    #[test]
    fn take_corelist_running_m_sends_preempt_and_defers_unmap_to_handler() {
        let p = mcp(5, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2], &sched, &transport).unwrap();
        assert_eq!(p.num_vcores(), 2);

        take_corelist(&p, &[1], true, false, &transport).unwrap();
        assert_eq!(p.num_vcores(), 1);
        assert_eq!(p.locked.lock().lists.bulk_preempted.len(), 1);
        // Handler hasn't run yet: still mapped.
        assert!(p.maps.vcore(0).is_valid() || p.maps.vcore(1).is_valid());
    }

    #[test]
    fn take_corelist_runnable_m_unmaps_directly() {
        let p = mcp(6, ProcState::RunnableM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2], &sched, &transport).unwrap();

        take_corelist(&p, &[1], false, false, &transport).unwrap();
        assert_eq!(p.num_vcores(), 1);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn take_allcores_preempt_drains_online_to_bulk() {
        let p = mcp(7, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2, 3], &sched, &transport).unwrap();

        let n = take_allcores(&p, true, &transport).unwrap();
        assert_eq!(n, 3);
        assert_eq!(p.num_vcores(), 0);
        assert_eq!(p.locked.lock().lists.bulk_preempted.len(), 3);
    }

    #[test]
    fn run_m_sends_startcore_for_each_online_vcore() {
        let p = mcp(9, ProcState::RunnableM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2], &sched, &transport).unwrap();

        run_m(&p, &transport).unwrap();
        assert_eq!(p.locked.lock().state, ProcState::RunningM);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_m_drains_bulk_preempted_stragglers_as_events() {
        let p = mcp(10, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2, 3, 4], &sched, &transport).unwrap();
        take_allcores(&p, true, &transport).unwrap();
        assert_eq!(p.locked.lock().lists.bulk_preempted.len(), 4);

        p.locked.lock().state = ProcState::RunnableM;
        give_cores(&p, &[5, 6], &sched, &transport).unwrap();
        run_m(&p, &transport).unwrap();

        assert_eq!(p.locked.lock().lists.bulk_preempted.len(), 0);
        assert_eq!(p.locked.lock().lists.inactive.len(), 2);
        assert_eq!(p.procdata.events.len(), 2);
    }

    #[test]
    fn run_m_on_dying_process_is_a_noop() {
        let p = mcp(11, ProcState::Dying);
        let transport = RecordingTransport::default();
        assert!(run_m(&p, &transport).is_ok());
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn take_corelist_on_unmapped_pcore_errors() {
        let p = mcp(8, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let err = take_corelist(&p, &[42], false, false, &transport).unwrap_err();
        assert_eq!(err, ProcError::NotMapped);
    }

    #[test]
    fn preempt_warn_sets_deadline_and_posts_event() {
        let p = mcp(20, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[5], &sched, &transport).unwrap();
        let vcoreid = p.maps.pcore(5).vcoreid().unwrap();

        preempt_warn(&p, vcoreid, 12345);
        assert_eq!(p.maps.vcore(vcoreid).preempt_pending.load(Ordering::SeqCst), 12345);
        assert_eq!(p.procdata.events.len(), 1);
    }

    #[test]
    fn preempt_core_warns_then_revokes_single_pcore() {
        let p = mcp(21, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[5, 6], &sched, &transport).unwrap();

        preempt_core(&p, 5, 999, &transport).unwrap();
        assert_eq!(p.num_vcores(), 1);
        // single preempt lands in inactive, not bulk_preempted.
        assert_eq!(p.locked.lock().lists.inactive.len(), 1);
    }

    #[test]
    fn preempt_all_drops_to_runnable_m_once_empty() {
        let p = mcp(22, ProcState::RunningM);
        let transport = RecordingTransport::default();
        let sched = RecordingScheduler::default();
        give_cores(&p, &[1, 2, 3], &sched, &transport).unwrap();

        let n = preempt_all(&p, 42, &transport).unwrap();
        assert_eq!(n, 3);
        assert_eq!(p.num_vcores(), 0);
        assert_eq!(p.locked.lock().state, ProcState::RunnableM);
        assert_eq!(p.locked.lock().lists.bulk_preempted.len(), 3);
    }
}
