// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Per-core dispatch loop (C8): the code path that actually enters and
//! leaves user mode.
//!
//! `run_s` starts a single-core process on the calling pcore. `yield_core`
//! is the careful eight-step sequence of spec §4.7 that lets a running
//! many-core vcore hand its pcore back without racing `__notify`/`__preempt`
//! (`kmsg.rs`'s handlers run lock-free on the same pcore and must never
//! observe a half-finished yield). `switch_to_m` is the one-time S→M
//! transition. `change_to_vcore` lets a running vcore context switch to a
//! sibling vcore of the same process without ever leaving kernel mode.

use core::sync::atomic::Ordering;

use crate::collab::{AncillaryState, Scheduler, TrapFrame, UserEvent};
use crate::pcpu::PerCpuInfo;
use crate::process::Process;
use crate::refcount::ProcRef;
use crate::state::ProcState;
use crate::status::{ProcError, Result};
use crate::vcore::{PcoreId, VcoreId};
use crate::vcpd::VcpdFlags;

/// Outcome of a `yield_core` call. Only `RunningM` can abort; an abort
/// is a benign race loss (spec §7), not a failure — the vcore simply
/// keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldOutcome {
    /// The pcore was released and the process's state updated.
    Yielded,
    /// Step 1: this pcore no longer maps to any vcore of `proc` — a
    /// `__preempt`/`__death` beat us here.
    AbortedNotMapped,
    /// Step 2: called as a response to a preempt warning, but no
    /// warning (`preempt_pending`) is actually outstanding.
    AbortedBeingNiceButNoWarning,
    /// Step 3: a `__preempt` for this vcore is already in flight.
    AbortedPreemptServed,
    /// Steps 5/6: user space has an unhandled notification pending and
    /// must run it before this vcore may give up its pcore.
    AbortedNotifPending,
}

/// `run_s(P)`: start a `RUNNABLE_S` process on `pcoreid`, the calling
/// pcore. Maps vcore 0 there, installs its saved frame, and takes both
/// `owning_proc` and `cur_proc` on the local [`PerCpuInfo`].
pub fn run_s<F, A>(proc: &ProcRef<Process<F, A>>, pcpu: &mut PerCpuInfo<F, A>, pcoreid: PcoreId) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    if locked.state != ProcState::RunnableS {
        return Err(ProcError::BadState);
    }
    locked.state.set(ProcState::RunningS);
    locked.lists.move_inactive_to_online(0);
    drop(locked);

    proc.maps.map(0, pcoreid);
    {
        let _w = proc.maps.seqctr.write_begin();
        proc.maps.inc_num_vcores(1);
    }

    let frame = proc.env_tf();
    pcpu.actual_tf = Some(frame.clone());
    pcpu.cur_tf = Some(frame);

    match pcpu.set_cur_proc(proc.clone()) {
        Ok(evicted) => {
            if let Some(asp) = proc.address_space.lock().as_deref() {
                asp.activate();
            }
            drop(evicted);
        }
        Err(same) => drop(same),
    }
    pcpu.set_owner(proc.clone(), 0);
    Ok(())
}

/// Release `pcpu`'s ownership, dropping the strong reference it was
/// holding for `owning_proc` (`clear_owning_proc`). The caller is
/// responsible for returning the pcore to the idle pool afterward.
pub fn abandon_core<F, A>(pcpu: &mut PerCpuInfo<F, A>) -> Option<ProcRef<Process<F, A>>>
where
    F: TrapFrame,
    A: AncillaryState,
{
    pcpu.clear_owner()
}

fn finish_yield<F, A>(pcpu: &mut PerCpuInfo<F, A>, scheduler: &dyn Scheduler, pcoreid: PcoreId)
where
    F: TrapFrame,
    A: AncillaryState,
{
    drop(abandon_core(pcpu));
    scheduler.put_idle_core(pcoreid);
}

/// `yield(P)`, called by the running process on its own pcore. Disables
/// interrupts and locks `P` are the caller's responsibility (this crate
/// models only the logic, not the architecture-specific trap gating).
pub fn yield_core<F, A>(
    proc: &ProcRef<Process<F, A>>,
    pcpu: &mut PerCpuInfo<F, A>,
    pcoreid: PcoreId,
    being_nice: bool,
    scheduler: &dyn Scheduler,
) -> Result<YieldOutcome>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    match locked.state {
        ProcState::RunningS => {
            if let Some(tf) = pcpu.cur_tf.take() {
                proc.set_env_tf(tf);
            }
            proc.maps.unmap(0);
            {
                let _w = proc.maps.seqctr.write_begin();
                proc.maps.dec_num_vcores(1);
            }
            locked.lists.move_online_to_inactive(0);
            locked.state.set(ProcState::RunnableS);
            drop(locked);
            scheduler.schedule_scp(proc.pid);
            finish_yield(pcpu, scheduler, pcoreid);
            Ok(YieldOutcome::Yielded)
        }
        ProcState::RunningM => {
            // Step 1: confirm we're still mapped here at all.
            let Some(vcoreid) = proc.maps.get_vcoreid_unchecked(pcoreid) else {
                return Ok(YieldOutcome::AbortedNotMapped);
            };
            let ventry = proc.maps.vcore(vcoreid);

            // Step 2: a "being nice" yield only proceeds if we were
            // actually warned.
            if being_nice && ventry.preempt_pending.load(Ordering::Acquire) == 0 {
                return Ok(YieldOutcome::AbortedBeingNiceButNoWarning);
            }
            // Step 3: a `__preempt` is already in flight for us.
            if ventry.preempt_served.load(Ordering::Acquire) {
                return Ok(YieldOutcome::AbortedPreemptServed);
            }
            // Step 4.
            ventry.preempt_pending.store(0, Ordering::Release);

            let vcpd = &proc.procdata.vcore_preempt_data[vcoreid as usize];
            // Step 5: check before touching the lists.
            if vcpd.notif_pending.load(Ordering::Acquire) {
                return Ok(YieldOutcome::AbortedNotifPending);
            }

            // Step 6: remove optimistically, then re-check.
            locked.lists.remove_online(vcoreid);
            core::sync::atomic::fence(Ordering::Acquire);
            if vcpd.notif_pending.load(Ordering::Acquire) {
                locked.lists.reinsert_online_front(vcoreid);
                return Ok(YieldOutcome::AbortedNotifPending);
            }

            // Step 7.
            locked.lists.inactive.push_front(vcoreid);
            {
                let _w = proc.maps.seqctr.write_begin();
                vcpd.notif_disabled.store(false, Ordering::Release);
                proc.maps.unmap(vcoreid);
                proc.maps.dec_num_vcores(1);
                locked.resources.amt_granted -= 1;
                if !being_nice {
                    locked.resources.amt_wanted = proc.num_vcores();
                }
            }

            // Step 8.
            let now_empty = proc.num_vcores() == 0;
            if now_empty {
                locked.resources.amt_wanted = 1;
                locked.state.set(ProcState::Waiting);
            }
            drop(locked);
            if now_empty {
                scheduler.on_process_waiting(proc.pid);
            }
            finish_yield(pcpu, scheduler, pcoreid);
            Ok(YieldOutcome::Yielded)
        }
        other => {
            log::warn!("yield: {} called from non-running state {}", proc.pid, other);
            Err(ProcError::BadState)
        }
    }
}

/// `switch_to_m(P)`: the one-time `RUNNING_S -> RUNNABLE_M` transition.
/// Saves the caller's current frame and FP state into vcore 0's VCPD,
/// unmaps vcore 0, and latches `is_mcp`.
pub fn switch_to_m<F, A>(proc: &ProcRef<Process<F, A>>, pcpu: &mut PerCpuInfo<F, A>, saved_fp: A) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    if locked.state != ProcState::RunningS {
        return Err(ProcError::BadState);
    }
    let vcpd = &proc.procdata.vcore_preempt_data[0];
    if let Some(frame) = pcpu.cur_tf.take() {
        vcpd.set_notif_tf(frame);
    }
    vcpd.set_preempt_anc(saved_fp);

    proc.maps.unmap(0);
    {
        let _w = proc.maps.seqctr.write_begin();
        proc.maps.dec_num_vcores(1);
    }
    locked.lists.move_online_to_inactive(0);
    locked.state.set(ProcState::RunnableM);
    drop(locked);
    proc.mark_mcp();
    Ok(())
}

/// `change_to_vcore(P, new_v, enable_my_notif)`: callable only from
/// vcore context of an online vcore of a `RUNNING_M` process (spec
/// §4.11). `saved_fp`, if provided, is stashed in the caller's VCPD
/// alongside its frame when `enable_my_notif` is false; capturing
/// actual FP register state is an architecture concern this crate does
/// not model.
pub fn change_to_vcore<F, A>(
    proc: &ProcRef<Process<F, A>>,
    pcpu: &mut PerCpuInfo<F, A>,
    new_v: VcoreId,
    enable_my_notif: bool,
    saved_fp: Option<A>,
) -> Result<()>
where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    if locked.state != ProcState::RunningM {
        return Err(ProcError::BadState);
    }
    let caller_v = pcpu.cur_vcoreid().ok_or(ProcError::BadState)?;
    if locked.lists.online.contains(&new_v) {
        return Err(ProcError::InvalidArgs);
    }
    let this_pcore = proc.maps.vcore(caller_v).pcoreid().ok_or(ProcError::NotMapped)?;

    let caller_vcpd = &proc.procdata.vcore_preempt_data[caller_v as usize];
    if !caller_vcpd.notif_disabled.load(Ordering::Acquire) {
        return Err(ProcError::BadState);
    }
    if proc.maps.vcore(caller_v).preempt_served.load(Ordering::Acquire) {
        return Err(ProcError::BadState);
    }

    if enable_my_notif {
        caller_vcpd.notif_disabled.store(false, Ordering::Release);
    } else {
        if let Some(cur) = pcpu.cur_tf.take() {
            caller_vcpd.set_preempt_tf(cur);
        }
        if let Some(fp) = saved_fp {
            caller_vcpd.set_preempt_anc(fp);
        }
        caller_vcpd.flags.set(VcpdFlags::VC_PREEMPTED);
    }

    locked.lists.move_online_to_inactive(caller_v);
    locked.lists.move_inactive_to_online(new_v);
    proc.maps.unmap(caller_v);
    proc.maps.map(new_v, this_pcore);

    if enable_my_notif {
        proc.procdata.events.post(UserEvent::CheckMsgs(new_v));
    } else {
        proc.procdata.events.post(UserEvent::VcorePreempt(caller_v));
    }
    drop(locked);

    crate::kmsg::install_vcore_frame(proc, new_v, pcpu);
    pcpu.set_cur_vcoreid(new_v);
    Ok(())
}
