// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process lifecycle orchestration (C4/C6): creation, readying, and
//! destruction.
//!
//! `alloc` and `ready` are thin — a pid plus a registry insert, then a
//! single legal state transition — but `destroy` (spec §4.9) has to
//! dispatch on all six states, since "kill this process" means
//! something different depending on how many pcores it currently owns
//! and whether any of them are actually executing its code right now.

use alloc::vec::Vec;

use crate::collab::{AncillaryState, HandlerId, MessageTransport, MsgPriority, Scheduler, TrapFrame};
use crate::grant::take_allcores;
use crate::kmsg;
use crate::pid::ProcessId;
use crate::process::Process;
use crate::refcount::ProcRef;
use crate::registry::ProcessRegistry;
use crate::state::ProcState;
use crate::status::Result;
use crate::vcore::{PcoreId, VcoreId};

/// `proc_alloc`: reserve a pid, build a fresh `CREATED` process, and
/// register it. The registry's unit of refcount is carved out of the
/// `+2` [`ProcRef::new`] pre-pays rather than produced by an ordinary
/// `clone`, so the two units remain independently releasable (spec
/// §4.3) — the caller's returned handle and the registry's stay alive
/// or die on their own schedules.
pub fn alloc<F, A>(
    ppid: ProcessId,
    tsc_freq: u64,
    heap_bottom: usize,
    entry_point: u64,
    registry: &ProcessRegistry<Process<F, A>>,
) -> Result<ProcRef<Process<F, A>>>
where
    F: TrapFrame + Default,
    A: AncillaryState + Default,
{
    let pid = crate::pid::global().allocate()?;
    let proc = ProcRef::new(Process::new(pid, ppid, tsc_freq, heap_bottom, entry_point));
    let registry_unit = unsafe { proc.clone_consuming_manual_unit() };
    registry.insert(pid, registry_unit)?;
    Ok(proc)
}

/// `__proc_ready`: `CREATED -> RUNNABLE_S` and hand the process to the
/// single-core scheduler. Every process is born single-core; the
/// eventual move to many-core happens later via `switch_to_m`.
pub fn ready<F, A>(proc: &ProcRef<Process<F, A>>, scheduler: &dyn Scheduler) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    if locked.state != ProcState::Created {
        return Err(crate::status::ProcError::BadState);
    }
    locked.state.set(ProcState::RunnableS);
    drop(locked);
    scheduler.schedule_scp(proc.pid);
    Ok(())
}

/// `proc_destroy`: tear down `proc` regardless of its current state
/// (spec §4.9). Idempotent — a process already `DYING` is left alone.
/// Revoking any pcores the process still owns happens before the
/// state flips to `DYING`, since `take_corelist`/`take_allcores` decide
/// whether to message a remote pcore or unmap locally based on the
/// state at the moment they're called.
pub fn destroy<F, A>(
    proc: &ProcRef<Process<F, A>>,
    registry: &ProcessRegistry<Process<F, A>>,
    scheduler: &dyn Scheduler,
    transport: &dyn MessageTransport,
) -> Result<()>
where
    F: TrapFrame,
    A: AncillaryState,
{
    let mut locked = proc.locked.lock();
    match locked.state {
        ProcState::Dying => {
            log::debug!("destroy: {} already dying", proc.pid);
            return Ok(());
        }
        ProcState::Created | ProcState::RunnableS | ProcState::Waiting => {
            locked.state.set(ProcState::Dying);
            drop(locked);
        }
        ProcState::RunnableM => {
            // Cores granted to a RUNNABLE_M process are mapped but idle
            // (no `__startcore` has gone out for them yet), so they can
            // be reclaimed directly instead of messaged. Each revoked
            // vcore still needs a home in the partition (spec §3
            // invariant 2), so it lands in `inactive_vcs` exactly as
            // `take_allcores(preempt=false)` would leave it.
            let online: Vec<VcoreId> = locked.lists.online.drain(..).collect();
            let pcores: Vec<PcoreId> = online.iter().filter_map(|&v| proc.maps.vcore(v).pcoreid()).collect();
            if !online.is_empty() {
                let _w = proc.maps.seqctr.write_begin();
                proc.maps.dec_num_vcores(online.len() as u32);
            }
            for &v in &online {
                locked.lists.inactive.push_back(v);
            }
            locked.resources.amt_granted = 0;
            locked.state.set(ProcState::Dying);
            drop(locked);
            for &v in &online {
                proc.maps.unmap(v);
            }
            for pcoreid in pcores {
                scheduler.put_idle_core(pcoreid);
            }
        }
        ProcState::RunningS => {
            let pcoreid = proc.maps.vcore(0).pcoreid();
            drop(locked);
            if let Some(pcoreid) = pcoreid {
                kmsg::send(transport, pcoreid, HandlerId::Death, proc.clone(), MsgPriority::Immediate);
            }
            proc.locked.lock().state.set(ProcState::Dying);
        }
        ProcState::RunningM => {
            drop(locked);
            take_allcores(proc, false, transport)?;
            proc.locked.lock().state.set(ProcState::Dying);
        }
    }
    registry.remove(proc.pid);
    Ok(())
}
