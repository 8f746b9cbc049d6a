// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-core kernel-message handlers (C7).
//!
//! All five run with interrupts disabled on the target pcore, in
//! priority class `Immediate`. The first four carry a passed
//! reference: the sender has already bumped the process's refcount
//! once per message it emits, and every handler below either installs
//! that unit into per-pcore state or drops it — never both, never
//! neither.

use core::sync::atomic::Ordering;

use crate::collab::{AncillaryState, HandlerId, MessageTransport, MsgPriority, TrapFrame};
use crate::pcpu::{PerCpuInfo, QueuedMessage};
use crate::process::Process;
use crate::refcount::ProcRef;
use crate::vcore::PcoreId;
use crate::vcpd::VcpdFlags;

/// A resolved kernel message ready for local dispatch. `a0`'s raw
/// process handle (spec §6) is represented directly as a [`ProcRef`]
/// rather than a pointer plus a manual refcount bump.
pub enum KernelMessage<F: TrapFrame, A: AncillaryState> {
    StartCore(ProcRef<Process<F, A>>),
    Notify(ProcRef<Process<F, A>>),
    Preempt(ProcRef<Process<F, A>>),
    Death(ProcRef<Process<F, A>>),
    TlbShootdown { start: usize, end: usize },
}

/// Send `proc` to `dst_pcore` as a kernel message. Consumes `proc`:
/// the unit of refcount it represents is transferred into the wire
/// encoding (spec §6 — "the sender is responsible for having bumped
/// the refcount"), not released here.
pub fn send<F, A>(
    transport: &dyn MessageTransport,
    dst_pcore: PcoreId,
    handler: HandlerId,
    proc: ProcRef<Process<F, A>>,
    priority: MsgPriority,
) where
    F: TrapFrame,
    A: AncillaryState,
{
    let a0 = proc.into_raw() as u64;
    transport.send(dst_pcore, handler, a0, 0, 0, priority);
}

/// Reconstruct a [`KernelMessage`] from a [`QueuedMessage`] popped off a
/// pcore's local queue.
///
/// # Safety
/// For the four process-carrying handlers, `msg.a0` must have come from
/// [`send`] (or otherwise hold a live, not-yet-redeemed unit of
/// refcount for a `Process<F, A>`).
pub unsafe fn from_queued<F, A>(msg: QueuedMessage) -> KernelMessage<F, A>
where
    F: TrapFrame,
    A: AncillaryState,
{
    match msg.handler {
        HandlerId::StartCore => KernelMessage::StartCore(ProcRef::from_raw(msg.a0 as usize)),
        HandlerId::Notify => KernelMessage::Notify(ProcRef::from_raw(msg.a0 as usize)),
        HandlerId::Preempt => KernelMessage::Preempt(ProcRef::from_raw(msg.a0 as usize)),
        HandlerId::Death => KernelMessage::Death(ProcRef::from_raw(msg.a0 as usize)),
        HandlerId::TlbShootdown => KernelMessage::TlbShootdown {
            start: msg.a0 as usize,
            end: msg.a1 as usize,
        },
    }
}

/// Dispatch `msg` as the target pcore's local handler. `core_id` is
/// this pcore's own id, needed to resolve `get_vcoreid`.
pub fn dispatch<F, A>(msg: KernelMessage<F, A>, pcpu: &mut PerCpuInfo<F, A>, core_id: PcoreId)
where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    match msg {
        KernelMessage::StartCore(p) => handle_start_core(p, pcpu, core_id),
        KernelMessage::Notify(p) => handle_notify(p, pcpu),
        KernelMessage::Preempt(p) => handle_preempt(p, pcpu),
        KernelMessage::Death(p) => handle_death(p, pcpu),
        KernelMessage::TlbShootdown { start, end } => handle_tlb_shootdown(pcpu, start, end),
    }
}

/// `__startcore`.
fn handle_start_core<F, A>(
    p: ProcRef<Process<F, A>>,
    pcpu: &mut PerCpuInfo<F, A>,
    core_id: PcoreId,
) where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    assert!(pcpu.owning_proc().is_none(), "__startcore: pcore already owned");

    let vcoreid = p
        .maps
        .get_vcoreid_unchecked(core_id)
        .expect("__startcore: pcore not mapped to any vcore");

    // The sender pre-paid two units: one materialized as `p` itself
    // (becomes `owning_proc`), one left as a bare count bump that this
    // handle aliases without a further incref (becomes `cur_proc`, or
    // is dropped if someone else's address space is already in).
    let cur_candidate = unsafe { p.clone_consuming_manual_unit() };
    install_vcore_frame(&p, vcoreid, pcpu);

    match pcpu.install_cur_proc(cur_candidate) {
        Ok(()) => {
            if let Some(asp) = p.address_space.lock().as_deref() {
                asp.activate();
            }
        }
        Err(extra) => {
            log::debug!("__startcore: address space already installed for {}", extra.pid);
            drop(extra);
        }
    }
    pcpu.set_owner(p, vcoreid);
}

/// Installs the frame a vcore should resume on: a restored, sanitized
/// `preempt_tf`/`preempt_anc` pair if it was previously preempted
/// (`notif_disabled` still set from that preemption), else a fresh
/// frame at `entry_point` on its transition stack.
pub(crate) fn install_vcore_frame<F, A>(p: &Process<F, A>, vcoreid: u32, pcpu: &mut PerCpuInfo<F, A>)
where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    let vcpd = &p.procdata.vcore_preempt_data[vcoreid as usize];
    if vcpd.notif_disabled.load(Ordering::Acquire) {
        vcpd.preempt_anc().restore();
        let mut frame = vcpd.preempt_tf();
        frame.sanitize();
        pcpu.actual_tf = Some(frame);
    } else {
        let stack_top = vcpd.transition_stack.load(Ordering::Acquire);
        let mut frame = F::fresh(p.entry_point, stack_top);
        frame.sanitize();
        pcpu.actual_tf = Some(frame);
        vcpd.notif_disabled.store(true, Ordering::Release);
    }
    pcpu.cur_tf = pcpu.actual_tf.clone();
    vcpd.flags.set(VcpdFlags::VC_CAN_RCV_MSG);
    vcpd.flags.clear(VcpdFlags::VC_PREEMPTED);
}

/// `__notify`.
fn handle_notify<F, A>(p: ProcRef<Process<F, A>>, pcpu: &mut PerCpuInfo<F, A>)
where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    if pcpu.owning_proc() != Some(p.pid) {
        log::debug!("__notify: dropped, {} no longer owns this pcore", p.pid);
        return;
    }
    let Some(vcoreid) = pcpu.cur_vcoreid() else {
        return;
    };
    let vcpd = &p.procdata.vcore_preempt_data[vcoreid as usize];
    if vcpd.notif_disabled.load(Ordering::Acquire) {
        log::debug!("__notify: masked, vcore {} has notifs disabled", vcoreid);
        return;
    }
    vcpd.notif_disabled.store(true, Ordering::Release);
    vcpd.notif_pending.store(false, Ordering::Release);
    if let Some(cur) = pcpu.cur_tf.take() {
        vcpd.set_notif_tf(cur);
    }
    let stack_top = vcpd.transition_stack.load(Ordering::Acquire);
    let mut frame = F::fresh(p.entry_point, stack_top);
    frame.sanitize();
    pcpu.cur_tf = Some(frame);
    // This message's unit of refcount was only ever needed to look up
    // `p`; it does not install anything new, so it is released here.
    drop(p);
}

/// `__preempt`.
fn handle_preempt<F, A>(p: ProcRef<Process<F, A>>, pcpu: &mut PerCpuInfo<F, A>)
where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    assert_eq!(pcpu.owning_proc(), Some(p.pid), "__preempt: not the owning process");
    let vcoreid = pcpu.cur_vcoreid().expect("__preempt: no vcore mapped");
    // `take_corelist` (the sender) set `preempt_served` before this
    // message went out, so a racing `yield` would abort; either this
    // handler or a `yield` ends the preempt phase, so clear it here.
    p.maps.vcore(vcoreid).preempt_served.store(false, Ordering::Release);
    p.maps.vcore(vcoreid).preempt_pending.store(0, Ordering::Release);

    let vcpd = &p.procdata.vcore_preempt_data[vcoreid as usize];
    let disabled = vcpd.notif_disabled.load(Ordering::Acquire);
    if let Some(cur) = pcpu.cur_tf.take() {
        if disabled {
            vcpd.set_preempt_tf(cur);
        } else {
            vcpd.set_notif_tf(cur);
        }
    }
    vcpd.set_preempt_anc(A::save());

    vcpd.flags.set(VcpdFlags::VC_PREEMPTED);
    vcpd.flags.clear(VcpdFlags::VC_K_LOCK);
    core::sync::atomic::fence(Ordering::Release);

    p.maps.unmap(vcoreid);
    let owner = pcpu.clear_owner();
    debug_assert!(owner.is_some());
    drop(owner);
    drop(p);
}

/// `__death`.
fn handle_death<F, A>(p: ProcRef<Process<F, A>>, pcpu: &mut PerCpuInfo<F, A>)
where
    F: TrapFrame + Default,
    A: AncillaryState,
{
    if pcpu.owning_proc() != Some(p.pid) {
        drop(p);
        return;
    }
    if let Some(vcoreid) = pcpu.cur_vcoreid() {
        p.maps.unmap(vcoreid);
    }
    let owner = pcpu.clear_owner();
    drop(owner);
    drop(p);
}

/// `__tlbshootdown`.
fn handle_tlb_shootdown<F, A>(_pcpu: &mut PerCpuInfo<F, A>, start: usize, end: usize)
where
    F: TrapFrame,
    A: AncillaryState,
{
    log::trace!("tlb shootdown [{:#x}, {:#x})", start, end);
}
