// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reference counting (C3).
//!
//! `ProcRef<T>` is a hand-rolled strong-only smart pointer, not
//! `alloc::sync::Arc`. The two differ in one load-bearing way: a fresh
//! `ProcRef` starts at count 2, not 1 — one unit for the handle
//! returned to the creator, one for the registry slot that will hold a
//! clone of it once the process is registered. Those two units must be
//! releasable independently (dropping the creator's handle must not
//! tear the process down while it is still registered, and vice
//! versa), which `Arc::new`'s single implicit unit doesn't model.
//! Registry lookups additionally need `upgrade_if_live`, a ref-up only
//! if the count has not already reached zero, since a lookup can race
//! a concurrent teardown that has decremented the count but not yet
//! removed the map entry.

use alloc::boxed::Box;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

struct RefBox<T> {
    count: AtomicUsize,
    value: T,
}

/// A strong, shareable handle to a `T`, freed when its count reaches
/// zero.
pub struct ProcRef<T> {
    ptr: NonNull<RefBox<T>>,
}

unsafe impl<T: Sync + Send> Send for ProcRef<T> {}
unsafe impl<T: Sync + Send> Sync for ProcRef<T> {}

impl<T> ProcRef<T> {
    /// Allocate `value` with an initial count of 2 (spec §4.3): one for
    /// the returned handle, one for the caller to hand to the registry.
    pub fn new(value: T) -> Self {
        let boxed = Box::new(RefBox {
            count: AtomicUsize::new(2),
            value,
        });
        let ptr = NonNull::new(Box::into_raw(boxed)).expect("Box::into_raw is never null");
        Self { ptr }
    }

    fn inner(&self) -> &RefBox<T> {
        // Safety: `ptr` is only ever freed once `count` hits zero, and
        // we hold a live unit of that count for the lifetime of `self`.
        unsafe { self.ptr.as_ref() }
    }

    /// Current count, for diagnostics/tests only — never branch kernel
    /// logic on a racily-read count other than via `upgrade_if_live` or
    /// `release_existence`.
    pub fn refcount(&self) -> usize {
        self.inner().count.load(Ordering::Acquire)
    }

    /// Release the registry's existence unit without consuming this
    /// handle. Called by `destroy` once a process is unregistered.
    pub fn release_existence(&self) {
        self.decref();
    }

    /// Ref-up-if-nonzero: returns a new handle sharing `self`'s
    /// allocation, or `None` if the count has already reached zero
    /// (the process is mid-teardown and must not be resurrected).
    pub fn upgrade_if_live(&self) -> Option<ProcRef<T>> {
        let mut cur = self.inner().count.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return None;
            }
            match self.inner().count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ProcRef { ptr: self.ptr }),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Manually bump the refcount without producing a new handle that
    /// would independently decref on drop. Pairs with
    /// [`Self::manual_decref`]; models the "+2 per granted pcore"
    /// convention (spec §4.6), where the sender pre-pays two units per
    /// message it emits but only one of them is ever materialized as a
    /// `ProcRef` in the message payload — the other is claimed (or
    /// dropped) by the receiving handler's own bookkeeping.
    pub fn manual_incref(&self) {
        self.inner().count.fetch_add(1, Ordering::Relaxed);
    }

    /// Manually release a unit bumped via [`Self::manual_incref`], or
    /// any other unit this handle's owner is accounting for outside of
    /// a `ProcRef` value.
    pub fn manual_decref(&self) {
        self.decref();
    }

    /// Produce a new handle aliasing `self`'s allocation without
    /// incrementing the count.
    ///
    /// # Safety
    /// The caller must already own a spare unit of refcount (typically
    /// from a prior [`Self::manual_incref`]) that this handle's
    /// eventual `Drop` will consume; otherwise the count underflows.
    pub unsafe fn clone_consuming_manual_unit(&self) -> ProcRef<T> {
        ProcRef { ptr: self.ptr }
    }

    /// Consume this handle into a raw integer suitable for the
    /// kernel-message ABI's `a0` argument (spec §6): the unit of
    /// refcount `self` represented is not released, only transferred to
    /// whoever reconstructs it via [`Self::from_raw`].
    pub fn into_raw(self) -> usize {
        let addr = self.ptr.as_ptr() as usize;
        core::mem::forget(self);
        addr
    }

    /// Reconstruct a handle previously consumed by [`Self::into_raw`].
    ///
    /// # Safety
    /// `raw` must have come from `into_raw` on a `ProcRef<T>` pointing
    /// at this same `T`, and must not have already been reconstructed
    /// (each raw value may be redeemed exactly once).
    pub unsafe fn from_raw(raw: usize) -> Self {
        let ptr = NonNull::new(raw as *mut RefBox<T>).expect("from_raw: null pointer");
        Self { ptr }
    }

    fn decref(&self) {
        if self.inner().count.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Safety: we just observed the last unit disappear; no
            // other handle can exist, so it is safe to reclaim.
            unsafe {
                core::sync::atomic::fence(Ordering::Acquire);
                drop(Box::from_raw(self.ptr.as_ptr()));
            }
        }
    }
}

impl<T> Clone for ProcRef<T> {
    fn clone(&self) -> Self {
        let prev = self.inner().count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "cloned a ProcRef whose count had already reached zero");
        Self { ptr: self.ptr }
    }
}

impl<T> Drop for ProcRef<T> {
    fn drop(&mut self) {
        self.decref();
    }
}

impl<T> Deref for ProcRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for ProcRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcRef")
            .field("count", &self.refcount())
            .field("value", &self.inner().value)
            .finish()
    }
}
