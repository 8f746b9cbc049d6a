// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Process registry (C2): the global pid-to-process table.
//!
//! `hashbrown::HashMap` behind a [`SpinMutex`], the same shape as the
//! `HashMap`-behind-a-lock globals used for other fixed-capacity
//! registries in this corpus. `lookup` clones the stored handle via
//! [`ProcRef::upgrade_if_live`] rather than a bare `clone`, so a caller
//! racing `remove` against an in-progress `destroy` never resurrects a
//! handle whose count has already reached zero.

use hashbrown::HashMap;

use crate::pid::ProcessId;
use crate::refcount::ProcRef;
use crate::status::{ProcError, Result};
use crate::sync::SpinMutex;

/// The live pid -> process table.
pub struct ProcessRegistry<T> {
    inner: SpinMutex<HashMap<ProcessId, ProcRef<T>>>,
}

impl<T> ProcessRegistry<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            inner: SpinMutex::new(HashMap::new()),
        }
    }

    /// Register `proc` under `pid`. Errs if `pid` is already present —
    /// pids are allocated by [`crate::pid::PidAllocator`] before this is
    /// called, so a collision means a caller reused a still-live pid.
    pub fn insert(&self, pid: ProcessId, proc: ProcRef<T>) -> Result<()> {
        let mut map = self.inner.lock();
        if map.contains_key(&pid) {
            log::error!("registry: pid {} already registered", pid);
            return Err(ProcError::AlreadyExists);
        }
        map.insert(pid, proc);
        log::debug!("registry: {} registered", pid);
        Ok(())
    }

    /// Look up `pid`, handing back a fresh strong handle if the process
    /// is still live.
    pub fn lookup(&self, pid: ProcessId) -> Option<ProcRef<T>> {
        let map = self.inner.lock();
        map.get(&pid).and_then(ProcRef::upgrade_if_live)
    }

    /// Remove `pid` from the table, releasing the registry's own unit
    /// of its refcount. Returns `true` if `pid` was present.
    pub fn remove(&self, pid: ProcessId) -> bool {
        let mut map = self.inner.lock();
        match map.remove(&pid) {
            Some(proc) => {
                proc.release_existence();
                log::debug!("registry: {} unregistered", pid);
                true
            }
            None => {
                log::warn!("registry: remove({}) on absent pid", pid);
                false
            }
        }
    }

    /// Number of currently registered processes.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the registry currently holds no processes.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<T> Default for ProcessRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_round_trips() {
        let reg = ProcessRegistry::new();
        reg.insert(1, ProcRef::new(100u32)).unwrap();
        let found = reg.lookup(1).unwrap();
        assert_eq!(*found, 100);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let reg = ProcessRegistry::new();
        reg.insert(1, ProcRef::new(1u32)).unwrap();
        assert_eq!(reg.insert(1, ProcRef::new(2u32)), Err(ProcError::AlreadyExists));
    }

    #[test]
    fn lookup_after_remove_finds_nothing() {
        let reg = ProcessRegistry::new();
        reg.insert(7, ProcRef::new(1u32)).unwrap();
        assert!(reg.remove(7));
        assert!(reg.lookup(7).is_none());
    }

    #[test]
    fn handle_outlives_removal_from_registry() {
        let reg = ProcessRegistry::new();
        let r = ProcRef::new(42u32);
        reg.insert(3, r.clone()).unwrap();
        reg.remove(3);
        // The caller's own handle keeps the value alive even though
        // the registry's unit was released.
        assert_eq!(*r, 42);
        assert!(reg.lookup(3).is_none());
    }
}
