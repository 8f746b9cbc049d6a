// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Synchronization primitives used by the process/vcore core.

pub mod seqlock;
pub mod spin;

pub use seqlock::SeqCtr;
pub use spin::{SpinMutex, SpinMutexGuard};
