// Copyright 2025 The Polycore Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Compile-time tunables.
//!
//! These mirror the `#define`-style constants of the original research
//! kernel this core is modeled on, but as `pub const`s so a host kernel
//! can reference them without a build-time code generation step.

/// Highest legal process id. Pid 0 is reserved and never allocated.
pub const PID_MAX: u32 = 32_767;

/// Maximum vcores (and therefore online pcores) a single process may hold.
pub const MAX_VCORES: usize = 64;

/// Maximum physical cores the system can expose to processes.
pub const MAX_PCORES: usize = 256;

/// Byte budget for the packed argv buffer mapped into `ProcInfo`.
pub const MAX_ARGV_BYTES: usize = 3_200;

/// Byte budget for the packed envp buffer mapped into `ProcInfo`.
pub const MAX_ENVP_BYTES: usize = 3_200;

/// Depth of the single-producer/single-consumer system event ring in
/// `ProcData`.
pub const EVENT_RING_SIZE: usize = 16;
