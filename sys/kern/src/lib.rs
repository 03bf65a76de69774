// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! tandem kernel.
//!
//! This is a minimal cooperative (non-preemptive) multitasking kernel for a
//! dual-core microcontroller. An application is a fixed set of *tasks*, each
//! a short reentrant step function; a *scheduler* instance per core invokes
//! them according to priority interval, wake-up deadline, and an explicit
//! sleep flag. Tasks communicate exclusively through single-producer/
//! single-consumer message rings; they never block, never hold locks across
//! invocations, and never call into one another directly.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic ideas
//! that appear consistently.
//!
//! 1. Static configuration. The task table is fixed once the schedulers
//!    start; every container is capacity-bounded, and there is no heap.
//! 2. Single-writer state. Task attributes are mutated only by the
//!    task-manager task (with two narrow, documented exceptions); everything
//!    cross-core is either an SPSC ring or a release/acquire atomic.
//! 3. A strong preference for safe code where reasonable; the few `unsafe`
//!    blocks carry the invariant that justifies them.
//! 4. Portability through one seam. All hardware access goes through the
//!    [`platform::Platform`] trait, so the whole kernel runs -- and is tested
//!    -- on a host simulator.

#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod api;

pub mod eventlog;
pub mod irq;
pub mod platform;
pub mod pool;
pub mod postman;
pub mod ring;
pub mod sched;
pub mod startup;
pub mod swtimer;
pub mod task;
pub mod taskmgr;
pub mod watchdog;

pub use api::TaskContext;
pub use platform::{GpioDir, GpioPull, Platform, Severity};
pub use sched::Scheduler;
pub use startup::{Kernel, KernelConfig, SystemTasks};
pub use task::Task;
