// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks and the task table.
//!
//! A task is a *cooperative step function*: each invocation runs to
//! completion and returns a status code, and nothing else happens on that
//! core in between. Task state lives in the task value itself, owned by the
//! application and merely borrowed by the kernel -- the table never heap-owns
//! anything.
//!
//! The mutable per-task attributes are split out into [`TaskAttrs`], a block
//! of release/acquire atomics read by the schedulers on both cores and
//! written (after INIT) only by the task-manager task, with two narrow
//! exceptions: the postman and the task-manager put *themselves* to sleep
//! directly at the end of a run, because routing that request through the
//! normal pipeline would wake them right back up.

use core::ptr::NonNull;
use core::sync::atomic::{
    AtomicBool, AtomicI8, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

use arrayvec::ArrayString;
use tandem_abi::{
    Priority, State, MAX_MESSAGES, MAX_TASK_NAME_LENGTH, SYSTEM_TASK_PREFIX,
};

use crate::api::TaskContext;
use crate::ring::MsgRing;

/// A task body. `step` is called by the scheduler with a fresh context each
/// invocation; it must return promptly. 0 means success; any other value
/// stops the whole system.
///
/// `Send` is required because the two schedulers hand tasks back and forth
/// between cores (never concurrently -- see the collision rule in the
/// scheduler).
pub trait Task: Send {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8;
}

/// Plain functions and closures work as tasks directly.
impl<F> Task for F
where
    F: FnMut(&mut TaskContext<'_, '_>) -> u8 + Send,
{
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        self(ctx)
    }
}

/// `running_on_core` value meaning "not currently on any core".
pub(crate) const NOT_RUNNING: i8 = -1;

/// The mutable attribute block of one task.
///
/// Readers (the schedulers, helper predicates) use acquire loads; the writer
/// uses release stores. A scheduler may observe a one-iteration-stale
/// `sleeping`; the worst case is one extra skip or one extra entry, both
/// self-correcting, and this is deliberately tolerated.
#[derive(Debug)]
pub(crate) struct TaskAttrs {
    state: AtomicU8,
    priority: AtomicU32,
    sleeping: AtomicBool,
    wake_at: AtomicU64,
    debug: AtomicU8,
    running_on_core: AtomicI8,
}

impl TaskAttrs {
    pub(crate) fn new(priority: Priority) -> Self {
        Self {
            state: AtomicU8::new(State::INIT.0),
            priority: AtomicU32::new(priority.0),
            sleeping: AtomicBool::new(false),
            wake_at: AtomicU64::new(0),
            debug: AtomicU8::new(tandem_abi::DEBUG_NONE),
            running_on_core: AtomicI8::new(NOT_RUNNING),
        }
    }

    pub(crate) fn state(&self) -> State {
        State(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state.0, Ordering::Release);
    }

    pub(crate) fn priority(&self) -> Priority {
        Priority(self.priority.load(Ordering::Acquire))
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.store(priority.0, Ordering::Release);
    }

    pub(crate) fn sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    pub(crate) fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
    }

    pub(crate) fn wake_at(&self) -> u64 {
        self.wake_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_wake_at(&self, at: u64) {
        self.wake_at.store(at, Ordering::Release);
    }

    pub(crate) fn debug(&self) -> u8 {
        self.debug.load(Ordering::Acquire)
    }

    pub(crate) fn set_debug(&self, level: u8) {
        self.debug.store(level, Ordering::Release);
    }

    pub(crate) fn running_on_core(&self) -> i8 {
        self.running_on_core.load(Ordering::Acquire)
    }

    pub(crate) fn set_running_on_core(&self, core: i8) {
        self.running_on_core.store(core, Ordering::Release);
    }
}

/// One slot of the task table. `name` and `entry` are immutable once the
/// kernel is shared; `inbound` is the task's mailbox; `attrs` is the shared
/// block above.
pub(crate) struct TaskSlot<'k> {
    pub(crate) name: ArrayString<MAX_TASK_NAME_LENGTH>,
    pub(crate) entry: Option<NonNull<dyn Task + 'k>>,
    pub(crate) attrs: TaskAttrs,
    pub(crate) inbound: MsgRing<MAX_MESSAGES>,
}

impl<'k> TaskSlot<'k> {
    pub(crate) fn vacant() -> Self {
        Self {
            name: ArrayString::new(),
            entry: None,
            attrs: TaskAttrs::new(Priority::NORMAL),
            inbound: MsgRing::new(),
        }
    }
}

/// Whether `name` denotes a system task: one carrying the reserved prefix,
/// which gets elevated authorization over its own attributes.
pub fn is_system_name(name: &str) -> bool {
    name.starts_with(SYSTEM_TASK_PREFIX)
}

/// Clips a task name to the table's field width. The original quietly
/// truncated with `strncpy`; so do we, on a character boundary.
pub(crate) fn clip_name(name: &str) -> ArrayString<MAX_TASK_NAME_LENGTH> {
    let mut out = ArrayString::new();
    for ch in name.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_names_need_the_prefix() {
        assert!(is_system_name("tandem.postman"));
        assert!(!is_system_name("postman"));
        assert!(!is_system_name("tandem"));
        assert!(!is_system_name("Tandem.postman"));
    }

    #[test]
    fn long_names_are_clipped() {
        let long = "x".repeat(MAX_TASK_NAME_LENGTH + 10);
        let clipped = clip_name(&long);
        assert_eq!(clipped.len(), MAX_TASK_NAME_LENGTH);
        assert_eq!(clip_name("short").as_str(), "short");
    }
}
