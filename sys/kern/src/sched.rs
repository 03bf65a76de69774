// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-core scheduler.
//!
//! Each core runs one `Scheduler` over the shared task table. Core 0 is the
//! bootstrap core: it alone executes the INIT and STOP phases while the
//! other core polls for the state change. During RUN both cores sweep the
//! table -- even cores ascending, odd cores descending -- at a rotating
//! priority threshold (HIGH → NORMAL → LOW), so HIGH tasks are eligible on
//! every sweep and LOW tasks on every third.
//!
//! # The collision rule
//!
//! The one thing the two cores must never do is enter the same task at the
//! same time. Each core publishes its current candidate in a shared
//! run-pointer atom and then checks the other core's, both with `SeqCst` --
//! the Dekker-style store-then-check means at least one core observes the
//! conflict when both pick the same id. The loser parks its pointer on the
//! sentinel and busy-waits a staggered, growing interval (the stagger
//! breaks ties); after a bounded number of rounds it gives the slot up for
//! this sweep rather than spinning forever. The sentinel is never a valid
//! task id, so a parked core can't trigger anyone else's collision check.
//!
//! Inline service runs (postman, task-manager, IRQ handler) go through the
//! same gate under the service's own id, then restore the pointer, so the
//! exclusion covers them too.

use core::sync::atomic::Ordering;

use tandem_abi::{Priority, State, TaskId, DEBUG_NONE, MAX_CORES};

use crate::api::TaskContext;
use crate::platform::Severity;
use crate::startup::Kernel;
use crate::task::NOT_RUNNING;

pub(crate) const NAME: &str = "tandem.sched";

/// Run-pointer sentinel: "this core has no candidate". Never a valid task
/// id (the table tops out far below it).
pub(crate) const NO_TASK: u8 = 0xFF;

/// Collision back-off: base wait plus a per-core stagger so the two cores
/// never retry in lockstep, growing linearly per round.
const COLLISION_BASE_WAIT_US: u64 = 5;
const COLLISION_CORE_STAGGER_US: u64 = 2;

/// Rounds of back-off before the core gives the contended slot up for this
/// sweep. Bounded so a long-running task on one core can't starve the
/// other core's whole sweep.
const COLLISION_RETRY_LIMIT: u32 = 32;

/// How long the non-bootstrap core sleeps between INIT/STOP polls.
const PHASE_POLL_MS: u32 = 500;

pub struct Scheduler<'r, 'k> {
    kernel: &'r Kernel<'k>,
    core: u8,
    cycle: Priority,
}

impl<'r, 'k> Scheduler<'r, 'k> {
    pub fn new(kernel: &'r Kernel<'k>, core: u8) -> Self {
        debug_assert!(usize::from(core) < MAX_CORES);
        Self {
            kernel,
            core,
            cycle: Priority::HIGH,
        }
    }

    /// Runs the scheduler until the system reaches DOWN. This is the entry
    /// point an application calls on each core; the phase methods below are
    /// public building blocks for host harnesses that need to interleave
    /// sweeps with simulated time.
    pub fn run(&mut self) {
        if self.is_bootstrap() {
            self.kernel
                .platform()
                .sleep_ms(self.kernel.config().startup_delay_ms);
        }
        loop {
            match self.kernel.sys_state() {
                State::INIT => {
                    if self.is_bootstrap() {
                        self.init_phase();
                    } else {
                        self.kernel.platform().sleep_ms(PHASE_POLL_MS);
                    }
                }
                State::RUN => self.run_phase(),
                State::STOP => {
                    if self.is_bootstrap() {
                        self.stop_phase();
                    } else {
                        self.park_pointer();
                        self.kernel.platform().sleep_ms(PHASE_POLL_MS);
                    }
                }
                _ => break,
            }
        }
        self.kernel.sink_line(
            Severity::Notify,
            format_args!("{NAME}: core {} done", self.core),
        );
    }

    fn is_bootstrap(&self) -> bool {
        self.core == 0
    }

    fn park_pointer(&self) {
        self.kernel
            .run_pointer(self.core)
            .store(NO_TASK, Ordering::SeqCst);
    }

    // --- INIT -----------------------------------------------------------

    /// Bootstrap-core initialization: every task's entry is invoked once
    /// with `state = INIT`; any non-zero return demotes the system straight
    /// to STOP. On success the initial wake-ups are staggered, the ready
    /// indicator goes high, and the system enters RUN.
    pub fn init_phase(&mut self) {
        let kernel = self.kernel;
        self.klog_notify(format_args!("core {}: initializing tasks", self.core));

        for index in 1..kernel.num_tasks() {
            let id = TaskId(index);
            kernel.attrs(id).set_state(State::INIT);
            let code = self.invoke(id);
            if code != 0 {
                kernel.set_sys_state(State::STOP);
                self.klog_error(format_args!(
                    "task {} ({}) failed to initialize, code {code}",
                    index,
                    kernel.task_name(id)
                ));
            } else {
                kernel.attrs(id).set_state(State::RUN);
            }
        }

        // Let the pipeline process anything INIT produced.
        self.flush_services();

        if kernel.sys_state() == State::INIT {
            self.stagger_wakeups();
            if let Some(pin) = kernel.config().ready_pin {
                kernel.platform().gpio_write(pin, true);
            }
            kernel.set_sys_state(State::RUN);
            self.klog_notify(format_args!(
                "core {}: {} task(s) initialized, entering RUN",
                self.core,
                kernel.num_tasks()
            ));
        } else {
            self.klog_error(format_args!(
                "core {}: system failed to initialize",
                self.core
            ));
        }

        self.flush_services();
        self.cycle = Priority::HIGH;
    }

    /// Spreads initial wake-ups so tasks within a band start offset by
    /// `band_interval / count`, and the bands themselves are half-phase
    /// shifted against each other -- nothing stampedes on the first tick.
    fn stagger_wakeups(&self) {
        let kernel = self.kernel;
        let mut high = 0u32;
        let mut normal = 0u32;
        let mut low = 0u32;
        for index in 1..kernel.num_tasks() {
            match kernel.attrs(TaskId(index)).priority() {
                Priority::HIGH => high += 1,
                Priority::NORMAL => normal += 1,
                _ => low += 1,
            }
        }
        let high_off = Priority::HIGH.interval_us().checked_div(high).unwrap_or(0);
        let normal_off =
            Priority::NORMAL.interval_us().checked_div(normal).unwrap_or(0);
        let low_off = Priority::LOW.interval_us().checked_div(low).unwrap_or(0);

        let start = kernel.now_us();
        let (mut hi, mut ni, mut li) = (0u32, 0u32, 0u32);
        for index in 1..kernel.num_tasks() {
            let attrs = kernel.attrs(TaskId(index));
            let wake = match attrs.priority() {
                Priority::HIGH => {
                    let w = start + u64::from(hi * high_off);
                    hi += 1;
                    w
                }
                Priority::NORMAL => {
                    let w = start + u64::from(high_off / 2 + ni * normal_off);
                    ni += 1;
                    w
                }
                _ => {
                    let w = start + u64::from(normal_off / 2 + li * low_off);
                    li += 1;
                    w
                }
            };
            attrs.set_wake_at(wake);
        }
    }

    // --- RUN ------------------------------------------------------------

    fn run_phase(&mut self) {
        while self.kernel.sys_state() == State::RUN {
            self.sweep();
        }
        // Push pending log lines towards the logger before leaving RUN.
        self.run_inline(self.kernel.ids().postman);
        self.park_pointer();
    }

    /// One pass over the task table at the current priority cycle, after
    /// which the cycle rotates. Public as a building block for simulation
    /// harnesses; `run` calls it in a loop.
    pub fn sweep(&mut self) {
        let kernel = self.kernel;
        let n = kernel.num_tasks();
        let me = kernel.run_pointer(self.core);

        for step in 1..n {
            if kernel.sys_state() != State::RUN {
                break;
            }
            // Even cores ascend the table, odd cores descend.
            let index = if self.core % 2 == 0 { step } else { n - step };
            let id = TaskId(index);
            me.store(id.0, Ordering::SeqCst);

            // One clock read covers all three gates.
            let now = kernel.now_us();
            let attrs = kernel.attrs(id);
            let due = attrs.priority().eligible_at(self.cycle)
                && !attrs.sleeping()
                && attrs.wake_at() <= now;

            if due && self.acquire_slot(id) {
                // The other core may have run this task while we waited in
                // the collision gate; its advanced deadline shows that.
                let now = kernel.now_us();
                if kernel.sys_state() == State::RUN && attrs.wake_at() <= now {
                    let code = self.invoke(id);
                    if code != 0 {
                        self.klog_error(format_args!(
                            "task {} ({}) returned fatal code {code}, stopping",
                            index,
                            kernel.task_name(id)
                        ));
                        kernel.set_sys_state(State::STOP);
                        break;
                    }
                    if kernel.outbound(self.core).messages_waiting() > 0 {
                        self.drain_outbound();
                    }
                    if kernel.isr_ring().messages_waiting() > 0 {
                        self.drain_isr();
                    }
                    self.advance_deadline(id);
                    continue;
                }
            }

            // Interrupts are serviced every slot, whether or not anything
            // ran -- the ISR ring must not back up behind sleeping tasks.
            if kernel.isr_ring().messages_waiting() > 0 {
                self.drain_isr();
            }
        }

        self.park_pointer();
        self.cycle = self.cycle.next_cycle();
    }

    /// Wins the right to run `id`, or yields after bounded back-off. On
    /// entry this core's run pointer already names `id`.
    fn acquire_slot(&self, id: TaskId) -> bool {
        let kernel = self.kernel;
        let me = kernel.run_pointer(self.core);
        let other = kernel.run_pointer((self.core + 1) % MAX_CORES as u8);
        let mut round = 0u32;
        while other.load(Ordering::SeqCst) == id.0 {
            me.store(NO_TASK, Ordering::SeqCst);
            if round >= COLLISION_RETRY_LIMIT {
                return false;
            }
            let wait = COLLISION_BASE_WAIT_US
                + COLLISION_CORE_STAGGER_US * u64::from(self.core)
                + u64::from(round);
            kernel.platform().busy_wait_us(wait);
            round += 1;
            me.store(id.0, Ordering::SeqCst);
        }
        true
    }

    /// Invokes a task's entry once. Caller must hold the collision gate for
    /// `id` (or be in a single-core phase).
    fn invoke(&self, id: TaskId) -> u8 {
        let slot = self.kernel.slot(id);
        let Some(entry) = slot.entry else {
            // Slot 0, the scheduler pseudo-task, has no entry.
            return 0;
        };
        slot.attrs.set_running_on_core(self.core as i8);
        let mut ctx = TaskContext::new(self.kernel, id, self.core);
        // Safety: the collision protocol (or a single-core phase)
        // guarantees no other `&mut` to this task exists anywhere right
        // now; the pointer itself is immutable after registration.
        let task = unsafe { &mut *entry.as_ptr() };
        let code = task.step(&mut ctx);
        slot.attrs.set_running_on_core(NOT_RUNNING);
        code
    }

    /// Runs a system task inline under the collision gate, bypassing the
    /// priority/sleep/deadline gates: the work demonstrably exists, so the
    /// worker runs. Return codes of inline runs are ignored.
    fn run_inline(&self, id: TaskId) {
        let me = self.kernel.run_pointer(self.core);
        let prev = me.load(Ordering::SeqCst);
        me.store(id.0, Ordering::SeqCst);
        if self.acquire_slot(id) {
            let _ = self.invoke(id);
        }
        me.store(prev, Ordering::SeqCst);
    }

    fn drain_outbound(&self) {
        let ids = self.kernel.ids();
        self.run_inline(ids.postman);
        self.run_inline(ids.taskmgr);
    }

    fn drain_isr(&self) {
        let ids = self.kernel.ids();
        self.run_inline(ids.irq);
        self.run_inline(ids.postman);
        self.run_inline(ids.taskmgr);
    }

    /// Re-arms a task's deadline after a successful run: if the task didn't
    /// move its own wake-up forward, advance it by whole priority intervals
    /// until it lies in the future. Missed slots are dropped, not replayed.
    fn advance_deadline(&self, id: TaskId) {
        let attrs = self.kernel.attrs(id);
        let now = self.kernel.now_us();
        let interval = u64::from(attrs.priority().interval_us()).max(1);
        let mut wake = attrs.wake_at();
        if wake <= now {
            while wake <= now {
                wake += interval;
            }
            attrs.set_wake_at(wake);
        }
    }

    // --- STOP -----------------------------------------------------------

    /// Bootstrap-core shutdown: ready indicator low, every task invoked
    /// once with `state = STOP` in reverse registration order -- postman and
    /// logger excepted, which are stopped last so queued log lines still
    /// drain -- then the system goes DOWN.
    pub fn stop_phase(&mut self) {
        let kernel = self.kernel;
        if let Some(pin) = kernel.config().ready_pin {
            kernel.platform().gpio_write(pin, false);
        }
        self.klog_notify(format_args!("core {}: stopping all tasks", self.core));

        let postman = kernel.ids().postman;
        let eventlog = kernel.ids().eventlog;
        for index in (1..kernel.num_tasks()).rev() {
            let id = TaskId(index);
            if id == postman || id == eventlog {
                continue;
            }
            kernel.attrs(id).set_state(State::STOP);
            self.run_stop(id);
        }

        // The postman delivers whatever the shutdown produced, then stops;
        // the logger drains it all, then stops.
        self.run_stop(postman);
        kernel.attrs(postman).set_state(State::STOP);
        self.run_stop(postman);

        self.run_stop(eventlog);
        kernel.attrs(eventlog).set_state(State::STOP);
        self.run_stop(eventlog);

        kernel.set_sys_state(State::DOWN);
        self.park_pointer();
        kernel.sink_line(
            Severity::Notify,
            format_args!("{NAME}: all tasks stopped, system down"),
        );
    }

    /// One collision-gated, otherwise unconditional invocation during the
    /// STOP phase. The other core may still be finishing a sweep when STOP
    /// begins, so the gate stays.
    fn run_stop(&self, id: TaskId) {
        let me = self.kernel.run_pointer(self.core);
        me.store(id.0, Ordering::SeqCst);
        if self.acquire_slot(id) {
            let _ = self.invoke(id);
        } else {
            self.klog_error(format_args!(
                "stop call for task {} skipped, core contention",
                id.0
            ));
        }
        me.store(NO_TASK, Ordering::SeqCst);
    }

    /// Runs postman, task-manager and logger once each, unconditionally --
    /// used around INIT to flush messages produced outside the normal
    /// sweep.
    fn flush_services(&self) {
        let ids = self.kernel.ids();
        self.run_inline(ids.postman);
        self.run_inline(ids.taskmgr);
        self.run_inline(ids.eventlog);
    }

    // --- scheduler logging ---------------------------------------------

    fn klog_notify(&self, args: core::fmt::Arguments<'_>) {
        if self.kernel.config().system_debug > DEBUG_NONE {
            let _ = self.kernel.log_from(
                TaskId::SCHEDULER,
                self.core,
                Severity::Notify,
                args,
            );
        }
    }

    fn klog_error(&self, args: core::fmt::Arguments<'_>) {
        let _ = self.kernel.log_from(
            TaskId::SCHEDULER,
            self.core,
            Severity::Error,
            args,
        );
    }
}
