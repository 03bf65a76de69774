// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel construction and bring-up.
//!
//! The application owns `main`: it builds a [`Kernel`] (which registers the
//! system tasks), registers its own tasks, then shares the kernel by
//! reference with one [`crate::Scheduler`] per core. Registration needs
//! `&mut Kernel`; running needs only `&Kernel` -- so the task table is
//! immutable from the moment the kernel is shared, enforced by the borrow
//! checker rather than by convention.
//!
//! ```ignore
//! let platform = /* board or simulator */;
//! let mut system = SystemTasks::default();
//! let mut kernel = Kernel::new(&platform, KernelConfig::default(), &mut system)?;
//! kernel.register(&mut my_task, "worker", Priority::NORMAL)?;
//! // hand &kernel to a Scheduler on each core; core 0 bootstraps
//! ```

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

use arrayvec::ArrayString;
use tandem_abi::{
    Error, GpioEvents, Message, Priority, State, TaskId, DEBUG_NONE,
    EVENT_LOG_ENTRY_LENGTH, EVENT_LOG_QUEUE, MAX_CORES, MAX_MESSAGES, MAX_TASKS,
    STARTUP_DELAY_MS, SYSTEM_READY_PIN,
};

use crate::eventlog::{self, format_clipped, EventLogger, LineArena, LogText};
use crate::irq::{self, IrqHandler};
use crate::platform::{GpioDir, Platform, Severity};
use crate::postman::{self, Postman};
use crate::ring::{Mailbox, MsgRing};
use crate::sched;
use crate::swtimer::{self, SoftwareTimer};
use crate::task::{clip_name, Task, TaskAttrs, TaskSlot};
use crate::taskmgr::{self, TaskManager};
use crate::watchdog::{self, Watchdog};

/// Boot-time configuration. The defaults match the reference board; tests
/// shrink the startup delay to zero.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// This node's host id, stamped into every message's sender fields.
    pub host_id: u8,
    /// Output pin held high while the system is in RUN, or `None` to skip
    /// driving a ready indicator.
    pub ready_pin: Option<u8>,
    /// Pause before the scheduler starts initializing tasks.
    pub startup_delay_ms: u32,
    /// Debug level for kernel-originated log chatter (task debug levels are
    /// per-task attributes).
    pub system_debug: u8,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            host_id: 0,
            ready_pin: Some(SYSTEM_READY_PIN),
            startup_delay_ms: STARTUP_DELAY_MS,
            system_debug: DEBUG_NONE,
        }
    }
}

/// Owns the state of the six system tasks. Lives with the application so
/// the kernel can borrow it for its whole life, like any other task.
#[derive(Default)]
pub struct SystemTasks {
    postman: Postman,
    taskmgr: TaskManager,
    irq: IrqHandler,
    swtimer: SoftwareTimer,
    eventlog: EventLogger,
    watchdog: Watchdog,
}

/// Well-known task ids, resolved once at registration.
pub(crate) struct SystemIds {
    pub postman: TaskId,
    pub irq: TaskId,
    pub taskmgr: TaskId,
    pub watchdog: TaskId,
    pub swtimer: TaskId,
    pub eventlog: TaskId,
}

/// The kernel: task table, mailboxes, shared scheduler state, and the
/// platform reference. Everything the two scheduler instances share.
pub struct Kernel<'k> {
    platform: &'k dyn Platform,
    config: KernelConfig,
    sys_state: AtomicU8,
    num_tasks: u8,
    slots: [TaskSlot<'k>; MAX_TASKS],
    outbound: [MsgRing<MAX_MESSAGES>; MAX_CORES],
    isr_ring: MsgRing<MAX_MESSAGES>,
    eventlog_ring: MsgRing<EVENT_LOG_QUEUE>,
    run_pointers: [AtomicU8; MAX_CORES],
    log_arena: LineArena,
    ids: SystemIds,
}

// Safety: the non-`Sync` ingredients are the `NonNull<dyn Task>` entry
// pointers. A task entry is only ever dereferenced by a scheduler that has
// won the collision protocol for that task id (see `sched::acquire_slot`),
// which guarantees at most one `&mut` to any task at any instant; `Task:
// Send` makes moving that access between cores sound. Everything else in
// here is atomics, SPSC rings with their own justification, or data that is
// immutable once `&Kernel` is shared.
unsafe impl Sync for Kernel<'_> {}

impl<'k> Kernel<'k> {
    /// Builds a kernel: drives the ready indicator low, reserves slot 0 for
    /// the scheduler pseudo-task, and registers the system tasks in their
    /// fixed order.
    pub fn new(
        platform: &'k dyn Platform,
        config: KernelConfig,
        system: &'k mut SystemTasks,
    ) -> Result<Self, Error> {
        if let Some(pin) = config.ready_pin {
            platform.gpio_init(pin);
            platform.gpio_set_dir(pin, GpioDir::Output);
            platform.gpio_write(pin, false);
        }

        let placeholder = TaskId(0);
        let mut kernel = Self {
            platform,
            config,
            sys_state: AtomicU8::new(State::INIT.0),
            num_tasks: 0,
            slots: core::array::from_fn(|_| TaskSlot::vacant()),
            outbound: core::array::from_fn(|_| MsgRing::new()),
            isr_ring: MsgRing::new(),
            eventlog_ring: MsgRing::new(),
            run_pointers: core::array::from_fn(|_| AtomicU8::new(sched::NO_TASK)),
            log_arena: LineArena::new(),
            ids: SystemIds {
                postman: placeholder,
                irq: placeholder,
                taskmgr: placeholder,
                watchdog: placeholder,
                swtimer: placeholder,
                eventlog: placeholder,
            },
        };

        // Slot 0 belongs to the scheduler itself: it has no entry function
        // and is never dispatched, but gives scheduler log lines a sender.
        let slot0 = &mut kernel.slots[0];
        slot0.name = clip_name(sched::NAME);
        slot0.attrs.set_state(State::RUN);
        slot0.attrs.set_sleeping(true);
        kernel.num_tasks = 1;

        let SystemTasks {
            postman,
            taskmgr,
            irq,
            swtimer,
            eventlog,
            watchdog,
        } = system;

        // A failure here means the table can't even hold the kernel's own
        // tasks; surface it as an initialization failure, not a capacity
        // complaint.
        kernel.ids = SystemIds {
            postman: kernel
                .register(postman, postman::NAME, Priority::LOW)
                .map_err(|_| Error::InitializationFailure)?,
            irq: kernel
                .register(irq, irq::NAME, Priority::LOW)
                .map_err(|_| Error::InitializationFailure)?,
            taskmgr: kernel
                .register(taskmgr, taskmgr::NAME, Priority::LOW)
                .map_err(|_| Error::InitializationFailure)?,
            watchdog: kernel
                .register(watchdog, watchdog::NAME, Priority::LOW)
                .map_err(|_| Error::InitializationFailure)?,
            swtimer: kernel
                .register(swtimer, swtimer::NAME, Priority::HIGH)
                .map_err(|_| Error::InitializationFailure)?,
            eventlog: kernel
                .register(eventlog, eventlog::NAME, Priority::LOW)
                .map_err(|_| Error::InitializationFailure)?,
        };

        Ok(kernel)
    }

    /// Adds a task to the table. Fails with `TooManyTasks` when the table is
    /// full. Registration is only possible while the kernel is exclusively
    /// held, i.e. strictly before the schedulers start.
    pub fn register(
        &mut self,
        entry: &'k mut (dyn Task + 'k),
        name: &str,
        priority: Priority,
    ) -> Result<TaskId, Error> {
        let index = usize::from(self.num_tasks);
        if index >= MAX_TASKS {
            return Err(Error::TooManyTasks);
        }
        let slot = &mut self.slots[index];
        slot.name = clip_name(name);
        slot.entry = Some(NonNull::from(entry));
        slot.attrs = TaskAttrs::new(priority);
        self.num_tasks += 1;
        Ok(TaskId(index as u8))
    }

    // --- identity and registry -----------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn host_id(&self) -> u8 {
        self.config.host_id
    }

    pub fn num_tasks(&self) -> u8 {
        self.num_tasks
    }

    pub fn now_us(&self) -> u64 {
        self.platform.now_us()
    }

    pub fn sys_state(&self) -> State {
        State(self.sys_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_sys_state(&self, state: State) {
        self.sys_state.store(state.0, Ordering::Release);
    }

    pub fn is_valid_task(&self, id: TaskId) -> bool {
        id.index() < usize::from(self.num_tasks)
    }

    /// Looks a task up by name. Names are compared exactly.
    pub fn task_id_by_name(&self, name: &str) -> Option<TaskId> {
        (0..self.num_tasks)
            .map(TaskId)
            .find(|id| self.slots[id.index()].name.as_str() == name)
    }

    pub fn task_name(&self, id: TaskId) -> &str {
        if self.is_valid_task(id) {
            self.slots[id.index()].name.as_str()
        } else {
            "?"
        }
    }

    /// Whether `id` names a system task (reserved name prefix).
    pub fn is_system_task(&self, id: TaskId) -> bool {
        self.is_valid_task(id)
            && crate::task::is_system_name(self.slots[id.index()].name.as_str())
    }

    pub fn is_task_awake(&self, id: TaskId) -> bool {
        self.is_valid_task(id) && !self.slots[id.index()].attrs.sleeping()
    }

    pub fn task_priority(&self, id: TaskId) -> Option<Priority> {
        if self.is_valid_task(id) {
            Some(self.slots[id.index()].attrs.priority())
        } else {
            None
        }
    }

    /// Number of log lines currently owned by somebody -- formatted but not
    /// yet written to the sink.
    pub fn log_slots_in_flight(&self) -> u32 {
        self.log_arena.in_flight()
    }

    /// Observability hook: which core (if any) a task is on right now.
    pub fn task_running_on_core(&self, id: TaskId) -> Option<u8> {
        if !self.is_valid_task(id) {
            return None;
        }
        match self.slots[id.index()].attrs.running_on_core() {
            crate::task::NOT_RUNNING => None,
            core => Some(core as u8),
        }
    }

    // --- interrupt entry ------------------------------------------------

    /// ISR entry point: records a GPIO event in the ingest ring and
    /// acknowledges the hardware interrupt. Call this, and nothing else,
    /// from the application's GPIO ISR. Overflow is a dropped event -- this
    /// path never blocks and never logs.
    pub fn isr_gpio(&self, gpio: u8, events: GpioEvents) {
        let msg = Message {
            sender_host: self.config.host_id,
            sender_task: self.ids.irq.0,
            recipient_host: self.config.host_id,
            recipient_task: self.ids.irq.0,
            kind: gpio,
            payload: events.bits(),
            aux: 0,
            timestamp: self.platform.now_us(),
        };
        let _ = self.isr_ring.write(msg);
        self.platform.gpio_ack_irq(gpio, events);
    }

    // --- internal plumbing ---------------------------------------------

    pub(crate) fn platform(&self) -> &'k dyn Platform {
        self.platform
    }

    pub(crate) fn ids(&self) -> &SystemIds {
        &self.ids
    }

    pub(crate) fn attrs(&self, id: TaskId) -> &TaskAttrs {
        &self.slots[id.index()].attrs
    }

    pub(crate) fn slot(&self, id: TaskId) -> &TaskSlot<'k> {
        &self.slots[id.index()]
    }

    /// A task's inbound mailbox. The event logger gets the dedicated
    /// high-capacity ring; everyone else the default one in their slot.
    pub(crate) fn inbound(&self, id: TaskId) -> &dyn Mailbox {
        if id == self.ids.eventlog {
            &self.eventlog_ring
        } else {
            &self.slots[id.index()].inbound
        }
    }

    pub(crate) fn outbound(&self, core: u8) -> &MsgRing<MAX_MESSAGES> {
        &self.outbound[usize::from(core)]
    }

    pub(crate) fn isr_ring(&self) -> &MsgRing<MAX_MESSAGES> {
        &self.isr_ring
    }

    pub(crate) fn run_pointer(&self, core: u8) -> &AtomicU8 {
        &self.run_pointers[usize::from(core)]
    }

    pub(crate) fn log_arena(&self) -> &LineArena {
        &self.log_arena
    }

    /// Formats a line into an arena slot and queues it for the event logger
    /// through `core`'s outbound ring. On any failure the slot is freed and
    /// the line is lost, never leaked.
    pub(crate) fn log_from(
        &self,
        sender: TaskId,
        core: u8,
        severity: Severity,
        args: fmt::Arguments<'_>,
    ) -> Result<(), Error> {
        let Some(index) = self.log_arena.acquire() else {
            return Err(Error::MailboxFull);
        };
        let text: LogText = format_clipped(args);
        self.log_arena.write(index, &text);
        let msg = Message {
            sender_host: self.config.host_id,
            sender_task: sender.0,
            recipient_host: self.config.host_id,
            recipient_task: self.ids.eventlog.0,
            kind: match severity {
                Severity::Notify => tandem_abi::kind::LOG_NOTIFY,
                Severity::Error => tandem_abi::kind::LOG_ERROR,
            },
            payload: u32::from(index),
            aux: 0,
            timestamp: self.platform.now_us(),
        };
        if self.outbound(core).write(msg) {
            Ok(())
        } else {
            self.log_arena.release(index);
            Err(Error::MailboxFull)
        }
    }

    /// Writes a line straight to the platform sink, bypassing the message
    /// pipeline. For paths that must not generate messages: the postman's
    /// own failure reporting and the scheduler's last words.
    pub(crate) fn sink_line(&self, severity: Severity, args: fmt::Arguments<'_>) {
        let line: ArrayString<{ EVENT_LOG_ENTRY_LENGTH + 64 }> =
            format_clipped(args);
        self.platform.log_line(severity, &line);
    }
}
