// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The surface tasks program against.
//!
//! Every invocation of a task receives a fresh [`TaskContext`]: read-only
//! identity and attribute snapshots, the task's mailbox, and helpers for
//! everything a task is allowed to ask of the kernel -- posting messages,
//! requesting attribute changes (authorization-checked right here, so the
//! caller learns about a rejection synchronously), timers, GPIO
//! subscriptions, and formatted logging.
//!
//! Outbound messages go into the staging ring of whichever core the task is
//! currently running on; the scheduler runs the postman before the next task
//! gets the core, which is the delivery barrier the ordering guarantees rest
//! on.

use core::fmt;

use tandem_abi::{
    kind, Error, GpioEvents, Message, Priority, State, TaskId,
    ANTI_BOUNCE_MAX_US, NUMBER_OF_GPIO_PORTS,
};

use crate::platform::Severity;
use crate::ring::Mailbox;
use crate::startup::Kernel;

/// Per-invocation view of a task. Constructed by the scheduler; the
/// attribute fields are snapshots taken at dispatch.
pub struct TaskContext<'r, 'k> {
    kernel: &'r Kernel<'k>,
    id: TaskId,
    core: u8,
    state: State,
    priority: Priority,
    debug: u8,
}

impl<'r, 'k> TaskContext<'r, 'k> {
    pub(crate) fn new(kernel: &'r Kernel<'k>, id: TaskId, core: u8) -> Self {
        let attrs = kernel.attrs(id);
        Self {
            kernel,
            id,
            core,
            state: attrs.state(),
            priority: attrs.priority(),
            debug: attrs.debug(),
        }
    }

    pub(crate) fn kernel(&self) -> &'r Kernel<'k> {
        self.kernel
    }

    // --- identity -------------------------------------------------------

    pub fn task_id(&self) -> TaskId {
        self.id
    }

    pub fn task_name(&self) -> &str {
        self.kernel.task_name(self.id)
    }

    /// The state this invocation was dispatched with (INIT on the first
    /// call, STOP on the last, RUN or a user-defined value in between).
    pub fn state(&self) -> State {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn debug_level(&self) -> u8 {
        self.debug
    }

    pub fn running_on_core(&self) -> u8 {
        self.core
    }

    pub fn now_us(&self) -> u64 {
        self.kernel.now_us()
    }

    // --- registry queries ----------------------------------------------

    pub fn task_id_by_name(&self, name: &str) -> Option<TaskId> {
        self.kernel.task_id_by_name(name)
    }

    pub fn is_task_awake(&self, id: TaskId) -> bool {
        self.kernel.is_task_awake(id)
    }

    pub fn is_system_task(&self, id: TaskId) -> bool {
        self.kernel.is_system_task(id)
    }

    // --- mailbox --------------------------------------------------------

    pub fn messages_waiting(&self) -> u16 {
        self.kernel.inbound(self.id).messages_waiting()
    }

    /// Copies out the oldest unread message without consuming it. Process
    /// first, then [`Self::pop`] -- a message survives a failed run that
    /// way.
    pub fn peek(&self) -> Option<Message> {
        self.kernel.inbound(self.id).peek()
    }

    pub fn pop(&self) {
        self.kernel.inbound(self.id).pop()
    }

    pub fn clear_inbound(&self) {
        self.kernel.inbound(self.id).clear()
    }

    // --- messaging ------------------------------------------------------

    /// Posts a message to a local task. Non-blocking; `MailboxFull` means
    /// this core's outbound staging ring has no slot.
    pub fn post(
        &self,
        recipient: TaskId,
        kind: u8,
        payload: u32,
        aux: u32,
    ) -> Result<(), Error> {
        self.post_to_host(self.kernel.host_id(), recipient, kind, payload, aux)
    }

    /// Posts a message carrying an explicit recipient host. Delivery is
    /// local-only; the host field exists so replies can be addressed
    /// faithfully.
    pub fn post_to_host(
        &self,
        host: u8,
        recipient: TaskId,
        kind: u8,
        payload: u32,
        aux: u32,
    ) -> Result<(), Error> {
        let msg = Message {
            sender_host: self.kernel.host_id(),
            sender_task: self.id.0,
            recipient_host: host,
            recipient_task: recipient.0,
            kind,
            payload,
            aux,
            timestamp: self.kernel.now_us(),
        };
        if self.kernel.outbound(self.core).write(msg) {
            Ok(())
        } else {
            Err(Error::MailboxFull)
        }
    }

    /// Replies to the sender of `msg`.
    pub fn reply(
        &self,
        msg: &Message,
        kind: u8,
        payload: u32,
        aux: u32,
    ) -> Result<(), Error> {
        self.post_to_host(
            msg.sender_host,
            TaskId(msg.sender_task),
            kind,
            payload,
            aux,
        )
    }

    // --- attribute requests --------------------------------------------
    //
    // These enqueue a request for the task-manager, which is the only place
    // attributes actually change. Authorization is checked here, so the
    // caller gets the rejection synchronously -- and checked *again* by the
    // manager, so a hand-built message can't sidestep it.

    pub fn set_task_sleep(
        &self,
        target: TaskId,
        sleeping: bool,
    ) -> Result<(), Error> {
        self.authorize_protected(target)?;
        self.manager_request(kind::SET_TASK_SLEEP, u32::from(sleeping), target)
    }

    /// Requests `target`'s next wake-up at now + `delta_us`.
    pub fn set_task_wakeup(
        &self,
        target: TaskId,
        delta_us: u32,
    ) -> Result<(), Error> {
        self.authorize_protected(target)?;
        self.manager_request(kind::SET_TASK_WAKEUPTIME, delta_us, target)
    }

    pub fn set_task_priority(
        &self,
        target: TaskId,
        priority: Priority,
    ) -> Result<(), Error> {
        self.authorize_protected(target)?;
        self.manager_request(kind::SET_TASK_PRIORITY, priority.0, target)
    }

    /// Task states are not protected: user-defined values are explicitly
    /// allowed, and tasks drive each other's state machines with them.
    pub fn set_task_state(&self, target: TaskId, state: State) -> Result<(), Error> {
        self.require_valid(target)?;
        self.manager_request(kind::SET_TASK_STATE, u32::from(state.0), target)
    }

    pub fn set_task_debug(&self, target: TaskId, level: u8) -> Result<(), Error> {
        self.require_valid(target)?;
        self.manager_request(kind::SET_TASK_DEBUG, u32::from(level), target)
    }

    pub fn wake_all_tasks(&self) -> Result<(), Error> {
        self.manager_request(kind::WAKE_ALL_TASKS, 0, TaskId(0))
    }

    /// Puts every non-system task except `target` to sleep. Rejected here
    /// for system-task targets; rejected at the manager when the target is
    /// sleeping.
    pub fn dedicate_to(&self, target: TaskId) -> Result<(), Error> {
        self.require_valid(target)?;
        if self.kernel.is_system_task(target) {
            let _ = self.log_error(format_args!(
                "dedication to system task {} denied",
                self.kernel.task_name(target)
            ));
            return Err(Error::InvalidOperation);
        }
        self.manager_request(kind::DEDICATE_TO_TASK, 0, target)
    }

    /// Requests a system state change (any task may do this; the manager
    /// enforces that the lifecycle only moves forward).
    pub fn set_system_state(&self, state: State) -> Result<(), Error> {
        self.manager_request(kind::SET_SYS_STATE, u32::from(state.0), TaskId(0))
    }

    /// Requests sleep for the calling task itself. Takes effect once the
    /// task-manager processes the request -- i.e. before the next sweep, not
    /// mid-invocation.
    pub fn sleep_self(&self) -> Result<(), Error> {
        self.set_task_sleep(self.id, true)
    }

    /// Requests the caller's own next wake-up at now + `delta_us`.
    pub fn request_wakeup(&self, delta_us: u32) -> Result<(), Error> {
        self.set_task_wakeup(self.id, delta_us)
    }

    fn manager_request(
        &self,
        kind: u8,
        payload: u32,
        target: TaskId,
    ) -> Result<(), Error> {
        self.post(
            self.kernel.ids().taskmgr,
            kind,
            payload,
            u32::from(target.0),
        )
    }

    fn require_valid(&self, target: TaskId) -> Result<(), Error> {
        if self.kernel.is_valid_task(target) {
            Ok(())
        } else {
            Err(Error::TaskNotFound)
        }
    }

    /// Sleep, priority and wake-up time of a *system* task may only be
    /// changed by another system task.
    fn authorize_protected(&self, target: TaskId) -> Result<(), Error> {
        self.require_valid(target)?;
        if self.kernel.is_system_task(target) && !self.kernel.is_system_task(self.id)
        {
            let _ = self.log_error(format_args!(
                "attempt to change a protected attribute of {} denied",
                self.kernel.task_name(target)
            ));
            return Err(Error::InvalidOperation);
        }
        Ok(())
    }

    // --- timers ---------------------------------------------------------

    /// Registers a timer with the software-timer task. The timer fires as a
    /// message to this task with `kind = timer_id` and the entry's sequence
    /// number as payload.
    pub fn timer_set(
        &self,
        timer_id: u8,
        repetitive: bool,
        interval_ms: u32,
    ) -> Result<(), Error> {
        self.post(
            self.kernel.ids().swtimer,
            kind::TIMER_SET,
            interval_ms,
            u32::from(timer_id) | u32::from(repetitive) << 8,
        )
    }

    /// Cancels every timer this task registered under `timer_id`.
    pub fn timer_cancel(&self, timer_id: u8) -> Result<(), Error> {
        self.post(
            self.kernel.ids().swtimer,
            kind::TIMER_CANCEL,
            u32::from(timer_id),
            0,
        )
    }

    /// Cancels exactly one timer by its sequence number (learned from a
    /// fire message).
    pub fn timer_cancel_by_seq(&self, sequence: u32) -> Result<(), Error> {
        self.post(
            self.kernel.ids().swtimer,
            kind::TIMER_CANCEL_BY_SEQ,
            sequence,
            0,
        )
    }

    // --- GPIO -----------------------------------------------------------

    /// Subscribes this task to interrupt events on `pin`. Events arrive as
    /// messages with `kind = pin`, the event bits as payload, and the pin's
    /// pull-down flag in `aux`. `anti_bounce_us` (clipped to 24 bits) is the
    /// minimum interval between deliveries to this subscription.
    pub fn gpio_subscribe(
        &self,
        pin: u8,
        events: GpioEvents,
        pull_down: bool,
        anti_bounce_us: u32,
    ) -> Result<(), Error> {
        if pin >= NUMBER_OF_GPIO_PORTS || events.is_empty() {
            return Err(Error::InvalidOperation);
        }
        let aux = anti_bounce_us.min(ANTI_BOUNCE_MAX_US)
            | u32::from(pull_down) << 24;
        self.post(self.kernel.ids().irq, pin, events.bits(), aux)
    }

    /// Removes this task's subscription on `pin`.
    pub fn gpio_unsubscribe(&self, pin: u8) -> Result<(), Error> {
        if pin >= NUMBER_OF_GPIO_PORTS {
            return Err(Error::InvalidOperation);
        }
        self.post(self.kernel.ids().irq, pin, 0, 0)
    }

    // --- logging --------------------------------------------------------

    /// Formats and queues an informational line for the event logger.
    pub fn log_notify(&self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        self.kernel
            .log_from(self.id, self.core, Severity::Notify, args)
    }

    /// Formats and queues an error line for the event logger.
    pub fn log_error(&self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        self.kernel
            .log_from(self.id, self.core, Severity::Error, args)
    }
}

/// Queues an informational log line, ignoring logging failures (a full log
/// pipeline should not take the caller down with it).
#[macro_export]
macro_rules! log_notify {
    ($ctx:expr, $($arg:tt)*) => {{
        let _ = $ctx.log_notify(core::format_args!($($arg)*));
    }};
}

/// Queues an error log line, ignoring logging failures.
#[macro_export]
macro_rules! log_error {
    ($ctx:expr, $($arg:tt)*) => {{
        let _ = $ctx.log_error(core::format_args!($($arg)*));
    }};
}
