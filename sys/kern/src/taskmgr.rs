// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The task-manager: sole mutator of task attributes after INIT.
//!
//! All manipulation of task and system state funnels through this task as
//! messages, so at most one mutation is in progress at any instant -- the
//! collision rule keeps the manager itself from running on both cores at
//! once, and nothing else writes these fields. (A scheduler on the other
//! core can still *read* a field mid-update; the tolerated consequence is
//! one stale sleep-gate decision, which self-corrects on the next sweep.)
//!
//! Authorization is checked twice: the request helpers reject unauthorized
//! callers synchronously, and this task re-checks the sender recorded in
//! the message, so constructing a request by hand bypasses nothing.

use tandem_abi::{kind, Error, Message, Priority, State, TaskId, MAX_MESSAGES};

use crate::api::TaskContext;
use crate::task::Task;

pub(crate) const NAME: &str = "tandem.taskmgr";

#[derive(Default)]
pub(crate) struct TaskManager;

impl Task for TaskManager {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        let kernel = ctx.kernel();
        match ctx.state() {
            State::INIT => {
                // The message-driven system tasks start asleep; the
                // scheduler runs them inline when there is work. Direct
                // writes are fine here: INIT is single-core and pre-RUN.
                kernel.attrs(ctx.task_id()).set_sleeping(true);
                kernel.attrs(kernel.ids().postman).set_sleeping(true);
                kernel.attrs(kernel.ids().irq).set_sleeping(true);
            }
            State::RUN => {
                let mut budget = MAX_MESSAGES;
                while budget > 0 {
                    let Some(msg) = ctx.peek() else { break };
                    self.apply(ctx, &msg);
                    ctx.pop();
                    budget -= 1;
                }
                // Sleep until the postman wakes us. Direct write: the
                // normal path would be a message to ourselves.
                kernel.attrs(ctx.task_id()).set_sleeping(true);
            }
            State::STOP => {
                // Direct write, same self-reference reasoning.
                kernel.attrs(ctx.task_id()).set_state(State::DOWN);
            }
            _ => {}
        }
        0
    }
}

impl TaskManager {
    fn apply(&self, ctx: &TaskContext<'_, '_>, msg: &Message) {
        let kernel = ctx.kernel();
        let target = TaskId(msg.aux as u8);

        match msg.kind {
            kind::PING => {
                let _ = ctx.reply(msg, kind::ECHO, msg.payload, 0);
            }

            kind::SET_SYS_STATE => {
                let requested = State(msg.payload as u8);
                let current = kernel.sys_state();
                // The lifecycle only advances: INIT > RUN > STOP > DOWN
                // numerically. Anything else would be a reboot, which is
                // not implemented.
                if requested.0 < current.0 {
                    kernel.set_sys_state(requested);
                    log_notify!(
                        ctx,
                        "system state set to {} by task {}",
                        requested,
                        msg.sender_task
                    );
                } else {
                    log_error!(
                        ctx,
                        "system state change {} -> {} from task {} refused",
                        current,
                        requested,
                        msg.sender_task
                    );
                }
            }

            kind::SET_TASK_SLEEP => {
                if self.admit(ctx, msg, target).is_err() {
                    return;
                }
                let attrs = kernel.attrs(target);
                if msg.payload == 0 {
                    // Waking a sleeping task also makes it immediately
                    // eligible; a task that was merely early keeps its
                    // schedule.
                    if attrs.sleeping() {
                        attrs.set_wake_at(kernel.now_us());
                        attrs.set_sleeping(false);
                    }
                } else {
                    attrs.set_sleeping(true);
                }
            }

            kind::SET_TASK_WAKEUPTIME => {
                if self.admit(ctx, msg, target).is_err() {
                    return;
                }
                kernel
                    .attrs(target)
                    .set_wake_at(kernel.now_us() + u64::from(msg.payload));
            }

            kind::SET_TASK_PRIORITY => {
                if self.admit(ctx, msg, target).is_err() {
                    return;
                }
                kernel.attrs(target).set_priority(Priority(msg.payload));
            }

            kind::SET_TASK_STATE => {
                // Unprotected, and user-defined values are allowed.
                if kernel.is_valid_task(target) {
                    kernel.attrs(target).set_state(State(msg.payload as u8));
                }
            }

            kind::SET_TASK_DEBUG => {
                if kernel.is_valid_task(target) {
                    kernel.attrs(target).set_debug(msg.payload as u8);
                }
            }

            kind::WAKE_ALL_TASKS => {
                let now = kernel.now_us();
                for index in 1..kernel.num_tasks() {
                    let attrs = kernel.attrs(TaskId(index));
                    // Only sleeping tasks; a wake must not disturb the
                    // schedule of a task that is merely waiting.
                    if attrs.sleeping() {
                        attrs.set_wake_at(now);
                        attrs.set_sleeping(false);
                    }
                }
            }

            kind::DEDICATE_TO_TASK => {
                self.dedicate(ctx, msg, target);
            }

            _ => {
                // Unknown request; ignore, as the original did.
            }
        }
    }

    /// Manager-side authorization re-check for the protected attributes
    /// (sleep, priority, wake-up time): a system task's attributes may only
    /// be changed on request of another system task. The sender fields of
    /// the message are the authority -- not whatever helper produced it.
    fn admit(
        &self,
        ctx: &TaskContext<'_, '_>,
        msg: &Message,
        target: TaskId,
    ) -> Result<(), Error> {
        let kernel = ctx.kernel();
        if !kernel.is_valid_task(target) {
            log_error!(
                ctx,
                "attribute change {} for unknown task {} ignored",
                msg.kind,
                msg.aux
            );
            return Err(Error::TaskNotFound);
        }
        if !kernel.is_system_task(target) {
            return Ok(());
        }
        let sender = TaskId(msg.sender_task);
        let sender_is_system = msg.sender_host == kernel.host_id()
            && kernel.is_system_task(sender);
        if sender_is_system {
            Ok(())
        } else {
            log_error!(
                ctx,
                "task {} may not change protected attributes of system task {}",
                msg.sender_task,
                kernel.task_name(target)
            );
            Err(Error::InvalidOperation)
        }
    }

    fn dedicate(&self, ctx: &TaskContext<'_, '_>, msg: &Message, target: TaskId) {
        let kernel = ctx.kernel();
        if !kernel.is_valid_task(target) || kernel.is_system_task(target) {
            log_error!(
                ctx,
                "dedication to task {} refused",
                msg.aux
            );
            return;
        }
        if kernel.attrs(target).sleeping() {
            // Dedicating everything to a task that will never run again
            // would wedge the system.
            log_error!(
                ctx,
                "dedication refused: task {} is sleeping ({})",
                msg.aux,
                Error::TaskSleeping
            );
            return;
        }
        for index in 1..kernel.num_tasks() {
            let id = TaskId(index);
            if id == target || kernel.is_system_task(id) {
                continue;
            }
            kernel.attrs(id).set_sleeping(true);
        }
        log_notify!(
            ctx,
            "system now dedicated to task {} ({})",
            msg.aux,
            kernel.task_name(target)
        );
    }
}
