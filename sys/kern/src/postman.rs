// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The postman: drains a core's outbound staging ring into per-task inbound
//! rings and arranges wake-ups for the recipients.
//!
//! The postman is a system task, but it is never scheduled like one: the
//! scheduler runs it inline whenever the current core's outbound ring is
//! non-empty, immediately after the task that produced the messages. That
//! is the delivery barrier: everything a task posted during invocation *i*
//! is delivered (or reported dropped) before the next task runs on that
//! core.
//!
//! Delivery failures are non-fatal. A full inbound ring or an out-of-range
//! recipient drops the record with a line written *straight to the platform
//! sink* -- going through the normal log pipeline here could recurse, since
//! that pipeline is itself made of messages.

use tandem_abi::{kind, Message, State, TaskId, MAX_MESSAGES, MAX_TASKS};

use crate::api::TaskContext;
use crate::platform::Severity;
use crate::ring::Mailbox;
use crate::task::Task;

pub(crate) const NAME: &str = "tandem.postman";

/// Postman state: which tasks newly have mail and still need a wake-up.
pub(crate) struct Postman {
    newly_mailed: [bool; MAX_TASKS],
}

impl Default for Postman {
    fn default() -> Self {
        Self {
            newly_mailed: [false; MAX_TASKS],
        }
    }
}

impl Task for Postman {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {
                self.newly_mailed = [false; MAX_TASKS];
            }
            State::RUN => self.deliver(ctx),
            State::STOP => {
                // Direct write: only the postman may touch its own state
                // here, to break the cycle with the task-manager.
                ctx.kernel().attrs(ctx.task_id()).set_state(State::DOWN);
            }
            _ => {}
        }
        0
    }
}

impl Postman {
    fn deliver(&mut self, ctx: &mut TaskContext<'_, '_>) {
        let kernel = ctx.kernel();
        // Bounded per run so a chatty task can't monopolize the core.
        let mut budget = MAX_MESSAGES;

        // Our own inbound first: the postman answers PINGs like everyone
        // else. Anything else addressed to us is a stray; drop it.
        while budget > 0 {
            let Some(msg) = ctx.peek() else { break };
            if msg.kind == kind::PING {
                let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
            }
            ctx.pop();
            budget -= 1;
        }

        // Drain this core's outbound staging ring.
        let outbound = kernel.outbound(ctx.running_on_core());
        while budget > 0 {
            let Some(msg) = outbound.peek() else { break };
            self.route(ctx, &msg);
            outbound.pop();
            budget -= 1;
        }

        // Ask the task-manager to wake everyone who newly has mail. These
        // requests go directly into the manager's inbound: routing them
        // through outbound would just bring us back here.
        let manager = kernel.ids().taskmgr;
        for index in 0..usize::from(kernel.num_tasks()) {
            if !self.newly_mailed[index] {
                continue;
            }
            self.newly_mailed[index] = false;
            let wake = Message {
                sender_host: kernel.host_id(),
                sender_task: ctx.task_id().0,
                recipient_host: kernel.host_id(),
                recipient_task: manager.0,
                kind: kind::SET_TASK_SLEEP,
                payload: 0, // false: wake up
                aux: index as u32,
                timestamp: kernel.now_us(),
            };
            if !kernel.inbound(manager).write(wake) {
                kernel.sink_line(
                    Severity::Error,
                    format_args!(
                        "{NAME}: wake-up for task {index} lost, manager mailbox full"
                    ),
                );
            }
        }

        // Sleep until the next inline run. Direct write -- asking the
        // task-manager to put us to sleep would require delivering a
        // message, which is us.
        kernel.attrs(ctx.task_id()).set_sleeping(true);
    }

    /// Copies one staged record into its recipient's inbound ring. The
    /// record (timestamp included) is preserved verbatim; only delivery
    /// bookkeeping happens here.
    fn route(&mut self, ctx: &TaskContext<'_, '_>, msg: &Message) {
        let kernel = ctx.kernel();
        let recipient = TaskId(msg.recipient_task);
        if !kernel.is_valid_task(recipient) {
            kernel.sink_line(
                Severity::Error,
                format_args!(
                    "{NAME}: undeliverable message kind {} from task {} to \
                     invalid task {}",
                    msg.kind, msg.sender_task, msg.recipient_task
                ),
            );
            return;
        }
        if !kernel.inbound(recipient).write(*msg) {
            kernel.sink_line(
                Severity::Error,
                format_args!(
                    "{NAME}: message kind {} from task {} to task {} dropped, \
                     mailbox full",
                    msg.kind, msg.sender_task, msg.recipient_task
                ),
            );
            return;
        }
        if recipient == kernel.ids().taskmgr {
            // The manager can't deliver a wake-up to itself; wake it
            // directly instead of queueing a request.
            kernel.attrs(recipient).set_sleeping(false);
        } else {
            self.newly_mailed[recipient.index()] = true;
        }
    }
}
