// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The watchdog: advisory PING/ECHO liveness rounds.
//!
//! Every `WATCHDOG_CHECK_INTERVAL_US` the watchdog pings every awake task
//! and remembers when it asked. When the ECHO comes back it compares the
//! round trip against `WATCHDOG_TASK_TIMEOUT_US` and logs a warning on
//! excess. That is all it does -- it never stops or restarts anything; a
//! task that has genuinely wedged the cooperative loop can't be preempted
//! anyway, so the log line is the actionable artifact.

use tandem_abi::{
    kind, State, TaskId, MAX_MESSAGES, MAX_TASKS, WATCHDOG_CHECK_INTERVAL_US,
    WATCHDOG_MAX_COUNTER, WATCHDOG_TASK_TIMEOUT_US,
};

use crate::api::TaskContext;
use crate::task::Task;

pub(crate) const NAME: &str = "tandem.watchdog";

#[derive(Copy, Clone)]
struct PendingPing {
    payload: u32,
    sent_at: u64,
}

pub(crate) struct Watchdog {
    outstanding: [Option<PendingPing>; MAX_TASKS],
    counter: u32,
    next_round_at: u64,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self {
            outstanding: [None; MAX_TASKS],
            counter: 0,
            next_round_at: 0,
        }
    }
}

impl Task for Watchdog {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {
                self.outstanding = [None; MAX_TASKS];
                self.counter = 0;
                // First round fires on the first RUN invocation.
                self.next_round_at = 0;
            }
            State::RUN => {
                self.collect_echoes(ctx);
                if ctx.now_us() >= self.next_round_at {
                    self.ping_round(ctx);
                }
            }
            State::STOP => {}
            _ => {}
        }
        0
    }
}

impl Watchdog {
    fn collect_echoes(&mut self, ctx: &TaskContext<'_, '_>) {
        let mut budget = MAX_MESSAGES;
        while budget > 0 {
            let Some(msg) = ctx.peek() else { break };
            match msg.kind {
                kind::PING => {
                    let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
                }
                kind::ECHO => {
                    let sender = usize::from(msg.sender_task);
                    if let Some(pending) =
                        self.outstanding.get(sender).copied().flatten()
                    {
                        if pending.payload == msg.payload {
                            let delay =
                                ctx.now_us().saturating_sub(pending.sent_at);
                            if delay > WATCHDOG_TASK_TIMEOUT_US {
                                log_error!(
                                    ctx,
                                    "ECHO from task {} ({}) took {delay} us, \
                                     over the {WATCHDOG_TASK_TIMEOUT_US} us \
                                     threshold",
                                    msg.sender_task,
                                    ctx.kernel()
                                        .task_name(TaskId(msg.sender_task))
                                );
                            }
                            self.outstanding[sender] = None;
                        }
                    }
                }
                _ => {}
            }
            ctx.pop();
            budget -= 1;
        }
    }

    fn ping_round(&mut self, ctx: &TaskContext<'_, '_>) {
        let kernel = ctx.kernel();
        let now = ctx.now_us();
        for index in 1..kernel.num_tasks() {
            let id = TaskId(index);
            if id == ctx.task_id() || !kernel.is_task_awake(id) {
                continue;
            }
            if ctx.post(id, kind::PING, self.counter, 0).is_ok() {
                self.outstanding[id.index()] = Some(PendingPing {
                    payload: self.counter,
                    sent_at: now,
                });
            }
            self.counter += 1;
            if self.counter >= WATCHDOG_MAX_COUNTER {
                self.counter = 0;
            }
        }
        self.next_round_at = now + WATCHDOG_CHECK_INTERVAL_US;
    }
}
