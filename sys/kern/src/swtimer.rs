// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The software timer service.
//!
//! Tasks register timers by message; the timer task keeps the entries in a
//! bounded arena and, whenever a deadline has elapsed, sends the owner a
//! message whose kind is the owner-chosen timer id and whose payload is the
//! entry's sequence number. Repetitive timers advance by whole intervals --
//! a late fire drops the missed slots instead of replaying them, so drift
//! never accumulates beyond one interval. One-shots are removed on fire.
//!
//! The entry list never forces the task awake by itself: after each run it
//! either asks for a wake-up at the earliest remaining deadline, or -- with
//! no entries left -- goes to sleep until a request arrives.

use tandem_abi::{kind, Message, State, TaskId, MAX_MESSAGES, MAX_TIMERS};

use crate::api::TaskContext;
use crate::pool::Pool;
use crate::task::Task;

pub(crate) const NAME: &str = "tandem.timer";

struct TimerEntry {
    task: TaskId,
    host: u8,
    timer_id: u8,
    sequence: u32,
    repetitive: bool,
    interval_ms: u32,
    next_fire_at: u64,
}

pub(crate) struct SoftwareTimer {
    entries: Pool<TimerEntry, MAX_TIMERS>,
    /// Sequence numbers are handed out in insertion order and wrap.
    next_sequence: u32,
}

impl Default for SoftwareTimer {
    fn default() -> Self {
        Self {
            entries: Pool::new(),
            next_sequence: 0,
        }
    }
}

impl Task for SoftwareTimer {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {}
            State::RUN => {
                self.process_requests(ctx);
                self.fire_elapsed(ctx);
                self.schedule_next(ctx);
            }
            State::STOP => {}
            _ => {}
        }
        0
    }
}

impl SoftwareTimer {
    fn process_requests(&mut self, ctx: &TaskContext<'_, '_>) {
        let mut budget = MAX_MESSAGES;
        while budget > 0 {
            let Some(msg) = ctx.peek() else { break };
            match msg.kind {
                kind::PING => {
                    let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
                }
                kind::TIMER_SET => self.set(ctx, &msg),
                kind::TIMER_CANCEL => {
                    // Removes *all* of the sender's entries under this id.
                    self.entries.retain(|_, e| {
                        !(e.task == TaskId(msg.sender_task)
                            && e.host == msg.sender_host
                            && u32::from(e.timer_id) == msg.payload)
                    });
                }
                kind::TIMER_CANCEL_BY_SEQ => self.cancel_by_seq(ctx, &msg),
                _ => {}
            }
            ctx.pop();
            budget -= 1;
        }
    }

    fn set(&mut self, ctx: &TaskContext<'_, '_>, msg: &Message) {
        let interval_ms = msg.payload;
        let timer_id = msg.aux as u8;
        let repetitive = msg.aux & 1 << 8 != 0;
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let entry = TimerEntry {
            task: TaskId(msg.sender_task),
            host: msg.sender_host,
            timer_id,
            sequence,
            repetitive,
            interval_ms,
            next_fire_at: ctx.now_us() + u64::from(interval_ms) * 1_000,
        };
        if self.entries.insert(entry).is_none() {
            log_error!(
                ctx,
                "timer table full; timer {timer_id} for task {} refused",
                msg.sender_task
            );
        }
    }

    fn cancel_by_seq(&mut self, ctx: &TaskContext<'_, '_>, msg: &Message) {
        let found = self
            .entries
            .iter()
            .find(|(_, e)| e.sequence == msg.payload)
            .map(|(i, e)| (i, e.task, e.host));
        match found {
            Some((index, owner, host))
                if owner == TaskId(msg.sender_task) && host == msg.sender_host =>
            {
                self.entries.remove(index);
            }
            Some(_) => {
                log_error!(
                    ctx,
                    "task {} tried to cancel foreign timer sequence {}",
                    msg.sender_task,
                    msg.payload
                );
            }
            None => {}
        }
    }

    /// Sends a message for every elapsed deadline and reschedules or
    /// removes the entry.
    fn fire_elapsed(&mut self, ctx: &TaskContext<'_, '_>) {
        let now = ctx.now_us();
        let mut expired_oneshots: [Option<u8>; MAX_TIMERS] = [None; MAX_TIMERS];
        let mut expired_count = 0;

        for (index, entry) in self.entries.iter_mut() {
            if entry.next_fire_at > now {
                continue;
            }
            // Delivery failure just drops the fire; the entry still
            // advances, matching the "late slots are dropped" rule.
            let _ = ctx.post_to_host(
                entry.host,
                entry.task,
                entry.timer_id,
                entry.sequence,
                0,
            );
            if entry.repetitive {
                let interval = u64::from(entry.interval_ms) * 1_000;
                // Intervals of zero would never make progress; treat them
                // as one tick.
                let interval = interval.max(1);
                while entry.next_fire_at <= now {
                    entry.next_fire_at += interval;
                }
            } else {
                expired_oneshots[expired_count] = Some(index);
                expired_count += 1;
            }
        }

        for index in expired_oneshots.iter().flatten() {
            self.entries.remove(*index);
        }
    }

    /// The minimum remaining deadline determines the next wake; no entries
    /// means sleep until a request arrives.
    fn schedule_next(&mut self, ctx: &TaskContext<'_, '_>) {
        let earliest = self
            .entries
            .iter()
            .map(|(_, e)| e.next_fire_at)
            .min();
        match earliest {
            Some(at) => {
                let delta = at.saturating_sub(ctx.now_us());
                // The wake request carries a 32-bit delta; longer waits are
                // re-derived on the (harmless) early wake-up.
                let delta = u32::try_from(delta).unwrap_or(u32::MAX);
                let _ = ctx.request_wakeup(delta);
            }
            None => {
                let _ = ctx.sleep_self();
            }
        }
    }
}
