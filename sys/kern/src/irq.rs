// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPIO interrupt demultiplexing.
//!
//! The ingest path has two halves. The ISR half is
//! [`crate::Kernel::isr_gpio`]: it stamps the event and pushes it onto a
//! lock-free ring, nothing more. The task half is this module: the
//! scheduler runs the handler inline whenever the ingest ring is non-empty
//! (regardless of the handler's own priority or sleep state), and the
//! handler fans each event out to the subscribed tasks, applying each
//! subscription's anti-bounce filter.
//!
//! Subscriptions arrive as ordinary messages with `kind = gpio`: the events
//! bitmask as payload (zero meaning unsubscribe), anti-bounce microseconds
//! in the low 24 bits of `aux` and the pull-down request in bit 24. The
//! first subscription on a pin configures it electrically and that choice
//! sticks -- later subscribers only extend the event mask.

use tandem_abi::{
    kind, GpioEvents, Message, State, TaskId, MAX_MESSAGES, MAX_SUBSCRIPTIONS,
    NUMBER_OF_GPIO_PORTS, RESERVED_GPIO_POWER_SAVE, RESERVED_GPIO_VBUS_DETECT,
};

use crate::api::TaskContext;
use crate::platform::{GpioDir, GpioPull};
use crate::pool::Pool;
use crate::task::Task;

pub(crate) const NAME: &str = "tandem.irq";

/// One task's interest in one pin. Identity for unsubscribe and updates is
/// `(gpio, task, host)` -- the host id is stored explicitly and checked.
struct Subscription {
    gpio: u8,
    task: TaskId,
    host: u8,
    events: GpioEvents,
    anti_bounce_us: u32,
    /// Timestamp of the last event actually forwarded, or `None` before the
    /// first one (the first matching event always goes through).
    last_delivered_at: Option<u64>,
}

/// Per-pin bookkeeping. `pull_down` records the electrical choice made by
/// the pin's first subscriber.
#[derive(Copy, Clone, Default)]
struct GpioState {
    initialized: bool,
    pull_down: bool,
    event_mask: GpioEvents,
}

pub(crate) struct IrqHandler {
    gpios: [GpioState; NUMBER_OF_GPIO_PORTS as usize],
    subs: Pool<Subscription, MAX_SUBSCRIPTIONS>,
}

impl Default for IrqHandler {
    fn default() -> Self {
        Self {
            gpios: [GpioState::default(); NUMBER_OF_GPIO_PORTS as usize],
            subs: Pool::new(),
        }
    }
}

impl Task for IrqHandler {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {
                self.gpios = [GpioState::default(); NUMBER_OF_GPIO_PORTS as usize];
            }
            State::RUN => {
                self.demultiplex(ctx);
                self.maintain_subscriptions(ctx);
            }
            State::STOP => {
                // Leave the pins electrically configured but stop the
                // interrupt traffic.
                for pin in 0..NUMBER_OF_GPIO_PORTS {
                    if self.gpios[usize::from(pin)].initialized {
                        ctx.kernel().platform().gpio_disable_irq(pin);
                    }
                }
            }
            _ => {}
        }
        0
    }
}

impl IrqHandler {
    /// Drains the ISR-ingest ring (bounded per run) and forwards each event
    /// to every subscriber whose mask matches and whose anti-bounce window
    /// has passed.
    fn demultiplex(&mut self, ctx: &TaskContext<'_, '_>) {
        let kernel = ctx.kernel();
        let ingest = kernel.isr_ring();
        let mut budget = MAX_MESSAGES;
        while budget > 0 {
            let Some(event) = ingest.peek() else { break };
            let gpio = event.kind;
            if gpio < NUMBER_OF_GPIO_PORTS {
                let pull_down = self.gpios[usize::from(gpio)].pull_down;
                let bits = GpioEvents::from_bits_truncate(event.payload);
                for (_, sub) in self.subs.iter_mut() {
                    if sub.gpio != gpio || !sub.events.intersects(bits) {
                        continue;
                    }
                    if let Some(last) = sub.last_delivered_at {
                        if event.timestamp <= last + u64::from(sub.anti_bounce_us)
                        {
                            // Bounce; drop silently.
                            continue;
                        }
                    }
                    let delivered = ctx
                        .post_to_host(
                            sub.host,
                            sub.task,
                            gpio,
                            event.payload,
                            u32::from(pull_down),
                        )
                        .is_ok();
                    if delivered {
                        sub.last_delivered_at = Some(event.timestamp);
                    }
                }
            }
            ingest.pop();
            budget -= 1;
        }
    }

    /// Processes subscribe/unsubscribe requests (and PINGs) from the
    /// handler's own mailbox.
    fn maintain_subscriptions(&mut self, ctx: &TaskContext<'_, '_>) {
        let mut budget = MAX_MESSAGES;
        while budget > 0 {
            let Some(msg) = ctx.peek() else { break };
            match msg.kind {
                kind::PING => {
                    let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
                }
                gpio if kind::is_gpio(gpio) => {
                    if msg.payload == 0 {
                        self.unsubscribe(ctx, gpio, &msg);
                    } else {
                        self.subscribe(ctx, gpio, &msg);
                    }
                }
                _ => {}
            }
            ctx.pop();
            budget -= 1;
        }
    }

    fn subscribe(&mut self, ctx: &TaskContext<'_, '_>, gpio: u8, msg: &Message) {
        let kernel = ctx.kernel();
        if self.is_reserved(ctx, gpio) {
            log_error!(
                ctx,
                "subscription to reserved GPIO {gpio} from task {} refused",
                msg.sender_task
            );
            return;
        }

        let events = GpioEvents::from_bits_truncate(msg.payload);
        let anti_bounce_us = msg.aux & tandem_abi::ANTI_BOUNCE_MAX_US;
        let pull_down = msg.aux & 1 << 24 != 0;
        let task = TaskId(msg.sender_task);

        // An existing subscription is updated in place; its anti-bounce
        // history survives.
        let existing = self
            .subs
            .iter_mut()
            .find(|(_, s)| s.gpio == gpio && s.task == task && s.host == msg.sender_host);
        if let Some((_, sub)) = existing {
            sub.events = events;
            sub.anti_bounce_us = anti_bounce_us;
        } else {
            let inserted = self.subs.insert(Subscription {
                gpio,
                task,
                host: msg.sender_host,
                events,
                anti_bounce_us,
                last_delivered_at: None,
            });
            if inserted.is_none() {
                log_error!(
                    ctx,
                    "subscription table full; GPIO {gpio} request from task {} \
                     refused",
                    msg.sender_task
                );
                return;
            }
        }

        let state = &mut self.gpios[usize::from(gpio)];
        if !state.initialized {
            // First subscriber configures the pin; the pull direction it
            // chose is applied once and remembered.
            let platform = kernel.platform();
            platform.gpio_init(gpio);
            platform.gpio_set_dir(gpio, GpioDir::Input);
            platform.gpio_pull(
                gpio,
                if pull_down { GpioPull::Down } else { GpioPull::Up },
            );
            state.pull_down = pull_down;
            state.initialized = true;
        }

        self.refresh_mask(ctx, gpio);
        if ctx.debug_level() >= tandem_abi::DEBUG_LOW {
            log_notify!(
                ctx,
                "task {} (host {}) subscribed to GPIO {gpio}, events {:#x}, \
                 anti-bounce {anti_bounce_us}",
                msg.sender_task,
                msg.sender_host,
                events.bits()
            );
        }
    }

    fn unsubscribe(&mut self, ctx: &TaskContext<'_, '_>, gpio: u8, msg: &Message) {
        if !self.gpios[usize::from(gpio)].initialized {
            // Non-fatal: nothing was ever configured here.
            log_notify!(
                ctx,
                "unsubscribe for uninitialized GPIO {gpio} from task {} ignored",
                msg.sender_task
            );
            return;
        }
        let removed = self.subs.retain(|_, s| {
            !(s.gpio == gpio
                && s.task == TaskId(msg.sender_task)
                && s.host == msg.sender_host)
        });
        if removed == 0 {
            log_notify!(
                ctx,
                "no subscription on GPIO {gpio} for task {}",
                msg.sender_task
            );
            return;
        }
        self.refresh_mask(ctx, gpio);
    }

    /// Recomputes a pin's event mask as the OR of its surviving
    /// subscriptions and reprograms (or disables) the hardware IRQ.
    fn refresh_mask(&mut self, ctx: &TaskContext<'_, '_>, gpio: u8) {
        let mut mask = GpioEvents::empty();
        for (_, sub) in self.subs.iter() {
            if sub.gpio == gpio {
                mask |= sub.events;
            }
        }
        let state = &mut self.gpios[usize::from(gpio)];
        state.event_mask = mask;
        let platform = ctx.kernel().platform();
        if mask.is_empty() {
            platform.gpio_disable_irq(gpio);
        } else {
            platform.gpio_enable_irq(gpio, mask);
        }
    }

    fn is_reserved(&self, ctx: &TaskContext<'_, '_>, gpio: u8) -> bool {
        gpio == RESERVED_GPIO_POWER_SAVE
            || gpio == RESERVED_GPIO_VBUS_DETECT
            || Some(gpio) == ctx.kernel().config().ready_pin
    }
}
