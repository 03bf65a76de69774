// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host demo: boots the kernel against the wall-clock platform, runs a
//! scheduler on each of two OS threads (standing in for the two cores), and
//! shuts down cleanly after a few seconds.
//!
//! On a real board this file is the only part that changes: board `main`
//! does hardware setup, builds the kernel the same way, starts the second
//! core through the vendor SDK, and enters `Scheduler::run` on each core.

use tandem_abi::{kind, Priority, State};
use tandem_kern::{
    log_error, log_notify, Kernel, KernelConfig, Scheduler, SystemTasks, Task,
    TaskContext,
};
use tandem_sim::HostPlatform;

/// Message kind the heartbeat timer fires with.
const HEARTBEAT: u8 = kind::APPLICATION_BASE;

const HEARTBEAT_INTERVAL_MS: u32 = 500;
const RUN_FOR_US: u64 = 3_000_000;

/// Logs a line every time its repetitive timer fires.
#[derive(Default)]
struct Heartbeat {
    beats: u32,
}

impl Task for Heartbeat {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {
                if ctx
                    .timer_set(HEARTBEAT, true, HEARTBEAT_INTERVAL_MS)
                    .is_err()
                {
                    log_error!(ctx, "could not register the heartbeat timer");
                    return 1;
                }
            }
            State::RUN => {
                while let Some(msg) = ctx.peek() {
                    match msg.kind {
                        kind::PING => {
                            let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
                        }
                        HEARTBEAT => {
                            self.beats += 1;
                            log_notify!(
                                ctx,
                                "beat {} (timer sequence {})",
                                self.beats,
                                msg.payload
                            );
                        }
                        _ => {}
                    }
                    ctx.pop();
                }
                let _ = ctx.sleep_self();
            }
            State::STOP => {
                log_notify!(ctx, "stopping after {} beats", self.beats);
            }
            _ => {}
        }
        0
    }
}

/// Requests a graceful stop once the demo has run long enough.
#[derive(Default)]
struct Supervisor {
    stop_at: u64,
    requested: bool,
}

impl Task for Supervisor {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {
                self.stop_at = ctx.now_us() + RUN_FOR_US;
            }
            State::RUN => {
                while let Some(msg) = ctx.peek() {
                    if msg.kind == kind::PING {
                        let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
                    }
                    ctx.pop();
                }
                if !self.requested && ctx.now_us() >= self.stop_at {
                    self.requested = true;
                    log_notify!(ctx, "time is up, requesting STOP");
                    let _ = ctx.set_system_state(State::STOP);
                }
            }
            _ => {}
        }
        0
    }
}

fn main() {
    let platform = HostPlatform::new();
    let mut system = SystemTasks::default();
    let mut heartbeat = Heartbeat::default();
    let mut supervisor = Supervisor::default();

    let config = KernelConfig {
        // The reference board waits five seconds for USB serial; a host
        // terminal needs no such courtesy.
        startup_delay_ms: 250,
        ..KernelConfig::default()
    };

    let mut kernel = Kernel::new(&platform, config, &mut system)
        .expect("kernel construction failed");
    kernel
        .register(&mut heartbeat, "heartbeat", Priority::NORMAL)
        .expect("registering heartbeat failed");
    kernel
        .register(&mut supervisor, "supervisor", Priority::LOW)
        .expect("registering supervisor failed");

    // From here on the kernel is shared and immutable; one scheduler per
    // "core". Core 0 bootstraps.
    let kernel = &kernel;
    std::thread::scope(|scope| {
        scope.spawn(move || Scheduler::new(kernel, 1).run());
        Scheduler::new(kernel, 0).run();
    });

    println!("demo: clean shutdown");
}
