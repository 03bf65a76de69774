// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the kernel and the board.
//!
//! Everything the kernel needs from the hardware goes through this trait:
//! the monotonic clock, coarse waits, GPIO, and the log sink. A board port
//! implements it on top of its SDK; the test suite and the demo implement it
//! in software. Keeping the seam this narrow is what lets the whole kernel
//! run on a host.
//!
//! Second-core bring-up is deliberately *not* here: the application owns
//! `main`, performs board setup, starts the second core by whatever means
//! the platform offers, and enters a [`crate::Scheduler`] on each core.

use tandem_abi::GpioEvents;

/// Direction of a GPIO pin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GpioDir {
    Input,
    Output,
}

/// Internal resistor selection for an input pin.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GpioPull {
    Up,
    Down,
}

/// Severity of a log line, selecting the sink (the reference implementation
/// splits stdout/stderr; a board port might split UART/ITM).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Severity {
    Notify,
    Error,
}

/// Platform services the kernel relies on.
///
/// # Invariants
///
/// * `now_us` is monotonic, microsecond-granular, and consistent across both
///   cores -- every deadline in the system is an absolute value of this
///   clock.
/// * All methods take `&self` and must tolerate concurrent calls from both
///   cores; `gpio_ack_irq` must additionally be callable from interrupt
///   context.
/// * `sleep_ms` is a coarse, low-power wait; the kernel uses it only before
///   INIT (the startup delay) and in the non-bootstrap core's INIT/STOP
///   polls. `busy_wait_us` is used only for the scheduler's collision
///   back-off and must not yield.
pub trait Platform: Sync {
    /// Monotonic microseconds since boot.
    fn now_us(&self) -> u64;

    /// Spins for approximately `us` microseconds.
    fn busy_wait_us(&self, us: u64);

    /// Coarse wait; may sleep the core.
    fn sleep_ms(&self, ms: u32);

    fn gpio_init(&self, pin: u8);
    fn gpio_set_dir(&self, pin: u8, dir: GpioDir);
    fn gpio_write(&self, pin: u8, high: bool);
    fn gpio_pull(&self, pin: u8, pull: GpioPull);

    /// Routes the given event mask on `pin` to the application-installed
    /// ISR (which is expected to forward into [`crate::Kernel::isr_gpio`]).
    /// Replaces any previous mask for the pin.
    fn gpio_enable_irq(&self, pin: u8, mask: GpioEvents);

    /// Stops IRQ delivery for `pin` entirely.
    fn gpio_disable_irq(&self, pin: u8);

    /// Acknowledges a delivered interrupt. Called from ISR context.
    fn gpio_ack_irq(&self, pin: u8, mask: GpioEvents);

    /// Writes one formatted log line to the board's sink. Lines arrive
    /// already ordered per core and per task, but not globally.
    fn log_line(&self, severity: Severity, line: &str);
}
