// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side [`Platform`] implementations.
//!
//! [`SimPlatform`] is a deterministic simulator: time is a counter the test
//! advances by hand, GPIO operations are recorded, and log lines are
//! captured for assertions. Waits advance the virtual clock instead of
//! blocking, so a scheduler driven sweep-by-sweep makes progress without
//! any real time passing.
//!
//! [`HostPlatform`] is the wall-clock variant used by the demo application
//! and the dual-core tests: real time, real sleeps, stdout/stderr as the
//! log sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tandem_abi::{GpioEvents, NUMBER_OF_GPIO_PORTS};
use tandem_kern::{GpioDir, GpioPull, Platform, Severity};

/// Everything the simulator remembers about one pin.
#[derive(Copy, Clone, Debug, Default)]
pub struct SimPin {
    pub initialized: bool,
    pub dir: Option<GpioDir>,
    pub pull: Option<GpioPull>,
    pub level: bool,
    pub irq_mask: Option<GpioEvents>,
}

/// Deterministic virtual-time platform for tests.
pub struct SimPlatform {
    clock_us: AtomicU64,
    pins: Mutex<[SimPin; NUMBER_OF_GPIO_PORTS as usize]>,
    log: Mutex<Vec<(Severity, String)>>,
}

impl SimPlatform {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Starts the virtual clock at `origin_us` -- useful when a test wants
    /// boot not to coincide with timestamp zero.
    pub fn starting_at(origin_us: u64) -> Self {
        Self {
            clock_us: AtomicU64::new(origin_us),
            pins: Mutex::new([SimPin::default(); NUMBER_OF_GPIO_PORTS as usize]),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, us: u64) {
        self.clock_us.fetch_add(us, Ordering::SeqCst);
    }

    pub fn pin(&self, pin: u8) -> SimPin {
        self.pins.lock().unwrap()[usize::from(pin)]
    }

    /// Snapshot of every captured log line.
    pub fn log_lines(&self) -> Vec<(Severity, String)> {
        self.log.lock().unwrap().clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(sev, _)| *sev == Severity::Error)
            .map(|(_, line)| line.clone())
            .collect()
    }

    /// True if any captured line contains `needle`.
    pub fn logged(&self, needle: &str) -> bool {
        self.log
            .lock()
            .unwrap()
            .iter()
            .any(|(_, line)| line.contains(needle))
    }
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for SimPlatform {
    fn now_us(&self) -> u64 {
        self.clock_us.load(Ordering::SeqCst)
    }

    fn busy_wait_us(&self, us: u64) {
        // Virtual spin: time passes, nothing blocks.
        self.advance(us);
    }

    fn sleep_ms(&self, ms: u32) {
        self.advance(u64::from(ms) * 1_000);
    }

    fn gpio_init(&self, pin: u8) {
        self.pins.lock().unwrap()[usize::from(pin)].initialized = true;
    }

    fn gpio_set_dir(&self, pin: u8, dir: GpioDir) {
        self.pins.lock().unwrap()[usize::from(pin)].dir = Some(dir);
    }

    fn gpio_write(&self, pin: u8, high: bool) {
        self.pins.lock().unwrap()[usize::from(pin)].level = high;
    }

    fn gpio_pull(&self, pin: u8, pull: GpioPull) {
        self.pins.lock().unwrap()[usize::from(pin)].pull = Some(pull);
    }

    fn gpio_enable_irq(&self, pin: u8, mask: GpioEvents) {
        self.pins.lock().unwrap()[usize::from(pin)].irq_mask = Some(mask);
    }

    fn gpio_disable_irq(&self, pin: u8) {
        self.pins.lock().unwrap()[usize::from(pin)].irq_mask = None;
    }

    fn gpio_ack_irq(&self, _pin: u8, _mask: GpioEvents) {}

    fn log_line(&self, severity: Severity, line: &str) {
        self.log.lock().unwrap().push((severity, line.to_string()));
    }
}

/// Wall-clock platform for host demos and thread-based tests.
pub struct HostPlatform {
    origin: Instant,
    pins: Mutex<[SimPin; NUMBER_OF_GPIO_PORTS as usize]>,
    quiet: bool,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            pins: Mutex::new([SimPin::default(); NUMBER_OF_GPIO_PORTS as usize]),
            quiet: false,
        }
    }

    /// Suppresses the log sinks; thread-based tests keep the output clean.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::new()
        }
    }

    pub fn pin(&self, pin: u8) -> SimPin {
        self.pins.lock().unwrap()[usize::from(pin)]
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostPlatform {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn busy_wait_us(&self, us: u64) {
        let until = self.now_us() + us;
        while self.now_us() < until {
            std::hint::spin_loop();
        }
    }

    fn sleep_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn gpio_init(&self, pin: u8) {
        self.pins.lock().unwrap()[usize::from(pin)].initialized = true;
    }

    fn gpio_set_dir(&self, pin: u8, dir: GpioDir) {
        self.pins.lock().unwrap()[usize::from(pin)].dir = Some(dir);
    }

    fn gpio_write(&self, pin: u8, high: bool) {
        self.pins.lock().unwrap()[usize::from(pin)].level = high;
    }

    fn gpio_pull(&self, pin: u8, pull: GpioPull) {
        self.pins.lock().unwrap()[usize::from(pin)].pull = Some(pull);
    }

    fn gpio_enable_irq(&self, pin: u8, mask: GpioEvents) {
        self.pins.lock().unwrap()[usize::from(pin)].irq_mask = Some(mask);
    }

    fn gpio_disable_irq(&self, pin: u8) {
        self.pins.lock().unwrap()[usize::from(pin)].irq_mask = None;
    }

    fn gpio_ack_irq(&self, _pin: u8, _mask: GpioEvents) {}

    fn log_line(&self, severity: Severity, line: &str) {
        if self.quiet {
            return;
        }
        match severity {
            Severity::Notify => println!("{line}"),
            Severity::Error => eprintln!("{line}"),
        }
    }
}
