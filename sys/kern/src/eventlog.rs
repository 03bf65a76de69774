// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The event logger and its line arena.
//!
//! Any task (and the scheduler itself) can emit a formatted line. The text
//! is formatted *at the sender*, into a slot of a fixed arena, and the
//! LOG_NOTIFY / LOG_ERROR message carries only the slot index -- never a
//! memory address. A failed enqueue frees the slot; a successful one
//! transfers ownership to the logger task, which writes the line to the
//! platform sink and frees the slot afterwards.
//!
//! The logger only consumes messages whose `sender_host` matches the local
//! host: a slot index minted on another host would be meaningless here.

use core::cell::UnsafeCell;
use core::fmt::{self, Write as _};
use core::sync::atomic::{AtomicU32, Ordering};

use arrayvec::ArrayString;
use tandem_abi::{kind, Message, State, EVENT_LOG_ENTRY_LENGTH, EVENT_LOG_SLOTS};

use crate::api::TaskContext;
use crate::platform::Severity;
use crate::ring::Mailbox;
use crate::task::Task;

pub(crate) const NAME: &str = "tandem.eventlog";

static_assertions::const_assert!(EVENT_LOG_SLOTS <= 32);
static_assertions::const_assert!(EVENT_LOG_ENTRY_LENGTH <= 255);

const ALL_SLOTS: u32 = if EVENT_LOG_SLOTS == 32 {
    u32::MAX
} else {
    (1 << EVENT_LOG_SLOTS) - 1
};

/// Maximum formatted line text.
pub(crate) type LogText = ArrayString<EVENT_LOG_ENTRY_LENGTH>;

struct LineSlot {
    len: u8,
    bytes: [u8; EVENT_LOG_ENTRY_LENGTH],
}

/// Fixed arena of in-flight log lines.
///
/// Slot ownership is tracked by one bit each in `occupancy`: `acquire` wins
/// a cleared bit with a CAS and confers exclusive access to the slot until
/// `release`. The acquire/release orderings on the bitmap are what hand the
/// slot contents from the sending task to the logger.
pub(crate) struct LineArena {
    occupancy: AtomicU32,
    slots: [UnsafeCell<LineSlot>; EVENT_LOG_SLOTS],
}

// Safety: a slot is only written between `acquire` and the send that
// transfers it, and only read by the logger after receiving the index; the
// occupancy CAS (acquire) and `release` store order those accesses. No two
// holders of the same live index can exist.
unsafe impl Sync for LineArena {}

impl LineArena {
    pub(crate) fn new() -> Self {
        Self {
            occupancy: AtomicU32::new(0),
            slots: core::array::from_fn(|_| {
                UnsafeCell::new(LineSlot {
                    len: 0,
                    bytes: [0; EVENT_LOG_ENTRY_LENGTH],
                })
            }),
        }
    }

    /// Claims a free slot, or `None` when all lines are in flight.
    pub(crate) fn acquire(&self) -> Option<u8> {
        let mut current = self.occupancy.load(Ordering::Relaxed);
        loop {
            let free = !current & ALL_SLOTS;
            if free == 0 {
                return None;
            }
            let bit = free.trailing_zeros();
            match self.occupancy.compare_exchange_weak(
                current,
                current | 1 << bit,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(bit as u8),
                Err(actual) => current = actual,
            }
        }
    }

    /// Stores `text` into a held slot.
    pub(crate) fn write(&self, index: u8, text: &str) {
        debug_assert!(self.is_held(index));
        // Safety: `index` was handed out by `acquire` and not yet released,
        // so we are the only reference to this slot.
        let slot = unsafe { &mut *self.slots[usize::from(index)].get() };
        // Clip on a character boundary so the slot always holds valid UTF-8.
        let mut len = text.len().min(EVENT_LOG_ENTRY_LENGTH);
        while !text.is_char_boundary(len) {
            len -= 1;
        }
        slot.bytes[..len].copy_from_slice(&text.as_bytes()[..len]);
        slot.len = len as u8;
    }

    /// Copies the text out of a held slot.
    pub(crate) fn read(&self, index: u8) -> LogText {
        debug_assert!(self.is_held(index));
        // Safety: as in `write` -- exclusive access between acquire and
        // release.
        let slot = unsafe { &*self.slots[usize::from(index)].get() };
        let mut out = LogText::new();
        if let Ok(text) = core::str::from_utf8(&slot.bytes[..usize::from(slot.len)]) {
            let _ = out.try_push_str(text);
        }
        out
    }

    /// Returns a slot to the free set.
    pub(crate) fn release(&self, index: u8) {
        self.occupancy
            .fetch_and(!(1u32 << index), Ordering::Release);
    }

    pub(crate) fn in_flight(&self) -> u32 {
        (self.occupancy.load(Ordering::Relaxed) & ALL_SLOTS).count_ones()
    }

    fn is_held(&self, index: u8) -> bool {
        usize::from(index) < EVENT_LOG_SLOTS
            && self.occupancy.load(Ordering::Relaxed) & (1 << index) != 0
    }
}

/// Formats `args` into a bounded buffer, silently truncating on overflow
/// (long lines lose their tail, exactly like the original's `vsnprintf`).
pub(crate) fn format_clipped<const N: usize>(args: fmt::Arguments<'_>) -> ArrayString<N> {
    struct Clip<'a, const N: usize>(&'a mut ArrayString<N>);

    impl<const N: usize> fmt::Write for Clip<'_, N> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for ch in s.chars() {
                if self.0.try_push(ch).is_err() {
                    // Full; swallow the rest rather than erroring out of
                    // the whole format.
                    break;
                }
            }
            Ok(())
        }
    }

    let mut buf = ArrayString::new();
    let _ = Clip(&mut buf).write_fmt(args);
    buf
}

/// The event logger task. A regular task: it competes for CPU like everyone
/// else and sleeps when its mailbox runs dry (the postman wakes it).
#[derive(Default)]
pub(crate) struct EventLogger;

impl Task for EventLogger {
    fn step(&mut self, ctx: &mut TaskContext<'_, '_>) -> u8 {
        match ctx.state() {
            State::INIT => {}
            State::RUN | State::STOP => {
                // At STOP this is the final drain; the scheduler stops the
                // logger after everyone else precisely so this still works.
                self.drain(ctx);
            }
            _ => {}
        }
        0
    }
}

impl EventLogger {
    fn drain(&mut self, ctx: &mut TaskContext<'_, '_>) {
        let kernel = ctx.kernel();
        let budget = kernel.inbound(ctx.task_id()).capacity();
        let mut handled = 0;
        while handled < budget {
            let Some(msg) = ctx.peek() else { break };
            match msg.kind {
                kind::PING => {
                    let _ = ctx.reply(&msg, kind::ECHO, msg.payload, 0);
                }
                kind::LOG_NOTIFY | kind::LOG_ERROR => self.emit(ctx, &msg),
                _ => {}
            }
            ctx.pop();
            handled += 1;
        }
        let _ = ctx.sleep_self();
    }

    fn emit(&self, ctx: &TaskContext<'_, '_>, msg: &Message) {
        let kernel = ctx.kernel();
        let severity = if msg.kind == kind::LOG_ERROR {
            Severity::Error
        } else {
            Severity::Notify
        };

        if msg.sender_host != kernel.host_id() {
            // The payload is a slot index in the *sender's* arena; we have
            // no way to resolve it here.
            kernel.sink_line(
                Severity::Error,
                format_args!(
                    "{}: dropping log entry from host {}; \
                     cross-host payloads are not addressable",
                    NAME, msg.sender_host
                ),
            );
            return;
        }

        let index = msg.payload as u8;
        if msg.payload >= EVENT_LOG_SLOTS as u32 {
            return;
        }
        let text = kernel.log_arena().read(index);
        let sender = kernel.task_name(tandem_abi::TaskId(msg.sender_task));
        let line: ArrayString<{ EVENT_LOG_ENTRY_LENGTH + 64 }> = match severity {
            Severity::Error => format_clipped(format_args!(
                "{} {} (ID {}) ERROR: {}",
                msg.timestamp, sender, msg.sender_task, text
            )),
            Severity::Notify => format_clipped(format_args!(
                "{} {} (ID {}): {}",
                msg.timestamp, sender, msg.sender_task, text
            )),
        };
        kernel.platform().log_line(severity, &line);
        kernel.log_arena().release(index);
    }
}
