// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application tasks.
//!
//! Everything in here is a plain value type: states, priorities, the message
//! record, error codes and the tunable constants. The kernel crate adds
//! behavior; this crate is deliberately inert so that application code can
//! depend on it without dragging in the kernel.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// Maximum number of registered tasks, including the reserved scheduler
/// slot 0. The hard ceiling is 250 because task ids must stay clear of the
/// run-pointer sentinel (0xFF) and a handful of values above it.
pub const MAX_TASKS: usize = 30;

static_assertions::const_assert!(MAX_TASKS <= 250);

/// Number of scheduler instances. One per hardware core.
pub const MAX_CORES: usize = 2;

/// Default capacity of a message ring, in records. Usable capacity is one
/// less (see `MsgRing` in the kernel crate).
pub const MAX_MESSAGES: usize = 25;

/// Capacity of the event logger's inbound ring. The logger receives traffic
/// from every other task, so its mailbox is sized well above the default.
pub const EVENT_LOG_QUEUE: usize = 100;

/// Number of preformatted log lines that can be in flight at once.
pub const EVENT_LOG_SLOTS: usize = 32;

/// Maximum bytes in one formatted log line. Longer lines are truncated.
pub const EVENT_LOG_ENTRY_LENGTH: usize = 150;

/// Maximum length of a task name.
pub const MAX_TASK_NAME_LENGTH: usize = 30;

/// Task names carrying this prefix denote *system tasks*, which get elevated
/// authorization for attribute changes (see the task-manager).
pub const SYSTEM_TASK_PREFIX: &str = "tandem.";

/// Pause before the scheduler starts initializing tasks, to let the board
/// (USB serial in particular) settle.
pub const STARTUP_DELAY_MS: u32 = 5000;

/// Default GPIO used as the ready indicator: driven high while the system is
/// in RUN, low otherwise. 25 is the onboard LED on the reference board.
pub const SYSTEM_READY_PIN: u8 = 25;

/// Number of GPIO ports the IRQ demultiplexer will accept subscriptions for.
pub const NUMBER_OF_GPIO_PORTS: u8 = 29;

/// GPIOs that are never available for subscriptions: board power-save and
/// VBUS detect. The configured ready pin is reserved as well.
pub const RESERVED_GPIO_POWER_SAVE: u8 = 23;
pub const RESERVED_GPIO_VBUS_DETECT: u8 = 24;

/// Interval between watchdog PING rounds, in microseconds.
pub const WATCHDOG_CHECK_INTERVAL_US: u64 = 30_000_000;

/// Round-trip threshold above which a PING/ECHO exchange is reported.
pub const WATCHDOG_TASK_TIMEOUT_US: u64 = 5_000_000;

/// The watchdog's round counter wraps when it reaches this value.
pub const WATCHDOG_MAX_COUNTER: u32 = 50_000;

/// Anti-bounce intervals are carried in the low 24 bits of a subscription
/// request, capping them at about 16.7 seconds.
pub const ANTI_BOUNCE_MAX_US: u32 = 0x00FF_FFFF;

/// Capacity of the software-timer entry arena.
pub const MAX_TIMERS: usize = 32;

/// Capacity of the GPIO subscription arena, across all pins.
pub const MAX_SUBSCRIPTIONS: usize = 32;

/// Per-task debug levels. Anything above `DEBUG_LOW` is chatty.
pub const DEBUG_NONE: u8 = 0;
pub const DEBUG_LOW: u8 = 1;
pub const DEBUG_HIGH: u8 = 2;

/// Names a slot in the task table.
///
/// Task ids are dense in `[0, num_tasks)` and fixed after bootstrap. Id 0 is
/// reserved for the scheduler pseudo-task, which owns no entry function and
/// is never dispatched; it exists so that scheduler-originated log lines have
/// a well-formed sender.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    /// The reserved scheduler pseudo-task.
    pub const SCHEDULER: Self = Self(0);

    /// Extracts the id as a table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Indicates priority of a task.
///
/// A priority is the target interval, in microseconds, between successive
/// invocations of the task -- so numerically *smaller* means *more frequent*,
/// and more important. The scheduler also uses the value as the threshold for
/// its priority cycle.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less frequent, or more important / numerically smaller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Priority(pub u32);

impl Priority {
    pub const HIGH: Self = Self(2_500);
    pub const NORMAL: Self = Self(5_000);
    pub const LOW: Self = Self(10_000);

    /// The re-invocation interval this priority encodes.
    pub fn interval_us(self) -> u32 {
        self.0
    }

    /// Checks whether a task at this priority is eligible during a sweep at
    /// `cycle`: HIGH tasks pass every cycle, NORMAL tasks pass the NORMAL and
    /// LOW cycles, LOW tasks pass only the LOW cycle.
    pub fn eligible_at(self, cycle: Priority) -> bool {
        self.0 <= cycle.0
    }

    /// The next band in the scheduler's rotation HIGH → NORMAL → LOW → HIGH.
    pub fn next_cycle(self) -> Priority {
        match self {
            Self::HIGH => Self::NORMAL,
            Self::NORMAL => Self::LOW,
            _ => Self::HIGH,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// State of a task, or of the system as a whole.
///
/// The four predefined values order the system lifecycle: INIT(3) → RUN(2) →
/// STOP(1) → DOWN(0); the *system* state only ever moves to numerically
/// smaller values, which is what "advances strictly forward" means here.
/// *Task* states may additionally take user-defined values outside the
/// predefined range; the kernel ignores those.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct State(pub u8);

impl State {
    pub const DOWN: Self = Self(0);
    pub const STOP: Self = Self(1);
    pub const RUN: Self = Self(2);
    pub const INIT: Self = Self(3);

    pub fn is_predefined(self) -> bool {
        self.0 <= Self::INIT.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DOWN => f.write_str("DOWN"),
            Self::STOP => f.write_str("STOP"),
            Self::RUN => f.write_str("RUN"),
            Self::INIT => f.write_str("INIT"),
            Self(other) => write!(f, "user({other})"),
        }
    }
}

/// The record exchanged between tasks. Fixed layout, value type.
///
/// `payload` and `aux` are free-form 32-bit words whose meaning is set by
/// `kind`; for task-manager requests `aux` selects the target task, for GPIO
/// notifications it carries the pull-down flag, for timer requests it packs
/// the timer id and repeat flag. Payloads never carry memory addresses; where
/// the original design smuggled pointers, this one uses small arena indices
/// (see the event logger).
///
/// `timestamp` is stamped once, by the originating helper, and preserved
/// verbatim by the postman when the record is copied between rings.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Message {
    pub sender_host: u8,
    pub sender_task: u8,
    pub recipient_host: u8,
    pub recipient_task: u8,
    pub kind: u8,
    pub payload: u32,
    pub aux: u32,
    pub timestamp: u64,
}

/// Message kind values, in three numeric bands: GPIO numbers double as kinds
/// below `NUMBER_OF_GPIO_PORTS`, the system band occupies 50..=99, and
/// application-defined kinds start at `APPLICATION_BASE`.
pub mod kind {
    /// Dummy message, ignored by every system task.
    pub const TEST: u8 = 50;
    /// Liveness probe; the recipient answers with ECHO carrying the payload.
    pub const PING: u8 = 51;
    /// Response to PING.
    pub const ECHO: u8 = 52;

    /// Change the state of the whole system (aka runlevel).
    pub const SET_SYS_STATE: u8 = 53;
    /// Change the state of a task (custom values allowed).
    pub const SET_TASK_STATE: u8 = 54;
    /// Set the priority of a task.
    pub const SET_TASK_PRIORITY: u8 = 55;
    /// Set the sleep flag of a task.
    pub const SET_TASK_SLEEP: u8 = 56;
    /// Set the wake-up time of a task to now + payload microseconds.
    pub const SET_TASK_WAKEUPTIME: u8 = 57;
    /// Set the debug level of a task.
    pub const SET_TASK_DEBUG: u8 = 58;
    /// Wake every sleeping task.
    pub const WAKE_ALL_TASKS: u8 = 59;
    /// Put every non-system task except the target to sleep.
    pub const DEDICATE_TO_TASK: u8 = 60;

    /// Informational log line; payload is a log-arena slot index.
    pub const LOG_NOTIFY: u8 = 61;
    /// Error log line; payload is a log-arena slot index.
    pub const LOG_ERROR: u8 = 62;

    /// Register a timer: payload = interval in ms, aux = timer id | repeat
    /// flag << 8.
    pub const TIMER_SET: u8 = 63;
    /// Cancel every timer of the sender with the timer id in the payload.
    pub const TIMER_CANCEL: u8 = 64;
    /// Cancel exactly the sender's timer with the sequence number in the
    /// payload.
    pub const TIMER_CANCEL_BY_SEQ: u8 = 65;

    /// First kind value available to applications.
    pub const APPLICATION_BASE: u8 = 100;

    /// Kinds below the GPIO port count address the IRQ demultiplexer
    /// (subscription requests) or report "GPIO n fired" (notifications).
    pub fn is_gpio(kind: u8) -> bool {
        kind < crate::NUMBER_OF_GPIO_PORTS
    }

    /// The 50..=99 band reserved for the kernel.
    pub fn is_system(kind: u8) -> bool {
        (50..100).contains(&kind)
    }
}

bitflags::bitflags! {
    /// GPIO interrupt event bits, matching the reference board's IRQ
    /// controller encoding.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct GpioEvents: u32 {
        const LEVEL_LOW = 1 << 0;
        const LEVEL_HIGH = 1 << 1;
        const EDGE_FALL = 1 << 2;
        const EDGE_RISE = 1 << 3;
    }
}

/// Error codes. The numeric values are stable, reserved below 50 so they can
/// never collide with message kinds, and 0 is implicitly "ok" (a task step
/// returns 0 on success).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Error {
    /// Attempt to register more than `MAX_TASKS` tasks, or to register after
    /// the scheduler has started.
    TooManyTasks = 1,
    /// A task returned non-zero during INIT.
    InitializationFailure = 2,
    /// Delivery attempted on a full inbound ring.
    MailboxFull = 3,
    /// Recipient task id out of range.
    InvalidRecipient = 4,
    /// Lookup by name or id missed.
    TaskNotFound = 5,
    /// Operation rejected because the target was sleeping.
    TaskSleeping = 6,
    /// A task returned non-zero during RUN.
    TaskFailed = 7,
    /// Rejected attribute change: failed authorization or unknown request.
    InvalidOperation = 8,
}

impl Error {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<Error> for u8 {
    fn from(e: Error) -> u8 {
        e.code()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::TooManyTasks => "too many tasks",
            Error::InitializationFailure => "initialization failure",
            Error::MailboxFull => "mailbox full",
            Error::InvalidRecipient => "invalid recipient",
            Error::TaskNotFound => "task not found",
            Error::TaskSleeping => "task sleeping",
            Error::TaskFailed => "task failed",
            Error::InvalidOperation => "invalid operation",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bands_are_disjoint() {
        for gpio in 0..NUMBER_OF_GPIO_PORTS {
            assert!(kind::is_gpio(gpio));
            assert!(!kind::is_system(gpio));
        }
        for k in [kind::TEST, kind::PING, kind::TIMER_CANCEL_BY_SEQ] {
            assert!(kind::is_system(k));
            assert!(!kind::is_gpio(k));
        }
        assert!(!kind::is_system(kind::APPLICATION_BASE));
    }

    #[test]
    fn error_codes_stay_below_kind_bands() {
        for e in [
            Error::TooManyTasks,
            Error::InitializationFailure,
            Error::MailboxFull,
            Error::InvalidRecipient,
            Error::TaskNotFound,
            Error::TaskSleeping,
            Error::TaskFailed,
            Error::InvalidOperation,
        ] {
            assert!(e.code() < 50, "error {e} leaked into the kind bands");
        }
    }

    #[test]
    fn priority_cycle_rotation() {
        assert_eq!(Priority::HIGH.next_cycle(), Priority::NORMAL);
        assert_eq!(Priority::NORMAL.next_cycle(), Priority::LOW);
        assert_eq!(Priority::LOW.next_cycle(), Priority::HIGH);

        // HIGH tasks run on every cycle; LOW tasks only on the LOW cycle.
        assert!(Priority::HIGH.eligible_at(Priority::HIGH));
        assert!(Priority::HIGH.eligible_at(Priority::LOW));
        assert!(!Priority::LOW.eligible_at(Priority::HIGH));
        assert!(Priority::LOW.eligible_at(Priority::LOW));
    }

    #[test]
    fn system_state_ordering_is_numeric() {
        assert!(State::INIT.0 > State::RUN.0);
        assert!(State::RUN.0 > State::STOP.0);
        assert!(State::STOP.0 > State::DOWN.0);
    }
}
