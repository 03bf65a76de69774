// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded SPSC rings of message records.
//!
//! This is the single data structure every queue in the system is built on:
//! per-task inbound mailboxes, the per-core outbound staging rings, and the
//! ISR-ingest ring all use it. It is also the *only* data structure in the
//! system that is touched from more than one core at a time, so all of the
//! cross-thread reasoning lives here.
//!
//! # Design goals
//!
//! 1. `no_std`, no heap: storage is inline, capacity is a const parameter.
//! 2. Non-blocking on both sides: a full ring refuses the write, an empty
//!    ring returns nothing. Nobody ever waits on a ring.
//! 3. A consumer may `peek`, process, and only then `pop`, so a record that
//!    was being processed when something went wrong is not silently lost.
//! 4. Code clarity -- circular-buffer implementations attract arithmetical
//!    tricks, and this one uses none of them.
//!
//! # Concurrency
//!
//! Each ring has exactly one producer and one consumer, fixed at design
//! time (see the role table on the `Sync` impl). The producer owns `head`,
//! the consumer owns `tail`, and each side reads the other's index with
//! acquire ordering against the matching release store. One slot is kept
//! empty to distinguish full from empty, so usable capacity is `N - 1`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU16, Ordering};

use tandem_abi::Message;

const EMPTY_MSG: Message = Message {
    sender_host: 0,
    sender_task: 0,
    recipient_host: 0,
    recipient_task: 0,
    kind: 0,
    payload: 0,
    aux: 0,
    timestamp: 0,
};

// A ring needs the sacrificial slot plus at least one usable one, and its
// indices are u16.
static_assertions::const_assert!(tandem_abi::MAX_MESSAGES >= 2);
static_assertions::const_assert!(tandem_abi::EVENT_LOG_QUEUE < u16::MAX as usize);

/// A bounded single-producer/single-consumer ring of `N` message slots, of
/// which `N - 1` are usable.
pub struct MsgRing<const N: usize> {
    /// Index of the next slot to write. Advanced only by the producer.
    head: AtomicU16,
    /// Index of the oldest unread slot. Advanced only by the consumer.
    tail: AtomicU16,
    slots: [UnsafeCell<Message>; N],
}

// Safety: the SPSC role assignment is fixed at design time and enforced by
// construction, not by this type:
//
//   ring                 producer                consumer
//   ----                 --------                --------
//   task inbound         postman task            owning task
//   core outbound        tasks running on core   postman on that core
//   ISR ingest           the GPIO ISR            IRQ handler task
//
// The producer writes a slot strictly before publishing it with a release
// store of `head`; the consumer reads slots only after an acquire load of
// `head`, and never touches a slot at or past `head`. The roles themselves
// are serialized by the scheduler's collision rule (a task never runs on
// both cores at once), so each index genuinely has a single writer.
unsafe impl<const N: usize> Sync for MsgRing<N> {}

impl<const N: usize> MsgRing<N> {
    pub fn new() -> Self {
        Self {
            head: AtomicU16::new(0),
            tail: AtomicU16::new(0),
            slots: core::array::from_fn(|_| UnsafeCell::new(EMPTY_MSG)),
        }
    }

    /// Number of records written but not yet popped.
    pub fn messages_waiting(&self) -> u16 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            N as u16 - tail + head
        }
    }

    /// Number of writes that can currently succeed.
    pub fn slots_available(&self) -> u16 {
        self.capacity() - self.messages_waiting()
    }

    /// Usable capacity: one slot is sacrificed to tell full from empty.
    pub fn capacity(&self) -> u16 {
        N as u16 - 1
    }

    /// Appends a record. Returns `false`, without advancing anything, when
    /// the ring is full. Producer-side operation.
    pub fn write(&self, msg: Message) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let next = Self::advance(head);
        if next == self.tail.load(Ordering::Acquire) {
            return false;
        }
        // Safety: only the producer writes slots, and it writes only at
        // `head`, which the consumer will not read until the release store
        // below makes the slot visible.
        unsafe {
            *self.slots[usize::from(head)].get() = msg;
        }
        self.head.store(next, Ordering::Release);
        true
    }

    /// Copies out the oldest unread record without removing it. Consumer-side
    /// operation; repeated peeks without an intervening `pop` return the same
    /// record.
    pub fn peek(&self) -> Option<Message> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // Safety: the slot at `tail` was published by the producer's release
        // store of `head`, and the producer will not reuse it until `tail`
        // advances past it.
        Some(unsafe { *self.slots[usize::from(tail)].get() })
    }

    /// Removes the oldest unread record. No-op on an empty ring.
    /// Consumer-side operation.
    pub fn pop(&self) {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return;
        }
        self.tail.store(Self::advance(tail), Ordering::Release);
    }

    /// Discards everything currently in the ring. Consumer-side operation.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }

    fn advance(index: u16) -> u16 {
        // This slightly roundabout formulation avoids a hardware divide.
        let next = index + 1;
        if usize::from(next) == N {
            0
        } else {
            next
        }
    }
}

impl<const N: usize> Default for MsgRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity-erased view of a ring, so code can hold mailboxes of different
/// sizes (the event logger's inbound ring is larger than everyone else's)
/// behind one reference type.
pub trait Mailbox: Sync {
    fn messages_waiting(&self) -> u16;
    fn slots_available(&self) -> u16;
    fn capacity(&self) -> u16;
    fn write(&self, msg: Message) -> bool;
    fn peek(&self) -> Option<Message>;
    fn pop(&self);
    fn clear(&self);
}

impl<const N: usize> Mailbox for MsgRing<N> {
    fn messages_waiting(&self) -> u16 {
        MsgRing::messages_waiting(self)
    }
    fn slots_available(&self) -> u16 {
        MsgRing::slots_available(self)
    }
    fn capacity(&self) -> u16 {
        MsgRing::capacity(self)
    }
    fn write(&self, msg: Message) -> bool {
        MsgRing::write(self, msg)
    }
    fn peek(&self) -> Option<Message> {
        MsgRing::peek(self)
    }
    fn pop(&self) {
        MsgRing::pop(self)
    }
    fn clear(&self) {
        MsgRing::clear(self)
    }
}
