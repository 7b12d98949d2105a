//! Logical request/response unit
//!
//! A [`Message`] wraps the datagram being sent plus the retry and
//! completion bookkeeping the transport needs: assigned sequence numbers,
//! last-transmit timestamp, attempt count, and a first-writer-wins
//! completion slot the reader thread resolves when the correlated
//! response arrives.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::datagram::Datagram;
use super::keyed_lock::LockKey;

static NEXT_MESSAGE_KEY: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh message key. Message keys are odd, keeping them
/// disjoint from the keyed lock's per-thread raw keys.
pub fn next_message_key() -> LockKey {
    NEXT_MESSAGE_KEY.fetch_add(2, Ordering::Relaxed)
}

/// Final outcome of one logical request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The peripheral acknowledged; carries the response payload.
    Success(Vec<u8>),
    /// The peripheral actively rejected the command with this reason.
    Nack(u8),
    /// No correlated response arrived within the caller's deadline.
    Timeout,
    /// The transport could not carry the message (unarmed, disengaged,
    /// or latched in abnormal shutdown). Also used by "pretend finish"
    /// when in-flight commands are drained during a fatal I/O failure.
    TransportUnavailable,
}

/// First-writer-wins completion slot with blocking wait.
#[derive(Debug)]
pub struct Completion {
    slot: Mutex<Option<SendOutcome>>,
    cv: Condvar,
}

impl Completion {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<SendOutcome>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the completion. Returns `false` if it was already
    /// resolved; the first outcome always sticks.
    pub fn complete(&self, outcome: SendOutcome) -> bool {
        let mut slot = self.lock_slot();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.cv.notify_all();
        true
    }

    /// Whether the exchange has finished.
    pub fn is_complete(&self) -> bool {
        self.lock_slot().is_some()
    }

    /// Outcome if already resolved, without blocking.
    pub fn peek(&self) -> Option<SendOutcome> {
        self.lock_slot().clone()
    }

    /// Block until resolved or `timeout` elapses.
    pub fn wait_for(&self, timeout: Duration) -> Option<SendOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock_slot();
        loop {
            if let Some(outcome) = slot.clone() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .cv
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// One in-flight request, owned by the sending module until it completes
/// or is abandoned.
#[derive(Debug)]
pub struct Message {
    key: LockKey,
    datagram: Datagram,
    attempts: AtomicU32,
    last_transmit: Mutex<Option<Instant>>,
    completion: Completion,
}

impl Message {
    /// Wrap a request datagram, assigning a fresh lock key.
    pub fn new(datagram: Datagram) -> Self {
        Self {
            key: next_message_key(),
            datagram,
            attempts: AtomicU32::new(0),
            last_transmit: Mutex::new(None),
            completion: Completion::new(),
        }
    }

    /// Keyed-lock owner identity for this message.
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// The wire unit this message sends.
    pub fn datagram(&self) -> &Datagram {
        &self.datagram
    }

    /// Message sequence number assigned to the request.
    pub fn msg_num(&self) -> u16 {
        self.datagram.msg_num
    }

    /// Completion handle resolved by the reader thread.
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Record a (re)transmission timestamp.
    pub fn mark_transmitted(&self, at: Instant) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        *self
            .last_transmit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Number of times this message has hit the wire.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent transmission, if any.
    pub fn last_transmit(&self) -> Option<Instant> {
        *self
            .last_transmit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
