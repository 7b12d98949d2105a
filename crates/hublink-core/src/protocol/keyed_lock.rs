//! Message-keyed bus lock
//!
//! A re-entrant mutual-exclusion primitive whose owner identity is an
//! application-level key (a message, not a thread). The RS485 bus has no
//! collision arbitration, so at most one request may be awaiting a reply
//! at any instant; this lock serializes the whole transmit-and-await
//! exchange.
//!
//! Waiters are served in arrival order, so a starved canceller (for
//! example an emergency shutdown) eventually gets in. A waiter that has
//! waited past the maximum hold duration since the current owner acquired
//! force-clears ownership rather than deadlocking; that is a safety valve
//! against a wedged owner, logged loudly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, warn};

/// Owner identity for the keyed lock.
///
/// Message keys are odd and raw per-thread keys are even, so the two
/// ranges can never collide.
pub type LockKey = u64;

static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(2);

thread_local! {
    static THREAD_KEY: LockKey = NEXT_THREAD_KEY.fetch_add(2, Ordering::Relaxed);
}

fn thread_key() -> LockKey {
    THREAD_KEY.with(|k| *k)
}

/// Default maximum time one owner may hold the lock before a waiter is
/// allowed to force it free.
pub const DEFAULT_MAX_HOLD: Duration = Duration::from_secs(5);

struct LockState {
    owner: Option<LockKey>,
    hold_count: u32,
    acquired_at: Option<Instant>,
    queue: VecDeque<LockKey>,
    hung: bool,
}

/// Re-entrant, fair, key-owned lock with a one-way "hang everything" mode.
pub struct MessageKeyedLock {
    state: Mutex<LockState>,
    cv: Condvar,
    max_hold: Duration,
}

impl MessageKeyedLock {
    /// Create a lock with the default maximum hold duration.
    pub fn new() -> Self {
        Self::with_max_hold(DEFAULT_MAX_HOLD)
    }

    /// Create a lock with an explicit maximum hold duration.
    pub fn with_max_hold(max_hold: Duration) -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                hold_count: 0,
                acquired_at: None,
                queue: VecDeque::new(),
                hung: false,
            }),
            cv: Condvar::new(),
            max_hold,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock for `key`, blocking until it is free or already
    /// owned recursively by `key`.
    ///
    /// Once [`hang_all_future_acquisitions`](Self::hang_all_future_acquisitions)
    /// has been called this blocks forever.
    pub fn acquire(&self, key: LockKey) {
        let acquired = self.acquire_inner(key, None);
        debug_assert!(acquired);
    }

    /// Acquire with a deadline. Returns `false` if the lock could not be
    /// acquired within `timeout` (the waiter withdraws from the queue).
    pub fn try_acquire_for(&self, key: LockKey, timeout: Duration) -> bool {
        self.acquire_inner(key, Some(Instant::now() + timeout))
    }

    fn acquire_inner(&self, key: LockKey, deadline: Option<Instant>) -> bool {
        let mut st = self.lock_state();

        if !st.hung && st.owner == Some(key) {
            // Reentrant acquire: count only, the acquisition timestamp
            // keeps its original value.
            st.hold_count += 1;
            return true;
        }

        st.queue.push_back(key);
        loop {
            if st.hung {
                // One-way fatal mode: park forever, even past a deadline.
                st = self
                    .cv
                    .wait_timeout(st, Duration::from_secs(3600))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            if st.owner.is_none() && st.queue.front() == Some(&key) {
                st.queue.pop_front();
                st.owner = Some(key);
                st.hold_count = 1;
                st.acquired_at = Some(Instant::now());
                return true;
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    if let Some(pos) = st.queue.iter().position(|k| *k == key) {
                        st.queue.remove(pos);
                    }
                    return false;
                }
            }

            // Stale-owner override: only the frontmost waiter evicts, and
            // only once the owner has held past max_hold.
            if let (Some(owner), Some(at)) = (st.owner, st.acquired_at) {
                if st.queue.front() == Some(&key) && at.elapsed() >= self.max_hold {
                    error!(
                        owner,
                        held_ms = at.elapsed().as_millis() as u64,
                        "lock owner exceeded maximum hold; forcing ownership clear"
                    );
                    st.owner = None;
                    st.hold_count = 0;
                    st.acquired_at = None;
                    continue;
                }
            }

            let wait = self.next_wait(&st, deadline);
            st = self
                .cv
                .wait_timeout(st, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// How long to sleep before re-checking staleness or the deadline.
    fn next_wait(&self, st: &LockState, deadline: Option<Instant>) -> Duration {
        let now = Instant::now();
        let mut wait = Duration::from_millis(250);
        if let Some(at) = st.acquired_at {
            let stale_at = at + self.max_hold;
            if stale_at > now {
                wait = wait.min(stale_at - now);
            } else {
                wait = Duration::from_millis(1);
            }
        }
        if let Some(d) = deadline {
            if d > now {
                wait = wait.min(d - now);
            } else {
                wait = Duration::from_millis(1);
            }
        }
        wait
    }

    /// Release one hold for `key`.
    ///
    /// Releasing when not the owner logs an error and is otherwise a
    /// no-op; it never panics.
    pub fn release(&self, key: LockKey) {
        let mut st = self.lock_state();
        if st.owner != Some(key) {
            error!(key, owner = ?st.owner, "keyed lock released by non-owner; ignoring");
            return;
        }
        st.hold_count = st.hold_count.saturating_sub(1);
        if st.hold_count == 0 {
            st.owner = None;
            st.acquired_at = None;
            self.cv.notify_all();
        }
    }

    /// One-way switch: every subsequent acquisition (including from the
    /// calling thread) blocks forever. Used only during fatal shutdown to
    /// guarantee no further bus traffic for the remaining process
    /// lifetime.
    pub fn hang_all_future_acquisitions(&self) {
        let mut st = self.lock_state();
        if !st.hung {
            warn!("keyed lock entering permanent hang mode; all future acquisitions will block");
            st.hung = true;
        }
    }

    /// Raw, non-keyed lock for callers that need exclusive bus access
    /// without message-identity semantics. Keyed per calling thread, so
    /// it is re-entrant within a thread and must be paired with
    /// [`unsynchronize_from`](Self::unsynchronize_from) on the same thread.
    pub fn synchronize_to(&self) {
        self.acquire(thread_key());
    }

    /// Release a hold taken by [`synchronize_to`](Self::synchronize_to).
    pub fn unsynchronize_from(&self) {
        self.release(thread_key());
    }

    /// Current owner, if any. Diagnostic only.
    pub fn owner(&self) -> Option<LockKey> {
        self.lock_state().owner
    }
}

impl Default for MessageKeyedLock {
    fn default() -> Self {
        Self::new()
    }
}
