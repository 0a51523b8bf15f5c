/*!
 * Condition Queue
 *
 * A condition is a secondary, singly-linked queue of threads parked while
 * "holding" the synchronizer, to be resumed on signal. Waiting atomically
 * releases the full saved state, parks on the condition queue, and on
 * signal migrates the node back onto the sync queue to re-acquire with that
 * same saved state. A policy that treats state as a hold count therefore
 * recovers its entire pre-wait depth in one transition.
 *
 * The condition list is only mutated while the synchronizer is held in
 * exclusive mode (enforced through the policy's access check), so the list
 * itself needs no CAS; atomics on the links exist for the benefit of the
 * lock-free instrumentation walks.
 */

use crate::errors::{SyncError, SyncResult};
use crate::node::Node;
use crate::park::ThreadHandle;
use crate::policy::SyncPolicy;
use crate::sync::Synchronizer;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// A wait queue bound to the synchronizer that created it.
///
/// All operations go through the owning synchronizer
/// (`wait`, `signal`, `has_waiters`, ...); passing a condition to any other
/// synchronizer yields `ForeignCondition`.
pub struct Condition {
    owner_id: u64,
    first_waiter: AtomicPtr<Node>,
    last_waiter: AtomicPtr<Node>,
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

/// Marks a condition node CANCELLED if releasing the synchronizer fails or
/// panics, so a later signal skips it and the queue stays consistent.
struct CancelWaiterGuard<'a> {
    node: &'a Node,
    armed: bool,
}

impl Drop for CancelWaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.node.cas_status(Node::CONDITION, Node::CANCELLED);
        }
    }
}

impl<P: SyncPolicy> Synchronizer<P> {
    /// Create a condition bound to this synchronizer.
    pub fn new_condition(&self) -> Condition {
        Condition {
            owner_id: self.id,
            first_waiter: AtomicPtr::new(ptr::null_mut()),
            last_waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether `cond` was created by this synchronizer.
    pub fn owns(&self, cond: &Condition) -> bool {
        cond.owner_id == self.id
    }

    fn check_owned(&self, cond: &Condition) -> SyncResult<()> {
        if self.owns(cond) {
            Ok(())
        } else {
            Err(SyncError::ForeignCondition)
        }
    }

    /// Append a CONDITION node for `current` to the condition list. Caller
    /// holds the synchronizer exclusively.
    fn add_condition_waiter(&self, cond: &Condition, current: &ThreadHandle) -> *mut Node {
        let w = self.arena.alloc(Node::condition_waiter(current.clone()));
        let t = cond.last_waiter.load(Ordering::Acquire);
        if t.is_null() {
            cond.first_waiter.store(w, Ordering::Release);
        } else {
            self.node(t).next_waiter.store(w, Ordering::Release);
        }
        cond.last_waiter.store(w, Ordering::Release);
        w
    }

    /// Release the whole saved state on entry to a wait. If the policy
    /// refuses or panics, the fresh condition node is cancelled before the
    /// failure propagates.
    fn fully_release(&self, node_ptr: *mut Node, saved_state: i64) -> SyncResult<()> {
        let mut guard = CancelWaiterGuard {
            node: self.node(node_ptr),
            armed: true,
        };
        if self.release_exclusive(saved_state) {
            guard.armed = false;
            Ok(())
        } else {
            // Guard cancels the node on drop.
            Err(SyncError::IllegalMonitorState(
                "release refused on entry to condition wait",
            ))
        }
    }

    /// Interruptible condition wait: save state, release fully, park until
    /// signalled onto the sync queue or interrupted, re-acquire with the
    /// saved state.
    pub fn wait(&self, cond: &Condition) -> SyncResult<()> {
        self.check_owned(cond)?;
        let current = ThreadHandle::current();
        self.policy
            .check_condition_access(&self.state, &current, true)?;
        if current.take_interrupt() {
            return Err(SyncError::Interrupted);
        }

        let w = self.add_condition_waiter(cond, &current);
        let saved_state = self.get_state();
        self.fully_release(w, saved_state)?;
        let mut raise_interrupt = false;
        let mut reassert_interrupt = false;

        loop {
            if current.take_interrupt() {
                // The side that wins the CONDITION -> 0 race decides: our
                // cancellation raises, a signal that beat us merely
                // re-asserts after re-acquire.
                if self.transfer_after_cancelled_wait(w) {
                    raise_interrupt = true;
                } else {
                    reassert_interrupt = true;
                }
                break;
            }
            if self.is_on_sync_queue(w) {
                break;
            }
            current.park();
        }

        self.acquire_exclusive_queued(&current, w, saved_state);
        if raise_interrupt {
            return Err(SyncError::Interrupted);
        }
        if reassert_interrupt {
            current.interrupt();
        }
        Ok(())
    }

    /// Condition wait that defers interrupts: any interrupt observed while
    /// waiting is re-asserted on the thread at the very end. `Err` only for
    /// a failed access check or refused release.
    pub fn wait_uninterruptibly(&self, cond: &Condition) -> SyncResult<()> {
        self.check_owned(cond)?;
        let current = ThreadHandle::current();
        self.policy
            .check_condition_access(&self.state, &current, true)?;

        let w = self.add_condition_waiter(cond, &current);
        let saved_state = self.get_state();
        self.fully_release(w, saved_state)?;
        let mut interrupted = false;

        while !self.is_on_sync_queue(w) {
            current.park();
            if current.take_interrupt() {
                interrupted = true;
            }
        }

        self.acquire_exclusive_queued(&current, w, saved_state);
        if interrupted {
            current.interrupt();
        }
        Ok(())
    }

    /// Timed condition wait. Returns the remaining time in nanoseconds,
    /// negative once the timeout has elapsed; a timed-out waiter still
    /// re-acquires before returning.
    pub fn wait_timeout(&self, cond: &Condition, timeout: Duration) -> SyncResult<i64> {
        self.check_owned(cond)?;
        let current = ThreadHandle::current();
        self.policy
            .check_condition_access(&self.state, &current, true)?;
        if current.take_interrupt() {
            return Err(SyncError::Interrupted);
        }

        let w = self.add_condition_waiter(cond, &current);
        let saved_state = self.get_state();
        self.fully_release(w, saved_state)?;
        let deadline = Instant::now() + timeout;
        let mut raise_interrupt = false;
        let mut reassert_interrupt = false;

        loop {
            if current.take_interrupt() {
                if self.transfer_after_cancelled_wait(w) {
                    raise_interrupt = true;
                } else {
                    reassert_interrupt = true;
                }
                break;
            }
            if Instant::now() >= deadline {
                self.transfer_after_cancelled_wait(w);
                break;
            }
            if self.is_on_sync_queue(w) {
                break;
            }
            current.park_deadline(deadline);
        }

        self.acquire_exclusive_queued(&current, w, saved_state);
        if raise_interrupt {
            return Err(SyncError::Interrupted);
        }
        if reassert_interrupt {
            current.interrupt();
        }
        Ok(remaining_nanos(deadline))
    }

    /// Absolute, wall-clock condition wait. `Ok(true)` if signalled before
    /// the deadline, `Ok(false)` if the deadline arrived first.
    pub fn wait_until(&self, cond: &Condition, deadline: SystemTime) -> SyncResult<bool> {
        self.check_owned(cond)?;
        let current = ThreadHandle::current();
        self.policy
            .check_condition_access(&self.state, &current, true)?;
        if current.take_interrupt() {
            return Err(SyncError::Interrupted);
        }

        let w = self.add_condition_waiter(cond, &current);
        let saved_state = self.get_state();
        self.fully_release(w, saved_state)?;
        let mut timed_out = false;
        let mut raise_interrupt = false;
        let mut reassert_interrupt = false;

        loop {
            if current.take_interrupt() {
                if self.transfer_after_cancelled_wait(w) {
                    raise_interrupt = true;
                } else {
                    reassert_interrupt = true;
                }
                break;
            }
            // Re-read the clock each lap so adjustments move the deadline.
            match deadline.duration_since(SystemTime::now()) {
                Ok(remaining) => {
                    if self.is_on_sync_queue(w) {
                        break;
                    }
                    current.park_timeout(remaining);
                }
                Err(_) => {
                    timed_out = self.transfer_after_cancelled_wait(w);
                    break;
                }
            }
        }

        self.acquire_exclusive_queued(&current, w, saved_state);
        if raise_interrupt {
            return Err(SyncError::Interrupted);
        }
        if reassert_interrupt {
            current.interrupt();
        }
        Ok(!timed_out)
    }

    /// Transfer the longest-waiting thread, if one exists, from `cond` to
    /// the sync queue. Signals do not accumulate: with no waiter this is a
    /// no-op.
    pub fn signal(&self, cond: &Condition) -> SyncResult<()> {
        self.check_owned(cond)?;
        self.policy
            .check_condition_access(&self.state, &ThreadHandle::current(), false)?;
        let w = cond.first_waiter.load(Ordering::Acquire);
        if !w.is_null() {
            self.do_signal(cond, w);
        }
        Ok(())
    }

    /// Transfer every waiter from `cond` to the sync queue, tolerating
    /// individually cancelled waiters.
    pub fn signal_all(&self, cond: &Condition) -> SyncResult<()> {
        self.check_owned(cond)?;
        self.policy
            .check_condition_access(&self.state, &ThreadHandle::current(), false)?;
        let w = cond.first_waiter.load(Ordering::Acquire);
        if !w.is_null() {
            self.do_signal_all(cond, w);
        }
        Ok(())
    }

    /// Pop and transfer waiters until one transfer sticks or the list is
    /// empty (cancelled waiters are skipped).
    fn do_signal(&self, cond: &Condition, mut first: *mut Node) {
        loop {
            let next = self.node(first).next_waiter.load(Ordering::Acquire);
            cond.first_waiter.store(next, Ordering::Release);
            if next.is_null() {
                cond.last_waiter.store(ptr::null_mut(), Ordering::Release);
            }
            self.node(first)
                .next_waiter
                .store(ptr::null_mut(), Ordering::Release);

            if self.transfer_for_signal(first) {
                return;
            }
            first = cond.first_waiter.load(Ordering::Acquire);
            if first.is_null() {
                return;
            }
        }
    }

    /// Detach the whole list, then transfer each node.
    fn do_signal_all(&self, cond: &Condition, mut first: *mut Node) {
        cond.first_waiter.store(ptr::null_mut(), Ordering::Release);
        cond.last_waiter.store(ptr::null_mut(), Ordering::Release);
        loop {
            let next = self.node(first).next_waiter.load(Ordering::Acquire);
            self.node(first)
                .next_waiter
                .store(ptr::null_mut(), Ordering::Release);
            self.transfer_for_signal(first);
            if next.is_null() {
                return;
            }
            first = next;
        }
    }

    // Condition instrumentation. Walks are best-effort snapshots over
    // `next_waiter`, counting only nodes still in CONDITION state.

    /// Whether any threads may be waiting on `cond`.
    pub fn has_waiters(&self, cond: &Condition) -> SyncResult<bool> {
        self.check_owned(cond)?;
        self.policy
            .check_condition_access(&self.state, &ThreadHandle::current(), false)?;
        let mut w = cond.first_waiter.load(Ordering::Acquire);
        while !w.is_null() {
            let node = self.node(w);
            if node.status() == Node::CONDITION {
                return Ok(true);
            }
            w = node.next_waiter.load(Ordering::Acquire);
        }
        Ok(false)
    }

    /// Upper-bound estimate of the number of threads waiting on `cond`.
    pub fn wait_queue_length(&self, cond: &Condition) -> SyncResult<usize> {
        self.check_owned(cond)?;
        self.policy
            .check_condition_access(&self.state, &ThreadHandle::current(), false)?;
        let mut n = 0;
        let mut w = cond.first_waiter.load(Ordering::Acquire);
        while !w.is_null() {
            let node = self.node(w);
            if node.status() == Node::CONDITION {
                n += 1;
            }
            w = node.next_waiter.load(Ordering::Acquire);
        }
        Ok(n)
    }

    /// Best-effort snapshot of the threads waiting on `cond`.
    pub fn waiting_threads(&self, cond: &Condition) -> SyncResult<Vec<ThreadHandle>> {
        self.check_owned(cond)?;
        self.policy
            .check_condition_access(&self.state, &ThreadHandle::current(), false)?;
        let mut list = Vec::new();
        let mut w = cond.first_waiter.load(Ordering::Acquire);
        while !w.is_null() {
            let node = self.node(w);
            if node.status() == Node::CONDITION {
                if let Some(t) = node.waiting_thread() {
                    list.push(t);
                }
            }
            w = node.next_waiter.load(Ordering::Acquire);
        }
        Ok(list)
    }
}

/// Signed distance to `deadline` in nanoseconds (negative once passed).
fn remaining_nanos(deadline: Instant) -> i64 {
    let now = Instant::now();
    if now >= deadline {
        -saturating_nanos(now.duration_since(deadline))
    } else {
        saturating_nanos(deadline.duration_since(now))
    }
}

fn saturating_nanos(d: Duration) -> i64 {
    d.as_nanos().min(i64::MAX as u128) as i64
}
