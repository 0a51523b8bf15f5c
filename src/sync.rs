/*!
 * Queued Synchronizer
 *
 * The FIFO wait-queue substrate for locks, latches, semaphores, and other
 * blocking synchronizers. A concrete synchronizer supplies a `SyncPolicy`
 * that interprets the atomic state cell; this module supplies everything
 * else: the lock-free CLH queue, parking, interruption and timeout handling,
 * shared-vs-exclusive modes, and release propagation.
 *
 * # Architecture
 *
 * The queue is a variant of a CLH lock queue: a doubly-linked list whose
 * head is a sentinel installed on first contention. Enqueue is a tail CAS;
 * the predecessor's forward `next` link is assigned after the CAS, so a null
 * `next` never proves a node is last; backward traversal from `tail` via
 * `prev` is the authoritative walk. A thread parks only after recording a
 * wake-up promise in its predecessor's status word (`SIGNAL`), which closes
 * the missed-signal race without serializing state reads.
 *
 * # Fairness
 *
 * The fast path calls the acquire predicate with `queued = false` and may
 * barge ahead of parked waiters; queued retries pass `queued = true`, which
 * lets a policy refuse barging entirely. The result is probabilistically
 * fair: FIFO order among queued retries, open races in the barging window.
 */

use crate::errors::{SyncError, SyncResult};
use crate::node::{AcquireMode, Node, NodeArena};
use crate::park::ThreadHandle;
use crate::policy::SyncPolicy;
use crate::state::StateCell;
use log::trace;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-unique synchronizer id source (condition ownership checks).
static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

/// A queued synchronizer with state interpreted by policy `P`.
///
/// The synchronizer starts with state 0 and an empty queue; the queue's
/// sentinel is installed lazily on first contention. Nodes are arena-backed:
/// they are reclaimed only when the synchronizer is dropped, which keeps
/// every concurrent backward scan safe without hazard pointers.
pub struct Synchronizer<P: SyncPolicy> {
    pub(crate) state: StateCell,
    pub(crate) head: AtomicPtr<Node>,
    pub(crate) tail: AtomicPtr<Node>,
    pub(crate) arena: NodeArena,
    pub(crate) policy: P,
    pub(crate) id: u64,
}

/// Cancels a queued node if the wrapped predicate call panics, so the
/// unwind leaves the queue consistent (cancelled node, woken successor).
struct CancelGuard<'a, P: SyncPolicy> {
    sync: &'a Synchronizer<P>,
    node: *mut Node,
    armed: bool,
}

impl<'a, P: SyncPolicy> CancelGuard<'a, P> {
    fn new(sync: &'a Synchronizer<P>, node: *mut Node) -> Self {
        Self {
            sync,
            node,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<P: SyncPolicy> Drop for CancelGuard<'_, P> {
    fn drop(&mut self) {
        if self.armed {
            self.sync.cancel_acquire(self.node);
        }
    }
}

impl<P: SyncPolicy> Synchronizer<P> {
    /// Create a synchronizer with state 0 and no queue.
    pub fn new(policy: P) -> Self {
        Self {
            state: StateCell::new(0),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            arena: NodeArena::new(),
            policy,
            id: NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The policy this synchronizer was built with.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    // State cell accessors

    /// Current synchronization state (acquire ordering).
    pub fn get_state(&self) -> i64 {
        self.state.get()
    }

    /// Overwrite the synchronization state (release ordering).
    pub fn set_state(&self, new_state: i64) {
        self.state.set(new_state);
    }

    /// CAS on the synchronization state; sequentially consistent on
    /// success.
    pub fn compare_and_set_state(&self, expect: i64, update: i64) -> bool {
        self.state.compare_and_set(expect, update)
    }

    #[inline]
    pub(crate) fn node(&self, p: *mut Node) -> &Node {
        debug_assert!(!p.is_null());
        // Arena-backed: valid for the synchronizer's lifetime.
        unsafe { &*p }
    }

    // Public acquire/release API

    /// Acquire in exclusive mode, ignoring interrupts. Any interrupt that
    /// arrives while parked is re-asserted on the thread before returning.
    pub fn acquire_exclusive(&self, arg: i64) {
        if !self.policy.try_acquire_exclusive(&self.state, false, arg) {
            self.do_acquire_exclusive(arg);
        }
    }

    /// Acquire in exclusive mode, aborting with `Interrupted` if the
    /// thread is interrupted before or during the wait.
    pub fn acquire_exclusive_interruptibly(&self, arg: i64) -> SyncResult<()> {
        if ThreadHandle::current().take_interrupt() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_exclusive(&self.state, false, arg) {
            return Ok(());
        }
        self.do_acquire_exclusive_interruptibly(arg)
    }

    /// Acquire in exclusive mode with a timeout. `Ok(false)` means the
    /// timeout elapsed first.
    pub fn acquire_exclusive_timed(&self, arg: i64, timeout: Duration) -> SyncResult<bool> {
        if ThreadHandle::current().take_interrupt() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_exclusive(&self.state, false, arg) {
            return Ok(true);
        }
        self.do_acquire_exclusive_timed(arg, timeout)
    }

    /// Release in exclusive mode; on "fully released," wakes the first
    /// queued candidate. Returns the policy's verdict.
    pub fn release_exclusive(&self, arg: i64) -> bool {
        if self.policy.try_release_exclusive(&self.state, arg) {
            self.unpark_first();
            return true;
        }
        false
    }

    /// Acquire in shared mode, ignoring interrupts.
    pub fn acquire_shared(&self, arg: i64) {
        if self.policy.try_acquire_shared(&self.state, false, arg) < 0 {
            self.do_acquire_shared(arg);
        }
    }

    /// Acquire in shared mode, aborting with `Interrupted` if the thread
    /// is interrupted before or during the wait.
    pub fn acquire_shared_interruptibly(&self, arg: i64) -> SyncResult<()> {
        if ThreadHandle::current().take_interrupt() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_shared(&self.state, false, arg) >= 0 {
            return Ok(());
        }
        self.do_acquire_shared_interruptibly(arg)
    }

    /// Acquire in shared mode with a timeout. `Ok(false)` means the
    /// timeout elapsed first.
    pub fn acquire_shared_timed(&self, arg: i64, timeout: Duration) -> SyncResult<bool> {
        if ThreadHandle::current().take_interrupt() {
            return Err(SyncError::Interrupted);
        }
        if self.policy.try_acquire_shared(&self.state, false, arg) >= 0 {
            return Ok(true);
        }
        self.do_acquire_shared_timed(arg, timeout)
    }

    /// Release in shared mode; on "fully released," wakes the first queued
    /// candidate. Returns the policy's verdict.
    pub fn release_shared(&self, arg: i64) -> bool {
        if self.policy.try_release_shared(&self.state, arg) {
            self.unpark_first();
            return true;
        }
        false
    }

    // Queuing utilities

    /// Append `node_ptr` to the queue, installing the sentinel first if the
    /// queue has never seen contention.
    pub(crate) fn enq(&self, node_ptr: *mut Node) {
        let node = self.node(node_ptr);
        loop {
            let t = self.tail.load(Ordering::Acquire);
            if t.is_null() {
                self.initialize_queue(node_ptr);
                return;
            }
            // prev must be valid before the CAS publishes the node.
            node.prev.store(t, Ordering::Release);
            if self
                .tail
                .compare_exchange(t, node_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // next assignment lags the CAS; readers fall back to the
                // backward scan when they see null.
                self.node(t).next.store(node_ptr, Ordering::Release);
                return;
            }
        }
    }

    /// Install the sentinel and append `node_ptr` as the first real waiter.
    fn initialize_queue(&self, node_ptr: *mut Node) {
        let node = self.node(node_ptr);
        loop {
            let mut t = self.tail.load(Ordering::Acquire);
            if t.is_null() {
                let sentinel = self.arena.alloc(Node::sentinel());
                if self
                    .head
                    .compare_exchange(
                        ptr::null_mut(),
                        sentinel,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    trace!("sync queue initialized");
                    self.tail.store(sentinel, Ordering::Release);
                    t = sentinel;
                } else {
                    t = self.tail.load(Ordering::Acquire);
                }
            }
            if !t.is_null() {
                node.prev.store(t, Ordering::Release);
                if self
                    .tail
                    .compare_exchange(t, node_ptr, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.node(t).next.store(node_ptr, Ordering::Release);
                    return;
                }
            }
            // Initialization races can retry unboundedly; yield between
            // attempts.
            std::thread::yield_now();
        }
    }

    /// Allocate and enqueue a node for `current`.
    fn add_waiter(&self, current: &ThreadHandle, mode: AcquireMode) -> *mut Node {
        let node = self.arena.alloc(Node::waiter(current.clone(), mode));
        self.enq(node);
        node
    }

    /// Locate `node_ptr`'s closest live successor by scanning backward from
    /// tail. Tolerates in-flight enqueues and cancelled nodes.
    fn find_successor_from_tail(&self, node_ptr: *mut Node) -> *mut Node {
        let mut s = self.tail.load(Ordering::Acquire);
        if s.is_null() || s == node_ptr {
            return ptr::null_mut();
        }
        let mut p = self.node(s).prev.load(Ordering::Acquire);
        loop {
            if p.is_null() || p == node_ptr {
                return s;
            }
            if !self.node(p).is_cancelled() {
                s = p;
            }
            p = self.node(p).prev.load(Ordering::Acquire);
        }
    }

    /// Install `node_ptr` as head after a successful queued acquire and
    /// scrub the fields the queue no longer needs.
    fn set_head(&self, pred_ptr: *mut Node, node_ptr: *mut Node) {
        self.head.store(node_ptr, Ordering::Release);
        self.node(pred_ptr).next.store(ptr::null_mut(), Ordering::Release);
        let node = self.node(node_ptr);
        node.clear_waiter();
        node.prev.store(ptr::null_mut(), Ordering::Release);
    }

    // Blocking support

    /// Wake `node_ptr`'s successor, if one exists.
    ///
    /// The SIGNAL promise is reset first so a holder that barged and later
    /// releases can re-promise; the CAS is a heuristic and may legitimately
    /// fail (the node can already be CANCELLED).
    pub(crate) fn unpark_successor(&self, node_ptr: *mut Node) {
        let node = self.node(node_ptr);
        node.cas_status(Node::SIGNAL, 0);

        let s = node.next.load(Ordering::Acquire);
        let target = if !s.is_null() && !self.node(s).is_cancelled() {
            s
        } else {
            self.find_successor_from_tail(node_ptr)
        };
        if !target.is_null() {
            self.node(target).unpark_waiter();
        }
    }

    /// Wake the first waiting thread if one exists and needs signalling.
    fn unpark_first(&self) {
        let h = self.head.load(Ordering::Acquire);
        if !h.is_null() && self.node(h).status() < 0 {
            self.unpark_successor(h);
        }
    }

    // Utilities shared by the acquire variants

    /// Abandon an ongoing acquire: mark the node CANCELLED (absorbing),
    /// clear its thread, and wake the successor so it can re-evaluate and
    /// re-link.
    pub(crate) fn cancel_acquire(&self, node_ptr: *mut Node) {
        let node = self.node(node_ptr);
        node.clear_waiter();
        loop {
            let s = node.status();
            if node.cas_status(s, Node::CANCELLED) {
                break;
            }
        }
        trace!("queued acquire cancelled");
        self.unpark_successor(node_ptr);
    }

    /// Decide whether a thread that just failed a queued acquire attempt
    /// should park:
    ///
    /// - predecessor SIGNAL: park now, a wake is promised;
    /// - predecessor CANCELLED: splice past it and retry;
    /// - otherwise: record the SIGNAL promise and retry the acquire once
    ///   more before parking (the predecessor may have released meanwhile).
    fn should_park_after_failed_acquire(&self, node_ptr: *mut Node) -> bool {
        let node = self.node(node_ptr);
        let pred = self.node(node.prev.load(Ordering::Acquire));
        let s = pred.status();
        if s == Node::SIGNAL {
            return true;
        }
        if s == Node::CANCELLED {
            node.prev
                .store(pred.prev.load(Ordering::Acquire), Ordering::Release);
        } else {
            pred.cas_status(0, Node::SIGNAL);
        }
        false
    }

    /// Exclusive acquire attempt for a queued node: only meaningful at the
    /// head; installs the node as head on success. A panicking predicate
    /// cancels the node before the unwind continues.
    fn try_acquire_exclusive_queued(&self, node_ptr: *mut Node, arg: i64) -> bool {
        let pred = self.node(node_ptr).prev.load(Ordering::Acquire);
        if pred != self.head.load(Ordering::Acquire) {
            return false;
        }
        let guard = CancelGuard::new(self, node_ptr);
        let acquired = self.policy.try_acquire_exclusive(&self.state, true, arg);
        guard.disarm();
        if !acquired {
            return false;
        }
        self.set_head(pred, node_ptr);
        true
    }

    /// Shared acquire attempt for a queued node; on success with a positive
    /// cascade, wakes the next waiter regardless of its mode (a spurious
    /// wake re-parks harmlessly).
    fn try_acquire_shared_queued(&self, node_ptr: *mut Node, arg: i64) -> bool {
        let pred = self.node(node_ptr).prev.load(Ordering::Acquire);
        if pred != self.head.load(Ordering::Acquire) {
            return false;
        }
        let guard = CancelGuard::new(self, node_ptr);
        let cascade = self.policy.try_acquire_shared(&self.state, true, arg);
        guard.disarm();
        if cascade < 0 {
            return false;
        }
        self.set_head(pred, node_ptr);
        if cascade > 0 && self.node(node_ptr).status() < 0 {
            self.unpark_successor(node_ptr);
        }
        true
    }

    // The acquire variants: exclusive/shared x uninterruptible /
    // interruptible / timed, all built from one skeleton.

    /// Uninterruptible queued acquire; also the re-acquire path for
    /// condition waits (which enter with an already-enqueued node).
    pub(crate) fn acquire_exclusive_queued(
        &self,
        current: &ThreadHandle,
        node_ptr: *mut Node,
        arg: i64,
    ) {
        let mut interrupted = false;
        while !self.try_acquire_exclusive_queued(node_ptr, arg) {
            if self.should_park_after_failed_acquire(node_ptr) {
                current.park();
                if current.take_interrupt() {
                    interrupted = true;
                }
            }
        }
        if interrupted {
            // Not our interrupt to swallow; leave it observable.
            current.interrupt();
        }
    }

    fn do_acquire_exclusive(&self, arg: i64) {
        let current = ThreadHandle::current();
        let node = self.add_waiter(&current, AcquireMode::Exclusive);
        self.acquire_exclusive_queued(&current, node, arg);
    }

    fn do_acquire_exclusive_interruptibly(&self, arg: i64) -> SyncResult<()> {
        let current = ThreadHandle::current();
        let node = self.add_waiter(&current, AcquireMode::Exclusive);
        while !self.try_acquire_exclusive_queued(node, arg) {
            if self.should_park_after_failed_acquire(node) {
                current.park();
                if current.take_interrupt() {
                    self.cancel_acquire(node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
        Ok(())
    }

    fn do_acquire_exclusive_timed(&self, arg: i64, timeout: Duration) -> SyncResult<bool> {
        let deadline = Instant::now() + timeout;
        let current = ThreadHandle::current();
        let node = self.add_waiter(&current, AcquireMode::Exclusive);
        while !self.try_acquire_exclusive_queued(node, arg) {
            if self.should_park_after_failed_acquire(node) {
                if Instant::now() >= deadline {
                    self.cancel_acquire(node);
                    return Ok(false);
                }
                current.park_deadline(deadline);
                if current.take_interrupt() {
                    self.cancel_acquire(node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
        Ok(true)
    }

    fn do_acquire_shared(&self, arg: i64) {
        let current = ThreadHandle::current();
        let node = self.add_waiter(&current, AcquireMode::Shared);
        let mut interrupted = false;
        while !self.try_acquire_shared_queued(node, arg) {
            if self.should_park_after_failed_acquire(node) {
                current.park();
                if current.take_interrupt() {
                    interrupted = true;
                }
            }
        }
        if interrupted {
            current.interrupt();
        }
    }

    fn do_acquire_shared_interruptibly(&self, arg: i64) -> SyncResult<()> {
        let current = ThreadHandle::current();
        let node = self.add_waiter(&current, AcquireMode::Shared);
        while !self.try_acquire_shared_queued(node, arg) {
            if self.should_park_after_failed_acquire(node) {
                current.park();
                if current.take_interrupt() {
                    self.cancel_acquire(node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
        Ok(())
    }

    fn do_acquire_shared_timed(&self, arg: i64, timeout: Duration) -> SyncResult<bool> {
        let deadline = Instant::now() + timeout;
        let current = ThreadHandle::current();
        let node = self.add_waiter(&current, AcquireMode::Shared);
        while !self.try_acquire_shared_queued(node, arg) {
            if self.should_park_after_failed_acquire(node) {
                if Instant::now() >= deadline {
                    self.cancel_acquire(node);
                    return Ok(false);
                }
                current.park_deadline(deadline);
                if current.take_interrupt() {
                    self.cancel_acquire(node);
                    return Err(SyncError::Interrupted);
                }
            }
        }
        Ok(true)
    }

    // Instrumentation and monitoring. All walks are best-effort snapshots:
    // they never serialize with acquirers and may return stale (but never
    // unsafe) results.

    /// Whether any threads may be waiting to acquire. A true return does
    /// not guarantee any thread will ever acquire (cancellation can occur
    /// at any time).
    pub fn has_queued_threads(&self) -> bool {
        self.head.load(Ordering::Acquire) != self.tail.load(Ordering::Acquire)
    }

    /// Estimated number of threads waiting to acquire.
    pub fn queue_length(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let mut n = 0;
        let mut p = self.tail.load(Ordering::Acquire);
        while !p.is_null() && p != head {
            n += 1;
            p = self.node(p).prev.load(Ordering::Acquire);
        }
        n
    }

    /// Best-effort snapshot of the threads waiting to acquire, in no
    /// particular order.
    pub fn queued_threads(&self) -> Vec<ThreadHandle> {
        self.collect_queued(|_| true)
    }

    /// As `queued_threads`, filtered by acquire mode.
    pub fn queued_threads_in(&self, mode: AcquireMode) -> Vec<ThreadHandle> {
        self.collect_queued(|node| node.mode == mode)
    }

    fn collect_queued(&self, keep: impl Fn(&Node) -> bool) -> Vec<ThreadHandle> {
        let mut list = Vec::new();
        let mut p = self.tail.load(Ordering::Acquire);
        while !p.is_null() {
            let node = self.node(p);
            if keep(node) {
                if let Some(t) = node.waiting_thread() {
                    list.push(t);
                }
            }
            p = node.prev.load(Ordering::Acquire);
        }
        list
    }

    // Support for condition waits

    /// Whether a node that started on a condition queue has been
    /// transferred to the sync queue.
    pub(crate) fn is_on_sync_queue(&self, node_ptr: *mut Node) -> bool {
        let node = self.node(node_ptr);
        if node.status() == Node::CONDITION || node.prev.load(Ordering::Acquire).is_null() {
            return false;
        }
        if !node.next.load(Ordering::Acquire).is_null() {
            // Has a successor, so it must be on the queue.
            return true;
        }
        // prev can be set while the tail CAS has still failed; confirm by
        // walking back from tail. The node is almost always near the tail,
        // so this rarely traverses far.
        let mut t = self.tail.load(Ordering::Acquire);
        loop {
            if t == node_ptr {
                return true;
            }
            if t.is_null() {
                return false;
            }
            t = self.node(t).prev.load(Ordering::Acquire);
        }
    }

    /// Move a node from a condition queue onto the sync queue. False means
    /// the waiter cancelled itself before the signal.
    pub(crate) fn transfer_for_signal(&self, node_ptr: *mut Node) -> bool {
        let node = self.node(node_ptr);
        if !node.cas_status(Node::CONDITION, 0) {
            return false;
        }

        // Splice onto the sync queue and promise the wake through the
        // predecessor. If the predecessor is cancelled or refuses the
        // promise, wake the thread directly so it re-checks and re-links;
        // a transiently wrong status is harmless.
        self.enq(node_ptr);
        let pred = self.node(node.prev.load(Ordering::Acquire));
        let c = pred.status();
        if c == Node::CANCELLED || !pred.cas_status(c, Node::SIGNAL) {
            trace!("condition transfer bypassing predecessor promise");
            node.unpark_waiter();
        }
        true
    }

    /// Enqueue a condition node after its wait was cancelled (interrupt or
    /// timeout). True means the cancellation beat any signal; false means a
    /// signal won the status CAS, in which case this waits out the signal's
    /// in-flight enqueue by yielding (the only spin in the design).
    pub(crate) fn transfer_after_cancelled_wait(&self, node_ptr: *mut Node) -> bool {
        let node = self.node(node_ptr);
        if node.cas_status(Node::CONDITION, 0) {
            self.enq(node_ptr);
            return true;
        }
        while !self.is_on_sync_queue(node_ptr) {
            std::thread::yield_now();
        }
        false
    }
}
