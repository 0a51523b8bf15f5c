/*!
 * Thread Parking Primitive
 *
 * Per-thread block/unblock with one-token semantics and an interrupt flag,
 * built on parking_lot's Mutex + Condvar.
 *
 * # Design: Per-Thread Token Over Keyed Parking
 *
 * The wait queue needs to wake one *specific* thread (the successor of the
 * releasing node), so parking is keyed by thread identity rather than by a
 * hashed address. Each thread owns a token word with three states:
 *
 * - `EMPTY`: no token, no parked thread
 * - `PARKED`: the owner is blocked on the condvar
 * - `NOTIFIED`: a token is available; the next park returns immediately
 *
 * `unpark` before `park` makes the next `park` return without blocking, and
 * tokens never accumulate beyond one. Spurious wakeups are permitted; all
 * waiting loops in this crate re-check their predicate after `park` returns.
 *
 * # Interruption
 *
 * Interruption is a per-thread cancellation token that `park` observes:
 * `interrupt` sets the flag and wakes the thread from any park without
 * granting a token. The acquire and condition engines consume the flag with
 * `take_interrupt` and decide whether to cancel, raise, or re-assert.
 */

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token word: no token present, owner not blocked
const EMPTY: usize = 0;
/// Token word: owner is blocked on the condvar
const PARKED: usize = 1;
/// Token word: a wake token is available
const NOTIFIED: usize = 2;

/// Process-unique thread id source (never recycled)
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadHandle = ThreadHandle::register();
}

/// Shared parker state. Nodes keep a raw pointer to this; the owning
/// `ThreadHandle` clone stored in the node pins the allocation, so a
/// non-null pointer loaded from a node is always safe to dereference.
pub(crate) struct ParkCore {
    id: u64,
    token: AtomicUsize,
    interrupted: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ParkCore {
    fn new() -> Self {
        Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            token: AtomicUsize::new(EMPTY),
            interrupted: AtomicBool::new(false),
            lock: Mutex::new(()),
            cvar: Condvar::new(),
        }
    }

    /// Block until a token is consumed, the deadline passes, an interrupt
    /// arrives, or a spurious wake. Only the owning thread may call this.
    pub(crate) fn park(&self, deadline: Option<Instant>) {
        // Fast path: consume a token granted before we got here.
        if self
            .token
            .compare_exchange(NOTIFIED, EMPTY, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
        // A pending interrupt makes park return immediately.
        if self.interrupted.load(Ordering::Acquire) {
            return;
        }

        let mut guard = self.lock.lock();
        if self
            .token
            .compare_exchange(EMPTY, PARKED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Token arrived between the fast path and taking the lock.
            self.token.store(EMPTY, Ordering::SeqCst);
            return;
        }

        loop {
            if self.interrupted.load(Ordering::Acquire) {
                break;
            }
            let timed_out = match deadline {
                Some(d) => {
                    if Instant::now() >= d {
                        true
                    } else {
                        self.cvar.wait_until(&mut guard, d).timed_out()
                    }
                }
                None => {
                    self.cvar.wait(&mut guard);
                    false
                }
            };
            if timed_out || self.token.load(Ordering::SeqCst) == NOTIFIED {
                break;
            }
        }
        // Consume the token if one arrived, and leave the word EMPTY either
        // way. A token swallowed by an interrupt/timeout exit is harmless:
        // every waiter re-checks its predicate before parking again.
        self.token.swap(EMPTY, Ordering::SeqCst);
        drop(guard);
    }

    /// Make a token available and wake the owner if it is parked.
    pub(crate) fn unpark(&self) {
        if self.token.swap(NOTIFIED, Ordering::SeqCst) == PARKED {
            // Briefly take the lock so the notify cannot slip between the
            // owner's token check and its condvar wait.
            drop(self.lock.lock());
            self.cvar.notify_one();
        }
    }

    /// Set the interrupt flag and wake the owner from any park. No token is
    /// granted.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        drop(self.lock.lock());
        self.cvar.notify_one();
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Test-and-clear the interrupt flag.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

/// Handle to one thread's parker and interrupt token.
///
/// Clones share the same underlying parker; a handle may be stored and used
/// (`unpark`, `interrupt`, identity) from any thread, but `park` and its
/// timed variants must only be called by the owning thread.
#[derive(Clone)]
pub struct ThreadHandle {
    core: Arc<ParkCore>,
}

impl ThreadHandle {
    fn register() -> Self {
        Self {
            core: Arc::new(ParkCore::new()),
        }
    }

    /// The calling thread's handle (created on first use).
    pub fn current() -> Self {
        CURRENT.with(|h| h.clone())
    }

    /// Process-unique id of the owning thread.
    #[inline]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Block until `unpark`, interrupt, or spurious wake; consumes a
    /// pending token immediately.
    pub fn park(&self) {
        self.core.park(None);
    }

    /// As `park`, returning no later than approximately `timeout` from now.
    pub fn park_timeout(&self, timeout: Duration) {
        self.core.park(Some(Instant::now() + timeout));
    }

    /// As `park`, returning no later than approximately `deadline`.
    pub fn park_deadline(&self, deadline: Instant) {
        self.core.park(Some(deadline));
    }

    /// Make the token available; wakes the owner if parked. Tokens do not
    /// accumulate beyond one.
    pub fn unpark(&self) {
        self.core.unpark();
    }

    /// Interrupt the owning thread: sets the flag and wakes it from any
    /// park or condition wait.
    pub fn interrupt(&self) {
        self.core.interrupt();
    }

    /// Whether the interrupt flag is set (does not clear it).
    pub fn is_interrupted(&self) -> bool {
        self.core.is_interrupted()
    }

    /// Test-and-clear the interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.core.take_interrupt()
    }

    /// Raw pointer to the parker for storage in queue nodes. Valid for as
    /// long as any clone of this handle is alive.
    pub(crate) fn park_ptr(&self) -> *mut ParkCore {
        Arc::as_ptr(&self.core) as *mut ParkCore
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.core.id)
            .field("interrupted", &self.core.is_interrupted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_unpark_before_park_returns_immediately() {
        let h = ThreadHandle::current();
        h.unpark();

        let start = Instant::now();
        h.park();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_tokens_do_not_accumulate() {
        let h = ThreadHandle::current();
        h.unpark();
        h.unpark();

        // First park consumes the single token, second one must block until
        // its deadline.
        h.park();
        let start = Instant::now();
        h.park_timeout(Duration::from_millis(50));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_unpark_wakes_parked_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let me = ThreadHandle::current();
            tx.send(me.clone()).unwrap();
            let start = Instant::now();
            me.park();
            start.elapsed()
        });

        let remote = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        remote.unpark();

        let elapsed = handle.join().unwrap();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_interrupt_wakes_parked_thread_without_token() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let me = ThreadHandle::current();
            tx.send(me.clone()).unwrap();
            me.park();
            let was_interrupted = me.take_interrupt();
            // The interrupt granted no token, so this park must block until
            // its deadline.
            let start = Instant::now();
            me.park_timeout(Duration::from_millis(50));
            (was_interrupted, start.elapsed())
        });

        let remote = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        remote.interrupt();

        let (was_interrupted, second_park) = handle.join().unwrap();
        assert!(was_interrupted);
        assert!(second_park >= Duration::from_millis(40));
    }

    #[test]
    fn test_park_timeout_returns_by_deadline() {
        let h = ThreadHandle::current();
        let start = Instant::now();
        h.park_timeout(Duration::from_millis(50));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_pending_interrupt_short_circuits_park() {
        let h = ThreadHandle::current();
        h.interrupt();

        let start = Instant::now();
        h.park();
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(h.take_interrupt());
        assert!(!h.is_interrupted());
    }

    #[test]
    fn test_handle_identity() {
        let a = ThreadHandle::current();
        let b = ThreadHandle::current();
        assert_eq!(a, b);

        let other = thread::spawn(ThreadHandle::current).join().unwrap();
        assert_ne!(a, other);
    }
}
