/*!
 * Exclusive-Mode Integration Tests
 *
 * A CAS mutex built on the synchronizer: mutual exclusion under
 * contention, barging vs fair policies, timed bounds, and interrupt
 * handling.
 */

use queued_sync::{AcquireMode, StateCell, SyncError, SyncPolicy, Synchronizer, ThreadHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant};

const THREADS: usize = 4;
const ITERATIONS: usize = 10_000;

/// state 0 = free, 1 = held; permits barging.
struct Mutex;

impl SyncPolicy for Mutex {
    fn try_acquire_exclusive(&self, state: &StateCell, _queued: bool, _arg: i64) -> bool {
        state.compare_and_set(0, 1)
    }

    fn try_release_exclusive(&self, state: &StateCell, _arg: i64) -> bool {
        state.set(0);
        true
    }
}

/// As `Mutex`, but refuses every non-queued attempt, so arrivals can never
/// barge past parked waiters.
struct FairMutex;

impl SyncPolicy for FairMutex {
    fn try_acquire_exclusive(&self, state: &StateCell, queued: bool, _arg: i64) -> bool {
        if !queued {
            return false;
        }
        state.compare_and_set(0, 1)
    }

    fn try_release_exclusive(&self, state: &StateCell, _arg: i64) -> bool {
        state.set(0);
        true
    }
}

#[test]
fn test_mutual_exclusion_counter() {
    let sync = Arc::new(Synchronizer::new(Mutex));
    let counter = Arc::new(AtomicU64::new(0));
    let in_critical = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let sync = Arc::clone(&sync);
            let counter = Arc::clone(&counter);
            let in_critical = Arc::clone(&in_critical);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    sync.acquire_exclusive(1);
                    assert!(
                        !in_critical.swap(true, Ordering::SeqCst),
                        "two threads inside the critical section"
                    );
                    // Deliberately non-atomic read-modify-write: lost
                    // updates would surface as a wrong final count.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    in_critical.store(false, Ordering::SeqCst);
                    sync.release_exclusive(1);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        counter.load(Ordering::SeqCst),
        (THREADS * ITERATIONS) as u64
    );
    assert_eq!(sync.get_state(), 0);
    assert!(sync.queued_threads().is_empty());
}

#[test]
fn test_fair_policy_grants_in_queue_order() {
    let sync = Arc::new(Synchronizer::new(FairMutex));
    let order = Arc::new(StdMutex::new(Vec::new()));

    sync.acquire_exclusive(1);

    let mut handles = Vec::new();
    for tag in 1..=3u32 {
        let sync = Arc::clone(&sync);
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            sync.acquire_exclusive(1);
            order.lock().unwrap().push(tag);
            sync.release_exclusive(1);
        }));
        // Ensure each arrival is parked before the next one queues up.
        thread::sleep(Duration::from_millis(100));
    }

    assert_eq!(sync.queue_length(), 3);
    sync.release_exclusive(1);

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_barging_queued_thread_not_starved() {
    let sync = Arc::new(Synchronizer::new(Mutex));
    let done = Arc::new(AtomicBool::new(false));

    sync.acquire_exclusive(1);

    let waiter = {
        let sync = Arc::clone(&sync);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            sync.acquire_exclusive(1);
            done.store(true, Ordering::SeqCst);
            sync.release_exclusive(1);
        })
    };
    thread::sleep(Duration::from_millis(50));

    // A stream of barging lock/unlock cycles must not starve the parked
    // waiter forever under finite contention.
    let bargers: Vec<_> = (0..2)
        .map(|_| {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    sync.acquire_exclusive(1);
                    sync.release_exclusive(1);
                }
            })
        })
        .collect();

    sync.release_exclusive(1);
    for barger in bargers {
        barger.join().unwrap();
    }
    waiter.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn test_timed_acquire_returns_within_bound() {
    let sync = Arc::new(Synchronizer::new(Mutex));
    sync.acquire_exclusive(1);

    let sync2 = Arc::clone(&sync);
    let handle = thread::spawn(move || {
        let start = Instant::now();
        let acquired = sync2.acquire_exclusive_timed(1, Duration::from_millis(100));
        (acquired, start.elapsed())
    });

    let (acquired, elapsed) = handle.join().unwrap();
    assert_eq!(acquired, Ok(false));
    assert!(elapsed >= Duration::from_millis(90));
    assert!(elapsed < Duration::from_millis(1_000), "timed acquire overshot");

    // A timed acquire that can get the lock reports success.
    sync.release_exclusive(1);
    assert_eq!(
        sync.acquire_exclusive_timed(1, Duration::from_millis(100)),
        Ok(true)
    );
    sync.release_exclusive(1);
}

#[test]
fn test_interrupt_cancels_and_unparks_successor() {
    let sync = Arc::new(Synchronizer::new(Mutex));
    sync.acquire_exclusive(1);

    // First waiter will be interrupted; the second must still be woken
    // through the cancelled node.
    let (tx, rx) = std::sync::mpsc::channel();
    let first = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || {
            tx.send(ThreadHandle::current()).unwrap();
            sync.acquire_exclusive_interruptibly(1)
        })
    };
    let victim = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));

    let second = {
        let sync = Arc::clone(&sync);
        thread::spawn(move || {
            sync.acquire_exclusive(1);
            sync.release_exclusive(1);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(sync.queue_length(), 2);

    victim.interrupt();
    assert_eq!(first.join().unwrap(), Err(SyncError::Interrupted));

    sync.release_exclusive(1);
    second.join().unwrap();
    assert!(sync.queued_threads().is_empty());
}

#[test]
fn test_uninterruptible_acquire_reasserts_interrupt() {
    let sync = Arc::new(Synchronizer::new(Mutex));
    sync.acquire_exclusive(1);

    let (tx, rx) = std::sync::mpsc::channel();
    let sync2 = Arc::clone(&sync);
    let handle = thread::spawn(move || {
        tx.send(ThreadHandle::current()).unwrap();
        sync2.acquire_exclusive(1);
        // The interrupt must survive the uninterruptible acquire.
        let preserved = ThreadHandle::current().take_interrupt();
        sync2.release_exclusive(1);
        preserved
    });

    let waiter = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(50));
    waiter.interrupt();
    // The interrupted thread re-parks; only the release lets it through.
    thread::sleep(Duration::from_millis(50));
    sync.release_exclusive(1);

    assert!(handle.join().unwrap());
}

#[test]
fn test_queue_snapshot_modes() {
    let sync = Arc::new(Synchronizer::new(Mutex));
    sync.acquire_exclusive(1);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                sync.acquire_exclusive(1);
                sync.release_exclusive(1);
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(100));

    assert!(sync.has_queued_threads());
    assert_eq!(sync.queued_threads().len(), 3);
    assert_eq!(sync.queued_threads_in(AcquireMode::Exclusive).len(), 3);
    assert!(sync.queued_threads_in(AcquireMode::Shared).is_empty());

    sync.release_exclusive(1);
    for handle in handles {
        handle.join().unwrap();
    }
}
