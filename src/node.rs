/*!
 * Wait-Queue Node
 *
 * One queued acquire attempt: a cancellable, doubly-linked queue element
 * carrying the waiting thread's parker and a small status word.
 *
 * # Memory Reclamation
 *
 * The queue is traversed lock-free, including backward scans from tail that
 * may touch a node another thread is concurrently cancelling. Instead of
 * hazard pointers, nodes live in a per-synchronizer arena: every allocation
 * is registered in a lock-free queue and freed only when the synchronizer
 * itself is dropped. Any node pointer read from `head`, `tail`, or a link is
 * therefore dereferenceable for the synchronizer's whole lifetime.
 */

use crate::park::{ParkCore, ThreadHandle};
use crossbeam_queue::SegQueue;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

/// Acquire mode carried by each queued node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquireMode {
    /// At most one holder; successful acquires do not cascade.
    Exclusive,
    /// Successful acquires may cascade to wake subsequent waiters.
    Shared,
}

/// Node for threads waiting for acquires or conditions.
///
/// The status word takes only four values and moves monotonically toward
/// `CANCELLED`, except for the single `CONDITION -> 0` transition made when
/// a condition waiter is transferred onto the sync queue:
///
/// - `SIGNAL`: this node's holder has promised to unpark its successor on
///   release or cancellation.
/// - `CANCELLED`: timed out or interrupted; absorbing, never re-activated.
/// - `CONDITION`: parked on a condition queue, not on the sync queue.
/// - `0`: none of the above. Negative values mean "must signal", so some
///   paths only test the sign.
#[repr(C, align(64))]
pub(crate) struct Node {
    /// Status word, modified only by CAS.
    pub(crate) status: AtomicI32,
    /// Predecessor on the sync queue. Assigned during enqueue; rewritten
    /// only to skip past cancelled predecessors (monotonic toward head).
    pub(crate) prev: AtomicPtr<Node>,
    /// Successor on the sync queue. Assignment lags the tail CAS, so null
    /// does not mean "last"; backward traversal from tail is authoritative.
    pub(crate) next: AtomicPtr<Node>,
    /// Link on a condition queue; only touched while the synchronizer is
    /// held exclusively.
    pub(crate) next_waiter: AtomicPtr<Node>,
    /// Fixed at creation.
    pub(crate) mode: AcquireMode,
    /// Clearable view of the waiting thread's parker; nulled once the node
    /// becomes head or is cancelled. `owner` below pins the allocation, so
    /// a non-null pointer loaded here may always be dereferenced.
    waiter: AtomicPtr<ParkCore>,
    /// Strong reference that keeps the parker alive for the node's whole
    /// lifetime. `None` only for the sentinel.
    owner: Option<ThreadHandle>,
}

impl Node {
    /// Thread cancelled its attempt (timeout or interrupt).
    pub(crate) const CANCELLED: i32 = 1;
    /// Successor needs unparking on release.
    pub(crate) const SIGNAL: i32 = -1;
    /// Node is on a condition queue.
    pub(crate) const CONDITION: i32 = -2;

    /// Dummy header installed on first contention.
    pub(crate) fn sentinel() -> Self {
        Self::with_status(None, AcquireMode::Exclusive, 0)
    }

    /// Node for a thread entering the sync queue.
    pub(crate) fn waiter(thread: ThreadHandle, mode: AcquireMode) -> Self {
        Self::with_status(Some(thread), mode, 0)
    }

    /// Node for a thread entering a condition queue.
    pub(crate) fn condition_waiter(thread: ThreadHandle) -> Self {
        Self::with_status(Some(thread), AcquireMode::Exclusive, Self::CONDITION)
    }

    fn with_status(owner: Option<ThreadHandle>, mode: AcquireMode, status: i32) -> Self {
        let waiter = owner
            .as_ref()
            .map_or(ptr::null_mut(), ThreadHandle::park_ptr);
        Self {
            status: AtomicI32::new(status),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            next_waiter: AtomicPtr::new(ptr::null_mut()),
            mode,
            waiter: AtomicPtr::new(waiter),
            owner,
        }
    }

    #[inline]
    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn cas_status(&self, expect: i32, update: i32) -> bool {
        self.status
            .compare_exchange(expect, update, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.status() == Self::CANCELLED
    }

    /// Wake this node's thread, if the field has not been cleared.
    pub(crate) fn unpark_waiter(&self) {
        let p = self.waiter.load(Ordering::Acquire);
        if !p.is_null() {
            // Pinned by `owner` for the node's lifetime.
            unsafe { (*p).unpark() }
        }
    }

    /// Clear the thread field (node became head or was cancelled).
    pub(crate) fn clear_waiter(&self) {
        self.waiter.store(ptr::null_mut(), Ordering::Release);
    }

    /// Snapshot of the waiting thread for instrumentation; `None` once the
    /// node has been claimed or cancelled.
    pub(crate) fn waiting_thread(&self) -> Option<ThreadHandle> {
        if self.waiter.load(Ordering::Acquire).is_null() {
            return None;
        }
        self.owner.clone()
    }
}

/// Send-safe wrapper for raw node pointers held by the arena registry.
struct NodePtr(*mut Node);

// Raw pointers are not Send, but the pointees are heap allocations whose
// ownership lives solely in the registry until drop.
unsafe impl Send for NodePtr {}

/// Per-synchronizer allocation registry. Push is lock-free (it sits on the
/// slow acquire path); nodes are reclaimed in one sweep on drop.
pub(crate) struct NodeArena {
    nodes: SegQueue<NodePtr>,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self {
            nodes: SegQueue::new(),
        }
    }

    /// Move `node` to the heap and register it; the returned pointer stays
    /// valid until the arena is dropped.
    pub(crate) fn alloc(&self, node: Node) -> *mut Node {
        let p = Box::into_raw(Box::new(node));
        self.nodes.push(NodePtr(p));
        p
    }
}

impl Drop for NodeArena {
    fn drop(&mut self) {
        while let Some(NodePtr(p)) = self.nodes.pop() {
            // Registered by alloc and never freed elsewhere.
            unsafe { drop(Box::from_raw(p)) }
        }
    }
}
