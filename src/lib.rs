/*!
 * Queued Synchronizer Framework
 *
 * The concurrency substrate for building mutexes, read/write locks,
 * semaphores, latches, and condition variables from a single atomic
 * integer of synchronization state.
 *
 * # Architecture
 *
 * A concrete synchronizer supplies a [`SyncPolicy`] (the predicates that
 * interpret the state cell) and this crate supplies the rest:
 *
 * - **Sync queue**: a lock-free CLH FIFO of waiting threads with lazy
 *   sentinel initialization, cancellation splicing, and backward-scan
 *   successor finding.
 * - **Acquire engine**: blocking, interruptible, and timed acquires in
 *   exclusive and shared modes, with barging fast paths and FIFO queued
 *   retries.
 * - **Release engine**: wakes the head's designated successor once the
 *   policy reports "fully released"; shared acquires cascade.
 * - **Conditions**: wait queues that release the full saved state on entry
 *   and restore it on re-acquire, with the usual interrupt/timeout/signal
 *   race resolution.
 * - **Instrumentation**: best-effort, non-blocking snapshots of both
 *   queues.
 *
 * # Example
 *
 * ```
 * use queued_sync::{StateCell, SyncPolicy, Synchronizer};
 *
 * /// state 0 = free, 1 = held
 * struct Mutex;
 *
 * impl SyncPolicy for Mutex {
 *     fn try_acquire_exclusive(&self, state: &StateCell, _queued: bool, _arg: i64) -> bool {
 *         state.compare_and_set(0, 1)
 *     }
 *     fn try_release_exclusive(&self, state: &StateCell, _arg: i64) -> bool {
 *         state.set(0);
 *         true
 *     }
 * }
 *
 * let lock = Synchronizer::new(Mutex);
 * lock.acquire_exclusive(1);
 * // ... critical section ...
 * assert!(lock.release_exclusive(1));
 * ```
 */

mod condition;
mod errors;
mod node;
mod park;
mod policy;
mod state;
mod sync;

pub use condition::Condition;
pub use errors::{SyncError, SyncResult};
pub use node::AcquireMode;
pub use park::ThreadHandle;
pub use policy::SyncPolicy;
pub use state::StateCell;
pub use sync::Synchronizer;
