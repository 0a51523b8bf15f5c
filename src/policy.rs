/*!
 * User Predicates
 *
 * The capability record a concrete synchronizer supplies: how to interpret
 * the state cell for exclusive and shared acquires and releases, and who may
 * use the condition facility. The queue machinery never reads state values
 * itself; it only calls back into these predicates.
 */

use crate::errors::SyncResult;
use crate::park::ThreadHandle;
use crate::state::StateCell;

/// State-transition predicates for a concrete synchronizer.
///
/// Implement only the modes the synchronizer exercises; the default bodies
/// panic, marking the mode as never implemented. Predicates must be
/// straight-line: reading and CASing `state` is their only permitted side
/// effect, and calling back into the owning synchronizer is undefined.
///
/// A predicate that panics while its thread is queued unwinds through the
/// acquire engine; the engine cancels the node first, so the queue stays
/// consistent and the panic reaches the acquiring thread intact.
pub trait SyncPolicy: Send + Sync {
    /// Attempt to transition `state` for an exclusive acquire.
    ///
    /// `queued` is true when the caller already sits at the head of the
    /// wait queue (retries after parking); false on the barging fast path.
    /// A fairness policy may refuse non-queued callers. Must be
    /// side-effect-free on failure.
    fn try_acquire_exclusive(&self, state: &StateCell, queued: bool, arg: i64) -> bool {
        let _ = (state, queued, arg);
        panic!("exclusive acquire not supported by this synchronizer");
    }

    /// Adjust `state` for an exclusive release. Returns true iff the
    /// synchronizer is now fully released, so waiting threads may attempt
    /// to acquire.
    fn try_release_exclusive(&self, state: &StateCell, arg: i64) -> bool {
        let _ = (state, arg);
        panic!("exclusive release not supported by this synchronizer");
    }

    /// Attempt to transition `state` for a shared acquire.
    ///
    /// Returns a negative value on failure, zero on success with no
    /// cascade, and a positive value on success when subsequent waiters
    /// should also attempt to acquire. Must be side-effect-free on failure.
    fn try_acquire_shared(&self, state: &StateCell, queued: bool, arg: i64) -> i64 {
        let _ = (state, queued, arg);
        panic!("shared acquire not supported by this synchronizer");
    }

    /// Adjust `state` for a shared release; true iff fully released.
    fn try_release_shared(&self, state: &StateCell, arg: i64) -> bool {
        let _ = (state, arg);
        panic!("shared release not supported by this synchronizer");
    }

    /// Gate every condition operation. Return
    /// `Err(SyncError::IllegalMonitorState)` if `thread` may not use a
    /// condition of this synchronizer, typically because it does not hold
    /// it exclusively. `waiting` is true for the wait variants and false
    /// for signal and instrumentation.
    fn check_condition_access(
        &self,
        state: &StateCell,
        thread: &ThreadHandle,
        waiting: bool,
    ) -> SyncResult<()> {
        let _ = (state, thread, waiting);
        panic!("conditions not supported by this synchronizer");
    }
}
