/*!
 * Error Types
 *
 * Centralized error handling for the synchronizer with thiserror.
 *
 * The core never logs an error and never swallows one: every failure is
 * surfaced to the caller through these types, and every exit path leaves
 * the wait queue consistent (cancelled node + woken successor, or the
 * node installed as head).
 */

use thiserror::Error;

/// Result type for synchronizer operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Synchronizer operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The waiting thread was interrupted before or during the wait.
    #[error("wait interrupted")]
    Interrupted,

    /// A condition method was used without the access the policy requires
    /// (typically: the caller does not hold the synchronizer).
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(&'static str),

    /// A condition created by a different synchronizer was passed in.
    #[error("condition is not owned by this synchronizer")]
    ForeignCondition,
}
