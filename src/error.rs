use thiserror::Error;

/// Raised by [`crate::ui::UpdaterUi::check_cancelled`] when the user aborts.
///
/// Travels inside `anyhow::Error`; callers tell it apart from real failures
/// with [`is_cancelled`].
#[derive(Debug, Error)]
#[error("operation cancelled by user")]
pub struct OperationCancelled;

/// Distinguished failures of the patch engine. Plain I/O problems are
/// reported as `anyhow` errors with context instead.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch cannot be applied, blocking conflicts on: {}", .0.join(", "))]
    BlockingConflicts(Vec<String>),

    #[error("corrupt patch: {0}")]
    CorruptPatch(String),

    #[error("unsupported patch index version: {found} (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },

    #[error("patch entry not found: {0}")]
    MissingEntry(String),
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<OperationCancelled>())
}
