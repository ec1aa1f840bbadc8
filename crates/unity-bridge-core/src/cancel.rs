//! Cancellation token for tool calls and bridge shutdown.
//!
//! A caller hands a token to `Bridge::dispatch` (or `wait_for_editor_ready`);
//! cancelling any clone wakes every task awaiting [`CancellationToken::cancelled`].

use tokio_util::sync;

/// A cancellation token for cooperative cancellation of async operations.
///
/// Clones share state: cancelling one cancels all of them. Unlike the
/// underlying `tokio_util` token there are no child tokens, so every clone
/// is a peer.
///
/// # Example
///
/// ```
/// use unity_bridge::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let token_clone = token.clone();
///
/// token_clone.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: sync::CancellationToken,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolve once the token is cancelled.
    ///
    /// Returns immediately if it already is. Safe to use as a `select!` arm.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Operation was cancelled")]
pub struct CancelledError;

impl From<CancelledError> for crate::semantics::ToolError {
    fn from(_: CancelledError) -> Self {
        crate::semantics::ToolError::new(
            crate::semantics::ErrorCode::RequestCancelled,
            "Request was cancelled by the caller",
        )
    }
}
