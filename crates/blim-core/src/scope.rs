//! Hierarchical cancellation with an optional cause.
//!
//! [`CancelScope`] wraps a [`CancellationToken`]: cancelling a scope cancels
//! every child derived from it. A scope may also record *why* it was
//! cancelled, which children observe through [`CancelScope::cause`]. Plain
//! cancellation (graceful disconnect) carries no cause.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{ConnectionState, Error};

/// Reason attached to a cancelled scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCause {
    pub state: ConnectionState,
    pub reason: String,
}

impl CancelCause {
    /// The link dropped without a disconnect request.
    pub fn link_lost(reason: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::NotConnected,
            reason: reason.into(),
        }
    }

    /// Convert into a matchable [`Error`].
    pub fn into_error(self) -> Error {
        Error::Connection(self.state).context(self.reason)
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.state)
    }
}

struct ScopeInner {
    token: CancellationToken,
    cause: OnceLock<CancelCause>,
    parent: Option<CancelScope>,
}

/// A cancellation scope that can carry a cause.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    /// Create a root scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Derive a child scope, cancelled whenever this one is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Record `cause` (first one wins) and cancel.
    pub fn cancel_with_cause(&self, cause: CancelCause) {
        let _ = self.inner.cause.set(cause);
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cause of cancellation, inherited from the nearest ancestor that
    /// recorded one. `None` while not cancelled or for plain cancellation.
    pub fn cause(&self) -> Option<CancelCause> {
        if !self.is_cancelled() {
            return None;
        }
        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(cause) = current.inner.cause.get() {
                return Some(cause.clone());
            }
            scope = current.inner.parent.as_ref();
        }
        None
    }

    /// Resolves once the scope is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Underlying token, for APIs that take a [`CancellationToken`].
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}
