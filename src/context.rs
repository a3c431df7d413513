//! Request-scoped call context.
//!
//! A [`SessionContext`] is passed by reference through a call chain. It
//! carries the cancellation signal and deadline of the request, the span
//! that log events of the chain are attached to, and the session registry
//! slot: a weak back-reference to the one session nested operations reuse.
//! Deriving a context (`with_session`, `with_timeout`, ...) clones it, so the
//! derived context shares the parent's cancellation signal.

use crate::core::StoreError;
use crate::session::{DbSession, SessionShared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::Span;

/// Shared cancellation flag for one call chain.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the chain. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the signal is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct SessionContext {
    signal: CancelSignal,
    deadline: Option<Instant>,
    session: Option<Weak<SessionShared>>,
    span: Span,
}

impl SessionContext {
    /// Creates a root context attached to the caller's current span.
    pub fn new() -> Self {
        Self {
            signal: CancelSignal::new(),
            deadline: None,
            session: None,
            span: Span::current(),
        }
    }

    /// Replaces the span log events of this chain are recorded under.
    pub fn with_span(&self, span: Span) -> Self {
        Self {
            span,
            ..self.clone()
        }
    }

    /// Derives a context bound to an externally owned cancellation signal.
    pub fn with_cancel_signal(&self, signal: CancelSignal) -> Self {
        Self {
            signal,
            ..self.clone()
        }
    }

    /// Derives a context whose deadline is at most `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a context that carries `session`, so session acquisition on
    /// the derived context (and its descendants) reuses it.
    pub fn with_session(&self, session: &DbSession) -> Self {
        Self {
            session: Some(session.downgrade()),
            ..self.clone()
        }
    }

    /// Derives a context with the registry slot cleared.
    pub fn without_session(&self) -> Self {
        Self {
            session: None,
            ..self.clone()
        }
    }

    /// Looks up the session registered on this context.
    ///
    /// Returns `None` when no session was registered or when the registered
    /// session has since been closed or dropped by its owner.
    pub fn session(&self) -> Option<DbSession> {
        self.session
            .as_ref()
            .and_then(DbSession::upgrade)
            .filter(|session| !session.is_closed())
    }

    pub fn has_session(&self) -> bool {
        self.session().is_some()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.signal
    }

    /// Cancels this context and every context sharing its signal.
    pub fn cancel(&self) {
        self.signal.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fails with `Cancelled` or `DeadlineExceeded` when the chain must stop.
    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        if self.is_expired() {
            return Err(StoreError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves with the reason the chain stopped, once it does.
    pub async fn done(&self) -> StoreError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.signal.cancelled() => StoreError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => StoreError::DeadlineExceeded,
            },
            None => {
                self.signal.cancelled().await;
                StoreError::Cancelled
            }
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("session", &self.session().map(|s| s.id().to_string()))
            .finish()
    }
}
