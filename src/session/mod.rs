//! Database sessions.
//!
//! A [`DbSession`] is a cheap, clonable handle to one engine session. All
//! clones share the same transaction state and post-commit event queue, so a
//! session handed to a callback and the one kept by its creator are the same
//! session.

pub mod events;
pub mod insert;

pub use events::{ChannelEventBus, CommittedEvents, EventBus, PostCommitEvent};
pub use insert::Record;

use crate::context::SessionContext;
use crate::core::{EngineError, Result, Row, StoreError};
use crate::engine::{Dialect, EngineSession};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Unique identifier of a session, used for logging and identity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    handle: tokio::sync::Mutex<Box<dyn EngineSession>>,
    dialect: Arc<dyn Dialect>,
    transaction_open: AtomicBool,
    closed: AtomicBool,
    events: Mutex<Vec<PostCommitEvent>>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!(session = %self.id, "session dropped without close, engine session released");
        }
    }
}

#[derive(Clone)]
pub struct DbSession {
    shared: Arc<SessionShared>,
}

impl DbSession {
    pub(crate) fn open(
        handle: Box<dyn EngineSession>,
        dialect: Arc<dyn Dialect>,
        transaction_open: bool,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                id: SessionId::new(),
                handle: tokio::sync::Mutex::new(handle),
                dialect,
                transaction_open: AtomicBool::new(transaction_open),
                closed: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<SessionShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(weak: &Weak<SessionShared>) -> Option<DbSession> {
        weak.upgrade().map(|shared| DbSession { shared })
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn is_transaction_open(&self) -> bool {
        self.shared.transaction_open.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// True when both handles refer to the same session.
    pub fn ptr_eq(&self, other: &DbSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.shared.dialect.as_ref()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StoreError::SessionClosed(self.id().to_string()));
        }
        Ok(())
    }

    fn events(&self) -> std::sync::MutexGuard<'_, Vec<PostCommitEvent>> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebinds the engine handle to `ctx`'s cancellation signal and deadline.
    pub async fn bind(&self, ctx: &SessionContext) {
        self.shared.handle.lock().await.bind(ctx);
    }

    pub async fn begin(&self) -> Result<()> {
        self.ensure_open()?;
        if self.is_transaction_open() {
            return Err(EngineError::misuse(format!(
                "session {} already has an open transaction",
                self.id()
            ))
            .into());
        }
        self.shared.handle.lock().await.begin().await?;
        self.shared.transaction_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Commits the open transaction and hands back the events queued on it.
    ///
    /// On failure the transaction stays open and the events stay queued; the
    /// owner is expected to roll back or close.
    pub async fn commit(&self) -> Result<CommittedEvents> {
        self.ensure_open()?;
        if !self.is_transaction_open() {
            return Err(EngineError::misuse(format!(
                "session {} has no open transaction to commit",
                self.id()
            ))
            .into());
        }
        self.shared.handle.lock().await.commit().await?;
        self.shared.transaction_open.store(false, Ordering::SeqCst);

        let events = std::mem::take(&mut *self.events());
        debug!(session = %self.id(), events = events.len(), "transaction committed");
        Ok(CommittedEvents::new(self.id(), events))
    }

    /// Rolls back the open transaction, if any, and discards queued events.
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let discarded = std::mem::take(&mut *self.events()).len();
        if !self.is_transaction_open() {
            return Ok(());
        }

        let result = self.shared.handle.lock().await.rollback().await;
        self.shared.transaction_open.store(false, Ordering::SeqCst);
        debug!(session = %self.id(), discarded, "transaction rolled back");
        result.map_err(StoreError::from)
    }

    /// Closes the session, rolling back an open transaction first.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut handle = self.shared.handle.lock().await;
        let mut outcome = Ok(());
        if self.shared.transaction_open.swap(false, Ordering::SeqCst) {
            outcome = handle.rollback().await;
        }

        let pending = std::mem::take(&mut *self.events());
        if !pending.is_empty() {
            warn!(
                session = %self.id(),
                discarded = pending.len(),
                "session closed without commit, discarding post-commit events"
            );
        }

        let closed = handle.close().await;
        outcome.and(closed).map_err(StoreError::from)
    }

    /// Queues `event` to be delivered once the session's transaction commits.
    pub fn publish_after_commit<E>(&self, event: E)
    where
        E: Any + Send + Sync,
    {
        self.events().push(PostCommitEvent::new(event));
    }

    pub fn pending_event_count(&self) -> usize {
        self.events().len()
    }

    /// Runs a raw statement on the engine session.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.shared.handle.lock().await.execute(sql).await?)
    }

    pub async fn fetch(&self, table: &str, id: i64) -> Result<Option<Row>> {
        self.ensure_open()?;
        Ok(self.shared.handle.lock().await.fetch(table, id).await?)
    }

    pub async fn count(&self, table: &str) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.shared.handle.lock().await.count(table).await?)
    }
}

impl fmt::Debug for DbSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSession")
            .field("id", &self.id())
            .field("transaction_open", &self.is_transaction_open())
            .field("closed", &self.is_closed())
            .field("pending_events", &self.pending_event_count())
            .finish()
    }
}
