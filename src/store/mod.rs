//! Session acquisition and work execution.
//!
//! [`SqlStore`] is the entry point. Every operation takes the caller's
//! [`SessionContext`]: if the context already carries a session (because an
//! enclosing [`SqlStore::in_transaction`] registered one), the operation joins
//! it; otherwise a session is created for the operation and closed when the
//! operation ends, however it ends.

pub mod config;
mod transactions;

pub use config::StoreConfig;

use crate::context::SessionContext;
use crate::core::{Result, StoreError};
use crate::engine::{Dialect, Engine};
use crate::retry::retry_on_locks;
use crate::session::{DbSession, EventBus};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct SqlStore {
    engine: Arc<dyn Engine>,
    dialect: Arc<dyn Dialect>,
    config: StoreConfig,
    bus: Option<Arc<dyn EventBus>>,
}

impl SqlStore {
    pub fn new(engine: Arc<dyn Engine>, dialect: Arc<dyn Dialect>, config: StoreConfig) -> Result<Self> {
        config.validate().map_err(StoreError::Config)?;
        Ok(Self {
            engine,
            dialect,
            config,
            bus: None,
        })
    }

    /// Routes committed post-commit events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Returns the session registered on `ctx`, or a new one.
    ///
    /// The flag is `true` when the session was created here, in which case
    /// the caller owns it and must close it. `begin_tran` only applies to a
    /// new session; a reused session keeps whatever transaction state its
    /// owner gave it.
    pub async fn start_session_or_use_existing(
        &self,
        ctx: &SessionContext,
        begin_tran: bool,
    ) -> Result<(DbSession, bool)> {
        if let Some(session) = ctx.session() {
            session.bind(ctx).await;
            debug!(
                parent: ctx.span(),
                session = %session.id(),
                transaction = session.is_transaction_open(),
                "reusing existing session"
            );
            return Ok((session, false));
        }

        let session = self.open_session(ctx, begin_tran).await?;
        Ok((session, true))
    }

    async fn open_session(&self, ctx: &SessionContext, begin_tran: bool) -> Result<DbSession> {
        ctx.check()?;
        let mut handle = self
            .engine
            .new_session()
            .await
            .map_err(StoreError::Acquisition)?;
        handle.bind(ctx);
        if begin_tran {
            handle.begin().await.map_err(StoreError::Acquisition)?;
        }

        let session = DbSession::open(handle, self.dialect.clone(), begin_tran);
        debug!(
            parent: ctx.span(),
            session = %session.id(),
            transaction = begin_tran,
            "opened new session"
        );
        Ok(session)
    }

    /// Runs `callback` with the session registered on `ctx`, or with a new
    /// session that is closed afterwards. Lock contention is retried up to
    /// `query_retries` times.
    pub async fn with_db_session<F, Fut, T>(&self, ctx: &SessionContext, mut callback: F) -> Result<T>
    where
        F: FnMut(DbSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (session, is_new) = self.start_session_or_use_existing(ctx, false).await?;
        let policy = self.config.retry_policy();
        let work = retry_on_locks(ctx, &policy, |_| callback(session.clone()));
        if !is_new {
            return work.await;
        }

        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        close_after(ctx, &session, outcome).await
    }

    /// Runs `callback` with a fresh session, ignoring any session on `ctx`.
    /// The session is always closed afterwards.
    pub async fn with_new_db_session<F, Fut, T>(&self, ctx: &SessionContext, mut callback: F) -> Result<T>
    where
        F: FnMut(DbSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = self.open_session(ctx, false).await?;
        let policy = self.config.retry_policy();
        let outcome = AssertUnwindSafe(retry_on_locks(ctx, &policy, |_| callback(session.clone())))
            .catch_unwind()
            .await;
        close_after(ctx, &session, outcome).await
    }
}

/// Closes a session owned by the current operation, then yields the
/// operation's outcome. A panic is resumed only after the session is closed.
/// Close failures are logged; the operation's own result is returned.
pub(crate) async fn close_after<T>(
    ctx: &SessionContext,
    session: &DbSession,
    outcome: std::thread::Result<Result<T>>,
) -> Result<T> {
    if let Err(err) = session.close().await {
        warn!(parent: ctx.span(), session = %session.id(), error = %err, "failed to close session");
    }
    match outcome {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EngineError, ErrorCode};
    use crate::engine::{MemoryEngine, SqliteDialect};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> SqlStore {
        let engine = MemoryEngine::new();
        engine.create_table("user").unwrap();
        SqlStore::new(Arc::new(engine), Arc::new(SqliteDialect), StoreConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = SqlStore::new(
            Arc::new(MemoryEngine::new()),
            Arc::new(SqliteDialect),
            StoreConfig::new().query_retries(0),
        );
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_fresh_context_creates_session() {
        let store = store();
        let ctx = SessionContext::new();

        let (session, is_new) = store.start_session_or_use_existing(&ctx, true).await.unwrap();
        assert!(is_new);
        assert!(session.is_transaction_open());
        session.close().await.unwrap();

        let (session, is_new) = store.start_session_or_use_existing(&ctx, false).await.unwrap();
        assert!(is_new);
        assert!(!session.is_transaction_open());
    }

    #[tokio::test]
    async fn test_registered_session_is_reused() {
        let store = store();
        let (outer, _) = store
            .start_session_or_use_existing(&SessionContext::new(), true)
            .await
            .unwrap();
        let ctx = SessionContext::new().with_session(&outer);

        let (inner, is_new) = store.start_session_or_use_existing(&ctx, false).await.unwrap();
        assert!(!is_new);
        assert!(inner.ptr_eq(&outer));
        assert!(inner.is_transaction_open());
    }

    #[tokio::test]
    async fn test_closed_registered_session_is_not_reused() {
        let store = store();
        let (outer, _) = store
            .start_session_or_use_existing(&SessionContext::new(), false)
            .await
            .unwrap();
        let ctx = SessionContext::new().with_session(&outer);
        outer.close().await.unwrap();

        let (session, is_new) = store.start_session_or_use_existing(&ctx, false).await.unwrap();
        assert!(is_new);
        assert!(!session.ptr_eq(&outer));
    }

    #[tokio::test]
    async fn test_new_session_is_closed_after_error() {
        let store = store();
        let seen = Arc::new(std::sync::Mutex::new(None::<DbSession>));
        let slot = seen.clone();

        let err = store
            .with_db_session(&SessionContext::new(), move |session| {
                let slot = slot.clone();
                async move {
                    *slot.lock().unwrap() = Some(session);
                    Err::<(), StoreError>(EngineError::constraint("UNIQUE constraint failed").into())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), Some(ErrorCode::Constraint));
        let session = seen.lock().unwrap().take().unwrap();
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_with_new_db_session_ignores_registered_session() {
        let store = store();
        let (outer, _) = store
            .start_session_or_use_existing(&SessionContext::new(), true)
            .await
            .unwrap();
        let ctx = SessionContext::new().with_session(&outer);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let outer_handle = outer.clone();

        let same = store
            .with_new_db_session(&ctx, move |session| {
                let counter = counter.clone();
                let outer = outer_handle.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<bool, StoreError>(session.ptr_eq(&outer))
                }
            })
            .await
            .unwrap();

        assert!(!same);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!outer.is_closed());
    }
}
