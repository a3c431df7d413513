use super::{SqlStore, close_after};
use crate::context::SessionContext;
use crate::core::{Result, StoreError};
use crate::retry::{RetryPolicy, RetryState, backoff, lock_contention_code, retry_on_locks};
use crate::session::DbSession;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::debug;

impl SqlStore {
    /// Runs `callback` with a transactional session.
    ///
    /// A session registered on `ctx` is joined and its owner decides the
    /// transaction's fate. Otherwise a new session is opened with a
    /// transaction that is committed when `callback` succeeds and rolled back
    /// when it fails; committed post-commit events are published afterwards.
    /// Lock contention rolls the transaction back and reruns `callback` on a
    /// fresh session, up to `query_retries` times.
    pub async fn with_transactional_db_session<F, Fut, T>(
        &self,
        ctx: &SessionContext,
        mut callback: F,
    ) -> Result<T>
    where
        F: FnMut(DbSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (session, is_new) = self.start_session_or_use_existing(ctx, true).await?;
        let policy = self.config.retry_policy();
        if !is_new {
            return retry_on_locks(ctx, &policy, |_| callback(session.clone())).await;
        }

        self.retry_owned_transaction(ctx, policy, session, callback)
            .await
    }

    /// Runs `callback` inside a transaction.
    ///
    /// `callback` receives a context carrying the transactional session, so
    /// store operations issued with it join the transaction. When this call
    /// owns the transaction, lock contention anywhere in it (commit included)
    /// rolls it back and reruns the whole callback, up to
    /// `transaction_retries` times. A transaction joined from an enclosing
    /// scope is neither committed nor retried here.
    pub async fn in_transaction<F, Fut, T>(&self, ctx: &SessionContext, mut callback: F) -> Result<T>
    where
        F: FnMut(SessionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (session, is_new) = self.start_session_or_use_existing(ctx, true).await?;
        if !is_new {
            debug!(
                parent: ctx.span(),
                session = %session.id(),
                "skip committing the transaction because it belongs to a session created in the outer scope"
            );
            return callback(ctx.with_session(&session)).await;
        }

        let policy = self.config.transaction_retry_policy();
        self.retry_owned_transaction(ctx, policy, session, |session| {
            callback(ctx.with_session(&session))
        })
        .await
    }

    /// Drives a transaction this call owns: `attempt` runs on `first`, then on
    /// a freshly begun session after each lock-contention rollback.
    async fn retry_owned_transaction<F, Fut, T>(
        &self,
        ctx: &SessionContext,
        policy: RetryPolicy,
        first: DbSession,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut(DbSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new(policy);
        let mut next = Some(first);
        loop {
            let session = match next.take() {
                Some(session) => session,
                None => self.open_session(ctx, true).await?,
            };
            let number = state.begin_attempt();

            let work = async {
                let value = attempt(session.clone()).await?;
                let committed = session.commit().await?;
                Ok::<_, StoreError>((value, committed))
            };
            let outcome = AssertUnwindSafe(work).catch_unwind().await;

            let err = match close_after(ctx, &session, outcome).await {
                Ok((value, committed)) => {
                    committed.dispatch(ctx, self.bus.as_ref()).await;
                    return Ok(value);
                }
                Err(err) => err,
            };

            let Some(code) = lock_contention_code(&err) else {
                return Err(err);
            };
            if state.is_exhausted() {
                return Err(StoreError::MaxRetriesReached {
                    attempt: number,
                    source: Box::new(err),
                });
            }
            backoff(ctx, &state, code, &err).await?;
        }
    }
}
