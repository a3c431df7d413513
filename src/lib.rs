// ============================================================================
// sqlstore Library
// ============================================================================
//
// Context-scoped database sessions: nested operations share one transaction,
// lock contention is retried with backoff, and post-commit events are only
// released once the owning transaction commits.

pub mod context;
pub mod core;
pub mod engine;
pub mod retry;
pub mod session;
pub mod store;

pub use context::{CancelSignal, SessionContext};
pub use core::{EngineError, EngineResult, ErrorCode, Result, Row, StoreError, Value};
pub use engine::{
    Dialect, Engine, EngineSession, IdentityMode, MemoryEngine, MsSqlDialect, PostgresDialect,
    SqliteDialect,
};
pub use retry::{RetryPolicy, RetryState, retry_on_locks};
pub use session::{
    ChannelEventBus, CommittedEvents, DbSession, EventBus, PostCommitEvent, Record, SessionId,
};
pub use store::{SqlStore, StoreConfig};

/// Opens a store over a fresh in-process [`MemoryEngine`] with the SQLite
/// dialect and default configuration.
///
/// # Examples
///
/// ```
/// use sqlstore::{Record, Row, SessionContext, StoreError};
///
/// struct Team {
///     name: String,
/// }
///
/// impl Record for Team {
///     const TABLE: &'static str = "team";
///
///     fn to_row(&self) -> Row {
///         Row::new().with("name", self.name.as_str())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), StoreError> {
/// let store = sqlstore::open_in_memory(&["team"])?;
/// let ctx = SessionContext::new();
///
/// let id = store
///     .in_transaction(&ctx, |tx_ctx| {
///         let store = store.clone();
///         async move {
///             store
///                 .with_db_session(&tx_ctx, |session| async move {
///                     let team = Team { name: "core".into() };
///                     session.insert_id(&team).await
///                 })
///                 .await
///         }
///     })
///     .await?;
/// assert_eq!(id, 1);
/// # Ok(())
/// # }
/// ```
pub fn open_in_memory(tables: &[&str]) -> Result<SqlStore> {
    let engine = MemoryEngine::new();
    for table in tables {
        engine.create_table(table)?;
    }
    SqlStore::new(
        std::sync::Arc::new(engine),
        std::sync::Arc::new(SqliteDialect),
        StoreConfig::default(),
    )
}
