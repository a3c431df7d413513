// ============================================================================
// Engine boundary
// ============================================================================
//
// The relational engine and its connection handling live outside this crate.
// `Engine` hands out sessions; `EngineSession` is one connection with at most
// one open transaction; `Dialect` carries the engine-specific insert hooks.
//
// ============================================================================

pub mod dialect;
pub mod memory;

pub use dialect::{Dialect, MsSqlDialect, PostgresDialect, SqliteDialect};
pub use memory::{IdentityMode, MemoryEngine, MemorySession};

use crate::context::SessionContext;
use crate::core::{EngineResult, Row};
use async_trait::async_trait;

/// Source of engine sessions (a connection pool, an embedded database, ...).
#[async_trait]
pub trait Engine: Send + Sync {
    async fn new_session(&self) -> EngineResult<Box<dyn EngineSession>>;
}

/// One engine connection.
///
/// Dropping a session with an open transaction must roll it back.
#[async_trait]
pub trait EngineSession: Send {
    /// Rebinds the session to a call context; subsequent operations fail
    /// promptly once that context is cancelled or past its deadline.
    fn bind(&mut self, ctx: &SessionContext);

    async fn begin(&mut self) -> EngineResult<()>;

    async fn commit(&mut self) -> EngineResult<()>;

    async fn rollback(&mut self) -> EngineResult<()>;

    /// Inserts one row and returns its id. `id` is an explicit identifier;
    /// `None` lets the engine generate one.
    async fn insert_one(&mut self, table: &str, id: Option<i64>, row: Row) -> EngineResult<i64>;

    /// Executes a raw statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str) -> EngineResult<u64>;

    async fn fetch(&mut self, table: &str, id: i64) -> EngineResult<Option<Row>>;

    async fn count(&mut self, table: &str) -> EngineResult<usize>;

    /// Releases the connection. Open transactions are rolled back.
    async fn close(&mut self) -> EngineResult<()>;
}
