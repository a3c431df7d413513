use super::EngineSession;
use crate::core::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::HashSet;

/// Engine-specific behaviour around single-row inserts.
#[async_trait]
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote(&self, identifier: &str) -> String;

    /// Runs before the insert of a row into `table`.
    async fn pre_insert_id(&self, _table: &str, _session: &mut dyn EngineSession) -> EngineResult<()> {
        Ok(())
    }

    /// Runs after a successful insert into `table`.
    async fn post_insert_id(&self, _table: &str, _session: &mut dyn EngineSession) -> EngineResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

#[async_trait]
impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite3"
    }

    fn quote(&self, identifier: &str) -> String {
        format!("`{identifier}`")
    }
}

/// Postgres keeps ids in a sequence that explicit-id inserts do not advance,
/// so the sequence is re-synced to the table after each insert.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect {
    /// Tables whose sequence is re-synced. Empty means every table.
    sync_tables: HashSet<String>,
}

impl PostgresDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts sequence re-syncing to `tables`.
    pub fn sync_sequence_for<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    fn syncs(&self, table: &str) -> bool {
        self.sync_tables.is_empty() || self.sync_tables.contains(table)
    }
}

#[async_trait]
impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote(&self, identifier: &str) -> String {
        format!("\"{identifier}\"")
    }

    async fn post_insert_id(&self, table: &str, session: &mut dyn EngineSession) -> EngineResult<()> {
        if !self.syncs(table) {
            return Ok(());
        }
        let sql = format!(
            "SELECT setval('{table}_id_seq', (SELECT MAX(id) FROM {}))",
            self.quote(table)
        );
        session.execute(&sql).await.map_err(|err| {
            EngineError::new(
                err.code,
                format!("failed to sync primary key sequence for table '{table}': {}", err.message),
            )
        })?;
        Ok(())
    }
}

/// SQL Server rejects explicit identity values unless `IDENTITY_INSERT` is on
/// for the table, so it is switched on around the insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsSqlDialect;

#[async_trait]
impl Dialect for MsSqlDialect {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn quote(&self, identifier: &str) -> String {
        format!("[{identifier}]")
    }

    async fn pre_insert_id(&self, table: &str, session: &mut dyn EngineSession) -> EngineResult<()> {
        session
            .execute(&format!("SET IDENTITY_INSERT {} ON", self.quote(table)))
            .await?;
        Ok(())
    }

    async fn post_insert_id(&self, table: &str, session: &mut dyn EngineSession) -> EngineResult<()> {
        session
            .execute(&format!("SET IDENTITY_INSERT {} OFF", self.quote(table)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Row;
    use crate::engine::{Engine, IdentityMode, MemoryEngine};

    #[test]
    fn test_quoting() {
        assert_eq!(SqliteDialect.quote("user"), "`user`");
        assert_eq!(PostgresDialect::new().quote("user"), "\"user\"");
        assert_eq!(MsSqlDialect.quote("user"), "[user]");
    }

    #[tokio::test]
    async fn test_postgres_hook_resyncs_sequence() {
        let engine = MemoryEngine::with_identity_mode(IdentityMode::Sequence);
        engine.create_table("org").expect("create table");
        let mut session = engine.new_session().await.expect("session");

        session
            .insert_one("org", Some(7), Row::new().with("name", "main"))
            .await
            .expect("explicit insert");
        PostgresDialect::new()
            .post_insert_id("org", session.as_mut())
            .await
            .expect("sync sequence");

        let next = session
            .insert_one("org", None, Row::new().with("name", "second"))
            .await
            .expect("generated insert");
        assert_eq!(next, 8);
    }

    #[tokio::test]
    async fn test_postgres_hook_skips_unlisted_tables() {
        let engine = MemoryEngine::with_identity_mode(IdentityMode::Sequence);
        engine.create_table("org").expect("create table");
        let mut session = engine.new_session().await.expect("session");
        session
            .insert_one("org", Some(3), Row::new())
            .await
            .expect("explicit insert");

        PostgresDialect::new()
            .sync_sequence_for(["dashboard"])
            .post_insert_id("org", session.as_mut())
            .await
            .expect("no-op");

        let next = session.insert_one("org", None, Row::new()).await.expect("insert");
        assert_eq!(next, 1);
    }

    #[tokio::test]
    async fn test_mssql_hooks_toggle_identity_insert() {
        let engine = MemoryEngine::with_identity_mode(IdentityMode::Identity);
        engine.create_table("team").expect("create table");
        let mut session = engine.new_session().await.expect("session");

        let rejected = session.insert_one("team", Some(10), Row::new()).await;
        assert!(rejected.is_err());

        MsSqlDialect
            .pre_insert_id("team", session.as_mut())
            .await
            .expect("identity insert on");
        let id = session
            .insert_one("team", Some(10), Row::new())
            .await
            .expect("explicit id accepted");
        MsSqlDialect
            .post_insert_id("team", session.as_mut())
            .await
            .expect("identity insert off");

        assert_eq!(id, 10);
        assert!(session.insert_one("team", Some(11), Row::new()).await.is_err());
    }
}
