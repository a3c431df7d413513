use super::DbSession;
use crate::core::{Result, Row};
use tracing::{debug, warn};

/// A value that maps onto one row of a table.
pub trait Record {
    /// Table the record is stored in.
    const TABLE: &'static str;

    /// Explicit identifier; `None` lets the engine generate one.
    fn id(&self) -> Option<i64> {
        None
    }

    fn to_row(&self) -> Row;
}

impl DbSession {
    /// Inserts `record` and returns its id, running the dialect's insert
    /// hooks around the insert.
    ///
    /// A failing pre-hook aborts before anything is written. A failing
    /// post-hook is reported even though the row has been inserted.
    pub async fn insert_id<R: Record>(&self, record: &R) -> Result<i64> {
        self.ensure_open()?;
        let table = R::TABLE;
        let dialect = self.shared.dialect.clone();
        let mut handle = self.shared.handle.lock().await;

        dialect.pre_insert_id(table, &mut **handle).await?;
        let id = handle
            .insert_one(table, record.id(), record.to_row())
            .await?;

        if let Err(err) = dialect.post_insert_id(table, &mut **handle).await {
            warn!(
                session = %self.id(),
                table,
                id,
                dialect = dialect.name(),
                error = %err,
                "post-insert hook failed after the row was written"
            );
            return Err(err.into());
        }

        debug!(session = %self.id(), table, id, "record inserted");
        Ok(id)
    }
}
