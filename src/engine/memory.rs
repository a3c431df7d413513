//! In-process reference engine.
//!
//! Tables are maps from id to row with a per-table id sequence. Writes made
//! inside a transaction are staged on the session and applied at commit.
//! Like an embedded database, the whole database has a single write lock: a
//! transaction takes it on its first write and keeps it until commit or
//! rollback, and any other session that tries to write meanwhile gets
//! `ErrorCode::Busy`.

use super::{Engine, EngineSession};
use crate::context::{CancelSignal, SessionContext};
use crate::core::{EngineError, EngineResult, Row};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{debug, trace};

lazy_static! {
    static ref CREATE_TABLE: Regex = Regex::new(
        r#"(?i)^\s*CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?[\["`]?(\w+)[\]"`]?\s*;?\s*$"#
    )
    .expect("valid CREATE TABLE pattern");
    static ref DELETE_FROM: Regex =
        Regex::new(r#"(?i)^\s*DELETE\s+FROM\s+[\["`]?(\w+)[\]"`]?\s*;?\s*$"#)
            .expect("valid DELETE pattern");
    static ref IDENTITY_INSERT: Regex = Regex::new(
        r#"(?i)^\s*SET\s+IDENTITY_INSERT\s+[\["`]?(\w+)[\]"`]?\s+(ON|OFF)\s*;?\s*$"#
    )
    .expect("valid IDENTITY_INSERT pattern");
    static ref SETVAL: Regex = Regex::new(
        r#"(?i)^\s*SELECT\s+setval\(\s*'(\w+)_id_seq'\s*,\s*(?:(\d+)|\(\s*SELECT\s+MAX\(\s*id\s*\)\s+FROM\s+[\["`]?\w+[\]"`]?\s*\))\s*\)\s*;?\s*$"#
    )
    .expect("valid setval pattern");
}

/// How explicit ids interact with a table's id sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityMode {
    /// Explicit ids are accepted and advance the sequence past them.
    #[default]
    AutoIncrement,
    /// Explicit ids are accepted but leave the sequence untouched.
    Sequence,
    /// Explicit ids are rejected unless identity insert is on for the table.
    Identity,
}

#[derive(Debug, Clone)]
struct Table {
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

impl Table {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Database {
    tables: HashMap<String, Table>,
    /// Session holding the write lock.
    writer: Option<u64>,
    /// Table name -> session with identity insert switched on.
    identity_insert: HashMap<String, u64>,
    next_session_id: u64,
}

impl Database {
    fn table(&self, name: &str) -> EngineResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| EngineError::not_found(format!("no such table: {name}")))
    }

    fn table_mut(&mut self, name: &str) -> EngineResult<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("no such table: {name}")))
    }

    fn release(&mut self, session_id: u64) {
        if self.writer == Some(session_id) {
            self.writer = None;
        }
        self.identity_insert.retain(|_, holder| *holder != session_id);
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Insert { table: String, id: i64, row: Row },
    Clear { table: String },
}

#[derive(Debug, Default)]
struct PendingTx {
    holds_write_lock: bool,
    ops: Vec<PendingOp>,
}

#[derive(Clone, Default)]
pub struct MemoryEngine {
    mode: IdentityMode,
    db: Arc<Mutex<Database>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity_mode(mode: IdentityMode) -> Self {
        Self {
            mode,
            db: Arc::default(),
        }
    }

    pub fn identity_mode(&self) -> IdentityMode {
        self.mode
    }

    pub fn create_table(&self, name: &str) -> EngineResult<()> {
        let mut db = self.db.lock()?;
        if db.tables.contains_key(name) {
            return Err(EngineError::misuse(format!("table {name} already exists")));
        }
        db.tables.insert(name.to_string(), Table::new());
        Ok(())
    }

    pub fn table_names(&self) -> EngineResult<Vec<String>> {
        let db = self.db.lock()?;
        let mut names: Vec<String> = db.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Row count as seen outside any transaction.
    pub fn committed_count(&self, table: &str) -> EngineResult<usize> {
        let db = self.db.lock()?;
        Ok(db.table(table)?.rows.len())
    }

    pub fn is_write_locked(&self) -> bool {
        self.db
            .lock()
            .map(|db| db.writer.is_some())
            .unwrap_or(false)
    }

    /// Opens a session without going through the `Engine` trait object.
    pub fn open_session(&self) -> EngineResult<MemorySession> {
        let id = {
            let mut db = self.db.lock()?;
            db.next_session_id += 1;
            db.next_session_id
        };
        trace!(session = id, "memory engine session opened");
        Ok(MemorySession {
            id,
            mode: self.mode,
            db: self.db.clone(),
            signal: None,
            deadline: None,
            tx: None,
            closed: false,
        })
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn new_session(&self) -> EngineResult<Box<dyn EngineSession>> {
        Ok(Box::new(self.open_session()?))
    }
}

pub struct MemorySession {
    id: u64,
    mode: IdentityMode,
    db: Arc<Mutex<Database>>,
    signal: Option<CancelSignal>,
    deadline: Option<Instant>,
    tx: Option<PendingTx>,
    closed: bool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn ensure_live(&self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::misuse("session is closed"));
        }
        if self.signal.as_ref().is_some_and(CancelSignal::is_cancelled) {
            return Err(EngineError::interrupted());
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(EngineError::interrupted());
        }
        Ok(())
    }

    fn lock_db(&self) -> EngineResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }

    /// Takes the write lock for this session's transaction, or checks that a
    /// one-off autocommit write may proceed.
    fn acquire_write(&mut self, db: &mut Database) -> EngineResult<()> {
        match db.writer {
            Some(holder) if holder != self.id => {
                Err(EngineError::busy("database is locked"))
            }
            _ => {
                if let Some(tx) = self.tx.as_mut() {
                    if !tx.holds_write_lock {
                        db.writer = Some(self.id);
                        tx.holds_write_lock = true;
                    }
                }
                Ok(())
            }
        }
    }

    /// The rows of `table` as this session sees them: committed rows plus
    /// the session's own staged writes.
    fn view(&self, db: &Database, table: &str) -> EngineResult<BTreeMap<i64, Row>> {
        let mut rows = db.table(table)?.rows.clone();
        if let Some(tx) = &self.tx {
            for op in &tx.ops {
                match op {
                    PendingOp::Insert { table: t, id, row } if t == table => {
                        rows.insert(*id, row.clone());
                    }
                    PendingOp::Clear { table: t } if t == table => rows.clear(),
                    _ => {}
                }
            }
        }
        Ok(rows)
    }

    fn apply(db: &mut Database, op: PendingOp) -> EngineResult<()> {
        match op {
            PendingOp::Insert { table, id, row } => {
                db.table_mut(&table)?.rows.insert(id, row);
            }
            PendingOp::Clear { table } => {
                db.table_mut(&table)?.rows.clear();
            }
        }
        Ok(())
    }

    fn write(&mut self, db: &mut Database, op: PendingOp) -> EngineResult<()> {
        match self.tx.as_mut() {
            Some(tx) => {
                tx.ops.push(op);
                Ok(())
            }
            None => Self::apply(db, op),
        }
    }

    fn finish_tx(&mut self) -> EngineResult<Option<PendingTx>> {
        let tx = self.tx.take();
        if let Some(tx) = &tx {
            if tx.holds_write_lock {
                let mut db = self.lock_db()?;
                if db.writer == Some(self.id) {
                    db.writer = None;
                }
            }
        }
        Ok(tx)
    }

    fn create_table(&mut self, name: &str, if_not_exists: bool) -> EngineResult<u64> {
        let db_handle = self.db.clone();
        let mut db = db_handle.lock()?;
        self.acquire_write(&mut db)?;
        if db.tables.contains_key(name) {
            if if_not_exists {
                return Ok(0);
            }
            return Err(EngineError::misuse(format!("table {name} already exists")));
        }
        db.tables.insert(name.to_string(), Table::new());
        Ok(0)
    }

    fn clear_table(&mut self, table: &str) -> EngineResult<u64> {
        let db_handle = self.db.clone();
        let mut db = db_handle.lock()?;
        let affected = self.view(&db, table)?.len() as u64;
        self.acquire_write(&mut db)?;
        self.write(
            &mut db,
            PendingOp::Clear {
                table: table.to_string(),
            },
        )?;
        Ok(affected)
    }

    fn set_identity_insert(&mut self, table: &str, on: bool) -> EngineResult<u64> {
        let mut db = self.lock_db()?;
        db.table(table)?;
        match (on, db.identity_insert.get(table).copied()) {
            (true, Some(holder)) if holder != self.id => Err(EngineError::locked(format!(
                "IDENTITY_INSERT is already ON for table '{table}' in another session"
            ))),
            (true, _) => {
                db.identity_insert.insert(table.to_string(), self.id);
                Ok(0)
            }
            (false, Some(holder)) if holder == self.id => {
                db.identity_insert.remove(table);
                Ok(0)
            }
            (false, _) => Ok(0),
        }
    }

    fn sync_sequence(&mut self, table: &str, value: Option<i64>) -> EngineResult<u64> {
        let db_handle = self.db.clone();
        let mut db = db_handle.lock()?;
        let current = match value {
            Some(value) => value,
            None => self
                .view(&db, table)?
                .keys()
                .next_back()
                .copied()
                .unwrap_or(0),
        };
        db.table_mut(table)?.next_id = current.max(0) + 1;
        Ok(1)
    }
}

#[async_trait]
impl EngineSession for MemorySession {
    fn bind(&mut self, ctx: &SessionContext) {
        self.signal = Some(ctx.cancel_signal().clone());
        self.deadline = ctx.deadline();
    }

    async fn begin(&mut self) -> EngineResult<()> {
        self.ensure_live()?;
        if self.tx.is_some() {
            return Err(EngineError::misuse(
                "cannot start a transaction within a transaction",
            ));
        }
        self.tx = Some(PendingTx::default());
        debug!(session = self.id, "memory engine transaction started");
        Ok(())
    }

    async fn commit(&mut self) -> EngineResult<()> {
        self.ensure_live()?;
        let Some(tx) = self.tx.take() else {
            return Err(EngineError::misuse(
                "cannot commit - no transaction is active",
            ));
        };

        let mut db = self.lock_db()?;
        let staged = tx.ops.len();
        for op in tx.ops {
            Self::apply(&mut db, op)?;
        }
        if tx.holds_write_lock && db.writer == Some(self.id) {
            db.writer = None;
        }
        debug!(session = self.id, staged, "memory engine transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> EngineResult<()> {
        if self.closed {
            return Err(EngineError::misuse("session is closed"));
        }
        match self.finish_tx()? {
            Some(tx) => {
                debug!(
                    session = self.id,
                    discarded = tx.ops.len(),
                    "memory engine transaction rolled back"
                );
                Ok(())
            }
            None => Err(EngineError::misuse(
                "cannot rollback - no transaction is active",
            )),
        }
    }

    async fn insert_one(&mut self, table: &str, id: Option<i64>, row: Row) -> EngineResult<i64> {
        self.ensure_live()?;
        let db_handle = self.db.clone();
        let mut db = db_handle.lock()?;
        db.table(table)?;
        self.acquire_write(&mut db)?;

        let identity_on = db.identity_insert.get(table) == Some(&self.id);
        let visible = self.view(&db, table)?;
        let mode = self.mode;
        let target = db.table_mut(table)?;

        let id = match id {
            Some(explicit) => {
                if mode == IdentityMode::Identity && !identity_on {
                    return Err(EngineError::constraint(format!(
                        "cannot insert explicit value for identity column in table '{table}' when IDENTITY_INSERT is set to OFF"
                    )));
                }
                if visible.contains_key(&explicit) {
                    return Err(EngineError::constraint(format!(
                        "UNIQUE constraint failed: {table}.id"
                    )));
                }
                if mode != IdentityMode::Sequence && explicit >= target.next_id {
                    target.next_id = explicit + 1;
                }
                explicit
            }
            None => {
                let generated = target.next_id;
                if visible.contains_key(&generated) {
                    return Err(EngineError::constraint(format!(
                        "duplicate key value violates unique constraint \"{table}_pkey\""
                    )));
                }
                target.next_id += 1;
                generated
            }
        };

        self.write(
            &mut db,
            PendingOp::Insert {
                table: table.to_string(),
                id,
                row,
            },
        )?;
        Ok(id)
    }

    async fn execute(&mut self, sql: &str) -> EngineResult<u64> {
        self.ensure_live()?;
        if let Some(caps) = CREATE_TABLE.captures(sql) {
            return self.create_table(&caps[2], caps.get(1).is_some());
        }
        if let Some(caps) = DELETE_FROM.captures(sql) {
            return self.clear_table(&caps[1]);
        }
        if let Some(caps) = IDENTITY_INSERT.captures(sql) {
            let on = caps[2].eq_ignore_ascii_case("on");
            return self.set_identity_insert(&caps[1], on);
        }
        if let Some(caps) = SETVAL.captures(sql) {
            let value = match caps.get(2) {
                Some(literal) => Some(literal.as_str().parse::<i64>().map_err(|err| {
                    EngineError::misuse(format!("invalid sequence value: {err}"))
                })?),
                None => None,
            };
            return self.sync_sequence(&caps[1], value);
        }
        Err(EngineError::unsupported(format!(
            "unsupported statement: {sql}"
        )))
    }

    async fn fetch(&mut self, table: &str, id: i64) -> EngineResult<Option<Row>> {
        self.ensure_live()?;
        let db = self.lock_db()?;
        Ok(self.view(&db, table)?.remove(&id))
    }

    async fn count(&mut self, table: &str) -> EngineResult<usize> {
        self.ensure_live()?;
        let db = self.lock_db()?;
        Ok(self.view(&db, table)?.len())
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tx = None;
        let mut db = self.lock_db()?;
        db.release(self.id);
        trace!(session = self.id, "memory engine session closed");
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorCode, Value};

    fn engine_with(table: &str) -> MemoryEngine {
        let engine = MemoryEngine::new();
        engine.create_table(table).expect("create table");
        engine
    }

    #[tokio::test]
    async fn test_autocommit_insert_generates_ids() {
        let engine = engine_with("user");
        let mut session = engine.open_session().expect("session");

        let first = session
            .insert_one("user", None, Row::new().with("login", "alice"))
            .await
            .expect("insert");
        let second = session
            .insert_one("user", None, Row::new().with("login", "bob"))
            .await
            .expect("insert");

        assert_eq!((first, second), (1, 2));
        assert_eq!(engine.committed_count("user").expect("count"), 2);
        let row = session.fetch("user", 2).await.expect("fetch").expect("row");
        assert_eq!(row.get("login"), Some(&Value::Text("bob".into())));
    }

    #[tokio::test]
    async fn test_transaction_staging_and_rollback() {
        let engine = engine_with("user");
        let mut session = engine.open_session().expect("session");

        session.begin().await.expect("begin");
        session.insert_one("user", None, Row::new()).await.expect("insert");
        assert_eq!(session.count("user").await.expect("count"), 1);
        assert_eq!(engine.committed_count("user").expect("count"), 0);
        assert!(engine.is_write_locked());

        session.rollback().await.expect("rollback");
        assert_eq!(session.count("user").await.expect("count"), 0);
        assert!(!engine.is_write_locked());
    }

    #[tokio::test]
    async fn test_second_writer_gets_busy_until_commit() {
        let engine = engine_with("user");
        let mut holder = engine.open_session().expect("session");
        let mut other = engine.open_session().expect("session");

        holder.begin().await.expect("begin");
        holder.insert_one("user", None, Row::new()).await.expect("insert");

        let err = other
            .insert_one("user", None, Row::new())
            .await
            .expect_err("write lock is held");
        assert_eq!(err.code, ErrorCode::Busy);

        holder.commit().await.expect("commit");
        other
            .insert_one("user", None, Row::new())
            .await
            .expect("lock released");
        assert_eq!(engine.committed_count("user").expect("count"), 2);
    }

    #[tokio::test]
    async fn test_dropping_session_releases_write_lock() {
        let engine = engine_with("user");
        {
            let mut session = engine.open_session().expect("session");
            session.begin().await.expect("begin");
            session.insert_one("user", None, Row::new()).await.expect("insert");
            assert!(engine.is_write_locked());
        }
        assert!(!engine.is_write_locked());
        assert_eq!(engine.committed_count("user").expect("count"), 0);
    }

    #[tokio::test]
    async fn test_transaction_state_errors() {
        let engine = engine_with("user");
        let mut session = engine.open_session().expect("session");

        assert_eq!(session.commit().await.expect_err("no tx").code, ErrorCode::Misuse);
        assert_eq!(session.rollback().await.expect_err("no tx").code, ErrorCode::Misuse);
        session.begin().await.expect("begin");
        assert_eq!(session.begin().await.expect_err("nested").code, ErrorCode::Misuse);
    }

    #[tokio::test]
    async fn test_execute_statements() {
        let engine = MemoryEngine::new();
        let mut session = engine.open_session().expect("session");

        session.execute("CREATE TABLE \"tag\"").await.expect("create");
        session
            .execute("create table if not exists tag;")
            .await
            .expect("idempotent create");
        session.insert_one("tag", None, Row::new()).await.expect("insert");
        session.insert_one("tag", None, Row::new()).await.expect("insert");

        assert_eq!(session.execute("DELETE FROM `tag`").await.expect("delete"), 2);
        assert_eq!(session.count("tag").await.expect("count"), 0);

        let err = session
            .execute("UPDATE tag SET name = 'x'")
            .await
            .expect_err("unsupported");
        assert_eq!(err.code, ErrorCode::Unsupported);
    }

    #[tokio::test]
    async fn test_identity_insert_conflict_is_locked() {
        let engine = MemoryEngine::with_identity_mode(IdentityMode::Identity);
        engine.create_table("team").expect("create");
        let mut first = engine.open_session().expect("session");
        let mut second = engine.open_session().expect("session");

        first
            .execute("SET IDENTITY_INSERT [team] ON")
            .await
            .expect("on");
        let err = second
            .execute("SET IDENTITY_INSERT [team] ON")
            .await
            .expect_err("held by first");
        assert_eq!(err.code, ErrorCode::Locked);

        first.close().await.expect("close");
        second
            .execute("SET IDENTITY_INSERT [team] ON")
            .await
            .expect("released on close");
    }

    #[tokio::test]
    async fn test_cancelled_binding_interrupts() {
        let engine = engine_with("user");
        let mut session = engine.open_session().expect("session");
        let ctx = SessionContext::new();
        session.bind(&ctx);

        ctx.cancel();
        let err = session.count("user").await.expect_err("cancelled");
        assert_eq!(err.code, ErrorCode::Interrupted);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let engine = engine_with("user");
        let mut session = engine.open_session().expect("session");
        session.close().await.expect("close");
        session.close().await.expect("close is idempotent");

        let err = session.count("user").await.expect_err("closed");
        assert_eq!(err.code, ErrorCode::Misuse);
    }
}
