//! SQLite-backed result database.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use czar_common::{CzarError, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode};
use tracing::{info, warn};

use crate::sql::{SqlConnection, SqlRows, SqlValue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Result database on one SQLite connection.
///
/// File-backed databases run in WAL mode and can be reopened by [`SqlConnection::reconnect`];
/// in-memory databases keep their single connection for their whole life.
pub struct SqliteConnection {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteConnection {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_file(&path)?;
        info!(path = %path.display(), operator = "SqliteConnection", "opened result database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CzarError::SqlConnection("result database lock poisoned".to_string()))
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).map_err(map_sqlite_error)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite_error)?;
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
        .map_err(map_sqlite_error)?;
    conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=memory;")
        .map_err(map_sqlite_error)?;
    Ok(conn)
}

/// Busy, locked and IO failures are connection-level and worth a reconnect.
fn map_sqlite_error(e: rusqlite::Error) -> CzarError {
    match e.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure,
        ) => CzarError::SqlConnection(e.to_string()),
        _ => CzarError::SqlStatement(e.to_string()),
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Integer(v),
            ValueRef::Real(v) => SqlValue::Real(v),
            ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
        }
    }
}

impl SqlConnection for SqliteConnection {
    fn run_query(&self, sql: &str) -> Result<SqlRows> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(map_sqlite_error)?;
        let columns = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(SqlValue::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(map_sqlite_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite_error)?;
        Ok(SqlRows { columns, rows })
    }

    fn execute(&self, sql: &str) -> Result<u64> {
        let conn = self.lock()?;
        let changed = conn.execute(sql, []).map_err(map_sqlite_error)?;
        Ok(changed as u64)
    }

    /// Runs all statements in one transaction.
    fn run_statements(&self, statements: &[String]) -> Result<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_sqlite_error)?;
        let mut changed = 0u64;
        for statement in statements {
            changed += tx.execute(statement, []).map_err(map_sqlite_error)? as u64;
        }
        tx.commit().map_err(map_sqlite_error)?;
        Ok(changed)
    }

    fn escape_string(&self, raw: &str) -> String {
        raw.replace('\'', "''")
    }

    fn reconnect(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let fresh = open_file(path)?;
        let mut conn = self.lock()?;
        *conn = fresh;
        warn!(path = %path.display(), operator = "SqliteConnection", "reconnected result database");
        Ok(())
    }
}
