//! Result-database connection boundary.

use czar_common::Result;

/// One cell returned by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Rows returned by [`SqlConnection::run_query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl SqlRows {
    /// First cell of the first row as an integer, e.g. for `SELECT COUNT(*)`.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self.rows.first().and_then(|row| row.first()) {
            Some(SqlValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }
}

/// SQL-executing connection used by the merger.
///
/// Calls are blocking; async callers run them on the blocking pool.
/// [`czar_common::CzarError::SqlConnection`] errors are retried after [`Self::reconnect`],
/// every other error is final.
pub trait SqlConnection: Send + Sync {
    fn run_query(&self, sql: &str) -> Result<SqlRows>;

    /// Run one statement that returns no rows. Returns the number of changed rows.
    fn execute(&self, sql: &str) -> Result<u64>;

    /// Run statements in order; implementations may make them atomic.
    fn run_statements(&self, statements: &[String]) -> Result<u64> {
        let mut changed = 0;
        for statement in statements {
            changed += self.execute(statement)?;
        }
        Ok(changed)
    }

    /// Escape `raw` for use inside a single-quoted SQL literal.
    fn escape_string(&self, raw: &str) -> String;

    fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)))
            .map(|_| ())
    }

    fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Double-quote an identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
