//! Row batches received from workers, tagged with their job attempt.
//!
//! Workers ship rows as an Arrow IPC stream. A [`VirtualFile`] holds the decoded batches of one
//! response and renders them as `CREATE TABLE` / `INSERT` statements for the merge table, each
//! row carrying the attempt tag in [`ATTEMPT_COLUMN`].

use std::io::Cursor;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type, UInt32Type,
    UInt64Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, SchemaRef};
use czar_common::{CzarError, JobAttemptId, Result};

use crate::sql::{quote_ident, SqlConnection};

/// Internal merge-table column holding [`JobAttemptId::encode`].
pub const ATTEMPT_COLUMN: &str = "czar_job_attempt";

/// Encode a set of record batches as Arrow IPC stream bytes.
pub fn encode_record_batches_ipc(batches: &[RecordBatch]) -> Result<Vec<u8>> {
    if batches.is_empty() {
        return Ok(Vec::new());
    }
    let schema = batches[0].schema();
    let mut out = Vec::<u8>::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| CzarError::Merge(format!("ipc writer init failed: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| CzarError::Merge(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| CzarError::Merge(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode Arrow IPC stream bytes; empty input decodes to no batches.
pub fn decode_ipc_bytes(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let reader = arrow::ipc::reader::StreamReader::try_new(Cursor::new(bytes), None)
        .map_err(|e| CzarError::Merge(format!("ipc reader init failed: {e}")))?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CzarError::Merge(format!("ipc read failed: {e}")))
}

/// Decoded rows of one worker response.
#[derive(Debug, Clone)]
pub struct VirtualFile {
    pub job_attempt: JobAttemptId,
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

impl VirtualFile {
    /// Decode `ipc_bytes`. Returns `None` when the stream carries no rows.
    pub fn from_ipc(job_attempt: JobAttemptId, ipc_bytes: &[u8]) -> Result<Option<Self>> {
        let batches = decode_ipc_bytes(ipc_bytes)?;
        let Some(first) = batches.first() else {
            return Ok(None);
        };
        let schema = first.schema();
        if batches.iter().all(|b| b.num_rows() == 0) {
            return Ok(None);
        }
        for field in schema.fields() {
            if field.name() == ATTEMPT_COLUMN {
                return Err(CzarError::Merge(format!(
                    "column name '{ATTEMPT_COLUMN}' is reserved"
                )));
            }
            sql_type(field)?;
        }
        Ok(Some(Self {
            job_attempt,
            schema,
            batches,
        }))
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// `CREATE TABLE` for a merge table holding rows of this shape.
    pub fn create_table_sql(&self, table: &str) -> Result<String> {
        create_table_sql(&self.schema, table)
    }

    /// `INSERT` statements with at most `rows_per_statement` rows each.
    pub fn insert_statements(
        &self,
        table: &str,
        conn: &dyn SqlConnection,
        rows_per_statement: usize,
    ) -> Result<Vec<String>> {
        let mut columns = self
            .schema
            .fields()
            .iter()
            .map(|f| quote_ident(f.name()))
            .collect::<Vec<_>>();
        columns.push(quote_ident(ATTEMPT_COLUMN));
        let prefix = format!("INSERT INTO {} ({}) VALUES ", quote_ident(table), columns.join(", "));
        let tag = self.job_attempt.encode();
        let rows_per_statement = rows_per_statement.max(1);

        let mut statements = Vec::new();
        let mut values = Vec::with_capacity(rows_per_statement);
        for batch in &self.batches {
            for row in 0..batch.num_rows() {
                let mut cells = Vec::with_capacity(batch.num_columns() + 1);
                for column in batch.columns() {
                    cells.push(cell_literal(column, row, conn)?);
                }
                cells.push(tag.to_string());
                values.push(format!("({})", cells.join(", ")));
                if values.len() == rows_per_statement {
                    statements.push(format!("{prefix}{}", values.join(", ")));
                    values.clear();
                }
            }
        }
        if !values.is_empty() {
            statements.push(format!("{prefix}{}", values.join(", ")));
        }
        Ok(statements)
    }

    /// True if `other` has the same column names and types.
    pub fn same_shape(&self, other: &SchemaRef) -> bool {
        same_shape(&self.schema, other)
    }
}

pub(crate) fn same_shape(a: &SchemaRef, b: &SchemaRef) -> bool {
    a.fields().len() == b.fields().len()
        && a
            .fields()
            .iter()
            .zip(b.fields().iter())
            .all(|(x, y)| x.name() == y.name() && x.data_type() == y.data_type())
}

pub(crate) fn create_table_sql(schema: &SchemaRef, table: &str) -> Result<String> {
    let mut columns = Vec::with_capacity(schema.fields().len() + 1);
    for field in schema.fields() {
        columns.push(format!("{} {}", quote_ident(field.name()), sql_type(field)?));
    }
    columns.push(format!("{} INTEGER NOT NULL", quote_ident(ATTEMPT_COLUMN)));
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(table),
        columns.join(", ")
    ))
}

fn sql_type(field: &Field) -> Result<&'static str> {
    match field.data_type() {
        DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => Ok("INTEGER"),
        DataType::Float32 | DataType::Float64 => Ok("REAL"),
        DataType::Utf8 | DataType::LargeUtf8 => Ok("TEXT"),
        other => Err(CzarError::Unsupported(format!(
            "column '{}' has unsupported type {other}",
            field.name()
        ))),
    }
}

fn float_literal(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else {
        "NULL".to_string()
    }
}

fn cell_literal(array: &ArrayRef, row: usize, conn: &dyn SqlConnection) -> Result<String> {
    if array.is_null(row) {
        return Ok("NULL".to_string());
    }
    let literal = match array.data_type() {
        DataType::Boolean => {
            if array.as_boolean().value(row) {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        DataType::Int8 => array.as_primitive::<Int8Type>().value(row).to_string(),
        DataType::Int16 => array.as_primitive::<Int16Type>().value(row).to_string(),
        DataType::Int32 => array.as_primitive::<Int32Type>().value(row).to_string(),
        DataType::Int64 => array.as_primitive::<Int64Type>().value(row).to_string(),
        DataType::UInt8 => array.as_primitive::<UInt8Type>().value(row).to_string(),
        DataType::UInt16 => array.as_primitive::<UInt16Type>().value(row).to_string(),
        DataType::UInt32 => array.as_primitive::<UInt32Type>().value(row).to_string(),
        // SQL integers are signed 64-bit; larger values would be stored as REAL.
        DataType::UInt64 => {
            let value = array.as_primitive::<UInt64Type>().value(row);
            i64::try_from(value)
                .map_err(|_| {
                    CzarError::Unsupported(format!(
                        "unsigned value {value} exceeds the SQL integer range"
                    ))
                })?
                .to_string()
        }
        DataType::Float32 => {
            float_literal(f64::from(array.as_primitive::<Float32Type>().value(row)))
        }
        DataType::Float64 => float_literal(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => format!("'{}'", conn.escape_string(array.as_string::<i32>().value(row))),
        DataType::LargeUtf8 => {
            format!("'{}'", conn.escape_string(array.as_string::<i64>().value(row)))
        }
        other => {
            return Err(CzarError::Unsupported(format!(
                "cannot merge values of type {other}"
            )))
        }
    };
    Ok(literal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteConnection;
    use arrow::array::{Float64Array, Int64Array, StringArray, UInt64Array};
    use arrow_schema::Schema;
    use czar_common::JobId;
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("ra", DataType::Float64, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a'b"), None, Some("c")])),
                Arc::new(Float64Array::from(vec![Some(1.5), Some(f64::NAN), None])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn empty_stream_has_no_rows() {
        let attempt = JobAttemptId::new(JobId(1), 1);
        assert!(VirtualFile::from_ipc(attempt, &[]).expect("empty").is_none());
    }

    #[test]
    fn rejects_garbage_bytes() {
        let attempt = JobAttemptId::new(JobId(1), 1);
        let err = VirtualFile::from_ipc(attempt, b"not arrow").expect_err("garbage");
        assert!(matches!(err, CzarError::Merge(_)));
    }

    #[test]
    fn renders_tagged_inserts_in_bounded_statements() {
        let conn = SqliteConnection::open_in_memory().expect("open");
        let attempt = JobAttemptId::new(JobId(4), 2);
        let ipc = encode_record_batches_ipc(&[batch()]).expect("encode");
        let file = VirtualFile::from_ipc(attempt, &ipc)
            .expect("decode")
            .expect("rows");
        assert_eq!(file.num_rows(), 3);

        conn.execute(&file.create_table_sql("m").expect("ddl")).expect("create");
        let statements = file.insert_statements("m", &conn, 2).expect("inserts");
        assert_eq!(statements.len(), 2);
        conn.run_statements(&statements).expect("insert");

        let rows = conn
            .run_query("SELECT id, name, ra, czar_job_attempt FROM m ORDER BY id")
            .expect("query");
        assert_eq!(rows.rows.len(), 3);
        assert_eq!(rows.rows[0][1], crate::sql::SqlValue::Text("a'b".to_string()));
        assert_eq!(rows.rows[1][1], crate::sql::SqlValue::Null);
        assert_eq!(rows.rows[1][2], crate::sql::SqlValue::Null);
        assert_eq!(rows.rows[2][3], crate::sql::SqlValue::Integer(4002));
    }

    #[test]
    fn reserved_column_name_is_rejected() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            ATTEMPT_COLUMN,
            DataType::Int64,
            false,
        )]));
        let b = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1]))])
            .expect("batch");
        let ipc = encode_record_batches_ipc(&[b]).expect("encode");
        let attempt = JobAttemptId::new(JobId(1), 1);
        assert!(VirtualFile::from_ipc(attempt, &ipc).is_err());
    }

    #[test]
    fn unsigned_values_beyond_sql_integer_range_are_rejected() {
        let conn = SqliteConnection::open_in_memory().expect("open");
        let schema = Arc::new(Schema::new(vec![Field::new("n", DataType::UInt64, false)]));
        let attempt = JobAttemptId::new(JobId(1), 1);
        let file_of = |values: Vec<u64>| {
            let b = RecordBatch::try_new(
                Arc::clone(&schema),
                vec![Arc::new(UInt64Array::from(values))],
            )
            .expect("batch");
            let ipc = encode_record_batches_ipc(&[b]).expect("encode");
            VirtualFile::from_ipc(attempt, &ipc)
                .expect("decode")
                .expect("rows")
        };

        let fits = file_of(vec![i64::MAX as u64]);
        conn.execute(&fits.create_table_sql("m").expect("ddl")).expect("create");
        conn.run_statements(&fits.insert_statements("m", &conn, 10).expect("inserts"))
            .expect("insert");
        let rows = conn.run_query("SELECT n FROM m").expect("query");
        assert_eq!(rows.rows[0][0], crate::sql::SqlValue::Integer(i64::MAX));

        let err = file_of(vec![1, u64::MAX])
            .insert_statements("m", &conn, 10)
            .expect_err("out of range");
        assert!(matches!(err, CzarError::Unsupported(_)));
    }
}
