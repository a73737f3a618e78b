//! Execution seam between plans and physical backends.
//!
//! Plans run against a [`VConn`]: a virtual connection that executes a
//! statement on a named data source. The production implementation is the
//! per-client session over the backend pools; tests substitute a mock.

mod session;

pub use session::{Runtime, RuntimeSession, Snapshot, SourceEntry};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{ProxyError, Result};
use crate::mysql::rows::{ResultSet, TextRow};
use crate::mysql::value::Value;

/// Outcome of a write statement, aggregated across shards by fan-out
/// plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

/// Bounded-channel capacity for row streams. Small enough to keep
/// backpressure on fast backends, large enough to hide scheduling jitter.
pub const ROW_CHANNEL_CAPACITY: usize = 64;

pub type RowSender = mpsc::Sender<Result<TextRow>>;

/// A streaming result: the column descriptors plus a bounded channel of
/// rows. Row payloads are reference-counted buffers; ownership passes
/// from the backend reader to the consumer without copying.
pub struct DataSet {
    fields: Arc<ResultSet>,
    rx: mpsc::Receiver<Result<TextRow>>,
}

impl DataSet {
    pub fn channel(fields: Arc<ResultSet>) -> (RowSender, DataSet) {
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        (tx, DataSet { fields, rx })
    }

    pub(crate) fn from_parts(
        fields: Arc<ResultSet>,
        rx: mpsc::Receiver<Result<TextRow>>,
    ) -> DataSet {
        DataSet { fields, rx }
    }

    /// A fully materialized result, used by tests and by composers that
    /// must buffer.
    pub fn from_rows(fields: Arc<ResultSet>, rows: Vec<TextRow>) -> DataSet {
        let (tx, ds) = DataSet::channel(fields);
        tokio::spawn(async move {
            for row in rows {
                if tx.send(Ok(row)).await.is_err() {
                    break;
                }
            }
        });
        ds
    }

    pub fn fields(&self) -> &Arc<ResultSet> {
        &self.fields
    }

    pub async fn next_row(&mut self) -> Option<Result<TextRow>> {
        self.rx.recv().await
    }

    /// Drains the stream into memory. Test helper; composers stream.
    pub async fn collect(mut self) -> Result<Vec<TextRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

/// Either shape a statement execution can produce.
pub enum ExecuteResult {
    Write(WriteResult),
    Query(DataSet),
}

impl ExecuteResult {
    pub fn into_write(self) -> Result<WriteResult> {
        match self {
            ExecuteResult::Write(w) => Ok(w),
            ExecuteResult::Query(_) => Err(ProxyError::ProtocolFraming(
                "expected a write result, got a row stream".to_string(),
            )),
        }
    }

    pub fn into_query(self) -> Result<DataSet> {
        match self {
            ExecuteResult::Query(ds) => Ok(ds),
            ExecuteResult::Write(_) => Err(ProxyError::ProtocolFraming(
                "expected a row stream, got a write result".to_string(),
            )),
        }
    }
}

/// Virtual connection plans execute against. `db` names a data source
/// from the active configuration snapshot.
#[async_trait]
pub trait VConn: Send + Sync {
    async fn query(&self, db: &str, sql: &str, args: &[Value]) -> Result<DataSet>;
    async fn exec(&self, db: &str, sql: &str, args: &[Value]) -> Result<WriteResult>;
}

pub type VConnRef = Arc<dyn VConn>;

/// Client-side placeholder interpolation: replaces each `?` outside
/// string literals and backquoted identifiers with the corresponding
/// arg rendered as a SQL literal.
pub fn interpolate_params(sql: &str, args: &[Value]) -> Result<String> {
    if args.is_empty() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len() + args.len() * 8);
    let mut arg_iter = args.iter();
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == '\\' && q != '`' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                '?' => {
                    let arg = arg_iter.next().ok_or_else(|| {
                        ProxyError::Routing("not enough arguments for placeholders".to_string())
                    })?;
                    out.push_str(&arg.to_sql_literal());
                }
                _ => out.push(c),
            },
        }
    }

    if arg_iter.next().is_some() {
        return Err(ProxyError::Routing(
            "more arguments than placeholders".to_string(),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolation_replaces_in_order() {
        let sql = "select id from t where a = ? and b in (?, ?)";
        let out = interpolate_params(
            sql,
            &[Value::Int(1), Value::from_str("x"), Value::Int(3)],
        )
        .unwrap();
        assert_eq!(out, "select id from t where a = 1 and b in ('x', 3)");
    }

    #[test]
    fn interpolation_skips_quoted_question_marks() {
        let sql = "select '?' as q, `weird?col` from t where id = ?";
        let out = interpolate_params(sql, &[Value::Int(9)]).unwrap();
        assert_eq!(out, "select '?' as q, `weird?col` from t where id = 9");
    }

    #[test]
    fn interpolation_arity_mismatch() {
        // no bound args: statement passes through untouched
        assert!(interpolate_params("select ?", &[]).is_ok());
        assert!(interpolate_params("select ? ,?", &[Value::Int(1)]).is_err());
        assert!(interpolate_params("select 1", &[Value::Int(1)]).is_err());
    }

    #[tokio::test]
    async fn dataset_streams_rows_in_order() {
        use crate::mysql::protocol::FieldType;
        use crate::mysql::rows::Field;

        let rs = ResultSet::new(vec![Field::new("n", FieldType::Long)]);
        let rows: Vec<TextRow> = (0..5)
            .map(|i| TextRow::encode(&[Value::Int(i)], rs.clone()))
            .collect();
        let ds = DataSet::from_rows(rs, rows);
        let collected = ds.collect().await.unwrap();
        assert_eq!(collected.len(), 5);
        assert_eq!(collected[2].decode().unwrap()[0], Value::Bytes(b"2".to_vec()));
    }
}
