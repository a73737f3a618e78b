use crate::error::Result;
use crate::runtime::{DataSet, VConnRef};

use super::Plan;

/// Drops the first `offset` rows of the input, then emits up to `count`
/// rows and closes the stream.
#[derive(Debug, Clone)]
pub struct LimitPlan {
    pub input: Box<Plan>,
    pub offset: u64,
    pub count: u64,
}

impl LimitPlan {
    pub(super) async fn exec_in(&self, vconn: VConnRef) -> Result<DataSet> {
        let mut input = self.input.exec_in(vconn).await?.into_query()?;
        let (tx, out) = DataSet::channel(input.fields().clone());
        let offset = self.offset;
        let count = self.count;

        tokio::spawn(async move {
            let mut skipped = 0u64;
            let mut emitted = 0u64;
            while emitted < count {
                match input.next_row().await {
                    Some(Ok(row)) => {
                        if skipped < offset {
                            skipped += 1;
                            continue;
                        }
                        if tx.send(Ok(row)).await.is_err() {
                            return;
                        }
                        emitted += 1;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => return,
                }
            }
            // dropping `input` closes the upstream; producers notice on
            // their next send
        });

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{Plan, SinglePlan};
    use super::*;
    use crate::mysql::protocol::FieldType;
    use crate::mysql::rows::{Field, ResultSet, TextRow};
    use crate::mysql::value::Value;
    use crate::runtime::{ExecuteResult, VConn, WriteResult};
    use async_trait::async_trait;

    struct CountingConn {
        rows: u64,
    }

    #[async_trait]
    impl VConn for CountingConn {
        async fn query(&self, _db: &str, _sql: &str, _args: &[Value]) -> Result<DataSet> {
            let rs = ResultSet::new(vec![Field::new("n", FieldType::Long)]);
            let rows: Vec<TextRow> = (0..self.rows)
                .map(|i| TextRow::encode(&[Value::Int(i as i64)], rs.clone()))
                .collect();
            Ok(DataSet::from_rows(rs, rows))
        }

        async fn exec(&self, _db: &str, _sql: &str, _args: &[Value]) -> Result<WriteResult> {
            Ok(WriteResult::default())
        }
    }

    async fn run_limit(stream_len: u64, offset: u64, count: u64) -> u64 {
        let plan = Plan::Limit(LimitPlan {
            input: Box::new(Plan::Single(SinglePlan::query(
                "ds0",
                "select n from t",
                vec![],
            ))),
            offset,
            count,
        });
        let conn = Arc::new(CountingConn { rows: stream_len });
        let result = plan.exec_in(conn).await.unwrap();
        match result {
            ExecuteResult::Query(ds) => ds.collect().await.unwrap().len() as u64,
            ExecuteResult::Write(_) => panic!("expected rows"),
        }
    }

    #[tokio::test]
    async fn limit_arithmetic() {
        // min(count, max(0, len - offset))
        assert_eq!(run_limit(10, 0, 3).await, 3);
        assert_eq!(run_limit(10, 8, 5).await, 2);
        assert_eq!(run_limit(10, 12, 5).await, 0);
        assert_eq!(run_limit(10, 0, 0).await, 0);
        assert_eq!(run_limit(4, 1, 10).await, 3);
    }
}
