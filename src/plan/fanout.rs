use std::sync::Arc;

use tracing::warn;

use crate::error::{ProxyError, Result};
use crate::mysql::rows::ResultSet;
use crate::runtime::{DataSet, ExecuteResult, VConnRef, WriteResult};

use super::{Plan, SinglePlan};

/// Per-shard rewrites of one write statement, executed concurrently.
/// Affected rows are summed; the last-insert-id is the maximum across
/// shards so the session-visible value stays monotonic.
#[derive(Debug, Clone)]
pub struct FanOutPlan {
    pub shards: Vec<SinglePlan>,
}

impl FanOutPlan {
    pub(super) async fn exec_in(&self, vconn: VConnRef) -> Result<WriteResult> {
        let results = futures::future::join_all(self.shards.iter().map(|shard| {
            let shard = shard.clone();
            let vconn = vconn.clone();
            async move { vconn.exec(&shard.db, &shard.sql, &shard.args).await }
        }))
        .await;
        merge_write_results(results)
    }
}

/// Fire-and-forget write on every physical database; DDL and admin
/// statements use this.
#[derive(Debug, Clone)]
pub struct BroadcastPlan {
    pub dbs: Vec<String>,
    pub sql: String,
}

impl BroadcastPlan {
    pub(super) async fn exec_in(&self, vconn: VConnRef) -> Result<WriteResult> {
        let results = futures::future::join_all(self.dbs.iter().map(|db| {
            let db = db.clone();
            let sql = self.sql.clone();
            let vconn = vconn.clone();
            async move { vconn.exec(&db, &sql, &[]).await }
        }))
        .await;
        merge_write_results(results)
    }
}

/// All shards are awaited; the first error (in shard order) wins and the
/// surviving results are discarded. Later errors are logged only.
fn merge_write_results(results: Vec<Result<WriteResult>>) -> Result<WriteResult> {
    let mut merged = WriteResult::default();
    let mut first_err = None;
    for result in results {
        match result {
            Ok(one) => {
                merged.affected_rows += one.affected_rows;
                merged.last_insert_id = merged.last_insert_id.max(one.last_insert_id);
                merged.status_flags = one.status_flags;
                merged.warnings += one.warnings;
            }
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                } else {
                    warn!(error = %e, "discarding secondary fan-out error");
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(merged),
    }
}

/// Concatenates child row streams in first-ready order.
pub(super) async fn exec_union(children: &[Plan], vconn: VConnRef) -> Result<DataSet> {
    let (tx, rx) = tokio::sync::mpsc::channel(crate::runtime::ROW_CHANNEL_CAPACITY);
    let (ftx, mut frx) =
        tokio::sync::mpsc::channel::<Arc<ResultSet>>(children.len().max(1));

    for child in children {
        let child = child.clone();
        let vconn = vconn.clone();
        let tx = tx.clone();
        let ftx = ftx.clone();
        tokio::spawn(async move {
            match child
                .exec_in(vconn)
                .await
                .and_then(ExecuteResult::into_query)
            {
                Ok(mut ds) => {
                    let _ = ftx.try_send(ds.fields().clone());
                    drop(ftx);
                    while let Some(row) = ds.next_row().await {
                        let stop = row.is_err();
                        if tx.send(row).await.is_err() || stop {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
    }
    drop(tx);
    drop(ftx);

    match frx.recv().await {
        Some(fields) => Ok(DataSet::from_parts(fields, rx)),
        None => {
            // no child produced a result set; surface the first error
            let mut rx = rx;
            while let Some(row) = rx.recv().await {
                if let Err(e) = row {
                    return Err(e);
                }
            }
            Err(ProxyError::Routing(
                "union produced no result sets".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_results_sum_affected_and_max_insert_id() {
        let merged = merge_write_results(vec![
            Ok(WriteResult {
                affected_rows: 2,
                last_insert_id: 10,
                ..Default::default()
            }),
            Ok(WriteResult {
                affected_rows: 1,
                last_insert_id: 4,
                ..Default::default()
            }),
        ])
        .unwrap();
        assert_eq!(merged.affected_rows, 3);
        assert_eq!(merged.last_insert_id, 10);
    }

    #[test]
    fn first_error_wins() {
        let out = merge_write_results(vec![
            Ok(WriteResult::default()),
            Err(ProxyError::Routing("first".to_string())),
            Err(ProxyError::Routing("second".to_string())),
        ]);
        match out {
            Err(ProxyError::Routing(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
