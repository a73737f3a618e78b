//! Executable plans.
//!
//! The optimizer lowers every statement to one immutable [`Plan`] tree;
//! `exec_in` walks it against a [`VConn`]. Fan-out nodes run their
//! children concurrently, composers stream rows over bounded channels.

pub mod aggregate;
pub mod fanout;
pub mod limit;
pub mod merge;

pub use aggregate::{AggFunc, AggSpec, AggregatePlan, OutputColumn};
pub use fanout::{BroadcastPlan, FanOutPlan};
pub use limit::LimitPlan;
pub use merge::{MergePlan, SortKey};

use futures::future::BoxFuture;

use crate::error::Result;
use crate::mysql::value::Value;
use crate::runtime::{ExecuteResult, VConnRef, WriteResult};

/// One backend execution: a rewritten statement against a named data
/// source, with its reordered argument list.
#[derive(Debug, Clone)]
pub struct SinglePlan {
    pub db: String,
    pub sql: String,
    pub args: Vec<Value>,
    pub returns_rows: bool,
}

impl SinglePlan {
    pub fn query(db: &str, sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            db: db.to_string(),
            sql: sql.into(),
            args,
            returns_rows: true,
        }
    }

    pub fn exec(db: &str, sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            db: db.to_string(),
            sql: sql.into(),
            args,
            returns_rows: false,
        }
    }
}

/// The executable plan sum type. Nodes are immutable after construction.
#[derive(Debug, Clone)]
pub enum Plan {
    /// A write that affects nothing (0 rows, 0 insert-id).
    AlwaysEmpty,
    Single(SinglePlan),
    /// Concatenation of child streams in arbitrary (first-ready) order.
    Union(Vec<Plan>),
    /// K-way merge of sorted child streams.
    OrderedMerge(MergePlan),
    /// Stream-group aggregation over a group-sorted input.
    Aggregate(AggregatePlan),
    Limit(LimitPlan),
    InsertFanOut(FanOutPlan),
    UpdateFanOut(FanOutPlan),
    DeleteFanOut(FanOutPlan),
    /// DDL / admin statement sent to every physical database.
    Broadcast(BroadcastPlan),
}

impl Plan {
    pub fn exec_in<'a>(
        &'a self,
        vconn: VConnRef,
    ) -> BoxFuture<'a, Result<ExecuteResult>> {
        Box::pin(async move {
            match self {
                Plan::AlwaysEmpty => Ok(ExecuteResult::Write(WriteResult::default())),

                Plan::Single(single) => {
                    if single.returns_rows {
                        let ds = vconn.query(&single.db, &single.sql, &single.args).await?;
                        Ok(ExecuteResult::Query(ds))
                    } else {
                        let w = vconn.exec(&single.db, &single.sql, &single.args).await?;
                        Ok(ExecuteResult::Write(w))
                    }
                }

                Plan::Union(children) => Ok(ExecuteResult::Query(
                    fanout::exec_union(children, vconn).await?,
                )),

                Plan::OrderedMerge(merge) => {
                    Ok(ExecuteResult::Query(merge.exec_in(vconn).await?))
                }

                Plan::Aggregate(agg) => Ok(ExecuteResult::Query(agg.exec_in(vconn).await?)),

                Plan::Limit(limit) => Ok(ExecuteResult::Query(limit.exec_in(vconn).await?)),

                Plan::InsertFanOut(fanout)
                | Plan::UpdateFanOut(fanout)
                | Plan::DeleteFanOut(fanout) => {
                    Ok(ExecuteResult::Write(fanout.exec_in(vconn).await?))
                }

                Plan::Broadcast(broadcast) => {
                    Ok(ExecuteResult::Write(broadcast.exec_in(vconn).await?))
                }
            }
        })
    }

    /// Number of Single leaves; used by routing diagnostics.
    pub fn shard_count(&self) -> usize {
        match self {
            Plan::AlwaysEmpty => 0,
            Plan::Single(_) => 1,
            Plan::Union(children) => children.iter().map(Plan::shard_count).sum(),
            Plan::OrderedMerge(m) => m.children.iter().map(Plan::shard_count).sum(),
            Plan::Aggregate(a) => a.input.shard_count(),
            Plan::Limit(l) => l.input.shard_count(),
            Plan::InsertFanOut(f) | Plan::UpdateFanOut(f) | Plan::DeleteFanOut(f) => {
                f.shards.len()
            }
            Plan::Broadcast(b) => b.dbs.len(),
        }
    }
}
