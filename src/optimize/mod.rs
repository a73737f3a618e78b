//! The statement optimizer: parsed AST + sharding rule + bound args in,
//! executable [`Plan`] out.

mod dml;
mod rewrite;
mod select;

pub use rewrite::{normalize_insert_set, KeyCondition};

use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::mysql::value::Value;
use crate::plan::{Plan, SinglePlan};
use crate::rule::ShardingRule;

/// Parses one statement. MySQL's `INSERT ... SET` form is normalized to
/// the column-list form first; anything else the parser rejects is
/// reported to the caller, which may still pass the raw SQL through.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let dialect = MySqlDialect {};
    let parsed = Parser::parse_sql(&dialect, sql).or_else(|first_err| {
        match normalize_insert_set(sql) {
            Some(normalized) => Parser::parse_sql(&dialect, &normalized),
            None => Err(first_err),
        }
    });

    let mut statements = parsed
        .map_err(|e| ProxyError::Unsupported(format!("SQL parse error: {}", e)))?;
    if statements.len() != 1 {
        return Err(ProxyError::Unsupported(
            "multi-statement scripts are not supported".to_string(),
        ));
    }
    Ok(statements.remove(0))
}

/// Lowers one statement onto the current rule snapshot.
pub struct Optimizer<'a> {
    pub rule: &'a ShardingRule,
    pub default_db: &'a str,
}

impl<'a> Optimizer<'a> {
    pub fn new(rule: &'a ShardingRule, default_db: &'a str) -> Optimizer<'a> {
        Optimizer { rule, default_db }
    }

    pub fn optimize(&self, sql: &str, stmt: &Statement, args: &[Value]) -> Result<Plan> {
        let plan = match stmt {
            Statement::Query(_) => {
                select::optimize_query(self.rule, self.default_db, sql, stmt, args)?
            }
            Statement::Insert { .. } => {
                dml::optimize_insert(self.rule, self.default_db, sql, stmt, args)?
            }
            Statement::Update { .. } => {
                dml::optimize_update(self.rule, self.default_db, sql, stmt, args)?
            }
            Statement::Delete { .. } => {
                dml::optimize_delete(self.rule, self.default_db, sql, stmt, args)?
            }
            Statement::CreateTable { .. }
            | Statement::AlterTable { .. }
            | Statement::Drop { .. }
            | Statement::Truncate { .. }
            | Statement::CreateIndex { .. } => {
                dml::optimize_ddl(self.rule, self.default_db, sql, stmt)?
            }
            Statement::ShowVariable { .. }
            | Statement::ShowTables { .. }
            | Statement::ShowColumns { .. }
            | Statement::ShowCreate { .. }
            | Statement::ShowFunctions { .. } => {
                Plan::Single(SinglePlan::query(self.default_db, sql, args.to_vec()))
            }
            _ => Plan::Single(SinglePlan::exec(self.default_db, sql, args.to_vec())),
        };

        debug!(shards = plan.shard_count(), "optimized statement");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AggFunc, OutputColumn};
    use crate::rule::{ShardAlgorithm, TableRule};

    fn fake_rule(shards: u32) -> ShardingRule {
        ShardingRule {
            tables: vec![TableRule {
                logical_table: "student".to_string(),
                shard_column: "uid".to_string(),
                algorithm: ShardAlgorithm::Modulo { shards },
                db_pattern: "fake_db_${0000}".to_string(),
                table_pattern: "student".to_string(),
                allow_full_scan: false,
            }],
        }
    }

    fn optimize(sql: &str, args: &[Value]) -> Result<Plan> {
        let rule = fake_rule(8);
        let stmt = parse_statement(sql)?;
        Optimizer::new(&rule, "employees_0000").optimize(sql, &stmt, args)
    }

    #[test]
    fn select_with_in_list_prunes_to_three_shards() {
        let plan = optimize(
            "select id, uid from student where uid in (?,?,?)",
            &[Value::Int(1), Value::Int(2), Value::Int(3)],
        )
        .unwrap();

        let Plan::Union(children) = plan else {
            panic!("expected a union");
        };
        assert_eq!(children.len(), 3);
        let dbs: Vec<&str> = children
            .iter()
            .map(|c| match c {
                Plan::Single(s) => s.db.as_str(),
                _ => panic!("expected single children"),
            })
            .collect();
        assert_eq!(dbs, vec!["fake_db_0001", "fake_db_0002", "fake_db_0003"]);
        for child in &children {
            let Plan::Single(single) = child else {
                unreachable!()
            };
            assert!(single.sql.to_lowercase().contains("student"));
            assert_eq!(single.args.len(), 3);
        }
    }

    #[test]
    fn physical_table_pattern_rewrites_names() {
        let mut rule = fake_rule(8);
        rule.tables[0].table_pattern = "student_${0000}".to_string();
        let sql = "select id from student where uid = 2";
        let stmt = parse_statement(sql).unwrap();
        let plan = Optimizer::new(&rule, "d").optimize(sql, &stmt, &[]).unwrap();
        let Plan::Single(single) = plan else {
            panic!("expected a single");
        };
        assert_eq!(single.db, "fake_db_0002");
        assert!(single.sql.contains("student_0002"), "sql: {}", single.sql);
        assert!(!single.sql.contains("student_0002 student"));
    }

    #[test]
    fn select_with_key_equality_is_a_single() {
        let plan = optimize(
            "select id, uid from student where uid = ?",
            &[Value::Int(11)],
        )
        .unwrap();
        let Plan::Single(single) = plan else {
            panic!("expected a single");
        };
        assert_eq!(single.db, "fake_db_0003");
        assert!(single.returns_rows);
    }

    #[test]
    fn select_without_key_fans_out_to_all() {
        let plan = optimize("select id from student where age > 10", &[]).unwrap();
        assert_eq!(plan.shard_count(), 8);
        assert!(matches!(plan, Plan::Union(_)));
    }

    #[test]
    fn unknown_table_routes_to_default_source() {
        let plan = optimize("select * from abc where id = 1", &[]).unwrap();
        let Plan::Single(single) = plan else {
            panic!("expected a single");
        };
        assert_eq!(single.db, "employees_0000");
        assert_eq!(single.sql, "select * from abc where id = 1");
    }

    #[test]
    fn insert_groups_rows_by_shard() {
        let plan = optimize(
            "insert into student(name,uid,age) values('foo',?,18),('bar',?,19),('qux',?,17)",
            &[Value::Int(8), Value::Int(9), Value::Int(16)],
        )
        .unwrap();

        let Plan::InsertFanOut(fanout) = plan else {
            panic!("expected an insert fan-out");
        };
        assert_eq!(fanout.shards.len(), 2);

        let first = &fanout.shards[0];
        assert_eq!(first.db, "fake_db_0000");
        assert_eq!(first.sql.matches('(').count() - 1, 2, "two rows: {}", first.sql);
        assert_eq!(first.args, vec![Value::Int(8), Value::Int(16)]);

        let second = &fanout.shards[1];
        assert_eq!(second.db, "fake_db_0001");
        assert_eq!(second.args, vec![Value::Int(9)]);
        assert!(second.sql.contains("'bar'"));
    }

    #[test]
    fn insert_set_form_on_unsharded_table_passes_through() {
        let sql = "insert into abc set name='foo',uid=?,age=18";
        let plan = optimize(sql, &[Value::Int(1)]).unwrap();
        let Plan::Single(single) = plan else {
            panic!("expected a single");
        };
        assert_eq!(single.db, "employees_0000");
        assert_eq!(single.sql, sql);
        assert!(!single.returns_rows);
    }

    #[test]
    fn insert_without_shard_column_is_rejected() {
        let err = optimize("insert into student(name,age) values('a',1)", &[]).unwrap_err();
        assert!(matches!(err, ProxyError::Routing(_)));
    }

    #[test]
    fn update_with_key_targets_one_shard() {
        let plan = optimize(
            "update student set age = ? where uid = ?",
            &[Value::Int(20), Value::Int(5)],
        )
        .unwrap();
        let Plan::UpdateFanOut(fanout) = plan else {
            panic!("expected an update fan-out");
        };
        assert_eq!(fanout.shards.len(), 1);
        assert_eq!(fanout.shards[0].db, "fake_db_0005");
    }

    #[test]
    fn keyless_update_is_refused_by_default() {
        let err = optimize("update student set age = 20", &[]).unwrap_err();
        assert!(matches!(err, ProxyError::Routing(_)));
    }

    #[test]
    fn keyless_update_broadcasts_when_rule_allows() {
        let mut rule = fake_rule(8);
        rule.tables[0].allow_full_scan = true;
        let sql = "update student set age = 20";
        let stmt = parse_statement(sql).unwrap();
        let plan = Optimizer::new(&rule, "d").optimize(sql, &stmt, &[]).unwrap();
        assert_eq!(plan.shard_count(), 8);
    }

    #[test]
    fn delete_prunes_like_select() {
        let plan = optimize("delete from student where uid = 3", &[]).unwrap();
        let Plan::DeleteFanOut(fanout) = plan else {
            panic!("expected a delete fan-out");
        };
        assert_eq!(fanout.shards.len(), 1);
        assert_eq!(fanout.shards[0].db, "fake_db_0003");
    }

    #[test]
    fn order_by_produces_merge_with_pushed_keys() {
        let plan = optimize("select id, uid from student order by uid desc", &[]).unwrap();
        let Plan::OrderedMerge(merge) = plan else {
            panic!("expected an ordered merge");
        };
        assert_eq!(merge.children.len(), 8);
        assert_eq!(merge.keys.len(), 1);
        assert!(merge.keys[0].desc);
        assert!(merge.output_width.is_none());
    }

    #[test]
    fn order_by_unprojected_column_appends_hidden_key() {
        let plan = optimize("select id from student order by age", &[]).unwrap();
        let Plan::OrderedMerge(merge) = plan else {
            panic!("expected an ordered merge");
        };
        assert_eq!(merge.output_width, Some(1));
        let Plan::Single(first) = &merge.children[0] else {
            panic!()
        };
        assert!(first.sql.contains("age"));
    }

    #[test]
    fn limit_fanout_rewrites_children_and_wraps() {
        let plan = optimize("select id from student limit 4, 10", &[]).unwrap();
        let Plan::Limit(limit) = plan else {
            panic!("expected a limit");
        };
        assert_eq!(limit.offset, 4);
        assert_eq!(limit.count, 10);
        let Plan::Union(children) = limit.input.as_ref() else {
            panic!("expected a union input");
        };
        let Plan::Single(first) = &children[0] else {
            panic!()
        };
        assert!(first.sql.contains("LIMIT 14"), "sql: {}", first.sql);
    }

    #[test]
    fn limit_on_single_shard_stays_inline() {
        let plan = optimize("select id from student where uid = 1 limit 5", &[]).unwrap();
        let Plan::Single(single) = plan else {
            panic!("expected a single");
        };
        assert!(single.sql.contains("LIMIT 5"));
    }

    #[test]
    fn avg_splits_into_sum_and_count() {
        let plan = optimize(
            "select name, avg(score) from student group by name",
            &[],
        )
        .unwrap();
        let Plan::Aggregate(agg) = plan else {
            panic!("expected an aggregate");
        };
        assert_eq!(agg.group_by, vec![0]);
        let OutputColumn::Agg(spec) = &agg.outputs[1] else {
            panic!("expected an aggregate output");
        };
        assert_eq!(spec.func, AggFunc::Avg);
        assert_eq!(spec.count_column, Some(2));

        let Plan::OrderedMerge(merge) = agg.input.as_ref() else {
            panic!("expected a merge input");
        };
        let Plan::Single(first) = &merge.children[0] else {
            panic!()
        };
        let sql = first.sql.to_uppercase();
        assert!(sql.contains("SUM(SCORE)"), "sql: {}", first.sql);
        assert!(sql.contains("COUNT(SCORE)"), "sql: {}", first.sql);
        assert!(sql.contains("ORDER BY NAME"), "sql: {}", first.sql);
    }

    #[test]
    fn global_count_unions_children() {
        let plan = optimize("select count(1) from student", &[]).unwrap();
        let Plan::Aggregate(agg) = plan else {
            panic!("expected an aggregate");
        };
        assert!(agg.group_by.is_empty());
        assert!(matches!(agg.input.as_ref(), Plan::Union(_)));
    }

    #[test]
    fn ddl_on_sharded_table_rewrites_per_shard() {
        let plan = optimize("create table student (id bigint, uid bigint)", &[]).unwrap();
        assert_eq!(plan.shard_count(), 8);
    }

    #[test]
    fn ddl_on_unknown_table_broadcasts() {
        let plan = optimize("create table plain (id bigint)", &[]).unwrap();
        let Plan::Broadcast(broadcast) = plan else {
            panic!("expected a broadcast");
        };
        assert!(broadcast.dbs.contains(&"employees_0000".to_string()));
        assert_eq!(broadcast.dbs.len(), 9);
    }
}
