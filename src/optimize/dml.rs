//! INSERT / UPDATE / DELETE / DDL planning.

use sqlparser::ast::{Expr, Ident, SetExpr, Statement, TableFactor};

use crate::error::{ProxyError, Result};
use crate::mysql::value::Value;
use crate::plan::{BroadcastPlan, FanOutPlan, Plan, SinglePlan};
use crate::rule::{Shard, ShardingRule, TableRule};

use super::rewrite::{
    analyze_key_condition, count_placeholders, expr_to_value, rewrite_tables_in_statement,
    KeyCondition,
};

pub(super) fn optimize_insert(
    rule: &ShardingRule,
    default_db: &str,
    sql: &str,
    stmt: &Statement,
    args: &[Value],
) -> Result<Plan> {
    let Statement::Insert {
        table_name,
        columns,
        source,
        ..
    } = stmt
    else {
        return Err(ProxyError::Routing("not an INSERT statement".to_string()));
    };

    let logical = match table_name.0.last() {
        Some(ident) => ident.value.clone(),
        None => return Err(ProxyError::Routing("INSERT without a table".to_string())),
    };
    let Some(table_rule) = rule.rule_for(&logical) else {
        // unsharded: the default data source takes the statement as-is
        return Ok(Plan::Single(SinglePlan::exec(default_db, sql, args.to_vec())));
    };

    let key_index = columns
        .iter()
        .position(|c| c.value.eq_ignore_ascii_case(&table_rule.shard_column))
        .ok_or_else(|| {
            ProxyError::Routing(format!(
                "INSERT into {} must set sharding column {}",
                logical, table_rule.shard_column
            ))
        })?;

    let rows = match source.body.as_ref() {
        SetExpr::Values(values) => &values.rows,
        _ => {
            return Err(ProxyError::Unsupported(
                "INSERT ... SELECT across shards is not supported".to_string(),
            ))
        }
    };

    // group rows by target shard, walking placeholders in row order so
    // each group's arg list lines up with its rewritten VALUES
    let mut cursor = 0usize;
    let mut groups: Vec<(Shard, Vec<String>, Vec<Value>)> = Vec::new();
    for row in rows {
        let row_arg_start = cursor;
        let mut key_value = None;
        for (i, expr) in row.iter().enumerate() {
            if i == key_index {
                key_value = expr_to_value(expr, args, &mut cursor)?;
                if key_value.is_none() {
                    return Err(ProxyError::Routing(format!(
                        "sharding column {} requires a literal or placeholder value",
                        table_rule.shard_column
                    )));
                }
            } else {
                cursor += count_placeholders(expr);
            }
        }
        let shard = table_rule.shard_for(&key_value.expect("checked above"))?;
        let row_args = args
            .get(row_arg_start..cursor)
            .unwrap_or(&[])
            .to_vec();
        let row_sql = format!(
            "({})",
            row.iter()
                .map(Expr::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        match groups.iter_mut().find(|(s, _, _)| *s == shard) {
            Some((_, rows, group_args)) => {
                rows.push(row_sql);
                group_args.extend(row_args);
            }
            None => groups.push((shard, vec![row_sql], row_args)),
        }
    }

    if groups.is_empty() {
        // an INSERT with no rows affects nothing
        return Ok(Plan::AlwaysEmpty);
    }

    let column_list = columns
        .iter()
        .map(Ident::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let shards = groups
        .into_iter()
        .map(|(shard, rows, group_args)| {
            let sql = format!(
                "INSERT INTO {} ({}) VALUES {}",
                shard.table,
                column_list,
                rows.join(", ")
            );
            SinglePlan::exec(&shard.db, sql, group_args)
        })
        .collect();

    Ok(Plan::InsertFanOut(FanOutPlan { shards }))
}

pub(super) fn optimize_update(
    rule: &ShardingRule,
    default_db: &str,
    sql: &str,
    stmt: &Statement,
    args: &[Value],
) -> Result<Plan> {
    let Statement::Update {
        table,
        assignments,
        selection,
        ..
    } = stmt
    else {
        return Err(ProxyError::Routing("not an UPDATE statement".to_string()));
    };

    let logical = match &table.relation {
        TableFactor::Table { name, .. } => name.0.last().map(|i| i.value.clone()),
        _ => None,
    };
    let Some(table_rule) = logical.as_deref().and_then(|t| rule.rule_for(t)) else {
        return Ok(Plan::Single(SinglePlan::exec(default_db, sql, args.to_vec())));
    };

    for assignment in assignments {
        if assignment
            .id
            .last()
            .map(|i| i.value.eq_ignore_ascii_case(&table_rule.shard_column))
            .unwrap_or(false)
        {
            return Err(ProxyError::Routing(format!(
                "updating sharding column {} is not allowed",
                table_rule.shard_column
            )));
        }
    }

    // assignment placeholders precede the WHERE clause
    let mut cursor: usize = assignments
        .iter()
        .map(|a| count_placeholders(&a.value))
        .sum();
    let condition = match selection {
        Some(where_clause) => {
            analyze_key_condition(where_clause, &table_rule.shard_column, args, &mut cursor)?
        }
        None => KeyCondition::None,
    };

    let shards = write_shard_set(table_rule, &condition, "UPDATE")?;
    if shards.is_empty() {
        return Ok(Plan::AlwaysEmpty);
    }
    Ok(Plan::UpdateFanOut(fan_out(
        table_rule, stmt, args, &shards,
    )))
}

pub(super) fn optimize_delete(
    rule: &ShardingRule,
    default_db: &str,
    sql: &str,
    stmt: &Statement,
    args: &[Value],
) -> Result<Plan> {
    let Statement::Delete {
        from, selection, ..
    } = stmt
    else {
        return Err(ProxyError::Routing("not a DELETE statement".to_string()));
    };

    let logical = from.first().and_then(|t| match &t.relation {
        TableFactor::Table { name, .. } => name.0.last().map(|i| i.value.clone()),
        _ => None,
    });
    let Some(table_rule) = logical.as_deref().and_then(|t| rule.rule_for(t)) else {
        return Ok(Plan::Single(SinglePlan::exec(default_db, sql, args.to_vec())));
    };

    let mut cursor = 0usize;
    let condition = match selection {
        Some(where_clause) => {
            analyze_key_condition(where_clause, &table_rule.shard_column, args, &mut cursor)?
        }
        None => KeyCondition::None,
    };

    let shards = write_shard_set(table_rule, &condition, "DELETE")?;
    if shards.is_empty() {
        return Ok(Plan::AlwaysEmpty);
    }
    Ok(Plan::DeleteFanOut(fan_out(
        table_rule, stmt, args, &shards,
    )))
}

/// Shard set for a write. A write without any shard-key predicate only
/// broadcasts when the rule opts in; the default is to refuse.
fn write_shard_set(
    table_rule: &TableRule,
    condition: &KeyCondition,
    verb: &str,
) -> Result<Vec<Shard>> {
    match condition {
        KeyCondition::Eq(value) => Ok(vec![table_rule.shard_for(value)?]),
        KeyCondition::In(values) => {
            let mut shards: Vec<Shard> = Vec::new();
            for value in values {
                let shard = table_rule.shard_for(value)?;
                if !shards.contains(&shard) {
                    shards.push(shard);
                }
            }
            Ok(shards)
        }
        KeyCondition::Range { low, high } if table_rule.algorithm.is_range_capable() => {
            Ok(table_rule.shards_for_range(*low, *high))
        }
        _ if table_rule.allow_full_scan => Ok(table_rule.all_shards()),
        _ => Err(ProxyError::Routing(format!(
            "{} on {} without a predicate on sharding column {} is not allowed",
            verb, table_rule.logical_table, table_rule.shard_column
        ))),
    }
}

fn fan_out(
    table_rule: &TableRule,
    stmt: &Statement,
    args: &[Value],
    shards: &[Shard],
) -> FanOutPlan {
    let shards = shards
        .iter()
        .map(|shard| {
            let mut child = stmt.clone();
            rewrite_tables_in_statement(&mut child, &table_rule.logical_table, &shard.table);
            SinglePlan::exec(&shard.db, child.to_string(), args.to_vec())
        })
        .collect();
    FanOutPlan { shards }
}

/// DDL over a sharded table rewrites per shard; anything else goes to
/// every physical database unchanged.
pub(super) fn optimize_ddl(
    rule: &ShardingRule,
    default_db: &str,
    sql: &str,
    stmt: &Statement,
) -> Result<Plan> {
    let logical = ddl_table(stmt);
    if let Some(table_rule) = logical.as_deref().and_then(|t| rule.rule_for(t)) {
        let shards = table_rule
            .all_shards()
            .iter()
            .map(|shard| {
                let mut child = stmt.clone();
                rewrite_tables_in_statement(
                    &mut child,
                    &table_rule.logical_table,
                    &shard.table,
                );
                SinglePlan::exec(&shard.db, child.to_string(), Vec::new())
            })
            .collect();
        return Ok(Plan::UpdateFanOut(FanOutPlan { shards }));
    }

    let mut dbs = rule.all_databases();
    if !dbs.iter().any(|db| db == default_db) {
        dbs.insert(0, default_db.to_string());
    }
    Ok(Plan::Broadcast(BroadcastPlan {
        dbs,
        sql: sql.to_string(),
    }))
}

fn ddl_table(stmt: &Statement) -> Option<String> {
    let name = match stmt {
        Statement::CreateTable { name, .. } => Some(name),
        Statement::AlterTable { name, .. } => Some(name),
        Statement::Truncate { table_name, .. } => Some(table_name),
        Statement::Drop { names, .. } => names.first(),
        Statement::CreateIndex { table_name, .. } => Some(table_name),
        _ => None,
    }?;
    name.0.last().map(|i| i.value.clone())
}
