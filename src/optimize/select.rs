//! SELECT planning: shard pruning, per-shard rewrite and stream
//! composition.

use sqlparser::ast::{
    Expr, Function, GroupByExpr, ObjectName, Offset, OffsetRows, OrderByExpr, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, Value as AstValue,
};

use crate::error::{ProxyError, Result};
use crate::mysql::value::Value;
use crate::plan::{
    AggFunc, AggSpec, AggregatePlan, LimitPlan, MergePlan, OutputColumn, Plan, SinglePlan,
    SortKey,
};
use crate::rule::{Shard, ShardingRule, TableRule};

use super::rewrite::{
    analyze_key_condition, count_placeholders, expr_to_value, rewrite_tables_in_statement,
    KeyCondition,
};

pub(super) fn optimize_query(
    rule: &ShardingRule,
    default_db: &str,
    sql: &str,
    stmt: &Statement,
    args: &[Value],
) -> Result<Plan> {
    let query = match stmt {
        Statement::Query(query) => query,
        _ => return Ok(passthrough(default_db, sql, args)),
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => return Ok(passthrough(default_db, sql, args)),
    };

    let Some(table_rule) = find_sharded_table(select, rule) else {
        return Ok(passthrough(default_db, sql, args));
    };

    // placeholders ahead of the WHERE clause keep the arg cursor aligned
    let mut cursor = projection_placeholder_count(select);
    let condition = match &select.selection {
        Some(where_clause) => {
            analyze_key_condition(where_clause, &table_rule.shard_column, args, &mut cursor)?
        }
        None => KeyCondition::None,
    };
    let shards = shard_set(table_rule, &condition)?;
    if shards.is_empty() {
        return Ok(Plan::AlwaysEmpty);
    }

    let limit = eval_limit(query, select, args)?;

    if shards.len() == 1 {
        let shard = &shards[0];
        let mut child = stmt.clone();
        let mut child_args = args.to_vec();
        // LIMIT placeholders are always materialized so serialization
        // cannot reorder them
        if let Some(spec) = &limit {
            set_limit(&mut child, spec.offset, spec.count);
            remove_args(&mut child_args, &spec.arg_indices);
        }
        rewrite_tables_in_statement(&mut child, &table_rule.logical_table, &shard.table);
        return Ok(Plan::Single(SinglePlan::query(
            &shard.db,
            child.to_string(),
            child_args,
        )));
    }

    let aggregation = classify_aggregation(select)?;

    if let Some(parts) = aggregation {
        return build_aggregate_plan(table_rule, stmt, select, args, &shards, parts, limit);
    }

    let plan = if !query.order_by.is_empty() {
        build_merge_plan(table_rule, stmt, query, select, args, &shards, &limit)?
    } else {
        build_union_plan(table_rule, stmt, args, &shards, &limit)?
    };

    Ok(match limit {
        Some(spec) => Plan::Limit(LimitPlan {
            input: Box::new(plan),
            offset: spec.offset,
            count: spec.count,
        }),
        None => plan,
    })
}

fn passthrough(default_db: &str, sql: &str, args: &[Value]) -> Plan {
    Plan::Single(SinglePlan::query(default_db, sql, args.to_vec()))
}

/// First table in FROM (or its joins) that a rule covers.
fn find_sharded_table<'a>(select: &Select, rule: &'a ShardingRule) -> Option<&'a TableRule> {
    for table in &select.from {
        for factor in std::iter::once(&table.relation)
            .chain(table.joins.iter().map(|j| &j.relation))
        {
            if let TableFactor::Table { name, .. } = factor {
                if let Some(found) = name.0.last().and_then(|i| rule.rule_for(&i.value)) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn projection_placeholder_count(select: &Select) -> usize {
    select
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                count_placeholders(expr)
            }
            _ => 0,
        })
        .sum()
}

fn shard_set(table_rule: &TableRule, condition: &KeyCondition) -> Result<Vec<Shard>> {
    Ok(match condition {
        KeyCondition::Eq(value) => vec![table_rule.shard_for(value)?],
        KeyCondition::In(values) => {
            let mut shards: Vec<Shard> = Vec::new();
            for value in values {
                let shard = table_rule.shard_for(value)?;
                if !shards.contains(&shard) {
                    shards.push(shard);
                }
            }
            shards
        }
        KeyCondition::Range { low, high } if table_rule.algorithm.is_range_capable() => {
            table_rule.shards_for_range(*low, *high)
        }
        _ => table_rule.all_shards(),
    })
}

struct LimitSpec {
    offset: u64,
    count: u64,
    /// Positions in the statement's arg list that fed LIMIT/OFFSET and
    /// must be dropped once the clause is materialized.
    arg_indices: Vec<usize>,
}

/// Evaluates LIMIT/OFFSET to concrete numbers. Placeholder numbering
/// follows MySQL's `LIMIT offset, count` textual order, after every
/// other clause.
fn eval_limit(query: &Query, select: &Select, args: &[Value]) -> Result<Option<LimitSpec>> {
    let Some(limit_expr) = &query.limit else {
        return Ok(None);
    };

    let mut cursor = projection_placeholder_count(select)
        + select
            .selection
            .as_ref()
            .map(count_placeholders)
            .unwrap_or(0)
        + match &select.group_by {
            GroupByExpr::Expressions(exprs) => {
                exprs.iter().map(count_placeholders).sum::<usize>()
            }
            _ => 0,
        }
        + select.having.as_ref().map(count_placeholders).unwrap_or(0)
        + query
            .order_by
            .iter()
            .map(|o| count_placeholders(&o.expr))
            .sum::<usize>();

    let mut arg_indices = Vec::new();

    let offset = match &query.offset {
        Some(offset) => {
            let placeholder = matches!(offset.value, Expr::Value(AstValue::Placeholder(_)));
            if placeholder {
                arg_indices.push(cursor);
            }
            to_u64(
                expr_to_value(&offset.value, args, &mut cursor)?,
                "OFFSET",
            )?
        }
        None => 0,
    };

    let placeholder = matches!(limit_expr, Expr::Value(AstValue::Placeholder(_)));
    if placeholder {
        arg_indices.push(cursor);
    }
    let count = to_u64(expr_to_value(limit_expr, args, &mut cursor)?, "LIMIT")?;

    Ok(Some(LimitSpec {
        offset,
        count,
        arg_indices,
    }))
}

fn to_u64(value: Option<Value>, clause: &str) -> Result<u64> {
    value
        .and_then(|v| v.as_i64())
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| {
            ProxyError::Routing(format!("{} requires a non-negative integer", clause))
        })
}

fn remove_args(args: &mut Vec<Value>, indices: &[usize]) {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    for idx in sorted {
        if idx < args.len() {
            args.remove(idx);
        }
    }
}

fn set_limit(stmt: &mut Statement, offset: u64, count: u64) {
    if let Statement::Query(query) = stmt {
        query.limit = Some(Expr::Value(AstValue::Number(count.to_string(), false)));
        query.offset = if offset > 0 {
            Some(Offset {
                value: Expr::Value(AstValue::Number(offset.to_string(), false)),
                rows: OffsetRows::None,
            })
        } else {
            None
        };
    }
}

fn build_union_plan(
    table_rule: &TableRule,
    stmt: &Statement,
    args: &[Value],
    shards: &[Shard],
    limit: &Option<LimitSpec>,
) -> Result<Plan> {
    let children = shards
        .iter()
        .map(|shard| {
            let mut child = stmt.clone();
            let mut child_args = args.to_vec();
            if let Some(spec) = limit {
                // every child may contribute up to offset+count rows
                set_limit(&mut child, 0, spec.offset + spec.count);
                remove_args(&mut child_args, &spec.arg_indices);
            }
            rewrite_tables_in_statement(&mut child, &table_rule.logical_table, &shard.table);
            Ok(Plan::Single(SinglePlan::query(
                &shard.db,
                child.to_string(),
                child_args,
            )))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Plan::Union(children))
}

fn build_merge_plan(
    table_rule: &TableRule,
    stmt: &Statement,
    query: &Query,
    select: &Select,
    args: &[Value],
    shards: &[Shard],
    limit: &Option<LimitSpec>,
) -> Result<Plan> {
    let has_wildcard = select
        .projection
        .iter()
        .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..)));

    // resolve each ORDER BY key to a projection position, appending
    // hidden columns when the key is not projected
    let mut keys = Vec::with_capacity(query.order_by.len());
    let mut hidden: Vec<Expr> = Vec::new();
    for order in &query.order_by {
        let desc = !order.asc.unwrap_or(true);
        match locate_in_projection(&order.expr, &select.projection) {
            Some(index) => keys.push(SortKey::index(index, desc)),
            None if has_wildcard => match &order.expr {
                Expr::Identifier(ident) => keys.push(SortKey::name(&ident.value, desc)),
                Expr::CompoundIdentifier(parts) => {
                    let name = &parts.last().expect("qualified name").value;
                    keys.push(SortKey::name(name, desc));
                }
                other => {
                    return Err(ProxyError::Unsupported(format!(
                        "cannot merge on ORDER BY expression {} under a wildcard projection",
                        other
                    )))
                }
            },
            None => {
                keys.push(SortKey::index(
                    select.projection.len() + hidden.len(),
                    desc,
                ));
                hidden.push(order.expr.clone());
            }
        }
    }

    let output_width = if hidden.is_empty() {
        None
    } else {
        Some(select.projection.len())
    };

    let children = shards
        .iter()
        .map(|shard| {
            let mut child = stmt.clone();
            let mut child_args = args.to_vec();
            if let Statement::Query(child_query) = &mut child {
                if let SetExpr::Select(child_select) = child_query.body.as_mut() {
                    for expr in &hidden {
                        child_select
                            .projection
                            .push(SelectItem::UnnamedExpr(expr.clone()));
                    }
                }
            }
            if let Some(spec) = limit {
                set_limit(&mut child, 0, spec.offset + spec.count);
                remove_args(&mut child_args, &spec.arg_indices);
            }
            rewrite_tables_in_statement(&mut child, &table_rule.logical_table, &shard.table);
            Ok(Plan::Single(SinglePlan::query(
                &shard.db,
                child.to_string(),
                child_args,
            )))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Plan::OrderedMerge(MergePlan {
        children,
        keys,
        output_width,
    }))
}

/// Shape of an aggregate projection: the per-item classification.
struct AggregationParts {
    items: Vec<ItemKind>,
}

enum ItemKind {
    Plain,
    Agg(AggFunc),
}

/// Detects the aggregate path. `None` means a plain projection; an error
/// marks shapes the proxy cannot merge across shards.
fn classify_aggregation(select: &Select) -> Result<Option<AggregationParts>> {
    let grouped = matches!(&select.group_by, GroupByExpr::Expressions(exprs) if !exprs.is_empty());

    let mut items = Vec::with_capacity(select.projection.len());
    let mut has_aggregates = false;

    for item in &select.projection {
        let expr = match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
            _ => {
                items.push(ItemKind::Plain);
                continue;
            }
        };
        match aggregate_function(expr) {
            Some((func, distinct)) => {
                if distinct {
                    return Err(ProxyError::Unsupported(
                        "DISTINCT aggregates cannot be merged across shards".to_string(),
                    ));
                }
                has_aggregates = true;
                items.push(ItemKind::Agg(func));
            }
            None => {
                if contains_aggregate(expr) {
                    return Err(ProxyError::Unsupported(format!(
                        "aggregate expression {} cannot be merged across shards",
                        expr
                    )));
                }
                items.push(ItemKind::Plain);
            }
        }
    }

    if !has_aggregates && !grouped {
        return Ok(None);
    }
    if select.having.is_some() {
        return Err(ProxyError::Unsupported(
            "HAVING on a multi-shard aggregate is not supported".to_string(),
        ));
    }
    Ok(Some(AggregationParts { items }))
}

fn aggregate_function(expr: &Expr) -> Option<(AggFunc, bool)> {
    let Expr::Function(func) = expr else {
        return None;
    };
    let name = function_name(func)?;
    let agg = match name.to_ascii_uppercase().as_str() {
        "COUNT" => AggFunc::Count,
        "SUM" => AggFunc::Sum,
        "MIN" => AggFunc::Min,
        "MAX" => AggFunc::Max,
        "AVG" => AggFunc::Avg,
        _ => return None,
    };
    Some((agg, func.distinct))
}

fn function_name(func: &Function) -> Option<&str> {
    func.name.0.last().map(|ident| ident.value.as_str())
}

fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(_) => aggregate_function(expr).is_some(),
        Expr::BinaryOp { left, right, .. } => {
            contains_aggregate(left) || contains_aggregate(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => contains_aggregate(expr),
        Expr::Cast { expr, .. } => contains_aggregate(expr),
        _ => false,
    }
}

fn locate_in_projection(expr: &Expr, projection: &[SelectItem]) -> Option<usize> {
    let wanted = expr.to_string().to_ascii_lowercase();
    projection.iter().position(|item| match item {
        SelectItem::UnnamedExpr(e) => e.to_string().to_ascii_lowercase() == wanted,
        SelectItem::ExprWithAlias { expr: e, alias } => {
            e.to_string().to_ascii_lowercase() == wanted
                || alias.value.to_ascii_lowercase() == wanted
        }
        _ => false,
    })
}

/// Builds the partial-aggregation fan-out: AVG split into SUM/COUNT,
/// children re-sorted by the group columns, a merge feeding the
/// streaming aggregator.
#[allow(clippy::too_many_arguments)]
fn build_aggregate_plan(
    table_rule: &TableRule,
    stmt: &Statement,
    select: &Select,
    args: &[Value],
    shards: &[Shard],
    parts: AggregationParts,
    limit: Option<LimitSpec>,
) -> Result<Plan> {
    let group_exprs: Vec<Expr> = match &select.group_by {
        GroupByExpr::Expressions(exprs) => exprs.clone(),
        _ => Vec::new(),
    };

    // group columns must be resolvable positions in the child projection
    let mut hidden_group_exprs: Vec<Expr> = Vec::new();
    let mut group_columns = Vec::with_capacity(group_exprs.len());
    let base_len = select.projection.len();
    let extra_count = parts
        .items
        .iter()
        .filter(|k| matches!(k, ItemKind::Agg(AggFunc::Avg)))
        .count();
    for expr in &group_exprs {
        match locate_in_projection(expr, &select.projection) {
            Some(index) => group_columns.push(index),
            None => {
                group_columns.push(base_len + extra_count + hidden_group_exprs.len());
                hidden_group_exprs.push(expr.clone());
            }
        }
    }

    // outputs in client order; AVG consumes its appended partial count
    let mut outputs = Vec::with_capacity(parts.items.len());
    let mut next_extra = base_len;
    for (i, kind) in parts.items.iter().enumerate() {
        match kind {
            ItemKind::Plain => outputs.push(OutputColumn::Group(i)),
            ItemKind::Agg(AggFunc::Avg) => {
                outputs.push(OutputColumn::Agg(AggSpec {
                    func: AggFunc::Avg,
                    column: i,
                    count_column: Some(next_extra),
                }));
                next_extra += 1;
            }
            ItemKind::Agg(func) => outputs.push(OutputColumn::Agg(AggSpec {
                func: *func,
                column: i,
                count_column: None,
            })),
        }
    }

    let output_names: Vec<String> = select
        .projection
        .iter()
        .map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => alias.value.clone(),
            SelectItem::UnnamedExpr(expr) => expr.to_string(),
            other => other.to_string(),
        })
        .collect();

    let children = shards
        .iter()
        .map(|shard| {
            let mut child = stmt.clone();
            let mut child_args = args.to_vec();
            rewrite_child_for_aggregation(&mut child, &parts, &group_exprs, &hidden_group_exprs);
            if let Some(spec) = &limit {
                // the limit applies to merged groups; children must stay
                // complete
                clear_limit(&mut child);
                remove_args(&mut child_args, &spec.arg_indices);
            }
            rewrite_tables_in_statement(&mut child, &table_rule.logical_table, &shard.table);
            Ok(Plan::Single(SinglePlan::query(
                &shard.db,
                child.to_string(),
                child_args,
            )))
        })
        .collect::<Result<Vec<_>>>()?;

    let input = if group_columns.is_empty() {
        Plan::Union(children)
    } else {
        Plan::OrderedMerge(MergePlan {
            keys: group_columns
                .iter()
                .map(|&c| SortKey::index(c, false))
                .collect(),
            children,
            output_width: None,
        })
    };

    let plan = Plan::Aggregate(AggregatePlan {
        input: Box::new(input),
        group_by: group_columns,
        outputs,
        output_names,
    });

    Ok(match limit {
        Some(spec) => Plan::Limit(LimitPlan {
            input: Box::new(plan),
            offset: spec.offset,
            count: spec.count,
        }),
        None => plan,
    })
}

/// Per-child projection surgery for partial aggregation: AVG(x) becomes
/// SUM(x) plus an appended COUNT(x), hidden group columns follow, and
/// the child is ordered by its group columns so the merge feeds the
/// aggregator grouped runs.
fn rewrite_child_for_aggregation(
    stmt: &mut Statement,
    parts: &AggregationParts,
    group_exprs: &[Expr],
    hidden_group_exprs: &[Expr],
) {
    let Statement::Query(query) = stmt else {
        return;
    };
    let SetExpr::Select(select) = query.body.as_mut() else {
        return;
    };

    let mut appended: Vec<SelectItem> = Vec::new();
    for (item, kind) in select.projection.iter_mut().zip(&parts.items) {
        if let ItemKind::Agg(AggFunc::Avg) = kind {
            let expr = match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => expr,
                _ => continue,
            };
            if let Expr::Function(func) = expr {
                let mut count_fn = func.clone();
                count_fn.name = ObjectName(vec![sqlparser::ast::Ident::new("COUNT")]);
                appended.push(SelectItem::UnnamedExpr(Expr::Function(count_fn)));
                func.name = ObjectName(vec![sqlparser::ast::Ident::new("SUM")]);
            }
        }
    }
    select.projection.extend(appended);
    for expr in hidden_group_exprs {
        select
            .projection
            .push(SelectItem::UnnamedExpr(expr.clone()));
    }

    // children return their partial groups sorted for the merge
    query.order_by = group_exprs
        .iter()
        .map(|expr| OrderByExpr {
            expr: expr.clone(),
            asc: Some(true),
            nulls_first: None,
        })
        .collect();
}

fn clear_limit(stmt: &mut Statement) {
    if let Statement::Query(query) = stmt {
        query.limit = None;
        query.offset = None;
    }
}
