//! AST utilities for the optimizer: table-name substitution, placeholder
//! numbering, literal extraction and shard-key predicate analysis.
//!
//! Rewrites never mutate the caller's AST; the optimizer clones the
//! statement, edits the clone in place and re-serializes it.

use sqlparser::ast::{
    Expr, Ident, ObjectName, Query, Select, SetExpr, Statement, TableFactor, Value as AstValue,
};

use crate::error::{ProxyError, Result};
use crate::mysql::value::Value;

/// Replaces every occurrence of `logical` as a table name (FROM, JOINs,
/// derived tables and subqueries) with `physical`.
pub fn rewrite_tables_in_statement(stmt: &mut Statement, logical: &str, physical: &str) {
    match stmt {
        Statement::Query(query) => rewrite_tables_in_query(query, logical, physical),
        Statement::Insert { table_name, .. } => {
            rewrite_object_name(table_name, logical, physical);
        }
        Statement::Update {
            table, selection, ..
        } => {
            rewrite_table_factor(&mut table.relation, logical, physical);
            for join in &mut table.joins {
                rewrite_table_factor(&mut join.relation, logical, physical);
            }
            if let Some(expr) = selection {
                rewrite_tables_in_expr(expr, logical, physical);
            }
        }
        Statement::Delete {
            from, selection, ..
        } => {
            for table in from {
                rewrite_table_factor(&mut table.relation, logical, physical);
                for join in &mut table.joins {
                    rewrite_table_factor(&mut join.relation, logical, physical);
                }
            }
            if let Some(expr) = selection {
                rewrite_tables_in_expr(expr, logical, physical);
            }
        }
        Statement::CreateTable { name, .. } => rewrite_object_name(name, logical, physical),
        Statement::Drop { names, .. } => {
            for name in names {
                rewrite_object_name(name, logical, physical);
            }
        }
        Statement::Truncate { table_name, .. } => {
            rewrite_object_name(table_name, logical, physical)
        }
        Statement::AlterTable { name, .. } => rewrite_object_name(name, logical, physical),
        _ => {}
    }
}

pub fn rewrite_tables_in_query(query: &mut Query, logical: &str, physical: &str) {
    rewrite_tables_in_set_expr(&mut query.body, logical, physical);
}

fn rewrite_tables_in_set_expr(body: &mut SetExpr, logical: &str, physical: &str) {
    match body {
        SetExpr::Select(select) => rewrite_tables_in_select(select, logical, physical),
        SetExpr::Query(query) => rewrite_tables_in_query(query, logical, physical),
        SetExpr::SetOperation { left, right, .. } => {
            rewrite_tables_in_set_expr(left, logical, physical);
            rewrite_tables_in_set_expr(right, logical, physical);
        }
        _ => {}
    }
}

fn rewrite_tables_in_select(select: &mut Select, logical: &str, physical: &str) {
    for table in &mut select.from {
        rewrite_table_factor(&mut table.relation, logical, physical);
        for join in &mut table.joins {
            rewrite_table_factor(&mut join.relation, logical, physical);
        }
    }
    if let Some(expr) = &mut select.selection {
        rewrite_tables_in_expr(expr, logical, physical);
    }
    if let Some(expr) = &mut select.having {
        rewrite_tables_in_expr(expr, logical, physical);
    }
}

fn rewrite_table_factor(factor: &mut TableFactor, logical: &str, physical: &str) {
    match factor {
        TableFactor::Table { name, .. } => rewrite_object_name(name, logical, physical),
        TableFactor::Derived { subquery, .. } => {
            rewrite_tables_in_query(subquery, logical, physical)
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            rewrite_table_factor(&mut table_with_joins.relation, logical, physical);
            for join in &mut table_with_joins.joins {
                rewrite_table_factor(&mut join.relation, logical, physical);
            }
        }
        _ => {}
    }
}

fn rewrite_object_name(name: &mut ObjectName, logical: &str, physical: &str) {
    if let Some(last) = name.0.last_mut() {
        if last.value.eq_ignore_ascii_case(logical) {
            *name = ObjectName(vec![Ident::new(physical)]);
        }
    }
}

/// Subqueries inside predicates also mention the logical table.
fn rewrite_tables_in_expr(expr: &mut Expr, logical: &str, physical: &str) {
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            rewrite_tables_in_expr(left, logical, physical);
            rewrite_tables_in_expr(right, logical, physical);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => {
            rewrite_tables_in_expr(expr, logical, physical)
        }
        Expr::InList { expr, list, .. } => {
            rewrite_tables_in_expr(expr, logical, physical);
            for item in list {
                rewrite_tables_in_expr(item, logical, physical);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            rewrite_tables_in_expr(expr, logical, physical);
            rewrite_tables_in_expr(low, logical, physical);
            rewrite_tables_in_expr(high, logical, physical);
        }
        Expr::InSubquery { expr, subquery, .. } => {
            rewrite_tables_in_expr(expr, logical, physical);
            rewrite_tables_in_query(subquery, logical, physical);
        }
        Expr::Subquery(query) => rewrite_tables_in_query(query, logical, physical),
        Expr::Exists { subquery, .. } => rewrite_tables_in_query(subquery, logical, physical),
        _ => {}
    }
}

/// Counts `?` placeholders in an expression, in syntactic order. Used to
/// assign each placeholder its position in the statement's arg list.
pub fn count_placeholders(expr: &Expr) -> usize {
    match expr {
        Expr::Value(AstValue::Placeholder(_)) => 1,
        Expr::BinaryOp { left, right, .. } => {
            count_placeholders(left) + count_placeholders(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => count_placeholders(expr),
        Expr::InList { expr, list, .. } => {
            count_placeholders(expr) + list.iter().map(count_placeholders).sum::<usize>()
        }
        Expr::Between {
            expr, low, high, ..
        } => count_placeholders(expr) + count_placeholders(low) + count_placeholders(high),
        Expr::Function(func) => func
            .args
            .iter()
            .map(|arg| match arg {
                sqlparser::ast::FunctionArg::Unnamed(
                    sqlparser::ast::FunctionArgExpr::Expr(e),
                ) => count_placeholders(e),
                sqlparser::ast::FunctionArg::Named {
                    arg: sqlparser::ast::FunctionArgExpr::Expr(e),
                    ..
                } => count_placeholders(e),
                _ => 0,
            })
            .sum(),
        Expr::Cast { expr, .. } => count_placeholders(expr),
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => count_placeholders(expr),
        _ => 0,
    }
}

/// Resolves a literal or placeholder operand to a concrete value.
/// `next_arg` hands out args in placeholder order.
pub fn expr_to_value(
    expr: &Expr,
    args: &[Value],
    placeholder_idx: &mut usize,
) -> Result<Option<Value>> {
    match expr {
        Expr::Value(AstValue::Number(text, _)) => Ok(Some(parse_number(text))),
        Expr::Value(AstValue::SingleQuotedString(s))
        | Expr::Value(AstValue::DoubleQuotedString(s)) => {
            Ok(Some(Value::Bytes(s.as_bytes().to_vec())))
        }
        Expr::Value(AstValue::Null) => Ok(Some(Value::Null)),
        Expr::Value(AstValue::Boolean(b)) => Ok(Some(Value::Int(*b as i64))),
        Expr::Value(AstValue::Placeholder(_)) => {
            let idx = *placeholder_idx;
            *placeholder_idx += 1;
            let arg = args.get(idx).cloned().ok_or_else(|| {
                ProxyError::Routing(format!(
                    "placeholder {} has no bound argument (got {})",
                    idx,
                    args.len()
                ))
            })?;
            Ok(Some(arg))
        }
        Expr::UnaryOp {
            op: sqlparser::ast::UnaryOperator::Minus,
            expr,
        } => match expr_to_value(expr, args, placeholder_idx)? {
            Some(Value::Int(v)) => Ok(Some(Value::Int(-v))),
            Some(Value::Double(v)) => Ok(Some(Value::Double(-v))),
            other => Ok(other),
        },
        _ => Ok(None),
    }
}

fn parse_number(text: &str) -> Value {
    if let Ok(v) = text.parse::<i64>() {
        Value::Int(v)
    } else if let Ok(v) = text.parse::<u64>() {
        Value::UInt(v)
    } else if let Ok(v) = text.parse::<f64>() {
        Value::Double(v)
    } else {
        Value::Bytes(text.as_bytes().to_vec())
    }
}

/// True when the expression names `column` (optionally qualified).
pub fn is_column(expr: &Expr, column: &str) -> bool {
    match expr {
        Expr::Identifier(ident) => ident.value.eq_ignore_ascii_case(column),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|p| p.value.eq_ignore_ascii_case(column))
            .unwrap_or(false),
        Expr::Nested(inner) => is_column(inner, column),
        _ => false,
    }
}

/// Shard-key condition extracted from a WHERE clause, strongest form
/// first.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyCondition {
    Eq(Value),
    In(Vec<Value>),
    Range {
        low: Option<i64>,
        high: Option<i64>,
    },
    None,
}

/// Walks a WHERE clause looking for predicates on the shard column.
/// Conjunctions narrow; a disjunction anywhere gives up the pruning
/// (`None` = full fan-out). `placeholder_idx` must enter pointing at the
/// first placeholder of this expression.
pub fn analyze_key_condition(
    expr: &Expr,
    column: &str,
    args: &[Value],
    placeholder_idx: &mut usize,
) -> Result<KeyCondition> {
    use sqlparser::ast::BinaryOperator as Op;

    match expr {
        Expr::Nested(inner) => analyze_key_condition(inner, column, args, placeholder_idx),

        Expr::BinaryOp {
            left,
            op: Op::And,
            right,
        } => {
            let first = analyze_key_condition(left, column, args, placeholder_idx)?;
            let second = analyze_key_condition(right, column, args, placeholder_idx)?;
            Ok(merge_and(first, second))
        }

        Expr::BinaryOp {
            left,
            op: Op::Or,
            right,
        } => {
            // keep the arg cursor honest even though pruning gives up
            *placeholder_idx += count_placeholders(left) + count_placeholders(right);
            Ok(KeyCondition::None)
        }

        Expr::BinaryOp { left, op, right } => {
            let column_on_left = is_column(left, column);
            let column_on_right = is_column(right, column);
            if !column_on_left && !column_on_right {
                *placeholder_idx += count_placeholders(left) + count_placeholders(right);
                return Ok(KeyCondition::None);
            }

            // skip placeholders inside the column side (there are none in
            // a plain identifier, but stay ordered regardless)
            let (column_side, value_side) = if column_on_left {
                (left, right)
            } else {
                (right, left)
            };
            *placeholder_idx += count_placeholders(column_side);

            let value = match expr_to_value(value_side, args, placeholder_idx)? {
                Some(v) => v,
                None => {
                    *placeholder_idx += count_placeholders(value_side);
                    return Ok(KeyCondition::None);
                }
            };

            let as_int = value.as_i64();
            // normalize `v op col` to `col op v`
            let op = if column_on_left {
                op.clone()
            } else {
                match op {
                    Op::Lt => Op::Gt,
                    Op::LtEq => Op::GtEq,
                    Op::Gt => Op::Lt,
                    Op::GtEq => Op::LtEq,
                    other => other.clone(),
                }
            };

            Ok(match (op, as_int) {
                (Op::Eq, _) => KeyCondition::Eq(value),
                (Op::Gt, Some(v)) => KeyCondition::Range {
                    low: Some(v + 1),
                    high: None,
                },
                (Op::GtEq, Some(v)) => KeyCondition::Range {
                    low: Some(v),
                    high: None,
                },
                (Op::Lt, Some(v)) => KeyCondition::Range {
                    low: None,
                    high: Some(v - 1),
                },
                (Op::LtEq, Some(v)) => KeyCondition::Range {
                    low: None,
                    high: Some(v),
                },
                _ => KeyCondition::None,
            })
        }

        Expr::InList {
            expr: target,
            list,
            negated: false,
        } => {
            if !is_column(target, column) {
                *placeholder_idx += count_placeholders(target)
                    + list.iter().map(count_placeholders).sum::<usize>();
                return Ok(KeyCondition::None);
            }
            let mut values = Vec::with_capacity(list.len());
            for (i, item) in list.iter().enumerate() {
                match expr_to_value(item, args, placeholder_idx)? {
                    Some(v) => values.push(v),
                    None => {
                        // keep the cursor aligned past this and the rest
                        *placeholder_idx += list[i..]
                            .iter()
                            .map(count_placeholders)
                            .sum::<usize>();
                        return Ok(KeyCondition::None);
                    }
                }
            }
            Ok(KeyCondition::In(values))
        }

        Expr::Between {
            expr: target,
            negated: false,
            low,
            high,
        } => {
            if !is_column(target, column) {
                *placeholder_idx += count_placeholders(target)
                    + count_placeholders(low)
                    + count_placeholders(high);
                return Ok(KeyCondition::None);
            }
            let low_value = expr_to_value(low, args, placeholder_idx)?;
            if low_value.is_none() {
                *placeholder_idx += count_placeholders(low);
            }
            let high_value = expr_to_value(high, args, placeholder_idx)?;
            if high_value.is_none() {
                *placeholder_idx += count_placeholders(high);
            }
            match (
                low_value.as_ref().and_then(Value::as_i64),
                high_value.as_ref().and_then(Value::as_i64),
            ) {
                (Some(lo), Some(hi)) => Ok(KeyCondition::Range {
                    low: Some(lo),
                    high: Some(hi),
                }),
                _ => Ok(KeyCondition::None),
            }
        }

        other => {
            *placeholder_idx += count_placeholders(other);
            Ok(KeyCondition::None)
        }
    }
}

/// Conjunction of two key conditions: the stronger form wins, ranges
/// intersect.
fn merge_and(a: KeyCondition, b: KeyCondition) -> KeyCondition {
    use KeyCondition::*;
    match (a, b) {
        (Eq(v), _) | (_, Eq(v)) => Eq(v),
        (In(vs), _) | (_, In(vs)) => In(vs),
        (
            Range {
                low: l1,
                high: h1,
            },
            Range {
                low: l2,
                high: h2,
            },
        ) => Range {
            low: match (l1, l2) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            high: match (h1, h2) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        },
        (Range { low, high }, None) | (None, Range { low, high }) => Range { low, high },
        (None, None) => None,
    }
}

/// Normalizes MySQL's `INSERT INTO t SET a = 1, b = 2` into the standard
/// column-list form the parser accepts.
pub fn normalize_insert_set(sql: &str) -> Option<String> {
    let lower = sql.to_ascii_lowercase();
    let insert_pos = lower.find("insert")?;
    let set_pos = lower[insert_pos..].find(" set ")? + insert_pos;
    // make sure there is no VALUES clause; then this is the SET form
    if lower.contains(" values") {
        return None;
    }

    let head = sql[..set_pos].trim_end();
    let assignments = sql[set_pos + 5..].trim().trim_end_matches(';');

    let mut columns = Vec::new();
    let mut values = Vec::new();
    for assignment in split_top_level(assignments, ',') {
        let (col, val) = assignment.split_once('=')?;
        columns.push(col.trim().trim_matches('`').to_string());
        values.push(val.trim().to_string());
    }
    if columns.is_empty() {
        return None;
    }

    Some(format!(
        "{} ({}) VALUES ({})",
        head,
        columns.join(", "),
        values.join(", ")
    ))
}

/// Splits on `sep` outside quotes and parentheses.
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' => {
                    depth += 1;
                    current.push(c);
                }
                ')' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                c if c == sep && depth == 0 => {
                    parts.push(current.trim().to_string());
                    current = String::new();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::MySqlDialect;
    use sqlparser::parser::Parser;

    fn parse(sql: &str) -> Statement {
        Parser::parse_sql(&MySqlDialect {}, sql)
            .unwrap()
            .remove(0)
    }

    fn where_clause(stmt: &Statement) -> Expr {
        match stmt {
            Statement::Query(q) => match q.body.as_ref() {
                SetExpr::Select(s) => s.selection.clone().unwrap(),
                _ => panic!("not a select"),
            },
            _ => panic!("not a query"),
        }
    }

    #[test]
    fn rewrites_from_join_and_subquery() {
        let mut stmt = parse(
            "SELECT a.id FROM student a JOIN score b ON a.id = b.sid \
             WHERE a.id IN (SELECT sid FROM student WHERE uid = 1)",
        );
        rewrite_tables_in_statement(&mut stmt, "student", "student_0003");
        let text = stmt.to_string();
        assert!(!text.to_lowercase().contains("from student "));
        assert_eq!(text.matches("student_0003").count(), 2);
        assert!(text.contains("JOIN score"));
    }

    #[test]
    fn equality_condition_extracted() {
        let stmt = parse("SELECT * FROM t WHERE uid = 42 AND name = 'x'");
        let mut idx = 0;
        let cond = analyze_key_condition(&where_clause(&stmt), "uid", &[], &mut idx).unwrap();
        assert_eq!(cond, KeyCondition::Eq(Value::Int(42)));
    }

    #[test]
    fn placeholders_resolve_in_order() {
        let stmt = parse("SELECT * FROM t WHERE name = ? AND uid = ?");
        let mut idx = 0;
        let args = [Value::from_str("joe"), Value::Int(7)];
        let cond =
            analyze_key_condition(&where_clause(&stmt), "uid", &args, &mut idx).unwrap();
        assert_eq!(cond, KeyCondition::Eq(Value::Int(7)));
    }

    #[test]
    fn in_list_with_placeholders() {
        let stmt = parse("SELECT id, uid FROM t WHERE uid IN (?, ?, ?)");
        let mut idx = 0;
        let args = [Value::Int(1), Value::Int(2), Value::Int(3)];
        let cond =
            analyze_key_condition(&where_clause(&stmt), "uid", &args, &mut idx).unwrap();
        assert_eq!(
            cond,
            KeyCondition::In(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn or_disables_pruning() {
        let stmt = parse("SELECT * FROM t WHERE uid = 1 OR name = 'x'");
        let mut idx = 0;
        let cond = analyze_key_condition(&where_clause(&stmt), "uid", &[], &mut idx).unwrap();
        assert_eq!(cond, KeyCondition::None);
    }

    #[test]
    fn range_predicates_intersect() {
        let stmt = parse("SELECT * FROM t WHERE uid >= 10 AND uid < 20");
        let mut idx = 0;
        let cond = analyze_key_condition(&where_clause(&stmt), "uid", &[], &mut idx).unwrap();
        assert_eq!(
            cond,
            KeyCondition::Range {
                low: Some(10),
                high: Some(19)
            }
        );
    }

    #[test]
    fn between_is_a_closed_range() {
        let stmt = parse("SELECT * FROM t WHERE uid BETWEEN 5 AND 8");
        let mut idx = 0;
        let cond = analyze_key_condition(&where_clause(&stmt), "uid", &[], &mut idx).unwrap();
        assert_eq!(
            cond,
            KeyCondition::Range {
                low: Some(5),
                high: Some(8)
            }
        );
    }

    #[test]
    fn reversed_comparison_normalized() {
        let stmt = parse("SELECT * FROM t WHERE 100 > uid");
        let mut idx = 0;
        let cond = analyze_key_condition(&where_clause(&stmt), "uid", &[], &mut idx).unwrap();
        assert_eq!(
            cond,
            KeyCondition::Range {
                low: None,
                high: Some(99)
            }
        );
    }

    #[test]
    fn insert_set_normalization() {
        let normalized =
            normalize_insert_set("insert into abc set name='foo',uid=?,age=18").unwrap();
        assert_eq!(
            normalized,
            "insert into abc (name, uid, age) VALUES ('foo', ?, 18)"
        );
        // the standard form is left alone
        assert!(normalize_insert_set("insert into abc (a) values (1)").is_none());
    }
}
