use std::sync::Arc;

use crate::error::Result;
use crate::mysql::protocol::FieldType;
use crate::mysql::rows::{Field, ResultSet, TextRow};
use crate::mysql::value::Value;
use crate::runtime::{DataSet, VConnRef};

use super::merge::SortAtom;
use super::Plan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

/// One aggregate output: the child column carrying the partial state and,
/// for AVG, the hidden partial-count column the rewriter appended.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub func: AggFunc,
    pub column: usize,
    pub count_column: Option<usize>,
}

/// Position of each output column of the aggregation, in client order.
#[derive(Debug, Clone)]
pub enum OutputColumn {
    Group(usize),
    Agg(AggSpec),
}

/// Stream-group aggregation over an input already sorted by `group_by`.
/// Emits one row per distinct group tuple, in input order (ascending by
/// the merged sort).
#[derive(Debug, Clone)]
pub struct AggregatePlan {
    pub input: Box<Plan>,
    pub group_by: Vec<usize>,
    pub outputs: Vec<OutputColumn>,
    pub output_names: Vec<String>,
}

impl AggregatePlan {
    /// A global aggregate (no GROUP BY) emits exactly one row even over
    /// an empty input: COUNT() is 0, the rest are NULL.
    fn emits_empty_group(&self) -> bool {
        self.group_by.is_empty()
    }
}

/// Running state of one aggregate within the current group. Partial
/// values from shards merge per SQL semantics: COUNT and SUM by
/// addition, MIN/MAX by extremum, AVG as a SUM/COUNT pair. Nulls are
/// skipped throughout.
#[derive(Debug, Clone)]
enum AggState {
    Count(u64),
    Sum(SumState),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: SumState, count: u64 },
}

#[derive(Debug, Clone, Copy)]
enum SumState {
    Empty,
    Int(i64),
    Float(f64),
}

impl SumState {
    fn add(&mut self, value: &Value) {
        let exact = value.as_i64();
        let incoming_float = match value {
            Value::Double(v) => Some(*v),
            Value::Bytes(raw) => std::str::from_utf8(raw).ok().and_then(|s| s.trim().parse().ok()),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Null => None,
        };

        match (*self, exact, incoming_float) {
            (_, None, None) => {}
            (SumState::Empty, Some(i), _) => *self = SumState::Int(i),
            (SumState::Empty, None, Some(f)) => *self = SumState::Float(f),
            (SumState::Int(acc), Some(i), _) => match acc.checked_add(i) {
                Some(total) => *self = SumState::Int(total),
                None => *self = SumState::Float(acc as f64 + i as f64),
            },
            (SumState::Int(acc), None, Some(f)) => *self = SumState::Float(acc as f64 + f),
            (SumState::Float(acc), _, Some(f)) => *self = SumState::Float(acc + f),
            (SumState::Float(acc), Some(i), None) => *self = SumState::Float(acc + i as f64),
        }
    }

    fn as_value(self) -> Value {
        match self {
            SumState::Empty => Value::Null,
            SumState::Int(v) => Value::Int(v),
            SumState::Float(v) => Value::Double(v),
        }
    }

    fn as_f64(self) -> Option<f64> {
        match self {
            SumState::Empty => None,
            SumState::Int(v) => Some(v as f64),
            SumState::Float(v) => Some(v),
        }
    }
}

impl AggState {
    fn new(func: AggFunc) -> AggState {
        match func {
            AggFunc::Count => AggState::Count(0),
            AggFunc::Sum => AggState::Sum(SumState::Empty),
            AggFunc::Min => AggState::Min(None),
            AggFunc::Max => AggState::Max(None),
            AggFunc::Avg => AggState::Avg {
                sum: SumState::Empty,
                count: 0,
            },
        }
    }

    fn absorb(&mut self, partial: &Value, partial_count: Option<&Value>) {
        if partial.is_null() {
            return;
        }
        match self {
            AggState::Count(acc) => {
                if let Some(v) = partial.as_i64() {
                    *acc += v.max(0) as u64;
                }
            }
            AggState::Sum(sum) => sum.add(partial),
            AggState::Min(best) => {
                let replace = match best {
                    None => true,
                    Some(current) => {
                        SortAtom::from_value(partial) < SortAtom::from_value(current)
                    }
                };
                if replace {
                    *best = Some(partial.clone());
                }
            }
            AggState::Max(best) => {
                let replace = match best {
                    None => true,
                    Some(current) => {
                        SortAtom::from_value(partial) > SortAtom::from_value(current)
                    }
                };
                if replace {
                    *best = Some(partial.clone());
                }
            }
            AggState::Avg { sum, count } => {
                sum.add(partial);
                if let Some(c) = partial_count.and_then(Value::as_i64) {
                    *count += c.max(0) as u64;
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            AggState::Count(acc) => Value::Int(acc as i64),
            AggState::Sum(sum) => sum.as_value(),
            AggState::Min(best) | AggState::Max(best) => best.unwrap_or(Value::Null),
            AggState::Avg { sum, count } => match (sum.as_f64(), count) {
                (Some(total), c) if c > 0 => {
                    Value::Bytes(format!("{:.4}", total / c as f64).into_bytes())
                }
                _ => Value::Null,
            },
        }
    }
}

impl AggregatePlan {
    /// Output descriptors: group columns keep their child field, aggregate
    /// columns get a type per function.
    fn output_fields(&self, child: &Arc<ResultSet>) -> Arc<ResultSet> {
        let columns = self
            .outputs
            .iter()
            .zip(self.output_names.iter())
            .map(|(output, name)| match output {
                OutputColumn::Group(i) => {
                    let mut field = child
                        .columns
                        .get(*i)
                        .cloned()
                        .unwrap_or_else(|| Field::new(name, FieldType::VarString));
                    field.name = name.clone();
                    field
                }
                OutputColumn::Agg(spec) => {
                    let field_type = match spec.func {
                        AggFunc::Count => FieldType::LongLong,
                        AggFunc::Avg => FieldType::NewDecimal,
                        _ => child
                            .columns
                            .get(spec.column)
                            .map(|f| f.field_type)
                            .unwrap_or(FieldType::NewDecimal),
                    };
                    Field::new(name, field_type)
                }
            })
            .collect();
        ResultSet::new(columns)
    }

    pub(super) async fn exec_in(&self, vconn: VConnRef) -> Result<DataSet> {
        let mut input = self.input.exec_in(vconn).await?.into_query()?;
        let out_fields = self.output_fields(input.fields());
        let (tx, out) = DataSet::channel(out_fields.clone());

        let group_by = self.group_by.clone();
        let outputs = self.outputs.clone();
        let emit_empty_group = self.emits_empty_group();

        tokio::spawn(async move {
            let mut current_key: Option<Vec<SortAtom>> = None;
            let mut current_group: Vec<Value> = Vec::new();
            let mut states: Vec<AggState> = Vec::new();

            let emit = |group: &[Value], states: Vec<AggState>| -> TextRow {
                let mut state_iter = states.into_iter();
                let mut group_iter = group.iter();
                let values: Vec<Value> = outputs
                    .iter()
                    .map(|output| match output {
                        OutputColumn::Group(_) => {
                            group_iter.next().cloned().unwrap_or(Value::Null)
                        }
                        OutputColumn::Agg(_) => {
                            state_iter.next().map(AggState::finish).unwrap_or(Value::Null)
                        }
                    })
                    .collect();
                TextRow::encode(&values, out_fields.clone())
            };

            loop {
                let row = match input.next_row().await {
                    Some(Ok(row)) => row,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => break,
                };
                let values = match row.decode() {
                    Ok(values) => values,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let key: Vec<SortAtom> = group_by
                    .iter()
                    .map(|i| {
                        values
                            .get(*i)
                            .map(SortAtom::from_value)
                            .unwrap_or(SortAtom::Null)
                    })
                    .collect();

                let boundary = current_key.as_ref().map(|k| *k != key).unwrap_or(true);
                if boundary {
                    if current_key.is_some() {
                        let finished = std::mem::take(&mut states);
                        if tx.send(Ok(emit(&current_group, finished))).await.is_err() {
                            return;
                        }
                    }
                    current_key = Some(key);
                    current_group = group_by
                        .iter()
                        .map(|i| values.get(*i).cloned().unwrap_or(Value::Null))
                        .collect();
                    states = outputs
                        .iter()
                        .filter_map(|o| match o {
                            OutputColumn::Agg(spec) => Some(AggState::new(spec.func)),
                            OutputColumn::Group(_) => None,
                        })
                        .collect();
                }

                let mut state_idx = 0;
                for output in &outputs {
                    if let OutputColumn::Agg(spec) = output {
                        let partial = values.get(spec.column).cloned().unwrap_or(Value::Null);
                        let partial_count =
                            spec.count_column.and_then(|c| values.get(c));
                        states[state_idx].absorb(&partial, partial_count);
                        state_idx += 1;
                    }
                }
            }

            if current_key.is_some() {
                let finished = std::mem::take(&mut states);
                let _ = tx.send(Ok(emit(&current_group, finished))).await;
            } else if emit_empty_group {
                let states: Vec<AggState> = outputs
                    .iter()
                    .filter_map(|o| match o {
                        OutputColumn::Agg(spec) => Some(AggState::new(spec.func)),
                        OutputColumn::Group(_) => None,
                    })
                    .collect();
                let _ = tx.send(Ok(emit(&[], states))).await;
            }
        });

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_state_prefers_exact_integers() {
        let mut sum = SumState::Empty;
        sum.add(&Value::Bytes(b"3".to_vec()));
        sum.add(&Value::Bytes(b"4".to_vec()));
        assert!(matches!(sum, SumState::Int(7)));
        sum.add(&Value::Bytes(b"0.5".to_vec()));
        match sum {
            SumState::Float(v) => assert!((v - 7.5).abs() < 1e-9),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn count_merges_by_addition() {
        let mut state = AggState::new(AggFunc::Count);
        state.absorb(&Value::Bytes(b"2".to_vec()), None);
        state.absorb(&Value::Null, None);
        state.absorb(&Value::Bytes(b"3".to_vec()), None);
        assert_eq!(state.finish(), Value::Int(5));
    }

    #[test]
    fn min_max_skip_nulls() {
        let mut min = AggState::new(AggFunc::Min);
        min.absorb(&Value::Null, None);
        min.absorb(&Value::Bytes(b"5".to_vec()), None);
        min.absorb(&Value::Bytes(b"3".to_vec()), None);
        assert_eq!(min.finish(), Value::Bytes(b"3".to_vec()));

        let mut max = AggState::new(AggFunc::Max);
        max.absorb(&Value::Bytes(b"5".to_vec()), None);
        max.absorb(&Value::Bytes(b"30".to_vec()), None);
        assert_eq!(max.finish(), Value::Bytes(b"30".to_vec()));
    }

    #[test]
    fn avg_divides_sum_by_count() {
        let mut avg = AggState::new(AggFunc::Avg);
        avg.absorb(&Value::Bytes(b"10".to_vec()), Some(&Value::Bytes(b"2".to_vec())));
        avg.absorb(&Value::Bytes(b"5".to_vec()), Some(&Value::Bytes(b"2".to_vec())));
        assert_eq!(avg.finish(), Value::Bytes(b"3.7500".to_vec()));
    }

    #[test]
    fn empty_sum_is_null() {
        let state = AggState::new(AggFunc::Sum);
        assert_eq!(state.finish(), Value::Null);
    }
}
