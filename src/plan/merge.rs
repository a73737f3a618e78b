use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::mysql::rows::{ResultSet, TextRow};
use crate::mysql::value::Value;
use crate::runtime::{DataSet, ExecuteResult, VConnRef};

use super::Plan;

/// Where a sort key lives in the child rows: a fixed position, or a
/// column name resolved against the result descriptors at execution time
/// (wildcard projections only know names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortTarget {
    Index(usize),
    Name(String),
}

/// One sort key of an ordered merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub target: SortTarget,
    pub desc: bool,
}

impl SortKey {
    pub fn index(column: usize, desc: bool) -> SortKey {
        SortKey {
            target: SortTarget::Index(column),
            desc,
        }
    }

    pub fn name(name: &str, desc: bool) -> SortKey {
        SortKey {
            target: SortTarget::Name(name.to_string()),
            desc,
        }
    }

    fn resolve(&self, fields: &ResultSet) -> Result<ResolvedKey> {
        let column = match &self.target {
            SortTarget::Index(i) => *i,
            SortTarget::Name(name) => fields
                .columns
                .iter()
                .position(|f| f.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    crate::error::ProxyError::Routing(format!(
                        "sort column {:?} not present in result",
                        name
                    ))
                })?,
        };
        Ok(ResolvedKey {
            column,
            desc: self.desc,
        })
    }
}

/// A sort key bound to a concrete column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedKey {
    pub column: usize,
    pub desc: bool,
}

/// K-way merge over children that each return rows already sorted by
/// `keys`. `output_width` trims hidden trailing sort columns that the
/// rewriter appended to the children's projections.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub children: Vec<Plan>,
    pub keys: Vec<SortKey>,
    pub output_width: Option<usize>,
}

/// Comparable form of a single sort-key cell. Nulls sort first under ASC,
/// integers compare exactly, everything else falls back to numeric then
/// lexicographic byte order.
#[derive(Debug, Clone)]
pub enum SortAtom {
    Null,
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl SortAtom {
    pub fn from_value(value: &Value) -> SortAtom {
        match value {
            Value::Null => SortAtom::Null,
            Value::Int(v) => SortAtom::Int(*v),
            Value::UInt(v) => match i64::try_from(*v) {
                Ok(v) => SortAtom::Int(v),
                Err(_) => SortAtom::Float(*v as f64),
            },
            Value::Double(v) => SortAtom::Float(*v),
            Value::Bytes(raw) => {
                let text = std::str::from_utf8(raw).ok();
                if let Some(v) = text.and_then(|s| s.trim().parse::<i64>().ok()) {
                    SortAtom::Int(v)
                } else if let Some(v) = text.and_then(|s| s.trim().parse::<f64>().ok()) {
                    SortAtom::Float(v)
                } else {
                    SortAtom::Bytes(raw.clone())
                }
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortAtom::Null => 0,
            SortAtom::Int(_) | SortAtom::Float(_) => 1,
            SortAtom::Bytes(_) => 2,
        }
    }
}

impl PartialEq for SortAtom {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SortAtom {}

impl PartialOrd for SortAtom {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortAtom {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortAtom::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Sort tuple of a row under a resolved key list.
pub fn sort_tuple(row: &TextRow, keys: &[ResolvedKey]) -> Result<Vec<SortAtom>> {
    let values = row.decode()?;
    Ok(keys
        .iter()
        .map(|k| {
            values
                .get(k.column)
                .map(SortAtom::from_value)
                .unwrap_or(SortAtom::Null)
        })
        .collect())
}

/// Compares two sort tuples under the key directions.
pub fn compare_tuples(a: &[SortAtom], b: &[SortAtom], keys: &[ResolvedKey]) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let mut ord = a[i].cmp(&b[i]);
        if key.desc {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

struct HeapEntry {
    atoms: Vec<SortAtom>,
    keys: Arc<Vec<ResolvedKey>>,
    child: usize,
    row: TextRow,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // ties break on child index so the merge is stable
        compare_tuples(&self.atoms, &other.atoms, &self.keys)
            .then_with(|| self.child.cmp(&other.child))
    }
}

impl MergePlan {
    pub(super) async fn exec_in(&self, vconn: VConnRef) -> Result<DataSet> {
        let gathered = futures::future::join_all(self.children.iter().map(|child| {
            let child = child.clone();
            let vconn = vconn.clone();
            async move { child.exec_in(vconn).await.and_then(ExecuteResult::into_query) }
        }))
        .await;

        let mut streams = Vec::with_capacity(gathered.len());
        let mut first_err = None;
        for result in gathered {
            match result {
                Ok(ds) => streams.push(ds),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    } else {
                        warn!(error = %e, "discarding secondary merge child error");
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        let child_fields = streams
            .first()
            .map(|ds| ds.fields().clone())
            .unwrap_or_else(|| ResultSet::new(Vec::new()));
        let out_fields = match self.output_width {
            Some(width) if width < child_fields.columns.len() => {
                ResultSet::new(child_fields.columns[..width].to_vec())
            }
            _ => child_fields.clone(),
        };

        let keys = Arc::new(
            self.keys
                .iter()
                .map(|k| k.resolve(&child_fields))
                .collect::<Result<Vec<_>>>()?,
        );
        let output_width = self.output_width;
        let (tx, out) = DataSet::channel(out_fields.clone());

        tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();

            // prime the heap with each child's head row
            for (child, stream) in streams.iter_mut().enumerate() {
                match stream.next_row().await {
                    Some(Ok(row)) => match sort_tuple(&row, &keys) {
                        Ok(atoms) => heap.push(Reverse(HeapEntry {
                            atoms,
                            keys: keys.clone(),
                            child,
                            row,
                        })),
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {}
                }
            }

            while let Some(Reverse(entry)) = heap.pop() {
                let child = entry.child;
                let row = match trim_row(entry.row, output_width, &out_fields) {
                    Ok(row) => row,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                if tx.send(Ok(row)).await.is_err() {
                    return;
                }
                match streams[child].next_row().await {
                    Some(Ok(row)) => match sort_tuple(&row, &keys) {
                        Ok(atoms) => heap.push(Reverse(HeapEntry {
                            atoms,
                            keys: keys.clone(),
                            child,
                            row,
                        })),
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {}
                }
            }
        });

        Ok(out)
    }
}

/// Cuts hidden trailing sort columns off a row when the merge appended
/// them to the children's projections. A prefix of a text row payload is
/// itself a valid row payload.
fn trim_row(
    row: TextRow,
    output_width: Option<usize>,
    out_fields: &Arc<ResultSet>,
) -> Result<TextRow> {
    match output_width {
        Some(width) if width < row.result_set.column_count() => {
            let keep = row.prefix_len(width)?;
            Ok(TextRow::new(row.content.slice(..keep), out_fields.clone()))
        }
        _ => Ok(row),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atom_ordering() {
        assert!(SortAtom::Null < SortAtom::Int(-100));
        assert!(SortAtom::Int(1) < SortAtom::Int(2));
        assert!(SortAtom::Int(2) < SortAtom::Float(2.5));
        assert!(SortAtom::Float(9.0) < SortAtom::Bytes(b"a".to_vec()));
        assert!(SortAtom::Bytes(b"a".to_vec()) < SortAtom::Bytes(b"b".to_vec()));
    }

    #[test]
    fn numeric_strings_compare_numerically() {
        let a = SortAtom::from_value(&Value::Bytes(b"9".to_vec()));
        let b = SortAtom::from_value(&Value::Bytes(b"10".to_vec()));
        assert!(a < b);
    }

    #[test]
    fn tuple_comparison_honors_direction() {
        let keys = vec![ResolvedKey {
            column: 0,
            desc: true,
        }];
        let a = vec![SortAtom::Int(1)];
        let b = vec![SortAtom::Int(2)];
        assert_eq!(compare_tuples(&a, &b, &keys), Ordering::Greater);
        assert_eq!(compare_tuples(&b, &a, &keys), Ordering::Less);
    }

    #[test]
    fn name_target_resolves_against_fields() {
        use crate::mysql::protocol::FieldType;
        use crate::mysql::rows::Field;

        let rs = ResultSet::new(vec![
            Field::new("id", FieldType::Long),
            Field::new("uid", FieldType::Long),
        ]);
        let key = SortKey::name("UID", false);
        assert_eq!(key.resolve(&rs).unwrap().column, 1);
        assert!(SortKey::name("missing", false).resolve(&rs).is_err());
    }
}
