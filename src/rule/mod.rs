//! Sharding rules: the mapping from logical tables and shard-key values
//! to physical (database, table) pairs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::mysql::value::Value;

/// One physical shard target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shard {
    pub db: String,
    pub table: String,
    pub index: u32,
}

/// How a shard-key value picks a shard. Only `Range` supports pruning by
/// comparison predicates; the others prune on equality and IN lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ShardAlgorithm {
    Modulo {
        shards: u32,
    },
    Hash {
        shards: u32,
    },
    /// Sorted upper bounds; a value lands in the first shard whose bound
    /// exceeds it, values beyond the last bound land in the final shard.
    Range {
        bounds: Vec<i64>,
    },
}

impl ShardAlgorithm {
    pub fn shard_count(&self) -> u32 {
        match self {
            ShardAlgorithm::Modulo { shards } | ShardAlgorithm::Hash { shards } => *shards,
            ShardAlgorithm::Range { bounds } => bounds.len() as u32 + 1,
        }
    }

    pub fn is_range_capable(&self) -> bool {
        matches!(self, ShardAlgorithm::Range { .. })
    }

    fn index_for(&self, value: &Value) -> Result<u32> {
        match self {
            ShardAlgorithm::Modulo { shards } => {
                let v = value.as_i64().ok_or_else(|| {
                    ProxyError::Routing(format!("shard key {:?} is not an integer", value))
                })?;
                Ok(v.rem_euclid(*shards as i64) as u32)
            }
            ShardAlgorithm::Hash { shards } => {
                let raw = match value {
                    Value::Bytes(raw) => raw.clone(),
                    Value::Int(v) => v.to_string().into_bytes(),
                    Value::UInt(v) => v.to_string().into_bytes(),
                    Value::Double(v) => v.to_string().into_bytes(),
                    Value::Null => {
                        return Err(ProxyError::Routing(
                            "NULL shard key cannot be hashed".to_string(),
                        ))
                    }
                };
                Ok((fnv1a_64(&raw) % *shards as u64) as u32)
            }
            ShardAlgorithm::Range { bounds } => {
                let v = value.as_i64().ok_or_else(|| {
                    ProxyError::Routing(format!("shard key {:?} is not an integer", value))
                })?;
                Ok(bounds.iter().position(|b| v < *b).unwrap_or(bounds.len()) as u32)
            }
        }
    }

    /// Shard indices a closed interval can touch. Unbounded sides widen
    /// to the first/last shard.
    fn indices_for_range(&self, low: Option<i64>, high: Option<i64>) -> Vec<u32> {
        match self {
            ShardAlgorithm::Range { bounds } => {
                let lo = low
                    .map(|v| bounds.iter().position(|b| v < *b).unwrap_or(bounds.len()))
                    .unwrap_or(0);
                let hi = high
                    .map(|v| bounds.iter().position(|b| v < *b).unwrap_or(bounds.len()))
                    .unwrap_or(bounds.len());
                (lo..=hi).map(|i| i as u32).collect()
            }
            _ => (0..self.shard_count()).collect(),
        }
    }
}

/// 64-bit FNV-1a. The shard assignment must stay stable across releases,
/// so the hash is pinned here rather than delegated to `DefaultHasher`.
fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Rule for one logical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableRule {
    pub logical_table: String,
    pub shard_column: String,
    pub algorithm: ShardAlgorithm,
    /// Physical database pattern, e.g. `fake_db_${0000}`. The digit run
    /// inside `${...}` sets the zero padding.
    pub db_pattern: String,
    /// Physical table pattern; a pattern without a placeholder keeps one
    /// table name across shards.
    pub table_pattern: String,
    /// Permits keyless UPDATE/DELETE to fan out to every shard. Off by
    /// default: an unkeyed write is usually a bug.
    #[serde(default)]
    pub allow_full_scan: bool,
}

impl TableRule {
    pub fn shard_count(&self) -> u32 {
        self.algorithm.shard_count()
    }

    pub fn shard_for(&self, value: &Value) -> Result<Shard> {
        let index = self.algorithm.index_for(value)?;
        Ok(self.shard_at(index))
    }

    pub fn shards_for_range(&self, low: Option<i64>, high: Option<i64>) -> Vec<Shard> {
        self.algorithm
            .indices_for_range(low, high)
            .into_iter()
            .map(|i| self.shard_at(i))
            .collect()
    }

    pub fn all_shards(&self) -> Vec<Shard> {
        (0..self.shard_count()).map(|i| self.shard_at(i)).collect()
    }

    pub fn shard_at(&self, index: u32) -> Shard {
        Shard {
            db: render_pattern(&self.db_pattern, index),
            table: render_pattern(&self.table_pattern, index),
            index,
        }
    }
}

/// Replaces a `${0000}`-style slot with the zero-padded shard index; the
/// digit count inside the braces is the padding width.
pub fn render_pattern(pattern: &str, index: u32) -> String {
    let Some(start) = pattern.find("${") else {
        return pattern.to_string();
    };
    let Some(end_rel) = pattern[start..].find('}') else {
        return pattern.to_string();
    };
    let end = start + end_rel;
    let width = pattern[start + 2..end].len().max(1);
    format!(
        "{}{:0width$}{}",
        &pattern[..start],
        index,
        &pattern[end + 1..],
        width = width
    )
}

/// The active rule set: logical table name → rule. Tables not listed are
/// unsharded and execute on the default data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingRule {
    pub tables: Vec<TableRule>,
}

impl ShardingRule {
    pub fn rule_for(&self, logical_table: &str) -> Option<&TableRule> {
        self.tables
            .iter()
            .find(|t| t.logical_table.eq_ignore_ascii_case(logical_table))
    }

    pub fn is_sharded(&self, logical_table: &str) -> bool {
        self.rule_for(logical_table).is_some()
    }

    /// Every physical database any rule maps to, deduplicated in rule
    /// order. DDL broadcast targets this set.
    pub fn all_databases(&self) -> Vec<String> {
        let mut seen = HashMap::new();
        let mut out = Vec::new();
        for rule in &self.tables {
            for shard in rule.all_shards() {
                if seen.insert(shard.db.clone(), ()).is_none() {
                    out.push(shard.db);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student_rule(shards: u32) -> TableRule {
        TableRule {
            logical_table: "student".to_string(),
            shard_column: "uid".to_string(),
            algorithm: ShardAlgorithm::Modulo { shards },
            db_pattern: "fake_db_${0000}".to_string(),
            table_pattern: "student".to_string(),
            allow_full_scan: false,
        }
    }

    #[test]
    fn modulo_routes_by_remainder() {
        let rule = student_rule(8);
        assert_eq!(rule.shard_for(&Value::Int(1)).unwrap().db, "fake_db_0001");
        assert_eq!(rule.shard_for(&Value::Int(8)).unwrap().db, "fake_db_0000");
        assert_eq!(rule.shard_for(&Value::Int(9)).unwrap().db, "fake_db_0001");
        assert_eq!(rule.shard_for(&Value::Int(16)).unwrap().db, "fake_db_0000");
    }

    #[test]
    fn modulo_handles_negative_keys() {
        let rule = student_rule(8);
        let shard = rule.shard_for(&Value::Int(-3)).unwrap();
        assert!(shard.index < 8);
        assert_eq!(shard.index, 5);
    }

    #[test]
    fn modulo_accepts_numeric_strings() {
        let rule = student_rule(8);
        let shard = rule.shard_for(&Value::Bytes(b"9".to_vec())).unwrap();
        assert_eq!(shard.db, "fake_db_0001");
    }

    #[test]
    fn hash_is_stable() {
        let rule = TableRule {
            algorithm: ShardAlgorithm::Hash { shards: 16 },
            ..student_rule(0)
        };
        let a = rule.shard_for(&Value::Bytes(b"alice".to_vec())).unwrap();
        let b = rule.shard_for(&Value::Bytes(b"alice".to_vec())).unwrap();
        assert_eq!(a, b);
        // pinned: FNV-1a of "alice" mod 16
        assert_eq!(a.index, (fnv1a_64(b"alice") % 16) as u32);
    }

    #[test]
    fn range_bounds_partition_the_line() {
        let rule = TableRule {
            algorithm: ShardAlgorithm::Range {
                bounds: vec![100, 200],
            },
            ..student_rule(0)
        };
        assert_eq!(rule.shard_for(&Value::Int(5)).unwrap().index, 0);
        assert_eq!(rule.shard_for(&Value::Int(100)).unwrap().index, 1);
        assert_eq!(rule.shard_for(&Value::Int(199)).unwrap().index, 1);
        assert_eq!(rule.shard_for(&Value::Int(500)).unwrap().index, 2);
    }

    #[test]
    fn range_pruning_keeps_overlapping_shards() {
        let rule = TableRule {
            algorithm: ShardAlgorithm::Range {
                bounds: vec![100, 200],
            },
            ..student_rule(0)
        };
        let shards = rule.shards_for_range(Some(150), Some(180));
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].index, 1);

        let open_high = rule.shards_for_range(Some(150), None);
        assert_eq!(
            open_high.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn non_range_algorithms_do_not_prune_ranges() {
        let rule = student_rule(4);
        assert_eq!(rule.shards_for_range(Some(1), Some(2)).len(), 4);
    }

    #[test]
    fn pattern_rendering() {
        assert_eq!(render_pattern("fake_db_${0000}", 3), "fake_db_0003");
        assert_eq!(render_pattern("t_${00}", 12), "t_12");
        assert_eq!(render_pattern("plain", 7), "plain");
        assert_eq!(render_pattern("db_${0}_x", 5), "db_5_x");
    }

    #[test]
    fn null_key_is_a_routing_error() {
        let rule = student_rule(8);
        assert!(matches!(
            rule.shard_for(&Value::Null),
            Err(ProxyError::Routing(_))
        ));
    }

    #[test]
    fn all_databases_deduplicates() {
        let rule = ShardingRule {
            tables: vec![student_rule(4), {
                let mut other = student_rule(4);
                other.logical_table = "score".to_string();
                other
            }],
        };
        assert_eq!(rule.all_databases().len(), 4);
    }
}
