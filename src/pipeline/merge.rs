use crate::error::{GeoflowError, Result};
use crate::pipeline::{CancelToken, Session, Stage, StageReport};
use crate::types::{canonical_field, Record, RecordSet};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, instrument, warn};

/// What to do when a join key value occurs more than once in a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first occurrence in file order, drop later ones with a warning
    #[default]
    FirstWins,
    /// Abort the run
    Fail,
}

/// Pairs of (left field, right field) compared for equality
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct JoinKey(pub Vec<(String, String)>);

impl JoinKey {
    pub fn single(left: &str, right: &str) -> Self {
        JoinKey(vec![(left.to_string(), right.to_string())])
    }

    fn resolve(&self, left: &RecordSet, right: &RecordSet) -> Result<Vec<(String, String)>> {
        if self.0.is_empty() {
            return Err(GeoflowError::Config("join key has no field pairs".to_string()));
        }
        self.0
            .iter()
            .map(|(l, r)| Ok((left.require_field(l)?, right.require_field(r)?)))
            .collect()
    }
}

fn composite_key(record: &Record, fields: &[&str]) -> Option<Vec<String>> {
    fields.iter().map(|f| record.get(f).key_string()).collect()
}

/// Index records by key, enforcing the duplicate policy. Records with a null
/// key component never match anything.
fn index_by_key<'a>(
    set: &'a RecordSet,
    fields: &[&str],
    policy: DuplicatePolicy,
) -> Result<Vec<(Vec<String>, &'a Record)>> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(set.len());
    for record in &set.records {
        let Some(key) = composite_key(record, fields) else {
            continue;
        };
        if !seen.insert(key.clone()) {
            match policy {
                DuplicatePolicy::FirstWins => {
                    warn!(source = %set.source, key = ?key, "duplicate join key; keeping first occurrence");
                    continue;
                }
                DuplicatePolicy::Fail => {
                    return Err(GeoflowError::Schema(format!(
                        "duplicate join key {:?} in {}",
                        key, set.source
                    )));
                }
            }
        }
        out.push((key, record));
    }
    Ok(out)
}

/// Inner join of two record sets. The output follows the left order; on a
/// field-name collision the right source's value is kept.
#[instrument(skip(left, right, cancel), fields(left = %left.source, right = %right.source))]
pub fn merge(
    left: &RecordSet,
    right: &RecordSet,
    key: &JoinKey,
    policy: DuplicatePolicy,
    cancel: &CancelToken,
) -> Result<RecordSet> {
    let pairs = key.resolve(left, right)?;
    let left_fields: Vec<&str> = pairs.iter().map(|(l, _)| l.as_str()).collect();
    let right_fields: Vec<&str> = pairs.iter().map(|(_, r)| r.as_str()).collect();

    let right_index: HashMap<Vec<String>, &Record> = index_by_key(right, &right_fields, policy)?
        .into_iter()
        .collect();

    let mut merged = RecordSet::new(format!("{} ⋈ {}", left.source, right.source), left.schema.clone());
    for field in &right.schema {
        merged.push_field(field);
    }

    for (key, left_record) in index_by_key(left, &left_fields, policy)? {
        cancel.check()?;
        let Some(right_record) = right_index.get(&key) else {
            continue;
        };
        let mut wide = left_record.clone();
        for (field, value) in right_record.fields() {
            wide.insert(field, value.clone());
        }
        if wide.geometry.is_none() {
            wide.geometry = right_record.geometry.clone();
        }
        merged.records.push(wide);
    }

    let dropped_left = left.len() - merged.len();
    info!(
        matched = merged.len(),
        dropped_left,
        "🔗 Joined {} x {} records",
        left.len(),
        right.len()
    );
    Ok(merged)
}

/// Names of fields present in both sources (the right value wins for these)
pub fn colliding_fields(left: &RecordSet, right: &RecordSet) -> Vec<String> {
    left.schema
        .iter()
        .filter(|f| right.schema.contains(f))
        .cloned()
        .collect()
}

pub struct MergeStage;

impl Stage for MergeStage {
    fn name(&self) -> &'static str {
        "merge"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        let mut sources = std::mem::take(&mut session.sources);
        let merged = match (&session.job.merge, sources.len()) {
            (_, 0) => return Err(GeoflowError::Config("no input sources".to_string())),
            (None, 1) => sources.remove(0),
            (Some(_), 1) => {
                warn!("join key configured but only one source was read; passing through");
                sources.remove(0)
            }
            (Some(cfg), 2) => {
                let collisions: Vec<String> = colliding_fields(&sources[0], &sources[1])
                    .into_iter()
                    .filter(|f| !cfg.keys.0.iter().any(|(l, r)| canonical_field(l) == *f && canonical_field(r) == *f))
                    .collect();
                if !collisions.is_empty() {
                    info!(fields = ?collisions, "fields present in both sources; second source's values are kept");
                }
                merge(&sources[0], &sources[1], &cfg.keys, cfg.on_duplicate, &session.cancel)?
            }
            (_, n) => {
                return Err(GeoflowError::Config(format!(
                    "a join needs exactly two sources, got {}",
                    n
                )))
            }
        };
        let count = merged.len();
        session.records_merged = count;
        session.current = merged;
        Ok(StageReport::success(self.name(), count, format!("{} records after merge", count)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn set(source: &str, schema: &[&str], rows: &[&[Value]]) -> RecordSet {
        let mut set = RecordSet::new(source, schema.iter().map(|s| s.to_string()).collect());
        for row in rows {
            let record: Record = schema.iter().zip(row.iter()).map(|(f, v)| (*f, v.clone())).collect();
            set.records.push(record);
        }
        set
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn inner_join_drops_unmatched() {
        let left = set(
            "l",
            &["NAME", "VALUE"],
            &[&[text("a"), Value::Int(1)], &[text("b"), Value::Int(2)], &[text("c"), Value::Int(3)]],
        );
        let right = set("r", &["NAME", "REGION"], &[&[text("b"), text("west")], &[text("z"), text("east")]]);

        let merged = merge(&left, &right, &JoinKey::single("name", "name"), DuplicatePolicy::FirstWins, &CancelToken::new()).unwrap();
        assert!(merged.len() <= left.len().min(right.len()));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records[0].get("REGION"), &text("west"));
        assert_eq!(merged.schema, vec!["NAME", "VALUE", "REGION"]);
        for r in &merged.records {
            let k = r.get("NAME").key_string();
            assert!(left.records.iter().any(|l| l.get("NAME").key_string() == k));
            assert!(right.records.iter().any(|x| x.get("NAME").key_string() == k));
        }
    }

    #[test]
    fn collision_keeps_second_source_value() {
        let left = set("l", &["ID", "STATUS"], &[&[Value::Int(1), text("old")]]);
        let right = set("r", &["ID", "STATUS"], &[&[text("1"), text("new")]]);

        let merged = merge(&left, &right, &JoinKey::single("ID", "ID"), DuplicatePolicy::FirstWins, &CancelToken::new()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records[0].get("STATUS"), &text("new"));
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let left = set("l", &["K", "V"], &[&[text("a"), Value::Int(1)], &[text("a"), Value::Int(2)]]);
        let right = set("r", &["K", "W"], &[&[text("a"), text("x")], &[text("a"), text("y")]]);

        let merged = merge(&left, &right, &JoinKey::single("K", "K"), DuplicatePolicy::FirstWins, &CancelToken::new()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records[0].get("V"), &Value::Int(1));
        assert_eq!(merged.records[0].get("W"), &text("x"));
    }

    #[test]
    fn duplicates_fail_when_requested() {
        let left = set("l", &["K"], &[&[text("a")]]);
        let right = set("r", &["K"], &[&[text("a")], &[text("a")]]);
        let err = merge(&left, &right, &JoinKey::single("K", "K"), DuplicatePolicy::Fail, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, GeoflowError::Schema(_)));
    }

    #[test]
    fn composite_keys_compare_all_pairs() {
        let left = set(
            "l",
            &["COUNTY", "STATE", "POP"],
            &[&[text("Orange"), text("CA"), Value::Int(3)], &[text("Orange"), text("FL"), Value::Int(1)]],
        );
        let right = set("r", &["NAME", "ST", "SEAT"], &[&[text("Orange"), text("FL"), text("Orlando")]]);
        let key = JoinKey(vec![("COUNTY".into(), "NAME".into()), ("STATE".into(), "ST".into())]);

        let merged = merge(&left, &right, &key, DuplicatePolicy::Fail, &CancelToken::new()).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.records[0].get("POP"), &Value::Int(1));
        assert_eq!(merged.records[0].get("SEAT"), &text("Orlando"));
    }

    #[test]
    fn cancelled_merge_stops() {
        let left = set("l", &["K"], &[&[text("a")]]);
        let right = set("r", &["K"], &[&[text("a")]]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = merge(&left, &right, &JoinKey::single("K", "K"), DuplicatePolicy::FirstWins, &cancel).unwrap_err();
        assert!(matches!(err, GeoflowError::Cancelled));
    }

    #[test]
    fn unknown_key_field_is_schema_error() {
        let left = set("l", &["A"], &[]);
        let right = set("r", &["B"], &[]);
        let err = merge(&left, &right, &JoinKey::single("A", "A"), DuplicatePolicy::FirstWins, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, GeoflowError::Schema(_)));
    }
}
