use crate::constants::DEFAULT_FLAG_VALUE;
use crate::error::{GeoflowError, Result};
use crate::pipeline::ingestion::{Delimiter, Ingestor};
use crate::pipeline::{CancelToken, Session, Stage, StageReport};
use crate::types::{canonical_field, Record, RecordSet, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// Column names a spatial table can carry
static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("field name pattern is valid"));

/// A new field computed from existing ones
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DerivedField {
    pub target: String,
    #[serde(flatten)]
    pub derivation: Derivation,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derivation {
    /// Arithmetic sum; Null counts as zero
    Sum { fields: Vec<String> },
    Copy { field: String },
    /// String coercion of a field
    Text { field: String },
    /// First rule whose pattern matches any of the fields wins
    Category {
        fields: Vec<String>,
        rules: Vec<CategoryRule>,
    },
    /// Single-rule category returning a fixed flag value
    Flag {
        fields: Vec<String>,
        pattern: String,
        #[serde(default = "default_flag")]
        flag: String,
    },
    /// Scalar copied from a companion table sharing a key
    Lookup {
        key: String,
        table: String,
        table_key: String,
        value: String,
    },
}

fn default_flag() -> String {
    DEFAULT_FLAG_VALUE.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CategoryRule {
    pub pattern: String,
    pub value: String,
}

/// A companion table that `lookup` derivations read from
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LookupTableConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub delimiter: Delimiter,
}

/// Compile a pattern with whole-value anchoring.
pub fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| GeoflowError::Config(format!("invalid pattern '{}': {}", pattern, e)))
}

pub fn valid_field_name(name: &str) -> bool {
    FIELD_NAME.is_match(&canonical_field(name))
}

impl DerivedField {
    /// Checks that need no data: target name, field lists, regexes.
    pub fn validate(&self) -> Result<()> {
        if !valid_field_name(&self.target) {
            return Err(GeoflowError::Config(format!(
                "'{}' is not a valid field name",
                self.target
            )));
        }
        let empty_fields = |fields: &Vec<String>| fields.is_empty();
        match &self.derivation {
            Derivation::Sum { fields } | Derivation::Flag { fields, .. } if empty_fields(fields) => {
                Err(GeoflowError::Config(format!("{}: no input fields", self.target)))
            }
            Derivation::Category { fields, rules } => {
                if fields.is_empty() || rules.is_empty() {
                    return Err(GeoflowError::Config(format!(
                        "{}: category needs fields and rules",
                        self.target
                    )));
                }
                rules.iter().try_for_each(|r| anchored(&r.pattern).map(|_| ()))
            }
            Derivation::Flag { pattern, .. } => anchored(pattern).map(|_| ()),
            _ => Ok(()),
        }
    }
}

/// Companion tables by name
#[derive(Debug, Default)]
pub struct LookupTables(HashMap<String, RecordSet>);

impl LookupTables {
    pub fn load(configs: &[LookupTableConfig]) -> Result<Self> {
        let mut tables = HashMap::new();
        for cfg in configs {
            let set = read_companion(&cfg.path, cfg.delimiter)?;
            info!("📚 Loaded lookup table '{}' ({} rows)", cfg.name, set.len());
            tables.insert(cfg.name.clone(), set);
        }
        Ok(Self(tables))
    }

    pub fn insert(&mut self, name: &str, set: RecordSet) {
        self.0.insert(name.to_string(), set);
    }

    fn get(&self, name: &str) -> Result<&RecordSet> {
        self.0
            .get(name)
            .ok_or_else(|| GeoflowError::Config(format!("no lookup table named '{}'", name)))
    }
}

fn read_companion(path: &Path, delimiter: Delimiter) -> Result<RecordSet> {
    let ingestor = Ingestor::new(delimiter);
    let spatial = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_lowercase().as_str(), "geojson" | "json"))
        .unwrap_or(false);
    if spatial {
        ingestor.read_table(path)
    } else {
        ingestor.read_file(path)
    }
}

enum Step {
    Sum(Vec<String>),
    Copy(String),
    Text(String),
    Category {
        fields: Vec<String>,
        rules: Vec<(Regex, Value)>,
    },
    Lookup {
        key: String,
        index: HashMap<String, Value>,
    },
}

impl Step {
    fn inputs(&self) -> Vec<&str> {
        match self {
            Step::Sum(fields) | Step::Category { fields, .. } => fields.iter().map(String::as_str).collect(),
            Step::Copy(f) | Step::Text(f) => vec![f.as_str()],
            Step::Lookup { key, .. } => vec![key.as_str()],
        }
    }
}

/// Compiled derivations, applied in declaration order
pub struct Deriver {
    steps: Vec<(String, Step)>,
}

impl Deriver {
    pub fn new(fields: &[DerivedField], tables: &LookupTables) -> Result<Self> {
        let mut steps = Vec::with_capacity(fields.len());
        for field in fields {
            field.validate()?;
            let canon = |names: &[String]| names.iter().map(|f| canonical_field(f)).collect::<Vec<_>>();
            let step = match &field.derivation {
                Derivation::Sum { fields } => Step::Sum(canon(fields)),
                Derivation::Copy { field } => Step::Copy(canonical_field(field)),
                Derivation::Text { field } => Step::Text(canonical_field(field)),
                Derivation::Category { fields, rules } => Step::Category {
                    fields: canon(fields),
                    rules: rules
                        .iter()
                        .map(|r| Ok((anchored(&r.pattern)?, Value::Text(r.value.clone()))))
                        .collect::<Result<_>>()?,
                },
                Derivation::Flag { fields, pattern, flag } => Step::Category {
                    fields: canon(fields),
                    rules: vec![(anchored(pattern)?, Value::Text(flag.clone()))],
                },
                Derivation::Lookup {
                    key,
                    table,
                    table_key,
                    value,
                } => {
                    let set = tables.get(table)?;
                    let table_key = set.require_field(table_key)?;
                    let value = set.require_field(value)?;
                    let mut index = HashMap::new();
                    for row in &set.records {
                        if let Some(k) = row.get(&table_key).key_string() {
                            index.entry(k).or_insert_with(|| row.get(&value).clone());
                        }
                    }
                    Step::Lookup {
                        key: canonical_field(key),
                        index,
                    }
                }
            };
            steps.push((canonical_field(&field.target), step));
        }
        Ok(Self { steps })
    }

    /// Output schema, failing if a step reads a field that does not exist
    /// by the time it runs.
    pub fn check_schema(&self, set: &RecordSet) -> Result<Vec<String>> {
        let mut schema = RecordSet::new(set.source.clone(), set.schema.clone());
        for (target, step) in &self.steps {
            for input in step.inputs() {
                schema.require_field(input)?;
            }
            schema.push_field(target);
        }
        Ok(schema.schema)
    }

    pub fn apply(&self, record: &Record) -> Record {
        self.steps.iter().fold(record.clone(), |acc, (target, step)| {
            let value = evaluate(step, &acc, target);
            acc.with(target, value)
        })
    }

    pub fn apply_all(&self, set: &RecordSet, cancel: &CancelToken) -> Result<RecordSet> {
        let schema = self.check_schema(set)?;
        let mut records = Vec::with_capacity(set.len());
        for record in &set.records {
            cancel.check()?;
            records.push(self.apply(record));
        }
        Ok(RecordSet {
            source: set.source.clone(),
            schema,
            records,
        })
    }
}

fn sum(fields: &[String], record: &Record, target: &str) -> Value {
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for field in fields {
        match record.get(field) {
            Value::Null => {}
            Value::Int(i) => {
                int_total = int_total.and_then(|t| t.checked_add(*i));
                float_total += *i as f64;
            }
            other => match other.as_f64() {
                Some(f) => {
                    int_total = None;
                    float_total += f;
                }
                None => {
                    warn!(target_field = target, field = %field, value = %other, "non-numeric value in sum");
                    return Value::Null;
                }
            },
        }
    }
    match int_total {
        Some(i) => Value::Int(i),
        None => Value::Float(float_total),
    }
}

fn evaluate(step: &Step, record: &Record, target: &str) -> Value {
    match step {
        Step::Sum(fields) => sum(fields, record, target),
        Step::Copy(field) => record.get(field).clone(),
        Step::Text(field) => match record.get(field) {
            Value::Null => Value::Null,
            v => Value::Text(v.to_string()),
        },
        Step::Category { fields, rules } => rules
            .iter()
            .find(|(re, _)| {
                fields.iter().any(|f| {
                    let v = record.get(f);
                    !v.is_null() && re.is_match(&v.to_string())
                })
            })
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null),
        Step::Lookup { key, index } => record
            .get(key)
            .key_string()
            .and_then(|k| index.get(&k).cloned())
            .unwrap_or(Value::Null),
    }
}

/// Computes derived fields on every record.
pub struct DeriveStage;

impl Stage for DeriveStage {
    fn name(&self) -> &'static str {
        "derive"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        if session.job.derive.is_empty() {
            return Ok(StageReport::success(self.name(), session.current.len(), "no derived fields"));
        }
        let tables = LookupTables::load(&session.job.lookup_table)?;
        let deriver = Deriver::new(&session.job.derive, &tables)?;
        let derived = deriver.apply_all(&session.current, &session.cancel)?;
        info!(
            "🧪 Derived {} field(s) on {} records",
            session.job.derive.len(),
            derived.len()
        );
        let count = derived.len();
        session.current = derived;
        Ok(StageReport::success(
            self.name(),
            count,
            format!("{} derived fields", session.job.derive.len()),
        ))
    }
}
