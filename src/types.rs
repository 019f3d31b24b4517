use geo::{Geometry, Point, Polygon};
use std::collections::HashMap;
use std::fmt;

/// Scalar attribute value carried by a record
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Infer a value from a raw delimited-text cell.
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        // coded values such as use codes and zip+4 keep their leading zeros
        let digits = trimmed.trim_start_matches(['-', '+']);
        if digits.len() > 1 && digits.starts_with('0') && digits.as_bytes()[1].is_ascii_digit() {
            return Value::Text(trimmed.to_string());
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        Value::Text(trimmed.to_string())
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Text(b.to_string()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            Value::Null => None,
        }
    }

    /// Canonical string used for key equality, so `Int(7)`, `Float(7.0)` and
    /// `Text("7")` all join together.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Text(s) => Some(s.trim().to_string()),
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) if x.fract() == 0.0 && x.abs() < 1e15 => write!(f, "{}", *x as i64),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Canonical form of a field name: trimmed and upper-cased.
pub fn canonical_field(name: &str) -> String {
    name.trim().to_uppercase()
}

/// One input row plus whatever geometry has been resolved for it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: HashMap<String, Value>,
    pub geometry: Option<Geometry<f64>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(&canonical_field(field)).unwrap_or(&NULL)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(&canonical_field(field))
    }

    /// Copy-forward constructor: a new record with one more (or overwritten) field.
    pub fn with(&self, field: &str, value: Value) -> Self {
        let mut next = self.clone();
        next.values.insert(canonical_field(field), value);
        next
    }

    pub fn with_geometry(&self, geometry: Option<Geometry<f64>>) -> Self {
        let mut next = self.clone();
        next.geometry = geometry;
        next
    }

    pub(crate) fn insert(&mut self, field: &str, value: Value) {
        self.values.insert(canonical_field(field), value);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn point(&self) -> Option<Point<f64>> {
        match &self.geometry {
            Some(Geometry::Point(p)) => Some(*p),
            _ => None,
        }
    }

    pub fn polygon(&self) -> Option<&Polygon<f64>> {
        match &self.geometry {
            Some(Geometry::Polygon(p)) => Some(p),
            _ => None,
        }
    }
}

impl<K: AsRef<str>> FromIterator<(K, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k.as_ref(), v);
        }
        record
    }
}

/// Ordered schema plus the records that follow it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    /// Source name used in log and error context (file path or table name)
    pub source: String,
    pub schema: Vec<String>,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new(source: impl Into<String>, schema: Vec<String>) -> Self {
        Self {
            source: source.into(),
            schema: schema.iter().map(|f| canonical_field(f)).collect(),
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        let wanted = canonical_field(field);
        self.schema.iter().any(|f| *f == wanted)
    }

    /// Resolve a user-supplied field name against the schema.
    pub fn require_field(&self, field: &str) -> crate::error::Result<String> {
        let wanted = canonical_field(field);
        if self.schema.contains(&wanted) {
            Ok(wanted)
        } else {
            Err(crate::error::GeoflowError::Schema(format!(
                "field '{}' not found in {} (available: {})",
                field,
                self.source,
                self.schema.join(", ")
            )))
        }
    }

    pub fn push_field(&mut self, field: &str) {
        let canonical = canonical_field(field);
        if !self.schema.contains(&canonical) {
            self.schema.push(canonical);
        }
    }

    pub fn geometry_count(&self) -> usize {
        self.records.iter().filter(|r| r.geometry.is_some()).count()
    }
}
