use crate::error::{GeoflowError, Result};
use crate::pipeline::{Session, Stage, StageReport};
use crate::types::{canonical_field, Record, RecordSet};
use std::collections::HashSet;
use tracing::info;

/// Narrow a record set to the chosen fields, in the chosen order.
/// An empty selection keeps everything.
pub fn select(set: &RecordSet, fields: &[String]) -> Result<RecordSet> {
    if fields.is_empty() {
        return Ok(set.clone());
    }
    let chosen = fields
        .iter()
        .map(|f| set.require_field(f))
        .collect::<Result<Vec<_>>>()?;

    let mut out = RecordSet::new(set.source.clone(), Vec::new());
    for field in &chosen {
        out.push_field(field);
    }
    out.records = set
        .records
        .iter()
        .map(|record| {
            let mut narrowed: Record = out
                .schema
                .iter()
                .map(|f| (f.as_str(), record.get(f).clone()))
                .collect();
            narrowed.geometry = record.geometry.clone();
            narrowed
        })
        .collect();
    Ok(out)
}

/// Source -> target field renames, applied in one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    pairs: Vec<(String, String)>,
}

impl FieldMapping {
    /// Build a mapping, rejecting anything that is not one-to-one.
    pub fn new<I, S, T>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let pairs: Vec<(String, String)> = pairs
            .into_iter()
            .map(|(s, t)| (canonical_field(s.as_ref()), canonical_field(t.as_ref())))
            .collect();
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for (source, target) in &pairs {
            if source.is_empty() || target.is_empty() {
                return Err(GeoflowError::Schema("field mapping has an empty name".to_string()));
            }
            if !sources.insert(source) {
                return Err(GeoflowError::Schema(format!("field '{}' is renamed twice", source)));
            }
            if !targets.insert(target) {
                return Err(GeoflowError::Schema(format!(
                    "more than one field is renamed to '{}'",
                    target
                )));
            }
        }
        Ok(Self { pairs })
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    fn target_of(&self, field: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(s, _)| s == field)
            .map(|(_, t)| t.as_str())
    }

    /// Rename fields. Every source must exist, and no target may collide with
    /// a field that keeps its name.
    pub fn apply(&self, set: &RecordSet) -> Result<RecordSet> {
        if self.pairs.is_empty() {
            return Ok(set.clone());
        }
        for (source, _) in &self.pairs {
            set.require_field(source)?;
        }
        for (_, target) in &self.pairs {
            let kept = set.has_field(target) && self.target_of(target).is_none();
            if kept {
                return Err(GeoflowError::Schema(format!(
                    "rename target '{}' already exists in {}",
                    target, set.source
                )));
            }
        }

        let schema: Vec<String> = set
            .schema
            .iter()
            .map(|f| self.target_of(f).unwrap_or(f).to_string())
            .collect();
        let records = set
            .records
            .iter()
            .map(|record| {
                let mut renamed: Record = record
                    .fields()
                    .map(|(f, v)| (self.target_of(f).unwrap_or(f).to_string(), v.clone()))
                    .collect();
                renamed.geometry = record.geometry.clone();
                renamed
            })
            .collect();
        Ok(RecordSet {
            source: set.source.clone(),
            schema,
            records,
        })
    }
}

/// Attribute selection
pub struct SelectStage;

impl Stage for SelectStage {
    fn name(&self) -> &'static str {
        "select"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        let selected = select(&session.current, &session.job.select)?;
        info!(fields = selected.schema.len(), "🧮 Selected attributes");
        let count = selected.len();
        let kept = selected.schema.len();
        session.current = selected;
        Ok(StageReport::success(self.name(), count, format!("{} fields kept", kept)))
    }
}

/// Field renames, applied after selection
pub struct RenameStage;

impl Stage for RenameStage {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        let mapping = FieldMapping::new(session.job.rename.iter().map(|(s, t)| (s, t)))?;
        if mapping.is_empty() {
            return Ok(StageReport::success(self.name(), session.current.len(), "no renames"));
        }
        let renamed = mapping.apply(&session.current)?;
        info!(renamed = mapping.pairs().len(), "✏️  Renamed fields");
        let count = renamed.len();
        session.current = renamed;
        Ok(StageReport::success(
            self.name(),
            count,
            format!("{} fields renamed", mapping.pairs().len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use geo::{Geometry, Point};

    fn sample() -> RecordSet {
        let mut set = RecordSet::new("s", vec!["AIN".into(), "SITUSZIP".into(), "NAMEA_ALF".into()]);
        let mut record: Record = [
            ("AIN", Value::Text("5601001001".into())),
            ("SITUSZIP", Value::Int(91502)),
            ("NAMEA_ALF", Value::Text("R1".into())),
        ]
        .into_iter()
        .collect();
        record.geometry = Some(Geometry::Point(Point::new(-118.3, 34.18)));
        set.records.push(record);
        set
    }

    #[test]
    fn select_keeps_order_and_geometry() {
        let out = select(&sample(), &["namea_alf".to_string(), "ain".to_string()]).unwrap();
        assert_eq!(out.schema, vec!["NAMEA_ALF", "AIN"]);
        assert!(!out.records[0].contains("SITUSZIP"));
        assert!(out.records[0].geometry.is_some());
    }

    #[test]
    fn select_unknown_field_fails() {
        assert!(matches!(
            select(&sample(), &["ZONE".to_string()]),
            Err(GeoflowError::Schema(_))
        ));
    }

    #[test]
    fn mapping_renames_fields() {
        let mapping = FieldMapping::new([("AIN", "APN"), ("SITUSZIP", "ZIP_CODE")]).unwrap();
        let out = mapping.apply(&sample()).unwrap();
        assert_eq!(out.schema, vec!["APN", "ZIP_CODE", "NAMEA_ALF"]);
        assert_eq!(out.records[0].get("ZIP_CODE"), &Value::Int(91502));
        assert!(!out.records[0].contains("AIN"));
    }

    #[test]
    fn mapping_must_be_bijective() {
        assert!(FieldMapping::new([("A", "X"), ("B", "X")]).is_err());
        assert!(FieldMapping::new([("A", "X"), ("a", "Y")]).is_err());
    }

    #[test]
    fn swap_is_allowed_but_collision_is_not() {
        let swap = FieldMapping::new([("AIN", "SITUSZIP"), ("SITUSZIP", "AIN")]).unwrap();
        let out = swap.apply(&sample()).unwrap();
        assert_eq!(out.records[0].get("AIN"), &Value::Int(91502));

        let clash = FieldMapping::new([("AIN", "NAMEA_ALF")]).unwrap();
        assert!(clash.apply(&sample()).is_err());
    }
}
