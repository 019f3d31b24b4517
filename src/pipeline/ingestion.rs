use crate::constants::INPUT_EXTENSIONS;
use crate::error::{GeoflowError, Result};
use crate::pipeline::{Session, Stage, StageReport};
use crate::storage::SpatialTable;
use crate::types::{canonical_field, Record, RecordSet, Value};
use csv::{ReaderBuilder, Trim};
use metrics::counter;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

/// Field separator for delimited text input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum Delimiter {
    Colon,
    Comma,
    Pipe,
    Semicolon,
    Space,
    Tab,
}

impl Delimiter {
    pub const ALL: [Delimiter; 6] = [
        Delimiter::Colon,
        Delimiter::Comma,
        Delimiter::Pipe,
        Delimiter::Semicolon,
        Delimiter::Space,
        Delimiter::Tab,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Colon => b':',
            Delimiter::Comma => b',',
            Delimiter::Pipe => b'|',
            Delimiter::Semicolon => b';',
            Delimiter::Space => b' ',
            Delimiter::Tab => b'\t',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Delimiter::Colon => "colon",
            Delimiter::Comma => "comma",
            Delimiter::Pipe => "pipe",
            Delimiter::Semicolon => "semicolon",
            Delimiter::Space => "space",
            Delimiter::Tab => "tab",
        }
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Delimiter::Comma
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Delimiter {
    type Err = GeoflowError;

    fn from_str(s: &str) -> Result<Self> {
        // the literal character is accepted as well as the name
        match s {
            ":" => return Ok(Delimiter::Colon),
            "," => return Ok(Delimiter::Comma),
            "|" => return Ok(Delimiter::Pipe),
            ";" => return Ok(Delimiter::Semicolon),
            " " => return Ok(Delimiter::Space),
            "\t" | "\\t" => return Ok(Delimiter::Tab),
            _ => {}
        }
        match s.trim().to_lowercase().as_str() {
            "colon" => Ok(Delimiter::Colon),
            "comma" => Ok(Delimiter::Comma),
            "pipe" => Ok(Delimiter::Pipe),
            "semicolon" | "semi-colon" => Ok(Delimiter::Semicolon),
            "space" => Ok(Delimiter::Space),
            "tab" => Ok(Delimiter::Tab),
            other => Err(GeoflowError::Config(format!(
                "unknown delimiter '{}' (expected one of colon, comma, pipe, semicolon, space, tab)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for Delimiter {
    type Error = GeoflowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Canonical field names of a header row; rejects blank and repeated names.
fn header_fields(headers: &csv::StringRecord, source: &str) -> Result<Vec<String>> {
    let schema: Vec<String> = headers.iter().map(canonical_field).collect();
    if schema.iter().all(|f| f.is_empty()) {
        return Err(GeoflowError::Schema(format!("{} has an empty header", source)));
    }
    let mut seen = BTreeSet::new();
    for field in &schema {
        if !seen.insert(field) {
            return Err(GeoflowError::Schema(format!(
                "field '{}' appears more than once in header of {}",
                field, source
            )));
        }
    }
    Ok(schema)
}

/// Field names across the ingested sources, for populating selection lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldCatalog {
    pub per_source: Vec<Vec<String>>,
    pub union: BTreeSet<String>,
}

impl FieldCatalog {
    pub fn from_sources(sources: &[RecordSet]) -> Self {
        let per_source: Vec<Vec<String>> = sources.iter().map(|s| s.schema.clone()).collect();
        let union = per_source.iter().flatten().cloned().collect();
        Self { per_source, union }
    }
}

/// Reads delimited text files (or spatial tables) into record sets
#[derive(Debug, Clone)]
pub struct Ingestor {
    delimiter: Delimiter,
    required: Vec<String>,
}

impl Ingestor {
    pub fn new(delimiter: Delimiter) -> Self {
        Self {
            delimiter,
            required: Vec::new(),
        }
    }

    /// Add a field that must be present in the header of each source read.
    pub fn require(mut self, field: impl AsRef<str>) -> Self {
        let field = canonical_field(field.as_ref());
        if !field.is_empty() && !self.required.contains(&field) {
            self.required.push(field);
        }
        self
    }

    fn check_required(&self, set: &RecordSet) -> Result<()> {
        for field in &self.required {
            if !set.has_field(field) {
                return Err(GeoflowError::Schema(format!(
                    "required field '{}' missing from header of {}",
                    field, set.source
                )));
            }
        }
        Ok(())
    }

    /// Check required fields against several sources together: each field
    /// has to appear in at least one of them.
    pub fn check_required_any(&self, sources: &[RecordSet]) -> Result<()> {
        for field in &self.required {
            if !sources.iter().any(|s| s.has_field(field)) {
                let names: Vec<&str> = sources.iter().map(|s| s.source.as_str()).collect();
                return Err(GeoflowError::Schema(format!(
                    "required field '{}' missing from every input ({})",
                    field,
                    names.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// The same reader settings without any required fields.
    fn unchecked(&self) -> Self {
        Self::new(self.delimiter)
    }

    #[instrument(skip(self), fields(delimiter = %self.delimiter))]
    pub fn read_file(&self, path: &Path) -> Result<RecordSet> {
        let source = path.display().to_string();
        let mut reader = ReaderBuilder::new()
            .delimiter(self.delimiter.as_byte())
            .has_headers(true)
            .flexible(true)
            .trim(Trim::All)
            .from_path(path)?;

        let schema = header_fields(reader.headers()?, &source)?;

        let mut set = RecordSet::new(source, schema);
        self.check_required(&set)?;

        for row in reader.records() {
            let row = row?;
            if row.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            if row.len() > set.schema.len() {
                warn!(
                    source = %set.source,
                    line = row.position().map(|p| p.line()).unwrap_or_default(),
                    "row has more cells than the header; extra cells ignored"
                );
            }
            let mut record = Record::new();
            for (i, field) in set.schema.iter().enumerate() {
                let value = row.get(i).map(Value::infer).unwrap_or(Value::Null);
                record.insert(field, value);
            }
            set.records.push(record);
        }

        debug!(source = %set.source, rows = set.len(), "read delimited file");
        counter!("geoflow_records_read_total").increment(set.len() as u64);
        Ok(set)
    }

    pub fn read_files(&self, paths: &[PathBuf]) -> Result<(Vec<RecordSet>, FieldCatalog)> {
        let sources = paths
            .iter()
            .map(|p| self.read_file(p))
            .collect::<Result<Vec<_>>>()?;
        let catalog = FieldCatalog::from_sources(&sources);
        Ok((sources, catalog))
    }

    /// Read an existing spatial table as a source; geometry is carried over.
    pub fn read_table(&self, path: &Path) -> Result<RecordSet> {
        let table = SpatialTable::read(path)?;
        let set = table.records;
        self.check_required(&set)?;
        counter!("geoflow_records_read_total").increment(set.len() as u64);
        Ok(set)
    }
}

/// List the `.txt`/`.csv` files of a directory in name order.
pub fn list_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| INPUT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(GeoflowError::Config(format!(
            "no .txt or .csv files found in {}",
            dir.display()
        )));
    }
    Ok(files)
}

/// Stack several sources into one; the schema is the ordered union.
pub fn concatenate(sources: Vec<RecordSet>, source: impl Into<String>) -> RecordSet {
    let mut combined = RecordSet::new(source, Vec::new());
    for set in &sources {
        for field in &set.schema {
            combined.push_field(field);
        }
    }
    for set in sources {
        combined.records.extend(set.records);
    }
    combined
}

/// First stage: reads the session's inputs and populates the field catalog.
pub struct IngestStage;

impl Stage for IngestStage {
    fn name(&self) -> &'static str {
        "ingest"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        let input = &session.job.input;
        let mut ingestor = Ingestor::new(input.delimiter);
        if let Some(f) = &input.id_field {
            ingestor = ingestor.require(f);
        }
        if let Some(f) = &input.value_field {
            ingestor = ingestor.require(f);
        }

        // joined inputs only need the key on both sides; the other required
        // fields may come from either file
        let joined = session.job.merge.is_some() && session.inputs.len() > 1;
        let sources = match &input.table {
            Some(table) => vec![ingestor.read_table(table)?],
            None if joined => {
                let sources = ingestor.unchecked().read_files(&session.inputs)?.0;
                ingestor.check_required_any(&sources)?;
                sources
            }
            None => ingestor.read_files(&session.inputs)?.0,
        };
        session.catalog = FieldCatalog::from_sources(&sources);

        let total: usize = sources.iter().map(RecordSet::len).sum();
        info!(
            "📥 Ingested {} records from {} source(s)",
            total,
            sources.len()
        );

        // without a join key, several inputs are simply stacked
        session.sources = if sources.len() > 1 && session.job.merge.is_none() {
            let label = format!("{} combined files", sources.len());
            vec![concatenate(sources, label)]
        } else {
            sources
        };
        session.records_read = total;

        Ok(StageReport::success(
            self.name(),
            total,
            format!("read {} records", total),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn header_parses_for_every_delimiter() {
        let dir = tempdir().unwrap();
        for delimiter in Delimiter::ALL {
            let sep = delimiter.as_byte() as char;
            let path = dir.path().join(format!("{}.txt", delimiter));
            fs::write(&path, format!("name{sep}Value{sep}lat{sep}LON\nA{sep}1{sep}2{sep}3\n")).unwrap();

            let set = Ingestor::new(delimiter).read_file(&path).unwrap();
            assert_eq!(set.schema, vec!["NAME", "VALUE", "LAT", "LON"], "delimiter {}", delimiter);
            assert_eq!(set.records[0].get("lon"), &Value::Int(3), "delimiter {}", delimiter);
        }
    }

    #[test]
    fn repeated_header_field_is_schema_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dup.csv");
        fs::write(&path, "NAME,name,VALUE\nA,B,1\n").unwrap();
        let err = Ingestor::new(Delimiter::Comma).read_file(&path).unwrap_err();
        assert!(matches!(err, GeoflowError::Schema(msg) if msg.contains("more than once")));
    }

    #[test]
    fn delimiter_names_and_literals() {
        assert_eq!("Semi-colon".parse::<Delimiter>().unwrap(), Delimiter::Semicolon);
        assert_eq!("TAB".parse::<Delimiter>().unwrap(), Delimiter::Tab);
        assert_eq!("|".parse::<Delimiter>().unwrap(), Delimiter::Pipe);
        assert!("hash".parse::<Delimiter>().is_err());
    }

    #[test]
    fn missing_required_field_is_schema_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.csv");
        fs::write(&path, "NAME,VALUE\nA,1\n").unwrap();

        let err = Ingestor::new(Delimiter::Comma)
            .require("name")
            .require("elevation")
            .read_file(&path)
            .unwrap_err();
        match err {
            GeoflowError::Schema(msg) => assert!(msg.contains("ELEVATION")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reads_rows_with_case_insensitive_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gps.txt");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "Name|Value|Latitude|Longitude").unwrap();
        writeln!(f, "well-1|12.5|34.18|-118.31").unwrap();
        writeln!(f, "well-2|9").unwrap();

        let set = Ingestor::new(Delimiter::Pipe)
            .require("name")
            .require("VALUE")
            .read_file(&path)
            .unwrap();
        assert_eq!(set.schema, vec!["NAME", "VALUE", "LATITUDE", "LONGITUDE"]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.records[0].get("value"), &Value::Float(12.5));
        assert!(set.records[1].get("latitude").is_null());
    }

    #[test]
    fn required_field_may_come_from_any_source() {
        let values = RecordSet::new("values.csv", vec!["NAME".into(), "VALUE".into()]);
        let regions = RecordSet::new("regions.csv", vec!["NAME".into(), "REGION".into()]);
        let ingestor = Ingestor::new(Delimiter::Comma).require("value").require("region");
        ingestor.check_required_any(&[values.clone(), regions.clone()]).unwrap();

        let err = ingestor
            .require("elevation")
            .check_required_any(&[values, regions])
            .unwrap_err();
        match err {
            GeoflowError::Schema(msg) => {
                assert!(msg.contains("ELEVATION"));
                assert!(msg.contains("values.csv, regions.csv"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn catalog_union_is_a_set() {
        let a = RecordSet::new("a", vec!["NAME".into(), "VALUE".into()]);
        let b = RecordSet::new("b", vec!["NAME".into(), "REGION".into()]);
        let catalog = FieldCatalog::from_sources(&[a, b]);
        assert_eq!(catalog.per_source.len(), 2);
        assert_eq!(
            catalog.union.into_iter().collect::<Vec<_>>(),
            vec!["NAME", "REGION", "VALUE"]
        );
    }

    #[test]
    fn directory_listing_filters_extensions() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.csv"), "A\n1\n").unwrap();
        fs::write(dir.path().join("a.TXT"), "A\n2\n").unwrap();
        fs::write(dir.path().join("notes.md"), "ignore").unwrap();

        let files = list_directory(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.TXT", "b.csv"]);
    }

    #[test]
    fn concatenate_unions_schemas() {
        let mut a = RecordSet::new("a", vec!["NAME".into()]);
        a.records.push([("NAME", Value::Text("x".into()))].into_iter().collect());
        let mut b = RecordSet::new("b", vec!["NAME".into(), "VALUE".into()]);
        b.records.push([("NAME", Value::Text("y".into())), ("VALUE", Value::Int(1))].into_iter().collect());

        let combined = concatenate(vec![a, b], "both");
        assert_eq!(combined.schema, vec!["NAME", "VALUE"]);
        assert_eq!(combined.len(), 2);
    }
}
