//! On-disk spatial tables.
//!
//! A spatial table is a GeoJSON `FeatureCollection` with two extra members:
//! `crs` (e.g. `"EPSG:4326"`) and `schema`, the ordered list of declared
//! fields. Plain GeoJSON without a schema can still be read; its schema is
//! inferred from the feature properties.

use crate::constants::{DEFAULT_CRS, DEFAULT_TEXT_WIDTH};
use crate::error::{GeoflowError, Result};
use crate::pipeline::CancelToken;
use crate::types::{canonical_field, Record, RecordSet, Value};
use chrono::Local;
use fs2::FileExt;
use geo::{Coord, Geometry, LineString, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Short,
    Long,
    Float,
    Double,
}

/// A declared column of a spatial table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
}

impl FieldDef {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: canonical_field(name),
            field_type,
            width: None,
        }
    }

    pub fn text(name: &str, width: u32) -> Self {
        Self {
            name: canonical_field(name),
            field_type: FieldType::Text,
            width: Some(width),
        }
    }

    /// Check a value against this column, returning the value as stored.
    pub fn coerce(&self, value: &Value) -> Result<Value> {
        let mismatch = |why: &str| {
            GeoflowError::write(format!(
                "value '{}' does not fit field {} ({:?}{}): {}",
                value,
                self.name,
                self.field_type,
                self.width.map(|w| format!(", width {}", w)).unwrap_or_default(),
                why
            ))
        };
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self.field_type {
            FieldType::Text => {
                let text = value.to_string();
                let width = self.width.unwrap_or(DEFAULT_TEXT_WIDTH) as usize;
                if text.chars().count() > width {
                    return Err(mismatch("text too long"));
                }
                Ok(Value::Text(text))
            }
            FieldType::Short | FieldType::Long => {
                let n = match value {
                    Value::Int(i) => *i,
                    other => match other.as_f64() {
                        Some(f) if f.fract() == 0.0 => f as i64,
                        _ => return Err(mismatch("not an integer")),
                    },
                };
                let fits = match self.field_type {
                    FieldType::Short => i16::try_from(n).is_ok(),
                    _ => i32::try_from(n).is_ok(),
                };
                if !fits {
                    return Err(mismatch("out of range"));
                }
                Ok(Value::Int(n))
            }
            FieldType::Float | FieldType::Double => value
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| mismatch("not numeric")),
        }
    }
}

/// Ordered field declarations of a spatial table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    pub fields: Vec<FieldDef>,
}

impl TableSchema {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self> {
        let schema = Self {
            fields: fields
                .into_iter()
                .map(|f| FieldDef {
                    name: canonical_field(&f.name),
                    ..f
                })
                .collect(),
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(GeoflowError::Schema(format!(
                    "field '{}' declared twice",
                    field.name
                )));
            }
            if field.field_type == FieldType::Text && field.width.map_or(true, |w| w == 0) {
                return Err(GeoflowError::Schema(format!(
                    "text field '{}' needs a width",
                    field.name
                )));
            }
        }
        Ok(())
    }

    /// Infer column types from the values present in a record set.
    pub fn infer(set: &RecordSet) -> Self {
        let fields = set
            .schema
            .iter()
            .map(|name| {
                let values: Vec<&Value> = set
                    .records
                    .iter()
                    .map(|r| r.get(name))
                    .filter(|v| !v.is_null())
                    .collect();
                if values.is_empty() {
                    return FieldDef::text(name, DEFAULT_TEXT_WIDTH);
                }
                if values.iter().all(|v| matches!(v, Value::Int(i) if i32::try_from(*i).is_ok())) {
                    return FieldDef::new(name, FieldType::Long);
                }
                if values.iter().all(|v| matches!(v, Value::Int(_) | Value::Float(_))) {
                    return FieldDef::new(name, FieldType::Double);
                }
                let width = values
                    .iter()
                    .map(|v| v.to_string().chars().count())
                    .max()
                    .unwrap_or(1)
                    .max(1);
                FieldDef::text(name, width as u32)
            })
            .collect();
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        let wanted = canonical_field(name);
        self.fields.iter().find(|f| f.name == wanted)
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Every field the records carry must be declared.
    pub fn check_compatible(&self, set: &RecordSet) -> Result<()> {
        let undeclared: Vec<&String> = set.schema.iter().filter(|f| self.get(f).is_none()).collect();
        if undeclared.is_empty() {
            Ok(())
        } else {
            Err(GeoflowError::write(format!(
                "fields {:?} from {} are not declared in the destination schema",
                undeclared, set.source
            )))
        }
    }

    /// Properties object for one record, checked against the declared types.
    pub fn properties(&self, record: &Record) -> Result<Map<String, Json>> {
        let mut props = Map::with_capacity(self.fields.len());
        for field in &self.fields {
            let stored = field.coerce(record.get(&field.name))?;
            props.insert(field.name.clone(), stored.to_json());
        }
        Ok(props)
    }
}

// ─── GeoJSON geometry conversion ──────────────────────────────────────

fn coord_from_json(value: &Json) -> Option<Coord<f64>> {
    let arr = value.as_array()?;
    Some(Coord {
        x: arr.first()?.as_f64()?,
        y: arr.get(1)?.as_f64()?,
    })
}

fn ring_from_json(value: &Json) -> Option<LineString<f64>> {
    let coords = value
        .as_array()?
        .iter()
        .map(coord_from_json)
        .collect::<Option<Vec<_>>>()?;
    if coords.len() < 3 {
        return None;
    }
    Some(LineString::new(coords))
}

fn polygon_from_rings(value: &Json) -> Option<Polygon<f64>> {
    let mut rings = value.as_array()?.iter().map(ring_from_json);
    let exterior = rings.next()??;
    let interiors = rings.collect::<Option<Vec<_>>>()?;
    Some(Polygon::new(exterior, interiors))
}

/// First polygon found in a GeoJSON value (Polygon, MultiPolygon,
/// GeometryCollection, Feature or FeatureCollection).
pub fn polygon_from_geojson(value: &Json) -> Option<Polygon<f64>> {
    match value.get("type")?.as_str()? {
        "Polygon" => polygon_from_rings(value.get("coordinates")?),
        "MultiPolygon" => polygon_from_rings(value.get("coordinates")?.as_array()?.first()?),
        "GeometryCollection" => value
            .get("geometries")?
            .as_array()?
            .iter()
            .find_map(polygon_from_geojson),
        "Feature" => polygon_from_geojson(value.get("geometry")?),
        "FeatureCollection" => value
            .get("features")?
            .as_array()?
            .iter()
            .find_map(polygon_from_geojson),
        _ => None,
    }
}

pub fn geometry_from_geojson(value: &Json) -> Option<Geometry<f64>> {
    match value.get("type")?.as_str()? {
        "Point" => coord_from_json(value.get("coordinates")?).map(|c| Geometry::Point(Point::from(c))),
        "Polygon" => polygon_from_rings(value.get("coordinates")?).map(Geometry::Polygon),
        "MultiPolygon" => value
            .get("coordinates")?
            .as_array()?
            .iter()
            .map(polygon_from_rings)
            .collect::<Option<Vec<_>>>()
            .map(|polys| Geometry::MultiPolygon(MultiPolygon::new(polys))),
        _ => None,
    }
}

fn ring_to_json(ring: &LineString<f64>) -> Json {
    Json::Array(ring.coords().map(|c| json!([c.x, c.y])).collect())
}

fn polygon_to_json(polygon: &Polygon<f64>) -> Json {
    let mut rings = vec![ring_to_json(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(ring_to_json));
    Json::Array(rings)
}

pub fn geometry_to_geojson(geometry: &Geometry<f64>) -> Json {
    match geometry {
        Geometry::Point(p) => json!({"type": "Point", "coordinates": [p.x(), p.y()]}),
        Geometry::Polygon(p) => json!({"type": "Polygon", "coordinates": polygon_to_json(p)}),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_to_json).collect::<Vec<_>>(),
        }),
        _ => Json::Null,
    }
}

// ─── Spatial table read / write ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SpatialTable {
    pub crs: String,
    pub schema: TableSchema,
    pub records: RecordSet,
}

impl SpatialTable {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let json: Json = serde_json::from_str(&text)?;
        let source = path.display().to_string();
        if json.get("type").and_then(Json::as_str) != Some("FeatureCollection") {
            return Err(GeoflowError::Schema(format!(
                "{} is not a feature collection",
                source
            )));
        }

        let declared: Option<TableSchema> = match json.get("schema") {
            Some(s) => Some(serde_json::from_value(s.clone())?),
            None => None,
        };
        let crs = json
            .get("crs")
            .and_then(Json::as_str)
            .unwrap_or(DEFAULT_CRS)
            .to_string();

        let features = json
            .get("features")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();

        let mut records = Vec::with_capacity(features.len());
        let mut seen_fields: Vec<String> = Vec::new();
        for feature in &features {
            let mut record = Record::new();
            if let Some(props) = feature.get("properties").and_then(Json::as_object) {
                for (name, value) in props {
                    let name = canonical_field(name);
                    if !seen_fields.contains(&name) {
                        seen_fields.push(name.clone());
                    }
                    record.insert(&name, Value::from_json(value));
                }
            }
            record.geometry = feature.get("geometry").and_then(geometry_from_geojson);
            records.push(record);
        }

        let schema_names = match &declared {
            Some(schema) => schema.names(),
            None => seen_fields,
        };
        let mut set = RecordSet::new(source, schema_names);
        set.records = records;
        let schema = match declared {
            Some(schema) => TableSchema::new(schema.fields)?,
            None => TableSchema::infer(&set),
        };
        debug!(source = %set.source, rows = set.len(), "read spatial table");
        Ok(Self {
            crs,
            schema,
            records: set,
        })
    }

    /// Count features without keeping them.
    pub fn count(path: &Path) -> Result<usize> {
        Ok(Self::read(path)?.records.len())
    }
}

/// Stream geometry-bearing records as a feature collection, checking every
/// value against the schema. Returns the number of features written.
pub fn write_features<'a, W: Write>(
    out: W,
    crs: &str,
    schema: &TableSchema,
    records: impl IntoIterator<Item = &'a Record>,
    cancel: &CancelToken,
) -> Result<usize> {
    let mut out = BufWriter::new(out);
    write!(
        out,
        "{{\"type\":\"FeatureCollection\",\"crs\":{},\"schema\":{},\"features\":[",
        serde_json::to_string(crs)?,
        serde_json::to_string(schema)?
    )?;
    let mut written = 0usize;
    for record in records {
        cancel.check()?;
        let Some(geometry) = &record.geometry else {
            continue;
        };
        let feature = json!({
            "type": "Feature",
            "geometry": geometry_to_geojson(geometry),
            "properties": schema.properties(record)?,
        });
        if written > 0 {
            out.write_all(b",")?;
        }
        out.write_all(b"\n")?;
        serde_json::to_writer(&mut out, &feature)?;
        written += 1;
    }
    out.write_all(b"\n]}\n")?;
    out.flush()?;
    Ok(written)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Write through a temp file in the destination directory, then rename over
/// the destination. Nothing is visible at `dest` unless `fill` succeeds.
pub fn atomic_write<T>(dest: &Path, fill: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
    let dir = parent_dir(dest);
    fs::create_dir_all(dir)?;
    let mut shadow = NamedTempFile::new_in(dir)?;
    let result = fill(shadow.as_file_mut())?;
    shadow.as_file().sync_all()?;
    shadow.persist(dest).map_err(|e| GeoflowError::Io(e.error))?;
    Ok(result)
}

// ─── Locking, backups, restore ────────────────────────────────────────

/// Exclusive advisory lock on `<table>.lock`, released on drop
pub struct TableLock {
    file: File,
}

impl TableLock {
    pub fn acquire(table: &Path) -> Result<Self> {
        let mut name = table.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|e| {
            GeoflowError::write(format!(
                "{} is locked by another writer ({})",
                table.display(),
                e
            ))
        })?;
        debug!(lock = %path.display(), "acquired table lock");
        Ok(Self { file })
    }
}

impl Drop for TableLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn manifest_path(backup: &Path) -> PathBuf {
    let mut name = backup.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Copy a table into `backup_dir` as `<stem>_bak_<timestamp>.geojson`, with a
/// `.sha256` manifest next to it.
pub fn backup_table(table: &Path, backup_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(backup_dir)?;
    let stem = table
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "table".to_string());
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut backup = backup_dir.join(format!("{}_bak_{}.geojson", stem, stamp));
    if backup.exists() {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        backup = backup_dir.join(format!("{}_bak_{}_{}.geojson", stem, stamp, &suffix[..8]));
    }

    let bytes = fs::read(table)?;
    fs::write(&backup, &bytes)?;
    let file_name = backup
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    fs::write(
        manifest_path(&backup),
        format!("{}  {}\n", sha256_hex(&bytes), file_name),
    )?;
    info!("💾 Backed up {} to {}", table.display(), backup.display());
    Ok(backup)
}

/// Check a backup against its manifest.
pub fn verify_backup(backup: &Path) -> Result<()> {
    let manifest = fs::read_to_string(manifest_path(backup)).map_err(|e| {
        GeoflowError::write(format!("no manifest for backup {}: {}", backup.display(), e))
    })?;
    let expected = manifest.split_whitespace().next().unwrap_or_default();
    let actual = sha256_hex(&fs::read(backup)?);
    if expected != actual {
        return Err(GeoflowError::write(format!(
            "backup {} does not match its manifest checksum",
            backup.display()
        )));
    }
    Ok(())
}

/// Put a verified backup back in place of the destination table.
pub fn restore_backup(backup: &Path, dest: &Path) -> Result<usize> {
    verify_backup(backup)?;
    // a readable table is required before anything is replaced
    let rows = SpatialTable::count(backup)?;
    let _lock = TableLock::acquire(dest)?;
    let bytes = fs::read(backup)?;
    atomic_write(dest, |file| {
        file.write_all(&bytes)?;
        Ok(())
    })?;
    info!("♻️  Restored {} rows into {} from {}", rows, dest.display(), backup.display());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn point_record(name: &str, x: f64, y: f64) -> Record {
        let mut r: Record = [("NAME", Value::Text(name.to_string())), ("VALUE", Value::Int(3))]
            .into_iter()
            .collect();
        r.geometry = Some(Geometry::Point(Point::new(x, y)));
        r
    }

    #[test]
    fn coerce_checks_types_and_widths() {
        let pool = FieldDef::text("POOL", 3);
        assert_eq!(pool.coerce(&Value::Text("Yes".into())).unwrap(), Value::Text("Yes".into()));
        assert!(pool.coerce(&Value::Text("Maybe".into())).is_err());

        let beds = FieldDef::new("TOTALBEDS", FieldType::Short);
        assert_eq!(beds.coerce(&Value::Float(4.0)).unwrap(), Value::Int(4));
        assert!(beds.coerce(&Value::Int(70_000)).is_err());
        assert!(beds.coerce(&Value::Text("four".into())).is_err());
        assert_eq!(beds.coerce(&Value::Null).unwrap(), Value::Null);

        let sqft = FieldDef::new("RESQFT", FieldType::Double);
        assert_eq!(sqft.coerce(&Value::Int(1200)).unwrap(), Value::Float(1200.0));
    }

    #[test]
    fn schema_rejects_text_without_width() {
        let err = TableSchema::new(vec![FieldDef::new("NAME", FieldType::Text)]).unwrap_err();
        assert!(matches!(err, GeoflowError::Schema(_)));
    }

    #[test]
    fn inferred_schema_types() {
        let mut set = RecordSet::new("t", vec!["NAME".into(), "VALUE".into(), "EMPTY".into()]);
        set.records.push(point_record("Burbank", 0.0, 0.0));
        let schema = TableSchema::infer(&set);
        assert_eq!(schema.fields[0], FieldDef::text("NAME", 7));
        assert_eq!(schema.fields[1], FieldDef::new("VALUE", FieldType::Long));
        assert_eq!(schema.fields[2], FieldDef::text("EMPTY", DEFAULT_TEXT_WIDTH));
    }

    #[test]
    fn written_table_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.geojson");
        let schema = TableSchema::new(vec![
            FieldDef::text("NAME", 20),
            FieldDef::new("VALUE", FieldType::Long),
        ])
        .unwrap();
        let records = vec![point_record("a", -118.3, 34.2), Record::new(), point_record("b", 1.0, 2.0)];

        let written = atomic_write(&path, |f| {
            write_features(f, "EPSG:4326", &schema, &records, &CancelToken::new())
        })
        .unwrap();
        assert_eq!(written, 2);

        let table = SpatialTable::read(&path).unwrap();
        assert_eq!(table.crs, "EPSG:4326");
        assert_eq!(table.schema, schema);
        assert_eq!(table.records.len(), 2);
        assert_eq!(table.records.records[1].point(), Some(Point::new(1.0, 2.0)));
        assert_eq!(table.records.records[0].get("VALUE"), &Value::Int(3));
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("parcels.geojson");
        let schema = TableSchema::new(vec![FieldDef::text("NAME", 10), FieldDef::new("VALUE", FieldType::Long)]).unwrap();
        let records = vec![point_record("x", 0.0, 0.0)];
        atomic_write(&dest, |f| write_features(f, DEFAULT_CRS, &schema, &records, &CancelToken::new())).unwrap();

        let backup = backup_table(&dest, &dir.path().join("bak")).unwrap();
        verify_backup(&backup).unwrap();

        fs::write(&dest, "{\"type\":\"FeatureCollection\",\"features\":[]}").unwrap();
        assert_eq!(SpatialTable::count(&dest).unwrap(), 0);
        assert_eq!(restore_backup(&backup, &dest).unwrap(), 1);
        assert_eq!(SpatialTable::count(&dest).unwrap(), 1);
    }

    #[test]
    fn tampered_backup_is_refused() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("t.geojson");
        fs::write(&dest, "{\"type\":\"FeatureCollection\",\"features\":[]}").unwrap();
        let backup = backup_table(&dest, dir.path()).unwrap();
        fs::write(&backup, "{}").unwrap();
        assert!(verify_backup(&backup).is_err());
    }

    #[test]
    fn second_lock_on_same_table_fails() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("t.geojson");
        let first = TableLock::acquire(&table).unwrap();
        assert!(TableLock::acquire(&table).is_err());
        drop(first);
        assert!(TableLock::acquire(&table).is_ok());
    }
}
