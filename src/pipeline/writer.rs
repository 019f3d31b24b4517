use crate::config::OutputConfig;
use crate::error::{GeoflowError, Result};
use crate::pipeline::{CancelToken, Session, Stage, StageReport};
use crate::storage::{
    atomic_write, backup_table, write_features, SpatialTable, TableLock, TableSchema,
};
use crate::types::RecordSet;
use metrics::counter;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// How the spatial output is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// New table with a declared or inferred schema
    #[default]
    CreateNew,
    /// Swap the rows of an existing table, keeping its schema
    ReplaceInPlace,
}

/// What the write stage produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub path: Option<PathBuf>,
    pub written: usize,
    pub tabular: Option<PathBuf>,
    pub tabular_rows: usize,
    pub backup: Option<PathBuf>,
}

/// Output schema: the declared one, or one inferred from the records.
pub fn output_schema(declared: &[crate::storage::FieldDef], set: &RecordSet) -> Result<TableSchema> {
    if declared.is_empty() {
        Ok(TableSchema::infer(set))
    } else {
        TableSchema::new(declared.to_vec())
    }
}

/// Write geometry-bearing records to a new table.
#[instrument(skip(set, schema, cancel), fields(records = set.len()))]
pub fn create_new(
    set: &RecordSet,
    dest: &Path,
    crs: &str,
    schema: &TableSchema,
    overwrite: bool,
    cancel: &CancelToken,
) -> Result<usize> {
    if dest.exists() && !overwrite {
        return Err(GeoflowError::write(format!(
            "{} already exists (set overwrite = true to replace it)",
            dest.display()
        )));
    }
    schema.check_compatible(set)?;
    atomic_write(dest, |file| write_features(file, crs, schema, &set.records, cancel))
}

/// Result of a replace-in-place write
#[derive(Debug, Clone, PartialEq)]
pub struct Replaced {
    pub written: usize,
    pub previous_rows: usize,
    pub backup: PathBuf,
}

/// Replace every row of an existing table.
///
/// The table is locked, backed up, and the new rows are streamed into a
/// shadow file that is renamed over the table only once every record has
/// been written. Any failure leaves the table as it was; the error names the
/// backup.
#[instrument(skip(set, cancel), fields(records = set.len()))]
pub fn replace_in_place(
    set: &RecordSet,
    dest: &Path,
    backup_dir: &Path,
    cancel: &CancelToken,
) -> Result<Replaced> {
    if !dest.exists() {
        return Err(GeoflowError::write(format!(
            "{} does not exist; use the create_new strategy",
            dest.display()
        )));
    }
    let _lock = TableLock::acquire(dest)?;
    let existing = SpatialTable::read(dest)?;
    let previous_rows = existing.records.len();
    let backup = backup_table(dest, backup_dir)?;

    let written = existing
        .schema
        .check_compatible(set)
        .and_then(|_| {
            atomic_write(dest, |file| {
                write_features(file, &existing.crs, &existing.schema, &set.records, cancel)
            })
        })
        .map_err(|e| e.with_backup(backup.clone()))?;

    info!(
        "🔁 Replaced {} rows with {} in {}",
        previous_rows,
        written,
        dest.display()
    );
    Ok(Replaced {
        written,
        previous_rows,
        backup,
    })
}

/// Every record, geometry or not, as comma-delimited text.
pub fn write_tabular(set: &RecordSet, columns: &[String], dest: &Path) -> Result<usize> {
    atomic_write(dest, |file| {
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(columns)?;
        for record in &set.records {
            writer.write_record(columns.iter().map(|c| record.get(c).to_string()))?;
        }
        writer.flush()?;
        Ok(set.len())
    })
}

/// `dir/name` becomes `dir/<prefix>_name`.
pub fn prefixed(path: &Path, prefix: Option<&str>) -> PathBuf {
    match (prefix, path.file_name()) {
        (Some(prefix), Some(name)) => {
            path.with_file_name(format!("{}_{}", prefix, name.to_string_lossy()))
        }
        _ => path.to_path_buf(),
    }
}

fn default_backup_dir(dest: &Path) -> PathBuf {
    match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.join("backups"),
        _ => PathBuf::from("backups"),
    }
}

fn write_outputs(
    set: &RecordSet,
    output: &OutputConfig,
    prefix: Option<&str>,
    dry_run: bool,
    cancel: &CancelToken,
) -> Result<WriteOutcome> {
    let mut outcome = WriteOutcome::default();

    if let Some(path) = &output.path {
        let dest = prefixed(path, prefix);
        match output.strategy {
            _ if dry_run => {
                let schema = match output.strategy {
                    WriteStrategy::CreateNew => output_schema(&output.schema, set)?,
                    WriteStrategy::ReplaceInPlace => SpatialTable::read(&dest)?.schema,
                };
                schema.check_compatible(set)?;
                outcome.written = write_features(io::sink(), &output.crs, &schema, &set.records, cancel)?;
                info!("🧾 Dry run: {} features would be written to {}", outcome.written, dest.display());
            }
            WriteStrategy::CreateNew => {
                let schema = output_schema(&output.schema, set)?;
                outcome.written = create_new(set, &dest, &output.crs, &schema, output.overwrite, cancel)?;
                info!("💾 Wrote {} features to {}", outcome.written, dest.display());
            }
            WriteStrategy::ReplaceInPlace => {
                let backup_dir = output
                    .backup_dir
                    .clone()
                    .unwrap_or_else(|| default_backup_dir(&dest));
                let replaced = replace_in_place(set, &dest, &backup_dir, cancel)?;
                outcome.written = replaced.written;
                outcome.backup = Some(replaced.backup);
            }
        }
        outcome.path = Some(dest);
    }

    if let Some(tabular) = &output.tabular {
        let dest = prefixed(tabular, prefix);
        let columns = match (&outcome.path, output.strategy) {
            (Some(table), WriteStrategy::ReplaceInPlace) if !dry_run => {
                SpatialTable::read(table)?.schema.names()
            }
            _ => output_schema(&output.schema, set)?.names(),
        };
        if dry_run {
            outcome.tabular_rows = set.len();
        } else {
            outcome.tabular_rows = write_tabular(set, &columns, &dest)?;
            info!("📄 Wrote {} rows to {}", outcome.tabular_rows, dest.display());
        }
        outcome.tabular = Some(dest);
    }
    Ok(outcome)
}

/// Last stage: spatial output plus the optional tabular copy.
pub struct WriteStage;

impl Stage for WriteStage {
    fn name(&self) -> &'static str {
        "write"
    }

    fn run(&self, session: &mut Session<'_>) -> Result<StageReport> {
        session.cancel.check()?;
        let set = &session.current;
        let without_geometry = set.len() - set.geometry_count();
        if session.job.output.path.is_some() && without_geometry > 0 {
            warn!(
                "{} records have no geometry and are left out of the spatial output",
                without_geometry
            );
        }

        let outcome = write_outputs(
            set,
            &session.job.output,
            session.output_prefix.as_deref(),
            session.dry_run,
            &session.cancel,
        )?;
        if !session.dry_run {
            counter!("geoflow_records_written_total").increment(outcome.written as u64);
        }

        let written = outcome.written;
        session.outcome = outcome;
        Ok(StageReport::with_skipped(
            self.name(),
            written,
            without_geometry,
            format!("{} features written", written),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FieldDef, FieldType};
    use crate::types::{Record, Value};
    use geo::{Geometry, Point};
    use std::fs;
    use tempfile::tempdir;

    fn points(n: usize) -> RecordSet {
        let mut set = RecordSet::new("points", vec!["NAME".into(), "VALUE".into()]);
        for i in 0..n {
            let record: Record = [("NAME", Value::Text(format!("p{}", i))), ("VALUE", Value::Int(i as i64))]
                .into_iter()
                .collect();
            set.records
                .push(record.with_geometry(Some(Geometry::Point(Point::new(i as f64 * 0.01, 1.0)))));
        }
        set
    }

    #[test]
    fn create_new_refuses_to_clobber() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.geojson");
        let set = points(3);
        let schema = TableSchema::infer(&set);

        assert_eq!(create_new(&set, &dest, "EPSG:4326", &schema, false, &CancelToken::new()).unwrap(), 3);
        let err = create_new(&set, &dest, "EPSG:4326", &schema, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, GeoflowError::Write { .. }));
        assert_eq!(create_new(&set, &dest, "EPSG:4326", &schema, true, &CancelToken::new()).unwrap(), 3);
    }

    #[test]
    fn undeclared_field_is_write_error() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.geojson");
        let schema = TableSchema::new(vec![FieldDef::text("NAME", 10)]).unwrap();
        let err = create_new(&points(1), &dest, "EPSG:4326", &schema, false, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, GeoflowError::Write { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn replace_swaps_rows_and_keeps_a_backup() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("parcels.geojson");
        let schema = TableSchema::new(vec![
            FieldDef::text("NAME", 10),
            FieldDef::new("VALUE", FieldType::Long),
        ])
        .unwrap();
        create_new(&points(5), &dest, "EPSG:2229", &schema, false, &CancelToken::new()).unwrap();

        let replaced = replace_in_place(&points(2), &dest, &dir.path().join("bak"), &CancelToken::new()).unwrap();
        assert_eq!(replaced.previous_rows, 5);
        assert_eq!(replaced.written, 2);
        assert!(replaced.backup.exists());

        let table = SpatialTable::read(&dest).unwrap();
        assert_eq!(table.records.len(), 2);
        assert_eq!(table.crs, "EPSG:2229");
        assert_eq!(SpatialTable::count(&replaced.backup).unwrap(), 5);
    }

    #[test]
    fn cancelled_replace_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("parcels.geojson");
        let schema = TableSchema::infer(&points(4));
        create_new(&points(4), &dest, "EPSG:4326", &schema, false, &CancelToken::new()).unwrap();
        let before = fs::read(&dest).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = replace_in_place(&points(4), &dest, dir.path(), &cancel).unwrap_err();
        assert!(matches!(err, GeoflowError::Cancelled));
        assert_eq!(fs::read(&dest).unwrap(), before);
    }

    #[test]
    fn tabular_output_includes_records_without_geometry() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("rows.csv");
        let mut set = points(2);
        set.records.push([("NAME", Value::Text("nowhere".into()))].into_iter().collect());

        let rows = write_tabular(&set, &set.schema, &dest).unwrap();
        assert_eq!(rows, 3);
        let text = fs::read_to_string(&dest).unwrap();
        assert!(text.starts_with("NAME,VALUE\n"));
        assert!(text.contains("nowhere,"));
    }

    #[test]
    fn prefix_goes_on_the_file_name() {
        assert_eq!(
            prefixed(Path::new("out/points.geojson"), Some("site1")),
            PathBuf::from("out/site1_points.geojson")
        );
        assert_eq!(prefixed(Path::new("points.geojson"), None), PathBuf::from("points.geojson"));
    }
}
