// ETL pipeline: ingest, merge, select, rename, geometry, spatial join, derive, write

pub mod enrich;
pub mod geometry;
pub mod ingestion;
pub mod merge;
pub mod select;
pub mod spatial_join;
pub mod writer;

use crate::config::{DirectoryMode, JobConfig};
use crate::error::{GeoflowError, Result};
use crate::services::Services;
use crate::types::RecordSet;
use metrics::{counter, histogram};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

pub use enrich::DeriveStage;
pub use geometry::GeometryStage;
pub use ingestion::{FieldCatalog, IngestStage};
pub use merge::MergeStage;
pub use select::{RenameStage, SelectStage};
pub use spatial_join::SpatialJoinStage;
pub use writer::{WriteOutcome, WriteStage};

/// Common trait for all pipeline stages
pub trait Stage {
    fn name(&self) -> &'static str;

    /// Run this stage against the session, replacing `session.current`
    fn run(&self, session: &mut Session<'_>) -> Result<StageReport>;
}

/// Result of running one stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: &'static str,
    pub success: bool,
    pub processed: usize,
    pub skipped: usize,
    pub message: String,
    pub elapsed: Duration,
}

impl StageReport {
    pub fn success(stage: &'static str, processed: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            success: true,
            processed,
            skipped: 0,
            message: message.into(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_skipped(
        stage: &'static str,
        processed: usize,
        skipped: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            skipped,
            ..Self::success(stage, processed, message)
        }
    }
}

/// Cooperative cancellation flag, checked between records and between stages
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GeoflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The underlying flag, for handing to a signal handler.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Why a record lost its geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    GeometryParse,
    LookupMiss,
    ServiceError,
}

impl SkipReason {
    pub fn of(err: &GeoflowError) -> Option<Self> {
        match err {
            GeoflowError::GeometryParse(_) => Some(SkipReason::GeometryParse),
            GeoflowError::LookupMiss(_) => Some(SkipReason::LookupMiss),
            GeoflowError::Service(_) => Some(SkipReason::ServiceError),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::GeometryParse => "geometry_parse",
            SkipReason::LookupMiss => "lookup_miss",
            SkipReason::ServiceError => "service_error",
        }
    }

    /// Rebuild the soft error for a cached outcome.
    pub fn to_error(self, message: String) -> GeoflowError {
        match self {
            SkipReason::GeometryParse => GeoflowError::GeometryParse(message),
            SkipReason::LookupMiss => GeoflowError::LookupMiss(message),
            SkipReason::ServiceError => GeoflowError::Service(message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub geometry_parse: usize,
    pub lookup_miss: usize,
    pub service_error: usize,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::GeometryParse => self.geometry_parse += 1,
            SkipReason::LookupMiss => self.lookup_miss += 1,
            SkipReason::ServiceError => self.service_error += 1,
        }
        counter!("geoflow_records_skipped_total", "reason" => reason.as_str()).increment(1);
    }

    pub fn total(&self) -> usize {
        self.geometry_parse + self.lookup_miss + self.service_error
    }

    fn add(&mut self, other: &SkipCounts) {
        self.geometry_parse += other.geometry_parse;
        self.lookup_miss += other.lookup_miss;
        self.service_error += other.service_error;
    }
}

/// Everything a run carries from stage to stage
pub struct Session<'a> {
    pub job: &'a JobConfig,
    pub services: &'a Services,
    pub cancel: CancelToken,
    pub dry_run: bool,
    /// Delimited files for this batch (empty for spatial-table input)
    pub inputs: Vec<PathBuf>,
    /// Prefix for output file names in per-file mode
    pub output_prefix: Option<String>,
    pub catalog: FieldCatalog,
    pub sources: Vec<RecordSet>,
    pub current: RecordSet,
    pub records_read: usize,
    pub records_merged: usize,
    pub skipped: SkipCounts,
    pub outcome: WriteOutcome,
    pub reports: Vec<StageReport>,
}

impl<'a> Session<'a> {
    pub fn new(job: &'a JobConfig, services: &'a Services, cancel: CancelToken) -> Self {
        Self {
            job,
            services,
            cancel,
            dry_run: false,
            inputs: Vec::new(),
            output_prefix: None,
            catalog: FieldCatalog::default(),
            sources: Vec::new(),
            current: RecordSet::default(),
            records_read: 0,
            records_merged: 0,
            skipped: SkipCounts::default(),
            outcome: WriteOutcome::default(),
            reports: Vec::new(),
        }
    }
}

/// Totals for a whole run, across batches
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub job: String,
    pub dry_run: bool,
    pub records_read: usize,
    pub records_merged: usize,
    pub written: usize,
    pub skipped: SkipCounts,
    pub tabular_rows: usize,
    pub outputs: Vec<PathBuf>,
    pub tabular: Vec<PathBuf>,
    pub backups: Vec<PathBuf>,
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

impl RunReport {
    fn new(job: &str, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job: job.to_string(),
            dry_run,
            records_read: 0,
            records_merged: 0,
            written: 0,
            skipped: SkipCounts::default(),
            tabular_rows: 0,
            outputs: Vec::new(),
            tabular: Vec::new(),
            backups: Vec::new(),
            stages: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    fn absorb(&mut self, session: Session<'_>) {
        self.records_read += session.records_read;
        self.records_merged += session.records_merged;
        self.skipped.add(&session.skipped);
        self.written += session.outcome.written;
        self.tabular_rows += session.outcome.tabular_rows;
        self.outputs.extend(session.outcome.path);
        self.tabular.extend(session.outcome.tabular);
        self.backups.extend(session.outcome.backup);
        self.stages.extend(session.reports);
    }
}

/// One pass of the stage list: the files it reads and its output prefix
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<PathBuf>,
    pub prefix: Option<String>,
}

/// Expand the job's input section into batches.
pub fn plan_batches(job: &JobConfig) -> Result<Vec<Batch>> {
    let input = &job.input;
    if input.table.is_some() {
        return Ok(vec![Batch {
            inputs: Vec::new(),
            prefix: None,
        }]);
    }
    if let Some(dir) = &input.directory {
        let files = ingestion::list_directory(dir)?;
        return Ok(match input.directory_mode {
            DirectoryMode::Combined => vec![Batch {
                inputs: files,
                prefix: None,
            }],
            DirectoryMode::PerFile => files
                .into_iter()
                .map(|f| {
                    let prefix = f.file_stem().map(|s| s.to_string_lossy().to_string());
                    Batch {
                        inputs: vec![f],
                        prefix,
                    }
                })
                .collect(),
        });
    }
    Ok(vec![Batch {
        inputs: input.files.clone(),
        prefix: None,
    }])
}

/// Runs the fixed stage list over every batch of a job
pub struct Pipeline<'a> {
    job: &'a JobConfig,
    services: &'a Services,
    cancel: CancelToken,
    dry_run: bool,
    stages: Vec<Box<dyn Stage>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(job: &'a JobConfig, services: &'a Services, cancel: CancelToken) -> Self {
        Self {
            job,
            services,
            cancel,
            dry_run: false,
            stages: vec![
                Box::new(IngestStage),
                Box::new(MergeStage),
                Box::new(SelectStage),
                Box::new(RenameStage),
                Box::new(GeometryStage),
                Box::new(SpatialJoinStage),
                Box::new(DeriveStage),
                Box::new(WriteStage),
            ],
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let mut report = RunReport::new(&self.job.name, self.dry_run);
        let span = info_span!("job", job = %self.job.name, run_id = %report.run_id);
        let _enter = span.enter();

        let batches = plan_batches(self.job)?;
        info!("🚀 Starting job '{}' ({} batch(es))", self.job.name, batches.len());

        for batch in batches {
            let mut session = Session::new(self.job, self.services, self.cancel.clone());
            session.dry_run = self.dry_run;
            session.inputs = batch.inputs;
            session.output_prefix = batch.prefix;
            self.run_batch(&mut session)?;
            report.absorb(session);
        }

        report.elapsed = started.elapsed();
        info!(
            read = report.records_read,
            written = report.written,
            skipped = report.skipped.total(),
            "✅ Job '{}' finished in {:.2?}",
            self.job.name,
            report.elapsed
        );
        Ok(report)
    }

    fn run_batch(&self, session: &mut Session<'_>) -> Result<()> {
        for stage in &self.stages {
            session.cancel.check()?;
            let span = info_span!("stage", stage = stage.name());
            let _enter = span.enter();
            let started = Instant::now();
            match stage.run(session) {
                Ok(mut report) => {
                    report.elapsed = started.elapsed();
                    histogram!("geoflow_stage_duration_seconds", "stage" => stage.name())
                        .record(report.elapsed.as_secs_f64());
                    if report.skipped > 0 {
                        warn!("{}: {} ({} skipped)", stage.name(), report.message, report.skipped);
                    }
                    session.reports.push(report);
                }
                Err(e) => {
                    error!(
                        stage = stage.name(),
                        source = %session.current.source,
                        error = %e,
                        "stage failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(GeoflowError::Cancelled)));
    }

    #[test]
    fn skip_reasons_follow_error_kinds() {
        let mut counts = SkipCounts::default();
        for err in [
            GeoflowError::GeometryParse("lat".into()),
            GeoflowError::LookupMiss("Nowhere".into()),
            GeoflowError::LookupMiss("Elsewhere".into()),
            GeoflowError::Service("HTTP 503".into()),
        ] {
            counts.record(SkipReason::of(&err).unwrap());
        }
        assert_eq!(counts.geometry_parse, 1);
        assert_eq!(counts.lookup_miss, 2);
        assert_eq!(counts.service_error, 1);
        assert_eq!(counts.total(), 4);
        assert_eq!(SkipReason::of(&GeoflowError::write("x")), None);
    }

    #[test]
    fn stage_order_is_fixed() {
        let job = crate::config::JobConfig::from_toml_str(
            r#"
            [input]
            files = ["a.csv"]
            [output]
            tabular = "out.csv"
            "#,
            std::path::Path::new("."),
        )
        .unwrap();
        let services = Services::offline();
        let pipeline = Pipeline::new(&job, &services, CancelToken::new());
        assert_eq!(
            pipeline.stage_names(),
            vec!["ingest", "merge", "select", "rename", "geometry", "spatial_join", "derive", "write"]
        );
    }
}
