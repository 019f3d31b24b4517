use crate::constants::{
    env_or_default, BOUNDARY_URL_ENV, DEFAULT_BOUNDARY_URL, DEFAULT_CRS, DEFAULT_GEOCODER_URL,
    DEFAULT_USER_AGENT, GEOCODER_URL_ENV, USER_AGENT_ENV,
};
use crate::error::{GeoflowError, Result};
use crate::pipeline::enrich::{Derivation, DerivedField, LookupTableConfig};
use crate::pipeline::geometry::GeometryMode;
use crate::pipeline::ingestion::Delimiter;
use crate::pipeline::merge::{DuplicatePolicy, JoinKey};
use crate::pipeline::select::FieldMapping;
use crate::pipeline::spatial_join::SpatialJoinConfig;
use crate::pipeline::writer::WriteStrategy;
use crate::services::ServiceSettings;
use crate::storage::{FieldDef, TableSchema};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A whole run, as described by a TOML job file
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    #[serde(default = "default_job_name")]
    pub name: String,
    pub input: InputConfig,
    #[serde(default)]
    pub merge: Option<MergeConfig>,
    /// Fields to keep, in order; empty keeps all
    #[serde(default)]
    pub select: Vec<String>,
    /// (source, target) renames applied after selection
    #[serde(default)]
    pub rename: Vec<(String, String)>,
    #[serde(default)]
    pub geometry: GeometryMode,
    #[serde(default)]
    pub spatial_join: Vec<SpatialJoinConfig>,
    #[serde(default)]
    pub lookup_table: Vec<LookupTableConfig>,
    #[serde(default)]
    pub derive: Vec<DerivedField>,
    pub output: OutputConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_job_name() -> String {
    "geoflow".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryMode {
    /// All files of the directory form one source
    #[default]
    Combined,
    /// The pipeline runs once per file
    PerFile,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    #[serde(default)]
    pub files: Vec<PathBuf>,
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub directory_mode: DirectoryMode,
    /// Existing spatial table used as the source
    pub table: Option<PathBuf>,
    #[serde(default)]
    pub delimiter: Delimiter,
    pub id_field: Option<String>,
    pub value_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    pub keys: JoinKey,
    #[serde(default)]
    pub on_duplicate: DuplicatePolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default)]
    pub strategy: WriteStrategy,
    /// Spatial table written by the run
    pub path: Option<PathBuf>,
    /// Optional CSV copy of every record
    pub tabular: Option<PathBuf>,
    #[serde(default = "default_crs")]
    pub crs: String,
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub schema: Vec<FieldDef>,
}

fn default_crs() -> String {
    DEFAULT_CRS.to_string()
}

/// Overrides for the lookup services; unset values use the defaults
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub geocoder_url: Option<String>,
    pub boundary_url: Option<String>,
    pub user_agent: Option<String>,
    pub country_code: Option<String>,
    pub limit: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_ms: Option<u64>,
    pub min_delay_ms: Option<u64>,
    pub requests_per_min: Option<u64>,
}

impl ServiceConfig {
    /// Effective settings; environment variables win over the job file.
    pub fn settings(&self) -> ServiceSettings {
        let mut settings = ServiceSettings::default();
        settings.geocoder_url = env_or_default(
            GEOCODER_URL_ENV,
            self.geocoder_url.as_deref().unwrap_or(DEFAULT_GEOCODER_URL),
        );
        settings.boundary_url = env_or_default(
            BOUNDARY_URL_ENV,
            self.boundary_url.as_deref().unwrap_or(DEFAULT_BOUNDARY_URL),
        );
        settings.user_agent = env_or_default(
            USER_AGENT_ENV,
            self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
        );
        if let Some(cc) = &self.country_code {
            settings.country_code = cc.clone();
        }
        if let Some(limit) = self.limit {
            settings.limit = limit;
        }
        if let Some(secs) = self.timeout_secs {
            settings.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = self.max_retries {
            settings.max_retries = retries;
        }
        if let Some(ms) = self.backoff_ms {
            settings.backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = self.min_delay_ms {
            settings.min_delay = Duration::from_millis(ms);
        }
        if self.requests_per_min.is_some() {
            settings.requests_per_min = self.requests_per_min;
        }
        settings
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

impl JobConfig {
    /// Load and validate a job file. Relative paths are taken from the job
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            GeoflowError::Config(format!("Failed to read job file '{}': {}", path.display(), e))
        })?;
        let base = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::from_toml_str(&content, &base)
    }

    pub fn from_toml_str(content: &str, base: &Path) -> Result<Self> {
        let mut job: JobConfig = toml::from_str(content)?;
        job.resolve_paths(base);
        job.validate()?;
        Ok(job)
    }

    fn resolve_paths(&mut self, base: &Path) {
        self.input.files.iter_mut().for_each(|p| resolve(base, p));
        for p in [&mut self.input.directory, &mut self.input.table].into_iter().flatten() {
            resolve(base, p);
        }
        for join in &mut self.spatial_join {
            resolve(base, &mut join.layer);
        }
        for table in &mut self.lookup_table {
            resolve(base, &mut table.path);
        }
        for p in [
            &mut self.output.path,
            &mut self.output.tabular,
            &mut self.output.backup_dir,
        ]
        .into_iter()
        .flatten()
        {
            resolve(base, p);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let input = &self.input;
        let sources = usize::from(!input.files.is_empty())
            + usize::from(input.directory.is_some())
            + usize::from(input.table.is_some());
        if sources != 1 {
            return Err(GeoflowError::Config(
                "input needs exactly one of files, directory or table".to_string(),
            ));
        }
        let per_file = input.directory.is_some() && input.directory_mode == DirectoryMode::PerFile;

        if let Some(merge) = &self.merge {
            if merge.keys.0.is_empty() {
                return Err(GeoflowError::Config("merge.keys is empty".to_string()));
            }
            if input.files.len() > 2 {
                return Err(GeoflowError::Config(format!(
                    "a join takes two sources, {} files given",
                    input.files.len()
                )));
            }
            if per_file || input.table.is_some() {
                return Err(GeoflowError::Config(
                    "merge needs two delimited sources read together".to_string(),
                ));
            }
        }

        FieldMapping::new(self.rename.iter().map(|(s, t)| (s, t)))?;
        self.geometry.validate()?;

        for join in &self.spatial_join {
            if join.fields.is_empty() {
                return Err(GeoflowError::Config(format!(
                    "spatial join on {} copies no fields",
                    join.layer.display()
                )));
            }
        }
        for field in &self.derive {
            field.validate()?;
            if let Derivation::Lookup { table, .. } = &field.derivation {
                if !self.lookup_table.iter().any(|t| &t.name == table) {
                    return Err(GeoflowError::Config(format!(
                        "{}: no lookup_table named '{}'",
                        field.target, table
                    )));
                }
            }
        }

        let output = &self.output;
        if output.path.is_none() && output.tabular.is_none() {
            return Err(GeoflowError::Config(
                "output needs a path, a tabular file, or both".to_string(),
            ));
        }
        if output.strategy == WriteStrategy::ReplaceInPlace {
            if output.path.is_none() {
                return Err(GeoflowError::Config("replace_in_place needs output.path".to_string()));
            }
            if per_file {
                return Err(GeoflowError::Config(
                    "replace_in_place cannot run once per file".to_string(),
                ));
            }
            if !output.schema.is_empty() {
                return Err(GeoflowError::Config(
                    "replace_in_place uses the destination's schema; drop output.schema".to_string(),
                ));
            }
        }
        if !output.schema.is_empty() {
            TableSchema::new(output.schema.clone())?;
        }
        Ok(())
    }
}
