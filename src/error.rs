use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoflowError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Could not parse geometry: {0}")]
    GeometryParse(String),

    #[error("No match for lookup: {0}")]
    LookupMiss(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Write error: {message}{}", backup_hint(.backup))]
    Write {
        message: String,
        backup: Option<PathBuf>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn backup_hint(backup: &Option<PathBuf>) -> String {
    match backup {
        Some(path) => format!(
            " (destination may need manual recovery from backup {})",
            path.display()
        ),
        None => String::new(),
    }
}

impl GeoflowError {
    pub fn write(message: impl Into<String>) -> Self {
        GeoflowError::Write {
            message: message.into(),
            backup: None,
        }
    }

    /// Per-record failures: the record is skipped and the run continues.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            GeoflowError::GeometryParse(_) | GeoflowError::LookupMiss(_) | GeoflowError::Service(_)
        )
    }

    /// Attach the backup location to a write failure so the caller can surface it.
    pub fn with_backup(self, path: PathBuf) -> Self {
        match self {
            GeoflowError::Write { message, .. } => GeoflowError::Write {
                message,
                backup: Some(path),
            },
            GeoflowError::Io(e) => GeoflowError::Write {
                message: e.to_string(),
                backup: Some(path),
            },
            GeoflowError::Json(e) => GeoflowError::Write {
                message: e.to_string(),
                backup: Some(path),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, GeoflowError>;
