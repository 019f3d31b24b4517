pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod types;

pub use config::JobConfig;
pub use error::{GeoflowError, Result};
pub use pipeline::{CancelToken, Pipeline, RunReport};
pub use services::Services;
