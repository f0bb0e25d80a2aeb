use crate::error::ImportError;
use crate::load::LoadOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImportConfig {
    pub batch_size: usize,
    pub workers: usize,
    /// Douglas-Peucker tolerance in degrees.
    pub simplification_tolerance: f64,
    pub retry_ceiling: u32,
    pub retry_backoff_ms: u64,
    pub sink_timeout_ms: u64,
    pub max_corrupt_fraction: f64,
    pub max_resolve_rounds: u32,
    pub display_languages: Vec<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            batch_size: 1000,
            workers: 4,
            simplification_tolerance: 0.01,
            retry_ceiling: 3,
            retry_backoff_ms: 200,
            sink_timeout_ms: 30_000,
            max_corrupt_fraction: 0.05,
            max_resolve_rounds: 4,
            display_languages: vec!["en".to_string()],
        }
    }
}

impl ImportConfig {
    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ImportError::Config(format!("{}: {}", path.display(), err)))?;
        serde_json::from_str(&text)
            .map_err(|err| ImportError::Config(format!("{}: {}", path.display(), err)))
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.batch_size == 0 {
            return Err(ImportError::Config("batch_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ImportError::Config("workers must be positive".into()));
        }
        if !self.simplification_tolerance.is_finite() || self.simplification_tolerance < 0.0 {
            return Err(ImportError::Config(format!(
                "simplification_tolerance must be a non-negative number, got {}",
                self.simplification_tolerance
            )));
        }
        if !(0.0..=1.0).contains(&self.max_corrupt_fraction) {
            return Err(ImportError::Config(format!(
                "max_corrupt_fraction must be within [0, 1], got {}",
                self.max_corrupt_fraction
            )));
        }
        Ok(())
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            batch_size: self.batch_size,
            retry_ceiling: self.retry_ceiling,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }
}
