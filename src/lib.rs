pub mod assemble;
pub mod config;
pub mod decoder;
pub mod enrich;
pub mod error;
pub mod index;
pub mod issues;
pub mod load;
pub mod lookup;
pub mod observability;
pub mod pipeline;
pub mod primitive;
pub mod progress;
pub mod record;
pub mod simplify;
pub mod sink;

pub use config::ImportConfig;
pub use error::ImportError;
pub use pipeline::{extract, run, Datasets, Extraction, RunStatus, RunSummary};
