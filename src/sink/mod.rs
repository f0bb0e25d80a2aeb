use crate::record::{CityRecord, CountryRecord};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemorySink;
pub use sqlite::SqliteSink;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SinkError {
    /// The record itself cannot be stored; retrying will not help.
    #[error("record rejected: {0}")]
    Rejected(String),
    /// The sink could not be reached or the transaction could not complete.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

pub trait SinkTransaction {
    fn upsert_country(&mut self, country: &CountryRecord) -> Result<(), SinkError>;

    fn upsert_city(&mut self, city: &CityRecord) -> Result<(), SinkError>;

    fn commit(self: Box<Self>) -> Result<(), SinkError>;
}

pub trait RecordSink: Sync {
    fn begin(&self) -> Result<Box<dyn SinkTransaction + '_>, SinkError>;
}
