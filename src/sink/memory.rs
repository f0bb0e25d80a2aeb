use super::{RecordSink, SinkError, SinkTransaction};
use crate::primitive::ElementKind;
use crate::record::{CityRecord, CountryRecord};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    countries: BTreeMap<String, CountryRecord>,
    cities: BTreeMap<(ElementKind, i64), CityRecord>,
}

/// In-process sink with the same uniqueness rules as the SQL schema:
/// `iso_alpha2` and `iso_alpha3` are unique for countries, `(kind, id)` for
/// cities. A transaction holds the tables from `begin` until it ends, like
/// `BEGIN IMMEDIATE`; writes become visible on commit.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<Tables>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, SinkError> {
        self.tables
            .lock()
            .map_err(|_| SinkError::Unavailable("memory sink poisoned".into()))
    }

    pub fn countries(&self) -> Vec<CountryRecord> {
        self.tables()
            .map(|tables| tables.countries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn cities(&self) -> Vec<CityRecord> {
        self.tables()
            .map(|tables| tables.cities.values().cloned().collect())
            .unwrap_or_default()
    }
}

struct MemoryTransaction<'a> {
    tables: MutexGuard<'a, Tables>,
    countries: Vec<CountryRecord>,
    cities: Vec<CityRecord>,
}

fn alpha3_taken(country: &CountryRecord, other: &CountryRecord) -> bool {
    other.iso_alpha2 != country.iso_alpha2
        && other.iso_alpha3.is_some()
        && other.iso_alpha3 == country.iso_alpha3
}

impl<'a> SinkTransaction for MemoryTransaction<'a> {
    fn upsert_country(&mut self, country: &CountryRecord) -> Result<(), SinkError> {
        let conflict = self
            .tables
            .countries
            .values()
            .chain(self.countries.iter())
            .any(|other| alpha3_taken(country, other));
        if conflict {
            return Err(SinkError::Rejected(format!(
                "iso_alpha3 {:?} already used by another country",
                country.iso_alpha3
            )));
        }
        self.countries.push(country.clone());
        Ok(())
    }

    fn upsert_city(&mut self, city: &CityRecord) -> Result<(), SinkError> {
        self.cities.push(city.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), SinkError> {
        let MemoryTransaction {
            mut tables,
            countries,
            cities,
        } = *self;
        for country in countries {
            tables.countries.insert(country.iso_alpha2.clone(), country);
        }
        for city in cities {
            tables.cities.insert((city.osm_kind, city.osm_id), city);
        }
        Ok(())
    }
}

impl RecordSink for MemorySink {
    fn begin(&self) -> Result<Box<dyn SinkTransaction + '_>, SinkError> {
        Ok(Box::new(MemoryTransaction {
            tables: self.tables()?,
            countries: Vec::new(),
            cities: Vec::new(),
        }))
    }
}
