use super::{RecordSink, SinkError, SinkTransaction};
use crate::error::ImportError;
use crate::record::{CityRecord, CountryRecord};
use rusqlite::{params, Connection, ErrorCode};
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS countries (
    iso_alpha2   TEXT PRIMARY KEY,
    iso_alpha3   TEXT UNIQUE,
    osm_id       INTEGER NOT NULL,
    display_name TEXT NOT NULL,
    names        TEXT NOT NULL,
    continent    TEXT,
    region       TEXT,
    currency     TEXT,
    languages    TEXT NOT NULL,
    timezone     TEXT,
    center_lat   REAL,
    center_lon   REAL,
    boundary     TEXT NOT NULL,
    updated_at   TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS cities (
    osm_type       TEXT NOT NULL,
    osm_id         INTEGER NOT NULL,
    place          TEXT NOT NULL,
    display_name   TEXT NOT NULL,
    names          TEXT NOT NULL,
    lat            REAL NOT NULL,
    lon            REAL NOT NULL,
    region_state   TEXT,
    population     INTEGER,
    country_alpha2 TEXT,
    timezone       TEXT,
    updated_at     TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (osm_type, osm_id)
);
CREATE INDEX IF NOT EXISTS cities_country ON cities (country_alpha2);
";

const UPSERT_COUNTRY: &str = "
INSERT INTO countries (
    iso_alpha2, iso_alpha3, osm_id, display_name, names, continent, region,
    currency, languages, timezone, center_lat, center_lon, boundary
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
ON CONFLICT (iso_alpha2) DO UPDATE SET
    iso_alpha3 = excluded.iso_alpha3,
    osm_id = excluded.osm_id,
    display_name = excluded.display_name,
    names = excluded.names,
    continent = excluded.continent,
    region = excluded.region,
    currency = excluded.currency,
    languages = excluded.languages,
    timezone = excluded.timezone,
    center_lat = excluded.center_lat,
    center_lon = excluded.center_lon,
    boundary = excluded.boundary,
    updated_at = CURRENT_TIMESTAMP
";

const UPSERT_CITY: &str = "
INSERT INTO cities (
    osm_type, osm_id, place, display_name, names, lat, lon, region_state,
    population, country_alpha2, timezone
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT (osm_type, osm_id) DO UPDATE SET
    place = excluded.place,
    display_name = excluded.display_name,
    names = excluded.names,
    lat = excluded.lat,
    lon = excluded.lon,
    region_state = excluded.region_state,
    population = excluded.population,
    country_alpha2 = excluded.country_alpha2,
    timezone = excluded.timezone,
    updated_at = CURRENT_TIMESTAMP
";

fn classify(err: rusqlite::Error) -> SinkError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) | Some(ErrorCode::TooBig) => {
            SinkError::Rejected(err.to_string())
        }
        _ => SinkError::Unavailable(err.to_string()),
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, SinkError> {
    serde_json::to_string(value).map_err(|err| SinkError::Rejected(err.to_string()))
}

/// SQLite database, one connection per transaction so that workers never
/// share one.
pub struct SqliteSink {
    path: PathBuf,
    timeout: Duration,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, ImportError> {
        let sink = SqliteSink {
            path: path.as_ref().to_path_buf(),
            timeout,
        };
        let conn = sink
            .connect()
            .map_err(|err| ImportError::SinkSetup(err.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| ImportError::SinkSetup(err.to_string()))?;
        info!(path = ?sink.path, "sqlite sink ready");
        Ok(sink)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.timeout)?;
        Ok(conn)
    }

    pub fn count(&self, table: SqliteTable) -> Result<u64, SinkError> {
        let conn = self.connect().map_err(classify)?;
        let sql = match table {
            SqliteTable::Countries => "SELECT COUNT(*) FROM countries",
            SqliteTable::Cities => "SELECT COUNT(*) FROM cities",
        };
        let count: i64 = conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(classify)?;
        Ok(count as u64)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SqliteTable {
    Countries,
    Cities,
}

struct SqliteTransaction {
    conn: Connection,
    finished: bool,
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl SinkTransaction for SqliteTransaction {
    fn upsert_country(&mut self, country: &CountryRecord) -> Result<(), SinkError> {
        let names = encode_json(&country.names)?;
        let languages = encode_json(&country.official_languages)?;
        let mut stmt = self.conn.prepare_cached(UPSERT_COUNTRY).map_err(classify)?;
        stmt.execute(params![
            country.iso_alpha2,
            country.iso_alpha3,
            country.osm_id,
            country.display_name,
            names,
            country.continent,
            country.region,
            country.currency,
            languages,
            country.timezone,
            country.center.map(|center| center.y),
            country.center.map(|center| center.x),
            country.boundary_geojson(),
        ])
        .map_err(classify)?;
        Ok(())
    }

    fn upsert_city(&mut self, city: &CityRecord) -> Result<(), SinkError> {
        let names = encode_json(&city.names)?;
        let population = city.population.and_then(|value| i64::try_from(value).ok());
        let mut stmt = self.conn.prepare_cached(UPSERT_CITY).map_err(classify)?;
        stmt.execute(params![
            city.osm_kind.to_string(),
            city.osm_id,
            city.place_kind.as_str(),
            city.display_name,
            names,
            city.lat,
            city.lon,
            city.region_state,
            population,
            city.country_ref,
            city.timezone,
        ])
        .map_err(classify)?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), SinkError> {
        self.conn.execute_batch("COMMIT").map_err(classify)?;
        self.finished = true;
        Ok(())
    }
}

impl RecordSink for SqliteSink {
    fn begin(&self) -> Result<Box<dyn SinkTransaction + '_>, SinkError> {
        let conn = self
            .connect()
            .map_err(|err| SinkError::Unavailable(err.to_string()))?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(classify)?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}
