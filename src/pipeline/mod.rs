use crate::assemble::build_country;
use crate::config::ImportConfig;
use crate::decoder::{PrimitiveDecoder, PrimitiveSource};
use crate::enrich::{country_index, CountryTable, Enricher, TimezoneIndex};
use crate::error::{ImportError, RecordRejectedError};
use crate::index::{IndexStats, ReferenceIndex};
use crate::issues::{IssueCounts, IssueLog};
use crate::load::{BatchLoader, CancelToken, LoadReport};
use crate::progress::{EntityKind, LoadCounters, ProgressAggregator, ProgressSink};
use crate::record::{CityRecord, CountryRecord};
use crate::simplify::simplify_country;
use crate::sink::RecordSink;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

/// Read-only lookup tables shared by every record of a run.
pub struct Datasets {
    pub countries: CountryTable,
    pub timezones: TimezoneIndex,
}

impl Datasets {
    pub fn builtin() -> Result<Self, ImportError> {
        Ok(Datasets {
            countries: CountryTable::builtin()?,
            timezones: TimezoneIndex::empty(),
        })
    }
}

/// Enriched records ready for loading, ordered by their sink key.
#[derive(Debug, Default)]
pub struct Extraction {
    pub countries: Vec<CountryRecord>,
    pub cities: Vec<CityRecord>,
    pub country_candidates: u64,
    pub city_candidates: u64,
    pub index: IndexStats,
}

/// Keeps the lowest relation id per alpha-2 code.
fn dedup_countries(countries: &mut Vec<CountryRecord>, issues: &IssueLog) {
    countries.sort_by(|a, b| {
        a.iso_alpha2
            .cmp(&b.iso_alpha2)
            .then(a.osm_id.cmp(&b.osm_id))
    });
    let mut kept: Vec<CountryRecord> = Vec::with_capacity(countries.len());
    for country in countries.drain(..) {
        match kept.last() {
            Some(previous) if previous.iso_alpha2 == country.iso_alpha2 => {
                issues.rejected_record(RecordRejectedError {
                    key: format!("relation {}", country.osm_id),
                    reason: format!(
                        "iso_alpha2 {} already taken by relation {}",
                        country.iso_alpha2, previous.osm_id
                    ),
                });
            }
            _ => kept.push(country),
        }
    }
    *countries = kept;
}

/// Decodes, assembles, simplifies and enriches every country and city of
/// `source`. Only source-level failures are returned as errors; everything
/// else ends up in `issues`.
#[instrument(skip_all, fields(workers = config.workers))]
pub fn extract(
    source: &dyn PrimitiveSource,
    config: &ImportConfig,
    datasets: &Datasets,
    issues: &IssueLog,
    progress: &ProgressAggregator<'_>,
) -> Result<Extraction, ImportError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .thread_name(|index| format!("extract-{}", index))
        .build()?;
    let languages = config.display_languages.as_slice();

    info!("phase 1: indexing primitives");
    let decoder = PrimitiveDecoder::new(source, config.max_corrupt_fraction, issues)
        .with_progress(progress);
    let index = ReferenceIndex::build(&decoder, config.max_resolve_rounds)?;
    let relations = index.boundary_relations(issues);
    let places = index.places(issues);
    let stats = index.stats();
    drop(index);

    info!(relations = relations.len(), "phase 2: assembling countries");
    progress.set_total(EntityKind::Countries, relations.len() as u64);
    let tolerance = config.simplification_tolerance;
    let assembled: Vec<Result<CountryRecord, RecordRejectedError>> = pool.install(|| {
        relations
            .par_iter()
            .map(|relation| {
                build_country(relation, languages, issues)
                    .map(|country| simplify_country(country, tolerance))
            })
            .collect()
    });
    let mut countries = Vec::with_capacity(assembled.len());
    for outcome in assembled {
        match outcome {
            Ok(country) => countries.push(country),
            Err(rejected) => issues.rejected_record(rejected),
        }
    }
    dedup_countries(&mut countries, issues);
    progress.observe(EntityKind::Countries, "assemble", countries.len() as u64);

    info!(countries = countries.len(), "phase 3: enriching");
    let enricher = Enricher::new(&datasets.countries, &datasets.timezones, languages);
    let countries: Vec<CountryRecord> = pool.install(|| {
        countries
            .into_par_iter()
            .map(|country| enricher.enrich_country(country))
            .collect()
    });
    progress.observe(EntityKind::Countries, "enrich", countries.len() as u64);

    let containing = country_index(&countries);
    progress.set_total(EntityKind::Cities, places.len() as u64);
    let cities: Vec<CityRecord> = pool.install(|| {
        places
            .par_iter()
            .filter_map(|place| {
                CityRecord::from_tags(place.kind, place.id, place.location, &place.tags, languages)
            })
            .map(|city| enricher.enrich_city(city, &containing, issues))
            .collect()
    });
    progress.observe(EntityKind::Cities, "enrich", cities.len() as u64);

    info!(
        countries = countries.len(),
        cities = cities.len(),
        "extraction finished"
    );
    Ok(Extraction {
        country_candidates: relations.len() as u64,
        city_candidates: places.len() as u64,
        countries,
        cities,
        index: stats,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySummary {
    /// Candidates found in the source.
    pub extracted: u64,
    /// Records that survived assembly and enrichment.
    pub processed: u64,
    pub imported: u64,
    /// Rejected during extraction plus failed during load.
    pub errors: u64,
    pub skipped_batches: u64,
    pub load: LoadCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub error: Option<String>,
    /// Unix timestamp (UTC) of the start of the run.
    pub started_at: i64,
    pub elapsed_s: f64,
    pub entities: BTreeMap<EntityKind, EntitySummary>,
    pub issues: IssueCounts,
}

impl RunSummary {
    pub fn completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn entity(&self, entity: EntityKind) -> EntitySummary {
        self.entities.get(&entity).cloned().unwrap_or_default()
    }
}

fn entity_summary(extracted: u64, processed: u64, report: Option<&LoadReport>) -> EntitySummary {
    let mut summary = EntitySummary {
        extracted,
        processed,
        errors: extracted.saturating_sub(processed),
        ..EntitySummary::default()
    };
    if let Some(report) = report {
        summary.imported = report.succeeded;
        summary.errors += report.failed;
        summary.skipped_batches = report.skipped_batches as u64;
        summary.load = LoadCounters {
            attempted: report.attempted,
            succeeded: report.succeeded,
            failed: report.failed,
        };
    }
    summary
}

/// One full import: extraction followed by loading countries, then cities.
///
/// Never returns an error: systemic failures end up as an aborted summary.
#[instrument(skip_all)]
pub fn run(
    source: &dyn PrimitiveSource,
    sink: &dyn RecordSink,
    config: &ImportConfig,
    datasets: &Datasets,
    progress_sink: &dyn ProgressSink,
    cancel: &CancelToken,
) -> RunSummary {
    let started = OffsetDateTime::now_utc();
    let issues = IssueLog::new();
    let progress = ProgressAggregator::new(progress_sink);
    let mut entities = BTreeMap::new();

    let outcome = (|| -> Result<(), ImportError> {
        config.validate()?;
        let extraction = extract(source, config, datasets, &issues, &progress)?;
        let loader = BatchLoader::new(config.workers, config.load_options())?;
        entities.insert(
            EntityKind::Countries,
            entity_summary(
                extraction.country_candidates,
                extraction.countries.len() as u64,
                None,
            ),
        );
        entities.insert(
            EntityKind::Cities,
            entity_summary(
                extraction.city_candidates,
                extraction.cities.len() as u64,
                None,
            ),
        );

        info!("phase 4: loading countries");
        let report = loader.load(&extraction.countries, sink, &progress, cancel)?;
        entities.insert(
            EntityKind::Countries,
            entity_summary(
                extraction.country_candidates,
                extraction.countries.len() as u64,
                Some(&report),
            ),
        );

        info!("phase 5: loading cities");
        let report = loader.load(&extraction.cities, sink, &progress, cancel)?;
        entities.insert(
            EntityKind::Cities,
            entity_summary(
                extraction.city_candidates,
                extraction.cities.len() as u64,
                Some(&report),
            ),
        );
        Ok(())
    })();

    let (status, error) = match outcome {
        Ok(()) if cancel.is_cancelled() => {
            warn!("run cancelled");
            (RunStatus::Cancelled, None)
        }
        Ok(()) => (RunStatus::Completed, None),
        Err(err) => {
            error!(error = %err, "run aborted");
            (RunStatus::Aborted, Some(err.to_string()))
        }
    };
    let summary = RunSummary {
        status,
        error,
        started_at: started.unix_timestamp(),
        elapsed_s: (OffsetDateTime::now_utc() - started).as_seconds_f64(),
        entities,
        issues: issues.counts(),
    };
    for (entity, counts) in &summary.entities {
        info!(
            entity = %entity,
            extracted = counts.extracted,
            processed = counts.processed,
            imported = counts.imported,
            errors = counts.errors,
            "summary"
        );
    }
    info!(status = ?summary.status, elapsed_s = summary.elapsed_s, "run finished");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::MemorySource;
    use crate::primitive::build::{node, relation, way};
    use crate::primitive::{ElementKind, RawPrimitive};
    use crate::progress::NoProgress;
    use crate::sink::MemorySink;

    fn square_country(relation_id: i64, iso: &str, offset: i64, origin: f64) -> Vec<RawPrimitive> {
        let n = offset;
        vec![
            node(n + 1, origin, origin, &[]),
            node(n + 2, origin, origin + 1.0, &[]),
            node(n + 3, origin + 1.0, origin + 1.0, &[]),
            node(n + 4, origin + 1.0, origin, &[]),
            way(n + 10, &[n + 1, n + 2, n + 3, n + 4, n + 1], &[]),
            relation(
                relation_id,
                &[(ElementKind::Way, n + 10, "outer")],
                &[
                    ("type", "boundary"),
                    ("boundary", "administrative"),
                    ("admin_level", "2"),
                    ("ISO3166-1", iso),
                ],
            ),
        ]
    }

    fn config() -> ImportConfig {
        ImportConfig {
            workers: 2,
            batch_size: 2,
            retry_backoff_ms: 0,
            ..ImportConfig::default()
        }
    }

    #[test]
    fn duplicate_alpha2_keeps_lowest_relation() {
        let mut primitives = square_country(7, "LU", 0, 10.0);
        primitives.extend(square_country(3, "LU", 100, 20.0));
        let source = MemorySource::single_block(primitives);
        let issues = IssueLog::new();
        let progress = ProgressAggregator::new(&NoProgress);
        let datasets = Datasets::builtin().unwrap();

        let extraction = extract(&source, &config(), &datasets, &issues, &progress).unwrap();
        assert_eq!(extraction.country_candidates, 2);
        assert_eq!(extraction.countries.len(), 1);
        assert_eq!(extraction.countries[0].osm_id, 3);
        assert_eq!(extraction.countries[0].iso_alpha3.as_deref(), Some("LUX"));
        assert_eq!(issues.counts().rejected_records, 1);
    }

    #[test]
    fn cities_outside_countries_are_kept() {
        let mut primitives = square_country(1, "AD", 0, 42.0);
        primitives.push(node(50, 42.5, 42.5, &[("place", "town"), ("name", "Inside")]));
        primitives.push(node(51, -10.0, -10.0, &[("place", "hamlet")]));
        let source = MemorySource::single_block(primitives);
        let sink = MemorySink::new();
        let datasets = Datasets::builtin().unwrap();

        let summary = run(&source, &sink, &config(), &datasets, &NoProgress, &CancelToken::new());
        assert!(summary.completed());
        let cities = sink.cities();
        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].country_ref.as_deref(), Some("AD"));
        assert_eq!(cities[1].country_ref, None);
        assert_eq!(cities[1].display_name, "Place 51");
        assert_eq!(summary.issues.unresolved_city_countries, 1);
        assert_eq!(summary.entity(EntityKind::Cities).imported, 2);
    }

    #[test]
    fn cancelled_run_skips_loading() {
        let source = MemorySource::single_block(square_country(1, "AD", 0, 42.0));
        let sink = MemorySink::new();
        let datasets = Datasets::builtin().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = run(&source, &sink, &config(), &datasets, &NoProgress, &cancel);
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert!(sink.countries().is_empty());
        let countries = summary.entity(EntityKind::Countries);
        assert_eq!(countries.processed, 1);
        assert_eq!(countries.imported, 0);
        assert_eq!(countries.skipped_batches, 1);
    }

    #[test]
    fn invalid_config_aborts() {
        let source = MemorySource::single_block(Vec::new());
        let sink = MemorySink::new();
        let datasets = Datasets::builtin().unwrap();
        let config = ImportConfig {
            batch_size: 0,
            ..ImportConfig::default()
        };

        let summary = run(&source, &sink, &config, &datasets, &NoProgress, &CancelToken::new());
        assert_eq!(summary.status, RunStatus::Aborted);
        assert!(summary.error.unwrap().contains("batch_size"));
        assert!(summary.entities.is_empty());
    }
}
