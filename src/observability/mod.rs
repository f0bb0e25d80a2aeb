use crate::issues::IssueCounts;
use crate::progress::{LoadCounters, ProgressSink, ProgressUpdate};
use lazy_static::lazy_static;
use prometheus::{register_int_gauge_vec, IntGaugeVec, Opts};
use std::convert::TryFrom;
use std::path::Path;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

lazy_static! {
    static ref PROCESSED_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        Opts::new("osm_import_processed", "Entities processed per stage"),
        &["entity", "stage"],
    )
    .unwrap();
    static ref TOTAL_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        Opts::new("osm_import_total_estimate", "Expected entities per stage"),
        &["entity", "stage"],
    )
    .unwrap();
    static ref RECORDS_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        Opts::new("osm_import_records", "Loaded records by outcome"),
        &["entity", "outcome"],
    )
    .unwrap();
    static ref ISSUES_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        Opts::new("osm_import_issues", "Recorded issues by kind"),
        &["kind"],
    )
    .unwrap();
}

/// JSON (bunyan) logs on stdout, filtered by `RUST_LOG` or `default_filter`.
pub fn init_subscriber(default_filter: &str) -> Result<(), TryInitError> {
    let app_name = env!("CARGO_PKG_NAME");
    let formatting_layer = BunyanFormattingLayer::new(app_name.into(), std::io::stdout);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
        .try_init()
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Mirrors progress into process-wide Prometheus gauges.
pub struct MetricsProgress;

impl ProgressSink for MetricsProgress {
    fn report(&self, update: &ProgressUpdate) {
        let entity = update.entity.to_string();
        let labels = [entity.as_str(), update.stage];
        PROCESSED_GAUGE
            .with_label_values(&labels)
            .set(gauge_value(update.processed));
        if let Some(total) = update.total_estimate {
            TOTAL_GAUGE.with_label_values(&labels).set(gauge_value(total));
        }
    }
}

impl MetricsProgress {
    pub fn record_load(&self, entity: &str, counters: &LoadCounters) {
        for (outcome, value) in [
            ("attempted", counters.attempted),
            ("succeeded", counters.succeeded),
            ("failed", counters.failed),
        ] {
            RECORDS_GAUGE
                .with_label_values(&[entity, outcome])
                .set(gauge_value(value));
        }
    }

    pub fn record_issues(&self, counts: &IssueCounts) {
        for (kind, value) in [
            ("malformed_blocks", counts.malformed_blocks),
            ("unresolved_references", counts.unresolved_references),
            ("incomplete_geometries", counts.incomplete_geometries),
            ("rejected_records", counts.rejected_records),
            ("unresolved_city_countries", counts.unresolved_city_countries),
        ] {
            ISSUES_GAUGE.with_label_values(&[kind]).set(gauge_value(value));
        }
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = prometheus::gather();
        encoder.encode_to_string(&metric_families)
    }

    /// Writes the text exposition format, for node-exporter's textfile
    /// collector.
    pub fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        let rendered = self
            .render()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        std::fs::write(path, rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::EntityKind;
    use std::time::Duration;

    #[test]
    fn renders_progress_and_outcomes() {
        let metrics = MetricsProgress;
        metrics.report(&ProgressUpdate {
            entity: EntityKind::Cities,
            stage: "load",
            processed: 42,
            total_estimate: Some(100),
            elapsed: Duration::from_secs(1),
        });
        metrics.record_load(
            "cities",
            &LoadCounters {
                attempted: 42,
                succeeded: 41,
                failed: 1,
            },
        );
        metrics.record_issues(&IssueCounts::default());

        let rendered = metrics.render().unwrap();
        assert!(rendered.contains(r#"osm_import_processed{entity="cities",stage="load"} 42"#));
        assert!(rendered.contains(r#"osm_import_total_estimate{entity="cities",stage="load"} 100"#));
        assert!(rendered.contains(r#"osm_import_records{entity="cities",outcome="failed"} 1"#));
        assert!(rendered.contains(r#"osm_import_issues{kind="malformed_blocks"} 0"#));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import.prom");
        metrics.write_textfile(&path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("osm_import_records"));
    }
}
