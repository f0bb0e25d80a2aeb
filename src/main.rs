use osm_geo_import::decoder::PbfFile;
use osm_geo_import::enrich::{CountryTable, TimezoneIndex};
use osm_geo_import::load::CancelToken;
use osm_geo_import::observability::{init_subscriber, MetricsProgress};
use osm_geo_import::progress::{EntityKind, LogProgress, ProgressSink, ProgressUpdate};
use osm_geo_import::sink::SqliteSink;
use osm_geo_import::{run, Datasets, ImportConfig, RunSummary};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tracing::{info, warn};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "osm-geo-import",
    about = "import countries and cities from an OSM extract"
)]
struct Opt {
    /// OSM protobuf input file
    #[structopt(short = "p", long = "pbf", env = "OSM_PBF")]
    pbf: PathBuf,
    /// SQLite database, created if missing
    #[structopt(short = "s", long = "sqlite", env = "OSM_SQLITE")]
    sqlite: PathBuf,
    /// JSON import config
    #[structopt(short = "c", long = "config", env = "OSM_IMPORT_CONFIG")]
    config: Option<PathBuf>,
    /// GeoJSON timezone boundaries with a `tzid` property
    #[structopt(long = "timezones", env = "OSM_TIMEZONES")]
    timezones: Option<PathBuf>,
    /// JSON country table replacing the built-in one
    #[structopt(long = "country-table")]
    country_table: Option<PathBuf>,
    /// Prometheus textfile written at the end of the run
    #[structopt(long = "metrics")]
    metrics: Option<PathBuf>,
    /// run summary as JSON
    #[structopt(long = "summary")]
    summary: Option<PathBuf>,
    #[structopt(long = "batch-size")]
    batch_size: Option<usize>,
    #[structopt(short = "w", long = "workers")]
    workers: Option<usize>,
    /// Douglas-Peucker tolerance in degrees
    #[structopt(long = "tolerance")]
    tolerance: Option<f64>,
    #[structopt(long = "retries")]
    retry_ceiling: Option<u32>,
}

impl Opt {
    fn import_config(&self) -> Result<ImportConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => ImportConfig::from_path(path)?,
            None => ImportConfig::default(),
        };
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(tolerance) = self.tolerance {
            config.simplification_tolerance = tolerance;
        }
        if let Some(retry_ceiling) = self.retry_ceiling {
            config.retry_ceiling = retry_ceiling;
        }
        config.validate()?;
        Ok(config)
    }

    fn datasets(&self) -> Result<Datasets, Box<dyn Error>> {
        let countries = match &self.country_table {
            Some(path) => CountryTable::load(path)?,
            None => CountryTable::builtin()?,
        };
        let timezones = match &self.timezones {
            Some(path) => TimezoneIndex::load(path)?,
            None => {
                warn!("no timezone boundaries given, timezones stay empty");
                TimezoneIndex::empty()
            }
        };
        Ok(Datasets {
            countries,
            timezones,
        })
    }
}

struct RunProgress {
    log: LogProgress,
    metrics: MetricsProgress,
}

impl ProgressSink for RunProgress {
    fn report(&self, update: &ProgressUpdate) {
        self.log.report(update);
        self.metrics.report(update);
    }
}

fn write_outputs(
    opt: &Opt,
    summary: &RunSummary,
    metrics: &MetricsProgress,
) -> Result<(), Box<dyn Error>> {
    if let Some(path) = &opt.summary {
        std::fs::write(path, serde_json::to_vec_pretty(summary)?)?;
        info!(path = ?path, "summary written");
    }
    if let Some(path) = &opt.metrics {
        for entity in [EntityKind::Countries, EntityKind::Cities] {
            metrics.record_load(&entity.to_string(), &summary.entity(entity).load);
        }
        metrics.record_issues(&summary.issues);
        metrics.write_textfile(path)?;
        info!(path = ?path, "metrics written");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_subscriber("info")?;
    let opt = Opt::from_args();
    let config = opt.import_config()?;
    let datasets = opt.datasets()?;
    let source = PbfFile::new(&opt.pbf)?;
    let sink = SqliteSink::open(&opt.sqlite, config.sink_timeout())?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, letting running batches finish");
            interrupt.cancel();
        }
    });

    info!(pbf = ?opt.pbf, sqlite = ?opt.sqlite, "starting import");
    let summary = tokio::task::spawn_blocking(move || {
        let progress = RunProgress {
            log: LogProgress::new(Duration::from_secs(5)),
            metrics: MetricsProgress,
        };
        run(&source, &sink, &config, &datasets, &progress, &cancel)
    })
    .await?;

    write_outputs(&opt, &summary, &MetricsProgress)?;
    if !summary.completed() {
        std::process::exit(1);
    }
    Ok(())
}
