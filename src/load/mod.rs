use crate::error::{BatchCommitError, ImportError};
use crate::progress::{EntityKind, ProgressAggregator};
use crate::record::{CityRecord, CountryRecord, RecordKey};
use crate::sink::{RecordSink, SinkError, SinkTransaction};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum FailureKind {
    Rejected(String),
    BatchCommit(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedRecord {
    pub key: RecordKey,
    pub kind: FailureKind,
}

/// Outcome of one batch; failed records keep the batch's emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub batch_id: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedRecord>,
}

pub trait Loadable: Sync {
    const ENTITY: EntityKind;

    fn key(&self) -> RecordKey;

    fn upsert_into<X: SinkTransaction + ?Sized>(&self, tx: &mut X) -> Result<(), SinkError>;
}

impl Loadable for CountryRecord {
    const ENTITY: EntityKind = EntityKind::Countries;

    fn key(&self) -> RecordKey {
        RecordKey::Country(self.iso_alpha2.clone())
    }

    fn upsert_into<X: SinkTransaction + ?Sized>(&self, tx: &mut X) -> Result<(), SinkError> {
        tx.upsert_country(self)
    }
}

impl Loadable for CityRecord {
    const ENTITY: EntityKind = EntityKind::Cities;

    fn key(&self) -> RecordKey {
        RecordKey::City(self.osm_kind, self.osm_id)
    }

    fn upsert_into<X: SinkTransaction + ?Sized>(&self, tx: &mut X) -> Result<(), SinkError> {
        tx.upsert_city(self)
    }
}

/// Stops dispatch of new batches; batches already running finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub batch_size: usize,
    /// Retries after the first attempt.
    pub retry_ceiling: u32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub batches: usize,
    pub skipped_batches: usize,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub results: Vec<BatchResult>,
}

enum BatchOutcome {
    Committed(BatchResult),
    Exhausted(BatchResult),
}

fn attempt<T: Loadable>(
    batch: &[T],
    sink: &dyn RecordSink,
) -> Result<(usize, Vec<FailedRecord>), SinkError> {
    let mut tx = sink.begin()?;
    let mut succeeded = 0;
    let mut failed = Vec::new();
    for record in batch {
        match record.upsert_into(tx.as_mut()) {
            Ok(()) => succeeded += 1,
            Err(SinkError::Rejected(reason)) => failed.push(FailedRecord {
                key: record.key(),
                kind: FailureKind::Rejected(reason),
            }),
            Err(err) => return Err(err),
        }
    }
    tx.commit()?;
    Ok((succeeded, failed))
}

pub struct BatchLoader {
    pool: ThreadPool,
    workers: usize,
    options: LoadOptions,
}

impl BatchLoader {
    pub fn new(workers: usize, options: LoadOptions) -> Result<Self, ImportError> {
        if workers == 0 || options.batch_size == 0 {
            return Err(ImportError::Config(
                "workers and batch size must be positive".into(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("loader-{}", index))
            .build()?;
        Ok(BatchLoader {
            pool,
            workers,
            options,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.options
            .retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    fn run_batch<T: Loadable>(
        &self,
        batch_id: usize,
        batch: &[T],
        sink: &dyn RecordSink,
    ) -> BatchOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match attempt(batch, sink) {
                Ok((succeeded, failed)) => {
                    return BatchOutcome::Committed(BatchResult {
                        batch_id,
                        attempted: batch.len(),
                        succeeded,
                        failed,
                    })
                }
                Err(err) => err,
            };
            if attempts <= self.options.retry_ceiling {
                let delay = self.backoff(attempts);
                warn!(
                    batch = batch_id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying batch"
                );
                std::thread::sleep(delay);
                continue;
            }
            let commit_error = BatchCommitError {
                batch_id,
                attempts,
                reason: err.to_string(),
            };
            error!(batch = batch_id, error = %commit_error, "batch failed");
            let failed = batch
                .iter()
                .map(|record| FailedRecord {
                    key: record.key(),
                    kind: FailureKind::BatchCommit(commit_error.to_string()),
                })
                .collect();
            return BatchOutcome::Exhausted(BatchResult {
                batch_id,
                attempted: batch.len(),
                succeeded: 0,
                failed,
            });
        }
    }

    /// Loads `records` and merges every finished batch into `progress`.
    ///
    /// Fails with [`ImportError::SinkUnavailable`] once as many consecutive
    /// batches as there are workers have exhausted their retries; batches not
    /// started by then are skipped.
    #[instrument(skip_all, fields(entity = %T::ENTITY, records = records.len()))]
    pub fn load<T: Loadable>(
        &self,
        records: &[T],
        sink: &dyn RecordSink,
        progress: &ProgressAggregator<'_>,
        cancel: &CancelToken,
    ) -> Result<LoadReport, ImportError> {
        let batch_size = self.options.batch_size;
        let batches = (records.len() + batch_size - 1) / batch_size;
        let consecutive = AtomicUsize::new(0);
        let halted = AtomicBool::new(false);
        progress.set_total(T::ENTITY, records.len() as u64);
        info!(batches, workers = self.workers, "loading");

        let outcomes: Vec<Option<BatchResult>> = self.pool.install(|| {
            records
                .par_chunks(batch_size)
                .enumerate()
                .map(|(batch_id, batch)| {
                    if cancel.is_cancelled() || halted.load(Ordering::SeqCst) {
                        return None;
                    }
                    let result = match self.run_batch(batch_id, batch, sink) {
                        BatchOutcome::Committed(result) => {
                            consecutive.store(0, Ordering::SeqCst);
                            result
                        }
                        BatchOutcome::Exhausted(result) => {
                            if consecutive.fetch_add(1, Ordering::SeqCst) + 1 >= self.workers {
                                halted.store(true, Ordering::SeqCst);
                            }
                            result
                        }
                    };
                    progress.merge(T::ENTITY, &result);
                    Some(result)
                })
                .collect()
        });

        if halted.load(Ordering::SeqCst) {
            return Err(ImportError::SinkUnavailable {
                consecutive_failures: consecutive.load(Ordering::SeqCst),
            });
        }

        let mut report = LoadReport {
            batches,
            ..LoadReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Some(result) => {
                    report.attempted += result.attempted as u64;
                    report.succeeded += result.succeeded as u64;
                    report.failed += result.failed.len() as u64;
                    report.results.push(result);
                }
                None => report.skipped_batches += 1,
            }
        }
        if report.skipped_batches > 0 {
            warn!(skipped = report.skipped_batches, "load cancelled");
        }
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            "load finished"
        );
        Ok(report)
    }
}
