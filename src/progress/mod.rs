use crate::load::BatchResult;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    SourceBytes,
    Countries,
    Cities,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::SourceBytes => "source_bytes",
            EntityKind::Countries => "countries",
            EntityKind::Cities => "cities",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub entity: EntityKind,
    pub stage: &'static str,
    pub processed: u64,
    pub total_estimate: Option<u64>,
    pub elapsed: Duration,
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, update: &ProgressUpdate);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _update: &ProgressUpdate) {}
}

/// Emits progress as log events, at most once per interval for each stage.
pub struct LogProgress {
    interval: Duration,
    last: Mutex<HashMap<(EntityKind, &'static str), Instant>>,
}

impl LogProgress {
    pub fn new(interval: Duration) -> Self {
        LogProgress {
            interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    fn due(&self, update: &ProgressUpdate) -> bool {
        let finished = update.total_estimate == Some(update.processed);
        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(_) => return finished,
        };
        let now = Instant::now();
        let key = (update.entity, update.stage);
        let due = finished
            || last
                .get(&key)
                .map_or(true, |at| now.duration_since(*at) >= self.interval);
        if due {
            last.insert(key, now);
        }
        due
    }
}

impl ProgressSink for LogProgress {
    fn report(&self, update: &ProgressUpdate) {
        if !self.due(update) {
            return;
        }
        info!(
            entity = %update.entity,
            stage = update.stage,
            processed = update.processed,
            total = ?update.total_estimate,
            elapsed_s = update.elapsed.as_secs_f64(),
            "progress"
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadCounters {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Aggregates progress for one run and forwards it to a sink.
///
/// Load counters only ever grow: each completed `BatchResult` is merged
/// exactly once.
pub struct ProgressAggregator<'a> {
    sink: &'a dyn ProgressSink,
    started: Instant,
    totals: Mutex<BTreeMap<EntityKind, u64>>,
    counters: Mutex<BTreeMap<EntityKind, LoadCounters>>,
}

impl<'a> ProgressAggregator<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        ProgressAggregator {
            sink,
            started: Instant::now(),
            totals: Mutex::new(BTreeMap::new()),
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_total(&self, entity: EntityKind, total: u64) {
        if let Ok(mut totals) = self.totals.lock() {
            totals.insert(entity, total);
        }
    }

    fn total(&self, entity: EntityKind) -> Option<u64> {
        self.totals
            .lock()
            .ok()
            .and_then(|totals| totals.get(&entity).copied())
    }

    pub fn observe(&self, entity: EntityKind, stage: &'static str, processed: u64) {
        let update = ProgressUpdate {
            entity,
            stage,
            processed,
            total_estimate: self.total(entity),
            elapsed: self.started.elapsed(),
        };
        self.sink.report(&update);
    }

    /// Reports while holding the counters, so emitted values never go back.
    pub fn merge(&self, entity: EntityKind, result: &BatchResult) {
        if let Ok(mut counters) = self.counters.lock() {
            let entry = counters.entry(entity).or_default();
            entry.attempted += result.attempted as u64;
            entry.succeeded += result.succeeded as u64;
            entry.failed += result.failed.len() as u64;
            let processed = entry.attempted;
            self.observe(entity, "load", processed);
        }
    }

    pub fn counters(&self, entity: EntityKind) -> LoadCounters {
        self.counters
            .lock()
            .ok()
            .and_then(|counters| counters.get(&entity).copied())
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::load::{FailedRecord, FailureKind};
    use crate::record::RecordKey;

    #[derive(Default)]
    pub(crate) struct Recording(pub Mutex<Vec<ProgressUpdate>>);

    impl ProgressSink for Recording {
        fn report(&self, update: &ProgressUpdate) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    fn result(batch_id: usize, attempted: usize, failed: usize) -> BatchResult {
        BatchResult {
            batch_id,
            attempted,
            succeeded: attempted - failed,
            failed: (0..failed)
                .map(|n| FailedRecord {
                    key: RecordKey::Country(format!("X{}", n)),
                    kind: FailureKind::Rejected("test".into()),
                })
                .collect(),
        }
    }

    #[test]
    fn merges_batch_results_monotonically() {
        let sink = Recording::default();
        let progress = ProgressAggregator::new(&sink);
        progress.set_total(EntityKind::Countries, 7);
        progress.merge(EntityKind::Countries, &result(0, 4, 1));
        progress.merge(EntityKind::Countries, &result(1, 3, 0));

        let counters = progress.counters(EntityKind::Countries);
        assert_eq!(
            counters,
            LoadCounters {
                attempted: 7,
                succeeded: 6,
                failed: 1
            }
        );
        let updates = sink.0.lock().unwrap();
        let processed: Vec<u64> = updates.iter().map(|u| u.processed).collect();
        assert_eq!(processed, vec![4, 7]);
        assert!(updates.iter().all(|u| u.total_estimate == Some(7)));
        assert_eq!(progress.counters(EntityKind::Cities), LoadCounters::default());
    }

    #[test]
    fn log_progress_throttles_per_stage() {
        let log = LogProgress::new(Duration::from_secs(3600));
        let update = |processed| ProgressUpdate {
            entity: EntityKind::SourceBytes,
            stage: "scan",
            processed,
            total_estimate: Some(100),
            elapsed: Duration::from_secs(1),
        };
        assert!(log.due(&update(10)));
        assert!(!log.due(&update(20)));
        assert!(log.due(&update(100)));
    }
}
