use crate::error::{
    IncompleteGeometryError, MalformedBlockError, RecordRejectedError, UnresolvedReferenceError,
};
use serde::Serialize;
use std::sync::Mutex;
use tracing::warn;

const RETAINED_PER_KIND: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IssueCounts {
    pub malformed_blocks: u64,
    pub unresolved_references: u64,
    pub incomplete_geometries: u64,
    pub rejected_records: u64,
    pub unresolved_city_countries: u64,
}

#[derive(Debug, Default)]
struct Retained {
    malformed: Vec<MalformedBlockError>,
    unresolved: Vec<UnresolvedReferenceError>,
    incomplete: Vec<IncompleteGeometryError>,
    rejected: Vec<RecordRejectedError>,
}

#[derive(Debug, Default)]
pub struct IssueLog {
    counts: Mutex<IssueCounts>,
    retained: Mutex<Retained>,
}

fn retain<T>(list: &mut Vec<T>, item: T) {
    if list.len() < RETAINED_PER_KIND {
        list.push(item);
    }
}

impl IssueLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, update: impl FnOnce(&mut IssueCounts)) {
        if let Ok(mut counts) = self.counts.lock() {
            update(&mut counts);
        }
    }

    fn keep(&self, update: impl FnOnce(&mut Retained)) {
        if let Ok(mut retained) = self.retained.lock() {
            update(&mut retained);
        }
    }

    pub fn malformed_block(&self, err: MalformedBlockError) {
        warn!(block = err.index, reason = %err.reason, "skipping malformed block");
        self.bump(|counts| counts.malformed_blocks += 1);
        self.keep(|retained| retain(&mut retained.malformed, err));
    }

    pub fn unresolved_reference(&self, err: UnresolvedReferenceError) {
        warn!(
            kind = %err.kind,
            id = err.id,
            missing_kind = %err.missing_kind,
            missing_id = err.missing_id,
            "excluding primitive with unresolved reference"
        );
        self.bump(|counts| counts.unresolved_references += 1);
        self.keep(|retained| retain(&mut retained.unresolved, err));
    }

    pub fn incomplete_geometry(&self, err: IncompleteGeometryError) {
        warn!(relation = err.relation_id, reason = %err.reason, "incomplete geometry");
        self.bump(|counts| counts.incomplete_geometries += 1);
        self.keep(|retained| retain(&mut retained.incomplete, err));
    }

    pub fn rejected_record(&self, err: RecordRejectedError) {
        warn!(key = %err.key, reason = %err.reason, "record rejected");
        self.bump(|counts| counts.rejected_records += 1);
        self.keep(|retained| retain(&mut retained.rejected, err));
    }

    pub fn unresolved_city_country(&self) {
        self.bump(|counts| counts.unresolved_city_countries += 1);
    }

    pub fn counts(&self) -> IssueCounts {
        self.counts
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default()
    }

    pub fn incomplete_geometries(&self) -> Vec<IncompleteGeometryError> {
        self.retained
            .lock()
            .map(|retained| retained.incomplete.clone())
            .unwrap_or_default()
    }

    pub fn unresolved_references(&self) -> Vec<UnresolvedReferenceError> {
        self.retained
            .lock()
            .map(|retained| retained.unresolved.clone())
            .unwrap_or_default()
    }

    pub fn malformed_blocks(&self) -> Vec<MalformedBlockError> {
        self.retained
            .lock()
            .map(|retained| retained.malformed.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IncompleteReason;

    #[test]
    fn counts_beyond_retained_samples() {
        let issues = IssueLog::new();
        for relation_id in 0..(RETAINED_PER_KIND as i64 + 5) {
            issues.incomplete_geometry(IncompleteGeometryError {
                relation_id,
                reason: IncompleteReason::DegenerateRing { points: 3 },
            });
        }
        assert_eq!(
            issues.counts().incomplete_geometries,
            RETAINED_PER_KIND as u64 + 5
        );
        assert_eq!(issues.incomplete_geometries().len(), RETAINED_PER_KIND);
    }
}
