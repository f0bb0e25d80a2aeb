use crate::primitive::ElementKind;
use std::path::PathBuf;
use thiserror::Error;

/// A single block of the source could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed block #{index}: {reason}")]
pub struct MalformedBlockError {
    pub index: u64,
    pub reason: String,
    /// Framing errors leave the remainder of the stream unreadable.
    pub fatal_to_stream: bool,
}

/// Too large a share of the source blocks was malformed to trust the output.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{malformed} of {total} blocks malformed, above the tolerated fraction {max_fraction}")]
pub struct CorruptSourceError {
    pub malformed: u64,
    pub total: u64,
    pub max_fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncompleteReason {
    OpenChain { start: [f64; 2], end: [f64; 2] },
    DegenerateRing { points: usize },
    MissingMember { kind: ElementKind, id: i64 },
    CyclicRelation { id: i64 },
}

impl std::fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncompleteReason::OpenChain { start, end } => write!(
                f,
                "chain from {},{} to {},{} does not close",
                start[0], start[1], end[0], end[1]
            ),
            IncompleteReason::DegenerateRing { points } => {
                write!(f, "closed ring has only {} points", points)
            }
            IncompleteReason::MissingMember { kind, id } => {
                write!(f, "member {} {} could not be resolved", kind, id)
            }
            IncompleteReason::CyclicRelation { id } => {
                write!(f, "relation {} was reached twice", id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("relation {relation_id} has incomplete geometry: {reason}")]
pub struct IncompleteGeometryError {
    pub relation_id: i64,
    pub reason: IncompleteReason,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} {id} references missing {missing_kind} {missing_id}")]
pub struct UnresolvedReferenceError {
    pub kind: ElementKind,
    pub id: i64,
    pub missing_kind: ElementKind,
    pub missing_id: i64,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("batch {batch_id} could not commit after {attempts} attempts: {reason}")]
pub struct BatchCommitError {
    pub batch_id: usize,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("record {key} rejected: {reason}")]
pub struct RecordRejectedError {
    pub key: String,
    pub reason: String,
}

/// Errors that end a run. Everything local to one block, geometry or record
/// is recorded in the issue log instead.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to open {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    CorruptSource(#[from] CorruptSourceError),
    #[error("record sink unavailable: {consecutive_failures} consecutive batches exhausted their retries")]
    SinkUnavailable { consecutive_failures: usize },
    #[error("failed to prepare record sink: {0}")]
    SinkSetup(String),
    #[error("failed to load dataset {path:?}: {reason}")]
    Dataset { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to build worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}
