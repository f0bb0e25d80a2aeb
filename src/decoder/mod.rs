use crate::error::{CorruptSourceError, ImportError, MalformedBlockError};
use crate::issues::IssueLog;
use crate::primitive::RawPrimitive;
use crate::progress::{EntityKind, ProgressAggregator};
use osmpbfreader::{blocks, primitive_block_from_blob, OsmPbfReader};
use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Block = Vec<RawPrimitive>;

pub type BlockStream<'a> = Box<dyn Iterator<Item = Result<Block, MalformedBlockError>> + 'a>;

/// A re-openable stream of primitive blocks.
pub trait PrimitiveSource: Sync {
    fn open(&self) -> Result<BlockStream<'_>, ImportError>;

    /// Bytes consumed by the most recently opened stream.
    fn consumed(&self) -> Option<u64> {
        None
    }

    fn size_hint(&self) -> Option<u64> {
        None
    }
}

struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.count.fetch_add(read as u64, Ordering::Relaxed);
        Ok(read)
    }
}

pub struct PbfFile {
    path: PathBuf,
    size: Option<u64>,
    consumed: Arc<AtomicU64>,
}

impl PbfFile {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref().to_path_buf();
        let size = std::fs::metadata(&path)
            .map_err(|source| ImportError::Open {
                path: path.clone(),
                source,
            })?
            .len();
        Ok(PbfFile {
            path,
            size: Some(size),
            consumed: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl PrimitiveSource for PbfFile {
    fn open(&self) -> Result<BlockStream<'_>, ImportError> {
        let file = File::open(&self.path).map_err(|source| ImportError::Open {
            path: self.path.clone(),
            source,
        })?;
        self.consumed.store(0, Ordering::Relaxed);
        let reader = CountingReader {
            inner: BufReader::new(file),
            count: self.consumed.clone(),
        };
        Ok(Box::new(PbfBlocks {
            reader: OsmPbfReader::new(reader),
            index: 0,
            done: false,
        }))
    }

    fn consumed(&self) -> Option<u64> {
        Some(self.consumed.load(Ordering::Relaxed))
    }

    fn size_hint(&self) -> Option<u64> {
        self.size
    }
}

struct PbfBlocks<R: Read> {
    reader: OsmPbfReader<R>,
    index: u64,
    done: bool,
}

impl<R: Read> Iterator for PbfBlocks<R> {
    type Item = Result<Block, MalformedBlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let index = self.index;
        self.index += 1;
        let blob = match self.reader.blobs().next() {
            None => {
                self.done = true;
                return None;
            }
            Some(Err(err)) => {
                self.done = true;
                return Some(Err(MalformedBlockError {
                    index,
                    reason: err.to_string(),
                    fatal_to_stream: true,
                }));
            }
            Some(Ok(blob)) => blob,
        };
        let decoded: Result<Block, MalformedBlockError> = primitive_block_from_blob(&blob)
            .map(|block| blocks::iter(&block).map(RawPrimitive::from).collect())
            .map_err(|err| MalformedBlockError {
                index,
                reason: err.to_string(),
                fatal_to_stream: false,
            });
        Some(decoded)
    }
}

/// In-memory source; `None` entries stand for blocks that fail to decode.
/// Each block counts as one byte of input.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    blocks: Vec<Option<Block>>,
    truncate_at: Option<usize>,
    consumed: Arc<AtomicU64>,
}

impl MemorySource {
    pub fn new(blocks: Vec<Option<Block>>) -> Self {
        MemorySource {
            blocks,
            ..MemorySource::default()
        }
    }

    pub fn single_block(primitives: Block) -> Self {
        Self::new(vec![Some(primitives)])
    }

    /// Cuts the stream at block `index` with a framing error.
    pub fn truncated_at(mut self, index: usize) -> Self {
        self.truncate_at = Some(index);
        self
    }
}

impl PrimitiveSource for MemorySource {
    fn open(&self) -> Result<BlockStream<'_>, ImportError> {
        let consumed = self.consumed.clone();
        consumed.store(0, Ordering::Relaxed);
        let truncate_at = self.truncate_at;
        let end = truncate_at.map_or(self.blocks.len(), |index| index.saturating_add(1));
        let blocks = self
            .blocks
            .iter()
            .enumerate()
            .take(end)
            .map(move |(index, block)| {
                consumed.fetch_add(1, Ordering::Relaxed);
                if truncate_at == Some(index) {
                    return Err(MalformedBlockError {
                        index: index as u64,
                        reason: "unreadable blob header".into(),
                        fatal_to_stream: true,
                    });
                }
                block.clone().ok_or_else(|| MalformedBlockError {
                    index: index as u64,
                    reason: "corrupt test block".into(),
                    fatal_to_stream: false,
                })
            });
        Ok(Box::new(blocks))
    }

    fn consumed(&self) -> Option<u64> {
        Some(self.consumed.load(Ordering::Relaxed))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.blocks.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub blocks: u64,
    pub malformed: u64,
    pub primitives: u64,
}

/// Lazy primitive sequence over one scan of a source.
pub struct Primitives<'a> {
    source: &'a dyn PrimitiveSource,
    blocks: BlockStream<'a>,
    current: std::vec::IntoIter<RawPrimitive>,
    stats: ScanStats,
    max_corrupt_fraction: f64,
    issues: Option<&'a IssueLog>,
    progress: Option<(&'a ProgressAggregator<'a>, &'static str)>,
    truncated: bool,
    finished: bool,
}

impl<'a> Primitives<'a> {
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Blocks lost behind a framing error, estimated from the unread bytes
    /// and the mean size of the blocks read. `None` when the source cannot
    /// tell how much is left.
    fn lost_blocks(&self) -> Option<u64> {
        if !self.truncated {
            return Some(0);
        }
        let consumed = self.source.consumed()?;
        let unread = self.source.size_hint()?.saturating_sub(consumed);
        if unread == 0 {
            return Some(0);
        }
        let read = (self.stats.blocks + self.stats.malformed).max(1);
        let per_block = (consumed / read).max(1);
        Some((unread + per_block - 1) / per_block)
    }

    fn check_corruption(&self) -> Result<(), CorruptSourceError> {
        let lost = self.lost_blocks();
        let malformed = self.stats.malformed + lost.unwrap_or(0);
        let total = self.stats.blocks + malformed;
        if malformed == 0 {
            return Ok(());
        }
        let fraction = malformed as f64 / total as f64;
        if lost.is_none() || fraction > self.max_corrupt_fraction {
            return Err(CorruptSourceError {
                malformed,
                total,
                max_fraction: self.max_corrupt_fraction,
            });
        }
        Ok(())
    }

    fn report(&self) {
        if let (Some((progress, stage)), Some(consumed)) = (self.progress, self.source.consumed())
        {
            progress.observe(EntityKind::SourceBytes, stage, consumed);
        }
    }
}

impl<'a> Iterator for Primitives<'a> {
    type Item = Result<RawPrimitive, CorruptSourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(primitive) = self.current.next() {
                self.stats.primitives += 1;
                return Some(Ok(primitive));
            }
            if self.finished {
                return None;
            }
            match self.blocks.next() {
                Some(Ok(block)) => {
                    self.stats.blocks += 1;
                    self.current = block.into_iter();
                    self.report();
                }
                Some(Err(err)) => {
                    self.stats.malformed += 1;
                    self.truncated |= err.fatal_to_stream;
                    if let Some(issues) = self.issues {
                        issues.malformed_block(err);
                    }
                }
                None => {
                    self.finished = true;
                    self.report();
                    if let Err(err) = self.check_corruption() {
                        return Some(Err(err));
                    }
                    return None;
                }
            }
        }
    }
}

pub struct PrimitiveDecoder<'a> {
    source: &'a dyn PrimitiveSource,
    max_corrupt_fraction: f64,
    issues: &'a IssueLog,
    progress: Option<&'a ProgressAggregator<'a>>,
    scans: Cell<u32>,
}

impl<'a> PrimitiveDecoder<'a> {
    pub fn new(
        source: &'a dyn PrimitiveSource,
        max_corrupt_fraction: f64,
        issues: &'a IssueLog,
    ) -> Self {
        PrimitiveDecoder {
            source,
            max_corrupt_fraction,
            issues,
            progress: None,
            scans: Cell::new(0),
        }
    }

    pub fn with_progress(mut self, progress: &'a ProgressAggregator<'a>) -> Self {
        if let Some(size) = self.source.size_hint() {
            progress.set_total(EntityKind::SourceBytes, size);
        }
        self.progress = Some(progress);
        self
    }

    /// Starts a fresh scan from the beginning of the source. Malformed blocks
    /// are recorded during the first scan only.
    pub fn primitives(&self, stage: &'static str) -> Result<Primitives<'a>, ImportError> {
        let scan = self.scans.get();
        self.scans.set(scan + 1);
        Ok(Primitives {
            source: self.source,
            blocks: self.source.open()?,
            current: Vec::new().into_iter(),
            stats: ScanStats::default(),
            max_corrupt_fraction: self.max_corrupt_fraction,
            issues: if scan == 0 { Some(self.issues) } else { None },
            progress: self.progress.map(|progress| (progress, stage)),
            truncated: false,
            finished: false,
        })
    }

    /// Runs one full scan, handing every primitive to `visit`.
    pub fn scan<F>(&self, stage: &'static str, mut visit: F) -> Result<ScanStats, ImportError>
    where
        F: FnMut(RawPrimitive),
    {
        let mut primitives = self.primitives(stage)?;
        for primitive in primitives.by_ref() {
            visit(primitive?);
        }
        Ok(primitives.stats())
    }
}
