use crate::cache::error::CacheError;
use crate::cache::storage::StorageId;

/// What a [`Job`] asks the cache/disk subsystem to do.
///
/// Only the first four touch the block cache directly; the rest pass through
/// the outer disk-job queue untouched and are listed here so a `Job` can
/// represent the full ingress contract described by the cache's external
/// interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Read,
    Write,
    Hash,
    ReadAndHash,
    MoveStorage,
    ReleaseFiles,
    DeleteFiles,
    CheckFastresume,
    CheckFiles,
    SaveResumeData,
    RenameFile,
    AbortThread,
    ClearReadCache,
    FinalizeFile,
}

impl JobAction {
    /// Whether the block cache's job-gating logic in `mark_as_done` applies
    /// to this action at all. Everything else is opaque to the cache.
    pub fn touches_cache(self) -> bool {
        matches!(
            self,
            JobAction::Read | JobAction::Write | JobAction::Hash | JobAction::ReadAndHash
        )
    }
}

/// A caller request attached to a piece until its gating condition clears.
///
/// `buffer` is taken by the cache on `add_dirty_block` (the cache becomes the
/// sole owner of the written bytes), so a job sitting in a piece's job list
/// never carries one.
#[derive(Debug)]
pub struct Job {
    pub action: JobAction,
    pub storage: StorageId,
    pub piece: u32,
    pub offset: u32,
    pub buffer_size: u32,
    pub buffer: Option<Vec<u8>>,
    pub cache_min_time: u32,
    pub error: Option<CacheError>,
}

impl Job {
    pub fn new(action: JobAction, storage: StorageId, piece: u32, offset: u32, buffer_size: u32) -> Self {
        Self {
            action,
            storage,
            piece,
            offset,
            buffer_size,
            buffer: None,
            cache_min_time: 0,
            error: None,
        }
    }

    pub fn with_buffer(mut self, buffer: Vec<u8>) -> Self {
        self.buffer_size = buffer.len() as u32;
        self.buffer = Some(buffer);
        self
    }

    pub fn with_cache_min_time(mut self, secs: u32) -> Self {
        self.cache_min_time = secs;
        self
    }

    /// First block index this job's byte range touches.
    pub fn first_block(&self, block_size: u32) -> u32 {
        self.offset / block_size
    }

    /// Last (inclusive) block index this job's byte range touches.
    pub fn last_block(&self, block_size: u32) -> u32 {
        (self.offset + self.buffer_size.saturating_sub(1)) / block_size
    }
}

/// Outcome posted to a job's callback: either the number of bytes served, or
/// the sentinel error explaining why not.
pub type JobResult = Result<u32, CacheError>;
