use crate::cache::job::{Job, JobResult};
use async_trait::async_trait;

/// Opaque handle identifying a storage collaborator. Pieces key off
/// `(StorageId, piece index)`; the cache never looks inside it.
///
/// Stands in for the shared-ownership storage handle the original cache
/// holds a strong reference to for as long as any piece references it (see
/// spec §5, "Shared resources"). Borrowed torrents each get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u64);

/// Settings the storage collaborator exposes that affect cache behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageSettings {
    pub disable_hash_checks: bool,
}

/// The storage collaborator the cache delegates actual disk I/O and piece
/// metadata to. None of its methods are implemented by the cache crate
/// itself — this is the contract an owning disk-coordinator task fulfills.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Size in bytes of the given piece (the last piece in a torrent is
    /// usually shorter than the rest).
    fn piece_size(&self, piece: u32) -> u32;

    /// Expected SHA-1 digest for a piece, from torrent metadata.
    fn hash_for_piece(&self, piece: u32) -> [u8; 20];

    /// Synchronously (re-)computes a piece's hash from disk. May block on
    /// I/O; callers run it on a blocking-safe context (see
    /// `cache::hasher::hash_piece_via_storage`).
    async fn hash_for_piece_impl(&self, piece: u32) -> std::io::Result<[u8; 20]>;

    /// Reports that the given piece failed verification.
    fn mark_failed(&self, piece: u32);

    /// Whether a fence currently serializes destructive operations
    /// (move/delete/rename) against outstanding block I/O on this storage.
    fn has_fence(&self) -> bool;

    /// Lowers the fence once no piece of this storage has pending jobs.
    fn lower_fence(&self);

    fn settings(&self) -> StorageSettings;
}

/// A capability to post a job's completion callback for asynchronous
/// delivery, standing in for the outer session's completion executor (the
/// network reactor in the original design).
#[async_trait]
pub trait CompletionExecutor: Send + Sync {
    async fn post(&self, job: Job, result: JobResult);
}

/// A `CompletionExecutor` backed by an unbounded channel, useful for tests
/// and the demo binary where there's no real network reactor to re-enter.
pub struct ChannelExecutor {
    tx: tokio::sync::mpsc::UnboundedSender<(Job, JobResult)>,
}

impl ChannelExecutor {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(Job, JobResult)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CompletionExecutor for ChannelExecutor {
    async fn post(&self, job: Job, result: JobResult) {
        // the receiver may already be gone (e.g. in a test that only cares
        // about cache-internal state); that's not this executor's problem
        let _ = self.tx.send((job, result));
    }
}
