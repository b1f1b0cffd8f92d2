use thiserror::Error;

/// Sentinel outcomes of a cache operation.
///
/// The original disk I/O subsystem this crate's cache is modeled on returns
/// small negative integers from these same call sites (`-1` not cached, `-2`
/// out of memory, and so on). Here each sentinel is its own variant so
/// callers can match on it instead of remembering magic numbers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The requested range isn't resident (or a required block is pending).
    /// Caller should fall back to `allocate_pending` or read storage
    /// directly.
    #[error("not cached")]
    NotCached,

    /// A buffer allocation failed. Transient; retry once more memory is
    /// available.
    #[error("out of memory")]
    OutOfMemory,

    /// Admission would exceed `max_size` and eviction couldn't free enough
    /// room. Caller should bypass the cache for this job.
    #[error("out of cache space")]
    OutOfCacheSpace,

    /// A `read_and_hash`/`hash` job's piece hash didn't match the expected
    /// hash from torrent metadata. The piece has been reported failed to the
    /// storage collaborator.
    #[error("piece hash mismatch")]
    HashMismatch,

    /// The storage layer reported an I/O failure for this job's range.
    #[error("storage I/O error: {0}")]
    Io(IoErrorKind),

    /// `abort_dirty` canceled this write before it reached storage.
    #[error("operation aborted")]
    Aborted,
}

/// `std::io::Error` isn't `Clone`/`Eq`, but `CacheError` needs to be (it's
/// copied into completed jobs and compared in tests), so only the kind is
/// carried across the job boundary. The original `error_code` is still
/// available to the caller through the storage collaborator's own error
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoErrorKind(pub std::io::ErrorKind);

impl std::fmt::Display for IoErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(IoErrorKind(err.kind()))
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
