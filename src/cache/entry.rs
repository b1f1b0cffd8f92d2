use crate::cache::job::Job;
use crate::cache::storage::{Storage, StorageId};
use std::collections::VecDeque;
use std::sync::Arc;

/// One fixed-size unit of caching (spec §3, "Block").
#[derive(Debug, Default)]
pub struct Block {
    pub buffer: Option<Vec<u8>>,
    pub dirty: bool,
    pub pending: bool,
    pub uninitialized: bool,
    pub refcount: u32,
}

impl Block {
    pub fn is_resident(&self) -> bool {
        self.buffer.is_some()
    }
}

/// Dual-keyed identity of a cached piece: `(storage, piece index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceKey {
    pub storage: StorageId,
    pub piece: u32,
}

/// The cached representation of one torrent piece (spec §3, "Piece entry").
pub struct PieceEntry {
    pub key: PieceKey,
    pub storage: Arc<dyn Storage>,
    /// Wall-clock timestamp (unix seconds) after which this piece is
    /// preferentially evicted. Refreshed upward on every touch.
    pub expire: i64,
    pub blocks: Vec<Block>,
    pub num_blocks: u32,
    pub num_dirty: u32,
    pub jobs: VecDeque<Job>,
    pub marked_for_deletion: bool,
}

impl PieceEntry {
    pub fn new(key: PieceKey, storage: Arc<dyn Storage>, blocks_in_piece: u32, expire: i64) -> Self {
        let mut blocks = Vec::with_capacity(blocks_in_piece as usize);
        blocks.resize_with(blocks_in_piece as usize, Block::default);
        Self {
            key,
            storage,
            expire,
            blocks,
            num_blocks: 0,
            num_dirty: 0,
            jobs: VecDeque::new(),
            marked_for_deletion: false,
        }
    }

    pub fn blocks_in_piece(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Sum of every block's refcount — the piece-level pin count.
    pub fn refcount(&self) -> u32 {
        self.blocks.iter().map(|b| b.refcount).sum()
    }

    pub fn is_pinned(&self) -> bool {
        self.refcount() > 0
    }

    pub fn is_fully_resident(&self) -> bool {
        self.num_blocks == self.blocks_in_piece()
    }
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
