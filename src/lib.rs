pub mod bitfield;
pub mod cache;
pub mod create;
pub mod db;
pub mod dot_torrent;
pub mod download;
pub mod logging;
pub mod peer;
pub mod piece;
pub mod state;
pub mod tracker;

// block size used by the peer-wire/download path (requests, piece framing)
pub(crate) const BLOCK_MAX: usize = 1 << 14; // 16384 (16kb)
