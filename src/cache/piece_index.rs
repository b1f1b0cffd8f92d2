use crate::cache::entry::{PieceEntry, PieceKey};
use crate::cache::storage::StorageId;
use std::collections::BTreeMap;

/// Dual-keyed collection of piece entries (spec §2 "Piece index", §9 "Dual-index
/// piece collection"): an arena of entries, one ordered index over `(storage,
/// piece)` for point lookup and ordered range scans, and a second ordered index
/// over `expire` for oldest-first LRU eviction.
#[derive(Default)]
pub struct PieceIndex {
    slab: Vec<Option<PieceEntry>>,
    free: Vec<usize>,
    by_key: BTreeMap<PieceKey, usize>,
    by_expire: BTreeMap<(i64, PieceKey), usize>,
}

impl PieceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&PieceEntry> {
        self.slab.get(slot).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut PieceEntry> {
        self.slab.get_mut(slot).and_then(|e| e.as_mut())
    }

    /// `find(storage, piece)` from spec §4.1 — point lookup, O(log n).
    pub fn find(&self, key: PieceKey) -> Option<usize> {
        self.by_key.get(&key).copied()
    }

    pub fn insert(&mut self, entry: PieceEntry) -> usize {
        let key = entry.key;
        let expire = entry.expire;
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot] = Some(entry);
                slot
            }
            None => {
                self.slab.push(Some(entry));
                self.slab.len() - 1
            }
        };
        self.by_key.insert(key, slot);
        self.by_expire.insert((expire, key), slot);
        slot
    }

    /// Removes and returns the entry at `slot`. Spec §3 invariant 6: callers
    /// must only do this once `num_blocks` has fallen to zero.
    pub fn remove(&mut self, slot: usize) -> Option<PieceEntry> {
        let entry = self.slab.get_mut(slot)?.take()?;
        self.by_key.remove(&entry.key);
        self.by_expire.remove(&(entry.expire, entry.key));
        self.free.push(slot);
        Some(entry)
    }

    /// Re-files `slot` in the expire index after its `expire` field changes
    /// (e.g. on a cache hit refreshing residency).
    pub fn touch(&mut self, slot: usize, new_expire: i64) {
        let Some(entry) = self.slab.get_mut(slot).and_then(|e| e.as_mut()) else {
            return;
        };
        let key = entry.key;
        let old_expire = entry.expire;
        if old_expire == new_expire {
            return;
        }
        self.by_expire.remove(&(old_expire, key));
        entry.expire = new_expire;
        self.by_expire.insert((new_expire, key), slot);
    }

    /// `pieces_for_storage(storage)` from spec §4.1 — ordered range over every
    /// piece of the given storage.
    pub fn pieces_for_storage(&self, storage: StorageId) -> impl Iterator<Item = usize> + '_ {
        let lo = PieceKey { storage, piece: u32::MIN };
        let hi = PieceKey { storage, piece: u32::MAX };
        self.by_key.range(lo..=hi).map(|(_, &slot)| slot)
    }

    /// Oldest-first walk of the LRU index, for eviction (spec §4.6).
    pub fn oldest_first(&self) -> impl Iterator<Item = usize> + '_ {
        self.by_expire.values().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceEntry> {
        self.slab.iter().filter_map(|e| e.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::Storage;
    use std::sync::Arc;

    struct NullStorage;

    #[async_trait::async_trait]
    impl Storage for NullStorage {
        fn piece_size(&self, _piece: u32) -> u32 {
            32768
        }
        fn hash_for_piece(&self, _piece: u32) -> [u8; 20] {
            [0u8; 20]
        }
        async fn hash_for_piece_impl(&self, _piece: u32) -> std::io::Result<[u8; 20]> {
            Ok([0u8; 20])
        }
        fn mark_failed(&self, _piece: u32) {}
        fn has_fence(&self) -> bool {
            false
        }
        fn lower_fence(&self) {}
        fn settings(&self) -> crate::cache::storage::StorageSettings {
            Default::default()
        }
    }

    fn entry(storage: u64, piece: u32, expire: i64) -> PieceEntry {
        let key = PieceKey { storage: StorageId(storage), piece };
        PieceEntry::new(key, Arc::new(NullStorage), 2, expire)
    }

    #[test]
    fn find_and_remove_roundtrip() {
        let mut idx = PieceIndex::new();
        let key = PieceKey { storage: StorageId(1), piece: 5 };
        let slot = idx.insert(entry(1, 5, 10));
        assert_eq!(idx.find(key), Some(slot));
        let removed = idx.remove(slot).unwrap();
        assert_eq!(removed.key, key);
        assert_eq!(idx.find(key), None);
    }

    #[test]
    fn oldest_first_respects_expire_order() {
        let mut idx = PieceIndex::new();
        let a = idx.insert(entry(1, 0, 30));
        let b = idx.insert(entry(1, 1, 10));
        let c = idx.insert(entry(1, 2, 20));
        let order: Vec<_> = idx.oldest_first().collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn pieces_for_storage_filters_by_storage() {
        let mut idx = PieceIndex::new();
        idx.insert(entry(1, 0, 0));
        idx.insert(entry(1, 1, 0));
        idx.insert(entry(2, 0, 0));
        let keys: Vec<_> = idx
            .pieces_for_storage(StorageId(1))
            .map(|slot| idx.get(slot).unwrap().key)
            .collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.storage == StorageId(1)));
    }

    #[test]
    fn touch_reorders_lru() {
        let mut idx = PieceIndex::new();
        let a = idx.insert(entry(1, 0, 1));
        let b = idx.insert(entry(1, 1, 2));
        assert_eq!(idx.oldest_first().collect::<Vec<_>>(), vec![a, b]);
        idx.touch(a, 100);
        assert_eq!(idx.oldest_first().collect::<Vec<_>>(), vec![b, a]);
    }
}
