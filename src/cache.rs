//! Per-process record cache (spec §4.6): a fixed-size LRU keyed on
//! `(file_id, id)`, validated against a per-file `upd_ct` snapshot taken
//! at insertion time.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::instrument;

#[derive(Debug, Clone)]
struct Entry {
    file_id: u16,
    id: Vec<u8>,
    upd_ct: u64,
    data: Vec<u8>,
}

/// The LRU itself: a `Vec`-backed slab with the most-recently-used entry
/// at the front, mirroring spec §4.6's "moves to the head on hit,
/// evicts the tail on insert" policy.
struct Lru {
    capacity: usize,
    entries: Vec<Entry>,
    index: HashMap<(u16, Vec<u8>), usize>,
}

impl Lru {
    fn new(capacity: usize) -> Lru {
        Lru { capacity, entries: Vec::with_capacity(capacity), index: HashMap::new() }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (pos, entry) in self.entries.iter().enumerate() {
            self.index.insert((entry.file_id, entry.id.clone()), pos);
        }
    }

    fn get(&mut self, file_id: u16, id: &[u8], current_upd_ct: u64) -> Option<Vec<u8>> {
        let key = (file_id, id.to_vec());
        let pos = *self.index.get(&key)?;
        if self.entries[pos].upd_ct != current_upd_ct {
            // Stale: file has been mutated since this entry was cached.
            // Left for natural eviction rather than removed immediately,
            // per spec §4.6.
            return None;
        }
        let entry = self.entries.remove(pos);
        let data = entry.data.clone();
        self.entries.insert(0, entry);
        self.rebuild_index();
        Some(data)
    }

    fn insert(&mut self, file_id: u16, id: Vec<u8>, upd_ct: u64, data: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        let key = (file_id, id.clone());
        if let Some(&pos) = self.index.get(&key) {
            self.entries.remove(pos);
        }
        self.entries.insert(0, Entry { file_id, id, upd_ct, data });
        if self.entries.len() > self.capacity {
            self.entries.pop();
        }
        self.rebuild_index();
    }

    fn invalidate_file(&mut self, file_id: u16) {
        self.entries.retain(|e| e.file_id != file_id);
        self.rebuild_index();
    }

    fn invalidate_record(&mut self, file_id: u16, id: &[u8]) {
        self.entries.retain(|e| !(e.file_id == file_id && e.id == id));
        self.rebuild_index();
    }
}

/// Process-wide record cache (spec §4.6). Disabled (capacity 0) unless
/// `PCfg::reccache` (§6) configures a size. Guarded by a `Mutex` since
/// record reads can come from multiple threads sharing one process image
/// even though DH file mutation itself is single-threaded per §5.
pub struct RecordCache {
    lru: Mutex<Lru>,
}

impl RecordCache {
    /// `capacity` is `PCfg::reccache`, range 0..32 per §6 (0 disables the
    /// cache entirely).
    pub fn new(capacity: u8) -> RecordCache {
        RecordCache { lru: Mutex::new(Lru::new(capacity as usize)) }
    }

    /// Looks up `(file_id, id)`, validating against `current_upd_ct`
    /// (the file's live update counter, §3.4). Moves the entry to the
    /// head on a hit.
    #[instrument(skip(self, id), fields(file_id))]
    pub fn get(&self, file_id: u16, id: &[u8], current_upd_ct: u64) -> Option<Vec<u8>> {
        let result = self.lru.lock().get(file_id, id, current_upd_ct);
        trace!(file_id, hit = result.is_some(), "record cache lookup");
        result
    }

    pub fn insert(&self, file_id: u16, id: &[u8], upd_ct: u64, data: &[u8]) {
        self.lru.lock().insert(file_id, id.to_vec(), upd_ct, data.to_vec());
    }

    /// Drops the cached entry for `(file_id, id)`, used after a write or
    /// delete so a stale payload under the old `upd_ct` can't linger
    /// until natural eviction.
    pub fn invalidate_record(&self, file_id: u16, id: &[u8]) {
        self.lru.lock().invalidate_record(file_id, id);
    }

    /// Drops every cached entry for `file_id`, used on `CLEARFILE` or
    /// file close so later opens can't see stale data under a reused
    /// file_id slot.
    pub fn invalidate_file(&self, file_id: u16) {
        self.lru.lock().invalidate_file(file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_requires_matching_upd_ct() {
        let cache = RecordCache::new(4);
        cache.insert(1, b"CUST1", 5, b"hello");
        assert_eq!(cache.get(1, b"CUST1", 5), Some(b"hello".to_vec()));
        assert_eq!(cache.get(1, b"CUST1", 6), None);
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = RecordCache::new(0);
        cache.insert(1, b"CUST1", 5, b"hello");
        assert_eq!(cache.get(1, b"CUST1", 5), None);
    }

    #[test]
    fn insert_evicts_tail_past_capacity() {
        let cache = RecordCache::new(2);
        cache.insert(1, b"A", 1, b"a");
        cache.insert(1, b"B", 1, b"b");
        cache.insert(1, b"C", 1, b"c");
        assert_eq!(cache.get(1, b"A", 1), None);
        assert_eq!(cache.get(1, b"C", 1), Some(b"c".to_vec()));
    }

    #[test]
    fn invalidate_file_clears_only_that_files_entries() {
        let cache = RecordCache::new(4);
        cache.insert(1, b"A", 1, b"a");
        cache.insert(2, b"A", 1, b"a2");
        cache.invalidate_file(1);
        assert_eq!(cache.get(1, b"A", 1), None);
        assert_eq!(cache.get(2, b"A", 1), Some(b"a2".to_vec()));
    }

    #[test]
    fn invalidate_record_clears_only_that_key() {
        let cache = RecordCache::new(4);
        cache.insert(1, b"A", 1, b"a");
        cache.insert(1, b"B", 1, b"b");
        cache.invalidate_record(1, b"A");
        assert_eq!(cache.get(1, b"A", 1), None);
        assert_eq!(cache.get(1, b"B", 1), Some(b"b".to_vec()));
    }
}
