//! Lock manager (spec §3.4, §4.7): group read/update locks and whole-file
//! locks, all drawn from one `LOCK_ENTRY` pool and tagged with the
//! holder's user number and transaction id so `unlock_txn` can release
//! everything a transaction held in one pass at commit or rollback.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::instrument;

use crate::error::{DeadlockSnafu, FileLockedSnafu, LockError, TableFullSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    GroupRead,
    GroupUpdate,
    File,
}

#[derive(Debug, Clone)]
struct LockSlot {
    file_id: u16,
    /// `None` for a file lock; `Some(group_no)` for a group lock.
    group_no: Option<u32>,
    kind: LockKind,
    holder_uid: u32,
    txn_id: u64,
}

/// One user's pending wait, tracked only while `deadlock` detection is
/// enabled (§4.7).
#[derive(Debug, Clone, Copy)]
struct Wait {
    waiter_uid: u32,
    holder_uid: u32,
}

struct Inner {
    slots: Vec<LockSlot>,
    waits: Vec<Wait>,
    limit: u32,
}

/// The lock manager (spec §4.7). `deadlock_detection` mirrors the
/// `DEADLOCK` config toggle (§6): when enabled, an acquire that would
/// complete a wait-for cycle is refused instead of left to block
/// forever.
pub struct LockManager {
    inner: Mutex<Inner>,
    pub deadlock_detection: bool,
}

impl LockManager {
    pub fn new(limit: u32, deadlock_detection: bool) -> LockManager {
        LockManager { inner: Mutex::new(Inner { slots: Vec::new(), waits: Vec::new(), limit }), deadlock_detection }
    }

    fn current_holders(inner: &Inner, file_id: u16, group_no: Option<u32>) -> Vec<u32> {
        inner
            .slots
            .iter()
            .filter(|s| s.file_id == file_id && s.group_no == group_no)
            .map(|s| s.holder_uid)
            .collect()
    }

    /// `true` if granting `waiter` a wait on `holder` would close a
    /// cycle in the wait-for graph (a holder that is itself, directly or
    /// transitively, waiting on `waiter`).
    fn would_deadlock(inner: &Inner, waiter_uid: u32, holder_uid: u32) -> bool {
        let mut frontier = vec![holder_uid];
        let mut seen = std::collections::HashSet::new();
        while let Some(uid) = frontier.pop() {
            if uid == waiter_uid {
                return true;
            }
            if !seen.insert(uid) {
                continue;
            }
            for wait in &inner.waits {
                if wait.waiter_uid == uid {
                    frontier.push(wait.holder_uid);
                }
            }
        }
        false
    }

    /// Acquires a group read lock (shared; multiple readers coexist).
    pub fn acquire_group_read(&self, file_id: u16, group_no: u32, uid: u32, txn_id: u64) -> Result<(), LockError> {
        self.acquire(file_id, Some(group_no), LockKind::GroupRead, uid, txn_id, true)
    }

    /// Acquires an exclusive group update lock.
    pub fn acquire_group_update(&self, file_id: u16, group_no: u32, uid: u32, txn_id: u64) -> Result<(), LockError> {
        self.acquire(file_id, Some(group_no), LockKind::GroupUpdate, uid, txn_id, false)
    }

    /// Acquires an exclusive whole-file lock (clearfile, exclusive open).
    pub fn acquire_file_lock(&self, file_id: u16, uid: u32, txn_id: u64) -> Result<(), LockError> {
        self.acquire(file_id, None, LockKind::File, uid, txn_id, false)
    }

    #[instrument(skip(self), fields(file_id, group_no, ?kind, uid))]
    fn acquire(&self, file_id: u16, group_no: Option<u32>, kind: LockKind, uid: u32, txn_id: u64, shareable: bool) -> Result<(), LockError> {
        let mut inner = self.inner.lock();
        let holders = Self::current_holders(&inner, file_id, group_no);
        let conflict = if shareable {
            // Shared read locks only conflict with an update/file lock.
            inner.slots.iter().any(|s| s.file_id == file_id && s.group_no == group_no && s.kind != LockKind::GroupRead)
        } else {
            !holders.is_empty()
        };

        if conflict {
            if self.deadlock_detection {
                for holder_uid in &holders {
                    if Self::would_deadlock(&inner, uid, *holder_uid) {
                        warn!(file_id, uid, holder_uid, "lock acquire would deadlock, refusing");
                        return DeadlockSnafu.fail();
                    }
                }
                inner.waits.extend(holders.iter().map(|&holder_uid| Wait { waiter_uid: uid, holder_uid }));
            }
            debug!(file_id, uid, "lock acquire blocked, conflicting holder present");
            return FileLockedSnafu.fail();
        }

        if inner.slots.len() as u32 >= inner.limit {
            warn!(file_id, limit = inner.limit, "lock table full");
            return TableFullSnafu { limit: inner.limit }.fail();
        }
        inner.slots.push(LockSlot { file_id, group_no, kind, holder_uid: uid, txn_id });
        inner.waits.retain(|w| w.waiter_uid != uid);
        trace!(file_id, uid, "lock acquired");
        Ok(())
    }

    pub fn release_group(&self, file_id: u16, group_no: u32, uid: u32) {
        let mut inner = self.inner.lock();
        inner.slots.retain(|s| !(s.file_id == file_id && s.group_no == Some(group_no) && s.holder_uid == uid));
    }

    pub fn release_file(&self, file_id: u16, uid: u32) {
        let mut inner = self.inner.lock();
        inner.slots.retain(|s| !(s.file_id == file_id && s.group_no.is_none() && s.holder_uid == uid));
    }

    /// `unlock_txn(txn_id)` (spec §4.7): releases every lock tagged with
    /// `txn_id`, called at commit and at rollback.
    pub fn unlock_txn(&self, txn_id: u64) {
        let mut inner = self.inner.lock();
        inner.slots.retain(|s| s.txn_id != txn_id);
    }

    pub fn held_by(&self, uid: u32) -> HashMap<u16, Vec<Option<u32>>> {
        let inner = self.inner.lock();
        let mut out: HashMap<u16, Vec<Option<u32>>> = HashMap::new();
        for slot in inner.slots.iter().filter(|s| s.holder_uid == uid) {
            out.entry(slot.file_id).or_default().push(slot.group_no);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_readers_share_a_group_read_lock() {
        let lm = LockManager::new(100, false);
        lm.acquire_group_read(1, 5, 10, 0).unwrap();
        lm.acquire_group_read(1, 5, 20, 0).unwrap();
    }

    #[test]
    fn update_lock_excludes_readers() {
        let lm = LockManager::new(100, false);
        lm.acquire_group_update(1, 5, 10, 0).unwrap();
        assert!(matches!(lm.acquire_group_read(1, 5, 20, 0), Err(LockError::FileLocked)));
    }

    #[test]
    fn unlock_txn_releases_all_its_locks() {
        let lm = LockManager::new(100, false);
        lm.acquire_group_update(1, 5, 10, 77).unwrap();
        lm.acquire_file_lock(2, 10, 77).unwrap();
        lm.unlock_txn(77);
        lm.acquire_group_update(1, 5, 20, 0).unwrap();
        lm.acquire_file_lock(2, 20, 0).unwrap();
    }

    #[test]
    fn deadlock_detection_rejects_cyclic_wait() {
        let lm = LockManager::new(100, true);
        lm.acquire_group_update(1, 1, 10, 0).unwrap();
        lm.acquire_group_update(1, 2, 20, 0).unwrap();
        // user 10 waits on user 20's group 2.
        assert!(matches!(lm.acquire_group_update(1, 2, 10, 0), Err(LockError::FileLocked)));
        // user 20 now tries to acquire group 1, which user 10 holds while
        // waiting on user 20 -> would close the cycle.
        assert!(matches!(lm.acquire_group_update(1, 1, 20, 0), Err(LockError::Deadlock)));
    }
}
