//! Transaction manager (spec §4.8).
//!
//! A transaction is a queue of pending `Write`/`Delete`/`Close` actions
//! against `(file_id, id)` keys, replayed in FIFO order at commit.
//! Nested `BEGIN TRANSACTION` pushes the current queue and txn_id onto a
//! stack (spec: "Nested transactions push the current (txn_id, queue
//! head/tail, ...) onto a stack") and starts a fresh queue so reads
//! inside the nested scope see only its own pending writes until it
//! commits into the parent.

use tracing::instrument;

use crate::error::{NoTransactionSnafu, TxnError};
use crate::lock::LockManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Write,
    Delete,
    /// A deferred close, kept alive (ref_ct pre-incremented by the
    /// caller) until commit or rollback decides whether to actually
    /// close the file (spec §4.8 "Close").
    Close,
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub file_id: u16,
    pub id: Vec<u8>,
    pub kind: ActionKind,
    /// Payload for `Write`; empty/ignored for `Delete`/`Close`.
    pub data: Vec<u8>,
}

/// One transaction's queue plus the bookkeeping a nested `BEGIN` needs to
/// restore when it unwinds (spec §4.8's `TXN_STACK`).
struct Frame {
    txn_id: u64,
    queue: Vec<PendingAction>,
}

/// The transaction manager (spec §4.8). `next_txn_id` normally comes
/// from the shared system segment (§3.4) under its own critical section;
/// this type takes a generator closure so it doesn't need a direct
/// `SysSeg` dependency for every call site.
pub struct TxnManager {
    stack: Vec<Frame>,
    current: Option<Frame>,
}

impl Default for TxnManager {
    fn default() -> Self {
        TxnManager { stack: Vec::new(), current: None }
    }
}

impl TxnManager {
    pub fn new() -> TxnManager {
        TxnManager::default()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_txn_id(&self) -> u64 {
        self.current.as_ref().map(|f| f.txn_id).unwrap_or(0)
    }

    /// `op_txnbgn` (spec §4.8): pushes the current frame (if any) and
    /// starts a fresh queue tagged with a freshly allocated txn id,
    /// skipping zero on wraparound.
    pub fn begin(&mut self, mut next_id: impl FnMut() -> u64) {
        if let Some(frame) = self.current.take() {
            self.stack.push(frame);
        }
        let mut txn_id = next_id();
        if txn_id == 0 {
            txn_id = next_id();
        }
        self.current = Some(Frame { txn_id, queue: Vec::new() });
    }

    fn queue_mut(&mut self) -> Result<&mut Vec<PendingAction>, TxnError> {
        self.current.as_mut().map(|f| &mut f.queue).context_no_transaction()
    }

    /// Enqueues a write, collapsing against any existing pending action
    /// on the same `(file_id, id)` per the rules in spec §4.8: Write-then-
    /// Write replaces the payload, Delete-then-Write converts back to a
    /// Write.
    pub fn write(&mut self, file_id: u16, id: &[u8], data: &[u8]) -> Result<(), TxnError> {
        let queue = self.queue_mut()?;
        if let Some(existing) = queue.iter_mut().find(|a| a.file_id == file_id && a.id == id) {
            existing.kind = ActionKind::Write;
            existing.data = data.to_vec();
            return Ok(());
        }
        queue.push(PendingAction { file_id, id: id.to_vec(), kind: ActionKind::Write, data: data.to_vec() });
        Ok(())
    }

    /// Enqueues a delete. Write-then-Delete converts to Delete (releasing
    /// the old payload); Delete-then-Delete is idempotent (spec §4.8).
    pub fn delete(&mut self, file_id: u16, id: &[u8]) -> Result<(), TxnError> {
        let queue = self.queue_mut()?;
        if let Some(existing) = queue.iter_mut().find(|a| a.file_id == file_id && a.id == id) {
            existing.kind = ActionKind::Delete;
            existing.data.clear();
            return Ok(());
        }
        queue.push(PendingAction { file_id, id: id.to_vec(), kind: ActionKind::Delete, data: Vec::new() });
        Ok(())
    }

    pub fn close(&mut self, file_id: u16, id: &[u8]) -> Result<(), TxnError> {
        let queue = self.queue_mut()?;
        queue.push(PendingAction { file_id, id: id.to_vec(), kind: ActionKind::Close, data: Vec::new() });
        Ok(())
    }

    /// `txn_read` (spec §4.8): searches the current frame, then each
    /// stacked (outer) frame, for a pending action on `(file_id, id)`. A
    /// `Write` hit returns the pending payload; a `Delete` hit returns
    /// `Some(None)` ("not found without touching disk"); no hit returns
    /// `None` so the caller falls through to disk.
    pub fn read(&self, file_id: u16, id: &[u8]) -> Option<Option<Vec<u8>>> {
        let frames = self.current.iter().chain(self.stack.iter().rev());
        for frame in frames {
            if let Some(action) = frame.queue.iter().rev().find(|a| a.file_id == file_id && a.id == id) {
                return Some(match action.kind {
                    ActionKind::Write => Some(action.data.clone()),
                    ActionKind::Delete => None,
                    ActionKind::Close => continue,
                });
            }
        }
        None
    }

    /// `op_txncmt` (spec §4.8): replays the current frame's queue in
    /// FIFO order via the supplied callbacks, then releases every lock
    /// tagged with the committed txn_id and folds any remaining frame
    /// back onto the parent (nested commit just flattens into the
    /// caller, since there is no separate durability boundary between
    /// nesting levels in this engine).
    #[instrument(skip(self, locks, on_write, on_delete, on_close))]
    pub fn commit(
        &mut self,
        locks: &LockManager,
        mut on_write: impl FnMut(u16, &[u8], &[u8]),
        mut on_delete: impl FnMut(u16, &[u8]),
        mut on_close: impl FnMut(u16, &[u8]),
    ) -> Result<(), TxnError> {
        let frame = self.current.take().context_no_transaction()?;
        let committed_txn_id = frame.txn_id;
        debug!(txn_id = committed_txn_id, actions = frame.queue.len(), "committing transaction");

        for action in &frame.queue {
            match action.kind {
                ActionKind::Write => on_write(action.file_id, &action.id, &action.data),
                ActionKind::Delete => on_delete(action.file_id, &action.id),
                ActionKind::Close => on_close(action.file_id, &action.id),
            }
        }

        locks.unlock_txn(committed_txn_id);
        self.current = self.stack.pop();
        if let Some(parent) = self.current.as_mut() {
            parent.queue.retain(|a| !frame.queue.iter().any(|c| c.file_id == a.file_id && c.id == a.id));
        }
        Ok(())
    }

    /// `rollback` (spec §4.8): discards the current frame's queue,
    /// undoing any `Close` pre-increment via `on_undo_close`, releases
    /// every lock tagged with this txn_id, and pops the parent frame.
    #[instrument(skip(self, locks, on_undo_close))]
    pub fn rollback(&mut self, locks: &LockManager, mut on_undo_close: impl FnMut(u16, &[u8])) -> Result<(), TxnError> {
        let frame = self.current.take().context_no_transaction()?;
        warn!(txn_id = frame.txn_id, actions = frame.queue.len(), "rolling back transaction");
        for action in &frame.queue {
            if action.kind == ActionKind::Close {
                on_undo_close(action.file_id, &action.id);
            }
        }
        locks.unlock_txn(frame.txn_id);
        self.current = self.stack.pop();
        Ok(())
    }

    /// `txn_abort` (spec §4.8): rolls back every nested transaction in
    /// turn, used on interpreter abort/logout/forced terminate.
    pub fn abort_all(&mut self, locks: &LockManager, mut on_undo_close: impl FnMut(u16, &[u8])) {
        while self.is_open() {
            let _ = self.rollback(locks, &mut on_undo_close);
        }
    }
}

trait OptionExt<T> {
    fn context_no_transaction(self) -> Result<T, TxnError>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context_no_transaction(self) -> Result<T, TxnError> {
        self.ok_or_else(|| NoTransactionSnafu.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locks() -> LockManager {
        LockManager::new(10, false)
    }

    #[test]
    fn write_then_write_collapses_to_latest_payload() {
        let mut txn = TxnManager::new();
        let mut next = 1u64;
        txn.begin(|| {
            next += 1;
            next
        });
        txn.write(1, b"A", b"v1").unwrap();
        txn.write(1, b"A", b"v2").unwrap();
        assert_eq!(txn.read(1, b"A"), Some(Some(b"v2".to_vec())));
    }

    #[test]
    fn write_then_delete_becomes_delete() {
        let mut txn = TxnManager::new();
        txn.begin(|| 5);
        txn.write(1, b"A", b"v1").unwrap();
        txn.delete(1, b"A").unwrap();
        assert_eq!(txn.read(1, b"A"), Some(None));
    }

    #[test]
    fn commit_replays_actions_and_unlocks() {
        let mut txn = TxnManager::new();
        let lm = locks();
        txn.begin(|| 9);
        lm.acquire_group_update(1, 0, 1, 9).unwrap();
        txn.write(1, b"A", b"v1").unwrap();
        let mut written = Vec::new();
        txn.commit(&lm, |f, id, data| written.push((f, id.to_vec(), data.to_vec())), |_, _| {}, |_, _| {}).unwrap();
        assert_eq!(written, vec![(1, b"A".to_vec(), b"v1".to_vec())]);
        assert!(!txn.is_open());
        lm.acquire_group_update(1, 0, 2, 0).unwrap();
    }

    #[test]
    fn nested_transaction_commits_into_parent() {
        let mut txn = TxnManager::new();
        let lm = locks();
        txn.begin(|| 1);
        txn.write(1, b"A", b"outer").unwrap();
        txn.begin(|| 2);
        txn.write(1, b"A", b"inner").unwrap();
        txn.commit(&lm, |_, _, _| {}, |_, _| {}, |_, _| {}).unwrap();
        // Outer frame's stale pending write on the same key was cleared.
        assert_eq!(txn.read(1, b"A"), None);
    }

    #[test]
    fn rollback_discards_queue_and_unlocks() {
        let mut txn = TxnManager::new();
        let lm = locks();
        txn.begin(|| 3);
        lm.acquire_group_update(1, 0, 1, 3).unwrap();
        txn.write(1, b"A", b"v1").unwrap();
        txn.rollback(&lm, |_, _| {}).unwrap();
        assert!(!txn.is_open());
        lm.acquire_group_update(1, 0, 2, 0).unwrap();
    }
}
