//! The database facade
//!
//! A thin CRUD layer over the transaction engine, in the shape the
//! surrounding system calls it: a [`Database`] owning the manager, and
//! [`Fiber`] values each carrying at most one current transaction.
//! Scheduling is cooperative and single-threaded; interleaving
//! transactions means interleaving calls on different fibers.
//!
//! All DML runs inside an explicit transaction. A statement that fails
//! is rolled back on its own; the transaction stays open. Reads go
//! through the engine's clarifying path, so they pin what they saw (or
//! did not see) until the transaction resolves.

use tephra_concurrency::TxManager;
use tephra_core::{Error, Result, SpaceId, TxnId};
use tephra_storage::DupMode;

/// A cooperative task's transaction slot.
#[derive(Debug, Default)]
pub struct Fiber {
    txn: Option<TxnId>,
}

impl Fiber {
    /// A fiber with no transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction currently bound to this fiber.
    pub fn txn(&self) -> Option<TxnId> {
        self.txn
    }
}

/// An in-memory MVCC row store.
pub struct Database {
    mgr: TxManager,
}

impl Database {
    /// Create an empty database.
    pub fn new() -> Self {
        Self {
            mgr: TxManager::new(),
        }
    }

    /// Create a space with `index_count` unique indexes; index `i` keys
    /// on field `i` of a row, index 0 is the primary.
    pub fn create_space(&mut self, index_count: usize) -> SpaceId {
        self.mgr.create_space(index_count)
    }

    /// Open a transaction on `fiber`.
    pub fn txn_begin(&mut self, fiber: &mut Fiber) -> Result<()> {
        if fiber.txn.is_some() {
            return Err(Error::TransactionActive);
        }
        fiber.txn = Some(self.mgr.txn_begin());
        Ok(())
    }

    /// Commit the fiber's transaction. A no-op without one.
    pub fn txn_commit(&mut self, fiber: &mut Fiber) -> Result<()> {
        let Some(txn) = fiber.txn else {
            return Ok(());
        };
        self.mgr.check_can_complete(txn)?;
        let result = self.mgr.txn_commit(txn);
        fiber.txn = None;
        result
    }

    /// Roll the fiber's transaction back. A no-op without one.
    pub fn txn_rollback(&mut self, fiber: &mut Fiber) -> Result<()> {
        let Some(txn) = fiber.txn else {
            return Ok(());
        };
        self.mgr.check_can_complete(txn)?;
        self.mgr.txn_rollback(txn);
        fiber.txn = None;
        Ok(())
    }

    /// Insert a row; fails if the primary key is visibly taken.
    pub fn insert(&mut self, fiber: &Fiber, space: SpaceId, row: &[i64]) -> Result<()> {
        self.execute_replace(fiber, space, row, DupMode::Insert)
    }

    /// Insert or overwrite the row at its primary key.
    pub fn replace(&mut self, fiber: &Fiber, space: SpaceId, row: &[i64]) -> Result<()> {
        self.execute_replace(fiber, space, row, DupMode::ReplaceOrInsert)
    }

    fn execute_replace(
        &mut self,
        fiber: &Fiber,
        space: SpaceId,
        row: &[i64],
        mode: DupMode,
    ) -> Result<()> {
        let txn = fiber.txn.ok_or(Error::NoActiveTransaction)?;
        let stmt = self.mgr.txn_begin_stmt(txn, space)?;
        let new_tuple = self.mgr.new_tuple(row);
        match self.mgr.history_add_stmt(stmt, None, Some(new_tuple), mode) {
            Ok(old) => {
                self.mgr.stmt_record_result(stmt, old, Some(new_tuple));
                Ok(())
            }
            Err(err) => {
                self.mgr.txn_rollback_last_stmt(txn);
                Err(err)
            }
        }
    }

    /// Delete the row visible at `key` in the given index. Returns the
    /// deleted row, or `None` when nothing was visible there.
    pub fn delete(
        &mut self,
        fiber: &Fiber,
        space: SpaceId,
        index_id: u32,
        key: i64,
    ) -> Result<Option<Vec<i64>>> {
        let txn = fiber.txn.ok_or(Error::NoActiveTransaction)?;
        let stmt = self.mgr.txn_begin_stmt(txn, space)?;
        let Some(old) = self.mgr.read(Some(txn), space, index_id, key) else {
            return Ok(None);
        };
        match self
            .mgr
            .history_add_stmt(stmt, Some(old), None, DupMode::ReplaceOrInsert)
        {
            Ok(result) => {
                self.mgr.stmt_record_result(stmt, result, None);
                Ok(result.map(|t| self.mgr.tuple_fields(t).to_vec()))
            }
            Err(err) => {
                self.mgr.txn_rollback_last_stmt(txn);
                Err(err)
            }
        }
    }

    /// Read the row visible at `key` in the given index.
    ///
    /// With a transaction on the fiber the read is clarified against it
    /// and tracked; without one this is a plain read of the latest
    /// state.
    pub fn get(
        &mut self,
        fiber: &Fiber,
        space: SpaceId,
        index_id: u32,
        key: i64,
    ) -> Result<Option<Vec<i64>>> {
        if let Some(txn) = fiber.txn {
            self.mgr.check_can_continue(txn)?;
        }
        let visible = self.mgr.read(fiber.txn, space, index_id, key);
        Ok(visible.map(|t| self.mgr.tuple_fields(t).to_vec()))
    }

    /// The engine underneath, for inspection in tests.
    pub fn manager(&self) -> &TxManager {
        &self.mgr
    }

    /// Run version garbage collection to quiescence.
    pub fn gc_drain(&mut self) {
        self.mgr.gc_drain();
    }

    /// Assert the engine's structural invariants.
    pub fn validate(&self) {
        self.mgr.validate();
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.mgr.teardown();
    }
}
