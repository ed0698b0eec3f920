//! Transaction lifecycle
//!
//! State transitions:
//! - `InProgress` → `Prepared` → `Committed` (normal commit)
//! - `InProgress` → `InReadView` (demoted by a concurrent writer;
//!   read-only transactions only)
//! - `InProgress` / `InReadView` → `Aborted` (conflict or rollback)
//!
//! Terminal states are `Committed` and `Aborted`. A transaction aborted
//! by conflict can no longer run statements, but its owner is still
//! allowed one final commit or rollback to observe the error and tear
//! the transaction down.
//!
//! PSNs are handed out when a transaction starts to prepare, strictly
//! increasing; the prepare order is the serialization order.

use crate::manager::TxManager;
use crate::statement::{RollbackInfo, Statement, StmtId};
use crate::tracker::{GapId, HoleId, TrackerId};
use tephra_core::{Error, Psn, Result, SpaceId, TxnId, MIN_PSN};

/// Status of a transaction in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Executing statements.
    InProgress,
    /// PSN assigned, statements prepared, commit in flight.
    Prepared,
    /// Demoted to a frozen snapshot; may still read and commit, but a
    /// write aborts it.
    InReadView,
    /// Committed and gone.
    Committed,
    /// Aborted by conflict or rollback.
    Aborted,
}

/// Sticky condition flags of a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnFlags {
    /// Aborted due to a conflict with a concurrent writer.
    pub conflicted: bool,
    /// Went through full rollback.
    pub rolled_back: bool,
    /// The last statement failed and was rolled back by the caller.
    pub stmt_rollback: bool,
}

/// A transaction.
pub struct Transaction {
    /// Monotonic begin-order identity, for diagnostics.
    pub(crate) id: i64,
    /// Prepare sequence number; 0 until the transaction prepares.
    pub(crate) psn: Psn,
    /// When in a read view: the PSN at or above which changes are
    /// invisible to this transaction. 0 otherwise.
    pub(crate) rv_psn: Psn,
    pub(crate) status: TxnStatus,
    /// Statements in submission order.
    pub(crate) stmts: Vec<StmtId>,
    /// Read trackers held by this transaction.
    pub(crate) read_set: Vec<TrackerId>,
    /// Point holes held by this transaction.
    pub(crate) point_holes_list: Vec<HoleId>,
    /// Gap items held by this transaction.
    pub(crate) gap_list: Vec<GapId>,
    pub(crate) flags: TxnFlags,
}

impl TxManager {
    /// Open a transaction.
    pub fn txn_begin(&mut self) -> TxnId {
        let id = self.next_txn_ordinal;
        self.next_txn_ordinal += 1;
        let txn = TxnId::new(self.txns.insert(Transaction {
            id,
            psn: 0,
            rv_psn: 0,
            status: TxnStatus::InProgress,
            stmts: Vec::new(),
            read_set: Vec::new(),
            point_holes_list: Vec::new(),
            gap_list: Vec::new(),
            flags: TxnFlags::default(),
        }));
        self.live_txns.push(txn);
        tracing::trace!(txn = id, "begin");
        txn
    }

    /// Open a statement in `txn` against `space`.
    ///
    /// A write arriving at a transaction that sits in a read view proves
    /// the snapshot can no longer serialize: the transaction is aborted
    /// with conflict before the usual continuation check.
    pub fn txn_begin_stmt(&mut self, txn: TxnId, space: SpaceId) -> Result<StmtId> {
        if self.txn(txn).status == TxnStatus::InReadView {
            self.abort_with_conflict(txn);
        }
        self.check_can_continue(txn)?;

        let stmt = StmtId::new(self.stmts.insert(Statement {
            txn,
            space,
            old_tuple: None,
            new_tuple: None,
            rollback_info: RollbackInfo::default(),
            add_story: None,
            del_story: None,
            next_in_del_list: None,
            is_own_change: false,
        }));
        self.txn_mut(txn).stmts.push(stmt);
        Ok(stmt)
    }

    /// Roll back the most recent statement of `txn` after a DML
    /// failure. The statement stays in the list as an inert entry; full
    /// rollback skips it because its rollback info is empty.
    pub fn txn_rollback_last_stmt(&mut self, txn: TxnId) {
        let Some(&stmt) = self.txn(txn).stmts.last() else {
            return;
        };
        self.rollback_one_stmt(stmt);
    }

    fn rollback_one_stmt(&mut self, stmt: StmtId) {
        let info = self.stmt(stmt).rollback_info;
        if info.old.is_none() && info.new.is_none() {
            return;
        }
        self.history_rollback_stmt(stmt);
    }

    /// Record the outcome of a successful DML statement: what it
    /// displaced and what it wrote, for use at rollback time.
    pub fn stmt_record_result(
        &mut self,
        stmt: StmtId,
        old: Option<tephra_core::TupleId>,
        new: Option<tephra_core::TupleId>,
    ) {
        let s = self.stmt_mut(stmt);
        s.rollback_info = RollbackInfo { old, new };
        s.old_tuple = old;
        s.new_tuple = new;
    }

    /// Assign a PSN and prepare every statement in order.
    pub(crate) fn txn_prepare(&mut self, txn: TxnId) -> Result<()> {
        self.check_can_continue(txn)?;
        debug_assert_eq!(self.txn(txn).psn, 0);
        let psn = self.next_psn;
        self.next_psn += 1;
        self.txn_mut(txn).psn = psn;

        let stmts = self.txn(txn).stmts.clone();
        for stmt in stmts {
            self.history_prepare_stmt(stmt);
        }
        // The read lists have served their purpose: conflicts with
        // already-prepared transactions were resolved above.
        self.clear_txn_read_lists(txn);
        self.txn_mut(txn).status = TxnStatus::Prepared;
        tracing::trace!(txn = self.txn(txn).id, psn, "prepared");
        Ok(())
    }

    /// Prepare, commit and free the transaction.
    ///
    /// When the transaction cannot be continued (it was aborted by a
    /// conflict while idle), it is rolled back instead and the error
    /// surfaces here.
    pub fn txn_commit(&mut self, txn: TxnId) -> Result<()> {
        if let Err(err) = self.txn_prepare(txn) {
            self.txn_rollback(txn);
            return Err(err);
        }
        self.txn_mut(txn).status = TxnStatus::Committed;
        let stmts = self.txn(txn).stmts.clone();
        for stmt in stmts {
            self.history_commit_stmt(stmt);
        }
        tracing::debug!(txn = self.txn(txn).id, psn = self.txn(txn).psn, "committed");
        self.txn_free(txn);
        Ok(())
    }

    /// Roll the transaction back and free it. Statements are undone in
    /// reverse submission order.
    pub fn txn_rollback(&mut self, txn: TxnId) {
        {
            let t = self.txn_mut(txn);
            t.status = TxnStatus::Aborted;
            t.flags.rolled_back = true;
        }
        let stmts = self.txn(txn).stmts.clone();
        for stmt in stmts.into_iter().rev() {
            self.rollback_one_stmt(stmt);
        }
        tracing::debug!(txn = self.txn(txn).id, "rolled back");
        self.txn_free(txn);
    }

    /// Release all resources of a finished transaction.
    fn txn_free(&mut self, txn: TxnId) {
        self.clear_txn_read_lists(txn);
        self.story_gc();
        let stmts = std::mem::take(&mut self.txn_mut(txn).stmts);
        for stmt in stmts {
            debug_assert!(self.stmt(stmt).add_story.is_none());
            debug_assert!(self.stmt(stmt).del_story.is_none());
            self.stmts.remove(stmt.raw());
        }
        if let Some(pos) = self.live_txns.iter().position(|&t| t == txn) {
            self.live_txns.remove(pos);
        }
        self.txns.remove(txn.raw());
    }

    /// Demote `txn` so it cannot see changes with PSN `psn` or newer.
    ///
    /// Only read-only transactions can be demoted; one with writes is
    /// aborted with conflict instead, because it could never commit
    /// against the state it has already observed.
    pub(crate) fn send_to_read_view(&mut self, txn: TxnId, psn: Psn) {
        debug_assert!(psn >= MIN_PSN);
        if self.txn(txn).status == TxnStatus::Aborted {
            return;
        }
        debug_assert!(matches!(
            self.txn(txn).status,
            TxnStatus::InProgress | TxnStatus::InReadView
        ));
        if !self.txn(txn).stmts.is_empty() {
            debug_assert_eq!(self.txn(txn).status, TxnStatus::InProgress);
            self.abort_with_conflict(txn);
            return;
        }

        debug_assert_eq!(
            self.txn(txn).status == TxnStatus::InReadView,
            self.txn(txn).rv_psn != 0
        );
        if self.txn(txn).status != TxnStatus::InReadView {
            self.txn_mut(txn).rv_psn = psn;
            self.read_view_txns.push(txn);
            tracing::debug!(txn = self.txn(txn).id, rv_psn = psn, "sent to read view");
        } else if self.txn(txn).rv_psn > psn {
            // Several breakers lower the snapshot step by step; the
            // cheapest valid level is the newest one below them all.
            self.txn_mut(txn).rv_psn = psn;
        }
        self.adjust_position_in_read_view_list(txn);
        self.txn_mut(txn).status = TxnStatus::InReadView;
    }

    /// Restore the sort order of `read_view_txns` after `txn` was
    /// appended or had its `rv_psn` lowered: walk it backwards while the
    /// predecessor's `rv_psn` is larger.
    fn adjust_position_in_read_view_list(&mut self, txn: TxnId) {
        let mut pos = self
            .read_view_txns
            .iter()
            .position(|&t| t == txn)
            .expect("transaction missing from read view list");
        let rv_psn = self.txn(txn).rv_psn;
        while pos > 0 && self.txn(self.read_view_txns[pos - 1]).rv_psn > rv_psn {
            self.read_view_txns.swap(pos - 1, pos);
            pos -= 1;
        }
    }

    /// Mark `txn` conflicted and abort it. Idempotent.
    pub(crate) fn abort_with_conflict(&mut self, txn: TxnId) {
        if self.txn(txn).status == TxnStatus::Aborted {
            return;
        }
        debug_assert!(matches!(
            self.txn(txn).status,
            TxnStatus::InProgress | TxnStatus::InReadView
        ));
        if self.txn(txn).status == TxnStatus::InReadView {
            if let Some(pos) = self.read_view_txns.iter().position(|&t| t == txn) {
                self.read_view_txns.remove(pos);
            }
        }
        let t = self.txn_mut(txn);
        t.status = TxnStatus::Aborted;
        t.flags.conflicted = true;
        tracing::debug!(txn = t.id, "aborted with conflict");
    }

    /// Whether new statements may run in `txn`.
    pub fn check_can_continue(&self, txn: TxnId) -> Result<()> {
        match self.txn(txn).status {
            TxnStatus::Aborted => {
                if self.txn(txn).flags.rolled_back {
                    Err(Error::TransactionRolledBack)
                } else {
                    Err(Error::TransactionConflict)
                }
            }
            TxnStatus::Committed => Err(Error::TransactionCommitted),
            _ => Ok(()),
        }
    }

    /// Whether `txn` may still be committed or rolled back.
    ///
    /// A transaction aborted by conflict is completable exactly once:
    /// the owner has not observed the abort yet, and the completion
    /// attempt is where the error surfaces.
    pub fn check_can_complete(&self, txn: TxnId) -> Result<()> {
        match self.txn(txn).status {
            TxnStatus::Aborted if self.txn(txn).flags.rolled_back => {
                Err(Error::TransactionRolledBack)
            }
            TxnStatus::Committed => Err(Error::TransactionCommitted),
            _ => Ok(()),
        }
    }

    /// Status of a transaction.
    pub fn txn_status(&self, txn: TxnId) -> TxnStatus {
        self.txn(txn).status
    }

    /// Whether the transaction was aborted by a conflict.
    pub fn txn_is_conflicted(&self, txn: TxnId) -> bool {
        self.txn(txn).flags.conflicted
    }

    /// The read-view PSN of a transaction (0 when not in a read view).
    pub fn txn_rv_psn(&self, txn: TxnId) -> Psn {
        self.txn(txn).rv_psn
    }
}
