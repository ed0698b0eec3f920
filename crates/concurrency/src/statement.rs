//! Statement lifecycle
//!
//! A statement is one DML action inside a transaction. Its life:
//!
//! - **add**: the physical write happens immediately (the new tuple is
//!   bound in every index) and a fresh story goes on top of each chain.
//!   Uniqueness is checked against *visible* tuples, so two in-progress
//!   transactions can stack versions on the same key and fight it out
//!   at prepare time.
//! - **prepare**: the story is reordered to sit between the prepared
//!   and in-progress regions of its chains, deleter lists are fixed up
//!   so exactly one prepared write ends each version, and every reader
//!   whose observation is now stale gets demoted to a read view (or
//!   aborted, if it wrote).
//! - **commit**: the statement detaches; the story stays behind as
//!   committed history until the GC reclaims it.
//! - **rollback**: the story sinks to the chain tail and is stamped
//!   with a marker PSN that hides it from everyone. A prepared
//!   statement additionally undoes its prepare-time fixups and aborts
//!   the readers that saw the prepared state.

use crate::manager::TxManager;
use crate::story::{StoryId, ROLLBACKED_PSN};
use crate::tracker::GapId;
use smallvec::SmallVec;
use tephra_core::{arena_id, Result, SpaceId, TupleId, TxnId};
use tephra_storage::DupMode;

arena_id! {
    /// Handle to a statement.
    StmtId
}

/// What a statement physically did, kept for rollback of statements
/// whose stories are gone.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollbackInfo {
    pub(crate) old: Option<TupleId>,
    pub(crate) new: Option<TupleId>,
}

/// One DML action of a transaction.
pub struct Statement {
    pub(crate) txn: TxnId,
    pub(crate) space: SpaceId,
    /// The visible tuple this statement displaced, if any.
    pub(crate) old_tuple: Option<TupleId>,
    /// The tuple this statement wrote, if any.
    pub(crate) new_tuple: Option<TupleId>,
    pub(crate) rollback_info: RollbackInfo,
    /// The story this statement introduced.
    pub(crate) add_story: Option<StoryId>,
    /// The story this statement deletes.
    pub(crate) del_story: Option<StoryId>,
    /// Next statement in `del_story`'s deleter list.
    pub(crate) next_in_del_list: Option<StmtId>,
    /// Whether this statement overwrites an earlier change of its own
    /// transaction (replace over own replace, insert after own delete).
    pub(crate) is_own_change: bool,
}

impl TxManager {
    /// Run a DML statement against the history.
    ///
    /// `new_tuple` present means INSERT/REPLACE; absent means DELETE of
    /// `old_tuple`. Returns the visible tuple the statement displaced.
    ///
    /// The caller owns failure handling: on error the physical state is
    /// already restored and the statement untouched, and the caller is
    /// expected to roll the statement back.
    pub fn history_add_stmt(
        &mut self,
        stmt: StmtId,
        old_tuple: Option<TupleId>,
        new_tuple: Option<TupleId>,
        mode: DupMode,
    ) -> Result<Option<TupleId>> {
        debug_assert!(new_tuple.is_some() || old_tuple.is_some());
        if let Some(new) = new_tuple {
            debug_assert!(!self.tuples.is_dirty(new));
        }
        self.story_gc();
        match new_tuple {
            Some(new) => self.add_insert_stmt(stmt, old_tuple, new, mode),
            None => {
                let old = old_tuple.expect("delete statement needs a target tuple");
                self.add_delete_stmt(stmt, old)
            }
        }
    }

    /// INSERT/REPLACE path: bind the new tuple physically, verify
    /// uniqueness against visible state, put a fresh story on top of
    /// every chain.
    fn add_insert_stmt(
        &mut self,
        stmt: StmtId,
        old_tuple: Option<TupleId>,
        new_tuple: TupleId,
        mode: DupMode,
    ) -> Result<Option<TupleId>> {
        let space = self.stmt(stmt).space;
        let txn = self.stmt(stmt).txn;
        let index_count = self.space_ref(space).index_count();

        let add_story = self.story_new(space, new_tuple);

        // Physically replace in every index, remembering what each slot
        // displaced.
        let mut directly_replaced: SmallVec<[Option<TupleId>; 2]> = SmallVec::new();
        let mut failure = None;
        for i in 0..index_count {
            match self.spaces[space.raw()].indexes[i].replace(
                &self.tuples,
                None,
                Some(new_tuple),
                DupMode::ReplaceOrInsert,
            ) {
                Ok(prev) => directly_replaced.push(prev),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let mut visible_old = old_tuple;
        let mut is_own_change = false;
        if failure.is_none() {
            if let Err(err) =
                self.check_dup(stmt, &directly_replaced, &mut visible_old, mode, &mut is_own_change)
            {
                failure = Some(err);
            }
        }
        if let Some(err) = failure {
            // Unwind the replaces already applied, newest first.
            for i in (0..directly_replaced.len()).rev() {
                self.spaces[space.raw()].indexes[i]
                    .replace(
                        &self.tuples,
                        Some(new_tuple),
                        directly_replaced[i],
                        DupMode::Insert,
                    )
                    .unwrap_or_else(|_| panic!("failed to roll back an index change"));
            }
            self.story_delete(add_story);
            return Err(err);
        }

        self.stmt_mut(stmt).is_own_change = is_own_change;
        self.link_added_by(add_story, stmt);

        // Story of the tuple the primary index displaced.
        let next_pk = directly_replaced[0];
        let next_pk_story = next_pk.map(|t| {
            if self.tuples.is_dirty(t) {
                self.story_get(t)
            } else {
                self.story_new(space, t)
            }
        });

        // Form the chains. An empty slot first converts its recorded
        // point holes into gap records on the new head.
        for i in 0..index_count {
            match directly_replaced[i] {
                None => {
                    self.handle_point_hole_write(space, add_story, i as u32);
                    self.story_link_top(add_story, None, i, true);
                }
                Some(next) => {
                    let next_story = if Some(next) == next_pk {
                        next_pk_story.expect("primary displacement resolved above")
                    } else {
                        debug_assert!(self.tuples.is_dirty(next));
                        self.story_get(next)
                    };
                    self.story_link_top(add_story, Some(next_story), i, true);
                }
            }
        }

        // The visible tuple we displace is logically deleted by this
        // statement.
        let mut del_story = None;
        if let Some(old) = visible_old {
            debug_assert!(self.tuples.is_dirty(old));
            let story = if Some(old) == next_pk {
                next_pk_story.expect("primary displacement resolved above")
            } else {
                self.story_get(old)
            };
            self.link_deleted_by(story, stmt);
            del_story = Some(story);
        }

        // An insert promises the slot read as empty; pin that
        // observation so a concurrent writer preparing into the same
        // slot conflicts with us.
        if !is_own_change && mode == DupMode::Insert {
            debug_assert!(del_story.is_none());
            match del_story {
                None => self.track_story_gap(txn, add_story, 0),
                Some(story) => self.track_read_story(txn, story),
            }
        }

        Ok(visible_old)
    }

    /// DELETE path: the target tuple was resolved through a clarifying
    /// read, so its story exists and the read is already tracked.
    fn add_delete_stmt(&mut self, stmt: StmtId, old_tuple: TupleId) -> Result<Option<TupleId>> {
        assert!(
            self.tuples.is_dirty(old_tuple),
            "delete target must carry history"
        );
        let del_story = self.story_get(old_tuple);
        if let Some(add) = self.story(del_story).add_stmt {
            let own = self.stmt(add).txn == self.stmt(stmt).txn;
            self.stmt_mut(stmt).is_own_change = own;
        }
        self.link_deleted_by(del_story, stmt);
        Ok(Some(old_tuple))
    }

    /// Verify the physical replacements against the visibility rules
    /// and resolve the tuple this statement logically displaces.
    ///
    /// On failure the transaction's statement-rollback flag is set and
    /// the offending visible tuple is recorded as read, so the failed
    /// observation still pins the serialization.
    fn check_dup(
        &mut self,
        stmt: StmtId,
        directly_replaced: &[Option<TupleId>],
        old_tuple: &mut Option<TupleId>,
        mode: DupMode,
        is_own_change: &mut bool,
    ) -> Result<()> {
        let space = self.stmt(stmt).space;
        let txn = self.stmt(stmt).txn;

        let visible_replaced = match directly_replaced[0] {
            Some(direct) if self.tuples.is_dirty(direct) => {
                let story = self.story_get(direct);
                let (visible, own) = self.find_visible_tuple(story, Some(txn), 0, true);
                *is_own_change = own;
                visible
            }
            other => {
                *is_own_change = false;
                other
            }
        };

        if let Err(err) = self.space_ref(space).indexes[0].check_dup(*old_tuple, visible_replaced, mode)
        {
            self.txn_mut(txn).flags.stmt_rollback = true;
            self.track_read(txn, space, visible_replaced);
            return Err(err);
        }

        for i in 1..self.space_ref(space).index_count() {
            let Some(direct) = directly_replaced[i] else {
                continue;
            };
            let visible = if self.tuples.is_dirty(direct) {
                let story = self.story_get(direct);
                self.find_visible_tuple(story, Some(txn), i, true).0
            } else {
                Some(direct)
            };
            // Every secondary index must displace the same tuple the
            // primary displaces, or nothing.
            if let Err(err) =
                self.space_ref(space).indexes[i].check_dup(visible_replaced, visible, DupMode::Insert)
            {
                self.txn_mut(txn).flags.stmt_rollback = true;
                self.track_read(txn, space, visible);
                return Err(err);
            }
        }

        *old_tuple = visible_replaced;
        Ok(())
    }

    /// Undo a statement's effect on the history.
    pub(crate) fn history_rollback_stmt(&mut self, stmt: StmtId) {
        #[cfg(debug_assertions)]
        {
            let s = self.stmt(stmt);
            let psn = self.txn(s.txn).psn;
            if let Some(add) = s.add_story {
                debug_assert_eq!(self.story(add).tuple, s.rollback_info.new.unwrap());
                debug_assert_eq!(self.story(add).add_psn, psn);
            }
            if let Some(del) = s.del_story {
                debug_assert_eq!(self.story(del).del_psn, psn);
            }
            debug_assert!(psn == 0 || s.next_in_del_list.is_none());
        }
        if self.stmt(stmt).add_story.is_some() {
            self.rollback_added_story(stmt);
        } else if self.stmt(stmt).del_story.is_some() {
            self.rollback_deleted_story(stmt);
        } else {
            self.rollback_empty_stmt(stmt);
        }
        debug_assert!(self.stmt(stmt).add_story.is_none());
        debug_assert!(self.stmt(stmt).del_story.is_none());
    }

    /// Roll back an INSERT/REPLACE statement.
    fn rollback_added_story(&mut self, stmt: StmtId) {
        let add_story = self.stmt(stmt).add_story.expect("caller checked");
        let del_story = self.stmt(stmt).del_story;
        let prepared = self.txn(self.stmt(stmt).txn).psn != 0;

        if prepared {
            // Prepare re-pointed in-progress deleters at our story;
            // point them back at whatever we had displaced. Statements
            // of this transaction cannot appear here: rollback runs in
            // reverse order, so ours are already gone.
            while let Some(test_stmt) = self.story(add_story).del_stmt {
                debug_assert_ne!(self.stmt(test_stmt).txn, self.stmt(stmt).txn);
                debug_assert!(!self.stmt(test_stmt).is_own_change);
                debug_assert_eq!(self.txn(self.stmt(test_stmt).txn).psn, 0);
                self.unlink_deleted_by(add_story, test_stmt);
                if let Some(del_story) = del_story {
                    self.link_deleted_by(del_story, test_stmt);
                }
            }

            self.story_mut(add_story).add_psn = 0;
            if let Some(del_story) = del_story {
                self.story_mut(del_story).del_psn = 0;
            }

            // Whoever read the prepared version read garbage now.
            self.abort_story_readers(add_story);
        }

        self.unlink_added_by(add_story, stmt);
        if let Some(del_story) = del_story {
            self.unlink_deleted_by(del_story, stmt);
        }

        // Sink the story to the chain tail and stamp it rolled back;
        // it becomes invisible to every reader, present and future, but
        // can still anchor read sets until the GC takes it.
        let count = self.story(add_story).index_count();
        let mut i = 0;
        while i < count {
            match self.story(add_story).link[i].older {
                None => i += 1,
                Some(older) => self.story_reorder(add_story, older, i),
            }
        }
        self.story_mut(add_story).del_psn = ROLLBACKED_PSN;
    }

    /// Roll back a DELETE statement.
    fn rollback_deleted_story(&mut self, stmt: StmtId) {
        let del_story = self.stmt(stmt).del_story.expect("caller checked");
        let prepared = self.txn(self.stmt(stmt).txn).psn != 0;

        if prepared {
            // Prepare detached the other would-be deleters; re-attach
            // the replace-like ones, findable in the primary chain
            // above us. Detached DELETE statements cannot be found this
            // way, but their transactions have all conflicted anyway.
            let mut cursor = self.story(del_story).link[0].newer;
            while let Some(test_story) = cursor {
                cursor = self.story(test_story).link[0].newer;
                let test_stmt = self
                    .story(test_story)
                    .add_stmt
                    .expect("in-progress story without an owning statement");
                if self.stmt(test_stmt).is_own_change {
                    continue;
                }
                debug_assert_ne!(self.stmt(test_stmt).txn, self.stmt(stmt).txn);
                debug_assert!(self.stmt(test_stmt).del_story.is_none());
                debug_assert_eq!(self.txn(self.stmt(test_stmt).txn).psn, 0);
                self.link_deleted_by(del_story, test_stmt);
            }

            self.story_mut(del_story).del_psn = 0;

            // Whoever observed the prepared absence observed garbage.
            self.abort_gap_readers(del_story);
        }

        self.unlink_deleted_by(del_story, stmt);
    }

    /// Roll back a statement with no stories. Meaningful only when the
    /// transaction was prepared: the physical bindings are restored
    /// from the rollback info.
    fn rollback_empty_stmt(&mut self, stmt: StmtId) {
        let info = self.stmt(stmt).rollback_info;
        if self.txn(self.stmt(stmt).txn).psn == 0 {
            return;
        }
        if info.old.is_none() && info.new.is_none() {
            return;
        }
        let space = self.stmt(stmt).space;
        for i in 0..self.space_ref(space).index_count() {
            self.spaces[space.raw()].indexes[i]
                .replace(&self.tuples, info.new, info.old, DupMode::ReplaceOrInsert)
                .unwrap_or_else(|_| {
                    panic!("failed to rebind index on rollback of a statement without a story")
                });
        }
    }

    /// Abort every transaction that read `story`.
    fn abort_story_readers(&mut self, story: StoryId) {
        let readers: Vec<TxnId> = self
            .story(story)
            .reader_list
            .iter()
            .map(|&t| self.tracker(t).reader)
            .collect();
        for reader in readers {
            self.abort_with_conflict(reader);
        }
    }

    /// Abort every transaction that observed the absence of `story`.
    /// Gap records live on chain heads, so each index's head is
    /// consulted.
    fn abort_gap_readers(&mut self, story: StoryId) {
        let count = self.story(story).index_count();
        for i in 0..count {
            let top = self.story_find_top(story, i);
            let gaps: Vec<GapId> = self.story(top).link[i].read_gaps.clone();
            for gap in gaps {
                let txn = self.gap(gap).txn;
                self.abort_with_conflict(txn);
            }
        }
    }

    /// Send every reader of `story` except the writer itself to a read
    /// view at the writer's PSN.
    fn handle_conflict_story_readers(&mut self, story: StoryId, writer: TxnId) {
        let psn = self.txn(writer).psn;
        let readers: Vec<TxnId> = self
            .story(story)
            .reader_list
            .iter()
            .map(|&t| self.tracker(t).reader)
            .filter(|&r| r != writer)
            .collect();
        for reader in readers {
            self.send_to_read_view(reader, psn);
        }
    }

    /// Send every gap reader anchored on the head `top` of index `idx`
    /// except the writer itself to a read view at the writer's PSN.
    fn handle_conflict_gap_readers(&mut self, top: StoryId, idx: usize, writer: TxnId) {
        debug_assert!(self.story(top).link[idx].newer.is_none());
        let psn = self.txn(writer).psn;
        let txns: Vec<TxnId> = self.story(top).link[idx]
            .read_gaps
            .iter()
            .map(|&g| self.gap(g).txn)
            .filter(|&t| t != writer)
            .collect();
        for txn in txns {
            self.send_to_read_view(txn, psn);
        }
    }

    /// Prepare one statement of a transaction that just received its
    /// PSN.
    pub(crate) fn history_prepare_stmt(&mut self, stmt: StmtId) {
        debug_assert_ne!(self.txn(self.stmt(stmt).txn).psn, 0);
        // Both stories absent happens for a delete that found nothing;
        // there is nothing to prepare then.
        if self.stmt(stmt).add_story.is_some() {
            self.prepare_insert_stmt(stmt);
        } else if self.stmt(stmt).del_story.is_some() {
            self.prepare_delete_stmt(stmt);
        }
        self.story_gc();
    }

    fn prepare_insert_stmt(&mut self, stmt: StmtId) {
        let story = self.stmt(stmt).add_story.expect("caller checked");
        let txn = self.stmt(stmt).txn;
        let psn = self.txn(txn).psn;
        let count = self.story(story).index_count();

        // A chain is ordered rolled-back, committed, prepared,
        // in-progress from the tail up. Slide our story below every
        // other in-progress story so it lands right above the prepared
        // region.
        let mut i = 0;
        while i < count {
            match self.story(story).link[i].older {
                Some(older)
                    if self.story(older).add_psn == 0 && self.story(older).add_stmt.is_some() =>
                {
                    self.story_reorder(story, older, i);
                }
                _ => i += 1,
            }
        }

        #[cfg(debug_assertions)]
        {
            let s = self.story(story);
            if let Some(del) = s.del_stmt {
                debug_assert!(self.stmt(del).next_in_del_list.is_none());
            }
            let older = s.link[0].older;
            match self.stmt(stmt).del_story {
                None => debug_assert!(older.is_none() || self.story(older.unwrap()).del_psn != 0),
                Some(del_story) => debug_assert_eq!(older, Some(del_story)),
            }
        }

        let del_story = self.stmt(stmt).del_story;
        if del_story.is_none() {
            // Until now the slot read as empty. Newer in-progress
            // statements that also saw it empty now implicitly replace
            // us; attach them as deleters of our story.
            let mut cursor = self.story(story).link[0].newer;
            while let Some(test_story) = cursor {
                cursor = self.story(test_story).link[0].newer;
                let test_stmt = self
                    .story(test_story)
                    .add_stmt
                    .expect("in-progress story without an owning statement");
                if self.stmt(test_stmt).is_own_change {
                    continue;
                }
                debug_assert_ne!(self.stmt(test_stmt).txn, txn);
                debug_assert!(self.stmt(test_stmt).del_story.is_none());
                debug_assert_eq!(self.txn(self.stmt(test_stmt).txn).psn, 0);
                self.link_deleted_by(story, test_stmt);
            }
        } else {
            // We displace a visible tuple. Every other in-progress
            // deleter of it deletes our version now.
            let del_story = del_story.expect("checked above");
            let mut others = Vec::new();
            let mut cursor = self.story(del_story).del_stmt;
            while let Some(test_stmt) = cursor {
                cursor = self.stmt(test_stmt).next_in_del_list;
                if test_stmt != stmt {
                    others.push(test_stmt);
                }
            }
            for test_stmt in others {
                debug_assert_ne!(self.stmt(test_stmt).txn, txn);
                debug_assert_eq!(self.txn(self.stmt(test_stmt).txn).psn, 0);
                self.unlink_deleted_by(del_story, test_stmt);
                self.link_deleted_by(story, test_stmt);
            }
        }

        // Readers whose observations this prepare invalidates.
        match del_story {
            Some(del_story) => self.handle_conflict_story_readers(del_story, txn),
            None => {
                let top = self.story_find_top(story, 0);
                self.handle_conflict_gap_readers(top, 0, txn);
            }
        }

        // Secondary cross-write conflicts. With pk on field 0 and sk on
        // field 1, picture replaces of {1,1}, {2,1} and {1,1} by three
        // transactions: when the first prepares, the {2,1} writer
        // introduces a secondary duplicate and must go, while the
        // second {1,1} writer overwrites us in both indexes and may
        // live. The rule: a newer secondary-chain statement survives
        // only if it replaces us in the primary too.
        for i in 1..count {
            let mut newer = story;
            while let Some(next) = self.story(newer).link[i].newer {
                newer = next;
                let test_stmt = self
                    .story(next)
                    .add_stmt
                    .expect("in-progress story without an owning statement");
                let test_txn = self.stmt(test_stmt).txn;
                if test_txn == txn {
                    continue;
                }
                if self.stmt(test_stmt).is_own_change && self.stmt(test_stmt).del_story.is_none() {
                    continue;
                }
                if self.stmt(test_stmt).del_story == Some(story) {
                    continue;
                }
                self.send_to_read_view(test_txn, psn);
            }
            // `newer` ended on the chain head; its gap readers observed
            // an absence this write may invalidate.
            self.handle_conflict_gap_readers(newer, i, txn);
        }

        self.story_mut(story).add_psn = psn;
        if let Some(del_story) = del_story {
            self.story_mut(del_story).del_psn = psn;
        }
    }

    fn prepare_delete_stmt(&mut self, stmt: StmtId) {
        debug_assert!(self.stmt(stmt).add_story.is_none());
        let del_story = self.stmt(stmt).del_story.expect("caller checked");
        let txn = self.stmt(stmt).txn;

        // Only one delete of a version can prepare; detach the rest.
        let mut others = Vec::new();
        let mut cursor = self.story(del_story).del_stmt;
        while let Some(test_stmt) = cursor {
            cursor = self.stmt(test_stmt).next_in_del_list;
            if test_stmt != stmt {
                others.push(test_stmt);
            }
        }
        for test_stmt in others {
            debug_assert_ne!(self.stmt(test_stmt).txn, txn);
            debug_assert_eq!(self.txn(self.stmt(test_stmt).txn).psn, 0);
            self.unlink_deleted_by(del_story, test_stmt);
        }

        self.handle_conflict_story_readers(del_story, txn);

        let psn = self.txn(txn).psn;
        self.story_mut(del_story).del_psn = psn;
    }

    /// Commit one statement: detach it from its stories. The PSNs stay,
    /// turning the stories into committed history.
    pub(crate) fn history_commit_stmt(&mut self, stmt: StmtId) {
        if let Some(add_story) = self.stmt(stmt).add_story {
            debug_assert_eq!(self.story(add_story).add_stmt, Some(stmt));
            self.unlink_added_by(add_story, stmt);
        }
        if let Some(del_story) = self.stmt(stmt).del_story {
            debug_assert_eq!(self.story(del_story).del_stmt, Some(stmt));
            debug_assert!(self.stmt(stmt).next_in_del_list.is_none());
            self.unlink_deleted_by(del_story, stmt);
        }
        self.story_gc();
    }
}
