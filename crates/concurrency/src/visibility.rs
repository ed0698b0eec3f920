//! Visibility rules and the clarifying read path
//!
//! A story records two events: its insert (`add_psn`/`add_stmt`) and
//! its delete (`del_psn`/`del_stmt` list). Whether a transaction sees
//! an event depends on who owns it and on the reader's read-view PSN:
//!
//! - the transaction's own events are always visible to it;
//! - a prepared or committed event is visible below the reader's
//!   read-view horizon (`rv_psn`, unbounded when not in a read view);
//! - an insert with no PSN and no statement predates all history and is
//!   visible to everyone; a delete never becomes that ancient.
//!
//! Reading an index slot goes through *clarify*: walk the chain from
//! the head, delete before insert at every story, stop at the first
//! visible event. Whatever the walk concludes is then pinned: a read
//! tracker on the visible story, or a gap record on the head when the
//! reader saw nothing.

use crate::manager::TxManager;
use crate::story::StoryId;
use tephra_core::{Psn, SpaceId, TupleId, TxnId};

impl TxManager {
    fn read_view_horizon(&self, txn: Option<TxnId>) -> Psn {
        match txn {
            Some(t) if self.txn(t).rv_psn != 0 => self.txn(t).rv_psn,
            _ => Psn::MAX,
        }
    }

    /// Whether the insert event of `story` is visible to `txn`.
    /// Returns `(visible, own_change)`.
    pub(crate) fn insert_is_visible(
        &self,
        story: StoryId,
        txn: Option<TxnId>,
        is_prepared_ok: bool,
    ) -> (bool, bool) {
        let s = self.story(story);
        if let (Some(add), Some(txn)) = (s.add_stmt, txn) {
            if self.stmt(add).txn == txn {
                return (true, true);
            }
        }
        let rv_psn = self.read_view_horizon(txn);
        if is_prepared_ok && s.add_psn != 0 && s.add_psn < rv_psn {
            return (true, false);
        }
        if s.add_psn != 0 && s.add_stmt.is_none() && s.add_psn < rv_psn {
            return (true, false);
        }
        if s.add_psn == 0 && s.add_stmt.is_none() {
            // Added long ago by nobody we remember; visible to all.
            return (true, false);
        }
        (false, false)
    }

    /// Whether the delete event of `story` is visible to `txn`.
    /// Returns `(visible, own_change)`.
    pub(crate) fn delete_is_visible(
        &self,
        story: StoryId,
        txn: Option<TxnId>,
        is_prepared_ok: bool,
    ) -> (bool, bool) {
        let mut dels = self.story(story).del_stmt;
        while let Some(del) = dels {
            if txn == Some(self.stmt(del).txn) {
                return (true, true);
            }
            dels = self.stmt(del).next_in_del_list;
        }
        let s = self.story(story);
        let rv_psn = self.read_view_horizon(txn);
        if is_prepared_ok && s.del_psn != 0 && s.del_psn < rv_psn {
            return (true, false);
        }
        if s.del_psn != 0 && s.del_stmt.is_none() && s.del_psn < rv_psn {
            return (true, false);
        }
        // Unlike inserts, a delete is never "ancient unknown".
        (false, false)
    }

    /// Walk the chain from `story` towards the tail and return the
    /// tuple visible to `txn` in index `idx`, plus whether the decisive
    /// event was the transaction's own change.
    pub(crate) fn find_visible_tuple(
        &self,
        story: StoryId,
        txn: Option<TxnId>,
        idx: usize,
        is_prepared_ok: bool,
    ) -> (Option<TupleId>, bool) {
        let mut cursor = Some(story);
        let mut own = false;
        while let Some(s) = cursor {
            let (visible, o) = self.delete_is_visible(s, txn, is_prepared_ok);
            own = o;
            if visible {
                return (None, own);
            }
            let (visible, o) = self.insert_is_visible(s, txn, is_prepared_ok);
            own = o;
            if visible {
                return (Some(self.story(s).tuple), own);
            }
            cursor = self.story(s).link[idx].older;
        }
        (None, own)
    }

    /// Read the tuple bound at `key` in index `index_ord` as `txn` sees
    /// it, recording the observation. `txn == None` is a plain read of
    /// the latest state with no tracking.
    pub fn read(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        index_ord: u32,
        key: i64,
    ) -> Option<TupleId> {
        match self.index_get(space, index_ord, key) {
            None => {
                if let Some(txn) = txn {
                    self.track_point(txn, space, index_ord, key);
                }
                None
            }
            Some(tuple) => self.clarify(txn, space, tuple, index_ord),
        }
    }

    /// Resolve a physically bound tuple to the version `txn` actually
    /// sees there, tracking the read.
    pub(crate) fn clarify(
        &mut self,
        txn: Option<TxnId>,
        space: SpaceId,
        tuple: TupleId,
        index_ord: u32,
    ) -> Option<TupleId> {
        if !self.tuples.is_dirty(tuple) {
            // No history; the bound tuple is the truth for everyone.
            if let Some(txn) = txn {
                self.track_read(txn, space, Some(tuple));
            }
            return Some(tuple);
        }
        let top = self.story_get(tuple);
        self.story_clarify(txn, top, index_ord, true)
    }

    /// Chain walk of the read path.
    ///
    /// Like [`TxManager::find_visible_tuple`], but additionally demotes
    /// the reader when it walks past a prepared-but-invisible event:
    /// being unable to see a prepared change means the reader must
    /// serialize before it, and a read-only snapshot at that PSN is the
    /// only way it still can.
    fn story_clarify(
        &mut self,
        txn: Option<TxnId>,
        top: StoryId,
        index_ord: u32,
        is_prepared_ok: bool,
    ) -> Option<TupleId> {
        let idx = index_ord as usize;
        let mut story = top;
        let mut own_change = false;
        let mut result = None;
        loop {
            let (visible, own) = self.delete_is_visible(story, txn, is_prepared_ok);
            own_change = own;
            if visible {
                break;
            }
            {
                let (del_psn, del_stmt) = {
                    let s = self.story(story);
                    (s.del_psn, s.del_stmt)
                };
                if del_psn != 0 && del_stmt.is_some() {
                    if let Some(txn) = txn {
                        self.send_to_read_view(txn, del_psn);
                    }
                }
            }
            let (visible, own) = self.insert_is_visible(story, txn, is_prepared_ok);
            own_change = own;
            if visible {
                result = Some(self.story(story).tuple);
                break;
            }
            {
                let (add_psn, add_stmt) = {
                    let s = self.story(story);
                    (s.add_psn, s.add_stmt)
                };
                if add_psn != 0 && add_stmt.is_some() {
                    if let Some(txn) = txn {
                        self.send_to_read_view(txn, add_psn);
                    }
                }
            }
            match self.story(story).link[idx].older {
                Some(older) => story = older,
                None => break,
            }
        }

        if let Some(txn) = txn {
            if !own_change {
                // Pin the observation: either the version we saw, or
                // the fact that this chain showed us nothing.
                if result.is_none() {
                    self.track_story_gap(txn, top, index_ord);
                } else {
                    self.track_read_story(txn, story);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_storage::DupMode;

    /// Insert a row through the full statement path and return its
    /// story.
    fn insert_row(
        mgr: &mut TxManager,
        txn: TxnId,
        space: SpaceId,
        row: &[i64],
    ) -> StoryId {
        let stmt = mgr.txn_begin_stmt(txn, space).unwrap();
        let tuple = mgr.new_tuple(row);
        let old = mgr
            .history_add_stmt(stmt, None, Some(tuple), DupMode::Insert)
            .unwrap();
        mgr.stmt_record_result(stmt, old, Some(tuple));
        mgr.story_get(tuple)
    }

    #[test]
    fn test_own_insert_is_visible_before_prepare() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let txn = mgr.txn_begin();
        let story = insert_row(&mut mgr, txn, space, &[5]);
        let (visible, own) = mgr.insert_is_visible(story, Some(txn), true);
        assert!(visible);
        assert!(own);
    }

    #[test]
    fn test_foreign_in_progress_insert_is_invisible() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let writer = mgr.txn_begin();
        let reader = mgr.txn_begin();
        let story = insert_row(&mut mgr, writer, space, &[5]);
        let (visible, own) = mgr.insert_is_visible(story, Some(reader), true);
        assert!(!visible);
        assert!(!own);
        // The reader resolves the slot to nothing.
        assert_eq!(mgr.read(Some(reader), space, 0, 5), None);
    }

    #[test]
    fn test_committed_insert_is_visible_to_later_readers() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let writer = mgr.txn_begin();
        let story = insert_row(&mut mgr, writer, space, &[5]);
        let tuple = mgr.story(story).tuple;
        mgr.txn_commit(writer).unwrap();
        let reader = mgr.txn_begin();
        assert_eq!(mgr.read(Some(reader), space, 0, 5), Some(tuple));
    }

    #[test]
    fn test_read_view_hides_newer_commits() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let reader = mgr.txn_begin();
        mgr.send_to_read_view(reader, tephra_core::MIN_PSN);

        let writer = mgr.txn_begin();
        insert_row(&mut mgr, writer, space, &[5]);
        mgr.txn_commit(writer).unwrap();

        // The commit got PSN >= the reader's horizon.
        assert_eq!(mgr.read(Some(reader), space, 0, 5), None);
    }

    #[test]
    fn test_ancient_tuple_is_visible_to_everyone() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t = mgr.new_tuple(&[5]);
        mgr.spaces[space.raw()].indexes[0]
            .replace(&mgr.tuples, None, Some(t), DupMode::ReplaceOrInsert)
            .unwrap();
        let story = mgr.story_new(space, t);
        let reader = mgr.txn_begin();
        let (visible, own) = mgr.insert_is_visible(story, Some(reader), true);
        assert!(visible);
        assert!(!own);
        // But an "ancient" delete does not exist as a concept.
        let (visible, _) = mgr.delete_is_visible(story, Some(reader), true);
        assert!(!visible);
    }

    #[test]
    fn test_read_of_clean_tuple_creates_tracked_story() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t = mgr.new_tuple(&[5]);
        mgr.spaces[space.raw()].indexes[0]
            .replace(&mgr.tuples, None, Some(t), DupMode::ReplaceOrInsert)
            .unwrap();
        let reader = mgr.txn_begin();
        assert_eq!(mgr.read(Some(reader), space, 0, 5), Some(t));
        assert!(mgr.tuples.is_dirty(t));
        let story = mgr.story_get(t);
        assert_eq!(mgr.story(story).reader_list.len(), 1);
    }

    #[test]
    fn test_read_of_empty_slot_records_point_hole() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let reader = mgr.txn_begin();
        assert_eq!(mgr.read(Some(reader), space, 0, 5), None);
        assert_eq!(mgr.point_holes.len(), 1);
        assert_eq!(mgr.txn(reader).point_holes_list.len(), 1);
    }

    #[test]
    fn test_untracked_read_without_transaction() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let writer = mgr.txn_begin();
        let story = insert_row(&mut mgr, writer, space, &[5]);
        let tuple = mgr.story(story).tuple;
        mgr.txn_commit(writer).unwrap();

        assert_eq!(mgr.read(None, space, 0, 5), Some(tuple));
        assert_eq!(mgr.read(None, space, 0, 6), None);
        // No trackers, no point holes.
        assert_eq!(mgr.trackers.len(), 0);
        assert!(mgr.point_holes.is_empty());
    }

    #[test]
    fn test_read_own_deleted_key_returns_nothing_and_pins_no_gap() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let writer = mgr.txn_begin();
        insert_row(&mut mgr, writer, space, &[5]);
        mgr.txn_commit(writer).unwrap();

        let txn = mgr.txn_begin();
        let old = mgr.read(Some(txn), space, 0, 5).unwrap();
        let stmt = mgr.txn_begin_stmt(txn, space).unwrap();
        mgr.history_add_stmt(stmt, Some(old), None, DupMode::ReplaceOrInsert)
            .unwrap();
        mgr.stmt_record_result(stmt, Some(old), None);

        let gaps_before = mgr.gaps.len();
        assert_eq!(mgr.read(Some(txn), space, 0, 5), None);
        // The delete is the reader's own change; nothing new is pinned.
        assert_eq!(mgr.gaps.len(), gaps_before);
    }
}
