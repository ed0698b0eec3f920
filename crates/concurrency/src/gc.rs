//! Incremental story garbage collection
//!
//! Stories are never freed at commit or rollback; they linger as
//! history until nothing can reach them. Reclamation is amortized:
//! every created story schedules a fixed number of steps, and each step
//! examines one story under a cursor that cycles through the
//! all-stories list.
//!
//! A story survives a step when any of these hold, checked in order:
//! - **Used**: a statement or reader still references it; or it heads a
//!   chain that still has older stories (collecting it would leave a
//!   head that is not in the index); or, in a secondary chain, its
//!   direct newer neighbor is an uncommitted write (collecting the
//!   committed version below an in-progress one loses it if that write
//!   rolls back).
//! - **ReadView**: some read view could still observe it.
//! - **TrackGap**: gap records are anchored to it.
//!
//! Anything else is unreachable: the story is spliced out of its
//! chains, its tuple is removed from the index when a prepared delete
//! ended it at the head, and the record is freed.

use crate::manager::TxManager;
use crate::story::{StoryId, StoryStatus};
use tephra_core::Psn;
use tephra_storage::DupMode;

impl TxManager {
    /// Run the accumulated GC steps.
    pub(crate) fn story_gc(&mut self) {
        for _ in 0..self.must_do_gc_steps {
            self.story_gc_step();
        }
        self.must_do_gc_steps = 0;
    }

    /// Run collection to quiescence: enough steps for two full sweeps
    /// of the all-stories list. A test hook; production code relies on
    /// the amortized steps alone.
    pub fn gc_drain(&mut self) {
        for _ in 0..2 * (self.story_count() + 2) {
            self.story_gc_step();
        }
        self.must_do_gc_steps = 0;
    }

    /// Examine one story under the cursor.
    pub(crate) fn story_gc_step(&mut self) {
        // At the sentinel: step onto the list head and call it a day.
        let Some(story) = self.gc_cursor else {
            self.gc_cursor = self.all_head;
            return;
        };

        // Below this PSN no read view can observe anything. With no
        // read views the next unassigned PSN bounds every story.
        let lowest_rv_psn: Psn = match self.read_view_txns.first() {
            Some(&txn) => {
                let rv_psn = self.txn(txn).rv_psn;
                debug_assert_ne!(rv_psn, 0);
                rv_psn
            }
            None => self.next_psn,
        };

        self.gc_cursor = self.story(story).all_next;

        match self.classify(story, lowest_rv_psn) {
            Some(status) => self.story_mut(story).status = status,
            None => {
                tracing::trace!(story = story.raw(), "collecting story");
                self.full_unlink_story_gc_step(story);
                self.story_delete(story);
            }
        }
    }

    /// Decide why a story must be kept; `None` means collectible.
    /// The order of the checks matters: the first reason wins.
    fn classify(&self, story: StoryId, lowest_rv_psn: Psn) -> Option<StoryStatus> {
        let s = self.story(story);
        if s.add_stmt.is_some() || s.del_stmt.is_some() || !s.reader_list.is_empty() {
            return Some(StoryStatus::Used);
        }
        if s.add_psn >= lowest_rv_psn || s.del_psn >= lowest_rv_psn {
            return Some(StoryStatus::ReadView);
        }
        for (i, link) in s.link.iter().enumerate() {
            if link.newer.is_none() {
                debug_assert!(link.in_index);
                if link.older.is_some() {
                    // Collecting the head would leave a chain whose new
                    // head is not bound in the index.
                    return Some(StoryStatus::Used);
                }
            } else if i > 0 && self.story(link.newer.expect("checked")).add_stmt.is_some() {
                // A secondary chain keeps committed history alive under
                // an uncommitted newer write: if that write rolls back,
                // this story is the survivor. Only the primary chain
                // maintains deleter lists for that.
                return Some(StoryStatus::Used);
            }
            if !link.read_gaps.is_empty() {
                return Some(StoryStatus::TrackGap);
            }
        }
        None
    }

    /// Detach a collectible story from its chains, removing its tuple
    /// from the index when a prepared delete ended it at the head.
    /// Unlike teardown this preserves the head-in-index invariant.
    fn full_unlink_story_gc_step(&mut self, story: StoryId) {
        let count = self.story(story).index_count();
        for i in 0..count {
            let (newer, older) = {
                let link = &self.story(story).link[i];
                (link.newer, link.older)
            };
            match newer {
                None => {
                    // Head of the chain: the tuple sits in the index.
                    // The classifier only lets heads through when the
                    // older side is empty, so removal cannot orphan a
                    // chain.
                    debug_assert!(self.story(story).link[i].in_index);
                    debug_assert!(older.is_none());
                    if self.story(story).del_psn > 0 {
                        let space = self.story(story).space;
                        let tuple = self.story(story).tuple;
                        let removed = self.spaces[space.raw()].indexes[i]
                            .replace(&self.tuples, Some(tuple), None, DupMode::Insert)
                            .unwrap_or_else(|_| {
                                panic!("failed to remove a dead tuple from its index")
                            });
                        assert_eq!(removed, Some(tuple));
                        self.story_mut(story).link[i].in_index = false;
                    }
                    self.story_unlink(story, older, i);
                }
                Some(newer) => {
                    // Splice out of the middle of the chain.
                    self.story_mut(newer).link[i].older = older;
                    if let Some(older) = older {
                        self.story_mut(older).link[i].newer = Some(newer);
                    }
                    let link = &mut self.story_mut(story).link[i];
                    link.newer = None;
                    link.older = None;
                }
            }
        }
    }

    /// Unconditional full unlink used by manager teardown. Does not
    /// preserve the head-in-index invariant and also detaches
    /// statements, gap records and readers.
    pub(crate) fn full_unlink_on_space_delete(&mut self, story: StoryId) {
        let count = self.story(story).index_count();
        for i in 0..count {
            let (newer, older) = {
                let link = &self.story(story).link[i];
                (link.newer, link.older)
            };
            match newer {
                None => {
                    debug_assert!(!self.story(story).link[i].in_index);
                    self.story_unlink(story, older, i);
                }
                Some(newer) => {
                    self.story_mut(newer).link[i].older = older;
                    if let Some(older) = older {
                        self.story_mut(older).link[i].newer = Some(newer);
                    }
                    let link = &mut self.story_mut(story).link[i];
                    link.newer = None;
                    link.older = None;
                }
            }
        }

        if let Some(add_stmt) = self.story(story).add_stmt {
            self.unlink_added_by(story, add_stmt);
        }
        while let Some(del_stmt) = self.story(story).del_stmt {
            self.unlink_deleted_by(story, del_stmt);
        }

        for i in 0..count {
            while let Some(&gap) = self.story(story).link[i].read_gaps.last() {
                self.gap_item_delete(gap);
            }
        }
        while let Some(&tracker) = self.story(story).reader_list.first() {
            let reader = self.tracker(tracker).reader;
            self.story_mut(story).reader_list.remove(0);
            let read_set = &mut self.txn_mut(reader).read_set;
            if let Some(pos) = read_set.iter().position(|&t| t == tracker) {
                read_set.remove(pos);
            }
            self.trackers.remove(tracker.raw());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tephra_core::SpaceId;
    use tephra_core::TxnId;

    fn insert(mgr: &mut TxManager, txn: TxnId, space: SpaceId, row: &[i64]) {
        let stmt = mgr.txn_begin_stmt(txn, space).unwrap();
        let tuple = mgr.new_tuple(row);
        let old = mgr
            .history_add_stmt(stmt, None, Some(tuple), DupMode::ReplaceOrInsert)
            .unwrap();
        mgr.stmt_record_result(stmt, old, Some(tuple));
    }

    fn drain_gc(mgr: &mut TxManager) {
        mgr.gc_drain();
    }

    #[test]
    fn test_committed_single_version_is_collected_and_stays_bound() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let txn = mgr.txn_begin();
        insert(&mut mgr, txn, space, &[5]);
        mgr.txn_commit(txn).unwrap();

        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 0);
        // The committed row is plain again: bound, not dirty.
        let bound = mgr.index_get(space, 0, 5).unwrap();
        assert!(!mgr.tuples.is_dirty(bound));
        mgr.validate();
    }

    #[test]
    fn test_replaced_version_chain_shrinks_to_nothing() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t1 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[5, 1]);
        mgr.txn_commit(t1).unwrap();
        let t2 = mgr.txn_begin();
        insert(&mut mgr, t2, space, &[5, 2]);
        mgr.txn_commit(t2).unwrap();

        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 0);
        let bound = mgr.index_get(space, 0, 5).unwrap();
        assert_eq!(mgr.tuple_fields(bound), &[5, 2]);
        // The displaced row was freed from the arena.
        assert_eq!(mgr.tuples.len(), 1);
        mgr.validate();
    }

    #[test]
    fn test_rolled_back_story_is_collected_and_unbound() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let txn = mgr.txn_begin();
        insert(&mut mgr, txn, space, &[5]);
        mgr.txn_rollback(txn);

        assert!(mgr.index_get(space, 0, 5).is_some());
        drain_gc(&mut mgr);
        // The dead head was removed from the index on collection.
        assert_eq!(mgr.index_get(space, 0, 5), None);
        assert_eq!(mgr.story_count(), 0);
        assert_eq!(mgr.tuples.len(), 0);
        mgr.validate();
    }

    #[test]
    fn test_deleted_row_leaves_index_only_through_gc() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t1 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[5]);
        mgr.txn_commit(t1).unwrap();

        let t2 = mgr.txn_begin();
        let stmt = mgr.txn_begin_stmt(t2, space).unwrap();
        let old = mgr.read(Some(t2), space, 0, 5).unwrap();
        mgr.history_add_stmt(stmt, Some(old), None, DupMode::ReplaceOrInsert)
            .unwrap();
        mgr.stmt_record_result(stmt, Some(old), None);
        mgr.txn_commit(t2).unwrap();

        // Physically still bound until the collector reaches the head.
        drain_gc(&mut mgr);
        assert_eq!(mgr.index_get(space, 0, 5), None);
        assert_eq!(mgr.story_count(), 0);
        assert_eq!(mgr.tuples.len(), 0);
        mgr.validate();
    }

    #[test]
    fn test_story_referenced_by_reader_is_kept() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t1 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[5]);
        mgr.txn_commit(t1).unwrap();

        let reader = mgr.txn_begin();
        assert!(mgr.read(Some(reader), space, 0, 5).is_some());
        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 1);
        let story = mgr.story_get(mgr.index_get(space, 0, 5).unwrap());
        assert_eq!(mgr.story(story).status, StoryStatus::Used);

        mgr.txn_commit(reader).unwrap();
        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 0);
        mgr.validate();
    }

    #[test]
    fn test_read_view_keeps_displaced_version_alive() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t1 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[5, 1]);
        mgr.txn_commit(t1).unwrap();
        drain_gc(&mut mgr);

        let reader = mgr.txn_begin();
        assert!(mgr.read(Some(reader), space, 0, 5).is_some());
        let writer = mgr.txn_begin();
        insert(&mut mgr, writer, space, &[5, 2]);
        mgr.txn_commit(writer).unwrap();
        assert_eq!(mgr.txn_status(reader), crate::TxnStatus::InReadView);

        // The old version must survive while the read view lives.
        drain_gc(&mut mgr);
        let old = mgr.read(Some(reader), space, 0, 5).unwrap();
        assert_eq!(mgr.tuple_fields(old), &[5, 1]);

        mgr.txn_commit(reader).unwrap();
        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 0);
        let bound = mgr.index_get(space, 0, 5).unwrap();
        assert_eq!(mgr.tuple_fields(bound), &[5, 2]);
        mgr.validate();
    }

    #[test]
    fn test_gap_anchor_story_is_kept_as_track_gap() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t1 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[5]);
        mgr.txn_commit(t1).unwrap();
        let t2 = mgr.txn_begin();
        let stmt = mgr.txn_begin_stmt(t2, space).unwrap();
        let old = mgr.read(Some(t2), space, 0, 5).unwrap();
        mgr.history_add_stmt(stmt, Some(old), None, DupMode::ReplaceOrInsert)
            .unwrap();
        mgr.stmt_record_result(stmt, Some(old), None);
        mgr.txn_commit(t2).unwrap();

        // The row is deleted; a reader probing it sees nothing and
        // anchors a gap record on the dead head.
        let reader = mgr.txn_begin();
        assert_eq!(mgr.read(Some(reader), space, 0, 5), None);
        let head_story = mgr.story_get(mgr.index_get(space, 0, 5).unwrap());

        drain_gc(&mut mgr);
        // Kept purely as a gap anchor; the tuple stays bound meanwhile.
        assert_eq!(mgr.story(head_story).status, StoryStatus::TrackGap);
        assert!(mgr.index_get(space, 0, 5).is_some());

        mgr.txn_commit(reader).unwrap();
        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 0);
        assert_eq!(mgr.index_get(space, 0, 5), None);
        mgr.validate();
    }

    #[test]
    fn test_secondary_chain_keeps_committed_story_under_live_writer() {
        // Two concurrent writers overlapping only in the secondary key:
        // t1 writes {1,7}, t2 writes {2,7} while t1 is still open, so
        // t2's version stacks over t1's in the secondary chain. Then t1
        // commits (aborting t2) and the committed story must survive
        // until t2's statement is gone: it is what the secondary chain
        // falls back to when t2 rolls back.
        let mut mgr = TxManager::new();
        let space = mgr.create_space(2);
        let t1 = mgr.txn_begin();
        let t2 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[1, 7]);
        insert(&mut mgr, t2, space, &[2, 7]);
        mgr.txn_commit(t1).unwrap();
        assert_eq!(mgr.txn_status(t2), crate::TxnStatus::Aborted);

        drain_gc(&mut mgr);
        assert!(mgr
            .history
            .values()
            .any(|&s| mgr.story(s).add_stmt.is_none() && mgr.story(s).add_psn > 0));

        mgr.txn_rollback(t2);
        drain_gc(&mut mgr);
        let bound = mgr.index_get(space, 1, 7).unwrap();
        assert_eq!(mgr.tuple_fields(bound), &[1, 7]);
        assert_eq!(mgr.index_get(space, 0, 2), None);
        assert_eq!(mgr.story_count(), 0);
        mgr.validate();
    }

    #[test]
    fn test_gc_cursor_survives_deletion_under_it() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        for key in 0..4 {
            let txn = mgr.txn_begin();
            insert(&mut mgr, txn, space, &[key]);
            mgr.txn_commit(txn).unwrap();
        }
        // Cycle the cursor through several sweeps interleaved with
        // more mutations; nothing should dangle.
        for key in 4..8 {
            let txn = mgr.txn_begin();
            insert(&mut mgr, txn, space, &[key]);
            mgr.txn_commit(txn).unwrap();
            mgr.story_gc_step();
        }
        drain_gc(&mut mgr);
        assert_eq!(mgr.story_count(), 0);
        assert_eq!(mgr.index_len(space, 0), 8);
        mgr.validate();
    }

    #[test]
    fn test_teardown_releases_all_state() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(2);
        let t1 = mgr.txn_begin();
        insert(&mut mgr, t1, space, &[1, 1]);
        mgr.txn_commit(t1).unwrap();

        // Leave a mess: an open writer, an open reader with trackers
        // and point holes.
        let writer = mgr.txn_begin();
        insert(&mut mgr, writer, space, &[2, 2]);
        let reader = mgr.txn_begin();
        assert!(mgr.read(Some(reader), space, 0, 1).is_some());
        assert!(mgr.read(Some(reader), space, 0, 9).is_none());

        mgr.teardown();
        assert_eq!(mgr.story_count(), 0);
        assert!(mgr.history.is_empty());
        assert!(mgr.point_holes.is_empty());
        assert_eq!(mgr.trackers.len(), 0);
        assert_eq!(mgr.gaps.len(), 0);
        assert_eq!(mgr.holes.len(), 0);
    }
}
