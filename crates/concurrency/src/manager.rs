//! The transaction manager
//!
//! [`TxManager`] is the single owner of all engine state: the tuple
//! arena, the spaces, and the arenas of stories, statements,
//! transactions and trackers. Every cross-reference between those
//! objects is an arena id, so the cyclic graph (stories pointing at
//! statements pointing at transactions pointing back at trackers on
//! stories) needs no shared ownership and no unsafe code.
//!
//! Ownership of a story is logical: it is alive while a statement, a
//! reader, a gap item or the chain-head invariant keeps it reachable.
//! Everybody else merely unlinks; the garbage collector in [`crate::gc`]
//! is the only deleter.

use crate::statement::{Statement, StmtId};
use crate::story::{Story, StoryId, StoryLink, StoryStatus};
use crate::tracker::{GapItem, PointHole, ReadTracker};
use crate::tracker::{GapId, HoleId, TrackerId};
use crate::transaction::Transaction;
use rustc_hash::FxHashMap;
use slab::Slab;
use smallvec::SmallVec;
use tephra_core::{Psn, SpaceId, TupleId, TxnId, MIN_PSN};
use tephra_storage::{Space, TupleStore};

/// Number of GC steps scheduled per created story.
pub(crate) const GC_STEPS_SIZE: usize = 2;

/// Coordinates snapshot-isolated transactions over a set of spaces.
pub struct TxManager {
    /// All rows, shared by every space.
    pub(crate) tuples: TupleStore,
    /// All spaces.
    pub(crate) spaces: Slab<Space>,
    /// Version records.
    pub(crate) stories: Slab<Story>,
    /// Statements of live transactions.
    pub(crate) stmts: Slab<Statement>,
    /// Live transactions.
    pub(crate) txns: Slab<Transaction>,
    /// Read trackers.
    pub(crate) trackers: Slab<ReadTracker>,
    /// Inplace gap items.
    pub(crate) gaps: Slab<GapItem>,
    /// Point-hole items.
    pub(crate) holes: Slab<PointHole>,
    /// Maps a DIRTY tuple to its story.
    pub(crate) history: FxHashMap<TupleId, StoryId>,
    /// Recorded empty point lookups, keyed by (index unique id, key).
    pub(crate) point_holes: FxHashMap<(u32, i64), Vec<HoleId>>,
    /// Read-only transactions demoted to a read view, ascending by
    /// `rv_psn`.
    pub(crate) read_view_txns: Vec<TxnId>,
    /// Every live transaction, in begin order.
    pub(crate) live_txns: Vec<TxnId>,
    /// Intrusive list of all stories, oldest first.
    pub(crate) all_head: Option<StoryId>,
    pub(crate) all_tail: Option<StoryId>,
    /// GC cursor into the all-stories list; `None` is the sentinel
    /// position past the tail.
    pub(crate) gc_cursor: Option<StoryId>,
    /// Accumulated number of GC steps to run at the next opportunity.
    pub(crate) must_do_gc_steps: usize,
    /// Next prepare sequence number to hand out.
    pub(crate) next_psn: Psn,
    /// Next transaction ordinal (display identity, not an arena slot).
    pub(crate) next_txn_ordinal: i64,
    /// Database-wide index id counter.
    next_index_unique_id: u32,
}

impl TxManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            tuples: TupleStore::new(),
            spaces: Slab::new(),
            stories: Slab::new(),
            stmts: Slab::new(),
            txns: Slab::new(),
            trackers: Slab::new(),
            gaps: Slab::new(),
            holes: Slab::new(),
            history: FxHashMap::default(),
            point_holes: FxHashMap::default(),
            read_view_txns: Vec::new(),
            live_txns: Vec::new(),
            all_head: None,
            all_tail: None,
            gc_cursor: None,
            must_do_gc_steps: 0,
            next_psn: MIN_PSN,
            next_txn_ordinal: 1,
            next_index_unique_id: 0,
        }
    }

    /// Create a space with the given number of unique indexes.
    ///
    /// Index `i` keys on field `i`; index 0 is the primary.
    pub fn create_space(&mut self, index_count: usize) -> SpaceId {
        let entry = self.spaces.vacant_entry();
        let id = SpaceId::new(entry.key());
        let space = Space::new(id, index_count, &mut self.next_index_unique_id);
        entry.insert(space);
        tracing::debug!(space = %id, index_count, "created space");
        id
    }

    /// Allocate a new row.
    pub fn new_tuple(&mut self, fields: &[i64]) -> TupleId {
        self.tuples.insert(fields)
    }

    /// Fields of a row.
    pub fn tuple_fields(&self, tuple: TupleId) -> &[i64] {
        self.tuples.get(tuple).fields()
    }

    /// The tuple physically bound in an index, ignoring visibility.
    pub fn index_get(&self, space: SpaceId, index_ord: u32, key: i64) -> Option<TupleId> {
        self.space_ref(space).indexes[index_ord as usize].get(key)
    }

    /// Number of keys physically bound in an index.
    pub fn index_len(&self, space: SpaceId, index_ord: u32) -> usize {
        self.space_ref(space).indexes[index_ord as usize].len()
    }

    pub(crate) fn space_ref(&self, id: SpaceId) -> &Space {
        &self.spaces[id.raw()]
    }

    pub(crate) fn story(&self, id: StoryId) -> &Story {
        &self.stories[id.raw()]
    }

    pub(crate) fn story_mut(&mut self, id: StoryId) -> &mut Story {
        &mut self.stories[id.raw()]
    }

    pub(crate) fn stmt(&self, id: StmtId) -> &Statement {
        &self.stmts[id.raw()]
    }

    pub(crate) fn stmt_mut(&mut self, id: StmtId) -> &mut Statement {
        &mut self.stmts[id.raw()]
    }

    pub(crate) fn txn(&self, id: TxnId) -> &Transaction {
        &self.txns[id.raw()]
    }

    pub(crate) fn txn_mut(&mut self, id: TxnId) -> &mut Transaction {
        &mut self.txns[id.raw()]
    }

    /// Create a story for `tuple` on top of nothing: the caller links it
    /// into chains afterwards. Flips the tuple's DIRTY bit and schedules
    /// GC work.
    pub(crate) fn story_new(&mut self, space: SpaceId, tuple: TupleId) -> StoryId {
        self.must_do_gc_steps += GC_STEPS_SIZE;
        assert!(
            !self.tuples.is_dirty(tuple),
            "story_new on a tuple that already has history"
        );
        let index_count = self.space_ref(space).index_count();
        let link: SmallVec<[StoryLink; 2]> = (0..index_count)
            .map(|_| StoryLink {
                newer: None,
                older: None,
                in_index: true,
                read_gaps: Vec::new(),
            })
            .collect();
        let id = StoryId::new(self.stories.insert(Story {
            tuple,
            space,
            add_stmt: None,
            add_psn: 0,
            del_stmt: None,
            del_psn: 0,
            reader_list: Vec::new(),
            status: StoryStatus::Used,
            link,
            all_prev: self.all_tail,
            all_next: None,
        }));
        let replaced = self.history.insert(tuple, id);
        debug_assert!(replaced.is_none());
        self.tuples.set_dirty(tuple);

        match self.all_tail {
            Some(tail) => self.story_mut(tail).all_next = Some(id),
            None => self.all_head = Some(id),
        }
        self.all_tail = Some(id);
        id
    }

    /// Delete a fully detached story.
    ///
    /// Clears the DIRTY bit and frees the tuple itself when no index
    /// still binds it.
    pub(crate) fn story_delete(&mut self, story: StoryId) {
        {
            let s = self.story(story);
            debug_assert!(s.add_stmt.is_none());
            debug_assert!(s.del_stmt.is_none());
            debug_assert!(s.reader_list.is_empty());
            for link in &s.link {
                debug_assert!(link.newer.is_none());
                debug_assert!(link.older.is_none());
                debug_assert!(link.read_gaps.is_empty());
            }
        }

        if self.gc_cursor == Some(story) {
            self.gc_cursor = self.story(story).all_next;
        }
        let (prev, next) = {
            let s = self.story(story);
            (s.all_prev, s.all_next)
        };
        match prev {
            Some(p) => self.story_mut(p).all_next = next,
            None => self.all_head = next,
        }
        match next {
            Some(n) => self.story_mut(n).all_prev = prev,
            None => self.all_tail = prev,
        }

        let (tuple, space) = {
            let s = self.story(story);
            (s.tuple, s.space)
        };
        let removed = self.history.remove(&tuple);
        debug_assert_eq!(removed, Some(story));
        self.tuples.clear_dirty(tuple);

        let still_bound = self.space_ref(space).indexes.iter().any(|index| {
            let key = index.key_of(&self.tuples, tuple);
            index.get(key) == Some(tuple)
        });
        if !still_bound {
            self.tuples.free(tuple);
        }
        self.stories.remove(story.raw());
    }

    /// The story of a DIRTY tuple.
    ///
    /// # Panics
    ///
    /// Panics when the tuple has no story; a DIRTY tuple without history
    /// means the chain state is corrupt.
    pub(crate) fn story_get(&self, tuple: TupleId) -> StoryId {
        debug_assert!(self.tuples.is_dirty(tuple));
        let story = *self
            .history
            .get(&tuple)
            .expect("dirty tuple has no story in history");
        #[cfg(debug_assertions)]
        {
            let s = self.story(story);
            if let Some(add) = s.add_stmt {
                debug_assert_eq!(s.add_psn, self.txn(self.stmt(add).txn).psn);
            }
            if let Some(del) = s.del_stmt {
                debug_assert_eq!(s.del_psn, self.txn(self.stmt(del).txn).psn);
            }
        }
        story
    }

    /// Accessor mirror for tests and the facade.
    pub fn story_count(&self) -> usize {
        self.stories.len()
    }

    pub(crate) fn tracker(&self, id: TrackerId) -> &ReadTracker {
        &self.trackers[id.raw()]
    }

    pub(crate) fn gap(&self, id: GapId) -> &GapItem {
        &self.gaps[id.raw()]
    }

    pub(crate) fn hole(&self, id: HoleId) -> &PointHole {
        &self.holes[id.raw()]
    }

    /// Tear the manager down: release every transaction's read lists and
    /// destroy every remaining story without preserving the chain-head
    /// invariant. After this the manager holds no version state.
    pub fn teardown(&mut self) {
        let live = self.live_txns.clone();
        for txn in live {
            self.clear_txn_read_lists(txn);
        }

        let mut cursor = self.all_head;
        while let Some(story) = cursor {
            cursor = self.story(story).all_next;
            let count = self.story(story).index_count();
            for i in 0..count {
                self.story_mut(story).link[i].in_index = false;
            }
            self.full_unlink_on_space_delete(story);
            self.story_delete(story);
        }
        debug_assert!(self.history.is_empty());
        debug_assert!(self.point_holes.is_empty());
        tracing::debug!("transaction manager torn down");
    }
}

impl Default for TxManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_space_assigns_unique_index_ids() {
        let mut mgr = TxManager::new();
        let s1 = mgr.create_space(2);
        let s2 = mgr.create_space(1);
        let a = &mgr.space_ref(s1).indexes;
        let b = &mgr.space_ref(s2).indexes;
        assert_eq!(a[0].unique_id, 0);
        assert_eq!(a[1].unique_id, 1);
        assert_eq!(b[0].unique_id, 2);
    }

    #[test]
    fn test_story_new_marks_tuple_dirty_and_schedules_gc() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t = mgr.new_tuple(&[5]);
        assert_eq!(mgr.must_do_gc_steps, 0);
        let story = mgr.story_new(space, t);
        assert!(mgr.tuples.is_dirty(t));
        assert_eq!(mgr.story_get(t), story);
        assert_eq!(mgr.must_do_gc_steps, GC_STEPS_SIZE);
        assert_eq!(mgr.all_head, Some(story));
        assert_eq!(mgr.all_tail, Some(story));
    }

    #[test]
    fn test_story_delete_clears_history_and_frees_unbound_tuple() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t = mgr.new_tuple(&[5]);
        let story = mgr.story_new(space, t);
        assert_eq!(mgr.tuples.len(), 1);
        mgr.story_delete(story);
        assert_eq!(mgr.story_count(), 0);
        assert!(mgr.history.is_empty());
        // The tuple was never bound in an index, so it is reclaimed.
        assert_eq!(mgr.tuples.len(), 0);
        assert_eq!(mgr.all_head, None);
        assert_eq!(mgr.all_tail, None);
    }

    #[test]
    fn test_all_stories_list_keeps_creation_order() {
        let mut mgr = TxManager::new();
        let space = mgr.create_space(1);
        let t1 = mgr.new_tuple(&[1]);
        let t2 = mgr.new_tuple(&[2]);
        let t3 = mgr.new_tuple(&[3]);
        let s1 = mgr.story_new(space, t1);
        let s2 = mgr.story_new(space, t2);
        let s3 = mgr.story_new(space, t3);
        assert_eq!(mgr.all_head, Some(s1));
        assert_eq!(mgr.story(s1).all_next, Some(s2));
        assert_eq!(mgr.story(s2).all_next, Some(s3));
        assert_eq!(mgr.all_tail, Some(s3));

        // Deleting the middle story splices the list.
        mgr.story_delete(s2);
        assert_eq!(mgr.story(s1).all_next, Some(s3));
        assert_eq!(mgr.story(s3).all_prev, Some(s1));
    }
}
