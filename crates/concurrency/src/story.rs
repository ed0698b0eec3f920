//! Stories: per-tuple version records and their chains
//!
//! A story captures one version of a row together with the statements
//! that created and ended it. For every index of its space the story
//! sits in a doubly-linked chain ordered newest to oldest. Along a
//! chain the regions are, from the tail up: rolled back, committed,
//! prepared (ascending PSN), in-progress.
//!
//! Chain invariants:
//! 1. Exactly one story per chain carries the `in_index` mark, and the
//!    index physically binds that story's tuple: the chain head.
//! 2. Gap records accumulate only on the current head; every reorder
//!    that changes the head migrates them.
//!
//! All operations here are O(1) link surgery except [`TxManager::story_find_top`].

use crate::manager::TxManager;
use crate::statement::StmtId;
use crate::tracker::{GapId, TrackerId};
use smallvec::SmallVec;
use static_assertions::const_assert;
use tephra_core::{arena_id, Psn, SpaceId, TupleId, MIN_PSN};
use tephra_storage::DupMode;

/// Marker PSN stamped into `del_psn` of a rolled back story. Smaller
/// than every PSN a real transaction can hold, so the story is
/// invisible to everyone.
pub(crate) const ROLLBACKED_PSN: Psn = 1;

const_assert!(ROLLBACKED_PSN < MIN_PSN);

arena_id! {
    /// Handle to a version record.
    StoryId
}

/// Why the garbage collector last kept a story alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryStatus {
    /// Referenced by a statement, a reader, or the chain-head invariant.
    Used,
    /// Could still be observed through some read view.
    ReadView,
    /// Anchors gap records.
    TrackGap,
}

/// Per-index chain slot of a story.
#[derive(Debug)]
pub struct StoryLink {
    /// The adjacent newer version, towards the chain head.
    pub(crate) newer: Option<StoryId>,
    /// The adjacent older version, towards the tail.
    pub(crate) older: Option<StoryId>,
    /// Set iff this story's tuple is the one physically bound in the
    /// index, which makes this story the chain head.
    pub(crate) in_index: bool,
    /// Gap records anchored to this chain; populated only on the head.
    pub(crate) read_gaps: Vec<GapId>,
}

/// One version of a row.
pub struct Story {
    /// The row this version represents. Borrowed from the tuple arena;
    /// freed by the GC once the story dies and no index binds the row.
    pub(crate) tuple: TupleId,
    /// The space whose chains this story participates in.
    pub(crate) space: SpaceId,
    /// The statement that introduced this version. `None` once that
    /// statement committed, or when the version predates all history.
    pub(crate) add_stmt: Option<StmtId>,
    /// PSN of the introducing transaction; 0 while it is in progress.
    pub(crate) add_psn: Psn,
    /// Head of the list of in-progress statements deleting this
    /// version, threaded through `Statement::next_in_del_list`.
    pub(crate) del_stmt: Option<StmtId>,
    /// PSN of the deleting transaction; 0 while in progress,
    /// `ROLLBACKED_PSN` after rollback.
    pub(crate) del_psn: Psn,
    /// Transactions that observed this version.
    pub(crate) reader_list: Vec<TrackerId>,
    /// Last GC classification.
    pub(crate) status: StoryStatus,
    /// Chain slot per index of the owning space.
    pub(crate) link: SmallVec<[StoryLink; 2]>,
    /// Links in the manager's all-stories list.
    pub(crate) all_prev: Option<StoryId>,
    pub(crate) all_next: Option<StoryId>,
}

impl Story {
    /// Index count of the owning space at story creation.
    pub(crate) fn index_count(&self) -> usize {
        self.link.len()
    }
}

impl TxManager {
    /// Record that `stmt` introduced `story`.
    pub(crate) fn link_added_by(&mut self, story: StoryId, stmt: StmtId) {
        debug_assert!(self.story(story).add_stmt.is_none());
        debug_assert!(self.stmt(stmt).add_story.is_none());
        self.story_mut(story).add_stmt = Some(stmt);
        self.stmt_mut(stmt).add_story = Some(story);
    }

    pub(crate) fn unlink_added_by(&mut self, story: StoryId, stmt: StmtId) {
        debug_assert_eq!(self.stmt(stmt).add_story, Some(story));
        debug_assert_eq!(self.story(story).add_stmt, Some(stmt));
        self.stmt_mut(stmt).add_story = None;
        self.story_mut(story).add_stmt = None;
    }

    /// Record that `stmt` deletes `story`. Several in-progress
    /// statements may delete the same story; the new one becomes the
    /// list head.
    pub(crate) fn link_deleted_by(&mut self, story: StoryId, stmt: StmtId) {
        debug_assert!(self.stmt(stmt).del_story.is_none());
        debug_assert!(self.stmt(stmt).next_in_del_list.is_none());
        let head = self.story(story).del_stmt;
        let s = self.stmt_mut(stmt);
        s.del_story = Some(story);
        s.next_in_del_list = head;
        self.story_mut(story).del_stmt = Some(stmt);
    }

    /// Remove `stmt` from `story`'s deleter list.
    pub(crate) fn unlink_deleted_by(&mut self, story: StoryId, stmt: StmtId) {
        debug_assert_eq!(self.stmt(stmt).del_story, Some(story));
        if self.story(story).del_stmt == Some(stmt) {
            let next = self.stmt(stmt).next_in_del_list;
            self.story_mut(story).del_stmt = next;
        } else {
            let mut prev = self
                .story(story)
                .del_stmt
                .expect("deleter list does not contain the statement");
            while self.stmt(prev).next_in_del_list != Some(stmt) {
                prev = self
                    .stmt(prev)
                    .next_in_del_list
                    .expect("deleter list does not contain the statement");
            }
            let next = self.stmt(stmt).next_in_del_list;
            self.stmt_mut(prev).next_in_del_list = next;
        }
        let s = self.stmt_mut(stmt);
        s.next_in_del_list = None;
        s.del_story = None;
    }

    /// Chain `story` directly above `older` in index `idx`.
    pub(crate) fn story_link(&mut self, story: StoryId, older: Option<StoryId>, idx: usize) {
        debug_assert!(self.story(story).link[idx].older.is_none());
        let Some(older) = older else { return };
        debug_assert!(self.story(older).link[idx].newer.is_none());
        self.story_mut(story).link[idx].older = Some(older);
        self.story_mut(older).link[idx].newer = Some(story);
    }

    /// Undo [`TxManager::story_link`].
    pub(crate) fn story_unlink(&mut self, story: StoryId, older: Option<StoryId>, idx: usize) {
        debug_assert_eq!(self.story(story).link[idx].older, older);
        let Some(older) = older else { return };
        debug_assert_eq!(self.story(older).link[idx].newer, Some(story));
        self.story_mut(story).link[idx].older = None;
        self.story_mut(older).link[idx].newer = None;
    }

    /// Attach `new_top` as the head of the chain `old_top` heads in
    /// index `idx`.
    ///
    /// Two callers share this:
    /// - `is_new_tuple == true`: `new_top` is a freshly created story
    ///   whose tuple was just physically inserted; `old_top` (if any)
    ///   was the head before.
    /// - `is_new_tuple == false`: a reorder reached the head; `new_top`
    ///   was directly below `old_top` and the two swap. This performs
    ///   the physical `replace` so the index binds the new head's tuple.
    ///
    /// Either way the old head's gap records migrate to the new head.
    pub(crate) fn story_link_top(
        &mut self,
        new_top: StoryId,
        old_top: Option<StoryId>,
        idx: usize,
        is_new_tuple: bool,
    ) {
        debug_assert!(old_top.is_some() || is_new_tuple);
        let Some(old_top) = old_top else { return };
        debug_assert!(self.story(old_top).link[idx].in_index);
        debug_assert!(self.story(old_top).link[idx].newer.is_none());
        if is_new_tuple {
            debug_assert!(self.story(new_top).link[idx].newer.is_none());
            debug_assert!(self.story(new_top).link[idx].older.is_none());
        } else {
            debug_assert_eq!(self.story(new_top).link[idx].newer, Some(old_top));
            debug_assert_eq!(self.story(old_top).link[idx].older, Some(new_top));
        }

        if !is_new_tuple {
            let space = self.story(old_top).space;
            let old_tuple = self.story(old_top).tuple;
            let new_tuple = self.story(new_top).tuple;
            let removed = self.spaces[space.raw()].indexes[idx]
                .replace(&self.tuples, Some(old_tuple), Some(new_tuple), DupMode::Replace)
                .unwrap_or_else(|_| panic!("failed to rebind story in index"));
            assert_eq!(removed, Some(old_tuple));
        }

        if is_new_tuple {
            self.story_link(new_top, Some(old_top), idx);
            // `in_index` was set at story creation.
            debug_assert!(self.story(new_top).link[idx].in_index);
            self.story_mut(old_top).link[idx].in_index = false;
        } else {
            // older -> new_top -> old_top  becomes  older -> old_top -> new_top
            let older = self.story(new_top).link[idx].older;
            self.story_unlink(old_top, Some(new_top), idx);
            self.story_unlink(new_top, older, idx);
            self.story_link(new_top, Some(old_top), idx);
            self.story_link(old_top, older, idx);
            self.story_mut(new_top).link[idx].in_index = true;
            self.story_mut(old_top).link[idx].in_index = false;
        }

        // All gap records live on the head; carry them over.
        let moved = std::mem::take(&mut self.story_mut(old_top).link[idx].read_gaps);
        for &gap in &moved {
            self.gaps[gap.raw()].story = new_top;
        }
        self.story_mut(new_top).link[idx].read_gaps.extend(moved);
    }

    /// Swap `story` with its direct older neighbor `old_story` in index
    /// `idx`, pushing `story` one position towards the tail.
    pub(crate) fn story_reorder(&mut self, story: StoryId, old_story: StoryId, idx: usize) {
        debug_assert_eq!(self.story(story).link[idx].older, Some(old_story));
        debug_assert_eq!(self.story(old_story).link[idx].newer, Some(story));
        let newer = self.story(story).link[idx].newer;
        let older = self.story(old_story).link[idx].older;

        match newer {
            Some(newer) => {
                // Mid-chain: plain relink.
                // older -> old_story -> story -> newer  becomes
                // older -> story -> old_story -> newer
                self.story_unlink(newer, Some(story), idx);
                self.story_unlink(story, Some(old_story), idx);
                self.story_unlink(old_story, older, idx);
                self.story_link(newer, Some(old_story), idx);
                self.story_link(old_story, Some(story), idx);
                self.story_link(story, older, idx);
            }
            None => {
                // Swapping the two topmost stories changes the head, so
                // it goes through link_top to keep the bound tuple and
                // the gap records on the head.
                self.story_link_top(old_story, Some(story), idx, false);
            }
        }
    }

    /// The head of the chain `story` belongs to in index `idx`.
    pub(crate) fn story_find_top(&self, mut story: StoryId, idx: usize) -> StoryId {
        while let Some(newer) = self.story(story).link[idx].newer {
            story = newer;
        }
        story
    }
}
