//! Read, gap and point-hole tracking
//!
//! Serializability of reads rests on three kinds of records:
//!
//! - A [`ReadTracker`] pins "transaction T observed version V". If a
//!   writer later invalidates V, T is demoted to a read view or aborted.
//! - An [`GapItem`] pins "T looked past version V and saw nothing
//!   older". It anchors to the chain head, and migrates whenever the
//!   head changes.
//! - A [`PointHole`] pins "T probed (index, key) and found an empty
//!   chain". There is no story to anchor to yet, so the record lives in
//!   the manager's hash until a first insert materializes the chain,
//!   at which point the hole converts into a gap item on the new head.
//!
//! All three are owned by their transaction and die when its read lists
//! are cleared (at prepare-finalize or rollback).

use crate::manager::TxManager;
use crate::story::StoryId;
use crate::transaction::TxnStatus;
use tephra_core::{arena_id, SpaceId, TupleId, TxnId};

arena_id! {
    /// Handle to a read tracker.
    TrackerId
}

arena_id! {
    /// Handle to an inplace gap item.
    GapId
}

arena_id! {
    /// Handle to a point-hole item.
    HoleId
}

/// "Transaction `reader` observed story `story`."
#[derive(Debug, Clone, Copy)]
pub struct ReadTracker {
    pub(crate) reader: TxnId,
    pub(crate) story: StoryId,
}

/// "Transaction `txn` saw nothing older than the head `story` in index
/// `index`." Anchored in `story.link[index].read_gaps`.
#[derive(Debug, Clone, Copy)]
pub struct GapItem {
    pub(crate) txn: TxnId,
    pub(crate) story: StoryId,
    pub(crate) index: u32,
}

/// "Transaction `txn` probed `key` in the index with `index_unique_id`
/// and found nothing." Keyed in the manager's point-hole hash.
#[derive(Debug, Clone, Copy)]
pub struct PointHole {
    pub(crate) txn: TxnId,
    pub(crate) index_unique_id: u32,
    pub(crate) key: i64,
}

impl TxManager {
    /// Record that `txn` read `story`.
    ///
    /// A repeated read of the same story moves the existing tracker to
    /// the front of both lists, so hot stories are found fast on the
    /// next lookup.
    pub(crate) fn track_read_story(&mut self, txn: TxnId, story: StoryId) {
        let existing = self
            .story(story)
            .reader_list
            .iter()
            .copied()
            .find(|&t| self.tracker(t).reader == txn);
        let tracker = match existing {
            Some(tracker) => {
                let readers = &mut self.story_mut(story).reader_list;
                if let Some(pos) = readers.iter().position(|&t| t == tracker) {
                    readers.remove(pos);
                }
                let read_set = &mut self.txn_mut(txn).read_set;
                if let Some(pos) = read_set.iter().position(|&t| t == tracker) {
                    read_set.remove(pos);
                }
                tracker
            }
            None => TrackerId::new(self.trackers.insert(ReadTracker { reader: txn, story })),
        };
        self.story_mut(story).reader_list.insert(0, tracker);
        self.txn_mut(txn).read_set.insert(0, tracker);
    }

    /// Record that `txn` read `tuple`. Creates the story when the tuple
    /// has no history yet.
    pub(crate) fn track_read(&mut self, txn: TxnId, space: SpaceId, tuple: Option<TupleId>) {
        let Some(tuple) = tuple else { return };
        if self.tuples.is_dirty(tuple) {
            let story = self.story_get(tuple);
            self.track_read_story(txn, story);
        } else {
            let story = self.story_new(space, tuple);
            let tracker = TrackerId::new(self.trackers.insert(ReadTracker { reader: txn, story }));
            self.story_mut(story).reader_list.insert(0, tracker);
            self.txn_mut(txn).read_set.insert(0, tracker);
        }
    }

    /// Record that `txn` saw nothing beyond the head `story` in index
    /// `index`.
    pub(crate) fn track_story_gap(&mut self, txn: TxnId, story: StoryId, index: u32) {
        debug_assert!(self.story(story).link[index as usize].newer.is_none());
        let gap = GapId::new(self.gaps.insert(GapItem { txn, story, index }));
        self.story_mut(story).link[index as usize].read_gaps.push(gap);
        self.txn_mut(txn).gap_list.push(gap);
    }

    /// Delete a gap item from its anchor and its transaction.
    pub(crate) fn gap_item_delete(&mut self, gap: GapId) {
        let GapItem { txn, story, index } = self.gaps[gap.raw()];
        let gaps = &mut self.story_mut(story).link[index as usize].read_gaps;
        if let Some(pos) = gaps.iter().position(|&g| g == gap) {
            gaps.remove(pos);
        }
        let list = &mut self.txn_mut(txn).gap_list;
        if let Some(pos) = list.iter().position(|&g| g == gap) {
            list.remove(pos);
        }
        self.gaps.remove(gap.raw());
    }

    /// Record that `txn` probed `key` in index `index_ord` of `space`
    /// and found nothing. Only in-progress transactions are tracked: a
    /// read view is already frozen and cannot conflict on phantoms.
    pub(crate) fn track_point(&mut self, txn: TxnId, space: SpaceId, index_ord: u32, key: i64) {
        if self.txn(txn).status != TxnStatus::InProgress {
            return;
        }
        let unique_id = self.space_ref(space).indexes[index_ord as usize].unique_id;
        let hole = HoleId::new(self.holes.insert(PointHole {
            txn,
            index_unique_id: unique_id,
            key,
        }));
        self.point_holes
            .entry((unique_id, key))
            .or_default()
            .push(hole);
        self.txn_mut(txn).point_holes_list.push(hole);
    }

    /// Delete a point-hole item from the hash and its transaction.
    pub(crate) fn point_hole_delete(&mut self, hole: HoleId) {
        let PointHole {
            txn,
            index_unique_id,
            key,
        } = self.holes[hole.raw()];
        if let Some(bucket) = self.point_holes.get_mut(&(index_unique_id, key)) {
            if let Some(pos) = bucket.iter().position(|&h| h == hole) {
                bucket.remove(pos);
            }
            if bucket.is_empty() {
                self.point_holes.remove(&(index_unique_id, key));
            }
        }
        let list = &mut self.txn_mut(txn).point_holes_list;
        if let Some(pos) = list.iter().position(|&h| h == hole) {
            list.remove(pos);
        }
        self.holes.remove(hole.raw());
    }

    /// A statement inserted `story` into a previously empty slot of
    /// index `index_ord`: convert every point hole recorded for that
    /// slot into a gap item on the new chain head.
    pub(crate) fn handle_point_hole_write(
        &mut self,
        space: SpaceId,
        story: StoryId,
        index_ord: u32,
    ) {
        debug_assert!(self.story(story).link[index_ord as usize].newer.is_none());
        let index = &self.space_ref(space).indexes[index_ord as usize];
        let unique_id = index.unique_id;
        let key = index.key_of(&self.tuples, self.story(story).tuple);
        let Some(bucket) = self.point_holes.remove(&(unique_id, key)) else {
            return;
        };
        for hole in bucket {
            let txn = self.hole(hole).txn;
            self.track_story_gap(txn, story, index_ord);
            let list = &mut self.txn_mut(txn).point_holes_list;
            if let Some(pos) = list.iter().position(|&h| h == hole) {
                list.remove(pos);
            }
            self.holes.remove(hole.raw());
        }
    }

    /// Release every read-side record of `txn`: point holes, gap items,
    /// read trackers, and its read-view membership. Called when the
    /// transaction prepares (the records have served their purpose) or
    /// rolls back.
    pub(crate) fn clear_txn_read_lists(&mut self, txn: TxnId) {
        while let Some(&hole) = self.txn(txn).point_holes_list.last() {
            self.point_hole_delete(hole);
        }
        while let Some(&gap) = self.txn(txn).gap_list.last() {
            self.gap_item_delete(gap);
        }
        let read_set = std::mem::take(&mut self.txn_mut(txn).read_set);
        for tracker in read_set {
            let story = self.tracker(tracker).story;
            let readers = &mut self.story_mut(story).reader_list;
            if let Some(pos) = readers.iter().position(|&t| t == tracker) {
                readers.remove(pos);
            }
            self.trackers.remove(tracker.raw());
        }
        if let Some(pos) = self.read_view_txns.iter().position(|&t| t == txn) {
            self.read_view_txns.remove(pos);
        }
    }
}
