//! Engine invariant checks
//!
//! [`TxManager::validate`] walks the whole object graph and asserts the
//! structural invariants the engine maintains. It is meant for tests
//! and debugging; production code never calls it.

use crate::manager::TxManager;
use crate::story::ROLLBACKED_PSN;
use tephra_core::MIN_PSN;

impl TxManager {
    /// Assert every structural invariant of the engine state.
    ///
    /// # Panics
    ///
    /// Panics on the first violation, with a message naming it.
    pub fn validate(&self) {
        self.validate_history();
        self.validate_chains();
        self.validate_statements();
        self.validate_read_views();
        self.validate_trackers();
    }

    /// The history map and the DIRTY bits agree, both ways.
    fn validate_history(&self) {
        for (&tuple, &story) in &self.history {
            assert!(
                self.tuples.is_dirty(tuple),
                "tuple in history must be dirty"
            );
            assert_eq!(
                self.story(story).tuple,
                tuple,
                "history entry points at a story of another tuple"
            );
        }
        for (raw, _) in self.stories.iter() {
            let story = crate::story::StoryId::new(raw);
            assert!(
                self.history.contains_key(&self.story(story).tuple),
                "story not registered in history"
            );
        }
    }

    /// Chain structure: consistent back links, exactly one in-index
    /// story per chain (the head), the physical binding matching it,
    /// and rolled back stories only at the tail.
    fn validate_chains(&self) {
        for (raw, _) in self.stories.iter() {
            let story = crate::story::StoryId::new(raw);
            let s = self.story(story);
            let space = self.space_ref(s.space);
            assert_eq!(s.index_count(), space.index_count());

            for (i, link) in s.link.iter().enumerate() {
                if let Some(newer) = link.newer {
                    assert_eq!(
                        self.story(newer).link[i].older,
                        Some(story),
                        "chain back link broken"
                    );
                }
                if let Some(older) = link.older {
                    assert_eq!(
                        self.story(older).link[i].newer,
                        Some(story),
                        "chain forward link broken"
                    );
                }
                if link.in_index {
                    assert!(
                        link.newer.is_none(),
                        "a story below the head claims to be in the index"
                    );
                    let index = &space.indexes[i];
                    let key = index.key_of(&self.tuples, s.tuple);
                    assert_eq!(
                        index.get(key),
                        Some(s.tuple),
                        "index does not bind the chain head's tuple"
                    );
                } else if link.newer.is_none() {
                    panic!("chain head without the in-index mark");
                }
                if !link.read_gaps.is_empty() {
                    assert!(
                        link.newer.is_none(),
                        "gap records anchored below the chain head"
                    );
                }
                // Rolled back stories sink to the tail: everything
                // below one is rolled back too.
                if s.del_psn == ROLLBACKED_PSN {
                    if let Some(older) = link.older {
                        assert_eq!(
                            self.story(older).del_psn,
                            ROLLBACKED_PSN,
                            "live story below a rolled back one"
                        );
                    }
                }
            }
        }
    }

    /// Statement and story cross-links agree; PSN bookkeeping matches
    /// the statement states.
    fn validate_statements(&self) {
        for (raw, _) in self.stories.iter() {
            let story = crate::story::StoryId::new(raw);
            let s = self.story(story);
            if let Some(add) = s.add_stmt {
                assert_eq!(
                    self.stmt(add).add_story,
                    Some(story),
                    "add statement does not point back"
                );
                assert_eq!(
                    s.add_psn,
                    self.txn(self.stmt(add).txn).psn,
                    "add PSN diverges from the owning transaction"
                );
            } else if s.add_psn != 0 {
                assert!(s.add_psn >= MIN_PSN, "committed story with a reserved PSN");
            }
            let mut dels = s.del_stmt;
            while let Some(del) = dels {
                assert_eq!(
                    self.stmt(del).del_story,
                    Some(story),
                    "deleter does not point back"
                );
                dels = self.stmt(del).next_in_del_list;
            }
        }
        for (raw, stmt) in self.stmts.iter() {
            let id = crate::statement::StmtId::new(raw);
            if let Some(add) = stmt.add_story {
                assert_eq!(self.story(add).add_stmt, Some(id));
            }
            if let Some(del) = stmt.del_story {
                let mut found = false;
                let mut dels = self.story(del).del_stmt;
                while let Some(d) = dels {
                    if d == id {
                        found = true;
                        break;
                    }
                    dels = self.stmt(d).next_in_del_list;
                }
                assert!(found, "statement missing from its story's deleter list");
            }
        }
    }

    /// The read-view list is sorted by `rv_psn`, non-decreasing, and
    /// only holds transactions that are actually in a read view.
    fn validate_read_views(&self) {
        let mut last = 0;
        for &txn in &self.read_view_txns {
            let rv_psn = self.txn(txn).rv_psn;
            assert!(rv_psn >= last, "read view list out of order");
            assert_ne!(rv_psn, 0, "read view member without a horizon");
            last = rv_psn;
        }
    }

    /// Tracker, gap and point-hole membership is mirrored on both ends.
    fn validate_trackers(&self) {
        for (raw, tracker) in self.trackers.iter() {
            let id = crate::tracker::TrackerId::new(raw);
            assert!(
                self.story(tracker.story).reader_list.contains(&id),
                "tracker missing from its story"
            );
            assert!(
                self.txn(tracker.reader).read_set.contains(&id),
                "tracker missing from its transaction"
            );
        }
        for (raw, gap) in self.gaps.iter() {
            let id = crate::tracker::GapId::new(raw);
            assert!(
                self.story(gap.story).link[gap.index as usize]
                    .read_gaps
                    .contains(&id),
                "gap record missing from its anchor"
            );
            assert!(
                self.txn(gap.txn).gap_list.contains(&id),
                "gap record missing from its transaction"
            );
        }
        for (raw, hole) in self.holes.iter() {
            let id = crate::tracker::HoleId::new(raw);
            let bucket = self
                .point_holes
                .get(&(hole.index_unique_id, hole.key))
                .expect("point hole missing from the hash");
            assert!(bucket.contains(&id), "point hole missing from its bucket");
            assert!(
                self.txn(hole.txn).point_holes_list.contains(&id),
                "point hole missing from its transaction"
            );
        }
    }
}
