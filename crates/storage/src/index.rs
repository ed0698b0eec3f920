//! Unique index facade
//!
//! An index is an unordered unique map from an integer key (one tuple
//! field, chosen by the key definition) to the bound tuple. The only
//! mutation is `replace`, which swaps bindings and reports what was
//! bound before, so the layer above can maintain version chains on top
//! of the physical state.
//!
//! Uniqueness *policy* is split in two, as in the engine's design:
//! - [`Index::replace`] enforces only the physical mode checks
//!   (`Insert` needs an empty slot, `Replace` needs an occupied one);
//! - [`Index::check_dup`] holds the logical duplicate rules the
//!   transaction layer applies against *visible* tuples, which may
//!   differ from the physically bound ones.

use crate::tuple::TupleStore;
use rustc_hash::FxHashMap;
use tephra_core::{Error, Result, SpaceId, TupleId};

/// Position of the key field inside a row.
pub type KeyDef = u32;

/// Duplicate handling mode of a replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupMode {
    /// Bind the new tuple whether or not the slot was occupied.
    ReplaceOrInsert,
    /// The slot must be empty.
    Insert,
    /// The slot must be occupied.
    Replace,
}

/// A unique map of key to tuple.
#[derive(Debug)]
pub struct Index {
    /// Space this index belongs to.
    pub space_id: SpaceId,
    /// Globally unique id, stable across the whole database.
    pub unique_id: u32,
    /// Position of this index inside its space; 0 is the primary.
    pub dense_id: u32,
    /// Which field of a row this index keys on.
    pub key_def: KeyDef,
    map: FxHashMap<i64, TupleId>,
}

impl Index {
    /// Create an empty index.
    pub fn new(space_id: SpaceId, unique_id: u32, dense_id: u32, key_def: KeyDef) -> Self {
        Self {
            space_id,
            unique_id,
            dense_id,
            key_def,
            map: FxHashMap::default(),
        }
    }

    /// Key of a tuple under this index's key definition.
    pub fn key_of(&self, store: &TupleStore, tuple: TupleId) -> i64 {
        store.field(tuple, self.key_def)
    }

    /// The tuple bound at `key`, if any.
    pub fn get(&self, key: i64) -> Option<TupleId> {
        self.map.get(&key).copied()
    }

    /// Swap bindings: remove `old_tuple`, bind `new_tuple`, and return
    /// the tuple that was previously bound at the target key.
    ///
    /// With `new_tuple` present the binding at its key is installed and
    /// the displaced tuple returned; `old_tuple` names the same slot in
    /// that case and is only consulted when `new_tuple` is absent, which
    /// makes the call a removal.
    ///
    /// # Panics
    ///
    /// Panics when called with neither an old nor a new tuple; the
    /// engine never issues such a call.
    pub fn replace(
        &mut self,
        store: &TupleStore,
        old_tuple: Option<TupleId>,
        new_tuple: Option<TupleId>,
        mode: DupMode,
    ) -> Result<Option<TupleId>> {
        match (old_tuple, new_tuple) {
            (_, Some(new)) => {
                let key = self.key_of(store, new);
                let bound = self.map.get(&key).copied();
                // Displacing the expected old tuple is never an error;
                // the modes constrain what an *unexpected* slot state
                // may look like.
                if bound != old_tuple {
                    match mode {
                        DupMode::Insert if bound.is_some() => {
                            return Err(Error::DuplicateKey {
                                space: self.space_id,
                                index: self.dense_id,
                            });
                        }
                        DupMode::Replace if bound.is_none() => {
                            return Err(Error::MissingReplace {
                                space: self.space_id,
                            });
                        }
                        _ => {}
                    }
                }
                self.map.insert(key, new);
                Ok(bound)
            }
            (Some(old), None) => {
                let key = self.key_of(store, old);
                Ok(self.map.remove(&key))
            }
            (None, None) => panic!("index replace with neither old nor new tuple"),
        }
    }

    /// Logical duplicate rules, applied by the transaction layer against
    /// the *visible* tuple at the slot.
    ///
    /// `old_tuple` is the tuple the statement already expects to
    /// displace (if it knows one), `dup_tuple` is what is visibly bound.
    /// A replace must displace something; an insert must displace
    /// nothing; and whatever is displaced must be the expected tuple.
    pub fn check_dup(
        &self,
        old_tuple: Option<TupleId>,
        dup_tuple: Option<TupleId>,
        mode: DupMode,
    ) -> Result<()> {
        match dup_tuple {
            None => {
                if mode == DupMode::Replace {
                    debug_assert!(old_tuple.is_some());
                    return Err(Error::MissingReplace {
                        space: self.space_id,
                    });
                }
            }
            Some(dup) => {
                if Some(dup) != old_tuple && (old_tuple.is_some() || mode == DupMode::Insert) {
                    return Err(Error::DuplicateKey {
                        space: self.space_id,
                        index: self.dense_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no key is bound.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (TupleStore, Index) {
        let store = TupleStore::new();
        let index = Index::new(SpaceId::new(0), 0, 0, 0);
        (store, index)
    }

    #[test]
    fn test_replace_into_empty_slot_returns_none() {
        let (mut store, mut index) = setup();
        let t = store.insert(&[5]);
        let prev = index
            .replace(&store, None, Some(t), DupMode::ReplaceOrInsert)
            .unwrap();
        assert_eq!(prev, None);
        assert_eq!(index.get(5), Some(t));
    }

    #[test]
    fn test_replace_returns_displaced_tuple() {
        let (mut store, mut index) = setup();
        let a = store.insert(&[5]);
        let b = store.insert(&[5]);
        index
            .replace(&store, None, Some(a), DupMode::ReplaceOrInsert)
            .unwrap();
        let prev = index
            .replace(&store, None, Some(b), DupMode::ReplaceOrInsert)
            .unwrap();
        assert_eq!(prev, Some(a));
        assert_eq!(index.get(5), Some(b));
    }

    #[test]
    fn test_insert_mode_fails_on_occupied_slot() {
        let (mut store, mut index) = setup();
        let a = store.insert(&[5]);
        let b = store.insert(&[5]);
        index
            .replace(&store, None, Some(a), DupMode::Insert)
            .unwrap();
        let err = index
            .replace(&store, None, Some(b), DupMode::Insert)
            .unwrap_err();
        assert!(err.is_duplicate_key());
        // Failed replace leaves the binding untouched.
        assert_eq!(index.get(5), Some(a));
    }

    #[test]
    fn test_replace_mode_fails_on_empty_slot() {
        let (mut store, mut index) = setup();
        let a = store.insert(&[5]);
        let err = index
            .replace(&store, None, Some(a), DupMode::Replace)
            .unwrap_err();
        assert!(matches!(err, Error::MissingReplace { .. }));
    }

    #[test]
    fn test_insert_mode_tolerates_displacing_the_expected_tuple() {
        // The unwind path rebinds a displaced tuple in insert mode
        // while the slot still holds the tuple being rolled back; that
        // must not read as a duplicate.
        let (mut store, mut index) = setup();
        let a = store.insert(&[5]);
        let b = store.insert(&[5]);
        index
            .replace(&store, None, Some(a), DupMode::ReplaceOrInsert)
            .unwrap();
        let prev = index
            .replace(&store, Some(a), Some(b), DupMode::Insert)
            .unwrap();
        assert_eq!(prev, Some(a));
        assert_eq!(index.get(5), Some(b));
    }

    #[test]
    fn test_removal_unbinds_and_returns_previous() {
        let (mut store, mut index) = setup();
        let a = store.insert(&[5]);
        index
            .replace(&store, None, Some(a), DupMode::ReplaceOrInsert)
            .unwrap();
        let removed = index
            .replace(&store, Some(a), None, DupMode::Insert)
            .unwrap();
        assert_eq!(removed, Some(a));
        assert_eq!(index.get(5), None);
    }

    #[test]
    fn test_secondary_key_definition_extracts_other_field() {
        let mut store = TupleStore::new();
        let mut index = Index::new(SpaceId::new(0), 1, 1, 1);
        let t = store.insert(&[5, 42]);
        index
            .replace(&store, None, Some(t), DupMode::ReplaceOrInsert)
            .unwrap();
        assert_eq!(index.get(42), Some(t));
        assert_eq!(index.get(5), None);
    }

    #[test]
    fn test_check_dup_insert_rejects_any_visible_tuple() {
        let (mut store, index) = setup();
        let a = store.insert(&[5]);
        assert!(index.check_dup(None, None, DupMode::Insert).is_ok());
        assert!(index
            .check_dup(None, Some(a), DupMode::Insert)
            .unwrap_err()
            .is_duplicate_key());
    }

    #[test]
    fn test_check_dup_replace_requires_visible_tuple() {
        let (mut store, index) = setup();
        let a = store.insert(&[5]);
        assert!(index.check_dup(Some(a), None, DupMode::Replace).is_err());
        assert!(index.check_dup(Some(a), Some(a), DupMode::Replace).is_ok());
    }

    #[test]
    fn test_check_dup_expected_displacement_must_match() {
        let (mut store, index) = setup();
        let a = store.insert(&[5]);
        let b = store.insert(&[5]);
        // Expecting to displace `a` but `b` is visible.
        assert!(index
            .check_dup(Some(a), Some(b), DupMode::ReplaceOrInsert)
            .is_err());
        // Replace-or-insert with no expectation tolerates any occupant.
        assert!(index
            .check_dup(None, Some(b), DupMode::ReplaceOrInsert)
            .is_ok());
    }
}
