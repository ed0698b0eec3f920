//! Tuple arena
//!
//! Rows are flat arrays of `i64` fields held in a slab arena and passed
//! around as [`TupleId`] handles. The engine never copies a row; indexes
//! bind ids and version records borrow them.
//!
//! Each row carries a DIRTY bit. DIRTY means "a version record exists
//! whose tuple is this row"; the transaction manager keeps the bit in
//! lockstep with its history map.

use slab::Slab;
use smallvec::SmallVec;
use tephra_core::TupleId;

/// A single row: its fields plus the DIRTY mark.
#[derive(Debug)]
pub struct TupleData {
    fields: SmallVec<[i64; 4]>,
    dirty: bool,
}

impl TupleData {
    /// Field at the given position.
    ///
    /// # Panics
    ///
    /// Panics if the position is out of bounds; a key definition never
    /// points past the row it indexes.
    pub fn field(&self, pos: u32) -> i64 {
        self.fields[pos as usize]
    }

    /// All fields of the row, in order.
    pub fn fields(&self) -> &[i64] {
        &self.fields
    }

    /// Whether the row has version history.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Arena of rows.
///
/// Allocation returns a stable [`TupleId`]; a row stays alive until
/// explicitly freed. The garbage collector frees rows once their version
/// record dies and no index binds them anymore.
#[derive(Debug, Default)]
pub struct TupleStore {
    tuples: Slab<TupleData>,
}

impl TupleStore {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a row with the given fields.
    pub fn insert(&mut self, fields: &[i64]) -> TupleId {
        let raw = self.tuples.insert(TupleData {
            fields: SmallVec::from_slice(fields),
            dirty: false,
        });
        TupleId::new(raw)
    }

    /// Free a row.
    ///
    /// The caller guarantees nothing references the id anymore.
    pub fn free(&mut self, id: TupleId) {
        self.tuples.remove(id.raw());
    }

    /// Borrow a row.
    pub fn get(&self, id: TupleId) -> &TupleData {
        &self.tuples[id.raw()]
    }

    /// Field `pos` of row `id`.
    pub fn field(&self, id: TupleId, pos: u32) -> i64 {
        self.get(id).field(pos)
    }

    /// Whether the row has version history.
    pub fn is_dirty(&self, id: TupleId) -> bool {
        self.get(id).dirty
    }

    /// Mark the row as having version history.
    pub fn set_dirty(&mut self, id: TupleId) {
        self.tuples[id.raw()].dirty = true;
    }

    /// Clear the version-history mark.
    pub fn clear_dirty(&mut self, id: TupleId) {
        self.tuples[id.raw()].dirty = false;
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    /// Whether the arena holds no rows.
    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read_fields() {
        let mut store = TupleStore::new();
        let t = store.insert(&[5, 7, 9]);
        assert_eq!(store.get(t).fields(), &[5, 7, 9]);
        assert_eq!(store.field(t, 0), 5);
        assert_eq!(store.field(t, 2), 9);
    }

    #[test]
    fn test_new_tuple_is_clean() {
        let mut store = TupleStore::new();
        let t = store.insert(&[1]);
        assert!(!store.is_dirty(t));
    }

    #[test]
    fn test_dirty_flag_round_trip() {
        let mut store = TupleStore::new();
        let t = store.insert(&[1]);
        store.set_dirty(t);
        assert!(store.is_dirty(t));
        store.clear_dirty(t);
        assert!(!store.is_dirty(t));
    }

    #[test]
    fn test_free_releases_slot() {
        let mut store = TupleStore::new();
        let a = store.insert(&[1]);
        let b = store.insert(&[2]);
        assert_eq!(store.len(), 2);
        store.free(a);
        assert_eq!(store.len(), 1);
        assert_eq!(store.field(b, 0), 2);
    }
}
