//! Spaces
//!
//! A space is a table: an ordered array of unique indexes over the same
//! rows. Index 0 is the primary index. Every index keys on a single
//! field, and index `i` keys on field `i` of the row, so a row must have
//! at least as many fields as its space has indexes.

use crate::index::Index;
use tephra_core::SpaceId;

/// A table with its indexes.
#[derive(Debug)]
pub struct Space {
    /// Handle of this space.
    pub id: SpaceId,
    /// The indexes, primary first.
    pub indexes: Vec<Index>,
}

impl Space {
    /// Create a space with `index_count` unique indexes.
    ///
    /// `next_unique_id` is the database-wide index id counter; it is
    /// advanced by one per created index.
    pub fn new(id: SpaceId, index_count: usize, next_unique_id: &mut u32) -> Self {
        assert!(index_count > 0, "a space needs at least a primary index");
        let indexes = (0..index_count)
            .map(|i| {
                let unique_id = *next_unique_id;
                *next_unique_id += 1;
                Index::new(id, unique_id, i as u32, i as u32)
            })
            .collect();
        Self { id, indexes }
    }

    /// The primary index.
    pub fn primary(&self) -> &Index {
        &self.indexes[0]
    }

    /// Number of indexes.
    pub fn index_count(&self) -> usize {
        self.indexes.len()
    }
}
