//! Physical layer for Tephra
//!
//! The row store underneath the transaction engine:
//! - [`TupleStore`]: arena of rows, each carrying a DIRTY bit that marks
//!   "this row has version history".
//! - [`Index`]: a unique map from an integer key to the bound tuple,
//!   with swap-semantics `replace`.
//! - [`Space`]: an ordered array of indexes; index 0 is the primary.
//!
//! Nothing in this crate knows about transactions. Visibility, version
//! chains and conflict tracking all live above, in `tephra-concurrency`;
//! this layer only answers "which tuple is physically bound here".

#![warn(clippy::all)]

pub mod index;
pub mod space;
pub mod tuple;

pub use index::{DupMode, Index, KeyDef};
pub use space::Space;
pub use tuple::{TupleData, TupleStore};
