//! # Tephra
//!
//! An in-memory MVCC row store with snapshot-isolated transactions.
//!
//! Rows live in spaces, each indexed by one or more unique integer
//! keys. Transactions see a consistent snapshot: concurrent writers
//! stack versions instead of blocking each other, readers are demoted
//! to a frozen read view when a writer invalidates what they saw, and
//! write-write conflicts abort the loser at prepare time. An
//! incremental garbage collector reclaims versions nobody can reach.
//!
//! # Quick start
//!
//! ```
//! use tephradb::{Database, Fiber};
//!
//! fn main() -> tephradb::Result<()> {
//!     let mut db = Database::new();
//!     let space = db.create_space(1);
//!
//!     let mut fiber = Fiber::new();
//!     db.txn_begin(&mut fiber)?;
//!     db.insert(&fiber, space, &[5])?;
//!     db.txn_commit(&mut fiber)?;
//!
//!     assert_eq!(db.get(&fiber, space, 0, 5)?, Some(vec![5]));
//!     Ok(())
//! }
//! ```
//!
//! The transaction engine itself lives in `tephra-concurrency`; the
//! physical row store in `tephra-storage`. Only the facade in this
//! crate is meant for direct use.

pub mod db;

pub use db::{Database, Fiber};
pub use tephra_core::{Error, Result, SpaceId, TxnId};
