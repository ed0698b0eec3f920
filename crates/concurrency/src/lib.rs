//! The transaction history engine
//!
//! Snapshot-isolated MVCC over the physical row store in
//! `tephra-storage`. Every mutated or observed row gets a [`Story`]: a
//! version record woven into one doubly-linked chain per index. The
//! engine decides which version each transaction sees, tracks what each
//! transaction has read (including the *absence* of rows), and at
//! prepare time demotes or aborts the transactions whose observations a
//! writer has invalidated.
//!
//! The [`TxManager`] owns every arena and coordinates:
//! - story chains and their ordering invariants ([`story`]),
//! - read, gap and point-hole trackers ([`tracker`]),
//! - visibility rules and the clarifying read path ([`visibility`]),
//! - the statement state machine ([`statement`]),
//! - the transaction lifecycle and read views ([`transaction`]),
//! - incremental garbage collection of dead versions ([`gc`]).
//!
//! The engine is single-threaded by design: one cooperative task drives
//! the manager at a time, so the manager is a plain owned value passed
//! by `&mut` rather than a shared handle behind a lock.

#![warn(clippy::all)]

pub mod gc;
pub mod manager;
pub mod statement;
pub mod story;
pub mod tracker;
pub mod transaction;
pub mod validation;
pub mod visibility;

pub use manager::TxManager;
pub use statement::StmtId;
pub use story::{Story, StoryId, StoryStatus};
pub use transaction::{Transaction, TxnStatus};
