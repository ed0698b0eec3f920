//! Shared vocabulary for Tephra
//!
//! This crate holds the types every layer speaks: arena id newtypes,
//! the prepare-sequence-number (PSN) domain, and the unified error type.
//! It has no behavior of its own.

#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Psn, SpaceId, TupleId, TxnId, MIN_PSN};
