//! Id newtypes and the PSN domain
//!
//! All cross-references in the engine are arena indices wrapped in
//! newtypes. An id is only meaningful together with the manager that
//! owns the arena it points into; ids are never reused while the
//! referent is alive.

/// Prepare sequence number.
///
/// Assigned to a transaction when it starts to prepare, from a
/// monotonically increasing counter. The prepare order defines the
/// serialization order of transactions. `0` means "not prepared yet".
pub type Psn = i64;

/// The smallest PSN a real transaction can be assigned.
///
/// Values below this threshold are reserved for the transaction
/// manager's internal use (for example the marker stamped on rolled
/// back versions).
pub const MIN_PSN: Psn = 2;

/// Declare an arena id newtype.
///
/// Used here for the ids every layer shares and by `tephra-concurrency`
/// for the ids private to the transaction engine (stories, statements,
/// trackers).
#[macro_export]
macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            /// Wrap a raw arena slot.
            pub fn new(raw: usize) -> Self {
                Self(raw)
            }

            /// The raw arena slot this id points at.
            pub fn raw(self) -> usize {
                self.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

arena_id! {
    /// Handle to a row in the tuple arena.
    TupleId
}

arena_id! {
    /// Handle to a space (a table with its indexes).
    SpaceId
}

arena_id! {
    /// Handle to a live transaction.
    TxnId
}
