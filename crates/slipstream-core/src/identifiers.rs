//! Strongly typed identifiers shared across the runtime.
//!
//! Every id is a transparent newtype so that an origin id cannot be passed
//! where a pipeline id is expected. All of them are `Copy`, ordered and
//! hashable, and display as their raw value.

use std::fmt;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident($raw:ty)) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Default,
            serde::Serialize,
            serde::Deserialize,
            rkyv::Archive,
            rkyv::Serialize,
            rkyv::Deserialize,
        )]
        pub struct $name(pub $raw);

        impl $name {
            /// Returns the raw value of this identifier.
            #[inline]
            #[must_use]
            pub const fn raw(self) -> $raw {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$raw> for $name {
            fn from(raw: $raw) -> Self {
                Self(raw)
            }
        }
    };
}

identifier!(
    /// Logical source of tuples that is sequenced independently.
    OriginId(u64)
);

identifier!(
    /// Index of a worker thread inside a [`QueryManager`](crate::engine::QueryManager).
    WorkerThreadId(usize)
);

identifier!(
    /// Identifier of an executable pipeline.
    PipelineId(u64)
);

identifier!(
    /// Identifier of a deployed query.
    QueryId(u64)
);

identifier!(
    /// Identifier of an operator handler within a query.
    OperatorHandlerId(u64)
);

impl OriginId {
    /// Origin id used for buffers that were never stamped by a source.
    pub const INVALID: Self = Self(0);
}
