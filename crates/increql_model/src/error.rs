//! Programmer-contract violations.
//!
//! Field-level errors, null-propagation errors and stream-source errors are
//! all *data* (they travel inside [`crate::graphql_error::GraphQlError`] on
//! a payload); this enum covers only the "fail fast, not recoverable" kind
//! called out in spec §7 item 5: calls into the Incremental Graph that
//! violate its contract.

use thiserror::Error;

/// A contract violation raised by the Incremental Graph or Publisher.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IncrementalError {
    #[error("unknown deferred fragment id {0:?}")]
    UnknownDeferredFragment(crate::record::DeferredFragmentId),

    #[error("incremental data record installed after the output queue was closed")]
    EnqueueAfterDone,

    #[error("execution group result named a deferred fragment it was never attached to")]
    DanglingExecutionGroup,

    #[error("too many concurrently pending delivery groups (limit {limit})")]
    TooManyPendingGroups { limit: usize },
}
