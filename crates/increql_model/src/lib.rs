//! Data model for the incremental-delivery core.
//!
//! This crate owns the value types shared by every component of
//! `increql_runtime`: response [`path`]s, `@defer` [`defer`] usages and
//! target sets, [`field_group`] grouped field sets, the record types the
//! field executor hands to the Incremental Graph ([`record`]), the lazily
//! evaluated result wrapper ([`lazy`]), wire [`payload`] shapes, and the
//! crate's [`error`] type.

pub mod defer;
pub mod error;
pub mod field_group;
pub mod graphql_error;
pub mod lazy;
pub mod path;
pub mod payload;
pub mod record;

pub use defer::{masking_targets, DeferUsage, DeferUsageAllocator, Target, TargetSet};
pub use error::IncrementalError;
pub use field_group::{FieldDetails, FieldGroup, GroupedFieldSet};
pub use graphql_error::GraphQlError;
pub use lazy::Lazy;
pub use path::{Path, PathSegment};
pub use payload::{
    CompletedEntry, DeliveryGroupId, IncrementalEntry, InitialResult, PendingEntry,
    SubsequentResult,
};
pub use record::{
    DeferredFragmentId, DeferredFragmentRecord, DeferredGroupedFieldSetRecord,
    ExecutionGroupResult, IncrementalDataRecord, NewStreamRecord, StreamId, StreamItemRecord,
    StreamRecord,
};
