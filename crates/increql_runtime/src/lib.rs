//! The incremental-delivery core: Field Plan Builder, Incremental Graph,
//! Payload Publisher and Incremental Coordinator.
//!
//! - [`field_plan`]: partitions selected fields into the current delivery
//!   boundary's grouped field set and newly-initiated defer buckets.
//! - [`graph`]: the mutable dependency graph of deferred fragments and
//!   streams, and its demand-driven output queue.
//! - [`publisher`]: shapes completed records into wire payloads.
//! - [`coordinator`]: the top-level driver tying the three together.

pub mod coordinator;
pub mod field_plan;
pub mod graph;
pub mod publisher;

pub use coordinator::{
    CoordinatorConfig, IncrementalCoordinator, InitialExecutionResult, InitialInstall,
    SubsequentResultStream,
};
pub use field_plan::{build_field_plan, FieldPlan, NewGroupedFieldSetDetails};
pub use graph::{
    CompletedUnit, FilterOutcome, FragmentCompletion, FragmentInstall, IncrementalGraph,
    PendingAnnouncement, ReconciledGroup,
};
pub use publisher::PayloadPublisher;
