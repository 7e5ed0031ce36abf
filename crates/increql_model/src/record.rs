//! Record types passed from the field executor into the Incremental Graph.
//!
//! [`DeferredFragmentRecord`] and [`StreamRecord`] here are deliberately
//! thin: they carry only the identity and addressing information
//! (`id`/`path`/`label`/`parent`) that is fixed at install time. The mutable
//! pending-work state — outstanding execution groups, reconciled results,
//! children — is owned by the graph's own slabs (`increql_runtime::graph`),
//! per the "mutable children/pending-work state held by the Incremental
//! Graph" note in the data model.

use crate::graphql_error::GraphQlError;
use crate::lazy::Lazy;
use crate::path::Path;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Stable identity of a [`DeferredFragmentRecord`] inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeferredFragmentId(pub usize);

/// Stable identity of a [`StreamRecord`] inside one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// One instance of a deferred fragment at a specific path.
#[derive(Debug, Clone)]
pub struct DeferredFragmentRecord {
    pub id: DeferredFragmentId,
    pub path: Path,
    pub label: Option<Arc<str>>,
    /// The fragment this one is nested under, or `None` at the root.
    pub parent: Option<DeferredFragmentId>,
}

/// One instance of a streamed list at a specific path, once installed in
/// the graph. Metadata only — the live source lives solely on the
/// [`NewStreamRecord`] that installed it.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: StreamId,
    pub path: Path,
    pub label: Option<Arc<str>>,
    /// The deferred fragment this stream is nested under, if any.
    pub parent: Option<DeferredFragmentId>,
}

/// A not-yet-installed stream: the field executor's one-shot handoff of a
/// streamed list's source to the graph. The graph assigns the
/// [`StreamId`] at install time; until then there is nothing to key on.
///
/// The source is `!Send` on purpose: the graph drives every pump on a
/// single `tokio::task::LocalSet` alongside the `!Send` [`Lazy`] thunks
/// (spec §5 "no data structure in the core requires a mutex"), so there is
/// no need to pay for a `Send` bound nothing here ever crosses a thread.
pub struct NewStreamRecord {
    pub path: Path,
    pub label: Option<Arc<str>>,
    /// The deferred fragment this stream is nested under, if any.
    pub parent: Option<DeferredFragmentId>,
    pub source: Pin<Box<dyn Stream<Item = StreamItemRecord>>>,
}

impl std::fmt::Debug for NewStreamRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewStreamRecord")
            .field("path", &self.path)
            .field("label", &self.label)
            .field("parent", &self.parent)
            .field("source", &"<stream>")
            .finish()
    }
}

impl NewStreamRecord {
    #[must_use]
    pub fn new(
        path: Path,
        label: Option<Arc<str>>,
        parent: Option<DeferredFragmentId>,
        source: impl Stream<Item = StreamItemRecord> + 'static,
    ) -> Self {
        Self {
            path,
            label,
            parent,
            source: Box::pin(source),
        }
    }
}

/// The result of one execution group: the work that, once reconciled,
/// contributes data to every [`DeferredFragmentId`] that named it.
///
/// Deliberately not `Clone`: `incremental_data_records` can carry a
/// [`NewStreamRecord`]'s live, single-consumer source stream. Callers
/// that need to fan a result out to several fragments (Publisher
/// best-identifier selection) clone `data`/`errors` individually instead
/// of the whole record.
#[derive(Debug)]
pub struct ExecutionGroupResult {
    pub data: Option<serde_json::Value>,
    pub errors: Vec<GraphQlError>,
    pub incremental_data_records: Vec<IncrementalDataRecord>,
}

impl ExecutionGroupResult {
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
            incremental_data_records: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<GraphQlError>) -> Self {
        self.errors = errors;
        self
    }

    #[must_use]
    pub fn with_children(mut self, records: Vec<IncrementalDataRecord>) -> Self {
        self.incremental_data_records = records;
        self
    }
}

/// One element produced by a stream's source: either a value (possibly
/// with its own field-level errors and nested incremental records) or the
/// terminal sentinel that ends the stream.
#[derive(Debug, Clone)]
pub enum StreamItemRecord {
    Item {
        value: serde_json::Value,
        errors: Vec<GraphQlError>,
        incremental_data_records: Vec<IncrementalDataRecord>,
    },
    End {
        errors: Vec<GraphQlError>,
    },
}

impl StreamItemRecord {
    #[must_use]
    pub fn item(value: serde_json::Value) -> Self {
        Self::Item {
            value,
            errors: Vec::new(),
            incremental_data_records: Vec::new(),
        }
    }

    #[must_use]
    pub fn end() -> Self {
        Self::End { errors: Vec::new() }
    }

    #[must_use]
    pub fn end_with_errors(errors: Vec<GraphQlError>) -> Self {
        Self::End { errors }
    }

    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}

/// One unit of work attached to one or more deferred fragments, as
/// produced by the field executor for a newly-initiated defer context.
///
/// `path` is the response position the grouped field set was executed at.
/// It is shared by every fragment named in `deferred_fragment_ids`; the
/// Publisher strips the best-matching fragment's own path from it to get
/// a `subPath` when a result is shared by fragments at different depths.
#[derive(Debug)]
pub struct DeferredGroupedFieldSetRecord {
    pub deferred_fragment_ids: Vec<DeferredFragmentId>,
    pub path: Path,
    pub result: Lazy<ExecutionGroupResult>,
}

/// The tagged union the field executor hands to
/// [`increql_runtime::graph::IncrementalGraph::get_new_pending`].
#[derive(Debug)]
pub enum IncrementalDataRecord {
    DeferredGroupedFieldSet(DeferredGroupedFieldSetRecord),
    NewStream(NewStreamRecord),
}

impl IncrementalDataRecord {
    #[must_use]
    pub fn deferred(
        ids: Vec<DeferredFragmentId>,
        path: Path,
        result: Lazy<ExecutionGroupResult>,
    ) -> Self {
        Self::DeferredGroupedFieldSet(DeferredGroupedFieldSetRecord {
            deferred_fragment_ids: ids,
            path,
            result,
        })
    }

    #[must_use]
    pub fn new_stream(record: NewStreamRecord) -> Self {
        Self::NewStream(record)
    }
}
