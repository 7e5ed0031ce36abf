//! The Incremental Coordinator (spec §4.4): the top-level driver.
//!
//! Builds the initial payload from the already-computed non-deferred
//! result, installs the first wave of incremental work into the
//! [`IncrementalGraph`], and exposes a [`SubsequentResultStream`] that
//! drains the graph's output queue, shapes each coalesced batch through the
//! [`PayloadPublisher`], and yields it to the consumer.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use futures::Stream;
use increql_model::{
    DeferredFragmentId, GraphQlError, IncrementalDataRecord, IncrementalError, InitialResult,
    Path, PendingEntry, SubsequentResult,
};
use tracing::debug;

use crate::graph::{CompletedUnit, FilterOutcome, IncrementalGraph, PendingAnnouncement};
use crate::publisher::PayloadPublisher;

/// Tunables a host application can legitimately set (spec §2 ambient
/// "Configuration"). The schema/transport layers that would normally own
/// such settings are a Non-goal here, but this crate's own resource guard
/// is not.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Caps the number of concurrently pending delivery groups a single
    /// execution may have outstanding at once. `None` disables the guard.
    pub max_pending_groups: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_pending_groups: Some(10_000),
        }
    }
}

/// The non-deferred grouped field set's result, as computed by the field
/// executor's caller before the coordinator is invoked.
#[derive(Debug, Clone)]
pub struct InitialExecutionResult {
    pub data: serde_json::Value,
    pub errors: Vec<GraphQlError>,
}

impl InitialExecutionResult {
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<GraphQlError>) -> Self {
        self.errors = errors;
        self
    }
}

/// Root-level delivery groups and work discovered alongside the initial
/// result, to be installed before the initial payload is built. Root
/// fragments must already have been registered against
/// [`IncrementalCoordinator::graph`] (so their ids exist to be named by
/// `records`) before this is handed to [`IncrementalCoordinator::execute`].
#[derive(Debug, Default)]
pub struct InitialInstall {
    pub root_fragments: Vec<DeferredFragmentId>,
    pub records: Vec<IncrementalDataRecord>,
}

impl InitialInstall {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_root_fragment(mut self, id: DeferredFragmentId) -> Self {
        self.root_fragments.push(id);
        self
    }

    #[must_use]
    pub fn with_records(mut self, records: Vec<IncrementalDataRecord>) -> Self {
        self.records = records;
        self
    }
}

/// The top-level driver (spec §4.4). Owns the [`IncrementalGraph`] and
/// [`PayloadPublisher`] for one execution.
pub struct IncrementalCoordinator {
    graph: IncrementalGraph,
    publisher: Rc<RefCell<PayloadPublisher>>,
    config: CoordinatorConfig,
}

impl IncrementalCoordinator {
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            graph: IncrementalGraph::new(),
            publisher: Rc::new(RefCell::new(PayloadPublisher::new())),
            config,
        }
    }

    /// The graph backing this execution. The field executor (external to
    /// this crate) registers deferred-fragment nodes against this handle
    /// (spec §4.2.1) before naming them in the [`IncrementalDataRecord`]s
    /// passed to [`Self::execute`] — there is no lazy "discover unknown
    /// ancestor" step here, see `DESIGN.md`.
    #[must_use]
    pub fn graph(&self) -> &IncrementalGraph {
        &self.graph
    }

    /// Builds the initial result from the non-deferred grouped field set,
    /// installs the first wave of incremental work, and returns the
    /// initial payload plus a lazy sequence of subsequent payloads (spec
    /// §4.4, §6 "The Coordinator exposes `{ initialResult,
    /// subsequentResults }`").
    pub fn execute(
        &self,
        initial: InitialExecutionResult,
        install: InitialInstall,
    ) -> Result<(InitialResult, SubsequentResultStream), IncrementalError> {
        let stream_pending = self.graph.get_new_pending(install.records)?;

        let mut pending: Vec<PendingAnnouncement> = install
            .root_fragments
            .into_iter()
            .map(PendingAnnouncement::Fragment)
            .collect();
        pending.extend(stream_pending);

        if let Some(limit) = self.config.max_pending_groups {
            if pending.len() > limit {
                return Err(IncrementalError::TooManyPendingGroups { limit });
            }
        }

        let pending_entries = self
            .publisher
            .borrow_mut()
            .pending_entries(&self.graph, &pending);

        let initial_result = if pending_entries.is_empty() {
            InitialResult::complete(initial.data, initial.errors)
        } else {
            InitialResult::with_pending(initial.data, initial.errors, pending_entries)
        };

        debug!(pending = pending.len(), "built initial payload");

        let stream = SubsequentResultStream::new(self.graph.clone(), Rc::clone(&self.publisher));
        Ok((initial_result, stream))
    }

    /// Null-propagation filter (spec §4.4, §7 item 2): a non-null field
    /// resolving to null with errors at `path` invalidates every delivery
    /// group rooted underneath it. Removing a stream drops its boxed
    /// source, this crate's stand-in for "call `return()` on the source
    /// async iterator and swallow any error it raises" — a `Drop` cannot
    /// raise one at all, see `DESIGN.md`.
    pub fn filter(&self, path: &Path) -> FilterOutcome {
        self.graph.filter(path)
    }
}

type NextBatchFuture = Pin<Box<dyn Future<Output = Option<Vec<CompletedUnit>>>>>;

/// The lazy, cancellable sequence of subsequent payloads (spec §6). Rust's
/// [`Stream`] trait has no `return()`/`throw()` analogue, so [`Self::cancel`]
/// is the idiomatic equivalent: an explicit handle type with its own
/// lifecycle method rather than overloading the generic iterator protocol.
pub struct SubsequentResultStream {
    graph: IncrementalGraph,
    publisher: Rc<RefCell<PayloadPublisher>>,
    pending_fetch: Option<NextBatchFuture>,
    done: bool,
}

impl SubsequentResultStream {
    fn new(graph: IncrementalGraph, publisher: Rc<RefCell<PayloadPublisher>>) -> Self {
        Self {
            graph,
            publisher,
            pending_fetch: None,
            done: false,
        }
    }

    /// Consumer-initiated cancellation (spec §5 "Consumer `return()` ⇒
    /// mark done; resolve all pending awaits; call `return()` on every
    /// live stream's source async iterator; never throws"). Bounded:
    /// drops every live node (and with it, every boxed stream source) and
    /// leaves the stream permanently exhausted.
    pub async fn cancel(mut self) {
        self.graph.cancel();
        self.done = true;
    }

    fn build_payload(&self, units: Vec<CompletedUnit>) -> SubsequentResult {
        let mut pending_entries: Vec<PendingEntry> = Vec::new();
        let mut incremental = Vec::new();
        let mut completed = Vec::new();
        let mut publisher = self.publisher.borrow_mut();

        let mut announce = |publisher: &mut PayloadPublisher,
                             pending_entries: &mut Vec<PendingEntry>,
                             ann: PendingAnnouncement| {
            pending_entries.push(match ann {
                PendingAnnouncement::Fragment(fid) => {
                    publisher.pending_entry_for_fragment(&self.graph, fid)
                }
                PendingAnnouncement::Stream(sid) => {
                    publisher.pending_entry_for_stream(&self.graph, sid)
                }
            });
        };

        for unit in units {
            match unit {
                CompletedUnit::NewPending(ann) => {
                    announce(&mut publisher, &mut pending_entries, ann);
                }
                CompletedUnit::Reconciled { fragments } => {
                    for fid in fragments {
                        let Some(completion) = self.graph.complete_deferred_fragment(fid) else {
                            // Still has outstanding execution groups, or a
                            // sibling `Reconciled` unit earlier in this same
                            // batch already completed it (spec §4.2.4).
                            continue;
                        };

                        // A reconciled group with no `data` is a fragment-
                        // level error (non-null propagation reached the
                        // defer boundary itself): it contributes only to
                        // the completed entry's errors, never an
                        // `incremental` entry (spec §8 scenario 4).
                        let (ok, errored): (Vec<_>, Vec<_>) = completion
                            .reconciled
                            .into_iter()
                            .partition(|group| group.data.is_some());

                        incremental.extend(publisher.resolve_incremental_defer(&ok));

                        let fragment_errors: Vec<GraphQlError> =
                            errored.into_iter().flat_map(|g| g.errors).collect();
                        completed.push(
                            publisher.completed_entry_for_fragment(fid, fragment_errors),
                        );

                        for ann in completion.newly_pending {
                            announce(&mut publisher, &mut pending_entries, ann);
                        }
                    }
                }
                CompletedUnit::StreamBatch {
                    stream,
                    items,
                    errors,
                } => {
                    incremental.push(publisher.resolve_stream_batch(stream, items, errors));
                }
                CompletedUnit::StreamEnd { stream, errors } => {
                    completed.push(publisher.completed_entry_for_stream(stream, errors));
                }
            }
        }

        let has_next = !self.graph.is_done();
        SubsequentResult {
            pending: pending_entries,
            incremental,
            completed,
            has_next,
        }
    }
}

impl Stream for SubsequentResultStream {
    type Item = SubsequentResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.graph.is_done() {
            // Nothing pending: no further completion can ever arrive, so
            // awaiting `next_batch` here would hang forever.
            this.done = true;
            return Poll::Ready(None);
        }

        loop {
            if this.pending_fetch.is_none() {
                let graph = this.graph.clone();
                this.pending_fetch = Some(Box::pin(async move { graph.next_batch().await }));
            }

            let fut = this.pending_fetch.as_mut().expect("just inserted");
            match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.pending_fetch = None;
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(units)) => {
                    this.pending_fetch = None;
                    let payload = this.build_payload(units);
                    if payload.is_empty() && payload.has_next {
                        // An intermediate execution group reconciled but
                        // didn't complete its fragment: nothing to show
                        // yet (spec §8 "an empty payload is never
                        // emitted"). Keep draining.
                        continue;
                    }
                    if !payload.has_next {
                        this.done = true;
                    }
                    return Poll::Ready(Some(payload));
                }
            }
        }
    }
}
