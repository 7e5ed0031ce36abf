//! The Incremental Graph (spec §4.2).
//!
//! Owns every [`DeferredFragmentRecord`]/[`StreamRecord`] node installed
//! for one execution, the execution groups attached to each fragment, the
//! reconcilable results waiting to be released, and the single output
//! queue that feeds the [`crate::coordinator::IncrementalCoordinator`].
//!
//! **Node identity vs. pending announcement.** Deferred fragments are
//! installed through [`IncrementalGraph::register_fragment`], a
//! synchronous call that returns immediately whether the new node is a
//! root (announced pending right away, matching "installs new nodes...
//! emits the initial payload" in spec §4.4) or nested under a
//! still-running parent (attached to `parent.children`, promoted later).
//! Streams carry their source handle, so they are installed only through
//! [`IncrementalGraph::get_new_pending`], which decides the same way.
//!
//! This sidesteps a dynamic "walk the `.parent` chain to discover unknown
//! ancestor nodes" step: our caller (the
//! [`crate::coordinator::IncrementalCoordinator`], playing the field
//! executor's role) always registers a fragment before handing out its
//! id, so ancestors are never discovered lazily. See `DESIGN.md`.
//!
//! **Concurrency.** Every execution group's lazy result and every stream
//! pump runs as a `tokio::task::LocalSet` task (spec §5: single-threaded
//! cooperative, no mutex). The graph's mutable state lives behind a
//! `Rc<RefCell<_>>` shared by every task spawned against this graph;
//! mutation ordering is simply scheduler resumption order.

use futures::{Stream, StreamExt};
use increql_model::{
    DeferredFragmentId, DeferredGroupedFieldSetRecord, ExecutionGroupResult, GraphQlError,
    IncrementalDataRecord, IncrementalError, Lazy, NewStreamRecord, Path, StreamId,
    StreamItemRecord,
};
use rustc_hash::FxHashSet;
use slab::Slab;
use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A delivery group that newly became visible to the consumer: a deferred
/// fragment or a stream, the moment it is first pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAnnouncement {
    Fragment(DeferredFragmentId),
    Stream(StreamId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildNode {
    Fragment(DeferredFragmentId),
    Stream(StreamId),
}

struct FragmentNode {
    path: Path,
    label: Option<Arc<str>>,
    #[allow(dead_code)] // kept for debugging/introspection symmetry with StreamNode
    parent: Option<DeferredFragmentId>,
    children: Vec<ChildNode>,
    outstanding: FxHashSet<usize>,
    reconciled: Vec<ReconciledGroup>,
    /// Set once [`IncrementalGraph::complete_deferred_fragment`] has
    /// drained this node. A child registered against a completed parent
    /// can never be promoted by it (that already happened), so it must be
    /// treated as immediately pending instead of attached to `children`.
    completed: bool,
}

struct StreamNode {
    path: Path,
    label: Option<Arc<str>>,
    /// Holds the source between install and promotion for a stream whose
    /// parent fragment hasn't completed yet. Taken by
    /// [`IncrementalGraph::promote_children`] when the parent promotes it.
    parked_source: Option<BoxedItemStream>,
}

/// One reconcilable result, still attached to the fragment it completed
/// into, carrying enough context for the Publisher's best-identifier rule
/// (spec §4.3): the fragments it was originally attached to, snapshotted
/// with their paths at install time so the choice survives any of those
/// fragments later being filtered out of the graph.
#[derive(Debug, Clone)]
pub struct ReconciledGroup {
    pub path: Path,
    pub data: Option<serde_json::Value>,
    pub errors: Vec<GraphQlError>,
    pub candidates: Vec<(DeferredFragmentId, Path)>,
}

struct ExecutionGroupEntry {
    fragment_ids: Vec<DeferredFragmentId>,
    fragment_paths: Vec<(DeferredFragmentId, Path)>,
    path: Path,
}

/// What installing a new fragment/stream root resolved to.
#[derive(Debug, Clone, Copy)]
pub enum FragmentInstall {
    /// Announced immediately: a root, or a node whose parent had already
    /// collapsed by the time it was registered.
    Pending(DeferredFragmentId),
    /// Attached as a child of a still-running parent; will be announced
    /// once that parent completes (or collapses through it).
    Child(DeferredFragmentId),
}

impl FragmentInstall {
    #[must_use]
    pub fn id(&self) -> DeferredFragmentId {
        match self {
            Self::Pending(id) | Self::Child(id) => *id,
        }
    }
}

/// The result of completing one fragment (spec §4.2.4): the results it
/// releases to the consumer and the children it promotes in its place.
pub struct FragmentCompletion {
    pub fragment: DeferredFragmentId,
    pub reconciled: Vec<ReconciledGroup>,
    pub newly_pending: Vec<PendingAnnouncement>,
}

/// Outcome of a null-propagation filter (spec §4.4): every delivery group
/// whose path had the filtered path as a prefix, now removed.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub removed_fragments: Vec<DeferredFragmentId>,
    pub removed_streams: Vec<StreamId>,
}

/// One item drained from the output queue (spec §4.2.7): either "this
/// execution group reconciled into these fragments, try completing them",
/// a coalesced batch of stream items, a stream's terminal entry, or a
/// pending announcement discovered after the fact (nested work installed
/// while an outer group was already running).
pub enum CompletedUnit {
    Reconciled {
        fragments: Vec<DeferredFragmentId>,
    },
    StreamBatch {
        stream: StreamId,
        items: Vec<serde_json::Value>,
        errors: Vec<GraphQlError>,
    },
    StreamEnd {
        stream: StreamId,
        errors: Vec<GraphQlError>,
    },
    NewPending(PendingAnnouncement),
}

type BoxedItemStream = Pin<Box<dyn Stream<Item = StreamItemRecord>>>;

struct GraphState {
    fragments: Slab<FragmentNode>,
    streams: Slab<StreamNode>,
    execution_groups: Slab<ExecutionGroupEntry>,
    pending_fragments: FxHashSet<usize>,
    pending_streams: FxHashSet<usize>,
    out_tx: mpsc::UnboundedSender<CompletedUnit>,
}

impl GraphState {
    fn is_done(&self) -> bool {
        self.pending_fragments.is_empty() && self.pending_streams.is_empty()
    }
}

/// A cheaply cloneable handle onto one execution's incremental-delivery
/// graph. Every clone shares the same underlying state; cloning is how
/// spawned pump/resolution tasks get their own handle back into it.
#[derive(Clone)]
pub struct IncrementalGraph {
    state: Rc<RefCell<GraphState>>,
    receiver: Rc<RefCell<mpsc::UnboundedReceiver<CompletedUnit>>>,
    closed: Rc<Cell<bool>>,
}

impl Default for IncrementalGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalGraph {
    #[must_use]
    pub fn new() -> Self {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let state = GraphState {
            fragments: Slab::new(),
            streams: Slab::new(),
            execution_groups: Slab::new(),
            pending_fragments: FxHashSet::default(),
            pending_streams: FxHashSet::default(),
            out_tx,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
            receiver: Rc::new(RefCell::new(out_rx)),
            closed: Rc::new(Cell::new(false)),
        }
    }

    /// True once nothing further will ever be announced: no delivery
    /// group remains pending.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.borrow().is_done()
    }

    // ---- fragment registration -------------------------------------

    /// Installs a new deferred-fragment node (spec §3
    /// `DeferredFragmentRecord`). Returns whether it is announced
    /// immediately or held as a child of `parent`.
    pub fn register_fragment(
        &self,
        path: Path,
        label: Option<Arc<str>>,
        parent: Option<DeferredFragmentId>,
    ) -> FragmentInstall {
        let mut state = self.state.borrow_mut();
        let key = state.fragments.insert(FragmentNode {
            path,
            label,
            parent,
            children: Vec::new(),
            outstanding: FxHashSet::default(),
            reconciled: Vec::new(),
            completed: false,
        });
        let id = DeferredFragmentId(key);

        let install = match parent {
            None => {
                state.pending_fragments.insert(key);
                FragmentInstall::Pending(id)
            }
            Some(pid) => match state.fragments.get_mut(pid.0) {
                Some(pnode) if !pnode.completed => {
                    pnode.children.push(ChildNode::Fragment(id));
                    FragmentInstall::Child(id)
                }
                Some(_) => {
                    // Parent already completed by the time this child was
                    // registered: nothing will ever promote it, so it is
                    // pending right away (spec §4.2.1 "already pending").
                    state.pending_fragments.insert(key);
                    FragmentInstall::Pending(id)
                }
                None => {
                    // Parent filtered away before this child was even
                    // registered; it will never be announced.
                    FragmentInstall::Child(id)
                }
            },
        };
        trace!(?id, ?parent, "registered deferred fragment");
        install
    }

    #[must_use]
    pub fn fragment_path(&self, id: DeferredFragmentId) -> Option<Path> {
        self.state.borrow().fragments.get(id.0).map(|n| n.path.clone())
    }

    #[must_use]
    pub fn fragment_label(&self, id: DeferredFragmentId) -> Option<Arc<str>> {
        self.state
            .borrow()
            .fragments
            .get(id.0)
            .and_then(|n| n.label.clone())
    }

    #[must_use]
    pub fn stream_path(&self, id: StreamId) -> Option<Path> {
        self.state.borrow().streams.get(id.0).map(|n| n.path.clone())
    }

    #[must_use]
    pub fn stream_label(&self, id: StreamId) -> Option<Arc<str>> {
        self.state
            .borrow()
            .streams
            .get(id.0)
            .and_then(|n| n.label.clone())
    }

    // ---- installing work --------------------------------------------

    /// Installs newly-discovered incremental data records (spec §4.2.1).
    /// Returns the streams that became pending as a direct result (root
    /// streams, or streams whose parent had already collapsed); new
    /// fragment announcements are returned synchronously by
    /// [`Self::register_fragment`] instead. Fails with
    /// [`IncrementalError::EnqueueAfterDone`] if the graph already told its
    /// consumer it was finished (spec §7 item 5) — the field executor must
    /// not keep handing out work after that.
    pub fn get_new_pending(
        &self,
        records: Vec<IncrementalDataRecord>,
    ) -> Result<Vec<PendingAnnouncement>, IncrementalError> {
        if self.closed.get() {
            return Err(IncrementalError::EnqueueAfterDone);
        }
        let mut announcements = Vec::new();
        for record in records {
            match record {
                IncrementalDataRecord::DeferredGroupedFieldSet(rec) => {
                    self.install_execution_group(rec)?;
                }
                IncrementalDataRecord::NewStream(rec) => {
                    if let Some(ann) = self.install_stream(rec) {
                        announcements.push(ann);
                    }
                }
            }
        }
        Ok(announcements)
    }

    /// Installs incremental data records produced *alongside* an already
    /// reconciled result (spec §4.2.2: "If the result brought along more
    /// incremental records, install them with the same fragment list as
    /// parents"). Each record already carries its own correct
    /// `deferred_fragment_ids`/`parent`, assigned by the caller against
    /// fragments it registered ahead of time, so installation is
    /// identical to [`Self::get_new_pending`] — any newly-pending streams
    /// are simply announced late, through the output queue itself, since
    /// the original `get_new_pending` call that triggered this work has
    /// long since returned.
    fn install_nested(&self, records: Vec<IncrementalDataRecord>) {
        for record in records {
            match record {
                IncrementalDataRecord::DeferredGroupedFieldSet(rec) => {
                    if let Err(err) = self.install_execution_group(rec) {
                        warn!(%err, "dropping nested execution group");
                    }
                }
                IncrementalDataRecord::NewStream(rec) => {
                    if let Some(ann) = self.install_stream(rec) {
                        let state = self.state.borrow();
                        let _ = state.out_tx.send(CompletedUnit::NewPending(ann));
                    }
                }
            }
        }
    }

    fn install_execution_group(
        &self,
        rec: DeferredGroupedFieldSetRecord,
    ) -> Result<(), IncrementalError> {
        let DeferredGroupedFieldSetRecord {
            deferred_fragment_ids,
            path,
            result,
        } = rec;

        if deferred_fragment_ids.is_empty() {
            return Err(IncrementalError::DanglingExecutionGroup);
        }

        let key = {
            let mut state = self.state.borrow_mut();
            let mut fragment_paths = Vec::with_capacity(deferred_fragment_ids.len());
            for &fid in &deferred_fragment_ids {
                let node = state
                    .fragments
                    .get(fid.0)
                    .ok_or(IncrementalError::UnknownDeferredFragment(fid))?;
                fragment_paths.push((fid, node.path.clone()));
            }
            let key = state.execution_groups.insert(ExecutionGroupEntry {
                fragment_ids: deferred_fragment_ids.clone(),
                fragment_paths,
                path: path.clone(),
            });
            for &fid in &deferred_fragment_ids {
                state.fragments[fid.0].outstanding.insert(key);
            }
            key
        };

        debug!(group = key, fragments = ?deferred_fragment_ids, "installed execution group");
        self.schedule_execution_group(key, result);
        Ok(())
    }

    fn schedule_execution_group(&self, group: usize, result: Lazy<ExecutionGroupResult>) {
        let graph = self.clone();
        tokio::task::spawn_local(async move {
            let resolved = result.into_inner().await;
            graph.complete_execution_group(group, resolved);
        });
    }

    fn complete_execution_group(&self, group: usize, result: ExecutionGroupResult) {
        let fragment_ids = {
            let mut state = self.state.borrow_mut();
            let Some(entry) = state.execution_groups.try_remove(group) else {
                warn!(group, "execution group completed after its entry was removed");
                return;
            };
            let ExecutionGroupEntry {
                fragment_ids,
                fragment_paths: candidates,
                path,
            } = entry;

            for &fid in &fragment_ids {
                if let Some(node) = state.fragments.get_mut(fid.0) {
                    node.outstanding.remove(&group);
                    node.reconciled.push(ReconciledGroup {
                        path: path.clone(),
                        data: result.data.clone(),
                        errors: result.errors.clone(),
                        candidates: candidates.clone(),
                    });
                }
            }
            fragment_ids
        };

        let _ = self
            .state
            .borrow()
            .out_tx
            .send(CompletedUnit::Reconciled { fragments: fragment_ids });

        if !result.incremental_data_records.is_empty() {
            self.install_nested(result.incremental_data_records);
        }
    }

    fn install_stream(&self, rec: NewStreamRecord) -> Option<PendingAnnouncement> {
        let NewStreamRecord {
            path,
            label,
            parent,
            source,
        } = rec;

        let mut state = self.state.borrow_mut();
        let key = state.streams.insert(StreamNode {
            path,
            label,
            parked_source: None,
        });
        let id = StreamId(key);

        let became_pending = match parent {
            None => true,
            Some(pid) => match state.fragments.get_mut(pid.0) {
                Some(node) if !node.completed => {
                    node.children.push(ChildNode::Stream(id));
                    false
                }
                Some(_) => true, // parent already completed; never promoted otherwise
                None => false,   // parent already filtered away; stream never starts
            },
        };

        if became_pending {
            state.pending_streams.insert(key);
        } else {
            state.streams[key].parked_source = Some(source);
        }
        drop(state);

        if became_pending {
            self.spawn_stream_pump(id, source);
            Some(PendingAnnouncement::Stream(id))
        } else {
            None
        }
    }

    // ---- completion ----------------------------------------------------

    /// Attempts to complete a deferred fragment (spec §4.2.4). Returns
    /// `None` if it still has outstanding execution groups, or if it was
    /// already completed by an earlier call — completion does not remove
    /// the node from the slab (only `filter`/`cancel` do), and a fragment
    /// satisfied by more than one execution group can see this called once
    /// per group in the same coalesced batch.
    pub fn complete_deferred_fragment(&self, fragment: DeferredFragmentId) -> Option<FragmentCompletion> {
        let (reconciled, children) = {
            let mut state = self.state.borrow_mut();
            let node = state.fragments.get(fragment.0)?;
            if node.completed || !node.outstanding.is_empty() {
                return None;
            }
            let node = state.fragments.get_mut(fragment.0)?;
            let reconciled = std::mem::take(&mut node.reconciled);
            let children = std::mem::take(&mut node.children);
            node.completed = true;
            state.pending_fragments.remove(&fragment.0);

            // Each reconciled result is emitted once: purge it from every
            // other fragment it was also attached to.
            for rg in &reconciled {
                for &(other, _) in &rg.candidates {
                    if other != fragment {
                        if let Some(onode) = state.fragments.get_mut(other.0) {
                            onode
                                .reconciled
                                .retain(|r| r.path != rg.path || r.candidates != rg.candidates);
                        }
                    }
                }
            }
            (reconciled, children)
        };

        let newly_pending = self.promote_children(children);
        debug!(?fragment, released = reconciled.len(), promoted = newly_pending.len(), "fragment completed");

        Some(FragmentCompletion {
            fragment,
            reconciled,
            newly_pending,
        })
    }

    /// Promotes a completed node's children (spec §4.2.4/§4.2.5): a child
    /// fragment with no outstanding work and no results collapses
    /// transitively (its own children are promoted in its place) rather
    /// than ever being announced.
    fn promote_children(&self, children: Vec<ChildNode>) -> Vec<PendingAnnouncement> {
        let mut out = Vec::new();
        for child in children {
            match child {
                ChildNode::Stream(sid) => {
                    let source = {
                        let mut state = self.state.borrow_mut();
                        if let Some(node) = state.streams.get_mut(sid.0) {
                            state.pending_streams.insert(sid.0);
                            node.parked_source.take()
                        } else {
                            None
                        }
                    };
                    if let Some(source) = source {
                        self.spawn_stream_pump(sid, source);
                        out.push(PendingAnnouncement::Stream(sid));
                    }
                }
                ChildNode::Fragment(fid) => {
                    let (collapse, grandchildren) = {
                        let mut state = self.state.borrow_mut();
                        match state.fragments.get(fid.0) {
                            Some(node) if node.outstanding.is_empty() && node.reconciled.is_empty() => {
                                let node = state.fragments.get_mut(fid.0).unwrap();
                                (true, std::mem::take(&mut node.children))
                            }
                            Some(_) => (false, Vec::new()),
                            None => (false, Vec::new()), // already filtered away
                        }
                    };
                    if collapse {
                        out.extend(self.promote_children(grandchildren));
                    } else if self.state.borrow().fragments.get(fid.0).is_some() {
                        self.state.borrow_mut().pending_fragments.insert(fid.0);
                        out.push(PendingAnnouncement::Fragment(fid));
                    }
                }
            }
        }
        out
    }

    // ---- stream pump -----------------------------------------------

    fn spawn_stream_pump(&self, id: StreamId, mut source: BoxedItemStream) {
        let graph = self.clone();
        tokio::task::spawn_local(async move {
            let mut batch: Vec<serde_json::Value> = Vec::new();
            let mut batch_errors: Vec<GraphQlError> = Vec::new();
            let mut nested: Vec<IncrementalDataRecord> = Vec::new();

            loop {
                if graph.stream_gone(id) {
                    return;
                }

                // Drain whatever is already resolved without suspending,
                // so same-tick items coalesce into one batch (spec §4.2.3).
                let polled = futures::poll!(source.next());
                match polled {
                    Poll::Ready(Some(StreamItemRecord::Item {
                        value,
                        errors,
                        incremental_data_records,
                    })) => {
                        batch.push(value);
                        batch_errors.extend(errors);
                        nested.extend(incremental_data_records);
                        continue;
                    }
                    Poll::Ready(Some(StreamItemRecord::End { errors })) => {
                        graph.flush_stream_batch(id, std::mem::take(&mut batch), std::mem::take(&mut batch_errors));
                        graph.install_nested(std::mem::take(&mut nested));
                        graph.finish_stream(id, errors);
                        return;
                    }
                    Poll::Ready(None) => {
                        graph.flush_stream_batch(id, std::mem::take(&mut batch), std::mem::take(&mut batch_errors));
                        graph.install_nested(std::mem::take(&mut nested));
                        graph.finish_stream(id, Vec::new());
                        return;
                    }
                    Poll::Pending => {
                        // Flush now: a batch boundary falls at every
                        // suspension point.
                        graph.flush_stream_batch(id, std::mem::take(&mut batch), std::mem::take(&mut batch_errors));

                        match source.next().await {
                            Some(StreamItemRecord::Item {
                                value,
                                errors,
                                incremental_data_records,
                            }) => {
                                batch.push(value);
                                batch_errors.extend(errors);
                                nested.extend(incremental_data_records);
                            }
                            Some(StreamItemRecord::End { errors }) => {
                                graph.install_nested(std::mem::take(&mut nested));
                                graph.finish_stream(id, errors);
                                return;
                            }
                            None => {
                                graph.install_nested(std::mem::take(&mut nested));
                                graph.finish_stream(id, Vec::new());
                                return;
                            }
                        }

                        // The load-bearing second suspension (spec §9):
                        // let anything else that resolved this tick join
                        // the batch we just started, instead of flushing
                        // a batch of exactly one item.
                        tokio::task::yield_now().await;
                    }
                }
            }
        });
    }

    fn stream_gone(&self, id: StreamId) -> bool {
        !self.state.borrow().streams.contains(id.0)
    }

    fn flush_stream_batch(&self, id: StreamId, items: Vec<serde_json::Value>, errors: Vec<GraphQlError>) {
        if items.is_empty() && errors.is_empty() {
            return;
        }
        let state = self.state.borrow();
        if !state.streams.contains(id.0) {
            return;
        }
        let _ = state.out_tx.send(CompletedUnit::StreamBatch { stream: id, items, errors });
    }

    fn finish_stream(&self, id: StreamId, errors: Vec<GraphQlError>) {
        let mut state = self.state.borrow_mut();
        if state.streams.try_remove(id.0).is_none() {
            return; // already filtered away
        }
        state.pending_streams.remove(&id.0);
        let _ = state.out_tx.send(CompletedUnit::StreamEnd { stream: id, errors });
    }

    // ---- cancellation / filtering -----------------------------------

    /// Removes every fragment/stream whose path has `path` as a prefix
    /// (spec §4.4 null-propagation filter). Pumps and pending resolutions
    /// observe the removal the next time they check in; no further
    /// output is produced for a removed node.
    pub fn filter(&self, path: &Path) -> FilterOutcome {
        let (outcome, became_done) = {
            let mut state = self.state.borrow_mut();
            let mut outcome = FilterOutcome::default();

            let fragment_keys: Vec<usize> = state
                .fragments
                .iter()
                .filter(|(_, n)| path.is_prefix_of(&n.path))
                .map(|(k, _)| k)
                .collect();
            for key in fragment_keys {
                state.fragments.remove(key);
                state.pending_fragments.remove(&key);
                outcome.removed_fragments.push(DeferredFragmentId(key));
            }

            let stream_keys: Vec<usize> = state
                .streams
                .iter()
                .filter(|(_, n)| path.is_prefix_of(&n.path))
                .map(|(k, _)| k)
                .collect();
            for key in stream_keys {
                state.streams.remove(key);
                state.pending_streams.remove(&key);
                outcome.removed_streams.push(StreamId(key));
            }

            debug!(?path, fragments = outcome.removed_fragments.len(), streams = outcome.removed_streams.len(), "filtered subtree");
            (outcome, state.is_done())
        };

        // Spec §4.2.6: if removal drained the pending set entirely, any
        // consumer `next()` already parked on the output queue must be
        // resolved with "done" rather than left waiting on a completion
        // that can now never arrive (nothing pending can ever reconcile).
        // Closing the receiver wakes an in-flight `recv().await` the same
        // way exhausting the queue naturally would.
        if became_done {
            self.receiver.borrow_mut().close();
        }

        outcome
    }

    /// Consumer `return()`/`throw()` (spec §5): mark everything done and
    /// stop producing further batches. Live pumps notice at their next
    /// suspension point and their boxed source streams are simply
    /// dropped, which is this crate's stand-in for "call `return()` on
    /// the source async iterator" (no such method exists on
    /// `futures::Stream`).
    pub fn cancel(&self) {
        let mut state = self.state.borrow_mut();
        state.fragments.clear();
        state.streams.clear();
        state.execution_groups.clear();
        state.pending_fragments.clear();
        state.pending_streams.clear();
        drop(state);
        self.closed.set(true);
        // Wake any `next_batch()` already parked on the queue (see the
        // same close in `filter()`), in case a caller reached this handle
        // directly rather than through `SubsequentResultStream::cancel`.
        self.receiver.borrow_mut().close();
    }

    /// Drains the next coalesced batch of completed records (spec
    /// §4.2.7). `None` means the graph is fully drained or cancelled.
    pub async fn next_batch(&self) -> Option<Vec<CompletedUnit>> {
        if self.closed.get() {
            return None;
        }
        let first = {
            let mut rx = self.receiver.borrow_mut();
            rx.recv().await
        };
        let Some(first) = first else {
            self.closed.set(true);
            return None;
        };
        let mut batch = vec![first];
        while let Ok(unit) = self.receiver.borrow_mut().try_recv() {
            batch.push(unit);
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use increql_model::GraphQlError;
    use tokio_stream::wrappers::ReceiverStream;

    fn local_test<F: std::future::Future<Output = ()>>(fut: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, fut);
    }

    #[test]
    fn pure_defer_single_payload() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let install = graph.register_fragment(Path::root(), None, None);
            let FragmentInstall::Pending(fragment) = install else {
                panic!("root fragment must be pending immediately")
            };

            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![fragment],
                    Path::root(),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"a": 1}))),
                )])
                .unwrap();

            let batch = graph.next_batch().await.unwrap();
            assert_eq!(batch.len(), 1);
            let CompletedUnit::Reconciled { fragments } = &batch[0] else {
                panic!("expected a reconciled unit")
            };
            assert_eq!(fragments, &vec![fragment]);

            let completion = graph.complete_deferred_fragment(fragment).unwrap();
            assert_eq!(completion.reconciled.len(), 1);
            assert_eq!(
                completion.reconciled[0].data,
                Some(serde_json::json!({"a": 1}))
            );
            assert!(completion.newly_pending.is_empty());
            assert!(graph.is_done());
        });
    }

    #[test]
    fn nested_defer_promotes_child_on_parent_completion() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(outer) = graph.register_fragment(Path::root(), None, None)
            else {
                panic!()
            };
            let FragmentInstall::Child(inner) =
                graph.register_fragment(Path::root().child("x"), None, Some(outer))
            else {
                panic!("inner fragment must wait on its parent")
            };

            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![outer],
                    Path::root(),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"x": {}}))),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();
            let completion = graph.complete_deferred_fragment(outer).unwrap();
            assert_eq!(completion.newly_pending, vec![PendingAnnouncement::Fragment(inner)]);

            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![inner],
                    Path::root().child("x"),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"y": 2}))),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();
            let inner_completion = graph.complete_deferred_fragment(inner).unwrap();
            assert!(inner_completion.newly_pending.is_empty());
            assert!(graph.is_done());
        });
    }

    #[test]
    fn collapse_skips_childless_empty_fragment() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(outer) = graph.register_fragment(Path::root(), None, None)
            else {
                panic!()
            };
            // `middle` has no execution groups attached at all, ever.
            let FragmentInstall::Child(middle) =
                graph.register_fragment(Path::root().child("m"), None, Some(outer))
            else {
                panic!()
            };
            let FragmentInstall::Child(leaf) =
                graph.register_fragment(Path::root().child("m").child("l"), None, Some(middle))
            else {
                panic!()
            };

            graph
                .get_new_pending(vec![
                    IncrementalDataRecord::deferred(
                        vec![outer],
                        Path::root(),
                        Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"m": {}}))),
                    ),
                    IncrementalDataRecord::deferred(
                        vec![leaf],
                        Path::root().child("m").child("l"),
                        Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"l": 1}))),
                    ),
                ])
                .unwrap();
            graph.next_batch().await.unwrap();
            let completion = graph.complete_deferred_fragment(outer).unwrap();
            // `middle` never appears: its child `leaf` is promoted straight
            // through it.
            assert_eq!(completion.newly_pending, vec![PendingAnnouncement::Fragment(leaf)]);
        });
    }

    #[test]
    fn shared_result_picks_longest_candidate_path() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(root) = graph.register_fragment(Path::root(), None, None)
            else {
                panic!()
            };
            let FragmentInstall::Pending(nested) =
                graph.register_fragment(Path::root().child("p").child("q"), None, None)
            else {
                panic!()
            };

            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![root, nested],
                    Path::root().child("p").child("q").child("r"),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"r": 1}))),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();

            let completion = graph.complete_deferred_fragment(root).unwrap();
            let group = &completion.reconciled[0];
            let best = group
                .candidates
                .iter()
                .max_by_key(|(_, p)| p.segments().len())
                .unwrap();
            assert_eq!(best.0, nested);

            // The shared result must not also appear when `nested` completes.
            let nested_completion = graph.complete_deferred_fragment(nested).unwrap();
            assert!(nested_completion.reconciled.is_empty());
        });
    }

    #[test]
    fn filter_removes_subtree_and_its_pending_entries() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(outer) = graph.register_fragment(Path::root(), None, None)
            else {
                panic!()
            };
            let FragmentInstall::Child(inner) =
                graph.register_fragment(Path::root().child("x"), None, Some(outer))
            else {
                panic!()
            };

            let outcome = graph.filter(&Path::root().child("x"));
            assert_eq!(outcome.removed_fragments, vec![inner]);

            // Completing `outer` afterward must not resurrect `inner`.
            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![outer],
                    Path::root(),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({}))),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();
            let completion = graph.complete_deferred_fragment(outer).unwrap();
            assert!(completion.newly_pending.is_empty());
        });
    }

    #[test]
    fn stream_coalesces_synchronously_ready_items() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            let source = ReceiverStream::new(rx).boxed_local();

            tx.send(StreamItemRecord::item(serde_json::json!(1))).await.unwrap();
            tx.send(StreamItemRecord::item(serde_json::json!(2))).await.unwrap();

            let ann = graph
                .get_new_pending(vec![IncrementalDataRecord::new_stream(NewStreamRecord::new(
                    Path::root().child("l"),
                    None,
                    None,
                    source,
                ))])
                .unwrap();
            let PendingAnnouncement::Stream(stream) = ann[0] else {
                panic!()
            };

            let batch = graph.next_batch().await.unwrap();
            assert_eq!(batch.len(), 1);
            let CompletedUnit::StreamBatch { items, .. } = &batch[0] else {
                panic!("expected a stream batch")
            };
            assert_eq!(items, &vec![serde_json::json!(1), serde_json::json!(2)]);

            tx.send(StreamItemRecord::item(serde_json::json!(3))).await.unwrap();
            let batch = graph.next_batch().await.unwrap();
            let CompletedUnit::StreamBatch { items, .. } = &batch[0] else {
                panic!()
            };
            assert_eq!(items, &vec![serde_json::json!(3)]);

            drop(tx);
            let batch = graph.next_batch().await.unwrap();
            assert!(matches!(batch[0], CompletedUnit::StreamEnd { stream: s, .. } if s == stream));
            assert!(graph.is_done());
        });
    }

    #[test]
    fn filter_that_empties_pending_set_wakes_a_parked_consumer() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(fragment) =
                graph.register_fragment(Path::root().child("x"), None, None)
            else {
                panic!()
            };

            // Nothing has completed yet, so `next_batch()` parks on the
            // empty output queue exactly like a consumer `next()` would.
            let graph_for_wait = graph.clone();
            let waiting = tokio::task::spawn_local(async move { graph_for_wait.next_batch().await });
            tokio::task::yield_now().await;

            // Filtering away the only pending fragment drains the pending
            // set to empty with no completion ever forthcoming; the parked
            // `next_batch()` must resolve to `None`, not hang forever.
            let outcome = graph.filter(&Path::root().child("x"));
            assert_eq!(outcome.removed_fragments, vec![fragment]);

            assert!(waiting.await.unwrap().is_none());
        });
    }

    #[test]
    fn completing_an_already_completed_fragment_is_a_no_op() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(fragment) = graph.register_fragment(Path::root(), None, None)
            else {
                panic!()
            };
            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![fragment],
                    Path::root(),
                    Lazy::ready(
                        ExecutionGroupResult::new(serde_json::json!({}))
                            .with_errors(vec![GraphQlError::new("boom")]),
                    ),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();
            assert!(graph.complete_deferred_fragment(fragment).is_some());
            // The node stays in the slab (only `filter`/`cancel` remove it);
            // a second attempt must see `node.completed` and back off.
            assert!(graph.complete_deferred_fragment(fragment).is_none());
        });
    }

    #[test]
    fn enqueueing_after_cancel_is_a_contract_violation() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(fragment) =
                graph.register_fragment(Path::root(), None, None)
            else {
                panic!()
            };
            graph.cancel();

            let err = graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![fragment],
                    Path::root(),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({}))),
                )])
                .unwrap_err();
            assert_eq!(err, IncrementalError::EnqueueAfterDone);
        });
    }
}
