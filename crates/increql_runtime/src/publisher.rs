//! The Payload Publisher (spec §4.3).
//!
//! Turns the Incremental Graph's internal units ([`PendingAnnouncement`],
//! [`ReconciledGroup`], stream batches/ends) into the wire shapes in
//! [`increql_model::payload`]. Owns the only piece of cross-cutting state
//! outside the graph itself: the monotonic [`DeliveryGroupId`] assignment
//! and the best-identifier rule for a result shared by more than one
//! fragment (spec §4.3.2).

use crate::graph::{IncrementalGraph, PendingAnnouncement, ReconciledGroup};
use increql_model::{
    CompletedEntry, DeferredFragmentId, DeliveryGroupId, GraphQlError, IncrementalEntry, Path,
    PendingEntry, StreamId,
};
use rustc_hash::FxHashMap;

/// Assigns [`DeliveryGroupId`]s to delivery groups in the order they
/// become pending and resolves reconciled results to wire entries.
#[derive(Default)]
pub struct PayloadPublisher {
    next_id: u64,
    fragment_ids: FxHashMap<DeferredFragmentId, DeliveryGroupId>,
    stream_ids: FxHashMap<StreamId, DeliveryGroupId>,
}

impl PayloadPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> DeliveryGroupId {
        let id = DeliveryGroupId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Assigns ids to a batch of newly-pending delivery groups and builds
    /// their `pending` entries, in the order given (spec §4.3.1: ids are
    /// assigned in the order each delivery group is first observed
    /// pending).
    pub fn pending_entries(
        &mut self,
        graph: &IncrementalGraph,
        announcements: &[PendingAnnouncement],
    ) -> Vec<PendingEntry> {
        announcements
            .iter()
            .map(|ann| match *ann {
                PendingAnnouncement::Fragment(fid) => self.pending_entry_for_fragment(graph, fid),
                PendingAnnouncement::Stream(sid) => self.pending_entry_for_stream(graph, sid),
            })
            .collect()
    }

    pub fn pending_entry_for_fragment(
        &mut self,
        graph: &IncrementalGraph,
        id: DeferredFragmentId,
    ) -> PendingEntry {
        let group_id = self.assign_fragment(id);
        let path = graph.fragment_path(id).unwrap_or_else(Path::root);
        let label = graph.fragment_label(id).map(|l| l.to_string());
        PendingEntry {
            id: group_id,
            path: path.segments(),
            label,
        }
    }

    pub fn pending_entry_for_stream(&mut self, graph: &IncrementalGraph, id: StreamId) -> PendingEntry {
        let group_id = self.assign_stream(id);
        let path = graph.stream_path(id).unwrap_or_else(Path::root);
        let label = graph.stream_label(id).map(|l| l.to_string());
        PendingEntry {
            id: group_id,
            path: path.segments(),
            label,
        }
    }

    fn assign_fragment(&mut self, id: DeferredFragmentId) -> DeliveryGroupId {
        if let Some(existing) = self.fragment_ids.get(&id) {
            return *existing;
        }
        let group_id = self.next_id();
        self.fragment_ids.insert(id, group_id);
        group_id
    }

    fn assign_stream(&mut self, id: StreamId) -> DeliveryGroupId {
        if let Some(existing) = self.stream_ids.get(&id) {
            return *existing;
        }
        let group_id = self.next_id();
        self.stream_ids.insert(id, group_id);
        group_id
    }

    #[must_use]
    pub fn id_for_fragment(&self, id: DeferredFragmentId) -> Option<DeliveryGroupId> {
        self.fragment_ids.get(&id).copied()
    }

    #[must_use]
    pub fn id_for_stream(&self, id: StreamId) -> Option<DeliveryGroupId> {
        self.stream_ids.get(&id).copied()
    }

    /// Resolves a batch of reconciled execution-group results into
    /// `incremental` entries, applying the best-identifier rule (spec
    /// §4.3.2) when a result's `candidates` names more than one fragment:
    /// the fragment with the longest response path wins, first-declared
    /// wins ties. Every candidate must already have an assigned id — they
    /// were registered before any execution group naming them could have
    /// been installed.
    #[must_use]
    pub fn resolve_incremental_defer(&self, groups: &[ReconciledGroup]) -> Vec<IncrementalEntry> {
        groups
            .iter()
            .map(|group| {
                let (best_id, best_path) = Self::best_candidate(&group.candidates);
                let group_id = self
                    .fragment_ids
                    .get(&best_id)
                    .copied()
                    .expect("fragment must have a pending id before its results are published");
                let sub_path = group.path.strip_prefix(&best_path).filter(|s| !s.is_empty());
                IncrementalEntry::Defer {
                    id: group_id,
                    sub_path,
                    data: group.data.clone().unwrap_or(serde_json::Value::Null),
                    errors: group.errors.clone(),
                }
            })
            .collect()
    }

    /// The longest-response-path candidate; first-declared wins ties
    /// (`Iterator::max_by_key` keeps the *last* max, so this walks by hand
    /// with a strict `>` instead).
    fn best_candidate(candidates: &[(DeferredFragmentId, Path)]) -> (DeferredFragmentId, Path) {
        let mut best = candidates
            .first()
            .cloned()
            .expect("a reconciled group always names at least one fragment");
        let mut best_len = best.1.segments().len();
        for (id, path) in &candidates[1..] {
            let len = path.segments().len();
            if len > best_len {
                best = (*id, path.clone());
                best_len = len;
            }
        }
        best
    }

    #[must_use]
    pub fn resolve_stream_batch(
        &self,
        stream: StreamId,
        items: Vec<serde_json::Value>,
        errors: Vec<GraphQlError>,
    ) -> IncrementalEntry {
        let id = self
            .stream_ids
            .get(&stream)
            .copied()
            .expect("stream must have a pending id before its items are published");
        IncrementalEntry::Stream { id, items, errors }
    }

    #[must_use]
    pub fn completed_entry_for_fragment(
        &self,
        id: DeferredFragmentId,
        errors: Vec<GraphQlError>,
    ) -> CompletedEntry {
        let group_id = self
            .fragment_ids
            .get(&id)
            .copied()
            .expect("fragment must have a pending id before it can complete");
        if errors.is_empty() {
            CompletedEntry::ok(group_id)
        } else {
            CompletedEntry::failed(group_id, errors)
        }
    }

    #[must_use]
    pub fn completed_entry_for_stream(&self, id: StreamId, errors: Vec<GraphQlError>) -> CompletedEntry {
        let group_id = self
            .stream_ids
            .get(&id)
            .copied()
            .expect("stream must have a pending id before it can complete");
        if errors.is_empty() {
            CompletedEntry::ok(group_id)
        } else {
            CompletedEntry::failed(group_id, errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FragmentInstall, IncrementalGraph};
    use increql_model::{ExecutionGroupResult, IncrementalDataRecord, Lazy};

    fn local_test<F: std::future::Future<Output = ()>>(fut: F) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let local = tokio::task::LocalSet::new();
        local.block_on(&rt, fut);
    }

    #[test]
    fn ids_are_assigned_in_pending_order() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(a) = graph.register_fragment(Path::root().child("a"), None, None)
            else {
                panic!()
            };
            let FragmentInstall::Pending(b) = graph.register_fragment(Path::root().child("b"), None, None)
            else {
                panic!()
            };

            let mut publisher = PayloadPublisher::new();
            let entries = publisher.pending_entries(
                &graph,
                &[
                    PendingAnnouncement::Fragment(a),
                    PendingAnnouncement::Fragment(b),
                ],
            );
            assert_eq!(entries[0].id, DeliveryGroupId(0));
            assert_eq!(entries[1].id, DeliveryGroupId(1));
            assert_eq!(publisher.id_for_fragment(a), Some(DeliveryGroupId(0)));
        });
    }

    #[test]
    fn assigning_the_same_fragment_twice_is_idempotent() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(a) = graph.register_fragment(Path::root(), None, None) else {
                panic!()
            };
            let mut publisher = PayloadPublisher::new();
            let first = publisher.pending_entry_for_fragment(&graph, a);
            let second = publisher.pending_entry_for_fragment(&graph, a);
            assert_eq!(first.id, second.id);
        });
    }

    #[test]
    fn shared_result_reports_longest_path_and_correct_sub_path() {
        local_test(async {
            let graph = IncrementalGraph::new();
            let FragmentInstall::Pending(root) = graph.register_fragment(Path::root(), None, None) else {
                panic!()
            };
            let FragmentInstall::Pending(nested) =
                graph.register_fragment(Path::root().child("p"), None, None)
            else {
                panic!()
            };

            graph
                .get_new_pending(vec![IncrementalDataRecord::deferred(
                    vec![root, nested],
                    Path::root().child("p").child("q"),
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({"q": 1}))),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();
            let completion = graph.complete_deferred_fragment(root).unwrap();

            let mut publisher = PayloadPublisher::new();
            publisher.pending_entry_for_fragment(&graph, root);
            publisher.pending_entry_for_fragment(&graph, nested);

            let entries = publisher.resolve_incremental_defer(&completion.reconciled);
            let IncrementalEntry::Defer { id, sub_path, .. } = &entries[0] else {
                panic!("expected a defer entry")
            };
            assert_eq!(*id, publisher.id_for_fragment(nested).unwrap());
            assert_eq!(sub_path, &Some(vec!["q".into()]));
        });
    }

    #[test]
    fn exact_path_match_omits_sub_path() {
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
                    Lazy::ready(ExecutionGroupResult::new(serde_json::json!({}))),
                )])
                .unwrap();
            graph.next_batch().await.unwrap();
            let completion = graph.complete_deferred_fragment(fragment).unwrap();

            let mut publisher = PayloadPublisher::new();
            publisher.pending_entry_for_fragment(&graph, fragment);
            let entries = publisher.resolve_incremental_defer(&completion.reconciled);
            let IncrementalEntry::Defer { sub_path, .. } = &entries[0] else {
                panic!()
            };
            assert_eq!(sub_path, &None);
        });
    }
}
