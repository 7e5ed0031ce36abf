//! Defer usages and targets.
//!
//! A [`DeferUsage`] identifies one lexical occurrence of a `@defer`
//! directive. Its identity is its allocation sequence number, not its
//! label or path — two occurrences with identical labels at identical
//! paths are still distinct targets if they come from distinct directive
//! occurrences in the source query.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Allocates the monotonically increasing sequence numbers that order
/// [`DeferUsage`]s within one request. Owned per-invocation by whatever
/// component is constructing the defer-usage tree (no process-global
/// counter, per the "no global mutable state" design note).
#[derive(Debug, Default)]
pub struct DeferUsageAllocator {
    next: AtomicUsize,
}

impl DeferUsageAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new root-or-nested defer usage.
    pub fn alloc(&self, label: Option<impl Into<Arc<str>>>, parent: Target) -> DeferUsage {
        let seq = self.next.fetch_add(1, AtomicOrdering::Relaxed);
        DeferUsage(Arc::new(DeferUsageInner {
            seq,
            label: label.map(Into::into),
            parent,
        }))
    }
}

#[derive(Debug)]
struct DeferUsageInner {
    seq: usize,
    label: Option<Arc<str>>,
    parent: Target,
}

/// One lexical `@defer` occurrence. Cheaply cloneable; identity and
/// ordering are both based on allocation sequence, not structural content.
#[derive(Debug, Clone)]
pub struct DeferUsage(Arc<DeferUsageInner>);

impl DeferUsage {
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.0.label.as_deref()
    }

    /// The defer usage (or [`Target::NonDeferred`]) this one is nested
    /// under. The chain of parents forms the strict defer-usage tree.
    #[must_use]
    pub fn parent(&self) -> &Target {
        &self.0.parent
    }

    #[must_use]
    pub fn seq(&self) -> usize {
        self.0.seq
    }

    /// True if `ancestor` appears somewhere in `self`'s parent chain.
    #[must_use]
    pub fn has_ancestor(&self, ancestor: &Target) -> bool {
        let mut current = self.0.parent.clone();
        loop {
            if &current == ancestor {
                return true;
            }
            match current {
                Target::NonDeferred => return false,
                Target::Deferred(du) => current = du.0.parent.clone(),
            }
        }
    }
}

impl PartialEq for DeferUsage {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for DeferUsage {}

impl PartialOrd for DeferUsage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeferUsage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.seq.cmp(&other.0.seq)
    }
}

impl Hash for DeferUsage {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.seq.hash(state);
    }
}

/// A target is either the non-deferred "root" delivery context, or one
/// specific [`DeferUsage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    NonDeferred,
    Deferred(DeferUsage),
}

impl Target {
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl From<DeferUsage> for Target {
    fn from(du: DeferUsage) -> Self {
        Self::Deferred(du)
    }
}

/// An unordered set of targets. Backed by a `BTreeSet` (ordered by
/// [`DeferUsage`] sequence number) rather than a hash set so that a
/// `TargetSet` can itself be used as a map key when bucketing grouped
/// field sets by masking target set — set *content* equality is exactly
/// what bucket lookup needs, independent of insertion order.
pub type TargetSet = BTreeSet<Target>;

/// The masking targets of `targets`: elements that are either
/// [`Target::NonDeferred`] or have no other element of `targets` as an
/// ancestor. An outer defer usage is masked when a closer (descendant)
/// defer usage in the same set already owns the field.
#[must_use]
pub fn masking_targets(targets: &TargetSet) -> TargetSet {
    targets
        .iter()
        .filter(|t| match t {
            Target::NonDeferred => true,
            Target::Deferred(du) => !targets
                .iter()
                .any(|other| other != *t && is_ancestor(du, other)),
        })
        .cloned()
        .collect()
}

fn is_ancestor(candidate: &DeferUsage, of: &Target) -> bool {
    match of {
        Target::NonDeferred => false,
        Target::Deferred(du) => du.has_ancestor(&Target::Deferred(candidate.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_defer_usages_are_distinct() {
        let alloc = DeferUsageAllocator::new();
        let a = alloc.alloc(Some("a"), Target::NonDeferred);
        let b = alloc.alloc(Some("a"), Target::NonDeferred);
        assert_ne!(a, b);
    }

    #[test]
    fn masking_hides_outer_defer_when_inner_present() {
        let alloc = DeferUsageAllocator::new();
        let outer = alloc.alloc(Some("outer"), Target::NonDeferred);
        let inner = alloc.alloc(Some("inner"), Target::Deferred(outer.clone()));

        let mut targets = TargetSet::new();
        targets.insert(Target::Deferred(outer.clone()));
        targets.insert(Target::Deferred(inner.clone()));

        let masked = masking_targets(&targets);
        assert_eq!(masked.len(), 1);
        assert!(masked.contains(&Target::Deferred(inner)));
        assert!(!masked.contains(&Target::Deferred(outer)));
    }

    #[test]
    fn non_deferred_is_never_masked() {
        let alloc = DeferUsageAllocator::new();
        let du = alloc.alloc(Some("x"), Target::NonDeferred);
        let mut targets = TargetSet::new();
        targets.insert(Target::NonDeferred);
        targets.insert(Target::Deferred(du));
        let masked = masking_targets(&targets);
        assert!(masked.contains(&Target::NonDeferred));
    }
}
