//! Grouped field sets.
//!
//! The field executor and type system own the actual field/selection AST;
//! this crate only needs to know, for a given response key, which
//! `@defer` usage (if any) each occurrence of that field came from. `F` is
//! the caller's opaque field-selection node type.

use crate::defer::{DeferUsage, Target, TargetSet};
use indexmap::IndexMap;

/// One parsed occurrence of a field, tagged with the defer usage it was
/// reached through (`None` means non-deferred).
#[derive(Debug, Clone)]
pub struct FieldDetails<F> {
    pub field: F,
    pub defer_usage: Option<DeferUsage>,
}

impl<F> FieldDetails<F> {
    #[must_use]
    pub fn new(field: F, defer_usage: Option<DeferUsage>) -> Self {
        Self { field, defer_usage }
    }

    #[must_use]
    pub fn target(&self) -> Target {
        match &self.defer_usage {
            Some(du) => Target::Deferred(du.clone()),
            None => Target::NonDeferred,
        }
    }
}

/// All occurrences of one response key, in source order.
#[derive(Debug, Clone)]
pub struct FieldGroup<F> {
    pub fields: Vec<FieldDetails<F>>,
}

// Hand-written rather than `#[derive(Default)]`: the derive macro adds an
// `F: Default` bound even though an empty `Vec` never needs one.
impl<F> Default for FieldGroup<F> {
    fn default() -> Self {
        Self { fields: Vec::new() }
    }
}

impl<F> FieldGroup<F> {
    #[must_use]
    pub fn new(fields: Vec<FieldDetails<F>>) -> Self {
        Self { fields }
    }

    /// The union of targets across every occurrence in this group.
    #[must_use]
    pub fn target_set(&self) -> TargetSet {
        self.fields.iter().map(FieldDetails::target).collect()
    }
}

/// A response-key-ordered grouped field set, as produced by the Field
/// Plan Builder for one delivery boundary.
pub type GroupedFieldSet<F> = IndexMap<String, FieldGroup<F>>;
