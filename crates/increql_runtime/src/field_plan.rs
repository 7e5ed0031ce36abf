//! Field Plan Builder (spec §4.1).
//!
//! A pure function over the fields selected at one response position and
//! the `@defer` targets active there. Partitions fields into the grouped
//! field set to execute at the current delivery boundary and the buckets
//! of fields that belong to newly-initiated (or still-pending) defer
//! contexts, keyed by masking target set.

use increql_model::{masking_targets, DeferUsage, FieldDetails, FieldGroup, GroupedFieldSet, TargetSet};
use indexmap::IndexMap;

/// One newly-discovered bucket of fields reachable only through a defer
/// boundary not yet active at the current delivery position.
#[derive(Debug)]
pub struct NewGroupedFieldSetDetails<F> {
    pub grouped_field_set: GroupedFieldSet<F>,
    /// True iff this bucket crosses a defer boundary new to this plan
    /// node — i.e. at least one of its masking targets is absent from
    /// `parentTargets`.
    pub should_initiate_defer: bool,
}

/// The three artifacts the Field Plan Builder produces for one response
/// position (spec §4.1 "Output").
#[derive(Debug)]
pub struct FieldPlan<F> {
    pub grouped_field_set: GroupedFieldSet<F>,
    pub new_grouped_field_set_details_map: IndexMap<TargetSet, NewGroupedFieldSetDetails<F>>,
    pub new_defer_usages: Vec<DeferUsage>,
}

/// Partitions `fields` (one ordered list of [`FieldDetails`] per response
/// key, in source order) against the targets active at this point
/// (`parent_targets`) and the targets already seen on the path to this
/// point (`known_targets`).
///
/// Deterministic and insensitive to the iteration order of `fields`
/// beyond the response-key ordering it is given in — re-running with the
/// same logical inputs always partitions the same way, since bucketing is
/// keyed by masking *target-set content*, not by object identity or
/// insertion order (the "masking idempotence" law, spec §8).
pub fn build_field_plan<F>(
    fields: IndexMap<String, Vec<FieldDetails<F>>>,
    parent_targets: &TargetSet,
    known_targets: &TargetSet,
) -> FieldPlan<F> {
    let mut grouped_field_set: GroupedFieldSet<F> = IndexMap::new();
    let mut buckets: IndexMap<TargetSet, GroupedFieldSet<F>> = IndexMap::new();
    let mut new_defer_usages = Vec::new();
    let mut seen_new: rustc_hash::FxHashSet<DeferUsage> = rustc_hash::FxHashSet::default();

    for (response_key, field_list) in fields {
        for details in &field_list {
            if let Some(defer_usage) = &details.defer_usage {
                let as_target = increql_model::Target::Deferred(defer_usage.clone());
                if !known_targets.contains(&as_target) && seen_new.insert(defer_usage.clone()) {
                    new_defer_usages.push(defer_usage.clone());
                }
            }
        }

        let field_group = FieldGroup::new(field_list);
        let masking = masking_targets(&field_group.target_set());

        let destination = if &masking == parent_targets {
            &mut grouped_field_set
        } else {
            buckets.entry(masking).or_default()
        };

        destination
            .entry(response_key)
            .or_insert_with(FieldGroup::default)
            .fields
            .extend(field_group.fields);
    }

    let new_grouped_field_set_details_map = buckets
        .into_iter()
        .map(|(masking, grouped_field_set)| {
            let should_initiate_defer = masking.iter().any(|t| !parent_targets.contains(t));
            (
                masking,
                NewGroupedFieldSetDetails {
                    grouped_field_set,
                    should_initiate_defer,
                },
            )
        })
        .collect();

    FieldPlan {
        grouped_field_set,
        new_grouped_field_set_details_map,
        new_defer_usages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use increql_model::{DeferUsageAllocator, Target};

    fn details(defer_usage: Option<DeferUsage>) -> Vec<FieldDetails<&'static str>> {
        vec![FieldDetails::new("field", defer_usage)]
    }

    #[test]
    fn non_deferred_field_goes_to_current_grouped_field_set() {
        let mut fields = IndexMap::new();
        fields.insert("a".to_string(), details(None));

        let parent_targets: TargetSet = [Target::NonDeferred].into_iter().collect();
        let plan = build_field_plan(fields, &parent_targets, &TargetSet::new());

        assert!(plan.grouped_field_set.contains_key("a"));
        assert!(plan.new_grouped_field_set_details_map.is_empty());
        assert!(plan.new_defer_usages.is_empty());
    }

    #[test]
    fn newly_deferred_field_buckets_separately_and_reports_new_usage() {
        let alloc = DeferUsageAllocator::new();
        let du = alloc.alloc(Some("slow"), Target::NonDeferred);

        let mut fields = IndexMap::new();
        fields.insert("b".to_string(), details(Some(du.clone())));

        let parent_targets: TargetSet = [Target::NonDeferred].into_iter().collect();
        let plan = build_field_plan(fields, &parent_targets, &TargetSet::new());

        assert!(plan.grouped_field_set.is_empty());
        assert_eq!(plan.new_defer_usages.len(), 1);
        assert_eq!(plan.new_grouped_field_set_details_map.len(), 1);
        let (_, bucket) = plan.new_grouped_field_set_details_map.iter().next().unwrap();
        assert!(bucket.should_initiate_defer);
        assert!(bucket.grouped_field_set.contains_key("b"));
    }

    #[test]
    fn already_known_defer_usage_is_not_reported_again() {
        let alloc = DeferUsageAllocator::new();
        let du = alloc.alloc(Some("slow"), Target::NonDeferred);

        let mut fields = IndexMap::new();
        fields.insert("b".to_string(), details(Some(du.clone())));

        let parent_targets: TargetSet = [Target::Deferred(du.clone())].into_iter().collect();
        let known_targets: TargetSet = [Target::Deferred(du)].into_iter().collect();
        let plan = build_field_plan(fields, &parent_targets, &known_targets);

        assert!(plan.new_defer_usages.is_empty());
        assert!(plan.grouped_field_set.contains_key("b"));
    }

    #[test]
    fn inner_defer_masks_outer_defer_for_shared_field() {
        let alloc = DeferUsageAllocator::new();
        let outer = alloc.alloc(Some("outer"), Target::NonDeferred);
        let inner = alloc.alloc(Some("inner"), Target::Deferred(outer.clone()));

        let mut fields = IndexMap::new();
        fields.insert(
            "x".to_string(),
            vec![
                FieldDetails::new("x", Some(outer.clone())),
                FieldDetails::new("x", Some(inner.clone())),
            ],
        );

        let parent_targets: TargetSet = [Target::NonDeferred].into_iter().collect();
        let plan = build_field_plan(fields, &parent_targets, &TargetSet::new());

        assert_eq!(plan.new_grouped_field_set_details_map.len(), 1);
        let (masking, _) = plan.new_grouped_field_set_details_map.iter().next().unwrap();
        assert_eq!(masking.len(), 1);
        assert!(masking.contains(&Target::Deferred(inner)));
    }
}
