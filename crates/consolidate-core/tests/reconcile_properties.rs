//! Properties of the per-field reconciliation rules.

use std::collections::BTreeMap;

use proptest::prelude::*;

use consolidate_core::reconcile::fields::{reconcile_value, FieldPolicy};
use consolidate_core::reconcile::{merge_flags, IncomingSource, Resolution, SourcePriority, UnverifiedPolicy};

fn policy() -> impl Strategy<Value = FieldPolicy> {
    (
        prop_oneof![Just(SourcePriority::Incoming), Just(SourcePriority::Existing)],
        prop_oneof![Just(UnverifiedPolicy::Keep), Just(UnverifiedPolicy::Clear)],
        prop_oneof![Just(IncomingSource::ExternalFeed), Just(IncomingSource::DuplicateRecord)],
        any::<bool>(),
    )
        .prop_map(|(priority, unverified, source, locked)| FieldPolicy {
            priority,
            unverified,
            source,
            locked,
        })
}

fn flags() -> impl Strategy<Value = BTreeMap<String, bool>> {
    prop::collection::btree_map("[a-z]{1,8}", any::<bool>(), 0..6)
}

proptest! {
    #[test]
    fn empty_local_is_filled(value in "[0-9]{11}", policy in policy()) {
        prop_assume!(!policy.locked);
        let outcome = reconcile_value(None, Some(value.clone()), policy);
        prop_assert_eq!(outcome.value, Some(value));
        prop_assert_eq!(outcome.resolution, Resolution::Filled);
    }

    #[test]
    fn equal_values_are_kept(value in "[0-9]{11}", policy in policy()) {
        let outcome = reconcile_value(Some(value.clone()), Some(value.clone()), policy);
        prop_assert_eq!(outcome.value, Some(value));
        prop_assert_eq!(outcome.resolution, Resolution::Kept);
    }

    #[test]
    fn locked_values_never_change(
        existing in proptest::option::of("[0-9]{11}"),
        incoming in proptest::option::of("[0-9]{11}"),
        policy in policy(),
    ) {
        let policy = FieldPolicy { locked: true, ..policy };
        let outcome = reconcile_value(existing.clone(), incoming, policy);
        prop_assert!(!outcome.resolution.changed());
        prop_assert_eq!(outcome.value, existing);
    }

    #[test]
    fn duplicate_silence_never_clears(existing in "[0-9]{11}", policy in policy()) {
        let policy = FieldPolicy { source: IncomingSource::DuplicateRecord, ..policy };
        let outcome = reconcile_value(Some(existing.clone()), None, policy);
        prop_assert_eq!(outcome.value, Some(existing));
    }

    #[test]
    fn true_flags_stay_true(existing in flags(), incoming in flags(), locked in any::<bool>()) {
        let merged = merge_flags(&existing, &incoming, locked).value.unwrap_or_default();
        for (condition, present) in &existing {
            if *present {
                prop_assert_eq!(merged.get(condition), Some(&true));
            }
        }
        if !locked {
            for (condition, present) in &incoming {
                if *present {
                    prop_assert_eq!(merged.get(condition), Some(&true));
                }
            }
        }
    }

    #[test]
    fn flag_merge_is_idempotent(existing in flags(), incoming in flags()) {
        let once = merge_flags(&existing, &incoming, false).value.unwrap_or_default();
        let twice = merge_flags(&once, &incoming, false);
        prop_assert_eq!(twice.resolution, Resolution::Kept);
        prop_assert_eq!(twice.value, Some(once));
    }
}
