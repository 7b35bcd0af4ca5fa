//! Property-based tests for the tag filter.
//!
//! The filter's output must equal
//! `sort_by_updated_desc(all \ excluded ∩ (included ∪ all-if-none))[:N]`
//! for any include/exclude/latest-N triple; these properties pin the
//! pieces of that equation individually.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use registry_replicator::filter::{TagFilter, TagInfo};
use std::collections::HashSet;

fn tag_set() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-z]{1,6}", 0i64..1_000_000i64), 0..40)
}

fn to_infos(tags: &[(String, i64)]) -> Vec<TagInfo> {
    tags.iter()
        .map(|(name, secs)| TagInfo::new(name.clone(), Utc.timestamp_opt(*secs, 0).unwrap()))
        .collect()
}

proptest! {
    /// Output is always a subset of the input.
    #[test]
    fn output_subset_of_input(tags in tag_set()) {
        let filter = TagFilter::new(&[], &[], 0).unwrap();
        let input: HashSet<String> = tags.iter().map(|(n, _)| n.clone()).collect();
        for tag in filter.apply(to_infos(&tags)) {
            prop_assert!(input.contains(&tag));
        }
    }

    /// latest-N bounds the output size.
    #[test]
    fn latest_n_bounds_output(tags in tag_set(), n in 1usize..10) {
        let filter = TagFilter::new(&[], &[], n).unwrap();
        prop_assert!(filter.apply(to_infos(&tags)).len() <= n);
    }

    /// Excluded tags never survive, include patterns notwithstanding.
    #[test]
    fn exclude_dominates(tags in tag_set()) {
        let filter = TagFilter::new(&["^[a-m]".to_string()], &["^a".to_string()], 0).unwrap();
        for tag in filter.apply(to_infos(&tags)) {
            prop_assert!(!tag.starts_with('a'));
            prop_assert!(tag.chars().next().unwrap() <= 'm');
        }
    }

    /// Without include patterns, everything not excluded survives.
    #[test]
    fn no_include_keeps_all_unexcluded(tags in tag_set()) {
        let filter = TagFilter::new(&[], &["^z".to_string()], 0).unwrap();
        let output: HashSet<String> = filter.apply(to_infos(&tags)).into_iter().collect();
        for (name, _) in &tags {
            if !name.starts_with('z') {
                prop_assert!(output.contains(name));
            }
        }
    }

    /// Output is ordered newest-first; names break timestamp ties
    /// descending, so the order is total and deterministic.
    #[test]
    fn output_sorted_updated_desc(tags in tag_set()) {
        let filter = TagFilter::new(&[], &[], 0).unwrap();

        let mut expected = tags.clone();
        expected.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        let expected: Vec<String> = expected.into_iter().map(|(name, _)| name).collect();

        prop_assert_eq!(filter.apply(to_infos(&tags)), expected);
    }

    /// Deterministic: the same input always yields the same output.
    #[test]
    fn deterministic(tags in tag_set(), n in 0usize..5) {
        let filter = TagFilter::new(&["^[a-p]".to_string()], &["q$".to_string()], n).unwrap();
        let first = filter.apply(to_infos(&tags));
        let second = filter.apply(to_infos(&tags));
        prop_assert_eq!(first, second);
    }

    /// The full pipeline equals the spec equation computed independently.
    #[test]
    fn matches_reference_equation(tags in tag_set(), n in 0usize..8) {
        let include = "^[a-m]".to_string();
        let exclude = "z$".to_string();
        let filter = TagFilter::new(&[include.clone()], &[exclude.clone()], n).unwrap();

        // Independent oracle.
        let include_re = regex::Regex::new(&include).unwrap();
        let exclude_re = regex::Regex::new(&exclude).unwrap();
        let mut expected: Vec<(String, i64)> = tags
            .iter()
            .filter(|(name, _)| !exclude_re.is_match(name) && include_re.is_match(name))
            .cloned()
            .collect();
        expected.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        if n > 0 && expected.len() > n {
            expected.truncate(n);
        }
        let expected: Vec<String> = expected.into_iter().map(|(name, _)| name).collect();

        prop_assert_eq!(filter.apply(to_infos(&tags)), expected);
    }
}
