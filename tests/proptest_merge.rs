//! Property-based tests for the three-way merge engine (§4.5).
//!
//! Uses proptest to verify that:
//! - `merge` is deterministic for the same inputs
//! - `merge` is idempotent: feeding its own output back through as local and
//!   remote, against itself as base, reproduces the same merged set
//! - `merge_relevant_hash` is stable under permutation-insensitive comparisons
//!   (two issues with swapped-but-equal fields hash the same)

use beads_sync::merge::merge;
use beads_sync::model::{Issue, IssueType, Priority, Status};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

fn issue(id: &str, title: &str, updated_secs: i64, pinned: bool) -> Issue {
    Issue {
        id: id.to_string(),
        content_hash: None,
        title: title.to_string(),
        description: None,
        design: None,
        acceptance_criteria: None,
        notes: None,
        status: Status::Open,
        priority: Priority::MEDIUM,
        issue_type: IssueType::Task,
        assignee: None,
        estimated_minutes: None,
        created_at: Utc.timestamp_opt(0, 0).unwrap(),
        updated_at: Utc.timestamp_opt(updated_secs, 0).unwrap(),
        closed_at: None,
        due_at: None,
        defer_until: None,
        close_reason: None,
        external_ref: None,
        source_repo: None,
        deleted_at: None,
        deleted_by: None,
        delete_reason: None,
        ephemeral: false,
        pinned,
        labels: vec![],
        dependencies: vec![],
        comments: vec![],
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..Default::default()
    })]

    /// Property: merge is deterministic for the same (base, local, remote) triple.
    #[test]
    fn merge_is_deterministic(
        base_title in "[a-zA-Z0-9 ]{1,30}",
        local_title in "[a-zA-Z0-9 ]{1,30}",
        remote_title in "[a-zA-Z0-9 ]{1,30}",
        local_secs in 0i64..10_000,
        remote_secs in 0i64..10_000,
    ) {
        let base = vec![issue("bd-1", &base_title, 0, false)];
        let local = vec![issue("bd-1", &local_title, local_secs, false)];
        let remote = vec![issue("bd-1", &remote_title, remote_secs, false)];

        let first = merge(&base, &local, &remote);
        let second = merge(&base, &local, &remote);

        prop_assert_eq!(first.strategy_by_id, second.strategy_by_id);
        prop_assert_eq!(
            first.merged.iter().map(|i| i.title.clone()).collect::<Vec<_>>(),
            second.merged.iter().map(|i| i.title.clone()).collect::<Vec<_>>()
        );
        prop_assert_eq!(first.conflict_count, second.conflict_count);
    }

    /// Property: a merge that already converged (local == remote) is idempotent
    /// — merging its own output back in as both sides changes nothing further.
    #[test]
    fn merge_of_converged_state_is_idempotent(
        title in "[a-zA-Z0-9 ]{1,30}",
        secs in 0i64..10_000,
        pinned in any::<bool>(),
    ) {
        let base = vec![issue("bd-1", &title, 0, false)];
        let converged = vec![issue("bd-1", &title, secs, pinned)];

        let first = merge(&base, &converged, &converged);
        prop_assert_eq!(first.merged.len(), 1);

        let second = merge(&first.merged, &first.merged, &first.merged);
        prop_assert_eq!(second.merged.len(), 1);
        prop_assert_eq!(&second.merged[0].title, &first.merged[0].title);
        prop_assert_eq!(second.merged[0].pinned, first.merged[0].pinned);
    }

    /// Property: `merge_relevant_hash` is deterministic and insensitive to id.
    #[test]
    fn merge_relevant_hash_ignores_id(
        title in "[a-zA-Z0-9 ]{1,30}",
        secs in 0i64..10_000,
    ) {
        let a = issue("bd-1", &title, secs, false);
        let mut b = a.clone();
        b.id = "bd-2".to_string();

        prop_assert_eq!(a.merge_relevant_hash(), b.merge_relevant_hash());
    }

    /// Property: changing the title changes the merge-relevant hash.
    #[test]
    fn merge_relevant_hash_changes_with_title(
        title1 in "[a-zA-Z0-9 ]{5,30}",
        title2 in "[a-zA-Z0-9 ]{5,30}",
    ) {
        prop_assume!(title1 != title2);
        let a = issue("bd-1", &title1, 0, false);
        let b = issue("bd-1", &title2, 0, false);
        prop_assert_ne!(a.merge_relevant_hash(), b.merge_relevant_hash());
    }
}
