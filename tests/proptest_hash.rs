//! Property-based tests for per-issue content hashing (`util::hash`).
//!
//! Uses proptest to verify that:
//! - Hash output is always a valid 64-char hex string (SHA256)
//! - Hashing is deterministic
//! - Title changes produce hash changes
//! - Timestamp changes do not affect the hash

use beads_sync::model::{Issue, IssueType, Priority, Status};
use beads_sync::util::hash::{content_hash, ContentHashable};
use chrono::Utc;
use proptest::prelude::*;

fn make_issue(title: &str, description: Option<&str>) -> Issue {
    Issue {
        id: "bd-test".to_string(),
        content_hash: None,
        title: title.to_string(),
        description: description.map(ToString::to_string),
        design: None,
        acceptance_criteria: None,
        notes: None,
        status: Status::Open,
        priority: Priority::MEDIUM,
        issue_type: IssueType::Task,
        assignee: None,
        estimated_minutes: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
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
        pinned: false,
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

    /// Property: hash output is always a valid 64-char hex string (SHA256).
    #[test]
    fn hash_valid_hex_format(title in "\\PC{1,200}") {
        let issue = make_issue(&title, None);
        let hash = content_hash(&issue);

        prop_assert_eq!(hash.len(), 64, "SHA256 hash should be 64 hex chars");
        prop_assert!(
            hash.chars().all(|c: char| c.is_ascii_hexdigit()),
            "Hash must be valid hex: {hash}"
        );
    }

    /// Property: hashing is deterministic for the same issue.
    #[test]
    fn hash_deterministic(
        title in "\\PC{1,100}",
        description in proptest::option::of("\\PC{0,200}"),
    ) {
        let issue = make_issue(&title, description.as_deref());
        prop_assert_eq!(content_hash(&issue), content_hash(&issue));
    }

    /// Property: different titles produce different hashes.
    #[test]
    fn hash_changes_with_title(
        title1 in "[a-zA-Z0-9 ]{5,50}",
        title2 in "[a-zA-Z0-9 ]{5,50}",
    ) {
        prop_assume!(title1 != title2);
        let issue1 = make_issue(&title1, None);
        let issue2 = make_issue(&title2, None);
        prop_assert_ne!(content_hash(&issue1), content_hash(&issue2));
    }

    /// Property: hash ignores timestamp changes.
    #[test]
    fn hash_ignores_timestamps(title in "\\PC{1,50}") {
        let mut issue = make_issue(&title, None);
        let hash1 = content_hash(&issue);
        issue.updated_at = Utc::now();
        prop_assert_eq!(hash1, content_hash(&issue));
    }

    /// Property: the `ContentHashable` trait agrees with the free function.
    #[test]
    fn trait_matches_function(title in "\\PC{1,100}") {
        let issue = make_issue(&title, None);
        prop_assert_eq!(ContentHashable::content_hash(&issue), content_hash(&issue));
    }
}
