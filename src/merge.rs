//! Three-way merge engine (C5, §4.5).
//!
//! Pure: `merge(base, local, remote)` always produces the same output for the
//! same inputs — same merged list (sorted by id), same strategy map, same
//! conflict count. No I/O, no clock reads beyond the `updated_at` fields it is handed.

use crate::model::{Comment, Dependency, Issue};
use std::collections::BTreeMap;
use tracing::warn;

/// Which side (or combination) won for a given issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Local,
    Remote,
    Merged,
    Same,
    Skip,
}

/// Result of a three-way merge.
#[derive(Debug, Default)]
pub struct MergeResult {
    pub merged: Vec<Issue>,
    pub strategy_by_id: BTreeMap<String, Strategy>,
    pub conflict_count: usize,
}

const CLOCK_SKEW_WARN_SECONDS: i64 = 24 * 3600;

/// Run the three-way merge per §4.5's dispatch table.
#[must_use]
pub fn merge(base: &[Issue], local: &[Issue], remote: &[Issue]) -> MergeResult {
    let base_map = index_by_id(base);
    let local_map = index_by_id(local);
    let remote_map = index_by_id(remote);

    let mut ids: Vec<&String> = base_map
        .keys()
        .chain(local_map.keys())
        .chain(remote_map.keys())
        .collect();
    ids.sort();
    ids.dedup();

    let mut result = MergeResult::default();

    for id in ids {
        let b = base_map.get(id);
        let l = local_map.get(id);
        let r = remote_map.get(id);

        match dispatch(b, l, r) {
            DispatchOutcome::Skip => {
                result.strategy_by_id.insert(id.clone(), Strategy::Skip);
            }
            DispatchOutcome::Deleted(strategy) => {
                result.strategy_by_id.insert(id.clone(), strategy);
            }
            DispatchOutcome::Keep(issue, strategy) => {
                if matches!(strategy, Strategy::Merged) {
                    result.conflict_count += 1;
                }
                result.strategy_by_id.insert(id.clone(), strategy);
                result.merged.push(issue);
            }
        }
    }

    result.merged.sort_by(|a, b| a.id.cmp(&b.id));
    result
}

fn index_by_id(issues: &[Issue]) -> BTreeMap<String, &Issue> {
    issues.iter().map(|i| (i.id.clone(), i)).collect()
}

/// Outcome of dispatching on one id's `(base, local, remote)` triple.
enum DispatchOutcome {
    /// Absent on all three sides — nothing to report.
    Skip,
    /// The issue is gone from the merged set; `Strategy` names which side's
    /// deletion won (the side that deleted, against an unchanged base).
    Deleted(Strategy),
    /// The issue survives the merge under the given strategy.
    Keep(Issue, Strategy),
}

/// Dispatch on `(base, local, remote)` presence/equality per the §4.5 table.
fn dispatch(b: Option<&&Issue>, l: Option<&&Issue>, r: Option<&&Issue>) -> DispatchOutcome {
    match (b, l, r) {
        (None, None, None) => DispatchOutcome::Skip,
        (None, Some(local), None) => DispatchOutcome::Keep((*local).clone(), Strategy::Local),
        (None, None, Some(remote)) => DispatchOutcome::Keep((*remote).clone(), Strategy::Remote),
        (None, Some(local), Some(remote)) => {
            DispatchOutcome::Keep(field_merge(None, local, remote), Strategy::Merged)
        }
        (Some(base), None, Some(remote)) => {
            if base.merge_relevant_hash() == remote.merge_relevant_hash() {
                // Local deleted it, remote left it unchanged: the deletion wins.
                DispatchOutcome::Deleted(Strategy::Local)
            } else {
                DispatchOutcome::Keep(field_merge(Some(base), base, remote), Strategy::Merged)
            }
        }
        (Some(base), Some(local), None) => {
            if base.merge_relevant_hash() == local.merge_relevant_hash() {
                // Remote deleted it, local left it unchanged: the deletion wins.
                DispatchOutcome::Deleted(Strategy::Remote)
            } else {
                DispatchOutcome::Keep(field_merge(Some(base), local, base), Strategy::Merged)
            }
        }
        (Some(base), Some(local), Some(remote)) => {
            let eq_bl = base.merge_relevant_hash() == local.merge_relevant_hash();
            let eq_br = base.merge_relevant_hash() == remote.merge_relevant_hash();
            let eq_lr = local.merge_relevant_hash() == remote.merge_relevant_hash();

            if eq_bl && eq_br {
                DispatchOutcome::Keep((*base).clone(), Strategy::Same)
            } else if eq_bl && !eq_br {
                DispatchOutcome::Keep((*remote).clone(), Strategy::Remote)
            } else if !eq_bl && eq_br {
                DispatchOutcome::Keep((*local).clone(), Strategy::Local)
            } else if eq_lr {
                DispatchOutcome::Keep((*local).clone(), Strategy::Same)
            } else {
                DispatchOutcome::Keep(field_merge(Some(base), local, remote), Strategy::Merged)
            }
        }
    }
}

/// Merge a conflicting pair field-by-field: last-writer-wins on `updated_at`,
/// remote wins ties. `base` is accepted for call-site symmetry with the
/// dispatch table but carries no weight in the field rule itself.
fn field_merge(_base: Option<&&Issue>, local: &Issue, remote: &Issue) -> Issue {
    let skew = (local.updated_at - remote.updated_at).num_seconds().abs();
    if skew > CLOCK_SKEW_WARN_SECONDS {
        warn!(issue_id = %local.id, skew_seconds = skew, "possible clock skew between local and remote updates");
    }

    let remote_wins = remote.updated_at >= local.updated_at;
    let (winner, loser) = if remote_wins { (remote, local) } else { (local, remote) };

    let mut merged = winner.clone();
    merged.labels = union_labels(&local.labels, &remote.labels);
    merged.dependencies = union_dependencies(&local.dependencies, &remote.dependencies);
    merged.comments = union_comments(&local.comments, &remote.comments);
    let _ = loser;
    merged
}

fn union_labels(a: &[String], b: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
    labels.sort();
    labels.dedup();
    labels
}

fn union_dependencies(a: &[Dependency], b: &[Dependency]) -> Vec<Dependency> {
    let mut by_key: BTreeMap<(String, String), Dependency> = BTreeMap::new();
    for dep in a.iter().chain(b.iter()) {
        let key = (dep.depends_on_id.clone(), dep.dep_type.as_str().to_string());
        match by_key.get(&key) {
            Some(existing) if existing.created_at >= dep.created_at => {}
            _ => {
                by_key.insert(key, dep.clone());
            }
        }
    }
    let mut deps: Vec<Dependency> = by_key.into_values().collect();
    deps.sort_by(|a, b| a.depends_on_id.cmp(&b.depends_on_id));
    deps
}

fn comment_key(c: &Comment) -> String {
    if c.id != 0 {
        format!("id:{}", c.id)
    } else {
        format!("pair:{}:{}", c.author, c.body)
    }
}

fn union_comments(a: &[Comment], b: &[Comment]) -> Vec<Comment> {
    let mut seen = std::collections::HashSet::new();
    let mut comments: Vec<Comment> = Vec::new();
    for c in a.iter().chain(b.iter()) {
        let key = comment_key(c);
        if seen.insert(key) {
            comments.push(c.clone());
        }
    }
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    comments
}
