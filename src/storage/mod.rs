//! The opaque persistent store the sync core consumes (C2, §4.2).
//!
//! Modeled as a trait rather than a concrete type, per §9's "dynamic-dispatch
//! avoided" note: implementations differ only in how they satisfy this
//! capability set, never in how callers invoke them.

pub mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{Comment, Dependency, Issue};

/// Search filter for `Store::search`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchFilter {
    pub include_tombstones: bool,
}

/// Partial update applied by `Store::update`; every field is optional so a
/// caller can patch exactly the attributes that changed (§4.2).
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub design: Option<Option<String>>,
    pub acceptance_criteria: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub status: Option<crate::model::Status>,
    pub priority: Option<crate::model::Priority>,
    pub issue_type: Option<crate::model::IssueType>,
    pub assignee: Option<Option<String>>,
    pub estimated_minutes: Option<Option<i32>>,
    pub due_at: Option<Option<chrono::DateTime<chrono::Utc>>>,
    pub defer_until: Option<Option<chrono::DateTime<chrono::Utc>>>,
    pub external_ref: Option<Option<String>>,
}

impl IssuePatch {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.design.is_none()
            && self.acceptance_criteria.is_none()
            && self.notes.is_none()
            && self.status.is_none()
            && self.priority.is_none()
            && self.issue_type.is_none()
            && self.assignee.is_none()
            && self.estimated_minutes.is_none()
            && self.due_at.is_none()
            && self.defer_until.is_none()
            && self.external_ref.is_none()
    }
}

/// The capability set the sync core relies on (§4.2). Every method is
/// transactional per call and serializable with respect to other calls on
/// the same store; none panic.
pub trait Store {
    fn search(&self, filter: SearchFilter) -> Result<Vec<Issue>>;
    fn get(&self, id: &str) -> Result<Option<Issue>>;
    fn create(&mut self, issue: &Issue, actor: &str) -> Result<()>;
    fn update(&mut self, id: &str, patch: &IssuePatch, actor: &str) -> Result<Issue>;
    fn close(&mut self, id: &str, actor: &str, reason: &str) -> Result<Issue>;
    fn reopen(&mut self, id: &str, actor: &str, reason: &str) -> Result<Issue>;

    fn add_label(&mut self, issue_id: &str, label: &str) -> Result<bool>;
    fn get_labels(&self, issue_id: &str) -> Result<Vec<String>>;

    fn add_dependency(&mut self, dep: &Dependency) -> Result<bool>;
    fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Dependency>>;
    fn get_all_dependency_records(&self) -> Result<Vec<Dependency>>;

    /// Repoint every stored dependency record naming `old_id` (as either
    /// source or target) at `new_id`, in place. Used by the import pipeline
    /// when `rename_on_import` resolves a foreign-prefix id to a local one,
    /// so already-resident issues that depended on the foreign id keep
    /// pointing at something that still exists.
    fn rename_dependency_target(&mut self, old_id: &str, new_id: &str) -> Result<usize>;

    fn add_comment(&mut self, comment: &Comment) -> Result<()>;
    fn get_comments(&self, issue_id: &str) -> Result<Vec<Comment>>;

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()>;
    fn get_metadata(&self, key: &str) -> Result<Option<String>>;

    /// Read the runtime config-layer overrides DB-persisted users have set
    /// (§6.5's lowest-precedence-above-defaults layer).
    fn get_all_config(&self) -> Result<std::collections::HashMap<String, String>>;

    fn clear_dirty_issues_by_id(&mut self, ids: &[String]) -> Result<usize>;
    fn dirty_issue_ids(&self) -> Result<Vec<String>>;

    fn count(&self) -> Result<usize>;
}
