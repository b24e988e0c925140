//! SQLite-backed implementation of `Store`.

use super::{IssuePatch, SearchFilter, Store, schema::apply_schema};
use crate::error::{BeadsError, Result};
use crate::model::{Comment, Dependency, DependencyType, Issue, IssueType, Priority, Status};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Tracks side effects accumulated by one call to `SqliteStore::mutate`.
///
/// Kept minimal relative to an audit-logging store: this crate has no
/// audit subsystem, but still wants a single place that marks issues dirty
/// so C7's export pre-flight and C9's finalize step agree on what changed.
struct MutationContext {
    dirty_ids: Vec<String>,
}

impl MutationContext {
    fn new() -> Self {
        Self { dirty_ids: Vec::new() }
    }

    fn mark_dirty(&mut self, issue_id: &str) {
        self.dirty_ids.push(issue_id.to_string());
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema application fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema application fails.
    pub fn open_with_timeout(path: &Path, lock_timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        if let Some(timeout) = lock_timeout_ms {
            conn.busy_timeout(Duration::from_millis(timeout))?;
        }
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Run a closure inside an immediate transaction, marking any touched
    /// issues dirty and persisting that before commit.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the transaction is rolled back.
    fn mutate<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut MutationContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let mut ctx = MutationContext::new();

        let result = f(&tx, &mut ctx)?;

        for id in ctx.dirty_ids {
            tx.execute(
                "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?, ?)",
                rusqlite::params![id, Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;
        Ok(result)
    }

    /// Run multi-step writes inside a single transaction (§4.2 `run_in_transaction`).
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails; the transaction is rolled back.
    pub fn run_in_transaction<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn row_to_issue(row: &rusqlite::Row) -> rusqlite::Result<Issue> {
        let status_str: String = row.get("status")?;
        let issue_type_str: String = row.get("issue_type")?;
        let created_at: String = row.get("created_at")?;
        let updated_at: String = row.get("updated_at")?;

        Ok(Issue {
            id: row.get("id")?,
            content_hash: row.get("content_hash")?,
            title: row.get("title")?,
            description: empty_to_none(row.get("description")?),
            design: empty_to_none(row.get("design")?),
            acceptance_criteria: empty_to_none(row.get("acceptance_criteria")?),
            notes: empty_to_none(row.get("notes")?),
            status: Status::from_str(&status_str).unwrap_or(Status::Open),
            priority: Priority(row.get("priority")?),
            issue_type: IssueType::from_str(&issue_type_str).unwrap_or_default(),
            assignee: row.get("assignee")?,
            estimated_minutes: row.get("estimated_minutes")?,
            created_at: parse_rfc3339(&created_at),
            updated_at: parse_rfc3339(&updated_at),
            closed_at: parse_rfc3339_opt(row.get("closed_at")?),
            due_at: parse_rfc3339_opt(row.get("due_at")?),
            defer_until: parse_rfc3339_opt(row.get("defer_until")?),
            close_reason: empty_to_none(row.get("close_reason")?),
            external_ref: row.get("external_ref")?,
            source_repo: empty_to_none(row.get("source_repo")?),
            deleted_at: parse_rfc3339_opt(row.get("deleted_at")?),
            deleted_by: empty_to_none(row.get("deleted_by")?),
            delete_reason: empty_to_none(row.get("delete_reason")?),
            ephemeral: row.get::<_, i64>("ephemeral")? != 0,
            pinned: row.get::<_, i64>("pinned")? != 0,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
        })
    }

    fn populate_relations(&self, issue: &mut Issue) -> Result<()> {
        issue.labels = self.get_labels(&issue.id)?;
        issue.dependencies = self.get_dependencies(&issue.id)?;
        issue.comments = self.get_comments(&issue.id)?;
        Ok(())
    }
}

fn empty_to_none(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_rfc3339_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_rfc3339(&s))
}

const ISSUE_COLUMNS: &str = "id, content_hash, title, description, design, acceptance_criteria,
    notes, status, priority, issue_type, assignee, estimated_minutes, created_at, updated_at,
    closed_at, due_at, defer_until, close_reason, external_ref, source_repo, deleted_at,
    deleted_by, delete_reason, ephemeral, pinned";

impl Store for SqliteStore {
    fn search(&self, filter: SearchFilter) -> Result<Vec<Issue>> {
        let sql = if filter.include_tombstones {
            format!("SELECT {ISSUE_COLUMNS} FROM issues ORDER BY id")
        } else {
            format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE status != 'tombstone' ORDER BY id")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let mut issues = stmt
            .query_map([], Self::row_to_issue)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for issue in &mut issues {
            self.populate_relations(issue)?;
        }
        Ok(issues)
    }

    fn get(&self, id: &str) -> Result<Option<Issue>> {
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?");
        let issue = self
            .conn
            .query_row(&sql, [id], Self::row_to_issue)
            .optional()?;
        match issue {
            Some(mut issue) => {
                self.populate_relations(&mut issue)?;
                Ok(Some(issue))
            }
            None => Ok(None),
        }
    }

    fn create(&mut self, issue: &Issue, actor: &str) -> Result<()> {
        let _ = actor;
        let is_tombstoned: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM issues WHERE id = ?1 AND status = 'tombstone'",
                [&issue.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if is_tombstoned {
            return Err(BeadsError::IdCollision { id: issue.id.clone() });
        }

        self.mutate(|tx, ctx| {
            tx.execute(
                "INSERT INTO issues (
                    id, content_hash, title, description, design, acceptance_criteria, notes,
                    status, priority, issue_type, assignee, estimated_minutes, created_at,
                    updated_at, closed_at, due_at, defer_until, close_reason, external_ref,
                    source_repo, deleted_at, deleted_by, delete_reason, ephemeral, pinned
                ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
                rusqlite::params![
                    issue.id,
                    issue.content_hash,
                    issue.title,
                    issue.description.as_deref().unwrap_or(""),
                    issue.design.as_deref().unwrap_or(""),
                    issue.acceptance_criteria.as_deref().unwrap_or(""),
                    issue.notes.as_deref().unwrap_or(""),
                    issue.status.as_str(),
                    issue.priority.0,
                    issue.issue_type.as_str(),
                    issue.assignee,
                    issue.estimated_minutes,
                    issue.created_at.to_rfc3339(),
                    issue.updated_at.to_rfc3339(),
                    issue.closed_at.map(|d| d.to_rfc3339()),
                    issue.due_at.map(|d| d.to_rfc3339()),
                    issue.defer_until.map(|d| d.to_rfc3339()),
                    issue.close_reason.as_deref().unwrap_or(""),
                    issue.external_ref,
                    issue.source_repo.as_deref().unwrap_or(""),
                    issue.deleted_at.map(|d| d.to_rfc3339()),
                    issue.deleted_by.as_deref().unwrap_or(""),
                    issue.delete_reason.as_deref().unwrap_or(""),
                    i64::from(issue.ephemeral),
                    i64::from(issue.pinned),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    BeadsError::IdCollision { id: issue.id.clone() }
                }
                other => BeadsError::Database(other),
            })?;

            for label in &issue.labels {
                tx.execute(
                    "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                    rusqlite::params![issue.id, label],
                )?;
            }
            ctx.mark_dirty(&issue.id);
            Ok(())
        })
    }

    #[allow(clippy::too_many_lines)]
    fn update(&mut self, id: &str, patch: &IssuePatch, actor: &str) -> Result<Issue> {
        let _ = actor;
        let mut issue = self
            .get(id)?
            .ok_or_else(|| BeadsError::IssueNotFound { id: id.to_string() })?;

        if patch.is_empty() {
            return Ok(issue);
        }

        if let Some(title) = &patch.title {
            issue.title = title.clone();
        }
        if let Some(v) = &patch.description {
            issue.description = v.clone();
        }
        if let Some(v) = &patch.design {
            issue.design = v.clone();
        }
        if let Some(v) = &patch.acceptance_criteria {
            issue.acceptance_criteria = v.clone();
        }
        if let Some(v) = &patch.notes {
            issue.notes = v.clone();
        }
        if let Some(status) = patch.status.clone() {
            let leaving_closed = issue.status == Status::Closed && status != Status::Closed;
            issue.status = status;
            if leaving_closed {
                issue.closed_at = None;
            }
        }
        if let Some(priority) = patch.priority {
            issue.priority = priority;
        }
        if let Some(issue_type) = patch.issue_type.clone() {
            issue.issue_type = issue_type;
        }
        if let Some(v) = &patch.assignee {
            issue.assignee = v.clone();
        }
        if let Some(v) = patch.estimated_minutes {
            issue.estimated_minutes = v;
        }
        if let Some(v) = patch.due_at {
            issue.due_at = v;
        }
        if let Some(v) = patch.defer_until {
            issue.defer_until = v;
        }
        if let Some(v) = &patch.external_ref {
            issue.external_ref = v.clone();
        }
        issue.updated_at = Utc::now();

        self.mutate(|tx, ctx| {
            tx.execute(
                "UPDATE issues SET title=?, description=?, design=?, acceptance_criteria=?,
                    notes=?, status=?, priority=?, issue_type=?, assignee=?, estimated_minutes=?,
                    due_at=?, defer_until=?, external_ref=?, closed_at=?, updated_at=?
                 WHERE id=?",
                rusqlite::params![
                    issue.title,
                    issue.description.as_deref().unwrap_or(""),
                    issue.design.as_deref().unwrap_or(""),
                    issue.acceptance_criteria.as_deref().unwrap_or(""),
                    issue.notes.as_deref().unwrap_or(""),
                    issue.status.as_str(),
                    issue.priority.0,
                    issue.issue_type.as_str(),
                    issue.assignee,
                    issue.estimated_minutes,
                    issue.due_at.map(|d| d.to_rfc3339()),
                    issue.defer_until.map(|d| d.to_rfc3339()),
                    issue.external_ref,
                    issue.closed_at.map(|d| d.to_rfc3339()),
                    issue.updated_at.to_rfc3339(),
                    issue.id,
                ],
            )?;
            ctx.mark_dirty(&issue.id);
            Ok(())
        })?;

        Ok(issue)
    }

    fn close(&mut self, id: &str, actor: &str, reason: &str) -> Result<Issue> {
        let patch = IssuePatch {
            status: Some(Status::Closed),
            ..Default::default()
        };
        let mut issue = self.update(id, &patch, actor)?;
        let closed_at = Utc::now();
        issue.closed_at = Some(closed_at);
        issue.close_reason = Some(reason.to_string());
        self.mutate(|tx, ctx| {
            tx.execute(
                "UPDATE issues SET closed_at = ?, close_reason = ? WHERE id = ?",
                rusqlite::params![closed_at.to_rfc3339(), reason, id],
            )?;
            ctx.mark_dirty(id);
            Ok(())
        })?;
        Ok(issue)
    }

    fn reopen(&mut self, id: &str, actor: &str, reason: &str) -> Result<Issue> {
        let patch = IssuePatch {
            status: Some(Status::Open),
            ..Default::default()
        };
        let mut issue = self.update(id, &patch, actor)?;
        issue.close_reason = Some(reason.to_string());
        Ok(issue)
    }

    fn add_label(&mut self, issue_id: &str, label: &str) -> Result<bool> {
        self.mutate(|tx, ctx| {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?, ?)",
                rusqlite::params![issue_id, label],
            )? > 0;
            if changed {
                ctx.mark_dirty(issue_id);
            }
            Ok(changed)
        })
    }

    fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM labels WHERE issue_id = ? ORDER BY label")?;
        let labels = stmt
            .query_map([issue_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    fn add_dependency(&mut self, dep: &Dependency) -> Result<bool> {
        self.mutate(|tx, ctx| {
            let changed = tx.execute(
                "INSERT OR IGNORE INTO dependencies (issue_id, depends_on_id, type, created_at, created_by)
                 VALUES (?, ?, ?, ?, ?)",
                rusqlite::params![
                    dep.issue_id,
                    dep.depends_on_id,
                    dep.dep_type.as_str(),
                    dep.created_at.to_rfc3339(),
                    dep.created_by,
                ],
            )? > 0;
            if changed {
                ctx.mark_dirty(&dep.issue_id);
            }
            Ok(changed)
        })
    }

    fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, type, created_at, created_by
             FROM dependencies WHERE issue_id = ? ORDER BY depends_on_id",
        )?;
        let deps = stmt
            .query_map([issue_id], row_to_dependency)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }

    fn get_all_dependency_records(&self) -> Result<Vec<Dependency>> {
        let mut stmt = self.conn.prepare(
            "SELECT issue_id, depends_on_id, type, created_at, created_by
             FROM dependencies ORDER BY issue_id, depends_on_id",
        )?;
        let deps = stmt
            .query_map([], row_to_dependency)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deps)
    }

    fn rename_dependency_target(&mut self, old_id: &str, new_id: &str) -> Result<usize> {
        self.mutate(|tx, ctx| {
            let retargeted = tx.execute(
                "UPDATE OR IGNORE dependencies SET depends_on_id = ? WHERE depends_on_id = ?",
                rusqlite::params![new_id, old_id],
            )?;
            let resourced = tx.execute(
                "UPDATE OR IGNORE dependencies SET issue_id = ? WHERE issue_id = ?",
                rusqlite::params![new_id, old_id],
            )?;
            if retargeted > 0 || resourced > 0 {
                ctx.mark_dirty(new_id);
            }
            Ok(retargeted + resourced)
        })
    }

    fn add_comment(&mut self, comment: &Comment) -> Result<()> {
        self.mutate(|tx, ctx| {
            tx.execute(
                "INSERT INTO comments (issue_id, author, text, created_at) VALUES (?, ?, ?, ?)",
                rusqlite::params![
                    comment.issue_id,
                    comment.author,
                    comment.body,
                    comment.created_at.to_rfc3339(),
                ],
            )?;
            ctx.mark_dirty(&comment.issue_id);
            Ok(())
        })
    }

    fn get_comments(&self, issue_id: &str) -> Result<Vec<Comment>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, issue_id, author, text, created_at FROM comments
             WHERE issue_id = ? ORDER BY created_at, id",
        )?;
        let comments = stmt
            .query_map([issue_id], |row| {
                let created_at: String = row.get(4)?;
                Ok(Comment {
                    id: row.get(0)?,
                    issue_id: row.get(1)?,
                    author: row.get(2)?,
                    body: row.get(3)?,
                    created_at: parse_rfc3339(&created_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(comments)
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn get_all_config(&self) -> Result<std::collections::HashMap<String, String>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM config")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<std::collections::HashMap<_, _>>>()?;
        Ok(rows)
    }

    fn clear_dirty_issues_by_id(&mut self, ids: &[String]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut cleared = 0;
        for id in ids {
            cleared += tx.execute("DELETE FROM dirty_issues WHERE issue_id = ?", [id])?;
        }
        tx.commit()?;
        Ok(cleared)
    }

    fn dirty_issue_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT issue_id FROM dirty_issues ORDER BY marked_at")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn row_to_dependency(row: &rusqlite::Row) -> rusqlite::Result<Dependency> {
    let dep_type_str: String = row.get(2)?;
    let created_at: String = row.get(3)?;
    Ok(Dependency {
        issue_id: row.get(0)?,
        depends_on_id: row.get(1)?,
        dep_type: DependencyType::from_str(&dep_type_str).unwrap_or(DependencyType::Related),
        created_at: parse_rfc3339(&created_at),
        created_by: row.get(4)?,
    })
}
