//! Template validation: structural checks on an issue's fields, independent
//! of the merge/sync machinery. Gated at export time by `validation.on-sync`
//! (§6.4/§6.5) rather than always enforced, since hand-edited or
//! foreign-tool-produced JSONL can carry fields this crate would reject on
//! create but still wants to sync rather than silently drop.

use crate::error::ValidationError;
use crate::model::{Issue, Priority};
use crate::util::id::is_valid_id_format;

/// Validates an issue's fields against the template shape (§4.7 step 2's
/// "optional template validation").
pub struct IssueValidator;

impl IssueValidator {
    /// Validate an issue and return every field violation found.
    ///
    /// # Errors
    ///
    /// Returns the accumulated `ValidationError`s if any rule is violated.
    pub fn validate(issue: &Issue) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if issue.id.trim().is_empty() {
            errors.push(ValidationError::new("id", "cannot be empty"));
        } else if !is_valid_id_format(&issue.id) {
            errors.push(ValidationError::new(
                "id",
                "invalid format (expected prefix-hash)",
            ));
        }

        if issue.title.trim().is_empty() {
            errors.push(ValidationError::new("title", "cannot be empty"));
        }
        if issue.title.len() > 500 {
            errors.push(ValidationError::new("title", "exceeds 500 characters"));
        }

        if let Some(description) = issue.description.as_ref() {
            if description.len() > 102_400 {
                errors.push(ValidationError::new("description", "exceeds 100KB"));
            }
        }

        if issue.priority.0 < Priority::CRITICAL.0 || issue.priority.0 > Priority::BACKLOG.0 {
            errors.push(ValidationError::new("priority", "must be 0-4"));
        }

        if issue.updated_at < issue.created_at {
            errors.push(ValidationError::new(
                "updated_at",
                "cannot be before created_at",
            ));
        }

        if let Some(external_ref) = issue.external_ref.as_ref() {
            if external_ref.len() > 200 {
                errors.push(ValidationError::new(
                    "external_ref",
                    "exceeds 200 characters",
                ));
            }
            if external_ref.chars().any(char::is_whitespace) {
                errors.push(ValidationError::new(
                    "external_ref",
                    "cannot contain whitespace",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IssueType, Status};
    use chrono::Utc;

    fn valid_issue() -> Issue {
        Issue {
            id: "bd-abc123".to_string(),
            content_hash: None,
            title: "A title".to_string(),
            description: None,
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

    #[test]
    fn valid_issue_passes() {
        assert!(IssueValidator::validate(&valid_issue()).is_ok());
    }

    #[test]
    fn empty_title_is_rejected() {
        let mut issue = valid_issue();
        issue.title = "   ".to_string();
        let errors = IssueValidator::validate(&issue).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "title"));
    }

    #[test]
    fn malformed_id_is_rejected() {
        let mut issue = valid_issue();
        issue.id = "not-an-id-!!".to_string();
        let errors = IssueValidator::validate(&issue).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "id"));
    }

    #[test]
    fn updated_before_created_is_rejected() {
        let mut issue = valid_issue();
        issue.updated_at = issue.created_at - chrono::Duration::seconds(1);
        let errors = IssueValidator::validate(&issue).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "updated_at"));
    }

    #[test]
    fn external_ref_with_whitespace_is_rejected() {
        let mut issue = valid_issue();
        issue.external_ref = Some("has space".to_string());
        let errors = IssueValidator::validate(&issue).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "external_ref"));
    }
}
