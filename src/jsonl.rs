//! JSONL codec for the canonical export file (C3, §4.3).
//!
//! One issue per line, sorted by id, UTF-8, LF-terminated. Ephemeral issues
//! never reach this file (§3.2 invariant 5). Writes are atomic: a temp file
//! in the same directory, fsynced best-effort, then renamed into place with
//! `0600` permissions.

use crate::error::{BeadsError, Result};
use crate::model::Issue;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Serialize issues to canonical JSONL bytes: sorted by id, one object per line.
///
/// # Errors
///
/// Returns an error if any issue fails to serialize.
pub fn encode(issues: &[Issue]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&Issue> = issues.iter().filter(|i| !i.ephemeral).collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id));

    let mut buf = Vec::new();
    for issue in sorted {
        serde_json::to_writer(&mut buf, issue)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Outcome of parsing a JSONL file: the issues that parsed plus any lines
/// skipped as malformed (C3 tolerant-reader behavior: warn and skip, never abort).
#[derive(Debug, Default)]
pub struct DecodeReport {
    pub issues: Vec<Issue>,
    pub skipped_lines: Vec<usize>,
}

/// Parse a JSONL buffer into issues, skipping malformed lines with a warning
/// rather than aborting the whole read.
#[must_use]
pub fn decode(bytes: &[u8]) -> DecodeReport {
    let mut report = DecodeReport::default();
    for (idx, line) in bytes.lines().enumerate() {
        let line_no = idx + 1;
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping unreadable JSONL line");
                report.skipped_lines.push(line_no);
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.contains("<<<<<<<") || line.contains("=======") || line.contains(">>>>>>>") {
            warn!(line = line_no, "skipping unresolved merge conflict marker");
            report.skipped_lines.push(line_no);
            continue;
        }
        match serde_json::from_str::<Issue>(&line) {
            Ok(issue) => report.issues.push(issue),
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed JSONL line");
                report.skipped_lines.push(line_no);
            }
        }
    }
    report
}

/// Read and parse a JSONL file from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn read_file(path: &Path) -> Result<DecodeReport> {
    let bytes = fs::read(path).map_err(BeadsError::Io)?;
    Ok(decode(&bytes))
}

/// Read raw JSONL bytes without parsing (for staleness hashing).
///
/// # Errors
///
/// Returns an error if the file cannot be read. A missing file is treated as empty.
pub fn read_raw(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(BeadsError::Io(e)),
    }
}

/// Atomically write issues to `path`: encode, write to a same-directory temp
/// file, fsync best-effort, rename, then `chmod 0600`.
///
/// # Errors
///
/// Returns an error if any filesystem step fails. Cleans up the temp file on failure.
pub fn write_file_atomic(path: &Path, issues: &[Issue]) -> Result<()> {
    let bytes = encode(issues)?;
    write_bytes_atomic(path, &bytes)
}

/// # Errors
///
/// Returns an error if any filesystem step fails. Cleans up the temp file on failure.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        BeadsError::Other(anyhow::anyhow!("path {} has no parent directory", path.display()))
    })?;
    fs::create_dir_all(dir).map_err(BeadsError::Io)?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("export.jsonl")
    ));

    let result = (|| -> Result<()> {
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(BeadsError::Io)?;
            let mut writer = BufWriter::new(&file);
            writer.write_all(bytes).map_err(BeadsError::Io)?;
            writer.flush().map_err(BeadsError::Io)?;
            let _ = file.sync_all();
        }
        fs::rename(&tmp_path, path).map_err(BeadsError::Io)?;
        set_owner_only_permissions(path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms).map_err(BeadsError::Io)
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Count non-empty, non-skipped lines a file would decode to, without
/// allocating full `Issue` values. Used by C8's count-validation guard.
///
/// # Errors
///
/// Returns an error if the file cannot be opened.
pub fn count_records(path: &Path) -> Result<usize> {
    let file = File::open(path).map_err(BeadsError::Io)?;
    let reader = BufReader::new(file);
    let mut count = 0;
    for line in reader.lines() {
        let line = line.map_err(BeadsError::Io)?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IssueType, Priority, Status};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample(id: &str, ephemeral: bool) -> Issue {
        Issue {
            id: id.to_string(),
            content_hash: None,
            title: "Title".to_string(),
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
            ephemeral,
            pinned: false,
            labels: vec![],
            dependencies: vec![],
            comments: vec![],
        }
    }

    #[test]
    fn encode_sorts_by_id_and_drops_ephemeral() {
        let issues = vec![sample("bd-2", false), sample("bd-1", false), sample("bd-3", true)];
        let bytes = encode(&issues).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"bd-1\""));
        assert!(lines[1].contains("\"bd-2\""));
    }

    #[test]
    fn decode_skips_malformed_lines_without_aborting() {
        let input = "{\"id\":\"bd-1\",\"title\":\"ok\",\"status\":\"open\",\"priority\":2,\"issue_type\":\"task\",\"created_at\":\"2026-01-01T00:00:00Z\",\"updated_at\":\"2026-01-01T00:00:00Z\"}\nnot json\n\n";
        let report = decode(input.as_bytes());
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.skipped_lines, vec![2]);
    }

    #[test]
    fn decode_skips_unresolved_conflict_markers() {
        let input = "<<<<<<< HEAD\n{}\n=======\n{}\n>>>>>>> branch\n";
        let report = decode(input.as_bytes());
        assert!(report.issues.is_empty());
        assert_eq!(report.skipped_lines.len(), 3);
    }

    #[test]
    fn write_file_atomic_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        let issues = vec![sample("bd-1", false)];
        write_file_atomic(&path, &issues).unwrap();

        let report = read_file(&path).unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].id, "bd-1");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn count_records_ignores_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        fs::write(&path, "{}\n\n{}\n").unwrap();
        assert_eq!(count_records(&path).unwrap(), 2);
    }
}
