//! Hash & staleness oracle (C4, §4.4).
//!
//! Two orthogonal questions, both built on the same `util::hash::hash_bytes`
//! primitive over a canonical byte form — never on a per-issue content hash
//! and never on mtime alone.

use crate::error::Result;
use crate::jsonl;
use crate::model::Issue;
use crate::storage::Store;
use crate::util::hash::hash_bytes;
use std::fs;
use std::path::Path;

/// Canonical serialization of a store's issues: sorted by id, one compact
/// JSON object per line. Its SHA-256 is "the store hash" (§4.4).
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn canonical_store_bytes(store: &dyn Store) -> Result<Vec<u8>> {
    let issues: Vec<Issue> = store.search(crate::storage::SearchFilter {
        include_tombstones: true,
    })?;
    jsonl::encode(&issues)
}

/// Q1: has the JSONL changed since the last import, as recorded by
/// `jsonl_content_hash[:repo_key]` (falling back to the legacy
/// `last_import_hash[:repo_key]` alias)? Unset ⇒ first run ⇒ changed.
///
/// # Errors
///
/// Returns an error if the file or metadata cannot be read.
pub fn has_jsonl_changed(path: &Path, repo_key: &str, store: &dyn Store) -> Result<bool> {
    let bytes = jsonl::read_raw(path)?;
    let current_hash = hash_bytes(&bytes);

    let key = format!("jsonl_content_hash:{repo_key}");
    let legacy_key = format!("last_import_hash:{repo_key}");

    let recorded = match store.get_metadata(&key)? {
        Some(v) => Some(v),
        None => store.get_metadata(&legacy_key)?,
    };

    match recorded {
        None => Ok(true),
        Some(recorded_hash) => Ok(recorded_hash != current_hash),
    }
}

/// Q2: is the JSONL newer in content than the store? Fast-rejects on mtime,
/// then falls back to a content comparison so that content-identical
/// daemon re-exports with a fresh mtime are never reported as "newer".
///
/// # Errors
///
/// Returns an error if either side cannot be read.
pub fn is_jsonl_newer(path: &Path, db_path: &Path, store: &dyn Store) -> Result<bool> {
    let jsonl_mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
    let db_mtime = fs::metadata(db_path).and_then(|m| m.modified()).ok();

    match (jsonl_mtime, db_mtime) {
        (Some(j), Some(d)) if j <= d => return Ok(false),
        _ => {}
    }

    let jsonl_bytes = jsonl::read_raw(path)?;
    let jsonl_hash = hash_bytes(&jsonl_bytes);
    let store_hash = hash_bytes(&canonical_store_bytes(store)?);

    Ok(jsonl_hash != store_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStore;
    use tempfile::tempdir;

    #[test]
    fn unset_metadata_means_changed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        fs::write(&path, "").unwrap();
        let store = SqliteStore::open_memory().unwrap();
        assert!(has_jsonl_changed(&path, "origin", &store).unwrap());
    }

    #[test]
    fn matching_hash_means_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        fs::write(&path, "hello").unwrap();
        let mut store = SqliteStore::open_memory().unwrap();
        store
            .set_metadata("jsonl_content_hash:origin", &hash_bytes(b"hello"))
            .unwrap();
        assert!(!has_jsonl_changed(&path, "origin", &store).unwrap());
    }

    #[test]
    fn legacy_alias_is_consulted_when_primary_key_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("issues.jsonl");
        fs::write(&path, "hello").unwrap();
        let mut store = SqliteStore::open_memory().unwrap();
        store
            .set_metadata("last_import_hash:origin", &hash_bytes(b"hello"))
            .unwrap();
        assert!(!has_jsonl_changed(&path, "origin", &store).unwrap());
    }

    #[test]
    fn equal_content_different_mtime_is_not_newer() {
        let dir = tempdir().unwrap();
        let jsonl_path = dir.path().join("issues.jsonl");
        let db_path = dir.path().join("store.db");
        let store = SqliteStore::open_memory().unwrap();

        fs::write(&db_path, "db").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let bytes = canonical_store_bytes(&store).unwrap();
        fs::write(&jsonl_path, &bytes).unwrap();

        assert!(!is_jsonl_newer(&jsonl_path, &db_path, &store).unwrap());
    }
}
