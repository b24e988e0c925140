//! A distributed, git-backed sync core for a SQLite + JSONL issue tracker.
//!
//! An issue tracker's canonical state lives in a local SQLite database; a
//! sorted, newline-delimited JSON export of that database is what actually
//! gets committed to git and shared across clones. This crate is the engine
//! that keeps the two in sync: a pull-first orchestrator (`sync`) that pulls
//! the remote JSONL, three-way merges it against the local database and the
//! last-synced base (`merge`), writes the reconciled result back to both
//! sides, and pushes. Supporting pieces: the JSONL codec (`jsonl`), a
//! staleness oracle for deciding when a sync is even necessary (the
//! `sync::staleness` module), an advisory cross-process lock
//! (`sync::lock`), a filesystem watcher for auto-flush/auto-import
//! (`watch`), and an optional local daemon that keeps one store handle warm
//! across short-lived CLI invocations (`daemon`).

pub mod config;
pub mod daemon;
pub mod error;
pub mod jsonl;
pub mod merge;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;
pub mod validation;
pub mod watch;

pub use error::{BeadsError, Result};
pub use model::{Comment, Dependency, DependencyType, Issue, IssueType, Priority, Status};
pub use storage::{IssuePatch, SearchFilter, SqliteStore, Store};
pub use sync::{SyncContext, SyncReport, SyncStatus};
