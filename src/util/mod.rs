//! Shared utilities for the sync engine.
//!
//! - Content hashing (SHA256) for per-issue dedup and whole-file staleness
//! - ID parsing and prefix validation

pub mod hash;
pub mod id;

pub use hash::{ContentHashable, content_hash, content_hash_from_parts};
pub use id::{ParsedId, is_valid_id_format, normalize_id, parse_id, prefix_of, validate_prefix};
