//! Daemon/RPC shim (C11, §4.11).
//!
//! An optional local service holding one store open and serving it over a
//! Unix-domain socket, so many short-lived CLI invocations against the same
//! workspace don't each pay SQLite's open/close cost. A client discovers the
//! socket at a conventional path, checks protocol-version compatibility, and
//! falls back to opening the store directly whenever the socket is absent,
//! stale, or speaks a different version. Sync operations always force direct
//! mode (§4.9 step 1): a daemon holding a handle to a store file that sync
//! just replaced would otherwise serve stale data forever.

use crate::error::{BeadsError, Result};
use crate::model::Issue;
use crate::storage::{SearchFilter, Store};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bump whenever the wire protocol changes in a way old clients can't speak.
pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub client_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub daemon_version: String,
    pub compatible: bool,
}

/// Conventional socket path for a workspace: `<workspace>/.beads/daemon.sock`.
#[must_use]
pub fn socket_path(beads_dir: &Path) -> PathBuf {
    beads_dir.join("daemon.sock")
}

/// Connect to the daemon at `path`, performing the version handshake.
///
/// Returns `Ok(None)` (not an error) when the socket is absent or nothing is
/// listening — that's the expected steady state for most workspaces, and the
/// caller should silently fall back to opening the store directly.
///
/// # Errors
///
/// Returns `DaemonVersionMismatch` if the daemon is reachable but speaks an
/// incompatible protocol version.
pub fn connect(path: &Path) -> Result<Option<UnixStream>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut stream = match UnixStream::connect(path) {
        Ok(s) => s,
        Err(_) => {
            warn!(path = %path.display(), "daemon socket present but not accepting connections, treating as stale");
            return Ok(None);
        }
    };

    let request = HandshakeRequest {
        client_version: PROTOCOL_VERSION.to_string(),
    };
    let mut line = serde_json::to_string(&request).map_err(BeadsError::Json)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).map_err(BeadsError::Io)?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(BeadsError::Io)?;

    if response_line.is_empty() {
        return Err(BeadsError::StaleDaemonSocket {
            path: path.to_path_buf(),
        });
    }

    let response: HandshakeResponse =
        serde_json::from_str(response_line.trim()).map_err(BeadsError::Json)?;

    if !response.compatible || !versions_compatible(&response.daemon_version, PROTOCOL_VERSION) {
        return Err(BeadsError::DaemonVersionMismatch {
            client: PROTOCOL_VERSION.to_string(),
            daemon: response.daemon_version,
        });
    }

    Ok(Some(stream))
}

fn versions_compatible(daemon: &str, client: &str) -> bool {
    match (semver::Version::parse(daemon), semver::Version::parse(client)) {
        (Ok(d), Ok(c)) => d.major == c.major,
        _ => daemon == client,
    }
}

/// Bind a Unix socket at `path`, removing any stale socket file left over
/// from a daemon that didn't shut down cleanly.
///
/// # Errors
///
/// Returns an I/O error if the socket cannot be bound.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    UnixListener::bind(path).map_err(BeadsError::Io)
}

/// One request in the daemon's store RPC (§4.11: "offering the store
/// interface over a Unix-domain socket"), scoped to the read-only subset a
/// sync-focused CLI needs from a long-lived daemon: looking up an issue,
/// listing the current set, and checking the count without paying SQLite's
/// open/close cost per invocation. Mutating operations always go through
/// direct mode (§4.9 step 1 forces this for sync; there is no CLI surface
/// for issue mutation in this crate to route through the daemon at all).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRequest {
    Get { id: String },
    Search { include_tombstones: bool },
    Count,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StoreResponse {
    Issue { issue: Option<Issue> },
    Issues { issues: Vec<Issue> },
    Count { count: usize },
    Error { message: String },
}

fn dispatch_store_request(line: &str, store: &dyn Store) -> StoreResponse {
    let request: StoreRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(e) => {
            return StoreResponse::Error {
                message: format!("malformed request: {e}"),
            };
        }
    };

    let result = match request {
        StoreRequest::Get { id } => store.get(&id).map(|issue| StoreResponse::Issue { issue }),
        StoreRequest::Search { include_tombstones } => store
            .search(SearchFilter { include_tombstones })
            .map(|issues| StoreResponse::Issues { issues }),
        StoreRequest::Count => store.count().map(|count| StoreResponse::Count { count }),
    };

    result.unwrap_or_else(|e| StoreResponse::Error {
        message: e.to_string(),
    })
}

/// Serve store RPC requests on `stream` until the client disconnects,
/// dispatching each line-delimited `StoreRequest` against `store` and
/// writing back a line-delimited `StoreResponse`. Call after
/// `serve_handshake` succeeds on the same connection.
///
/// # Errors
///
/// Returns an I/O error if reading or writing a request/response fails.
pub fn serve_connection(stream: &mut UnixStream, store: &dyn Store) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone().map_err(BeadsError::Io)?);
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).map_err(BeadsError::Io)?;
        if read == 0 {
            return Ok(());
        }

        let response = dispatch_store_request(&line, store);
        let mut out = serde_json::to_string(&response).map_err(BeadsError::Json)?;
        out.push('\n');
        stream.write_all(out.as_bytes()).map_err(BeadsError::Io)?;
    }
}

/// Serve one client connection's handshake, then hand the stream back to the
/// caller for the actual store RPC loop (`serve_connection`).
///
/// # Errors
///
/// Returns an I/O error if reading or writing the handshake fails.
pub fn serve_handshake(stream: &mut UnixStream) -> Result<()> {
    let mut reader = BufReader::new(&*stream);
    let mut line = String::new();
    reader.read_line(&mut line).map_err(BeadsError::Io)?;

    let request: HandshakeRequest = serde_json::from_str(line.trim()).map_err(BeadsError::Json)?;
    let compatible = versions_compatible(&request.client_version, PROTOCOL_VERSION);
    debug!(client_version = %request.client_version, compatible, "daemon handshake");

    let response = HandshakeResponse {
        daemon_version: PROTOCOL_VERSION.to_string(),
        compatible,
    };
    let mut out = serde_json::to_string(&response).map_err(BeadsError::Json)?;
    out.push('\n');
    stream.write_all(out.as_bytes()).map_err(BeadsError::Io)?;
    Ok(())
}

/// Run the daemon's accept loop on `listener`, calling `on_connection` per
/// client. Blocks forever; intended to run on a dedicated thread/process.
pub fn run(listener: &UnixListener, mut on_connection: impl FnMut(UnixStream)) {
    info!("daemon accepting connections");
    for incoming in listener.incoming() {
        match incoming {
            Ok(mut stream) => {
                if let Err(e) = serve_handshake(&mut stream) {
                    warn!(error = %e, "daemon handshake failed");
                    continue;
                }
                on_connection(stream);
            }
            Err(e) => warn!(error = %e, "daemon accept failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn connect_to_missing_socket_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        assert!(connect(&path).unwrap().is_none());
    }

    #[test]
    fn handshake_roundtrip_reports_compatible() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            serve_handshake(&mut stream).unwrap();
        });

        let stream = connect(&path).unwrap();
        assert!(stream.is_some());
        server.join().unwrap();
    }

    #[test]
    fn versions_compatible_checks_major_only() {
        assert!(versions_compatible("1.2.3", "1.0.0"));
        assert!(!versions_compatible("2.0.0", "1.0.0"));
    }

    fn sample(id: &str) -> Issue {
        Issue {
            id: id.to_string(),
            content_hash: None,
            title: "T".to_string(),
            description: None,
            design: None,
            acceptance_criteria: None,
            notes: None,
            status: crate::model::Status::Open,
            priority: crate::model::Priority::MEDIUM,
            issue_type: crate::model::IssueType::Task,
            assignee: None,
            estimated_minutes: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
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
    fn dispatch_get_returns_issue() {
        let mut store = crate::storage::SqliteStore::open_memory().unwrap();
        store.create(&sample("bd-1"), "tester").unwrap();

        let response = dispatch_store_request(r#"{"op":"get","id":"bd-1"}"#, &store);
        match response {
            StoreResponse::Issue { issue } => assert_eq!(issue.unwrap().id, "bd-1"),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn dispatch_get_missing_issue_returns_none_not_error() {
        let store = crate::storage::SqliteStore::open_memory().unwrap();
        let response = dispatch_store_request(r#"{"op":"get","id":"bd-404"}"#, &store);
        assert!(matches!(response, StoreResponse::Issue { issue: None }));
    }

    #[test]
    fn dispatch_count_reflects_store_size() {
        let mut store = crate::storage::SqliteStore::open_memory().unwrap();
        store.create(&sample("bd-1"), "tester").unwrap();
        store.create(&sample("bd-2"), "tester").unwrap();

        let response = dispatch_store_request(r#"{"op":"count"}"#, &store);
        assert!(matches!(response, StoreResponse::Count { count: 2 }));
    }

    #[test]
    fn dispatch_malformed_request_returns_error_response() {
        let store = crate::storage::SqliteStore::open_memory().unwrap();
        let response = dispatch_store_request("not json", &store);
        assert!(matches!(response, StoreResponse::Error { .. }));
    }

    #[test]
    fn serve_connection_handles_multiple_requests_over_one_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = bind(&path).unwrap();

        let mut store = crate::storage::SqliteStore::open_memory().unwrap();
        store.create(&sample("bd-1"), "tester").unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            serve_handshake(&mut stream).unwrap();
            serve_connection(&mut stream, &store).unwrap();
        });

        let mut stream = connect(&path).unwrap().unwrap();
        stream
            .write_all(b"{\"op\":\"count\"}\n")
            .unwrap();
        let mut reader = BufReader::new(&stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("\"count\":1"));

        stream
            .write_all(b"{\"op\":\"get\",\"id\":\"bd-1\"}\n")
            .unwrap();
        let mut line2 = String::new();
        reader.read_line(&mut line2).unwrap();
        assert!(line2.contains("\"id\":\"bd-1\""));

        drop(stream);
        server.join().unwrap();
    }
}
