//! Unix socket control channel between the CLI and the daemon.
//!
//! The protocol is newline-delimited JSON: one `ControlRequest` in, one
//! `ControlResponse` out. The socket lives at `~/.portman/portman.sock` and
//! is owner-only. Every mutating request is applied under the daemon's state
//! mutex, so clients always observe whole mutations.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::daemon::SharedState;
use crate::registry::{AppEntry, AppStatus};

const IO_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Register an app and start it immediately
    Add {
        name: String,
        command: String,
        path: PathBuf,
        #[serde(default)]
        env: BTreeMap<String, String>,
        log_path: Option<PathBuf>,
    },
    /// Stop an app and remove it from the registry
    Remove(String),
    /// Snapshot of every registered app
    List,
    /// Stop all apps, persist, and exit the daemon
    Shutdown,
    /// Liveness probe
    Ping,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Entry(EntrySnapshot),
    Entries(Vec<EntrySnapshot>),
    Removed(String),
    ShuttingDown,
    Error { kind: String, message: String },
    Pong,
}

/// Read-only view of an `AppEntry` as sent over the socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub name: String,
    pub command: String,
    pub path: PathBuf,
    pub port: Option<u16>,
    pub status: AppStatus,
    pub pid: Option<u32>,
    pub log_path: PathBuf,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&AppEntry> for EntrySnapshot {
    fn from(entry: &AppEntry) -> Self {
        EntrySnapshot {
            name: entry.name.clone(),
            command: entry.command.clone(),
            path: entry.path.clone(),
            port: entry.port,
            status: entry.status,
            pid: entry.pid,
            log_path: entry.log_path.clone(),
            last_error: entry.last_error.clone(),
            created_at: entry.created_at,
        }
    }
}

/// Start the control server. Blocks on the accept loop; `ready` fires once
/// the socket is bound and listening.
pub fn start_control_server(
    socket_path: &str,
    state: SharedState,
    ready: impl FnOnce(),
) -> Result<()> {
    if Path::new(socket_path).exists() {
        fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    // Owner read/write only, the socket mutates daemon state
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
    }

    log::info!("control socket listening at {socket_path}");
    ready();

    const MAX_PENDING_CONNECTIONS: usize = 64;
    const WORKER_THREADS: usize = 4;

    let (tx, rx) = mpsc::sync_channel::<UnixStream>(MAX_PENDING_CONNECTIONS);
    let rx = Arc::new(Mutex::new(rx));

    for i in 0..WORKER_THREADS {
        let rx = Arc::clone(&rx);
        let state = Arc::clone(&state);
        thread::spawn(move || loop {
            let stream = {
                let rx = rx.lock().unwrap();
                match rx.recv() {
                    Ok(stream) => stream,
                    Err(_) => break,
                }
            };
            if let Err(err) = handle_client(stream, &state) {
                log::error!("control worker {i}: {err}");
            }
        });
    }

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                // Never block the accept loop; an overflowing queue drops the
                // connection and the client's retry picks it back up
                if let Err(err) = tx.try_send(stream) {
                    log::warn!("control connection dropped: {err}");
                }
            }
            Err(err) => log::error!("error accepting control connection: {err}"),
        }
    }

    Ok(())
}

fn handle_client(mut stream: UnixStream, state: &SharedState) -> Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(IO_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(IO_TIMEOUT_SECS)))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let request: ControlRequest = serde_json::from_str(&line)?;
    let shutdown = matches!(request, ControlRequest::Shutdown);
    let response = dispatch(state, request);

    let response_json = serde_json::to_string(&response)?;
    stream.write_all(response_json.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    if shutdown {
        // Reply has been flushed, now tear the daemon down. Does not return.
        crate::daemon::shutdown(state);
    }

    Ok(())
}

fn dispatch(state: &SharedState, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::Add { name, command, path, env, log_path } => {
            let mut state = state.lock().unwrap();
            match state.add(name, command, path, env, log_path) {
                Ok(snapshot) => ControlResponse::Entry(snapshot),
                Err(err) => ControlResponse::Error {
                    kind: err.kind().to_string(),
                    message: err.to_string(),
                },
            }
        }
        // Takes the lock internally and releases it around the stop wait
        ControlRequest::Remove(name) => match crate::daemon::remove(state, &name) {
            Ok(()) => ControlResponse::Removed(name),
            Err(err) => ControlResponse::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        },
        ControlRequest::List => {
            let state = state.lock().unwrap();
            ControlResponse::Entries(state.list())
        }
        ControlRequest::Shutdown => ControlResponse::ShuttingDown,
        ControlRequest::Ping => ControlResponse::Pong,
    }
}

/// Send one request to the daemon, retrying transient connection failures
/// with doubling backoff.
pub fn send_request(socket_path: &str, request: ControlRequest) -> Result<ControlResponse> {
    const MAX_RETRIES: u32 = 3;
    const INITIAL_BACKOFF_MS: u64 = 50;

    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        match send_request_once(socket_path, &request) {
            Ok(response) => return Ok(response),
            Err(err) => {
                last_error = Some(err);
                if attempt < MAX_RETRIES - 1 {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2u64.pow(attempt);
                    thread::sleep(Duration::from_millis(backoff_ms));
                    log::debug!(
                        "control request failed (attempt {}/{MAX_RETRIES}), retrying after {backoff_ms}ms",
                        attempt + 1
                    );
                }
            }
        }
    }

    Err(last_error.unwrap())
}

fn send_request_once(socket_path: &str, request: &ControlRequest) -> Result<ControlResponse> {
    let mut stream = UnixStream::connect(socket_path)
        .map_err(|err| anyhow!("failed to connect to daemon socket: {err}. Is the daemon running?"))?;

    stream.set_read_timeout(Some(Duration::from_secs(IO_TIMEOUT_SECS)))?;
    stream.set_write_timeout(Some(Duration::from_secs(IO_TIMEOUT_SECS)))?;

    let request_json = serde_json::to_string(request)?;
    stream.write_all(request_json.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let response: ControlResponse = serde_json::from_str(&line)?;
    Ok(response)
}

/// Check whether a daemon answers on the socket.
pub fn is_daemon_running(socket_path: &str) -> bool {
    matches!(
        send_request_once(socket_path, &ControlRequest::Ping),
        Ok(ControlResponse::Pong)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonState;

    #[test]
    fn test_request_round_trip() {
        let request = ControlRequest::Add {
            name: "app".to_string(),
            command: "node index.js".to_string(),
            path: PathBuf::from("/projects/app"),
            env: BTreeMap::from([("FOO".to_string(), "bar".to_string())]),
            log_path: None,
        };

        let json = serde_json::to_string(&request).unwrap();
        match serde_json::from_str::<ControlRequest>(&json).unwrap() {
            ControlRequest::Add { name, command, env, log_path, .. } => {
                assert_eq!(name, "app");
                assert_eq!(command, "node index.js");
                assert_eq!(env.get("FOO").unwrap(), "bar");
                assert!(log_path.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_error_response_round_trip() {
        let response = ControlResponse::Error {
            kind: "not-found".to_string(),
            message: "app 'x' does not exist".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        match serde_json::from_str::<ControlResponse>(&json).unwrap() {
            ControlResponse::Error { kind, message } => {
                assert_eq!(kind, "not-found");
                assert!(message.contains("'x'"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_snapshot_carries_runtime_fields() {
        use crate::registry::AppEntry;

        let entry = AppEntry {
            name: "app".to_string(),
            command: "node index.js".to_string(),
            path: PathBuf::from("/projects/app"),
            env: BTreeMap::new(),
            port: Some(40123),
            log_path: PathBuf::from("/tmp/app.log"),
            status: AppStatus::Running,
            last_error: None,
            created_at: Utc::now(),
            pid: Some(999),
            started_at: Some(Utc::now()),
        };

        let snapshot = EntrySnapshot::from(&entry);
        assert_eq!(snapshot.pid, Some(999));
        assert_eq!(snapshot.port, Some(40123));
        assert_eq!(snapshot.status, AppStatus::Running);
    }

    #[test]
    fn test_ping_against_missing_socket_is_false() {
        assert!(!is_daemon_running("/nonexistent/portman-test.sock"));
    }

    #[test]
    fn test_ping_pong_over_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ctl.sock").to_str().unwrap().to_string();
        let registry = crate::registry::Registry::load(dir.path().join("registry.ron")).unwrap();
        let state = DaemonState::shared(registry, crate::config::Config::default());

        let server_path = socket_path.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = start_control_server(&server_path, state, move || {
                let _ = tx.send(());
            });
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(is_daemon_running(&socket_path));

        match send_request(&socket_path, ControlRequest::List).unwrap() {
            ControlResponse::Entries(entries) => assert!(entries.is_empty()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_requests_are_all_served() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ctl.sock").to_str().unwrap().to_string();
        let registry = crate::registry::Registry::load(dir.path().join("registry.ron")).unwrap();
        let state = DaemonState::shared(registry, crate::config::Config::default());

        let server_path = socket_path.clone();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = start_control_server(&server_path, state, move || {
                let _ = tx.send(());
            });
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let clients: Vec<_> = (0..20)
            .map(|_| {
                let path = socket_path.clone();
                thread::spawn(move || send_request(&path, ControlRequest::Ping))
            })
            .collect();

        for client in clients {
            match client.join().unwrap() {
                Ok(ControlResponse::Pong) => {}
                other => panic!("wrong response: {other:?}"),
            }
        }
    }
}
