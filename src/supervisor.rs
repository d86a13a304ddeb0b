//! Child process lifecycle: spawn, poll, terminate.
//!
//! Apps are started through the configured shell in their own session so the
//! whole process group can be signalled at once. Success here means "the
//! process spawned"; whether it stays up is decided later by the daemon's
//! settling window.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use crate::registry::AppEntry;

const MAX_TERMINATION_WAIT_ATTEMPTS: u32 = 50;
const TERMINATION_CHECK_INTERVAL_MS: u64 = 100;
const PORT_ALLOC_ATTEMPTS: u32 = 16;

/// How much of the log file is captured as `last_error` when an app dies.
const CRASH_TAIL_BYTES: u64 = 2048;

pub enum PollResult {
    Alive,
    Exited(Option<i32>),
}

#[derive(Default)]
pub struct Supervisor {
    handles: HashMap<String, Child>,
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor { handles: HashMap::new() }
    }

    /// Ask the OS for a free loopback port, rejecting ports already claimed
    /// by other apps. The listener is dropped before the child binds, which
    /// is a small race; the ephemeral range makes collisions unlikely.
    pub fn allocate_port(claimed: &[u16]) -> Result<u16, String> {
        for _ in 0..PORT_ALLOC_ATTEMPTS {
            let listener = TcpListener::bind(("127.0.0.1", 0))
                .map_err(|err| format!("failed to probe for a free port: {err}"))?;
            let port = listener
                .local_addr()
                .map_err(|err| format!("failed to read probed port: {err}"))?
                .port();

            if !claimed.contains(&port) {
                return Ok(port);
            }
        }

        Err(format!("no free port found after {PORT_ALLOC_ATTEMPTS} attempts"))
    }

    /// Spawn the entry's command with `PORT` injected and both output streams
    /// appended to its log file. Returns the child pid.
    pub fn spawn(
        &mut self,
        entry: &AppEntry,
        shell: &str,
        shell_args: &[String],
        port: u16,
    ) -> Result<u32, String> {
        if let Some(parent) = entry.log_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                format!("failed to create log directory '{}': {err}", parent.display())
            })?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&entry.log_path)
            .map_err(|err| {
                format!("failed to open log file '{}': {err}", entry.log_path.display())
            })?;

        let log_file_err = log_file
            .try_clone()
            .map_err(|err| format!("failed to clone log file handle: {err}"))?;

        let mut cmd = Command::new(shell);
        cmd.args(shell_args)
            .arg(&entry.command)
            .current_dir(&entry.path)
            .envs(&entry.env)
            .env("PORT", port.to_string())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err))
            .stdin(Stdio::null());

        // New session so the shell and everything it starts share a process
        // group we can signal as a unit
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                format!("shell '{shell}' not found, check runner.shell in config.toml")
            }
            std::io::ErrorKind::PermissionDenied => {
                format!("permission denied running '{}' in {}", entry.command, entry.path.display())
            }
            _ => format!("failed to spawn '{}': {err}", entry.command),
        })?;

        let pid = child.id();
        self.handles.insert(entry.name.clone(), child);
        Ok(pid)
    }

    /// Non-blocking liveness check, reaping the handle when the child exited.
    pub fn poll(&mut self, name: &str) -> PollResult {
        match self.handles.get_mut(name) {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    self.handles.remove(name);
                    PollResult::Exited(status.code())
                }
                Ok(None) => PollResult::Alive,
                Err(err) => {
                    log::warn!("try_wait failed for '{name}': {err}");
                    self.handles.remove(name);
                    PollResult::Exited(None)
                }
            },
            // No handle means the app was not spawned by this daemon instance
            None => PollResult::Exited(None),
        }
    }

    /// Detach the raw child handle so the caller can signal and reap it
    /// without holding any wider lock.
    pub fn take(&mut self, name: &str) -> Option<Child> {
        self.handles.remove(name)
    }

    /// SIGTERM the app's process group, wait for it to go away, escalate to
    /// SIGKILL if it does not. Safe to call for apps that are already gone.
    pub fn stop(&mut self, name: &str, pid: Option<u32>) {
        let handle = self.handles.remove(name);
        stop_process(name, pid, handle);
    }
}

/// The signal-and-wait half of stopping an app, detached from the supervisor
/// so it can run while daemon state stays unlocked. Idempotent for processes
/// that are already gone.
pub fn stop_process(name: &str, pid: Option<u32>, handle: Option<Child>) {
    if let Some(pid) = pid {
        if let Err(err) = terminate(pid as i64) {
            log::warn!("failed to stop '{name}': {err}");
        }

        if !wait_for_process_termination(pid as i64) {
            let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGKILL);
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
    }

    // Reap the child so it does not linger as a zombie
    if let Some(mut child) = handle {
        let _ = child.wait();
    }
}

/// SIGTERM a process and its group. A process that is already gone is fine.
fn terminate(pid: i64) -> Result<(), String> {
    // PID 0 would signal our own process group, negative PIDs other groups
    if pid <= 0 {
        return Ok(());
    }

    // The child is a session leader, so its pgid is its pid. Signal the
    // group first so grandchildren get the signal too.
    let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM);

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(format!("failed to signal process {pid}: {err:?}")),
    }
}

/// Poll for process exit, up to 50 x 100ms.
/// Returns true if the process terminated, false on timeout.
fn wait_for_process_termination(pid: i64) -> bool {
    if pid <= 0 {
        return true;
    }

    for _ in 0..MAX_TERMINATION_WAIT_ATTEMPTS {
        if !is_pid_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(TERMINATION_CHECK_INTERVAL_MS));
    }
    false
}

pub fn is_pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }

    let result = unsafe { libc::kill(pid as i32, 0) };

    if result != 0 {
        let err = std::io::Error::last_os_error();
        // EPERM means the process exists but is not ours to signal
        return err.raw_os_error() == Some(libc::EPERM);
    }

    true
}

/// Last couple of kilobytes of an app's log file, captured into `last_error`
/// when the app crashes.
pub fn read_log_tail(path: &Path) -> String {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return String::new(),
    };

    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(CRASH_TAIL_BYTES);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }

    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }

    String::from_utf8_lossy(&buf).into_owned()
}
