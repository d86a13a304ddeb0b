//! Daemon lifecycle and the state object every mutation runs through.
//!
//! The daemon owns the registry and the supervisor behind one mutex. Control
//! requests, the monitor loop, and router lookups all go through that lock,
//! so an `add` is either fully visible (spawned and persisted) or not at all.

#[macro_use]
pub mod log;
mod fork;
pub mod pid;

use chrono::Utc;
use fork::{daemon, Fork};
use global_placeholders::global;
use macros_rs::crashln;
use std::collections::BTreeMap;
use std::panic;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::{process, thread, thread::sleep, time::Duration};

use crate::{
    config::{self, Config},
    control::{self, ControlRequest, EntrySnapshot},
    errors::{Error, Result},
    helpers,
    registry::{AppEntry, AppStatus, Registry},
    supervisor::{self, PollResult, Supervisor},
};

pub struct DaemonState {
    pub registry: Registry,
    pub supervisor: Supervisor,
    pub config: Config,
}

pub type SharedState = Arc<Mutex<DaemonState>>;

impl DaemonState {
    pub fn new(registry: Registry, config: Config) -> Self {
        DaemonState { registry, supervisor: Supervisor::new(), config }
    }

    pub fn shared(registry: Registry, config: Config) -> SharedState {
        Arc::new(Mutex::new(DaemonState::new(registry, config)))
    }

    /// Register an app and start it. A command that fails to spawn is still
    /// registered, as crashed with the reason captured; only a name collision
    /// or a persist failure is an error.
    pub fn add(
        &mut self,
        name: String,
        command: String,
        path: PathBuf,
        env: BTreeMap<String, String>,
        log_path: Option<PathBuf>,
    ) -> Result<EntrySnapshot> {
        if self.registry.contains(&name) {
            return Err(Error::AlreadyExists(name));
        }

        let log_path =
            log_path.unwrap_or_else(|| PathBuf::from(global!("portman.logs.entry", name.as_str())));

        let mut entry = AppEntry {
            name: name.clone(),
            command,
            path,
            env,
            port: None,
            log_path,
            status: AppStatus::Starting,
            last_error: None,
            created_at: Utc::now(),
            pid: None,
            started_at: None,
        };

        self.launch(&mut entry);

        let snapshot = EntrySnapshot::from(&entry);
        let pid = entry.pid;

        if let Err(err) = self.registry.upsert(entry) {
            // Do not leave an orphan running when the registry write failed
            self.supervisor.stop(&name, pid);
            return Err(err);
        }

        Ok(snapshot)
    }

    pub fn list(&self) -> Vec<EntrySnapshot> {
        self.registry.list().iter().map(EntrySnapshot::from).collect()
    }

    /// Respawn everything that was up when the previous daemon went away.
    /// A failed respawn marks the entry crashed instead of aborting startup.
    pub fn resume(&mut self) {
        let names: Vec<String> = self
            .registry
            .list()
            .iter()
            .filter(|entry| matches!(entry.status, AppStatus::Starting | AppStatus::Running))
            .map(|entry| entry.name.clone())
            .collect();

        for name in names {
            let mut entry = match self.registry.find(&name) {
                Some(entry) => entry.clone(),
                None => continue,
            };

            self.launch(&mut entry);

            if let Err(err) = self.registry.upsert(entry) {
                log!("[daemon] failed to persist resumed app", "name" => name, "error" => err);
            }
        }
    }

    /// Assign a fresh port and spawn the entry's command, updating it in
    /// place. Spawn failure is captured on the entry, never returned.
    fn launch(&mut self, entry: &mut AppEntry) {
        let claimed = self.registry.claimed_ports();
        let shell = self.config.runner.shell.clone();
        let args = self.config.runner.args.clone();

        let spawned = Supervisor::allocate_port(&claimed).and_then(|port| {
            self.supervisor.spawn(entry, &shell, &args, port).map(|pid| (port, pid))
        });

        match spawned {
            Ok((port, pid)) => {
                entry.port = Some(port);
                entry.pid = Some(pid);
                entry.status = AppStatus::Starting;
                entry.started_at = Some(Utc::now());
                entry.last_error = None;
                log!("[daemon] spawned app", "name" => &entry.name, "pid" => pid, "port" => port);
            }
            Err(err) => {
                entry.pid = None;
                entry.started_at = None;
                entry.status = AppStatus::Crashed;
                entry.last_error = Some(err.clone());
                log!("[daemon] spawn failed", "name" => &entry.name, "error" => err);
            }
        }
    }

    /// One monitoring pass: demote exited apps to crashed with their output
    /// captured, promote apps that outlived the settling window to running.
    pub fn monitor_pass(&mut self) {
        let settle = self.config.daemon.settle_secs as i64;
        let names: Vec<String> = self
            .registry
            .list()
            .iter()
            .filter(|entry| matches!(entry.status, AppStatus::Starting | AppStatus::Running))
            .map(|entry| entry.name.clone())
            .collect();

        let mut dirty = false;

        for name in names {
            let poll = self.supervisor.poll(&name);
            let Some(entry) = self.registry.find_mut(&name) else { continue };

            match poll {
                PollResult::Exited(code) => {
                    let reason = match code {
                        Some(code) => format!("exited with code {code}"),
                        None => "exited".to_string(),
                    };
                    let tail = supervisor::read_log_tail(&entry.log_path);

                    entry.status = AppStatus::Crashed;
                    entry.pid = None;
                    entry.started_at = None;
                    entry.last_error = Some(if tail.is_empty() {
                        reason.clone()
                    } else {
                        format!("{reason}\n\n{tail}")
                    });
                    dirty = true;
                    log!("[daemon] app crashed", "name" => name, "reason" => reason);
                }
                PollResult::Alive => {
                    if entry.status == AppStatus::Starting {
                        let settled = entry
                            .started_at
                            .map(|started| (Utc::now() - started).num_seconds() >= settle)
                            .unwrap_or(false);
                        if settled {
                            entry.status = AppStatus::Running;
                            dirty = true;
                            log!("[daemon] app settled", "name" => name);
                        }
                    }
                }
            }
        }

        if dirty {
            if let Err(err) = self.registry.save() {
                log!("[daemon] failed to persist monitor update", "error" => err);
            }
        }
    }
}

/// Stop an app and drop it from the registry. The pid and child handle are
/// snapshotted under the lock, but the signal-and-wait runs with the state
/// unlocked so router lookups never queue behind a stubborn process.
pub fn remove(state: &SharedState, name: &str) -> Result<()> {
    let (pid, handle) = {
        let mut state = state.lock().unwrap();
        if !state.registry.contains(name) {
            return Err(Error::NotFound(name.to_string()));
        }
        let pid = state.registry.find(name).and_then(|entry| entry.pid);
        let handle = state.supervisor.take(name);
        (pid, handle)
    };

    supervisor::stop_process(name, pid, handle);

    let mut state = state.lock().unwrap();
    // A concurrent remove may have won the race while the lock was released
    if state.registry.contains(name) {
        state.registry.remove(name)?;
    }
    log!("[daemon] removed app", "name" => name);
    Ok(())
}

extern "C" fn handle_termination_signal(_: libc::c_int) {
    pid::remove();
    log!("[daemon] killed", "pid" => process::id());
    unsafe { libc::_exit(0) }
}

extern "C" fn handle_sigpipe(_: libc::c_int) {
    // Writing to a closed stdout after daemonization must not kill the daemon
}

/// Stop every app, persist, clean up socket and pid files, exit.
/// Entries keep their persisted status so the next start can resume them.
pub fn shutdown(state: &SharedState) -> ! {
    // Collect pids and handles under the lock, then signal without it so the
    // router stays serviceable while children wind down
    let targets: Vec<(String, Option<u32>, Option<std::process::Child>)> = {
        let mut state = state.lock().unwrap();
        let apps: Vec<(String, Option<u32>)> = state
            .registry
            .list()
            .iter()
            .map(|entry| (entry.name.clone(), entry.pid))
            .collect();

        apps.into_iter()
            .map(|(name, app_pid)| {
                let handle = state.supervisor.take(&name);
                (name, app_pid, handle)
            })
            .collect()
    };

    for (name, app_pid, handle) in targets {
        supervisor::stop_process(&name, app_pid, handle);
    }

    if let Err(err) = state.lock().unwrap().registry.save() {
        log!("[daemon] failed to persist on shutdown", "error" => err);
    }

    let _ = std::fs::remove_file(global!("portman.sock"));
    pid::remove();
    log!("[daemon] stopped", "pid" => process::id());
    process::exit(0);
}

/// Start the daemon. A no-op when one already answers on the control socket.
pub fn start(verbose: bool) {
    if control::is_daemon_running(&global!("portman.sock")) {
        if verbose {
            println!("{} Daemon is already running", *helpers::SUCCESS);
        }
        return;
    }

    if pid::exists() {
        match pid::read() {
            Ok(pid) if pid::running(pid) => {
                // Process is up but the socket is not answering yet, likely a
                // concurrent start still initializing
                if verbose {
                    println!("{} Daemon process {pid} is starting up", *helpers::WARN);
                }
                return;
            }
            _ => {
                log!("[daemon] removing stale pid file");
                pid::remove();
            }
        }
    }

    if verbose {
        println!("{} Spawning daemon (base={})", *helpers::SUCCESS, global!("portman.base"));
    }

    // Keep stderr open so startup errors stay visible
    match daemon(false, true) {
        Ok(Fork::Parent(_)) => {
            // Wait until the child answers on the control socket, so callers
            // can talk to it immediately after start returns
            let max_wait_ms = 5000;
            let poll_interval_ms = 50;
            let mut elapsed_ms = 0;

            while elapsed_ms < max_wait_ms {
                if control::is_daemon_running(&global!("portman.sock")) {
                    if verbose {
                        println!("{} Daemon started", *helpers::SUCCESS);
                    }
                    return;
                }
                sleep(Duration::from_millis(poll_interval_ms));
                elapsed_ms += poll_interval_ms;
            }

            eprintln!("{} Daemon did not answer within {max_wait_ms}ms", *helpers::WARN);
        }
        Ok(Fork::Child) => init(),
        Err(code) => crashln!("{} Daemon fork failed with code {code}", *helpers::FAIL),
    }
}

/// Stop the daemon. Idempotent: a daemon that is already gone is success.
pub fn stop(verbose: bool) {
    let socket_path = global!("portman.sock");

    if control::is_daemon_running(&socket_path) {
        // The daemon replies first and then exits, so any outcome here means
        // the shutdown is underway
        let _ = control::send_request(&socket_path, ControlRequest::Shutdown);
        if verbose {
            println!("{} Daemon stopped", *helpers::SUCCESS);
        }
        return;
    }

    if pid::exists() {
        match pid::read() {
            Ok(pid) if pid::running(pid) => {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGTERM,
                );
                pid::remove();
                if verbose {
                    println!("{} Daemon stopped", *helpers::SUCCESS);
                }
            }
            _ => {
                pid::remove();
                if verbose {
                    println!("{} Daemon was not running, removed stale pid file", *helpers::SUCCESS);
                }
            }
        }
        return;
    }

    if verbose {
        println!("{} The daemon is not running", *helpers::SUCCESS);
    }
}

fn init() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_termination_signal as *const () as usize);
        libc::signal(libc::SIGPIPE, handle_sigpipe as *const () as usize);
    }

    pid::write(process::id());
    log!("[daemon] new fork", "pid" => process::id());

    let config = config::read();

    // A registry that cannot be trusted refuses the whole daemon, the file
    // is left in place for inspection
    let registry = match Registry::load(global!("portman.registry")) {
        Ok(registry) => registry,
        Err(err) => {
            log!("[daemon] refusing to start", "error" => err);
            eprintln!("{} {err}", *helpers::FAIL);
            eprintln!("{} Inspect or delete {} and start again", *helpers::FAIL, global!("portman.registry"));
            pid::remove();
            process::exit(1);
        }
    };

    let state = DaemonState::shared(registry, config.clone());
    state.lock().unwrap().resume();

    // Control socket on its own thread, with a readiness handshake so the
    // parent's wait loop cannot race the bind
    let socket_path = global!("portman.sock");
    let control_state = Arc::clone(&state);
    let (ready_tx, ready_rx) = mpsc::channel::<()>();

    let spawned = thread::Builder::new().name("control-socket".to_string()).spawn(move || {
        let result = control::start_control_server(&socket_path, control_state, move || {
            let _ = ready_tx.send(());
        });
        if let Err(err) = result {
            log!("[daemon] control socket error", "error" => err);
            eprintln!("[daemon] control socket failed: {err}");
        }
    });

    match spawned {
        Ok(_) => {
            if ready_rx.recv_timeout(Duration::from_secs(5)).is_err() {
                log!("[daemon] control socket init timeout");
                eprintln!("[daemon] Warning: control socket not ready within 5 seconds");
            }
        }
        Err(err) => {
            log!("[daemon] failed to spawn control socket thread", "error" => err);
            eprintln!("[daemon] Warning: control socket could not be started: {err}");
        }
    }

    // Monitor loop; a panic in one pass never takes the daemon down
    let monitor_state = Arc::clone(&state);
    let interval = config.daemon.interval;
    let _ = thread::Builder::new().name("monitor".to_string()).spawn(move || loop {
        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            monitor_state.lock().unwrap().monitor_pass();
        }));
        if result.is_err() {
            log!("[daemon] panic in monitor pass");
        }
        sleep(Duration::from_millis(interval));
    });

    // Public router runs on the main thread
    let rt = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            log!("[daemon] failed to create tokio runtime", "error" => err);
            pid::remove();
            process::exit(1);
        }
    };

    log!("[daemon] router listening", "address" => config.fmt_address());
    let outcome = rt.block_on(async { crate::router::build(state, &config).launch().await });

    if let Err(err) = outcome {
        log!("[daemon] router failed", "error" => err);
        eprintln!("[daemon] router failed: {err}");
    }

    pid::remove();
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::tempdir;

    fn test_config(settle_secs: u64) -> Config {
        let mut config = Config::default();
        config.daemon.settle_secs = settle_secs;
        config
    }

    fn state_in(dir: &Path, settle_secs: u64) -> SharedState {
        let registry = Registry::load(dir.join("registry.ron")).unwrap();
        DaemonState::shared(registry, test_config(settle_secs))
    }

    fn add_app(state: &SharedState, dir: &Path, name: &str, command: &str) -> EntrySnapshot {
        state
            .lock()
            .unwrap()
            .add(
                name.to_string(),
                command.to_string(),
                dir.to_path_buf(),
                BTreeMap::new(),
                Some(dir.join(format!("{name}.log"))),
            )
            .unwrap()
    }

    fn wait_for<F: Fn(&DaemonState) -> bool>(state: &SharedState, pred: F) {
        for _ in 0..50 {
            let mut state = state.lock().unwrap();
            state.monitor_pass();
            if pred(&state) {
                return;
            }
            drop(state);
            sleep(Duration::from_millis(100));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_add_spawns_and_persists() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);

        let snapshot = add_app(&state, dir.path(), "web", "sleep 5");
        assert_eq!(snapshot.status, AppStatus::Starting);
        assert!(snapshot.port.is_some());
        assert!(snapshot.pid.is_some());

        let reloaded = Registry::load(dir.path().join("registry.ron")).unwrap();
        assert!(reloaded.contains("web"));

        remove(&state, "web").unwrap();
    }

    #[test]
    fn test_add_duplicate_name_is_rejected() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);

        add_app(&state, dir.path(), "web", "sleep 5");
        let result = state.lock().unwrap().add(
            "web".to_string(),
            "sleep 1".to_string(),
            dir.path().to_path_buf(),
            BTreeMap::new(),
            Some(dir.path().join("dup.log")),
        );
        assert!(matches!(result, Err(Error::AlreadyExists(_))));

        remove(&state, "web").unwrap();
    }

    #[test]
    fn test_distinct_apps_get_distinct_ports() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);

        let first = add_app(&state, dir.path(), "one", "sleep 5");
        let second = add_app(&state, dir.path(), "two", "sleep 5");
        assert_ne!(first.port, second.port);

        remove(&state, "one").unwrap();
        remove(&state, "two").unwrap();
    }

    #[test]
    fn test_unspawnable_shell_registers_crashed_entry() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.ron")).unwrap();
        let mut config = test_config(3);
        config.runner.shell = "/nonexistent/shell".to_string();
        let state = DaemonState::shared(registry, config);

        let snapshot = add_app(&state, dir.path(), "bad", "sleep 5");
        assert_eq!(snapshot.status, AppStatus::Crashed);
        assert!(snapshot.last_error.unwrap().contains("not found"));

        // The crashed entry is persisted, not dropped
        let reloaded = Registry::load(dir.path().join("registry.ron")).unwrap();
        assert_eq!(reloaded.find("bad").unwrap().status, AppStatus::Crashed);
    }

    #[test]
    fn test_failing_command_becomes_crashed_with_output() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);

        add_app(&state, dir.path(), "broken", "definitely-not-a-real-command-xyz");
        wait_for(&state, |state| {
            state.registry.find("broken").unwrap().status == AppStatus::Crashed
        });

        {
            let state = state.lock().unwrap();
            let entry = state.registry.find("broken").unwrap();
            let error = entry.last_error.as_ref().unwrap();
            assert!(error.contains("not found"), "unexpected last_error: {error}");
            assert_eq!(entry.pid, None);
        }

        remove(&state, "broken").unwrap();
    }

    #[test]
    fn test_settled_app_is_promoted_to_running() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 0);

        add_app(&state, dir.path(), "steady", "sleep 5");
        wait_for(&state, |state| {
            state.registry.find("steady").unwrap().status == AppStatus::Running
        });

        remove(&state, "steady").unwrap();
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);
        assert!(matches!(remove(&state, "ghost"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_remove_stops_the_process() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);

        let snapshot = add_app(&state, dir.path(), "web", "sleep 30");
        let pid = snapshot.pid.unwrap();
        assert!(supervisor::is_pid_alive(pid as i64));

        remove(&state, "web").unwrap();
        assert!(!supervisor::is_pid_alive(pid as i64));
        assert!(state.lock().unwrap().registry.is_empty());
    }

    #[test]
    fn test_remove_does_not_block_registry_reads() {
        let dir = tempdir().unwrap();
        let state = state_in(dir.path(), 3);

        // Ignored SIGTERM is inherited across exec, so the whole group rides
        // out the termination wait until the SIGKILL escalation
        add_app(&state, dir.path(), "stubborn", "trap '' TERM; sleep 30");

        let remover = Arc::clone(&state);
        let handle = thread::spawn(move || remove(&remover, "stubborn"));

        // Let the remove reach its signal-and-wait before sampling the lock
        sleep(Duration::from_millis(300));

        let started = Instant::now();
        let _ = state.lock().unwrap().registry.find("stubborn").map(|entry| entry.status);
        let waited = started.elapsed();

        assert!(waited < Duration::from_secs(1), "registry read waited {waited:?} behind remove");
        handle.join().unwrap().unwrap();
        assert!(state.lock().unwrap().registry.is_empty());
    }

    #[test]
    fn test_resume_respawns_previously_running_apps() {
        let dir = tempdir().unwrap();

        {
            let state = state_in(dir.path(), 0);
            add_app(&state, dir.path(), "web", "sleep 30");
            wait_for(&state, |state| {
                state.registry.find("web").unwrap().status == AppStatus::Running
            });
            // Simulate a daemon death: kill the child without touching the
            // persisted registry
            let mut state = state.lock().unwrap();
            let pid = state.registry.find("web").unwrap().pid;
            state.supervisor.stop("web", pid);
        }

        let state = state_in(dir.path(), 0);
        {
            let mut state = state.lock().unwrap();
            assert_eq!(state.registry.find("web").unwrap().status, AppStatus::Running);
            assert_eq!(state.registry.find("web").unwrap().pid, None);

            state.resume();
            let entry = state.registry.find("web").unwrap();
            assert_eq!(entry.status, AppStatus::Starting);
            assert!(entry.pid.is_some());
        }

        remove(&state, "web").unwrap();
    }
}
