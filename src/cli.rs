//! CLI side of the control protocol: resolve arguments, make sure a daemon
//! answers, send one request, print the outcome.

use colored::Colorize;
use global_placeholders::global;
use macros_rs::{crashln, string, ternary};
use std::collections::BTreeMap;
use std::env;
use std::thread::sleep;
use std::time::Duration;

use crate::control::{self, ControlRequest, ControlResponse};
use crate::helpers::{self, ColoredString};
use crate::registry::AppStatus;
use crate::{config, daemon};

use tabled::{
    settings::{object::Rows, style::Style, themes::Colorization, Color},
    Table, Tabled,
};

const SOCKET_RETRY_MAX: u32 = 10;
const SOCKET_RETRY_INITIAL_MS: u64 = 200;
const SOCKET_RETRY_INCREMENT_MS: u64 = 100;

/// Auto-start the daemon when no one answers the socket, then wait for it
/// with a lengthening backoff.
fn ensure_daemon() {
    let socket_path = global!("portman.sock");

    if control::is_daemon_running(&socket_path) {
        return;
    }

    daemon::start(false);

    let mut wait_ms = SOCKET_RETRY_INITIAL_MS;
    for _ in 0..SOCKET_RETRY_MAX {
        if control::is_daemon_running(&socket_path) {
            return;
        }
        sleep(Duration::from_millis(wait_ms));
        wait_ms += SOCKET_RETRY_INCREMENT_MS;
    }

    crashln!("{} Daemon did not come up, check {}", *helpers::FAIL, global!("portman.daemon.log"));
}

fn request(request: ControlRequest) -> ControlResponse {
    ensure_daemon();
    match control::send_request(&global!("portman.sock"), request) {
        Ok(response) => response,
        Err(err) => crashln!("{} {err}", *helpers::FAIL),
    }
}

/// Register the command under a name and start it. The name defaults to the
/// basename of the current directory, matching how people name app folders.
pub fn add(name: &Option<String>, command: &str, env_specs: &[String], out: &Option<String>) {
    let path = match env::current_dir() {
        Ok(path) => path,
        Err(err) => crashln!("{} Cannot determine current directory: {err}", *helpers::FAIL),
    };

    let name = match name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => match path.file_name() {
            Some(base) => base.to_string_lossy().into_owned(),
            None => crashln!("{} Cannot derive a name here, pass --name", *helpers::FAIL),
        },
    };

    // `-e KEY=VALUE` sets, bare `-e KEY` forwards the caller's own value
    let mut env_map = BTreeMap::new();
    for spec in env_specs {
        match spec.split_once('=') {
            Some((key, value)) => {
                env_map.insert(key.to_string(), value.to_string());
            }
            None => {
                env_map.insert(spec.clone(), env::var(spec).unwrap_or_default());
            }
        }
    }

    // Log override is taken relative to where the user stands
    let log_path = out.as_ref().map(|out| path.join(out));

    match request(ControlRequest::Add {
        name: name.clone(),
        command: command.to_string(),
        path,
        env: env_map,
        log_path,
    }) {
        ControlResponse::Entry(snapshot) => match snapshot.status {
            AppStatus::Crashed => {
                println!("{} Added {name}, but it failed to start", *helpers::WARN);
                println!("{} See {}", *helpers::WARN, snapshot.log_path.display());
            }
            _ => {
                let port = snapshot.port.map(|p| p.to_string()).unwrap_or_else(|| string!("?"));
                println!("{} Added {name} (port={port})", *helpers::SUCCESS);
            }
        },
        ControlResponse::Error { message, .. } => crashln!("{} {message}", *helpers::FAIL),
        _ => crashln!("{} Unexpected response from daemon", *helpers::FAIL),
    }
}

pub fn remove(name: &str) {
    match request(ControlRequest::Remove(name.to_string())) {
        ControlResponse::Removed(name) => println!("{} Removed {name}", *helpers::SUCCESS),
        ControlResponse::Error { message, .. } => crashln!("{} {message}", *helpers::FAIL),
        _ => crashln!("{} Unexpected response from daemon", *helpers::FAIL),
    }
}

pub fn list(format: &String) {
    let entries = match request(ControlRequest::List) {
        ControlResponse::Entries(entries) => entries,
        ControlResponse::Error { message, .. } => crashln!("{} {message}", *helpers::FAIL),
        _ => crashln!("{} Unexpected response from daemon", *helpers::FAIL),
    };

    if entries.is_empty() {
        println!("{} No apps registered", *helpers::SUCCESS);
        return;
    }

    #[derive(Tabled, Debug)]
    struct ListItem {
        name: String,
        port: String,
        pid: String,
        status: ColoredString,
        uptime: String,
        command: String,
    }

    impl serde::Serialize for ListItem {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serde_json::json!({
                "name": &self.name.trim(),
                "port": &self.port.trim(),
                "pid": &self.pid.trim(),
                "status": &self.status,
                "uptime": &self.uptime.trim(),
                "command": &self.command.trim(),
            })
            .serialize(serializer)
        }
    }

    let items: Vec<ListItem> = entries
        .iter()
        .map(|entry| {
            let status = match entry.status {
                AppStatus::Running => "running  ".green().bold(),
                AppStatus::Starting => "starting ".yellow().bold(),
                AppStatus::Crashed => "crashed  ".red().bold(),
                AppStatus::Stopped => "stopped  ".red().bold(),
            };

            ListItem {
                name: format!("{}  ", entry.name),
                port: entry.port.map(|p| format!("{p}  ")).unwrap_or_else(|| string!("n/a  ")),
                pid: ternary!(
                    entry.pid.is_some(),
                    format!("{}  ", entry.pid.unwrap()),
                    string!("n/a  ")
                ),
                status: status.into(),
                uptime: format!("{}  ", helpers::format_duration(entry.created_at)),
                command: entry.command.clone(),
            }
        })
        .collect();

    let table = Table::new(&items)
        .with(Style::rounded().remove_verticals())
        .with(Colorization::exact([Color::FG_BRIGHT_CYAN], Rows::first()))
        .to_string();

    match format.as_str() {
        "raw" => println!("{items:?}"),
        "json" => match serde_json::to_string(&items) {
            Ok(json) => println!("{json}"),
            Err(err) => crashln!("{} Cannot encode list: {err}", *helpers::FAIL),
        },
        _ => println!("{table}"),
    }
}

pub fn start_daemon() {
    daemon::start(true);
    // Touch the config so first-time users get the file to edit
    let _ = config::read();
}

pub fn stop_daemon() {
    daemon::stop(true);
}
