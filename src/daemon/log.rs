use chrono::Local;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

static LOG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Where daemon log lines go. Set once at startup; until then (and whenever
/// the file cannot be opened) `log!` falls back to the `log` facade only.
pub fn set_path(path: impl Into<PathBuf>) {
    let _ = LOG_PATH.set(path.into());
}

pub struct Logger {
    file: File,
}

/// Formats arguments into a string for logging
pub fn format_args(args: &HashMap<String, String>) -> String {
    args.iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<String>>()
        .join(", ")
}

impl Logger {
    pub fn new() -> io::Result<Self> {
        let path = LOG_PATH
            .get()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "daemon log path not set"))?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Logger { file })
    }

    pub fn write(&mut self, message: &str, args: HashMap<String, String>) {
        let args_str = format_args(&args);
        let msg = if args_str.is_empty() {
            message.to_string()
        } else {
            format!("{message} ({args_str})")
        };

        ::log::info!("{msg}");
        // Ignore write errors, the daemon log must never panic the daemon
        let _ = writeln!(
            &mut self.file,
            "[{}] {msg}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        );
    }
}

#[macro_export]
macro_rules! log {
    ($msg:expr $(, $key:expr => $value:expr)* $(,)?) => {{
        let mut args = std::collections::HashMap::new();
        $(args.insert($key.to_string(), format!("{}", $value));)*
        if let Ok(mut logger) = $crate::daemon::log::Logger::new() {
            logger.write($msg, args)
        } else {
            let args_str = $crate::daemon::log::format_args(&args);
            ::log::info!("{} ({})", $msg, args_str);
        }
    }}
}
