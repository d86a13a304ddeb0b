use global_placeholders::init;
use macros_rs::crashln;
use std::fs;

use crate::helpers;

/// Register runtime paths and make sure the base directory exists.
/// Must run before anything touches `global!("portman.*")`.
pub fn init() {
    match home::home_dir() {
        Some(path) => {
            let base = format!("{}/.portman", path.display());
            let logs = format!("{base}/logs");

            if let Err(err) = fs::create_dir_all(&logs) {
                crashln!("{} Failed to create {base}: {err}", *helpers::FAIL);
            }

            init!("portman.base", base.clone());
            init!("portman.registry", format!("{base}/registry.ron"));
            init!("portman.config", format!("{base}/config.toml"));
            init!("portman.sock", format!("{base}/portman.sock"));
            init!("portman.pid", format!("{base}/daemon.pid"));
            init!("portman.daemon.log", format!("{base}/daemon.log"));
            crate::daemon::log::set_path(format!("{base}/daemon.log"));
            init!("portman.logs", logs);
            init!("portman.logs.entry", format!("{base}/logs/{{}}.log"));
        }
        None => crashln!("{} Unable to determine home directory", *helpers::FAIL),
    }
}
