use colored::Colorize;
use global_placeholders::global;
use macros_rs::{crashln, string};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: Daemon,
    #[serde(default)]
    pub runner: Runner,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Daemon {
    /// Address the public router binds to
    #[serde(default = "default_address")]
    pub address: String,
    /// Port of the public entry point
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds a freshly spawned app stays in `starting` before it counts as up
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Monitoring loop interval in milliseconds
    #[serde(default = "default_interval")]
    pub interval: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Runner {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
}

fn default_address() -> String { string!("127.0.0.1") }
fn default_port() -> u16 { 2000 }
fn default_settle_secs() -> u64 { 3 }
fn default_interval() -> u64 { 1000 }
fn default_shell() -> String { string!("/bin/sh") }
fn default_shell_args() -> Vec<String> { vec![string!("-c")] }

impl Default for Daemon {
    fn default() -> Self {
        Daemon {
            address: default_address(),
            port: default_port(),
            settle_secs: default_settle_secs(),
            interval: default_interval(),
        }
    }
}

impl Default for Runner {
    fn default() -> Self {
        Runner { shell: default_shell(), args: default_shell_args() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config { daemon: Daemon::default(), runner: Runner::default() }
    }
}

impl Config {
    pub fn fmt_address(&self) -> String {
        format!("{}:{}", self.daemon.address, self.daemon.port)
    }
}

/// Read `~/.portman/config.toml`, writing defaults on first use.
pub fn read() -> Config {
    let path = global!("portman.config");

    if !std::path::Path::new(&path).exists() {
        let config = Config::default();
        let contents = match toml::to_string_pretty(&config) {
            Ok(contents) => contents,
            Err(err) => crashln!("{} Cannot encode config.\n{}", *helpers::FAIL, string!(err).white()),
        };

        if let Err(err) = fs::write(&path, contents) {
            crashln!("{} Error writing config to {path}.\n{}", *helpers::FAIL, string!(err).white())
        }

        return config;
    }

    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => crashln!("{} Cannot read config at {path}.\n{}", *helpers::FAIL, string!(err).white()),
    };

    match toml::from_str(&contents) {
        Ok(config) => config,
        Err(err) => crashln!("{} Cannot parse config at {path}.\n{}", *helpers::FAIL, string!(err).white()),
    }
}
