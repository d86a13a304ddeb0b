//! Durable name -> app registry.
//!
//! The registry is the single source of truth for which apps exist. It is
//! kept in insertion order, persisted as RON, and written atomically: encode,
//! write to a sibling temp file, verify, rename. A mutation that fails to
//! persist rolls the in-memory state back so memory and disk never diverge.
//!
//! Runtime-only fields (`pid`, `started_at`) are never written to disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Starting,
    Running,
    Crashed,
    Stopped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppEntry {
    /// Unique short name, also the first path segment on the router
    pub name: String,
    /// Shell command line the supervisor runs
    pub command: String,
    /// Working directory the command is spawned in
    pub path: PathBuf,
    /// Extra environment merged over the daemon's own
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Loopback port assigned at the most recent (re)start
    pub port: Option<u16>,
    /// Combined stdout/stderr log file
    pub log_path: PathBuf,
    pub status: AppStatus,
    /// Captured output tail, present while the entry is crashed
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Live process id, daemon runtime only
    #[serde(skip)]
    pub pid: Option<u32>,
    /// Spawn time used by the settling window, daemon runtime only
    #[serde(skip)]
    pub started_at: Option<DateTime<Utc>>,
}

pub struct Registry {
    path: PathBuf,
    entries: Vec<AppEntry>,
}

impl Registry {
    /// Load the registry file, treating a missing file as an empty registry.
    /// Unreadable or unparseable contents refuse to load; the daemon must not
    /// start over state it cannot trust.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            return Ok(Registry { path, entries: Vec::new() });
        }

        let contents = fs::read_to_string(&path)
            .map_err(|err| Error::CorruptState(format!("{}: {err}", path.display())))?;

        let entries: Vec<AppEntry> = ron::from_str(&contents)
            .map_err(|err| Error::CorruptState(format!("{}: {err}", path.display())))?;

        Ok(Registry { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in insertion order.
    pub fn list(&self) -> &[AppEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&AppEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut AppEntry> {
        self.entries.iter_mut().find(|entry| entry.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Ports currently held by entries that are up or coming up. New
    /// allocations must avoid these.
    pub fn claimed_ports(&self) -> Vec<u16> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.status, AppStatus::Starting | AppStatus::Running))
            .filter_map(|entry| entry.port)
            .collect()
    }

    /// Insert or replace an entry, keeping its slot when the name already
    /// exists. Rolls back in memory if the write fails.
    pub fn upsert(&mut self, entry: AppEntry) -> Result<()> {
        let before = self.entries.clone();

        match self.entries.iter_mut().find(|existing| existing.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }

        if let Err(err) = self.persist() {
            self.entries = before;
            return Err(err);
        }

        Ok(())
    }

    /// Remove an entry by name. Rolls back in memory if the write fails.
    pub fn remove(&mut self, name: &str) -> Result<AppEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        let removed = self.entries.remove(index);

        if let Err(err) = self.persist() {
            self.entries.insert(index, removed);
            return Err(err);
        }

        Ok(removed)
    }

    /// Persist current in-memory state without changing it. Used by the
    /// monitor loop after status transitions.
    pub fn save(&self) -> Result<()> {
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let encoded = ron::ser::to_string(&self.entries)
            .map_err(|err| Error::Persist(format!("cannot encode registry: {err}")))?;

        // Atomic write: temp file in the same directory, verify, then rename.
        // An interrupted write never leaves a partial registry behind.
        let temp_path = self.path.with_extension("tmp");

        fs::write(&temp_path, &encoded)
            .map_err(|err| Error::Persist(format!("{}: {err}", temp_path.display())))?;

        match fs::metadata(&temp_path) {
            Ok(metadata) if metadata.len() == 0 => {
                let _ = fs::remove_file(&temp_path);
                return Err(Error::Persist(format!(
                    "{}: temp file is empty, aborting write",
                    temp_path.display()
                )));
            }
            Ok(_) => {}
            Err(err) => {
                let _ = fs::remove_file(&temp_path);
                return Err(Error::Persist(format!("{}: {err}", temp_path.display())));
            }
        }

        fs::rename(&temp_path, &self.path).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            Error::Persist(format!("{}: {err}", self.path.display()))
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(name: &str) -> AppEntry {
        AppEntry {
            name: name.to_string(),
            command: format!("node {name}.js"),
            path: PathBuf::from("/tmp"),
            env: BTreeMap::new(),
            port: Some(51200),
            log_path: PathBuf::from(format!("/tmp/{name}.log")),
            status: AppStatus::Running,
            last_error: None,
            created_at: Utc::now(),
            pid: Some(4242),
            started_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let registry = Registry::load(dir.path().join("registry.ron")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upsert_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.ron");

        let mut registry = Registry::load(&path).unwrap();
        registry.upsert(entry("app")).unwrap();

        let reloaded = Registry::load(&path).unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.find("app").unwrap().command, "node app.js");
    }

    #[test]
    fn test_runtime_fields_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.ron");

        let mut registry = Registry::load(&path).unwrap();
        registry.upsert(entry("app")).unwrap();

        let reloaded = Registry::load(&path).unwrap();
        let entry = reloaded.find("app").unwrap();
        assert_eq!(entry.pid, None);
        assert_eq!(entry.started_at, None);
        // Port survives restarts, the pid does not
        assert_eq!(entry.port, Some(51200));
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::load(dir.path().join("registry.ron")).unwrap();

        registry.upsert(entry("a")).unwrap();
        registry.upsert(entry("b")).unwrap();

        let mut replacement = entry("a");
        replacement.command = "python app.py".to_string();
        registry.upsert(replacement).unwrap();

        let names: Vec<&str> = registry.list().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(registry.find("a").unwrap().command, "python app.py");
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::load(dir.path().join("registry.ron")).unwrap();

        match registry.remove("ghost") {
            Err(Error::NotFound(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.ron");

        let mut registry = Registry::load(&path).unwrap();
        registry.upsert(entry("app")).unwrap();
        registry.remove("app").unwrap();

        let reloaded = Registry::load(&path).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_corrupt_file_refuses_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.ron");
        fs::write(&path, "not ron at all {{{").unwrap();

        match Registry::load(&path) {
            Err(Error::CorruptState(_)) => {}
            other => panic!("expected CorruptState, got {:?}", other.map(|r| r.list().len())),
        }
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.ron");

        let mut registry = Registry::load(&path).unwrap();
        registry.upsert(entry("app")).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_claimed_ports_skips_down_entries() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::load(dir.path().join("registry.ron")).unwrap();

        let mut up = entry("up");
        up.port = Some(4000);
        let mut down = entry("down");
        down.port = Some(5000);
        down.status = AppStatus::Crashed;

        registry.upsert(up).unwrap();
        registry.upsert(down).unwrap();

        assert_eq!(registry.claimed_ports(), vec![4000]);
    }

    #[test]
    fn test_persist_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.ron");

        let mut registry = Registry::load(&path).unwrap();
        registry.upsert(entry("app")).unwrap();

        // Turn the registry path into a directory so the rename must fail
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let result = registry.upsert(entry("other"));
        assert!(matches!(result, Err(Error::Persist(_))));
        assert!(registry.find("other").is_none());
        assert_eq!(registry.list().len(), 1);
    }
}
