//! Daemon configuration.
//!
//! Resolution order for the config file:
//!   1. `--config` CLI flag
//!   2. `PYBS_CONFIG` environment variable
//!   3. `~/.config/pybs/pybs.toml`
//!   4. built-in defaults (memory store, 4 CPUs, port 16219)
//!
//! The node name falls back to the machine's hostname when the file does
//! not set one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::Deserialize;

use crate::capacity::CapacityMode;

pub const DEFAULT_PORT: u16 = 16219;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Node name; defaults to the hostname. Must be unique per daemon.
    pub node: Option<String>,
    /// CPU capacity of this node.
    pub ncpus: i64,
    /// Root directory submitted script paths are relative to.
    pub root: PathBuf,
    /// `postgres://...` connection string, or `memory` for a single-node
    /// daemon without an external database.
    pub database: String,
    /// RPC port; the daemon always binds loopback.
    pub port: u16,
    pub capacity_mode: CapacityMode,
    /// Dispatcher warm-up delay after startup, in seconds.
    pub warmup_secs: u64,
    /// Dispatcher idle tick, in seconds.
    pub tick_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            node: None,
            ncpus: 4,
            root: PathBuf::from("/"),
            database: "memory".to_string(),
            port: DEFAULT_PORT,
            capacity_mode: CapacityMode::Query,
            warmup_secs: 10,
            tick_secs: 1,
        }
    }
}

impl Settings {
    /// Load settings following the resolution chain; a missing file in the
    /// default location is not an error.
    pub fn load(cli_config: Option<&str>) -> Result<Settings> {
        if let Some(path) = cli_config {
            return Settings::from_file(Path::new(path));
        }

        if let Ok(path) = std::env::var("PYBS_CONFIG")
            && !path.is_empty()
        {
            return Settings::from_file(Path::new(&path));
        }

        if let Some(base_dirs) = BaseDirs::new() {
            let path = base_dirs.config_dir().join("pybs").join("pybs.toml");
            if path.exists() {
                return Settings::from_file(&path);
            }
        }

        Ok(Settings::default())
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse config file {}", path.display()))
    }

    /// The effective node name: configured override or the hostname.
    pub fn node_name(&self) -> String {
        if let Some(node) = &self.node {
            return node.clone();
        }
        hostname().unwrap_or_else(|| "localhost".to_string())
    }
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf outlives the call and its length is passed alongside;
    // gethostname(2) NUL-terminates on success.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(str::to_string)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.ncpus, 4);
        assert_eq!(s.port, DEFAULT_PORT);
        assert_eq!(s.database, "memory");
        assert_eq!(s.capacity_mode, CapacityMode::Query);
        assert!(!s.node_name().is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pybs.toml");
        std::fs::write(
            &path,
            "node = \"n1\"\n\
             ncpus = 16\n\
             root = \"/data/jobs\"\n\
             database = \"postgres://pybs@db/pybs\"\n\
             capacity_mode = \"counter\"\n\
             tick_secs = 2\n",
        )
        .unwrap();

        let s = Settings::from_file(&path).unwrap();
        assert_eq!(s.node_name(), "n1");
        assert_eq!(s.ncpus, 16);
        assert_eq!(s.root, PathBuf::from("/data/jobs"));
        assert_eq!(s.capacity_mode, CapacityMode::Counter);
        assert_eq!(s.tick_secs, 2);
        // Unset keys keep their defaults.
        assert_eq!(s.port, DEFAULT_PORT);
        assert_eq!(s.warmup_secs, 10);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("pybs.toml");
        std::fs::write(&path, "cpus = 4\n").unwrap();
        assert!(Settings::from_file(&path).is_err());
    }
}
