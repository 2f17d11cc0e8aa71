//! Server configuration.
//!
//! Two layers: [`ServerOptions`] are the process flags (host, port, data
//! dir, verbosity), and [`Config`] is the persisted `<dir>/config` JSON
//! document that survives restarts (replication target, server id,
//! password properties, maxmemory). The config file is written atomically
//! via a temp file and rename.

use std::path::{Path, PathBuf};

use clap::Parser;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

/// Command-line options.
#[derive(Parser, Debug, Clone)]
#[command(name = "meridian-server")]
#[command(about = "Meridian in-memory geospatial database server")]
#[command(disable_help_flag = true)]
pub struct ServerOptions {
    /// Address to listen on
    #[arg(short = 'h', long = "host", env = "MERIDIAN_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short = 'p', long = "port", env = "MERIDIAN_PORT", default_value_t = 9851)]
    pub port: u16,

    /// Data directory (log and config files)
    #[arg(short = 'd', long = "dir", env = "MERIDIAN_DIR", default_value = "data")]
    pub dir: PathBuf,

    /// Protected mode refuses remote connections without a password
    #[arg(long = "protected-mode", value_parser = ["yes", "no"], default_value = "yes")]
    pub protected_mode: String,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Enable developer commands (MASSINSERT)
    #[arg(long = "dev")]
    pub dev: bool,

    /// Print help
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

impl ServerOptions {
    /// tracing-subscriber filter directive for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}

/// The persisted configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_pos: Option<u64>,
    #[serde(default)]
    pub server_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub requirepass: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub leaderauth: String,
    #[serde(rename = "protected-mode", default, skip_serializing_if = "String::is_empty")]
    pub protected_mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub maxmemory: String,
}

const CONFIG_FILE: &str = "config";

impl Config {
    /// Load `<dir>/config`, creating it with a fresh server id when absent.
    pub fn load(dir: &Path) -> Result<Config> {
        let path = dir.join(CONFIG_FILE);
        match std::fs::read(&path) {
            Ok(data) => {
                let mut config: Config = serde_json::from_slice(&data)
                    .map_err(|e| ServerError::other(format!("bad config file: {e}")))?;
                if config.protected_mode.is_empty() {
                    config.protected_mode = "yes".to_string();
                }
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config {
                    server_id: random_id(),
                    protected_mode: "yes".to_string(),
                    ..Config::default()
                };
                config.write(dir)?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically: temp file in the same dir, then rename.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| ServerError::other(format!("config encode: {e}")))?;
        let tmp = dir.join(format!("{CONFIG_FILE}.tmp"));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, dir.join(CONFIG_FILE))?;
        Ok(())
    }

    /// Whether this server follows a leader.
    pub fn following(&self) -> bool {
        self.follow_host.is_some()
    }

    /// CONFIG GET property value.
    pub fn get_property(&self, name: &str) -> Option<String> {
        match name {
            "requirepass" => Some(self.requirepass.clone()),
            "leaderauth" => Some(self.leaderauth.clone()),
            "protected-mode" => Some(self.protected_mode.clone()),
            "maxmemory" => Some(self.maxmemory.clone()),
            _ => None,
        }
    }

    /// CONFIG SET property value, with validation.
    pub fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "requirepass" => self.requirepass = value.to_string(),
            "leaderauth" => self.leaderauth = value.to_string(),
            "protected-mode" => match value.to_ascii_lowercase().as_str() {
                "yes" | "no" => self.protected_mode = value.to_ascii_lowercase(),
                _ => return Err(ServerError::invalid_argument(value)),
            },
            "maxmemory" => {
                parse_memory(value)?;
                self.maxmemory = value.to_ascii_lowercase();
            }
            _ => {
                return Err(ServerError::other(format!(
                    "Unsupported CONFIG parameter: {name}"
                )))
            }
        }
        Ok(())
    }

    /// The maxmemory budget in bytes; zero means unlimited.
    pub fn maxmemory_bytes(&self) -> u64 {
        if self.maxmemory.is_empty() {
            return 0;
        }
        parse_memory(&self.maxmemory).unwrap_or(0)
    }
}

/// Parse a memory size with an optional kb/mb/gb suffix.
pub fn parse_memory(value: &str) -> Result<u64> {
    let v = value.trim().to_ascii_lowercase();
    let (digits, mult) = if let Some(d) = v.strip_suffix("kb") {
        (d, 1024u64)
    } else if let Some(d) = v.strip_suffix("mb") {
        (d, 1024 * 1024)
    } else if let Some(d) = v.strip_suffix("gb") {
        (d, 1024 * 1024 * 1024)
    } else {
        (v.as_str(), 1)
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| ServerError::invalid_argument(value))?;
    Ok(n * mult)
}

/// Random 16-byte hex server id.
pub fn random_id() -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    b.iter().map(|x| format!("{x:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_config_with_server_id() {
        let dir = tempfile::tempdir().unwrap();
        let c = Config::load(dir.path()).unwrap();
        assert_eq!(c.server_id.len(), 32);
        assert_eq!(c.protected_mode, "yes");
        // Reload returns the same id.
        let c2 = Config::load(dir.path()).unwrap();
        assert_eq!(c.server_id, c2.server_id);
    }

    #[test]
    fn write_is_readable_and_omits_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Config::load(dir.path()).unwrap();
        c.follow_host = Some("10.0.0.1".into());
        c.follow_port = Some(9851);
        c.write(dir.path()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("config")).unwrap();
        assert!(raw.contains("follow_host"));
        assert!(!raw.contains("read_only"));
        assert!(!raw.contains("requirepass"));
    }

    #[test]
    fn memory_suffixes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("4kb").unwrap(), 4096);
        assert_eq!(parse_memory("2mb").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_memory("1gb").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_memory("abc").is_err());
    }

    #[test]
    fn property_validation() {
        let mut c = Config::default();
        assert!(c.set_property("protected-mode", "maybe").is_err());
        c.set_property("protected-mode", "no").unwrap();
        assert_eq!(c.get_property("protected-mode").unwrap(), "no");
        c.set_property("maxmemory", "100mb").unwrap();
        assert_eq!(c.maxmemory_bytes(), 100 * 1024 * 1024);
        assert!(c.set_property("nope", "x").is_err());
    }
}
