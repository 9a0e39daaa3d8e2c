// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Configuration management for the shim daemon
//!
//! Supports command-line arguments and TOML configuration files. A
//! configuration file declares any number of shim instances with their
//! DIF assignment and the key/value entries the engines parse.

use crate::error::ShimError;
use crate::ipcp::{ConfigEntry, DifConfig, IpcpId};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Daemon operating mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// Runs a self-contained walkthrough over in-memory lower layers.
    Demo,
    /// Serves the shims declared in the configuration file.
    Serve,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Demo => write!(f, "demo"),
            RunMode::Serve => write!(f, "serve"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "demo" => Ok(RunMode::Demo),
            "serve" => Ok(RunMode::Serve),
            _ => Err(format!("Invalid mode: {}. Use 'demo' or 'serve'", s)),
        }
    }
}

/// Command-line arguments for the shim daemon
#[derive(Parser, Debug)]
#[command(name = "aris")]
#[command(author = "ARI Contributors")]
#[command(version = "0.1.0")]
#[command(about = "RINA shim IPC processes", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Operating mode: demo or serve
    #[arg(long, value_name = "MODE", default_value = "demo")]
    pub mode: RunMode,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,
}

/// `[daemon]` section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One `[[shim]]` table: a shim instance to create and assign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimSection {
    /// IPCP process name
    pub name: String,
    /// Factory name, e.g. "shim-tcp-udp"
    #[serde(rename = "type")]
    pub shim_type: String,
    pub ipcp_id: IpcpId,
    /// DIF name to assign the instance to
    pub dif: String,
    /// Engine-specific key/value entries (§6.3 keys)
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl ShimSection {
    /// Converts the TOML table into the wire-level entry list, so both
    /// configuration paths share the engines' parsers.
    pub fn dif_config(&self) -> DifConfig {
        DifConfig {
            entries: self
                .config
                .iter()
                .map(|(name, value)| ConfigEntry::new(name, value))
                .collect(),
        }
    }
}

/// Top-level TOML configuration file structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default, rename = "shim")]
    pub shims: Vec<ShimSection>,
}

/// Loads and parses a TOML configuration file.
pub fn load_config(path: &Path) -> Result<DaemonConfig, ShimError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ShimError::Config(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| ShimError::Config(format!("cannot parse {}: {e}", path.display())))
}
