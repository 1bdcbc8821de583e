//! Load config from file, environment and command line.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use clap::Parser;
use lanchat_core::{DEFAULT_CONTROL_PORT, DEFAULT_FILE_PORT};
use serde::Deserialize;

/// Node configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_NAME, LANCHAT_CONTROL_PORT, LANCHAT_FILE_PORT, LANCHAT_DATA_DIR,
/// LANCHAT_DOWNLOAD_DIR, LANCHAT_ADVERTISE_IP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name. Required on first run; afterwards the stored name is used.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Control listen port (default 12345). 0 picks a free port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// File-transfer listen port (default 12346). 0 picks a free port.
    #[serde(default = "default_file_port")]
    pub file_port: u16,
    /// Address both listeners bind to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Address advertised to peers. Detected when unset.
    #[serde(default)]
    pub advertise_ip: Option<IpAddr>,
    /// Settings and contacts live here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Received files are written here.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_file_port() -> u16 {
    DEFAULT_FILE_PORT
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}
fn default_data_dir() -> PathBuf {
    home_dir().join(".lanchat")
}
fn default_download_dir() -> PathBuf {
    home_dir().join("Downloads").join("LanChat")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: None,
            control_port: default_control_port(),
            file_port: default_file_port(),
            bind_addr: default_bind_addr(),
            advertise_ip: None,
            data_dir: default_data_dir(),
            download_dir: default_download_dir(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Command-line flags. Anything given here wins over file and environment.
#[derive(Debug, Parser)]
#[command(name = "lanchat", version, about = "Peer-to-peer messaging on the local network")]
pub struct Cli {
    /// Config file to read instead of the default locations
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Display name (needed the first time)
    #[arg(long)]
    pub name: Option<String>,

    /// Control port
    #[arg(long)]
    pub control_port: Option<u16>,

    /// File-transfer port
    #[arg(long)]
    pub file_port: Option<u16>,

    /// Address advertised to peers
    #[arg(long)]
    pub advertise_ip: Option<IpAddr>,

    /// Directory for settings and contacts
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Directory for received files
    #[arg(long)]
    pub download_dir: Option<PathBuf>,
}

impl Cli {
    /// Resolve the full config: defaults, file, env, then these flags.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let mut c = match &self.config {
            Some(path) => load_from(path)?,
            None => load_file()?.unwrap_or_default(),
        };
        apply_env(&mut c);
        if let Some(n) = &self.name {
            c.display_name = Some(n.clone());
        }
        if let Some(p) = self.control_port {
            c.control_port = p;
        }
        if let Some(p) = self.file_port {
            c.file_port = p;
        }
        if let Some(ip) = self.advertise_ip {
            c.advertise_ip = Some(ip);
        }
        if let Some(d) = &self.data_dir {
            c.data_dir = d.clone();
        }
        if let Some(d) = &self.download_dir {
            c.download_dir = d.clone();
        }
        Ok(c)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = load_file()?.unwrap_or_default();
    apply_env(&mut c);
    Ok(c)
}

fn apply_env(c: &mut Config) {
    if let Ok(s) = std::env::var("LANCHAT_NAME") {
        if !s.trim().is_empty() {
            c.display_name = Some(s.trim().to_string());
        }
    }
    if let Ok(s) = std::env::var("LANCHAT_CONTROL_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.control_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANCHAT_FILE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.file_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANCHAT_ADVERTISE_IP") {
        if let Ok(ip) = s.parse::<IpAddr>() {
            c.advertise_ip = Some(ip);
        }
    }
    if let Some(d) = std::env::var_os("LANCHAT_DATA_DIR") {
        c.data_dir = PathBuf::from(d);
    }
    if let Some(d) = std::env::var_os("LANCHAT_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(d);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

/// First existing config file wins. A file that exists but does not parse is an error.
fn load_file() -> Result<Option<Config>, ConfigError> {
    for p in config_paths() {
        if p.exists() {
            return load_from(&p).map(Some);
        }
    }
    Ok(None)
}

pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
