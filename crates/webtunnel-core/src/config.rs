//! Configuration resolution for webtunnel.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config_dir>/webtunnel/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. CLI arguments and environment variables (highest priority)
//!
//! Every layer above the defaults is a [`ConfigOverlay`]: only the fields it
//! sets are applied, so a file may override just `local_server.port`.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default host of the local service being exposed.
pub const DEFAULT_LOCAL_HOST: &str = "localhost";
/// Default port of the local service being exposed.
pub const DEFAULT_LOCAL_PORT: u16 = 3001;
/// Default relay host.
pub const DEFAULT_REMOTE_HOST: &str = "proxy.lodoss.org";
/// Default relay port.
pub const DEFAULT_REMOTE_PORT: u16 = 5000;
/// Default number of pre-opened data connections.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Complete tunnel client configuration. Immutable once handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Service exposed through the tunnel.
    pub local_server: ServerAddr,
    /// Relay the client dials out to.
    pub remote_server: ServerAddr,
    /// Number of idle data connections kept open to the relay.
    pub pool_size: usize,
    /// File holding the identity token.
    pub identity_file: PathBuf,
    /// Replacement value for the `Host` header of forwarded requests.
    pub rewrite_host: Option<String>,
    /// Verbose logging.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_server: ServerAddr::new(DEFAULT_LOCAL_HOST, DEFAULT_LOCAL_PORT),
            remote_server: ServerAddr::new(DEFAULT_REMOTE_HOST, DEFAULT_REMOTE_PORT),
            pool_size: DEFAULT_POOL_SIZE,
            identity_file: default_identity_path(),
            rewrite_host: None,
            debug: false,
        }
    }
}

/// Partial server address as it appears in settings files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerAddrOverlay {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// One configuration layer. Unset fields leave the lower layer untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverlay {
    pub local_server: Option<ServerAddrOverlay>,
    pub remote_server: Option<ServerAddrOverlay>,
    pub pool_size: Option<usize>,
    pub identity_file: Option<PathBuf>,
    pub rewrite_host: Option<String>,
    pub debug: Option<bool>,
}

impl Config {
    /// Apply an overlay on top of this config.
    pub fn merge(&mut self, overlay: ConfigOverlay) {
        if let Some(local) = overlay.local_server {
            merge_addr(&mut self.local_server, local);
        }
        if let Some(remote) = overlay.remote_server {
            merge_addr(&mut self.remote_server, remote);
        }
        if let Some(n) = overlay.pool_size {
            self.pool_size = n;
        }
        if let Some(path) = overlay.identity_file {
            self.identity_file = path;
        }
        if let Some(host) = overlay.rewrite_host {
            // An empty value on a higher layer switches rewriting off again.
            self.rewrite_host = if host.is_empty() { None } else { Some(host) };
        }
        if let Some(debug) = overlay.debug {
            self.debug = debug;
        }
    }

    /// Reject configurations the tunnel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.local_server.host.is_empty() {
            return Err(Error::Config("local server host is empty".into()));
        }
        if self.remote_server.host.is_empty() {
            return Err(Error::Config("remote server host is empty".into()));
        }
        Ok(())
    }
}

fn merge_addr(base: &mut ServerAddr, overlay: ServerAddrOverlay) {
    if let Some(host) = overlay.host {
        base.host = host;
    }
    if let Some(port) = overlay.port {
        base.port = port;
    }
}

/// Load configuration: defaults, then the global settings file, then the
/// explicitly requested file. CLI overrides are merged by the caller.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        tracing::debug!(path = %global_path.display(), "Loading global settings");
        config.merge(load_config_file(&global_path)?);
    }

    if let Some(path) = explicit {
        // An explicitly requested file must exist.
        config.merge(load_config_file(path)?);
    }

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("webtunnel").join("settings.json"))
}

/// Default location of the identity token file.
pub fn default_identity_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webtunnel")
        .join("identity")
}

fn load_config_file(path: &Path) -> Result<ConfigOverlay> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}
