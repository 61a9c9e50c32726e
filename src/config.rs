use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Worker configuration.
///
/// Loaded from defaults, then an optional YAML file named by `TETHER_CONFIG`,
/// then individual `TETHER_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory that receives the main unix socket.
    pub socket_dir: PathBuf,
    /// Bind the main listener on a unix socket when possible.
    pub prefer_unix: bool,
    /// Loopback address for the main listener when unix sockets are unavailable.
    pub tcp_address: String,
    /// Loopback address for the plain-HTTP debug listener.
    pub debug_http_address: String,
    /// Shared secret every request must present.
    pub connect_password: Option<String>,
    /// Resident memory limit in MiB; 0 disables the governor.
    pub memory_limit_mb: u64,
    /// How long the loop keeps waiting for stragglers once soft termination started.
    pub soft_termination_linger_secs: f64,
    /// Identifier sent to the pool manager when detaching.
    pub detach_key: Option<String>,
    pub pool_socket: Option<PathBuf>,
    pub pool_username: Option<String>,
    pub pool_password: Option<String>,
    pub app_group_name: String,
    /// Report request measurements to the analytics logger.
    pub analytics: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            prefer_unix: true,
            tcp_address: "127.0.0.1:0".to_string(),
            debug_http_address: "127.0.0.1:0".to_string(),
            connect_password: None,
            memory_limit_mb: 0,
            soft_termination_linger_secs: 3.0,
            detach_key: None,
            pool_socket: None,
            pool_username: None,
            pool_password: None,
            app_group_name: "tether".to_string(),
            analytics: false,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var("TETHER_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Some(dir) = env("TETHER_SOCKET_DIR") {
            self.socket_dir = dir.into();
        }
        if let Some(addr) = env("TETHER_TCP_ADDRESS") {
            self.tcp_address = addr;
        }
        if let Some(addr) = env("TETHER_DEBUG_HTTP_ADDRESS") {
            self.debug_http_address = addr;
        }
        if let Some(password) = env("TETHER_CONNECT_PASSWORD") {
            self.connect_password = Some(password);
        }
        if let Some(limit) = env("TETHER_MEMORY_LIMIT") {
            self.memory_limit_mb = limit
                .parse()
                .with_context(|| format!("TETHER_MEMORY_LIMIT is not a number: {limit}"))?;
        }
        if let Some(linger) = env("TETHER_LINGER") {
            self.soft_termination_linger_secs = linger
                .parse()
                .with_context(|| format!("TETHER_LINGER is not a number: {linger}"))?;
        }
        if let Some(key) = env("TETHER_DETACH_KEY") {
            self.detach_key = Some(key);
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::try_from_secs_f64(self.soft_termination_linger_secs)
            .unwrap_or(Duration::from_secs(3))
    }

    pub fn memory_limit_bytes(&self) -> Option<u64> {
        (self.memory_limit_mb > 0).then(|| self.memory_limit_mb * 1024 * 1024)
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
