//! Pool manager client.
//!
//! During soft termination the worker asks the pool manager to detach it so
//! no further requests are routed here.

use std::io::{self, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::protocol::encode_envelope;

pub trait PoolClient: Send + Sync {
    fn detach(&self, detach_key: &str) -> io::Result<()>;
}

/// Sends one authenticated detach command over a short-lived unix socket.
///
/// The command uses the native envelope framing.
#[derive(Debug, Clone)]
pub struct UnixPoolClient {
    socket: PathBuf,
    username: String,
    password: String,
    timeout: Duration,
}

impl UnixPoolClient {
    pub fn new(socket: impl Into<PathBuf>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            username: username.into(),
            password: password.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Builds a client when the pool socket and both credentials are configured.
    pub fn from_config(cfg: &Config) -> Option<Self> {
        match (&cfg.pool_socket, &cfg.pool_username, &cfg.pool_password) {
            (Some(socket), Some(username), Some(password)) => {
                Some(Self::new(socket.clone(), username.clone(), password.clone()))
            }
            _ => None,
        }
    }
}

impl PoolClient for UnixPoolClient {
    fn detach(&self, detach_key: &str) -> io::Result<()> {
        let mut stream = UnixStream::connect(&self.socket)?;
        stream.set_write_timeout(Some(self.timeout))?;

        let frame = encode_envelope([
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("command", "detach"),
            ("detach_key", detach_key),
        ]);
        let result = stream.write_all(&frame);
        let _ = stream.shutdown(Shutdown::Both);
        result
    }
}
