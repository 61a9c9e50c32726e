//! Server-side sockets.
//!
//! The listener set is bound once at start-up with std sockets. Each run of
//! the event loop arms tokio listeners on duplicates of those descriptors, so
//! the set survives loop restarts and runtime changes.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, Permissions};
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::HandlerError;
use crate::server::connection::Connection;

pub const BACKLOG: i32 = 500;
const UNIX_BIND_ATTEMPTS: usize = 128;

/// Names of the listeners, in the order they are served each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerName {
    /// Native envelope protocol. Always present.
    Main,
    /// Plain-HTTP debug protocol.
    Http,
}

impl ListenerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerName::Main => "main",
            ListenerName::Http => "http",
        }
    }

    fn protocol(&self) -> &'static str {
        match self {
            ListenerName::Main => "session",
            ListenerName::Http => "http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for ListenerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenerAddress::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

enum BoundSocket {
    Unix(StdUnixListener),
    Tcp(StdTcpListener),
}

impl BoundSocket {
    fn raw_fd(&self) -> RawFd {
        match self {
            BoundSocket::Unix(l) => l.as_raw_fd(),
            BoundSocket::Tcp(l) => l.as_raw_fd(),
        }
    }
}

pub struct ListenerEntry {
    pub name: ListenerName,
    pub address: ListenerAddress,
    socket: BoundSocket,
}

/// All server sockets owned by this process.
pub struct ListenerSet {
    entries: Mutex<BTreeMap<ListenerName, ListenerEntry>>,
}

impl ListenerSet {
    /// Binds the main listener (unix socket preferred, loopback TCP otherwise)
    /// and the debug HTTP listener.
    pub fn bind(cfg: &Config) -> Result<Self, HandlerError> {
        let mut entries = BTreeMap::new();

        let main = bind_main(cfg).map_err(HandlerError::Bind)?;
        entries.insert(ListenerName::Main, main);

        let addr = resolve_loopback(&cfg.debug_http_address).map_err(HandlerError::Bind)?;
        let (address, socket) = bind_tcp(addr).map_err(HandlerError::Bind)?;
        entries.insert(
            ListenerName::Http,
            ListenerEntry {
                name: ListenerName::Http,
                address,
                socket,
            },
        );

        for entry in entries.values() {
            info!(listener = entry.name.as_str(), address = %entry.address, "listener bound");
        }

        Ok(Self {
            entries: Mutex::new(entries),
        })
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<ListenerName, ListenerEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn address(&self, name: ListenerName) -> Option<ListenerAddress> {
        self.entries().get(&name).map(|entry| entry.address.clone())
    }

    /// One `socket: <name>;<address>;<protocol>` line per listener, for the owner.
    pub fn advertise(&self) -> Vec<String> {
        self.entries()
            .values()
            .map(|entry| {
                format!(
                    "socket: {};{};{}",
                    entry.name.as_str(),
                    entry.address,
                    entry.name.protocol()
                )
            })
            .collect()
    }

    /// Registers duplicates of the bound sockets with the current runtime.
    pub(crate) fn arm(&self) -> io::Result<ArmedListeners> {
        let entries = self.entries();
        let main = match entries.get(&ListenerName::Main).map(|entry| &entry.socket) {
            Some(BoundSocket::Unix(l)) => ArmedListener::Unix(arm_unix(l)?),
            Some(BoundSocket::Tcp(l)) => ArmedListener::Tcp(arm_tcp(l)?),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "listener set has been torn down",
                ));
            }
        };
        let http = match entries.get(&ListenerName::Http).map(|entry| &entry.socket) {
            Some(BoundSocket::Tcp(l)) => Some(arm_tcp(l)?),
            _ => None,
        };
        let http_port = http
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(0);

        Ok(ArmedListeners { main, http, http_port })
    }

    /// Closes every socket and unlinks unix socket files. Safe to call twice.
    pub fn teardown(&self) {
        let entries = std::mem::take(&mut *self.entries());
        for (_, entry) in entries {
            debug!(listener = entry.name.as_str(), fd = entry.socket.raw_fd(), "closing listener");
            drop(entry.socket);
            if let ListenerAddress::Unix(path) = &entry.address {
                let _ = fs::remove_file(path);
            }
        }
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn bind_main(cfg: &Config) -> io::Result<ListenerEntry> {
    if cfg.prefer_unix {
        match bind_unix(&cfg.socket_dir) {
            Ok((path, listener)) => {
                return Ok(ListenerEntry {
                    name: ListenerName::Main,
                    address: ListenerAddress::Unix(path),
                    socket: BoundSocket::Unix(listener),
                });
            }
            Err(e) => {
                warn!(dir = %cfg.socket_dir.display(), error = %e, "unix socket unavailable, falling back to TCP");
            }
        }
    }

    let (address, socket) = bind_tcp(resolve_loopback(&cfg.tcp_address)?)?;
    Ok(ListenerEntry {
        name: ListenerName::Main,
        address,
        socket,
    })
}

/// Binds a world-writable unix socket under a fresh random name.
fn bind_unix(dir: &Path) -> io::Result<(PathBuf, StdUnixListener)> {
    for _ in 0..UNIX_BIND_ATTEMPTS {
        let path = dir.join(format!("tether.{:016x}", rand::random::<u64>()));
        let listener = match StdUnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        };

        let prepared = fs::set_permissions(&path, Permissions::from_mode(0o777))
            .and_then(|_| set_backlog(listener.as_raw_fd()));
        if let Err(e) = prepared {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        return Ok((path, listener));
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free unix socket name found",
    ))
}

fn bind_tcp(addr: SocketAddr) -> io::Result<(ListenerAddress, BoundSocket)> {
    let listener = StdTcpListener::bind(addr)?;
    set_backlog(listener.as_raw_fd())?;
    let local = listener.local_addr()?;
    Ok((ListenerAddress::Tcp(local), BoundSocket::Tcp(listener)))
}

fn resolve_loopback(addr: &str) -> io::Result<SocketAddr> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid address {addr}")))?;
    if !addr.ip().is_loopback() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{addr} is not a loopback address"),
        ));
    }
    Ok(addr)
}

/// std listens with its own default backlog; listening again resizes the queue.
fn set_backlog(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a bound socket owned by the caller.
    if unsafe { libc::listen(fd, BACKLOG) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn arm_unix(listener: &StdUnixListener) -> io::Result<UnixListener> {
    let dup = listener.try_clone()?;
    dup.set_nonblocking(true)?;
    UnixListener::from_std(dup)
}

fn arm_tcp(listener: &StdTcpListener) -> io::Result<TcpListener> {
    let dup = listener.try_clone()?;
    dup.set_nonblocking(true)?;
    TcpListener::from_std(dup)
}

pub(crate) enum ArmedListener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl ArmedListener {
    pub(crate) async fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            ArmedListener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok((Connection::Unix(stream), "unix".to_string()))
            }
            ArmedListener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
        }
    }
}

/// Listeners registered with the running loop's reactor.
pub(crate) struct ArmedListeners {
    pub(crate) main: ArmedListener,
    http: Option<TcpListener>,
    pub(crate) http_port: u16,
}

impl ArmedListeners {
    /// Never resolves when the debug listener is absent.
    pub(crate) async fn accept_http(&self) -> io::Result<(Connection, String)> {
        match &self.http {
            Some(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Connection::Tcp(stream), peer.to_string()))
            }
            None => std::future::pending().await,
        }
    }
}
