#![allow(dead_code)]

use std::io::{self, PipeWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use temp_dir::TempDir;
use tether::analytics::{AnalyticsLog, AnalyticsLogger};
use tether::config::Config;
use tether::dispatch::{Dispatcher, Outcome, Request};
use tether::error::HandlerError;
use tether::memory::MemorySampler;
use tether::pool::PoolClient;
use tether::protocol::{Headers, encode_envelope};
use tether::server::{BackgroundHandle, ListenerAddress, ListenerName, RequestHandler};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct Call {
    pub headers: Headers,
    pub debug_http: bool,
    pub txn_id: Option<String>,
    pub measured: bool,
}

/// Echoes the body back, or misbehaves on request through `X_MODE`.
#[derive(Default)]
pub struct TestDispatcher {
    pub calls: Mutex<Vec<Call>>,
}

impl TestDispatcher {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl Dispatcher for TestDispatcher {
    async fn handle(&self, request: Request<'_>) -> anyhow::Result<Outcome> {
        self.calls.lock().unwrap().push(Call {
            headers: request.headers.clone(),
            debug_http: request.debug_http,
            txn_id: request.txn_id.map(str::to_string),
            measured: request.analytics.is_some(),
        });

        match request.headers.get("X_MODE").map(String::as_str) {
            Some("ignore") => Ok(Outcome::Ignored),
            Some("fail") => anyhow::bail!("application exploded"),
            Some("sleep") => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Outcome::Handled)
            }
            Some("broken_pipe") => Err(io::Error::from(io::ErrorKind::BrokenPipe).into()),
            _ => {
                let mut body = Vec::new();
                request.body.read_to_end(&mut body).await?;
                request.output.write_all(b"echo:").await?;
                request.output.write_all(&body).await?;
                Ok(Outcome::Handled)
            }
        }
    }
}

/// Records analytics events as strings.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct RecordingAnalytics(pub Arc<Recorder>);

struct RecordingLog {
    label: String,
    recorder: Arc<Recorder>,
}

impl RecordingLog {
    fn push(&self, event: String) {
        self.recorder.events.lock().unwrap().push(event);
    }
}

impl AnalyticsLogger for RecordingAnalytics {
    fn continue_transaction(
        &self,
        txn_id: &str,
        _group: &str,
        category: &str,
        _key: Option<&str>,
    ) -> Box<dyn AnalyticsLog> {
        Box::new(RecordingLog {
            label: format!("{category}/{txn_id}"),
            recorder: Arc::clone(&self.0),
        })
    }

    fn new_transaction(&self, _group: &str, category: &str, _key: Option<&str>) -> Box<dyn AnalyticsLog> {
        Box::new(RecordingLog {
            label: format!("{category}/new"),
            recorder: Arc::clone(&self.0),
        })
    }
}

impl AnalyticsLog for RecordingLog {
    fn message(&mut self, text: &str) {
        self.push(format!("message {} {text}", self.label));
    }

    fn begin_measure(&mut self, name: &str) {
        self.push(format!("begin {} {name}", self.label));
    }

    fn end_measure(&mut self, name: &str, error: bool) {
        self.push(format!("end {} {name} error={error}", self.label));
    }

    fn close(self: Box<Self>, flush: bool) -> io::Result<()> {
        self.push(format!("close {} flush={flush}", self.label));
        Ok(())
    }
}

pub struct FixedMemory(pub AtomicU64);

impl FixedMemory {
    pub fn mib(mib: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(mib * 1024 * 1024)))
    }
}

impl MemorySampler for FixedMemory {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
pub struct RecordingPool {
    pub detached: Mutex<Vec<String>>,
}

impl PoolClient for RecordingPool {
    fn detach(&self, detach_key: &str) -> io::Result<()> {
        self.detached.lock().unwrap().push(detach_key.to_string());
        Ok(())
    }
}

/// A pool manager that does not answer until released.
#[derive(Default)]
pub struct StallingPool {
    entered: AtomicBool,
    released: Mutex<bool>,
    wake: Condvar,
}

impl StallingPool {
    pub fn wait_entered(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.entered.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.wake.notify_all();
    }
}

impl PoolClient for StallingPool {
    fn detach(&self, _detach_key: &str) -> io::Result<()> {
        self.entered.store(true, Ordering::SeqCst);
        let released = self.released.lock().unwrap();
        let _ = self
            .wake
            .wait_timeout_while(released, Duration::from_secs(10), |released| !*released)
            .unwrap();
        Ok(())
    }
}

pub type Handler = RequestHandler<TestDispatcher>;

pub struct Harness {
    pub dir: TempDir,
    pub owner: Option<PipeWriter>,
    pub handler: Arc<Handler>,
    pub handle: Option<BackgroundHandle<TestDispatcher>>,
}

pub fn config(dir: &TempDir) -> Config {
    Config {
        socket_dir: dir.path().to_path_buf(),
        soft_termination_linger_secs: 0.3,
        ..Config::default()
    }
}

pub fn start(cfg: Config, dir: TempDir, customize: impl FnOnce(Handler) -> Handler) -> Harness {
    let (reader, writer) = std::io::pipe().unwrap();
    let handler = RequestHandler::new(cfg, Some(OwnedFd::from(reader)), TestDispatcher::default()).unwrap();
    let handler = Arc::new(customize(handler));
    let handle = handler.start_background().unwrap();
    assert!(handle.is_running());

    Harness {
        dir,
        owner: Some(writer),
        handler,
        handle: Some(handle),
    }
}

impl Harness {
    pub fn address(&self, name: ListenerName) -> ListenerAddress {
        self.handler.listeners().address(name).unwrap()
    }

    pub fn native(&self, pairs: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut frame = encode_envelope(pairs.iter().copied());
        frame.extend_from_slice(body);
        send(&self.address(ListenerName::Main), &frame)
    }

    pub fn http(&self, raw: &[u8]) -> Vec<u8> {
        send(&self.address(ListenerName::Http), raw)
    }

    pub fn ping(&self) -> Vec<u8> {
        self.native(&[("REQUEST_METHOD", "PING")], b"")
    }

    /// Waits for the loop thread, failing the test if it takes too long.
    pub fn join(&mut self, limit: Duration) -> Result<(), HandlerError> {
        let handle = self.handle.take().expect("loop already joined");
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(handle.join());
        });
        rx.recv_timeout(limit).expect("event loop did not stop in time")
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.cleanup();
        }
    }
}

/// Writes `bytes`, half-closes, and returns everything the server sent back.
pub fn send(addr: &ListenerAddress, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    match addr {
        ListenerAddress::Unix(path) => {
            let mut stream = UnixStream::connect(path).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let _ = stream.write_all(bytes);
            let _ = stream.shutdown(Shutdown::Write);
            let _ = stream.read_to_end(&mut out);
        }
        ListenerAddress::Tcp(addr) => {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            let _ = stream.write_all(bytes);
            let _ = stream.shutdown(Shutdown::Write);
            let _ = stream.read_to_end(&mut out);
        }
    }
    out
}
