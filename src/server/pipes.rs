use std::io::{self, PipeWriter};
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::unix::pipe;

/// Write end of the graceful-termination pipe.
///
/// Closing it is the only cross-thread signal the event loop listens to.
#[derive(Clone, Debug)]
pub struct GracefulTrigger {
    writer: Arc<Mutex<Option<PipeWriter>>>,
}

impl GracefulTrigger {
    pub(crate) fn new(writer: PipeWriter) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Closes the write end. Returns `false` if it was already closed.
    pub fn fire(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_fired(&self) -> bool {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// The owner pipe and the graceful-termination pipe, opened per loop run.
pub struct ControlPipes {
    owner: Option<pipe::Receiver>,
    graceful: pipe::Receiver,
    trigger: GracefulTrigger,
}

impl ControlPipes {
    /// `owner` is the read end whose write end the parent process holds. It is
    /// duplicated, so the caller keeps its descriptor across runs.
    pub fn open(owner: Option<&OwnedFd>) -> io::Result<Self> {
        let owner = match owner {
            Some(fd) => Some(pipe::Receiver::from_owned_fd(fd.try_clone()?)?),
            None => None,
        };
        let (reader, writer) = io::pipe()?;
        let graceful = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;

        Ok(Self {
            owner,
            graceful,
            trigger: GracefulTrigger::new(writer),
        })
    }

    pub fn trigger(&self) -> GracefulTrigger {
        self.trigger.clone()
    }

    /// Resolves once the owner pipe is readable: closed, or written to.
    /// Never resolves without an owner pipe.
    pub async fn owner_closed(&self) {
        match &self.owner {
            Some(owner) => {
                let _ = owner.readable().await;
            }
            None => std::future::pending().await,
        }
    }

    /// Resolves once the graceful-termination write end has been closed.
    pub async fn graceful_closed(&self) {
        let _ = self.graceful.readable().await;
    }
}

impl Drop for ControlPipes {
    fn drop(&mut self) {
        self.trigger.fire();
    }
}
