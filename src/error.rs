use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors that escape a request or the event loop.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot bind listener: {0}")]
    Bind(#[source] io::Error),
    #[error("dispatcher failed: {0:#}")]
    Dispatch(anyhow::Error),
    #[error("request exceeded its maximum processing time of {0:?}")]
    DeadlineExceeded(Duration),
    #[error("received signal {0}")]
    Signal(&'static str),
}

impl HandlerError {
    /// Wraps a dispatcher failure, keeping plain I/O errors classifiable.
    pub fn from_dispatch(error: anyhow::Error) -> Self {
        match error.downcast::<io::Error>() {
            Ok(io) => HandlerError::Io(io),
            Err(other) => HandlerError::Dispatch(other),
        }
    }

    /// True when the peer went away underneath us. These are routine.
    pub fn is_peer_disconnect(&self) -> bool {
        match self {
            HandlerError::Io(e) => is_peer_disconnect(e),
            _ => false,
        }
    }

    /// Short type name recorded with analytics exception events.
    pub fn class_name(&self) -> &'static str {
        match self {
            HandlerError::Io(_) => "IoError",
            HandlerError::Bind(_) => "BindError",
            HandlerError::Dispatch(_) => "DispatchError",
            HandlerError::DeadlineExceeded(_) => "DeadlineExceeded",
            HandlerError::Signal(_) => "SignalException",
        }
    }

    /// Full cause chain, one cause per line.
    pub fn trace(&self) -> String {
        match self {
            HandlerError::Dispatch(e) => e
                .chain()
                .map(|cause| cause.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        }
    }
}

pub fn is_peer_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

/// Protocol violations while decoding a request head.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("header block of {0} bytes exceeds the maximum")]
    HeaderTooLarge(usize),
    #[error("malformed request head: {0}")]
    Malformed(&'static str),
    #[error("I/O error while decoding: {0}")]
    Io(#[from] io::Error),
}
