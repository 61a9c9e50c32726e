//! The seam between the request handler core and the application.

use crate::analytics::AnalyticsLog;
use crate::protocol::Headers;
use crate::server::connection::{BodyStream, ConnectionWriter};

/// One decoded request, borrowed for the duration of a dispatch.
pub struct Request<'a> {
    pub headers: &'a Headers,
    /// The rest of the connection after the head, streamed, never buffered whole.
    pub body: &'a mut BodyStream,
    /// Write half of the connection. The response goes here.
    pub output: &'a mut ConnectionWriter,
    /// Came in over the plain-HTTP debug listener.
    pub debug_http: bool,
    pub txn_id: Option<&'a str>,
    /// Open analytics log when the request is being measured.
    pub analytics: Option<&'a mut dyn AnalyticsLog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// The application chose not to handle this request. It is finalized but
    /// not counted as processed.
    Ignored,
}

/// Application-specific request handling.
pub trait Dispatcher {
    fn handle(&self, request: Request<'_>) -> impl Future<Output = anyhow::Result<Outcome>>;
}
