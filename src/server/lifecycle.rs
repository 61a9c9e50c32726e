//! One connection, from accepted socket to closed socket.
//!
//! ```text
//! ACCEPTED → DECODED → AUTHENTICATED → PREPARED → DISPATCHED → FINALIZED → CLOSED
//!     └────── decode failed / auth failed ──────────────────────────────────┘
//! ```

use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncWriteExt;
use tokio::time::{Sleep, sleep};
use tracing::{Instrument, debug, error, info_span, trace, warn};

use crate::analytics::AnalyticsLog;
use crate::dispatch::{Dispatcher, Outcome, Request};
use crate::error::{DecodeError, HandlerError, is_peer_disconnect};
use crate::protocol::{self, ANALYTICS_KEY, Framing, Headers, MAX_REQUEST_TIME, PING, REQUEST_METHOD, TXN_ID};
use crate::server::connection::{self, BodyStream, Connection, ConnectionWriter};
use crate::server::handler::RequestHandler;

pub(crate) const MEASURE_NAME: &str = "app request handler processing";

/// What happened to an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Decoding or authentication failed; nothing reached the dispatcher.
    NoRequest,
    Processed,
    Ignored,
}

/// Interrupts the dispatch of one request once its duration elapses.
struct DeadlineTimer {
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl DeadlineTimer {
    fn arm(duration: Duration) -> Self {
        Self {
            duration,
            sleep: Box::pin(sleep(duration)),
        }
    }
}

/// Per-request resources opened in `prepare` and released in `finalize`.
#[derive(Default)]
struct RequestScope {
    txn_id: Option<String>,
    log: Option<Box<dyn AnalyticsLog>>,
    deadline: Option<DeadlineTimer>,
}

impl<D: Dispatcher> RequestHandler<D> {
    pub(crate) async fn accept_and_process(
        &self,
        conn: Connection,
        peer: &str,
        framing: Framing,
    ) -> Result<Admission, HandlerError> {
        let (mut body, mut output) = conn.into_parts();
        let result = self.process(&mut body, &mut output, framing).await;
        connection::close(body, output).await;

        match result {
            Err(e) if e.is_peer_disconnect() => {
                debug!(peer, error = %e, "peer disconnected");
                Ok(Admission::Processed)
            }
            Err(HandlerError::Io(e)) => {
                error!(peer, error = %e, "I/O error on client connection");
                Ok(Admission::Processed)
            }
            other => other,
        }
    }

    async fn process(
        &self,
        body: &mut BodyStream,
        output: &mut ConnectionWriter,
        framing: Framing,
    ) -> Result<Admission, HandlerError> {
        let password = self.cfg.connect_password.as_deref();
        let headers = match protocol::decode(body, framing, password).await {
            Ok(Some(headers)) => headers,
            Ok(None) => return Ok(Admission::NoRequest),
            Err(DecodeError::Io(e)) if is_peer_disconnect(&e) => {
                debug!(error = %e, "peer disconnected while sending request head");
                return Ok(Admission::NoRequest);
            }
            Err(e) => {
                warn!(error = %e, "dropping connection");
                return Ok(Admission::NoRequest);
            }
        };

        let mut scope = self.prepare(&headers);
        let span = info_span!(
            "request",
            txn_id = scope.txn_id.as_deref().unwrap_or(""),
            debug_http = framing.is_debug_http()
        );

        let result = self
            .dispatch(&headers, body, output, framing.is_debug_http(), &mut scope)
            .instrument(span)
            .await;

        let txn_id = scope.txn_id.take();
        self.finalize(scope, result.is_err());

        match result {
            Ok(Outcome::Handled) => {
                self.shared.count_processed();
                Ok(Admission::Processed)
            }
            Ok(Outcome::Ignored) => {
                self.shared.count_ignored();
                Ok(Admission::Ignored)
            }
            Err(e) => {
                self.shared.count_processed();
                if !matches!(e, HandlerError::Io(_)) {
                    if let Some(txn_id) = txn_id.as_deref() {
                        self.report_exception(&headers, txn_id, &e);
                    }
                }
                Err(e)
            }
        }
    }

    /// Opens the analytics measurement and arms the deadline timer.
    fn prepare(&self, headers: &Headers) -> RequestScope {
        let mut scope = RequestScope {
            txn_id: headers.get(TXN_ID).cloned(),
            ..RequestScope::default()
        };

        if let (Some(analytics), Some(txn_id)) = (&self.analytics, scope.txn_id.as_deref()) {
            let key = headers.get(ANALYTICS_KEY).map(String::as_str);
            let mut log =
                analytics.continue_transaction(txn_id, &self.cfg.app_group_name, "requests", key);
            if let Some(rss) = self.memory.resident_bytes() {
                log.message(&format!("Initial resident memory: {rss} bytes"));
            }
            log.begin_measure(MEASURE_NAME);
            scope.log = Some(log);
        }

        if let Some(duration) = protocol::duration_header(headers, MAX_REQUEST_TIME) {
            trace!(?duration, "deadline armed");
            scope.deadline = Some(DeadlineTimer::arm(duration));
        }

        scope
    }

    async fn dispatch(
        &self,
        headers: &Headers,
        body: &mut BodyStream,
        output: &mut ConnectionWriter,
        debug_http: bool,
        scope: &mut RequestScope,
    ) -> Result<Outcome, HandlerError> {
        if headers.get(REQUEST_METHOD).map(String::as_str) == Some(PING) {
            output.write_all(b"pong").await?;
            return Ok(Outcome::Handled);
        }

        let request = Request {
            headers,
            body,
            output,
            debug_http,
            txn_id: scope.txn_id.as_deref(),
            analytics: scope.log.as_deref_mut().map(|log| log as &mut dyn AnalyticsLog),
        };
        let work = self.dispatcher.handle(request);

        match scope.deadline.as_mut() {
            Some(deadline) => {
                let duration = deadline.duration;
                tokio::select! {
                    result = work => result.map_err(HandlerError::from_dispatch),
                    _ = deadline.sleep.as_mut() => Err(HandlerError::DeadlineExceeded(duration)),
                }
            }
            None => work.await.map_err(HandlerError::from_dispatch),
        }
    }

    /// Closes the analytics measurement and disarms the deadline. Consumes the
    /// scope, so it runs exactly once per prepared request.
    fn finalize(&self, scope: RequestScope, had_error: bool) {
        let RequestScope { log, deadline, .. } = scope;

        if let Some(mut log) = log {
            log.end_measure(MEASURE_NAME, had_error);
            if let Some(rss) = self.memory.resident_bytes() {
                log.message(&format!("Final resident memory: {rss} bytes"));
            }
            if let Err(e) = log.close(true) {
                warn!(error = %e, "analytics log did not acknowledge close");
            }
        }

        if deadline.is_some() {
            trace!("deadline disarmed");
        }
        drop(deadline);
    }

    /// Records a dispatch failure as an analytics exception event. Failures
    /// to report are logged and otherwise ignored.
    fn report_exception(&self, headers: &Headers, txn_id: &str, failure: &HandlerError) {
        let Some(analytics) = &self.analytics else {
            return;
        };
        let key = headers.get(ANALYTICS_KEY).map(String::as_str);
        let mut log = analytics.new_transaction(&self.cfg.app_group_name, "exceptions", key);
        log.message(&format!("Request transaction ID: {txn_id}"));
        log.message(&format!("Message: {}", BASE64.encode(failure.to_string())));
        log.message(&format!("Class: {}", BASE64.encode(failure.class_name())));
        log.message(&format!("Backtrace: {}", BASE64.encode(failure.trace())));
        if let Err(e) = log.close(true) {
            warn!(error = %e, "could not report exception to analytics");
        }
    }
}
