//! Request head decoding.
//!
//! Two framings share one contract: produce a header map and leave the
//! remaining connection bytes untouched for the body stream.
//!
//! - **`envelope`**: the native length-prefixed `name NUL value NUL` block
//! - **`http::parser`**: the plain-HTTP debug framing

pub mod envelope;

use std::collections::HashMap;

use tokio::io::AsyncBufRead;
use tracing::warn;

use crate::error::DecodeError;
use crate::http::parser;

pub use envelope::{MAX_HEADER_SIZE, encode_envelope, encode_header_block, parse_header_block};

/// Decoded request headers.
pub type Headers = HashMap<String, String>;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
/// Method value of the liveness probe.
pub const PING: &str = "PING";
pub const CONNECT_PASSWORD: &str = "CONNECT_PASSWORD";
pub const HTTP_CONNECT_PASSWORD: &str = "HTTP_X_CONNECT_PASSWORD";
pub const TXN_ID: &str = "TXN_ID";
pub const ANALYTICS_KEY: &str = "ANALYTICS_KEY";
/// Seconds, possibly fractional.
pub const MAX_REQUEST_TIME: &str = "MAX_REQUEST_TIME";

/// How the bytes on a connection are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Native,
    /// `server_port` is reported to the dispatcher as `SERVER_PORT`.
    DebugHttp { server_port: u16 },
}

impl Framing {
    pub fn is_debug_http(&self) -> bool {
        matches!(self, Framing::DebugHttp { .. })
    }

    fn password_field(&self) -> &'static str {
        match self {
            Framing::Native => CONNECT_PASSWORD,
            Framing::DebugHttp { .. } => HTTP_CONNECT_PASSWORD,
        }
    }
}

/// Reads one request head from `reader`.
///
/// Returns `Ok(None)` when the peer disconnected before a full head arrived,
/// and also when a connect password is configured but not presented. The
/// two cases are indistinguishable to the peer.
pub async fn decode<R>(
    reader: &mut R,
    framing: Framing,
    password: Option<&str>,
) -> Result<Option<Headers>, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let headers = match framing {
        Framing::Native => envelope::read_envelope(reader).await?,
        Framing::DebugHttp { server_port } => match parser::read_http_head(reader).await? {
            Some(head) => Some(
                parser::parse_http_head(&head, server_port)
                    .map_err(|e| DecodeError::Malformed(e.describe()))?,
            ),
            None => None,
        },
    };

    let Some(headers) = headers else {
        return Ok(None);
    };

    if let Some(expected) = password {
        let field = framing.password_field();
        if headers.get(field).map(String::as_str) != Some(expected) {
            warn!(field, "connect password mismatch, dropping connection");
            return Ok(None);
        }
    }

    Ok(Some(headers))
}

/// Reads an optional positive duration from a header holding seconds.
pub fn duration_header(headers: &Headers, name: &str) -> Option<std::time::Duration> {
    let secs: f64 = headers.get(name)?.trim().parse().ok()?;
    if secs > 0.0 {
        std::time::Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}
