use bytes::BytesMut;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::DecodeError;
use crate::protocol::{Headers, MAX_HEADER_SIZE, REQUEST_METHOD};

#[derive(Debug)]
pub enum ParseError {
    InvalidRequest,
    InvalidRequestLine,
    InvalidHeader,
}

impl ParseError {
    pub fn describe(&self) -> &'static str {
        match self {
            ParseError::InvalidRequest => "request head is not valid UTF-8",
            ParseError::InvalidRequestLine => "malformed request line",
            ParseError::InvalidHeader => "malformed header line",
        }
    }
}

/// Accumulates bytes up to and including the blank line ending the head.
///
/// Bytes after the blank line stay buffered in `reader` for the body.
/// Returns `Ok(None)` on end-of-stream.
pub async fn read_http_head<R>(reader: &mut R) -> Result<Option<BytesMut>, DecodeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = BytesMut::with_capacity(1024);

    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(None);
        }

        let available = chunk.len();
        let scan_from = head.len().saturating_sub(3);
        head.extend_from_slice(chunk);

        if let Some(pos) = find_headers_end(&head[scan_from..]) {
            let end = scan_from + pos + 4;
            let used = available - (head.len() - end);
            reader.consume(used);
            head.truncate(end);
            if head.len() > MAX_HEADER_SIZE {
                return Err(DecodeError::HeaderTooLarge(head.len()));
            }
            return Ok(Some(head));
        }

        reader.consume(available);
        if head.len() > MAX_HEADER_SIZE {
            return Err(DecodeError::HeaderTooLarge(head.len()));
        }
    }
}

/// Turns an HTTP request head into the header map a dispatcher expects.
pub fn parse_http_head(buf: &[u8], server_port: u16) -> Result<Headers, ParseError> {
    let head = buf.strip_suffix(b"\r\n\r\n").unwrap_or(buf);
    let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = head.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;
    let mut parts = request_line.split_whitespace();

    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let uri = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let protocol = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

    let mut headers = Headers::new();
    headers.insert(REQUEST_METHOD.to_string(), method.to_string());
    headers.insert("REQUEST_URI".to_string(), uri.to_string());
    headers.insert("QUERY_STRING".to_string(), query.to_string());
    headers.insert("SCRIPT_NAME".to_string(), String::new());
    headers.insert("PATH_INFO".to_string(), path.to_string());
    headers.insert("SERVER_NAME".to_string(), "127.0.0.1".to_string());
    headers.insert("SERVER_PORT".to_string(), server_port.to_string());
    headers.insert("SERVER_PROTOCOL".to_string(), protocol.to_string());

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        headers.insert(cgi_name(name.trim()), value.trim().to_string());
    }

    Ok(headers)
}

/// `Content-Type` becomes `CONTENT_TYPE`, `User-Agent` becomes `HTTP_USER_AGENT`.
fn cgi_name(name: &str) -> String {
    let name = name.to_ascii_uppercase().replace('-', "_");
    if name == "CONTENT_LENGTH" || name == "CONTENT_TYPE" {
        name
    } else {
        format!("HTTP_{name}")
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let parsed = parse_http_head(req, 8080).unwrap();

        assert_eq!(parsed["PATH_INFO"], "/");
        assert_eq!(parsed["HTTP_HOST"], "example.com");
        assert_eq!(parsed["SERVER_PORT"], "8080");
    }

    #[test]
    fn cgi_names() {
        assert_eq!(cgi_name("Content-Length"), "CONTENT_LENGTH");
        assert_eq!(cgi_name("content-type"), "CONTENT_TYPE");
        assert_eq!(cgi_name("X-Forwarded-For"), "HTTP_X_FORWARDED_FOR");
    }
}
