use tether::error::DecodeError;
use tether::http::parser::{ParseError, parse_http_head, read_http_head};
use tether::protocol::{self, Framing, MAX_HEADER_SIZE};
use tokio::io::AsyncReadExt;

#[test]
fn test_parse_get_with_query() {
    let req = b"GET /foo?x=1 HTTP/1.1\r\nHost: h\r\n\r\n";
    let headers = parse_http_head(req, 3000).unwrap();

    assert_eq!(headers["REQUEST_METHOD"], "GET");
    assert_eq!(headers["REQUEST_URI"], "/foo?x=1");
    assert_eq!(headers["PATH_INFO"], "/foo");
    assert_eq!(headers["QUERY_STRING"], "x=1");
    assert_eq!(headers["HTTP_HOST"], "h");
    assert_eq!(headers["SCRIPT_NAME"], "");
    assert_eq!(headers["SERVER_NAME"], "127.0.0.1");
    assert_eq!(headers["SERVER_PORT"], "3000");
    assert_eq!(headers["SERVER_PROTOCOL"], "HTTP/1.1");
}

#[test]
fn test_parse_without_query_has_empty_query_string() {
    let headers = parse_http_head(b"GET /index.html HTTP/1.0\r\n\r\n", 80).unwrap();

    assert_eq!(headers["PATH_INFO"], "/index.html");
    assert_eq!(headers["QUERY_STRING"], "");
}

#[test]
fn test_parse_content_headers_stay_unprefixed() {
    let req = b"POST /api HTTP/1.1\r\nContent-Type: application/json\r\nContent-Length: 5\r\nX-Request-Id: abc\r\n\r\n";
    let headers = parse_http_head(req, 80).unwrap();

    assert_eq!(headers["CONTENT_TYPE"], "application/json");
    assert_eq!(headers["CONTENT_LENGTH"], "5");
    assert_eq!(headers["HTTP_X_REQUEST_ID"], "abc");
    assert!(!headers.contains_key("HTTP_CONTENT_LENGTH"));
}

#[test]
fn test_parse_malformed_request_line() {
    let result = parse_http_head(b"GET\r\n\r\n", 80);
    assert!(matches!(result, Err(ParseError::InvalidRequestLine)));
}

#[test]
fn test_parse_malformed_header() {
    let result = parse_http_head(b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n", 80);
    assert!(matches!(result, Err(ParseError::InvalidHeader)));
}

#[tokio::test]
async fn test_read_head_leaves_body_unread() {
    let mut reader: &[u8] = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";

    let head = read_http_head(&mut reader).await.unwrap().unwrap();
    assert!(head.ends_with(b"\r\n\r\n"));

    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"hello");
}

#[tokio::test]
async fn test_read_head_across_small_chunks() {
    let raw: &[u8] = b"GET / HTTP/1.1\r\nHost: h\r\n\r\nrest";
    let mut reader = tokio::io::BufReader::with_capacity(3, raw);

    let head = read_http_head(&mut reader).await.unwrap().unwrap();
    assert_eq!(&head[..], b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"rest");
}

#[tokio::test]
async fn test_read_head_eof_is_clean() {
    let mut reader: &[u8] = b"GET / HTTP/1.1\r\nHost: h\r\n";
    assert!(read_http_head(&mut reader).await.unwrap().is_none());
}

#[tokio::test]
async fn test_read_head_over_cap_fails() {
    let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
    raw.extend(std::iter::repeat_n(b'a', MAX_HEADER_SIZE + 10));
    let mut reader: &[u8] = &raw;

    let result = read_http_head(&mut reader).await;
    assert!(matches!(result, Err(DecodeError::HeaderTooLarge(_))));
}

#[tokio::test]
async fn test_decode_debug_http_checks_password() {
    let framing = Framing::DebugHttp { server_port: 80 };

    let mut reader: &[u8] = b"GET / HTTP/1.1\r\nX-Connect-Password: secret\r\n\r\n";
    let headers = protocol::decode(&mut reader, framing, Some("secret")).await.unwrap();
    assert!(headers.is_some());

    let mut reader: &[u8] = b"GET / HTTP/1.1\r\nX-Connect-Password: wrong\r\n\r\n";
    let headers = protocol::decode(&mut reader, framing, Some("secret")).await.unwrap();
    assert!(headers.is_none());
}
