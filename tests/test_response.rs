use tether::http::response::{Response, ResponseBuilder, StatusCode};
use tether::http::writer::{ResponseWriter, serialize_response};

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::Ok.as_u16(), 200);
    assert_eq!(StatusCode::NoContent.as_u16(), 204);
    assert_eq!(StatusCode::BadRequest.as_u16(), 400);
    assert_eq!(StatusCode::NotFound.as_u16(), 404);
    assert_eq!(StatusCode::InternalServerError.as_u16(), 500);
    assert_eq!(StatusCode::ServiceUnavailable.as_u16(), 503);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::Ok.reason_phrase(), "OK");
    assert_eq!(StatusCode::NotFound.reason_phrase(), "Not Found");
    assert_eq!(
        StatusCode::ServiceUnavailable.reason_phrase(),
        "Service Unavailable"
    );
}

#[test]
fn test_response_builder_with_headers() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .header("X-Custom", "value")
        .body(b"test".to_vec())
        .build();

    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert_eq!(response.header("X-Custom"), Some("value"));
}

#[test]
fn test_response_builder_replaces_header() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("X-Custom", "one")
        .header("x-custom", "two")
        .build();

    assert_eq!(response.header("X-Custom"), Some("two"));
    assert_eq!(response.headers.len(), 2);
}

#[test]
fn test_response_builder_keeps_explicit_content_length() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "100")
        .body(b"short".to_vec())
        .build();

    assert_eq!(response.header("Content-Length"), Some("100"));
}

#[test]
fn test_serialize_response() {
    let bytes = serialize_response(&Response::text("pong"));
    let text = String::from_utf8(bytes).unwrap();

    assert_eq!(
        text,
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\npong"
    );
}

#[tokio::test]
async fn test_writer_writes_everything() {
    let response = Response::not_found();
    let mut out = Vec::new();
    let mut writer = ResponseWriter::new(&response);

    writer.write_to(&mut out).await.unwrap();

    assert_eq!(out, serialize_response(&response));
    assert!(out.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
    assert!(out.ends_with(b"404 Not Found"));
}
