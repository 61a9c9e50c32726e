//! Plain-HTTP support.
//!
//! The debug listener speaks a small subset of HTTP/1.x so a developer can
//! point a browser or `curl` straight at a worker:
//!
//! - **`parser`**: reads a request head and maps it onto dispatcher headers
//! - **`response`**: response representation with a builder
//! - **`writer`**: serializes a response onto the connection
//!
//! Only request heads are parsed here. Bodies are never buffered; they stay on
//! the connection for the dispatcher to stream.

pub mod parser;
pub mod response;
pub mod writer;
