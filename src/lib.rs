//! Tether - request handler core for application worker processes
//!
//! Accepts connections from a front-end web server, decodes the request
//! envelope, hands it to an embedder-supplied dispatcher and exits when the
//! owning process goes away.

pub mod analytics;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod memory;
pub mod pool;
pub mod protocol;
pub mod server;
