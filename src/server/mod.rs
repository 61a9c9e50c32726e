//! Connection acceptance and the event loop.
//!
//! # Architecture
//!
//! - **`listener`**: binds and tears down the server sockets
//! - **`pipes`**: owner pipe and graceful-termination pipe
//! - **`signals`**: signal dispositions for the loop's lifetime
//! - **`state`**: loop state shared with controlling threads
//! - **`handler`**: [`RequestHandler`] and its embedder entry points
//! - **`event_loop`**: the readiness wait and what each wake-up does
//! - **`lifecycle`**: one connection from accept to close
//! - **`termination`**: soft shutdown and the memory governor
//!
//! # Loop
//!
//! ```text
//!   arm signals, pipes, listeners
//!               │
//!               ▼
//!   ┌──► wait (listeners, owner pipe, graceful pipe, linger timer)
//!   │           │
//!   │           ├─ main / http ready → accept → decode → dispatch → close
//!   │           ├─ pipe closed, lingering → stop watching pipes
//!   │           ├─ pipe closed → exit
//!   │           └─ linger elapsed → exit
//!   └───────────┘
//! ```

pub mod connection;
pub mod event_loop;
pub mod handler;
pub mod lifecycle;
pub mod listener;
pub mod pipes;
pub mod signals;
pub mod state;
pub mod termination;

pub use handler::{BackgroundHandle, RequestHandler};
pub use listener::{ListenerAddress, ListenerName, ListenerSet};
pub use state::Counters;
