use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use tether::analytics::TracingAnalytics;
use tether::config::Config;
use tether::dispatch::{Dispatcher, Outcome, Request};
use tether::http::response::Response;
use tether::http::writer::ResponseWriter;
use tether::server::RequestHandler;

/// Answers every request with a plain-text summary of what arrived.
struct SummaryDispatcher;

impl Dispatcher for SummaryDispatcher {
    async fn handle(&self, request: Request<'_>) -> anyhow::Result<Outcome> {
        let declared: u64 = request
            .headers
            .get("CONTENT_LENGTH")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = Vec::new();
        request.body.take(declared).read_to_end(&mut body).await?;

        let mut names: Vec<_> = request.headers.keys().collect();
        names.sort();
        let mut text = String::new();
        for name in names {
            text.push_str(&format!("{name}={}\n", request.headers[name]));
        }
        text.push_str(&format!("body: {} bytes\n", body.len()));

        ResponseWriter::new(&Response::text(text))
            .write_to(request.output)
            .await?;
        Ok(Outcome::Handled)
    }
}

/// The owner pipe is `TETHER_OWNER_FD` when set, otherwise stdin when stdin is a pipe.
fn owner_pipe() -> anyhow::Result<Option<OwnedFd>> {
    if let Ok(fd) = std::env::var("TETHER_OWNER_FD") {
        let fd: i32 = fd.parse().context("TETHER_OWNER_FD is not a descriptor number")?;
        // SAFETY: the parent hands this descriptor to us and nothing else uses it.
        return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }));
    }

    let stdin = std::io::stdin().as_fd().try_clone_to_owned()?;
    let file = std::fs::File::from(stdin);
    if file.metadata()?.file_type().is_fifo() {
        Ok(Some(file.into()))
    } else {
        tracing::warn!("stdin is not a pipe, owner death will not be detected");
        Ok(None)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let analytics = cfg.analytics;

    let mut handler = RequestHandler::new(cfg, owner_pipe()?, SummaryDispatcher)?;
    if analytics {
        handler = handler.with_analytics(Arc::new(TracingAnalytics));
    }

    for line in handler.listeners().advertise() {
        println!("{line}");
    }

    let result = handler.main_loop().await;
    handler.cleanup();
    result?;

    Ok(())
}
