use std::io;

use tokio::time;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::HandlerError;
use crate::protocol::Framing;
use crate::server::connection::Connection;
use crate::server::handler::RequestHandler;
use crate::server::lifecycle::Admission;
use crate::server::listener::ArmedListeners;
use crate::server::pipes::ControlPipes;
use crate::server::signals::{LoopSignal, SignalDiscipline};

/// What ended one readiness wait.
enum Wake {
    Signal(LoopSignal),
    Main(io::Result<(Connection, String)>),
    Http(io::Result<(Connection, String)>),
    OwnerPipe,
    GracefulPipe,
    Timeout,
}

impl<D: Dispatcher> RequestHandler<D> {
    /// Serves requests until the owner goes away, soft termination lingers
    /// out, or a recognized termination signal arrives.
    ///
    /// Any other failure is returned after teardown; the embedder is expected
    /// to exit the process.
    pub async fn main_loop(&self) -> Result<(), HandlerError> {
        let (mut signals, pipes, armed) = match self.arm() {
            Ok(resources) => resources,
            Err(e) => {
                self.shared.abandon_start();
                return Err(e);
            }
        };
        let guard = self.shared.begin(pipes.trigger());
        info!(generation = self.shared.generation(), "request handler loop started");

        let result = self.serve(&armed, &pipes, &mut signals).await;

        signals.disarm();
        drop(pipes);
        drop(armed);
        drop(guard);

        let counters = self.shared.counters();
        match &result {
            Ok(()) => info!(
                iterations = counters.iterations,
                processed = counters.processed_requests,
                "request handler loop stopped"
            ),
            Err(e) => warn!(error = %e, "request handler loop failed"),
        }
        result
    }

    fn arm(&self) -> Result<(SignalDiscipline, ControlPipes, ArmedListeners), HandlerError> {
        let signals = SignalDiscipline::arm()?;
        let pipes = ControlPipes::open(self.owner_pipe.as_ref())?;
        let armed = self.listeners.arm()?;
        Ok((signals, pipes, armed))
    }

    async fn serve(
        &self,
        armed: &ArmedListeners,
        pipes: &ControlPipes,
        signals: &mut SignalDiscipline,
    ) -> Result<(), HandlerError> {
        loop {
            self.shared.count_iteration();
            let (timeout, selectable) = self.shared.wait_params();

            let wake = tokio::select! {
                biased;
                signal = signals.recv() => Wake::Signal(signal),
                accepted = armed.main.accept() => Wake::Main(accepted),
                accepted = armed.accept_http() => Wake::Http(accepted),
                _ = pipes.owner_closed(), if selectable.owner_pipe => Wake::OwnerPipe,
                _ = pipes.graceful_closed(), if selectable.graceful_pipe => Wake::GracefulPipe,
                _ = time::sleep(timeout.unwrap_or_default()), if timeout.is_some() => Wake::Timeout,
            };

            match wake {
                Wake::Main(accepted) => {
                    self.serve_connection(accepted, Framing::Native, pipes).await?;
                }
                Wake::Http(accepted) => {
                    let framing = Framing::DebugHttp {
                        server_port: armed.http_port,
                    };
                    self.serve_connection(accepted, framing, pipes).await?;
                }
                Wake::OwnerPipe => {
                    if self.keep_lingering() {
                        continue;
                    }
                    info!("owner pipe closed, exiting loop");
                    return Ok(());
                }
                Wake::GracefulPipe => {
                    if self.keep_lingering() {
                        continue;
                    }
                    info!("graceful termination requested, exiting loop");
                    return Ok(());
                }
                Wake::Timeout => {
                    info!("soft termination linger elapsed");
                    return Ok(());
                }
                Wake::Signal(signal) => match signal {
                    LoopSignal::SoftShutdown => self.soft_shutdown(),
                    LoopSignal::Terminate | LoopSignal::Interrupt => {
                        info!(?signal, "termination signal received");
                        return Ok(());
                    }
                    LoopSignal::Report => self.report(),
                    LoopSignal::Abort => return Err(HandlerError::Signal("SIGABRT")),
                },
            }
        }
    }

    async fn serve_connection(
        &self,
        accepted: io::Result<(Connection, String)>,
        framing: Framing,
        pipes: &ControlPipes,
    ) -> Result<(), HandlerError> {
        let (conn, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                return Ok(());
            }
        };

        let admission = self.accept_and_process(conn, &peer, framing).await?;
        if admission == Admission::Processed {
            self.govern_memory(&pipes.trigger());
        }
        Ok(())
    }

    /// A control pipe fired. While soft termination lingers, stop watching the
    /// pipes so only the linger timeout can end the wait.
    fn keep_lingering(&self) -> bool {
        // Soft termination may have started while we were waiting.
        if self.shared.select_timeout().is_none() {
            return false;
        }
        debug!("lingering, no longer watching control pipes");
        self.shared.stop_watching_pipes();
        true
    }

    fn report(&self) {
        let counters = self.shared.counters();
        let state = self.shared.lock();
        warn!(
            generation = state.generation,
            running = state.running,
            soft_terminating = state.soft_terminating,
            iterations = counters.iterations,
            processed = counters.processed_requests,
            ignored = counters.ignored_requests,
            "diagnostic report"
        );
    }
}
