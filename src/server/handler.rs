use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info};

use crate::analytics::AnalyticsLogger;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::HandlerError;
use crate::memory::{MemorySampler, ProcMemorySampler};
use crate::pool::{PoolClient, UnixPoolClient};
use crate::server::listener::ListenerSet;
use crate::server::state::{Counters, Shared};

/// Owns the listeners and collaborators of one worker process and drives the
/// event loop over them.
pub struct RequestHandler<D> {
    pub(crate) cfg: Config,
    pub(crate) listeners: ListenerSet,
    pub(crate) owner_pipe: Option<OwnedFd>,
    pub(crate) dispatcher: D,
    pub(crate) analytics: Option<Arc<dyn AnalyticsLogger>>,
    pub(crate) memory: Arc<dyn MemorySampler>,
    pub(crate) pool: Option<Arc<dyn PoolClient>>,
    pub(crate) shared: Shared,
}

impl<D: Dispatcher> RequestHandler<D> {
    /// Binds the listener set. `owner_pipe` is the read end of the pipe whose
    /// write end the parent holds; `None` disables hard-termination detection.
    pub fn new(cfg: Config, owner_pipe: Option<OwnedFd>, dispatcher: D) -> Result<Self, HandlerError> {
        let listeners = ListenerSet::bind(&cfg)?;
        let pool = UnixPoolClient::from_config(&cfg).map(|client| Arc::new(client) as Arc<dyn PoolClient>);

        Ok(Self {
            cfg,
            listeners,
            owner_pipe,
            dispatcher,
            analytics: None,
            memory: Arc::new(ProcMemorySampler),
            pool,
            shared: Shared::new(),
        })
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsLogger>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn with_memory_sampler(mut self, memory: Arc<dyn MemorySampler>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_pool_client(mut self, pool: Arc<dyn PoolClient>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn counters(&self) -> Counters {
        self.shared.counters()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Runs the event loop on a fresh current-thread runtime, blocking the caller.
    pub fn run(&self) -> Result<(), HandlerError> {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                self.shared.abandon_start();
                return Err(e.into());
            }
        };
        runtime.block_on(self.main_loop())
    }

    /// Stops a running loop, waits for it, then releases the listeners.
    ///
    /// Must not be called from the loop's own thread.
    pub fn cleanup(&self) {
        let trigger = {
            let state = self.shared.lock();
            if state.running { state.trigger.clone() } else { None }
        };
        if let Some(trigger) = trigger {
            debug!("cleanup requested while running, stopping loop");
            trigger.fire();
            self.shared.wait_until_stopped();
        }
        self.listeners.teardown();
    }
}

impl<D> RequestHandler<D>
where
    D: Dispatcher + Send + Sync + 'static,
{
    /// Runs the event loop on a worker thread and returns once its sockets are
    /// armed.
    pub fn start_background(self: &Arc<Self>) -> Result<BackgroundHandle<D>, HandlerError> {
        let seen = self.shared.generation();
        let handler = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("tether-loop".to_string())
            .spawn(move || handler.run())?;

        let generation = self.shared.wait_for_change(seen);
        if !self.shared.is_running() {
            // Arming failed or the loop already ended; either way the thread is exiting.
            match thread.join() {
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {
                    return Ok(BackgroundHandle {
                        handler: Arc::clone(self),
                        thread: None,
                    });
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }

        info!(generation, "request handler started in background");
        Ok(BackgroundHandle {
            handler: Arc::clone(self),
            thread: Some(thread),
        })
    }
}

/// Control handle for a loop started with [`RequestHandler::start_background`].
pub struct BackgroundHandle<D> {
    handler: Arc<RequestHandler<D>>,
    thread: Option<JoinHandle<Result<(), HandlerError>>>,
}

impl<D: Dispatcher> BackgroundHandle<D> {
    pub fn handler(&self) -> &Arc<RequestHandler<D>> {
        &self.handler
    }

    pub fn is_running(&self) -> bool {
        self.handler.is_running()
    }

    pub fn soft_shutdown(&self) {
        self.handler.soft_shutdown();
    }

    /// Asks the loop to stop accepting by closing the graceful-termination pipe.
    pub fn stop(&self) {
        if let Some(trigger) = self.handler.shared.lock().trigger.clone() {
            trigger.fire();
        }
    }

    /// Waits for the loop thread and returns how the loop ended.
    pub fn join(mut self) -> Result<(), HandlerError> {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            },
            None => Ok(()),
        }
    }

    /// Stops the loop, joins it and tears the listeners down.
    pub fn cleanup(self) -> Result<(), HandlerError> {
        let handler = Arc::clone(&self.handler);
        self.stop();
        let result = self.join();
        handler.listeners.teardown();
        result
    }
}
