use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::server::handler::RequestHandler;
use crate::server::pipes::GracefulTrigger;

impl<D: Dispatcher> RequestHandler<D> {
    /// Stops admitting new work: the loop waits at most the linger duration
    /// for further connections, then exits. Also asks the pool manager to
    /// detach this worker when a detach key and pool client are configured.
    ///
    /// Callable from any thread. Only the first call per loop run has an effect.
    /// Outside a runtime the detach runs on the caller's thread; inside one it
    /// runs on the blocking pool.
    pub fn soft_shutdown(&self) {
        let trigger = {
            let mut state = self.shared.lock();
            if !state.running || state.soft_terminating {
                return;
            }
            state.soft_terminating = true;
            state.select_timeout = Some(self.cfg.linger());
            state.trigger.clone()
        };
        info!(linger = ?self.cfg.linger(), "soft termination requested");

        if let Some(trigger) = trigger {
            trigger.fire();
        }

        if let (Some(key), Some(pool)) = (self.cfg.detach_key.clone(), self.pool.clone()) {
            let detach = move || {
                if let Err(e) = pool.detach(&key) {
                    warn!(error = %e, "could not detach from pool");
                }
            };
            // On the loop's own thread (SIGUSR1) the pool manager must not
            // stall the linger timer.
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(detach);
                }
                Err(_) => detach(),
            }
        }
    }

    /// Starts a graceful drain when resident memory exceeds the limit.
    pub(crate) fn govern_memory(&self, trigger: &GracefulTrigger) {
        let Some(limit) = self.cfg.memory_limit_bytes() else {
            return;
        };
        let Some(rss) = self.memory.resident_bytes() else {
            return;
        };
        if rss > limit {
            warn!(
                resident_mb = rss / (1024 * 1024),
                limit_mb = self.cfg.memory_limit_mb,
                "memory limit exceeded, shutting down gracefully"
            );
            trigger.fire();
        }
    }
}
