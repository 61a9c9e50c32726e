//! Signal handling for the lifetime of one event loop run.
//!
//! While armed, SIGHUP and SIGPIPE are ignored and a curated set of signals is
//! turned into [`LoopSignal`] events. Disarming restores the dispositions that
//! were in place before, for the ignored and the curated signals alike.
//!
//! tokio installs its own handler the first time a signal is listened for and
//! never installs it again. That handler is remembered process-wide, so a later
//! arm can put it back after a disarm restored the previous disposition.

use std::io;
use std::mem::MaybeUninit;
use std::sync::{Mutex, OnceLock, PoisonError};

use libc::c_int;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::debug;

/// What a received signal asks the event loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// SIGUSR1
    SoftShutdown,
    /// SIGTERM
    Terminate,
    /// SIGINT
    Interrupt,
    /// SIGQUIT
    Report,
    /// SIGABRT
    Abort,
}

const IGNORED: [c_int; 2] = [libc::SIGHUP, libc::SIGPIPE];

const CURATED: [c_int; 5] = [
    libc::SIGUSR1,
    libc::SIGTERM,
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGABRT,
];

type Actions = Vec<(c_int, libc::sigaction)>;

/// Dispositions from before the outermost arm, and how many disciplines are
/// currently armed.
struct Armed {
    depth: usize,
    saved: Actions,
}

static ARMED: Mutex<Armed> = Mutex::new(Armed {
    depth: 0,
    saved: Vec::new(),
});

/// tokio's handlers for the curated signals, captured on the first arm.
static TOKIO_HANDLERS: OnceLock<Actions> = OnceLock::new();

pub struct SignalDiscipline {
    soft: Signal,
    term: Signal,
    int: Signal,
    quit: Signal,
    abrt: Signal,
    armed: bool,
}

impl SignalDiscipline {
    /// Must be called from within a tokio runtime.
    pub fn arm() -> io::Result<Self> {
        let mut armed = ARMED.lock().unwrap_or_else(PoisonError::into_inner);

        let outermost = armed.depth == 0;
        let saved = if outermost {
            snapshot(CURATED.iter().chain(IGNORED.iter()).copied())?
        } else {
            Vec::new()
        };

        let streams = (|| {
            Ok::<_, io::Error>((
                signal(SignalKind::user_defined1())?,
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::quit())?,
                signal(SignalKind::from_raw(libc::SIGABRT))?,
            ))
        })();
        let (soft, term, int, quit, abrt) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                if outermost {
                    restore(&saved);
                }
                return Err(e);
            }
        };

        if outermost {
            let installed = match TOKIO_HANDLERS.get() {
                Some(handlers) => Ok(handlers),
                None => snapshot(CURATED.iter().copied()).map(|handlers| TOKIO_HANDLERS.get_or_init(|| handlers)),
            };
            let prepared = installed
                .and_then(|handlers| reinstall(handlers))
                .and_then(|_| IGNORED.iter().try_for_each(|&signum| ignore(signum)));
            if let Err(e) = prepared {
                restore(&saved);
                return Err(e);
            }
            armed.saved = saved;
        }
        armed.depth += 1;

        debug!(depth = armed.depth, "signal handlers armed");
        Ok(Self {
            soft,
            term,
            int,
            quit,
            abrt,
            armed: true,
        })
    }

    /// Waits for the next curated signal.
    pub async fn recv(&mut self) -> LoopSignal {
        tokio::select! {
            biased;
            _ = self.term.recv() => LoopSignal::Terminate,
            _ = self.int.recv() => LoopSignal::Interrupt,
            _ = self.abrt.recv() => LoopSignal::Abort,
            _ = self.soft.recv() => LoopSignal::SoftShutdown,
            _ = self.quit.recv() => LoopSignal::Report,
        }
    }

    /// Restores the saved dispositions once the last armed discipline goes.
    /// Safe to call twice.
    pub fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        let mut armed = ARMED.lock().unwrap_or_else(PoisonError::into_inner);
        armed.depth = armed.depth.saturating_sub(1);
        if armed.depth == 0 {
            let saved = std::mem::take(&mut armed.saved);
            restore(&saved);
            debug!("signal handlers reverted");
        }
    }
}

impl Drop for SignalDiscipline {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn current(signum: c_int) -> io::Result<libc::sigaction> {
    // SAFETY: a null new action only queries; the kernel fills in `previous`.
    unsafe {
        let mut previous = MaybeUninit::<libc::sigaction>::zeroed();
        if libc::sigaction(signum, std::ptr::null(), previous.as_mut_ptr()) == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(previous.assume_init())
    }
}

fn snapshot(signals: impl Iterator<Item = c_int>) -> io::Result<Actions> {
    signals.map(|signum| current(signum).map(|action| (signum, action))).collect()
}

fn install(signum: c_int, action: &libc::sigaction) -> io::Result<()> {
    // SAFETY: `action` was read back from the kernel or fully initialised by us.
    if unsafe { libc::sigaction(signum, action, std::ptr::null_mut()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn reinstall(handlers: &Actions) -> io::Result<()> {
    handlers.iter().try_for_each(|(signum, action)| install(*signum, action))
}

fn ignore(signum: c_int) -> io::Result<()> {
    // SAFETY: zeroed is a valid sigaction; SIG_IGN is valid for every signal in IGNORED.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = libc::SIG_IGN;
    // SAFETY: `sa_mask` is a live sigset_t.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    install(signum, &action)
}

fn restore(saved: &Actions) {
    for (signum, previous) in saved.iter().rev() {
        let _ = install(*signum, previous);
    }
}
