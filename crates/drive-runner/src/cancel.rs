//! Cooperative cancellation observed at every blocking point of the driver.
//!
//! A token trips either when `cancel()` is called on any clone, or, for
//! tokens built with [`CancelToken::with_interrupts`], when the process
//! receives SIGINT or SIGTERM.

use crate::error::EvalError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    watch_interrupts: bool,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also trips on SIGINT/SIGTERM. Installs the process-wide
    /// handlers; calling it more than once is harmless.
    pub fn with_interrupts() -> anyhow::Result<Self> {
        install_interrupt_handlers()?;
        Ok(Self {
            flag: Arc::new(AtomicBool::new(false)),
            watch_interrupts: true,
        })
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || (self.watch_interrupts && INTERRUPTED.load(Ordering::SeqCst))
    }

    pub fn check(&self) -> Result<(), EvalError> {
        if self.is_cancelled() {
            Err(EvalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Cancelled` if the token trips.
    pub fn sleep(&self, duration: Duration) -> Result<(), EvalError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_interrupt_handlers() -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to a static atomic.
        unsafe { sigaction(signal, &action) }
            .map_err(|e| anyhow::anyhow!("failed to install {:?} handler: {}", signal, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_interrupt_handlers() -> anyhow::Result<()> {
    Ok(())
}
