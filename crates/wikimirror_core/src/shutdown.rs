use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

use crate::error::FetchError;

/// Cooperative cancellation flag shared by the orchestrator, the rate limiter and the
/// retry backoff. Every wait in the crawl goes through [`ShutdownSignal::sleep`] so a
/// trigger wakes it immediately.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, wake) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `duration` unless the signal fires first.
    pub fn sleep(&self, duration: Duration) -> Result<(), FetchError> {
        let deadline = Instant::now() + duration;
        let (flag, wake) = &*self.inner;
        let mut triggered = flag.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *triggered {
                return Err(FetchError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            triggered = wake
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Route SIGINT/SIGTERM into this signal. A second signal exits immediately.
    pub fn install_ctrlc(&self) -> Result<()> {
        let signal = self.clone();
        ctrlc::set_handler(move || {
            if signal.is_triggered() {
                std::process::exit(130);
            }
            warn!("shutdown requested; abandoning the in-flight batch");
            signal.trigger();
        })
        .context("failed to install shutdown signal handler")
    }
}
