use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::FetchError;
use crate::shutdown::ShutdownSignal;

const GATE_POLL: Duration = Duration::from_millis(50);

/// Interval gate plus concurrency ceiling shared by every worker. Start times are
/// reserved under the lock, so the aggregate request rate never exceeds one request per
/// `min_interval` no matter how many threads ask.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    max_concurrent: usize,
    state: Mutex<LimiterState>,
    released: Condvar,
    shutdown: ShutdownSignal,
}

#[derive(Debug)]
struct LimiterState {
    next_slot: Option<Instant>,
    suspended_until: Option<Instant>,
    in_flight: usize,
}

/// Held for the duration of one HTTP request.
#[derive(Debug)]
pub struct Permit<'a> {
    limiter: &'a RateLimiter,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = self.limiter.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.limiter.released.notify_one();
    }
}

impl RateLimiter {
    pub fn new(min_interval: Duration, max_concurrent: usize, shutdown: ShutdownSignal) -> Self {
        Self {
            min_interval,
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(LimiterState {
                next_slot: None,
                suspended_until: None,
                in_flight: 0,
            }),
            released: Condvar::new(),
            shutdown,
        }
    }

    pub fn acquire(&self) -> Result<Permit<'_>, FetchError> {
        let start_at = {
            let mut state = self.lock_state();
            while state.in_flight >= self.max_concurrent {
                if self.shutdown.is_triggered() {
                    return Err(FetchError::Cancelled);
                }
                state = self
                    .released
                    .wait_timeout(state, GATE_POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            if self.shutdown.is_triggered() {
                return Err(FetchError::Cancelled);
            }
            state.in_flight += 1;
            reserve_slot(&mut state, Instant::now(), self.min_interval)
        };
        let permit = Permit { limiter: self };

        let mut wake_at = start_at;
        loop {
            let now = Instant::now();
            if wake_at > now {
                self.shutdown.sleep(wake_at - now)?;
            }
            // A throttle signal may have arrived while this request was waiting. The
            // waiters queue up behind it again one interval apart.
            let mut state = self.lock_state();
            let now = Instant::now();
            match state.suspended_until {
                Some(until) if until > now => {
                    wake_at = reserve_slot(&mut state, now, self.min_interval);
                }
                _ => break,
            }
        }
        Ok(permit)
    }

    /// Hold back every outgoing request for at least `duration`.
    pub fn suspend(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.lock_state();
        if state.suspended_until.is_none_or(|current| current < until) {
            debug!("suspending outgoing requests for {} ms", duration.as_millis());
            state.suspended_until = Some(until);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock_state().in_flight
    }

    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reserve_slot(state: &mut LimiterState, now: Instant, min_interval: Duration) -> Instant {
    let mut slot = now;
    if let Some(next) = state.next_slot {
        slot = slot.max(next);
    }
    if let Some(until) = state.suspended_until {
        slot = slot.max(until);
    }
    state.next_slot = Some(slot + min_interval);
    slot
}
