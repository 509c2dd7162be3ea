//! Per-provider call budgets
//!
//! A fixed window counter: calls recorded so far in the current window are
//! compared against the limit before a request is attempted.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct WindowState {
    started: Instant,
    calls: u32,
}

#[derive(Debug)]
pub struct RateBudget {
    limit: u32,
    window: Duration,
    state: Mutex<WindowState>,
}

impl RateBudget {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                started: Instant::now(),
                calls: 0,
            }),
        }
    }

    /// Record a call if the window still has room
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        roll_window(&mut state, self.window, now);

        if state.calls >= self.limit {
            return false;
        }
        state.calls += 1;
        true
    }
}

fn roll_window(state: &mut WindowState, window: Duration, now: Instant) {
    if now.saturating_duration_since(state.started) >= window {
        state.started = now;
        state.calls = 0;
    }
}
