// ABOUTME: Restart pacing for the tunnel client
//
// `RestartPolicy` keeps the times of recent restart attempts in a sliding
// window. It caps how many attempts the window may hold and spaces them out:
// the Nth attempt inside the window waits `base * 2^(N-1)`, capped at `max`.
// Once old attempts age out the delay shrinks again. Times come from the
// monotonic tokio clock.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use super::error::LaunchError;
use crate::config::ClientSettings;

/// Sliding-window cap and delay schedule for restart attempts
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_restarts: u32,
    window: Duration,
    base_delay: Duration,
    max_delay: Duration,
    attempts: VecDeque<Instant>,
}

impl RestartPolicy {
    /// Policy from the `[client]` restart settings
    pub const fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            max_restarts: settings.max_restarts,
            window: settings.restart_window,
            base_delay: settings.backoff_base,
            max_delay: settings.backoff_max,
            attempts: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.attempts.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Attempts still inside the window at `now`
    pub fn recent_attempts(&mut self, now: Instant) -> u32 {
        self.prune(now);
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Record a restart attempt at `now`, returning its 1-based number in the window.
    ///
    /// Fails with `CrashLoop` once the window already holds `max_restarts`
    /// attempts; the rejected attempt is not recorded.
    pub fn record_attempt(&mut self, now: Instant) -> Result<u32, LaunchError> {
        let recent = self.recent_attempts(now);
        if recent >= self.max_restarts {
            return Err(LaunchError::CrashLoop { attempts: recent });
        }
        self.attempts.push_back(now);
        Ok(recent + 1)
    }

    /// Delay before the `attempt`th restart in the window
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    /// Forget all recorded attempts
    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    /// Configured cap
    pub const fn max_restarts(&self) -> u32 {
        self.max_restarts
    }
}
