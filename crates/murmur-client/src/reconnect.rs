use std::time::Duration;

use murmur_core::CloseReason;

use crate::config::ReconnectConfig;

/// What the connection should do after a close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Schedule attempt number `attempt` after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Retries are exhausted; the connection is terminal.
    GiveUp { attempts: u32 },
    /// Do nothing: the close was intentional, or an attempt is already pending.
    Stay,
}

/// Bounded exponential backoff for reattaching after abnormal closes.
///
/// Pure state; the connection driver owns the timer. Each abnormal close
/// (including a failed attempt) increments the counter and doubles the
/// delay, capped at `max_delay`. A successful open resets it.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
    last_delay: Option<Duration>,
    pending: bool,
    open: bool,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last_delay: None,
            pending: false,
            open: false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// `min(base * 2^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// The connection (re)attached.
    pub fn on_open(&mut self) {
        if self.attempt > 0 {
            tracing::info!(after_attempts = self.attempt, "reconnected");
        }
        self.attempt = 0;
        self.last_delay = None;
        self.pending = false;
        self.open = true;
    }

    /// The connection closed, or an attempt to open it failed.
    pub fn on_close(&mut self, reason: CloseReason) -> ReconnectDecision {
        self.open = false;

        if reason == CloseReason::Normal {
            self.reset();
            return ReconnectDecision::Stay;
        }
        if self.pending {
            return ReconnectDecision::Stay;
        }
        if self.attempt >= self.config.max_attempts {
            tracing::warn!(attempts = self.attempt, "reconnect attempts exhausted");
            return ReconnectDecision::GiveUp {
                attempts: self.attempt,
            };
        }

        self.attempt += 1;
        let delay = self.delay_for(self.attempt);
        self.last_delay = Some(delay);
        self.pending = true;
        tracing::info!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        ReconnectDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// The retry timer fired. Returns `false` when no attempt should start.
    pub fn begin_attempt(&mut self) -> bool {
        if self.open || !self.pending {
            return false;
        }
        self.pending = false;
        true
    }

    /// Intentional close: drop any pending retry and all counters.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = None;
        self.pending = false;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}
