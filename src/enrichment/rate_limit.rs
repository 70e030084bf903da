//! Provider rate-limit circuit breaker.
//!
//! `Idle -> Limited` on every HTTP 429. The penalty is
//! `max(Retry-After, base * 2^min(strikes, cap))`, capped at `max`.
//! `Limited -> Idle` once the window elapses; strikes decay one step per
//! recovery window without a new hit. Above the strike threshold callers are
//! told to fail fast instead of queueing behind the window.

use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::config::EnrichmentConfig;
use crate::protocol::RateLimitState;

const STATE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub base_ms: i64,
    pub max_ms: i64,
    pub strike_cap: u32,
    pub strike_threshold: u32,
    pub decay_ms: i64,
}

impl BreakerSettings {
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            base_ms: config.rate_limit_base_ms.min(i64::MAX as u64) as i64,
            max_ms: config.rate_limit_max_ms.min(i64::MAX as u64) as i64,
            strike_cap: config.strike_cap.min(30),
            strike_threshold: config.strike_threshold,
            decay_ms: config.strike_decay_ms.max(1).min(i64::MAX as u64) as i64,
        }
    }
}

/// What a caller may do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    Wait { delay_ms: i64 },
    FailFast { until: i64 },
}

pub struct RateLimitBreaker {
    settings: BreakerSettings,
    state: RateLimitState,
    decay_anchor: Option<i64>,
    notifier: Sender<RateLimitState>,
}

impl RateLimitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let (notifier, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        Self {
            settings,
            state: RateLimitState::default(),
            decay_anchor: None,
            notifier,
        }
    }

    /// Receives every state change from now on.
    pub fn subscribe(&self) -> Receiver<RateLimitState> {
        self.notifier.subscribe()
    }

    pub fn snapshot(&self) -> RateLimitState {
        self.state
    }

    pub fn penalty_delay_ms(&self, strikes: u32, retry_after_ms: Option<i64>) -> i64 {
        let exponent = strikes.min(self.settings.strike_cap).min(62);
        let backoff = self
            .settings
            .base_ms
            .max(0)
            .saturating_mul(1i64 << exponent);
        backoff
            .max(retry_after_ms.unwrap_or(0).max(0))
            .min(self.settings.max_ms.max(0))
    }

    fn publish(&self) {
        let _ = self.notifier.send(self.state);
    }

    fn apply_decay(&mut self, now: i64) -> bool {
        if self.state.strikes == 0 {
            return false;
        }
        let Some(anchor) = self.decay_anchor.or(self.state.last_hit_at) else {
            return false;
        };
        let elapsed = now.saturating_sub(anchor);
        if elapsed < self.settings.decay_ms {
            return false;
        }
        let steps = elapsed / self.settings.decay_ms;
        let decayed = steps.min(i64::from(self.state.strikes)) as u32;
        self.state.strikes -= decayed;
        self.decay_anchor = Some(anchor.saturating_add(steps.saturating_mul(self.settings.decay_ms)));
        decayed > 0
    }

    /// Closes an elapsed window and decays strikes. Returns whether state changed.
    pub fn refresh(&mut self, now: i64) -> bool {
        let mut changed = false;
        if self.state.active && now >= self.state.until {
            self.state.active = false;
            changed = true;
        }
        changed |= self.apply_decay(now);
        if changed {
            self.publish();
        }
        changed
    }

    /// Registers a 429 and returns the penalty delay applied.
    pub fn record_rate_limited(&mut self, now: i64, status: u16, retry_after_ms: Option<i64>) -> i64 {
        self.apply_decay(now);
        self.state.strikes = self.state.strikes.saturating_add(1);
        let delay_ms = self.penalty_delay_ms(self.state.strikes, retry_after_ms);
        let until = now.saturating_add(delay_ms);
        self.state.active = true;
        self.state.until = if self.state.until > now {
            self.state.until.max(until)
        } else {
            until
        };
        self.state.retry_after_ms = delay_ms;
        self.state.last_status = Some(status);
        self.state.last_hit_at = Some(now);
        self.decay_anchor = Some(now);
        self.publish();
        delay_ms
    }

    pub fn record_status(&mut self, now: i64, status: u16) {
        self.state.last_status = Some(status);
        self.refresh(now);
    }

    pub fn admission(&mut self, now: i64) -> Admission {
        self.refresh(now);
        if !self.state.active {
            return Admission::Proceed;
        }
        if self.state.strikes > self.settings.strike_threshold {
            return Admission::FailFast {
                until: self.state.until,
            };
        }
        Admission::Wait {
            delay_ms: self.state.until.saturating_sub(now).max(0),
        }
    }
}
