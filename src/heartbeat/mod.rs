//! Liveness probing of a connected session.
//!
//! The [`Monitor`] is pure bookkeeping driven by the session's heartbeat
//! task: it decides when the next probe is due, when a probe missed its
//! deadline and when enough probes missed in a row to declare the peer dead.
//! The frames themselves come from a [`HeartbeatProbe`].

mod probe;

pub use probe::{Beat, HeartbeatProbe, SilentProbe};

use std::time::Duration;

use snafu::prelude::*;
use tokio::time::Instant;

use crate::config::{
    error, ConfigError, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HEARTBEAT_TIMEOUT,
    DEFAULT_MAX_MISSED_BEATS,
};

/// Adaptive interval settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adaptive {
    /// lower bound of the probe interval
    pub min_interval: Duration,
    /// upper bound of the probe interval
    pub max_interval: Duration,
    /// weight of a new round trip sample in the moving average, in (0, 1]
    pub smoothing: f64,
}

impl Default for Adaptive {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(60),
            smoothing: 0.2,
        }
    }
}

/// Heartbeat settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatConfig {
    /// time between probes
    pub interval: Duration,
    /// time a probe waits for its answer
    pub timeout: Duration,
    /// consecutive misses that drop the connection
    pub max_missed_beats: u32,
    /// move the interval with observed latency
    pub adaptive: Option<Adaptive>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_missed_beats: DEFAULT_MAX_MISSED_BEATS,
            adaptive: None,
        }
    }
}

impl HeartbeatConfig {
    /// Fixed interval config
    pub fn new(interval: Duration, timeout: Duration, max_missed_beats: u32) -> Self {
        Self {
            interval,
            timeout,
            max_missed_beats,
            adaptive: None,
        }
    }

    /// Enable adaptive interval
    pub fn adaptive(mut self, adaptive: Adaptive) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Check parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            !self.interval.is_zero(),
            error::InvalidHeartbeat {
                reason: "interval is zero"
            }
        );
        ensure!(
            !self.timeout.is_zero(),
            error::InvalidHeartbeat {
                reason: "timeout is zero"
            }
        );
        ensure!(
            self.max_missed_beats >= 1,
            error::InvalidHeartbeat {
                reason: "max missed beats is zero"
            }
        );
        if let Some(adaptive) = &self.adaptive {
            ensure!(
                !adaptive.min_interval.is_zero() && adaptive.min_interval <= adaptive.max_interval,
                error::InvalidHeartbeat {
                    reason: "adaptive interval bounds are empty"
                }
            );
            ensure!(
                adaptive.smoothing > 0.0 && adaptive.smoothing <= 1.0,
                error::InvalidHeartbeat {
                    reason: format!("smoothing {} is not in (0, 1]", adaptive.smoothing)
                }
            );
        }
        Ok(())
    }
}

/// What the heartbeat task should do after [`Monitor::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// nothing due yet
    Idle,
    /// write a probe now
    Probe,
    /// a probe missed its deadline, carries consecutive misses
    Missed(u32),
    /// too many misses, the connection is dead
    Expired,
}

/// Heartbeat state of one session.
#[derive(Debug, Clone)]
pub struct Monitor {
    config: HeartbeatConfig,
    timeout: Duration,
    current_interval: Duration,
    last_sent_at: Option<Instant>,
    last_ack_at: Instant,
    deadline: Option<Instant>,
    consecutive_misses: u32,
    rtt_average: Option<Duration>,
}

impl Monitor {
    /// Create a monitor, the session starts at `now`
    pub fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            timeout: config.timeout,
            current_interval: config.interval,
            last_sent_at: None,
            last_ack_at: now,
            deadline: None,
            consecutive_misses: 0,
            rtt_average: None,
        }
    }

    /// Start over for a new session
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(self.config, now);
    }

    /// Replace interval and timeout, e.g. from a protocol handshake
    pub fn reconfigure(&mut self, interval: Duration, timeout: Duration) {
        log::debug!(
            "Heartbeat reconfigured, interval {:?}, timeout {:?}",
            interval,
            timeout
        );

        self.config.interval = interval;
        self.config.timeout = timeout;
        self.timeout = timeout;
        self.current_interval = self.clamp(interval);
    }

    fn clamp(&self, interval: Duration) -> Duration {
        match &self.config.adaptive {
            Some(a) => interval.clamp(a.min_interval, a.max_interval),
            None => interval,
        }
    }

    /// current probe interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// current probe timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// consecutive unanswered probes
    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses
    }

    /// when the last probe was written
    pub fn last_sent_at(&self) -> Option<Instant> {
        self.last_sent_at
    }

    /// when the peer last proved alive
    pub fn last_ack_at(&self) -> Instant {
        self.last_ack_at
    }

    /// smoothed round trip time
    pub fn round_trip(&self) -> Option<Duration> {
        self.rtt_average
    }

    fn next_probe_at(&self) -> Instant {
        let base = match self.last_sent_at {
            Some(sent) => sent.max(self.last_ack_at),
            None => self.last_ack_at,
        };
        base + self.current_interval
    }

    /// When the heartbeat task must call [`poll`](Self::poll) next
    pub fn next_wakeup(&self) -> Instant {
        self.deadline.unwrap_or_else(|| self.next_probe_at())
    }

    /// Advance to `now`
    pub fn poll(&mut self, now: Instant) -> Action {
        if let Some(deadline) = self.deadline {
            if now < deadline {
                return Action::Idle;
            }

            self.deadline = None;
            self.consecutive_misses += 1;

            if let Some(adaptive) = &self.config.adaptive {
                self.current_interval = (self.current_interval / 2).max(adaptive.min_interval);
                log::trace!("Heartbeat interval shrink to {:?}", self.current_interval);
            }

            if self.consecutive_misses >= self.config.max_missed_beats {
                return Action::Expired;
            }
            return Action::Missed(self.consecutive_misses);
        }

        if now >= self.next_probe_at() {
            self.last_sent_at = Some(now);
            self.deadline = Some(now + self.timeout);
            return Action::Probe;
        }

        Action::Idle
    }

    /// Peer proved alive. Returns the round trip when the proof answers an open probe.
    pub fn acknowledge(&mut self, now: Instant) -> Option<Duration> {
        let rtt = match (self.deadline.take(), self.last_sent_at) {
            (Some(_), Some(sent)) => Some(now.saturating_duration_since(sent)),
            _ => None,
        };

        self.last_ack_at = now;
        self.consecutive_misses = 0;

        if let Some(rtt) = rtt {
            self.adapt(rtt);
        }

        rtt
    }

    fn adapt(&mut self, rtt: Duration) {
        let adaptive = match self.config.adaptive {
            Some(a) => a,
            None => return,
        };

        let average = match self.rtt_average {
            Some(avg) => avg.mul_f64(1.0 - adaptive.smoothing) + rtt.mul_f64(adaptive.smoothing),
            None => rtt,
        };
        self.rtt_average = Some(average);

        // latency close to the timeout pulls the interval down to min, idle links drift to max
        let pressure = (average.as_secs_f64() / self.timeout.as_secs_f64()).clamp(0.0, 1.0);
        let span = adaptive.max_interval.saturating_sub(adaptive.min_interval);
        let target = adaptive.max_interval.saturating_sub(span.mul_f64(pressure));

        let current = self.current_interval.as_secs_f64();
        let next = current + (target.as_secs_f64() - current) * adaptive.smoothing;
        self.current_interval = self.clamp(Duration::from_secs_f64(next.max(0.0)));

        log::trace!(
            "Heartbeat rtt average {:?}, interval {:?}",
            average,
            self.current_interval
        );
    }
}
