//! Reconnection policies and the retry bookkeeping of one connection.

use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;
use snafu::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{error, ConfigError},
    state::DisconnectReason,
    transport::TransportError,
};

/// A backoff strategy: how long to wait before attempt number `attempt`.
///
/// `attempt` is zero based and counts attempts of the current disconnect
/// episode. Returning `None` stops retrying.
pub trait Backoff: Send + Sync {
    /// compute the delay before the next attempt
    fn next_delay(&self, attempt: u32, last_error: Option<&TransportError>) -> Option<Duration>;
}

impl<F> Backoff for F
where
    F: Fn(u32, Option<&TransportError>) -> Option<Duration> + Send + Sync,
{
    fn next_delay(&self, attempt: u32, last_error: Option<&TransportError>) -> Option<Duration> {
        self(attempt, last_error)
    }
}

/// Built-in backoff strategies
#[derive(Clone)]
pub enum Strategy {
    /// retry right away
    Immediate,
    /// same delay every time
    Fixed {
        /// delay
        interval: Duration,
    },
    /// `initial + step * attempt`, capped
    Linear {
        /// delay of attempt zero
        initial: Duration,
        /// added per attempt
        step: Duration,
        /// cap
        max: Duration,
    },
    /// `min(base * multiplier ^ attempt, max)` with symmetric jitter
    Exponential {
        /// delay of attempt zero
        base: Duration,
        /// growth factor
        multiplier: f64,
        /// cap
        max: Duration,
        /// jitter range as a fraction of the delay
        jitter_ratio: f64,
    },
    /// `base * fib(attempt + 1)`, capped
    Fibonacci {
        /// unit delay
        base: Duration,
        /// cap
        max: Duration,
    },
    /// user provided
    Custom(Arc<dyn Backoff>),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate => f.write_str("Immediate"),
            Self::Fixed { interval } => f.debug_struct("Fixed").field("interval", interval).finish(),
            Self::Linear { initial, step, max } => f
                .debug_struct("Linear")
                .field("initial", initial)
                .field("step", step)
                .field("max", max)
                .finish(),
            Self::Exponential {
                base,
                multiplier,
                max,
                jitter_ratio,
            } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max", max)
                .field("jitter_ratio", jitter_ratio)
                .finish(),
            Self::Fibonacci { base, max } => f
                .debug_struct("Fibonacci")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// A backoff strategy plus a retry budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    strategy: Strategy,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            max_attempts: None,
        }
    }

    /// Retry without delay
    pub fn immediate() -> Self {
        Self::with_strategy(Strategy::Immediate)
    }

    /// Retry every `interval`
    pub fn fixed(interval: Duration) -> Self {
        Self::with_strategy(Strategy::Fixed { interval })
    }

    /// Retry after `initial + step * attempt`, never more than `max`
    pub fn linear(initial: Duration, step: Duration, max: Duration) -> Self {
        Self::with_strategy(Strategy::Linear { initial, step, max })
    }

    /// Retry after `base * multiplier ^ attempt`, never more than `max`, no jitter
    pub fn exponential(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self::with_strategy(Strategy::Exponential {
            base,
            multiplier,
            max,
            jitter_ratio: 0.0,
        })
    }

    /// Retry after `base` times the fibonacci sequence, never more than `max`
    pub fn fibonacci(base: Duration, max: Duration) -> Self {
        Self::with_strategy(Strategy::Fibonacci { base, max })
    }

    /// Use a custom backoff function
    pub fn custom<B: Backoff + 'static>(backoff: B) -> Self {
        Self::with_strategy(Strategy::Custom(Arc::new(backoff)))
    }

    /// Set jitter ratio of an exponential policy, other strategies ignore it
    pub fn jitter(mut self, ratio: f64) -> Self {
        if let Strategy::Exponential {
            ref mut jitter_ratio,
            ..
        } = self.strategy
        {
            *jitter_ratio = ratio;
        }
        self
    }

    /// Stop after this many attempts in one disconnect episode
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// the strategy
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Check parameters, called by builders before any connect
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.strategy {
            Strategy::Linear { initial, max, .. } => {
                ensure!(
                    initial <= max,
                    error::InvalidBackoff {
                        reason: "linear initial delay is larger than max delay"
                    }
                );
            }
            Strategy::Exponential {
                base,
                multiplier,
                max,
                jitter_ratio,
            } => {
                ensure!(
                    multiplier.is_finite() && *multiplier >= 1.0,
                    error::InvalidBackoff {
                        reason: format!("multiplier {} is not a finite number >= 1", multiplier)
                    }
                );
                ensure!(
                    jitter_ratio.is_finite() && (0.0..=1.0).contains(jitter_ratio),
                    error::InvalidBackoff {
                        reason: format!("jitter ratio {} is not in [0, 1]", jitter_ratio)
                    }
                );
                ensure!(
                    base <= max,
                    error::InvalidBackoff {
                        reason: "exponential base delay is larger than max delay"
                    }
                );
                ensure!(
                    !base.is_zero(),
                    error::InvalidBackoff {
                        reason: "exponential base delay is zero"
                    }
                );
            }
            Strategy::Fibonacci { base, max } => {
                ensure!(
                    base <= max,
                    error::InvalidBackoff {
                        reason: "fibonacci base delay is larger than max delay"
                    }
                );
            }
            Strategy::Immediate | Strategy::Fixed { .. } | Strategy::Custom(_) => {}
        }

        ensure!(
            self.max_attempts != Some(0),
            error::InvalidBackoff {
                reason: "max attempts is zero"
            }
        );

        Ok(())
    }

    /// delay before jitter is applied
    pub fn base_delay(&self, attempt: u32, last_error: Option<&TransportError>) -> Option<Duration> {
        if matches!(self.max_attempts, Some(max) if attempt >= max) {
            return None;
        }

        let delay = match &self.strategy {
            Strategy::Immediate => Duration::ZERO,
            Strategy::Fixed { interval } => *interval,
            Strategy::Linear { initial, step, max } => step
                .checked_mul(attempt)
                .and_then(|d| d.checked_add(*initial))
                .map_or(*max, |d| d.min(*max)),
            Strategy::Exponential {
                base,
                multiplier,
                max,
                ..
            } => {
                // powi saturates to inf for big exponents, min brings it back to max
                let exp = attempt.min(i32::MAX as u32) as i32;
                let secs = (base.as_secs_f64() * multiplier.powi(exp)).min(max.as_secs_f64());
                // max itself may be too big to round trip through f64
                Duration::try_from_secs_f64(secs).unwrap_or(*max)
            }
            Strategy::Fibonacci { base, max } => {
                let n = fibonacci(attempt.saturating_add(1));
                u32::try_from(n)
                    .ok()
                    .and_then(|n| base.checked_mul(n))
                    .map_or(*max, |d| d.min(*max))
            }
            Strategy::Custom(backoff) => return backoff.next_delay(attempt, last_error),
        };

        Some(delay)
    }
}

impl Backoff for ReconnectPolicy {
    fn next_delay(&self, attempt: u32, last_error: Option<&TransportError>) -> Option<Duration> {
        let delay = self.base_delay(attempt, last_error)?;

        if let Strategy::Exponential { jitter_ratio, .. } = self.strategy {
            if jitter_ratio > 0.0 {
                let secs = delay.as_secs_f64();
                let spread = secs * jitter_ratio;
                let jitter = rand::rng().random_range(-spread..=spread);
                return Some(
                    Duration::try_from_secs_f64((secs + jitter).max(0.0)).unwrap_or(delay),
                );
            }
        }

        Some(delay)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// What to do after a connection dropped
#[derive(Debug)]
pub(crate) enum Plan {
    /// reason is not eligible or no policy is configured
    Stop,
    /// policy returned none
    Exhausted {
        /// attempts made in this episode
        attempts: u32,
    },
    /// schedule an attempt
    Retry {
        attempt: u32,
        delay: Duration,
        ticket: u64,
        token: CancellationToken,
    },
}

/// Retry counter and the scheduled attempt of one connection.
#[derive(Debug)]
pub(crate) struct Reconnector {
    policy: Option<ReconnectPolicy>,
    attempt: u32,
    tickets: u64,
    pending: Option<(u64, CancellationToken)>,
}

impl Reconnector {
    pub fn new(policy: Option<ReconnectPolicy>) -> Self {
        Self {
            policy,
            attempt: 0,
            tickets: 0,
            pending: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// called on entry to connected
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.pending = None;
    }

    pub fn plan(&mut self, reason: DisconnectReason, last_error: Option<&TransportError>) -> Plan {
        let policy = match &self.policy {
            Some(p) if reason.is_recoverable() => p,
            _ => return Plan::Stop,
        };

        let attempt = self.attempt;
        let delay = match policy.next_delay(attempt, last_error) {
            Some(d) => d,
            None => return Plan::Exhausted { attempts: attempt },
        };

        self.attempt += 1;
        self.tickets += 1;

        let token = CancellationToken::new();
        self.pending = Some((self.tickets, token.clone()));

        Plan::Retry {
            attempt,
            delay,
            ticket: self.tickets,
            token,
        }
    }

    /// Cancel the scheduled attempt, true if there was one
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Claim the scheduled attempt for firing, false if it was cancelled or replaced
    pub fn claim(&mut self, ticket: u64) -> bool {
        match &self.pending {
            Some((pending, token)) if *pending == ticket && !token.is_cancelled() => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_exponential_doubles_then_clamps() {
        let policy = ReconnectPolicy::exponential(secs(1), 2.0, secs(60));
        let delays: Vec<_> = (0..9)
            .map(|a| policy.next_delay(a, None).unwrap())
            .collect();

        assert_eq!(
            delays,
            vec![
                secs(1),
                secs(2),
                secs(4),
                secs(8),
                secs(16),
                secs(32),
                secs(60),
                secs(60),
                secs(60)
            ]
        );
        assert_eq!(policy.next_delay(u32::MAX, None), Some(secs(60)));
    }

    #[test]
    fn test_exponential_jitter_stays_in_range() {
        let policy = ReconnectPolicy::exponential(secs(1), 2.0, secs(60)).jitter(0.5);
        policy.validate().unwrap();

        for attempt in 0..8 {
            let base = policy.base_delay(attempt, None).unwrap().as_secs_f64();
            for _ in 0..50 {
                let d = policy.next_delay(attempt, None).unwrap().as_secs_f64();
                assert!(d >= base * 0.5 - 1e-9 && d <= base * 1.5 + 1e-9, "{} vs {}", d, base);
            }
        }
    }

    #[test]
    fn test_exponential_with_unbounded_max() {
        let policy = ReconnectPolicy::exponential(secs(1), 2.0, Duration::MAX);
        policy.validate().unwrap();
        assert_eq!(policy.next_delay(3, None), Some(secs(8)));
        assert_eq!(policy.next_delay(70, None), Some(Duration::MAX));
        assert_eq!(policy.next_delay(u32::MAX, None), Some(Duration::MAX));

        let policy = policy.jitter(0.5);
        for attempt in 60..80 {
            assert!(policy.next_delay(attempt, None).is_some());
        }
    }

    #[test]
    fn test_fixed_linear_fibonacci() {
        let fixed = ReconnectPolicy::fixed(secs(3));
        assert_eq!(fixed.next_delay(0, None), Some(secs(3)));
        assert_eq!(fixed.next_delay(10, None), Some(secs(3)));

        let linear = ReconnectPolicy::linear(secs(1), secs(2), secs(6));
        let delays: Vec<_> = (0..5).map(|a| linear.next_delay(a, None).unwrap()).collect();
        assert_eq!(delays, vec![secs(1), secs(3), secs(5), secs(6), secs(6)]);

        let fib = ReconnectPolicy::fibonacci(secs(1), secs(10));
        let delays: Vec<_> = (0..8).map(|a| fib.next_delay(a, None).unwrap()).collect();
        assert_eq!(
            delays,
            vec![secs(1), secs(1), secs(2), secs(3), secs(5), secs(8), secs(10), secs(10)]
        );

        assert_eq!(
            ReconnectPolicy::immediate().next_delay(7, None),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_max_attempts_stops() {
        let policy = ReconnectPolicy::fixed(secs(1)).max_attempts(2);
        assert!(policy.next_delay(0, None).is_some());
        assert!(policy.next_delay(1, None).is_some());
        assert!(policy.next_delay(2, None).is_none());
    }

    #[test]
    fn test_custom_policy() {
        let policy = ReconnectPolicy::custom(|attempt: u32, _: Option<&TransportError>| {
            (attempt < 1).then(|| Duration::from_millis(5))
        });
        assert_eq!(policy.next_delay(0, None), Some(Duration::from_millis(5)));
        assert_eq!(policy.next_delay(1, None), None);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert!(ReconnectPolicy::exponential(secs(1), 0.5, secs(60))
            .validate()
            .is_err());
        assert!(ReconnectPolicy::exponential(secs(1), f64::NAN, secs(60))
            .validate()
            .is_err());
        assert!(ReconnectPolicy::exponential(secs(1), 2.0, secs(60))
            .jitter(1.5)
            .validate()
            .is_err());
        assert!(ReconnectPolicy::exponential(secs(90), 2.0, secs(60))
            .validate()
            .is_err());
        assert!(ReconnectPolicy::linear(secs(9), secs(1), secs(2))
            .validate()
            .is_err());
        assert!(ReconnectPolicy::fixed(secs(1))
            .max_attempts(0)
            .validate()
            .is_err());
        assert!(ReconnectPolicy::exponential(secs(1), 2.0, secs(60))
            .jitter(0.2)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_reconnector_counts_and_resets() {
        let mut r = Reconnector::new(Some(ReconnectPolicy::fixed(secs(1))));

        for expected in 0..3 {
            match r.plan(DisconnectReason::Error, None) {
                Plan::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected plan {:?}", other),
            }
        }
        assert_eq!(r.attempt(), 3);

        r.reset();
        assert_eq!(r.attempt(), 0);

        assert!(matches!(
            r.plan(DisconnectReason::UserInitiated, None),
            Plan::Stop
        ));
        assert_eq!(r.attempt(), 0);
    }

    #[test]
    fn test_reconnector_cancel_blocks_claim() {
        let mut r = Reconnector::new(Some(ReconnectPolicy::immediate()));
        let (ticket, token) = match r.plan(DisconnectReason::RemoteClosed, None) {
            Plan::Retry { ticket, token, .. } => (ticket, token),
            other => panic!("unexpected plan {:?}", other),
        };

        assert!(r.cancel());
        assert!(token.is_cancelled());
        assert!(!r.claim(ticket));
        assert!(!r.cancel());
    }

    #[test]
    fn test_reconnector_claim_once() {
        let mut r = Reconnector::new(Some(ReconnectPolicy::immediate()));
        let ticket = match r.plan(DisconnectReason::Error, None) {
            Plan::Retry { ticket, .. } => ticket,
            other => panic!("unexpected plan {:?}", other),
        };

        assert!(r.claim(ticket));
        assert!(!r.claim(ticket));
    }

    #[test]
    fn test_reconnector_exhausted() {
        let mut r = Reconnector::new(Some(ReconnectPolicy::immediate().max_attempts(1)));
        assert!(matches!(
            r.plan(DisconnectReason::Error, None),
            Plan::Retry { .. }
        ));
        assert!(matches!(
            r.plan(DisconnectReason::Error, None),
            Plan::Exhausted { attempts: 1 }
        ));
    }
}
