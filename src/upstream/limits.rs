use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Token-bucket rate limiter. `try_acquire` never blocks; callers degrade to
/// "no data" when no token is available.
///
/// Takes `now` explicitly so behavior is testable without sleeping.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    /// Short-circuiting since the given instant.
    Open(Instant),
    /// One trial call in flight; further calls are rejected until it
    /// reports back.
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// After `failure_threshold` consecutive failures the breaker opens and
/// rejects every call for `recovery_timeout`; the first call after the
/// window becomes the half-open trial. A successful call (trial or not)
/// fully closes the breaker; a failed trial re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    consecutive_failures: u32,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            consecutive_failures: 0,
            state: BreakerState::Closed,
        }
    }

    /// Whether a call may proceed. Transitions `Open → HalfOpen` when the
    /// recovery window has elapsed; the caller owning that `true` is the
    /// trial call.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open(since) => {
                if now.saturating_duration_since(since) >= self.recovery_timeout {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        if self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= self.failure_threshold
        {
            self.state = BreakerState::Open(now);
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open(_))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
