//! Retry with bounded exponential backoff and per-resource circuit breaking.
//!
//! The breaker observes only terminal outcomes: a success after retries
//! records one success, a failure after retries exhaust records one failure.
//! Individual retried attempts never move the breaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cascade_types::{CascadeError, Result};

// ---------------------------------------------------------------------------
// Backoff and retry policy
// ---------------------------------------------------------------------------

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed), without
    /// jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = base.as_millis() as u64 * 2u64.saturating_pow(attempt as u32);
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// How a node invocation retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: usize,
    pub backoff: BackoffPolicy,
    /// Randomize each delay by 0.8x to 1.2x so synchronized retries spread out.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.backoff.delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Per-resource circuit breaker. Opens after `failure_threshold` consecutive
/// terminal failures; after `cooldown` elapses a single trial invocation is
/// admitted. Trial success closes the circuit, trial failure reopens it for
/// another full cooldown. A trial that ends without an outcome releases the
/// slot (see [`Admission`]).
#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    failure_threshold: u32,
    cooldown: Duration,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since `epoch` when the circuit last opened.
    opened_at_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            resource: resource.into(),
            failure_threshold,
            cooldown,
            state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn cooldown_remaining_ms(&self) -> u64 {
        let opened = self.opened_at_ms.load(Ordering::SeqCst);
        let elapsed = self.now_ms().saturating_sub(opened);
        (self.cooldown.as_millis() as u64).saturating_sub(elapsed)
    }

    /// Admit or reject an invocation. While open, invocations fail fast until
    /// the cooldown elapses; then exactly one caller wins the half-open trial
    /// slot and the rest keep failing fast.
    pub fn admit(&self) -> Result<Admission<'_>> {
        match self.state.load(Ordering::SeqCst) {
            STATE_CLOSED => Ok(Admission {
                breaker: self,
                trial: false,
            }),
            STATE_HALF_OPEN => Err(self.open_error()),
            _ => {
                if self.cooldown_remaining_ms() > 0 {
                    return Err(self.open_error());
                }
                // CAS so only one caller becomes the trial.
                if self
                    .state
                    .compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    tracing::info!(resource = %self.resource, "circuit half-open, admitting trial");
                    Ok(Admission {
                        breaker: self,
                        trial: true,
                    })
                } else {
                    Err(self.open_error())
                }
            }
        }
    }

    fn open_error(&self) -> CascadeError {
        CascadeError::CircuitOpen {
            resource: self.resource.clone(),
            cooldown_ms: self.cooldown_remaining_ms(),
        }
    }

    /// Record a terminal success.
    pub fn record_success(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if prev != STATE_CLOSED {
            tracing::info!(resource = %self.resource, "circuit closed");
        }
    }

    /// Record a terminal failure.
    pub fn record_failure(&self) {
        match self.state.load(Ordering::SeqCst) {
            STATE_HALF_OPEN => {
                // Failed trial reopens for a fresh cooldown.
                self.opened_at_ms.store(self.now_ms(), Ordering::SeqCst);
                self.state.store(STATE_OPEN, Ordering::SeqCst);
                tracing::warn!(resource = %self.resource, "circuit reopened after failed trial");
            }
            STATE_OPEN => {}
            _ => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.opened_at_ms.store(self.now_ms(), Ordering::SeqCst);
                    self.state.store(STATE_OPEN, Ordering::SeqCst);
                    tracing::warn!(
                        resource = %self.resource,
                        failures,
                        "circuit opened"
                    );
                }
            }
        }
    }
}

/// Permission to run one invocation. If the holder won the half-open trial
/// slot and is dropped before an outcome is recorded (the invocation was
/// cancelled or its future dropped), the slot is released so the next caller
/// can run a fresh trial instead of the circuit wedging half-open.
#[derive(Debug)]
#[must_use]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Admission<'_> {
    /// Disarm the guard once `record_success` or `record_failure` has run.
    pub fn settle(mut self) {
        self.trial = false;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial {
            // No outcome was recorded. Return to open without refreshing the
            // timestamp; the already-elapsed cooldown lets the next admit
            // start a trial immediately. The CAS is a no-op when an outcome
            // already moved the state.
            let _ = self.breaker.state.compare_exchange(
                STATE_HALF_OPEN,
                STATE_OPEN,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}

/// Lazily created breakers keyed by resource name. Shared across sessions so
/// resource health outlives any single run.
#[derive(Debug)]
pub struct BreakerRegistry {
    failure_threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        BreakerRegistry {
            failure_threshold,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut map = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    resource,
                    self.failure_threshold,
                    self.cooldown,
                ))
            })
            .clone()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        BreakerRegistry::new(5, Duration::from_secs(30))
    }
}

// ---------------------------------------------------------------------------
// Resilient invocation
// ---------------------------------------------------------------------------

/// Run `f` under the retry policy with the breaker guarding the whole
/// sequence. Retryable errors back off and try again up to the attempt
/// budget; fatal errors return immediately. The breaker sees one outcome per
/// call to `invoke`, never per attempt. Cancellation records no outcome, and
/// any half-open trial slot it held is released.
pub async fn invoke<F, Fut>(
    node_id: &str,
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    f: F,
) -> Result<String>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    let admission = breaker.admit()?;

    let attempts = policy.max_attempts.max(1);
    let mut last_err: Option<CascadeError> = None;
    for attempt in 0..attempts {
        match f().await {
            Ok(output) => {
                breaker.record_success();
                admission.settle();
                return Ok(output);
            }
            // Dropping the admission releases a half-open trial slot.
            Err(CascadeError::Cancelled) => return Err(CascadeError::Cancelled),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    node = %node_id,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => {
                breaker.record_failure();
                admission.settle();
                if e.is_retryable() {
                    return Err(CascadeError::RetriesExhausted {
                        node: node_id.to_string(),
                        attempts,
                        last_error: e.to_string(),
                    });
                }
                return Err(e);
            }
        }
    }

    breaker.record_failure();
    admission.settle();
    Err(CascadeError::RetriesExhausted {
        node: node_id.to_string(),
        attempts,
        last_error: last_err.map(|e| e.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::None,
            jitter: false,
        }
    }

    fn timeout_err() -> CascadeError {
        CascadeError::TaskTimeout {
            resource: "agent".into(),
            timeout_ms: 100,
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn default_backoff_is_exponential() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::Fixed(Duration::from_millis(1000)),
            jitter: true,
        };
        for _ in 0..64 {
            let d = policy.delay_for_attempt(0).as_millis() as u64;
            assert!((800..=1200).contains(&d), "delay {d}ms outside jitter band");
        }
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let breaker = CircuitBreaker::new("agent", 5, Duration::from_secs(30));
        let result = invoke("n", &breaker, &no_backoff(), || async {
            Ok("done".to_string())
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn retryable_error_retried_up_to_budget() {
        let breaker = CircuitBreaker::new("agent", 5, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let cc = calls.clone();

        let result = invoke("n", &breaker, &no_backoff(), move || {
            let cc = cc.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err(timeout_err())
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            result.unwrap_err(),
            CascadeError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn fatal_error_not_retried() {
        let breaker = CircuitBreaker::new("agent", 5, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let cc = calls.clone();

        let result = invoke("n", &breaker, &no_backoff(), move || {
            let cc = cc.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Err(CascadeError::TaskRejected {
                    resource: "agent".into(),
                    message: "bad input".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            CascadeError::TaskRejected { .. }
        ));
    }

    #[tokio::test]
    async fn recovery_mid_sequence_counts_as_success() {
        let breaker = CircuitBreaker::new("agent", 2, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let cc = calls.clone();

        let result = invoke("n", &breaker, &no_backoff(), move || {
            let cc = cc.clone();
            async move {
                if cc.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(timeout_err())
                } else {
                    Ok("recovered".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // One terminal success, zero terminal failures: breaker stays closed.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn success_on_final_permitted_attempt() {
        // Two transient failures against a three-attempt budget: the last
        // attempt must still run and its success is the invocation's outcome.
        let breaker = CircuitBreaker::new("agent", 5, Duration::from_secs(30));
        let calls = Arc::new(AtomicUsize::new(0));
        let cc = calls.clone();

        let result = invoke("n", &breaker, &no_backoff(), move || {
            let cc = cc.clone();
            async move {
                if cc.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(timeout_err())
                } else {
                    Ok("third time".to_string())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "third time");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new("agent", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.admit().unwrap_err(),
            CascadeError::CircuitOpen { .. }
        ));
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("agent", 3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_single_trial() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::ZERO);
        breaker.record_failure();
        // Cooldown of zero: the first admit wins the trial slot.
        let trial = breaker.admit().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Concurrent callers are rejected while the trial is in flight.
        assert!(breaker.admit().is_err());
        drop(trial);
    }

    #[test]
    fn trial_success_closes_circuit() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::ZERO);
        breaker.record_failure();
        let trial = breaker.admit().unwrap();
        breaker.record_success();
        trial.settle();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.admit().is_ok());
    }

    #[test]
    fn trial_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        let trial = breaker.admit().unwrap();
        breaker.record_failure();
        trial.settle();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn dropped_trial_releases_the_half_open_slot() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::ZERO);
        breaker.record_failure();
        let trial = breaker.admit().unwrap();
        assert!(breaker.admit().is_err());
        drop(trial);
        // The slot is free again; the next caller runs a fresh trial.
        assert_eq!(breaker.state(), BreakerState::Open);
        let retrial = breaker.admit().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        retrial.settle();
    }

    #[tokio::test]
    async fn cancelled_trial_does_not_wedge_the_breaker() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::ZERO);
        breaker.record_failure();

        let result = invoke("n", &breaker, &no_backoff(), || async {
            Err::<String, _>(CascadeError::Cancelled)
        })
        .await;
        assert!(matches!(result.unwrap_err(), CascadeError::Cancelled));

        // The cancelled trial recorded no outcome; a later healthy call must
        // get through rather than failing fast forever.
        let calls = Arc::new(AtomicUsize::new(0));
        let cc = calls.clone();
        let result = invoke("n", &breaker, &no_backoff(), move || {
            let cc = cc.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Ok("recovered".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_calling() {
        let breaker = CircuitBreaker::new("agent", 1, Duration::from_secs(30));
        breaker.record_failure();
        let calls = Arc::new(AtomicUsize::new(0));
        let cc = calls.clone();

        let result = invoke("n", &breaker, &no_backoff(), move || {
            let cc = cc.clone();
            async move {
                cc.fetch_add(1, Ordering::SeqCst);
                Ok("never".to_string())
            }
        })
        .await;

        assert!(matches!(
            result.unwrap_err(),
            CascadeError::CircuitOpen { .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registry_returns_same_breaker_per_resource() {
        let registry = BreakerRegistry::default();
        let a = registry.breaker("agent");
        let b = registry.breaker("agent");
        let c = registry.breaker("search");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
