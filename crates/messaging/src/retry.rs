//! Exponential backoff for subscriber logic.
//!
//! Failures are classified through [`ErrorClassification`]: terminal kinds
//! surface at once, everything else is retried until the attempt budget or
//! the elapsed-time budget runs out. Each retry, recovery and exhaustion is
//! reported to a [`RetryNotify`] callback together with the message headers.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{ErrorClassification, Metadata, RequestContext, headers};
use rand::Rng;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// No retry is scheduled past this budget. `None` disables the check.
    pub max_elapsed_time: Option<Duration>,
    pub multiplier: f64,
    /// Each delay is spread over `delay * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based), capped at
    /// `max_interval`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-factor..=factor);
        delay.mul_f64(1.0 + spread)
    }

    /// Runs `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// Returns the last error when giving up. Cancellation of `ctx` during a
    /// backoff sleep also ends the loop with the last error.
    pub async fn run<T, E, F, Fut>(
        &self,
        ctx: &RequestContext,
        notify: &RetryNotify,
        metadata: &Metadata,
        mut op: F,
    ) -> Result<T, E>
    where
        E: ErrorClassification + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        notify(&RetryNotification {
                            attempt,
                            delay: Duration::ZERO,
                            elapsed: started.elapsed(),
                            error: None,
                            status: RetryStatus::Recovered,
                            metadata,
                        });
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            let delay = self.jittered(self.delay_for_attempt(attempt + 1));
            let elapsed = started.elapsed();
            let over_time = self
                .max_elapsed_time
                .is_some_and(|budget| elapsed + delay > budget);
            if attempt >= self.max_retries || over_time {
                notify(&RetryNotification {
                    attempt,
                    delay: Duration::ZERO,
                    elapsed,
                    error: Some(err.to_string()),
                    status: RetryStatus::Exhausted,
                    metadata,
                });
                return Err(err);
            }

            attempt += 1;
            metrics::counter!("messaging_retry_attempts_total").increment(1);
            notify(&RetryNotification {
                attempt,
                delay,
                elapsed,
                error: Some(err.to_string()),
                status: RetryStatus::Retrying,
                metadata,
            });

            if ctx.sleep(delay).await.is_err() {
                return Err(err);
            }
        }
    }
}

pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn initial_interval(mut self, interval: Duration) -> Self {
        self.policy.initial_interval = interval;
        self
    }

    pub fn max_interval(mut self, interval: Duration) -> Self {
        self.policy.max_interval = interval;
        self
    }

    pub fn max_elapsed_time(mut self, budget: Option<Duration>) -> Self {
        self.policy.max_elapsed_time = budget;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn randomization_factor(mut self, factor: f64) -> Self {
        self.policy.randomization_factor = factor;
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// A failure was seen and another attempt is scheduled.
    Retrying,
    /// An attempt succeeded after at least one retry.
    Recovered,
    /// The budget is spent; the last error is surfaced.
    Exhausted,
}

#[derive(Debug)]
pub struct RetryNotification<'a> {
    pub attempt: u32,
    pub delay: Duration,
    pub elapsed: Duration,
    pub error: Option<String>,
    pub status: RetryStatus,
    pub metadata: &'a Metadata,
}

pub type RetryNotify = Arc<dyn Fn(&RetryNotification<'_>) + Send + Sync>;

/// Notification callback that logs with the message's correlation headers.
pub fn logging_notify() -> RetryNotify {
    Arc::new(|n: &RetryNotification<'_>| {
        let meta = n.metadata;
        let field = |key: &str| meta.get(key).unwrap_or_default().to_string();
        match n.status {
            RetryStatus::Retrying => tracing::warn!(
                topic = %field(headers::TOPIC),
                trace_id = %field(headers::TRACE_ID),
                event_id = %field(headers::EVENT_ID),
                source = %field(headers::SOURCE),
                schema_version = %field(headers::SCHEMA_VERSION),
                key = %field(headers::PARTITION_KEY),
                attempt = n.attempt,
                delay_ms = n.delay.as_millis() as u64,
                error = n.error.as_deref().unwrap_or_default(),
                "retrying message handler"
            ),
            RetryStatus::Recovered => tracing::info!(
                topic = %field(headers::TOPIC),
                trace_id = %field(headers::TRACE_ID),
                event_id = %field(headers::EVENT_ID),
                attempt = n.attempt,
                elapsed_ms = n.elapsed.as_millis() as u64,
                "message handler recovered after retry"
            ),
            RetryStatus::Exhausted => tracing::error!(
                topic = %field(headers::TOPIC),
                trace_id = %field(headers::TRACE_ID),
                event_id = %field(headers::EVENT_ID),
                source = %field(headers::SOURCE),
                key = %field(headers::PARTITION_KEY),
                attempt = n.attempt,
                elapsed_ms = n.elapsed.as_millis() as u64,
                error = n.error.as_deref().unwrap_or_default(),
                "retries exhausted"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use common::ErrorKind;

    use super::*;

    #[derive(Debug)]
    struct Failure(ErrorKind);

    impl Display for Failure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "failure: {}", self.0)
        }
    }

    impl ErrorClassification for Failure {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(max_retries)
            .initial_interval(Duration::from_millis(1))
            .max_interval(Duration::from_millis(2))
            .randomization_factor(0.0)
            .build()
    }

    fn recording() -> (RetryNotify, Arc<Mutex<Vec<(RetryStatus, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let notify: RetryNotify = Arc::new(move |n: &RetryNotification<'_>| {
            sink.lock().unwrap().push((n.status, n.attempt));
        });
        (notify, seen)
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::builder()
            .initial_interval(Duration::from_millis(100))
            .max_interval(Duration::from_millis(300))
            .multiplier(2.0)
            .build();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_factor() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let (notify, seen) = recording();
        let result: Result<(), Failure> = fast_policy(5)
            .run(&RequestContext::new(), &notify, &Metadata::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(ErrorKind::InsufficientStock)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_error_recovers() {
        let (notify, seen) = recording();
        let result = fast_policy(5)
            .run(&RequestContext::new(), &notify, &Metadata::new(), |attempt| async move {
                if attempt < 2 {
                    Err(Failure(ErrorKind::Transport))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (RetryStatus::Retrying, 1),
                (RetryStatus::Retrying, 2),
                (RetryStatus::Recovered, 2)
            ]
        );
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let (notify, seen) = recording();
        let result: Result<(), Failure> = fast_policy(2)
            .run(&RequestContext::new(), &notify, &Metadata::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(ErrorKind::Internal)) }
            })
            .await;
        assert!(matches!(result, Err(Failure(ErrorKind::Internal))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(seen.lock().unwrap().last(), Some(&(RetryStatus::Exhausted, 2)));
    }

    #[tokio::test]
    async fn cancelled_context_stops_backoff() {
        let ctx = RequestContext::new();
        ctx.cancellation().cancel();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::builder()
            .initial_interval(Duration::from_secs(30))
            .build();
        let result: Result<(), Failure> = policy
            .run(&ctx, &logging_notify(), &Metadata::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Failure(ErrorKind::Timeout)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
