//! Advisory rate limiting and retry with exponential backoff.

use super::{GenerationError, GenerationRequest, Generator};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry and pacing configuration for calls to the generative capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff delay before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds).
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Randomize delays by up to +/-25%.
    pub jitter: bool,
    /// Fixed minimum spacing between calls (milliseconds).
    pub min_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: true,
            min_interval_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// No retries, no pacing.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            min_interval_ms: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Backoff before retry number `retry` (0-based), before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Backoff with jitter applied, still capped at `max_delay`.
    pub fn jittered_backoff(&self, retry: u32, rng: &mut impl Rng) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let scale = rng.gen_range(0.75..=1.25);
        base.mul_f64(scale).min(self.max_delay())
    }
}

/// Pacing state shared by all calls through one wrapper.
#[derive(Debug)]
struct Pacing {
    last_call: Option<Instant>,
    /// Extra spacing learned from rate-limit responses.
    adaptive_delay: Duration,
}

/// Wraps a [`Generator`] with pacing and retries.
///
/// Non-retryable errors are returned immediately. Backoff sleeps end early if
/// the optional cancellation token fires; an in-flight call is never aborted.
pub struct RetryingGenerator {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
    pacing: Mutex<Pacing>,
    cancel: Option<CancellationToken>,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            pacing: Mutex::new(Pacing {
                last_call: None,
                adaptive_delay: Duration::ZERO,
            }),
            cancel: None,
        }
    }

    /// Abort backoff waits when the token is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn sleep(&self, duration: Duration) -> Result<(), GenerationError> {
        if duration.is_zero() {
            return Ok(());
        }
        match &self.cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(GenerationError::Cancelled),
                _ = tokio::time::sleep(duration) => Ok(()),
            },
            None => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    /// Wait out the fixed and adaptive spacing since the previous call.
    async fn pace(&self) -> Result<(), GenerationError> {
        let wait = {
            let pacing = self.pacing.lock().await;
            let spacing = Duration::from_millis(self.policy.min_interval_ms) + pacing.adaptive_delay;
            match pacing.last_call {
                Some(last) => spacing.saturating_sub(last.elapsed()),
                None => Duration::ZERO,
            }
        };
        self.sleep(wait).await?;
        self.pacing.lock().await.last_call = Some(Instant::now());
        Ok(())
    }

    async fn record_outcome(&self, rate_limited: bool) {
        let mut pacing = self.pacing.lock().await;
        pacing.adaptive_delay = if rate_limited {
            let doubled = (pacing.adaptive_delay * 2).max(Duration::from_millis(self.policy.initial_delay_ms));
            doubled.min(self.policy.max_delay())
        } else {
            pacing.adaptive_delay / 2
        };
    }
}

#[async_trait]
impl Generator for RetryingGenerator {
    async fn invoke(&self, request: GenerationRequest) -> Result<String, GenerationError> {
        let mut retry = 0;
        loop {
            self.pace().await?;

            match self.inner.invoke(request.clone()).await {
                Ok(text) => {
                    self.record_outcome(false).await;
                    return Ok(text);
                }
                Err(err) => {
                    self.record_outcome(err.is_rate_limit()).await;

                    if !err.is_retryable() || retry >= self.policy.max_retries {
                        debug!(purpose = request.purpose.name(), retry, error = %err, "giving up");
                        return Err(err);
                    }

                    let delay = {
                        let backoff = self.policy.jittered_backoff(retry, &mut rand::thread_rng());
                        err.retry_after()
                            .map(|hint| hint.max(backoff))
                            .unwrap_or(backoff)
                            .min(self.policy.max_delay())
                    };
                    warn!(
                        purpose = request.purpose.name(),
                        retry = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying generation"
                    );
                    self.sleep(delay).await?;
                    retry += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Purpose;
    use crate::testing::MockGenerator;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn request() -> GenerationRequest {
        GenerationRequest::new(Purpose::Summary, "sys", "user")
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 800,
            max_delay_ms: 1000,
            ..RetryPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        for retry in 0..8 {
            let delay = policy.jittered_backoff(retry, &mut rng);
            assert!(delay <= Duration::from_millis(1000));
            assert!(delay >= Duration::from_millis(600));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_errors() {
        let mock = Arc::new(MockGenerator::new());
        mock.fail_next(GenerationError::Timeout);
        mock.fail_next(GenerationError::RateLimited { retry_after: Some(Duration::from_secs(2)) });
        mock.push_response(Purpose::Summary, "ok");

        let generator = RetryingGenerator::new(mock.clone(), RetryPolicy::default());
        let text = generator.invoke(request()).await.unwrap();

        assert_eq!(text, "ok");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let mock = Arc::new(MockGenerator::new());
        mock.fail_next(GenerationError::ContentPolicy("no".into()));

        let generator = RetryingGenerator::new(mock.clone(), RetryPolicy::default());
        let err = generator.invoke(request()).await.unwrap_err();

        assert!(matches!(err, GenerationError::ContentPolicy(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let mock = Arc::new(MockGenerator::new());
        for _ in 0..5 {
            mock.fail_next(GenerationError::Overloaded);
        }

        let generator = RetryingGenerator::new(mock.clone(), RetryPolicy::default().with_max_retries(2));
        let err = generator.invoke(request()).await.unwrap_err();

        assert!(matches!(err, GenerationError::Overloaded));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_backoff() {
        let mock = Arc::new(MockGenerator::new());
        mock.fail_next(GenerationError::Timeout);
        let token = CancellationToken::new();
        token.cancel();

        let generator = RetryingGenerator::new(mock.clone(), RetryPolicy::default())
            .with_cancellation(token);
        let err = generator.invoke(request()).await.unwrap_err();

        assert!(matches!(err, GenerationError::Cancelled));
        assert_eq!(mock.call_count(), 1);
    }
}
