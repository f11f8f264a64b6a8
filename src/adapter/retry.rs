use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::adapter::{CallError, TransportFailure};
use crate::config::RetryConfig;

/// Spreads retry delays so concurrent runs don't hammer a worker in lockstep.
pub trait Jitter: Send + Sync {
    fn apply(&self, delay: Duration) -> Duration;
}

/// Deterministic: returns the delay unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn apply(&self, delay: Duration) -> Duration {
        delay
    }
}

/// Adds up to `ratio * delay` of random extra wait.
#[derive(Debug, Clone, Copy)]
pub struct RandomJitter {
    ratio: f64,
}

impl RandomJitter {
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl Jitter for RandomJitter {
    fn apply(&self, delay: Duration) -> Duration {
        if self.ratio == 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.ratio);
        delay + delay.mul_f64(extra)
    }
}

/// Retry policy owned by the call adapter: bounded attempts with exponential
/// backoff. Only transport failures and timeouts are retried.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_auth_errors: bool,
    jitter: Arc<dyn Jitter>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("retry_auth_errors", &self.retry_auth_errors)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            retry_auth_errors: false,
            jitter: Arc::new(RandomJitter::new(0.2)),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(Arc::new(RandomJitter::new(config.jitter)))
        .with_auth_retries(config.retry_auth_errors)
    }

    /// A single attempt, no retries.
    pub fn no_retries() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_auth_retries(mut self, enabled: bool) -> Self {
        self.retry_auth_errors = enabled;
        self
    }

    /// Whether `attempt` (1-based) failing with `error` earns another try.
    pub fn should_retry(&self, error: &CallError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match error {
            CallError::Timeout { .. } => true,
            CallError::Transport { kind, .. } => match kind {
                TransportFailure::Network | TransportFailure::Unavailable(_) => true,
                TransportFailure::Auth(_) => self.retry_auth_errors,
                TransportFailure::Rejected(_) => false,
            },
            CallError::ContractMismatch { .. }
            | CallError::Validation(_)
            | CallError::UnknownWorker(_) => false,
        }
    }

    /// Backoff before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        self.jitter.apply(backoff).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(350))
            .with_jitter(Arc::new(NoJitter))
    }

    fn network() -> CallError {
        CallError::Transport {
            kind: TransportFailure::Network,
            message: "connection reset".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_retries_stop_at_max_attempts() {
        let p = policy();
        assert!(p.should_retry(&network(), 1));
        assert!(p.should_retry(&network(), 2));
        assert!(!p.should_retry(&network(), 3));
    }

    #[test]
    fn test_timeouts_are_retried() {
        let timeout = CallError::Timeout {
            deadline: Duration::from_secs(1),
        };
        assert!(policy().should_retry(&timeout, 1));
    }

    #[test]
    fn test_contract_mismatch_is_never_retried() {
        let mismatch = CallError::ContractMismatch {
            expected: "qa_verdict".into(),
            found: "patch".into(),
        };
        assert!(!policy().should_retry(&mismatch, 1));
    }

    #[test]
    fn test_auth_errors_follow_policy_flag() {
        let auth = CallError::Transport {
            kind: TransportFailure::Auth(401),
            message: "bad token".into(),
        };
        assert!(!policy().should_retry(&auth, 1));
        assert!(policy().with_auth_retries(true).should_retry(&auth, 1));
    }

    #[test]
    fn test_client_rejections_are_final() {
        let rejected = CallError::Transport {
            kind: TransportFailure::Rejected(422),
            message: "unprocessable".into(),
        };
        assert!(!policy().should_retry(&rejected, 1));
    }

    #[test]
    fn test_random_jitter_stays_within_ratio() {
        let jitter = RandomJitter::new(0.5);
        for _ in 0..50 {
            let d = jitter.apply(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_no_retries_policy() {
        assert!(!RetryPolicy::no_retries().should_retry(&network(), 1));
    }
}
