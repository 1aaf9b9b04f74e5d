use super::RemoteError;
use rand::Rng;
use std::thread;
use std::time::Duration;

const MAX_BACKOFF_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    #[cfg(test)]
    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_backoff_ms: 0,
        }
    }

    /// Delay before retry `attempt` (1-based), doubled per attempt with up to
    /// 20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.base_backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(8);
        let backoff = self
            .base_backoff_ms
            .saturating_mul(1_u64 << exp)
            .min(MAX_BACKOFF_MS);
        let jitter = rand::thread_rng().gen_range(0..=(backoff / 5).max(1));
        Duration::from_millis(backoff.saturating_add(jitter))
    }
}

/// Runs `op` until it succeeds, fails permanently, or the policy runs out of
/// attempts. Only transient errors are retried.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    call = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "remote call failed, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_transient_errors_until_success() {
        let mut calls = 0;
        let result = with_retry(&RetryPolicy::no_delay(3), "insert", || {
            calls += 1;
            if calls < 3 {
                Err(RemoteError::Transient("503".to_string()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&RetryPolicy::no_delay(3), "insert", || {
            calls += 1;
            Err(RemoteError::Transient("timeout".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&RetryPolicy::no_delay(5), "patch", || {
            calls += 1;
            Err(RemoteError::NotFound("gone".to_string()))
        });
        assert!(matches!(result, Err(RemoteError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff_ms: 1_000,
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(1_000));
        assert!(first <= Duration::from_millis(1_200));
        let third = policy.backoff(3);
        assert!(third >= Duration::from_millis(4_000));
        assert!(policy.backoff(20) <= Duration::from_millis(MAX_BACKOFF_MS + MAX_BACKOFF_MS / 5));
        assert_eq!(RetryPolicy::no_delay(3).backoff(2), Duration::ZERO);
    }
}
