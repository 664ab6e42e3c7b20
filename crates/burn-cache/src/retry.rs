use std::thread;
use std::time::Duration;

use anyhow::Result;
use burn_security::VerificationError;
use tracing::warn;

/// Bounded fixed-delay retry for file transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Runs `operation` until it succeeds or the attempts run out.
    /// Verification failures are returned immediately.
    pub fn run<T>(&self, description: &str, mut operation: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if is_verification_failure(&err) => return Err(err),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(attempt, attempts, "{description} failed, retrying: {err:#}");
                    attempt += 1;
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
            }
        }
    }
}

pub fn is_verification_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<VerificationError>().is_some())
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn retries_transient_failures_up_to_the_limit() {
        let mut calls = 0;
        let result = RetryPolicy {
            attempts: 3,
            delay: Duration::ZERO,
        }
        .run("move", || {
            calls += 1;
            if calls < 3 {
                Err(anyhow!("sharing violation"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.expect("third attempt succeeds"), 3);

        let mut calls = 0;
        let err = RetryPolicy {
            attempts: 3,
            delay: Duration::ZERO,
        }
        .run("move", || -> Result<()> {
            calls += 1;
            Err(anyhow!("still locked"))
        })
        .expect_err("exhausted retries fail");
        assert_eq!(calls, 3);
        assert!(err.to_string().contains("still locked"));
    }

    #[test]
    fn verification_failures_are_not_retried() {
        let mut calls = 0;
        let err = RetryPolicy::default()
            .run("verify", || -> Result<()> {
                calls += 1;
                Err(anyhow::Error::new(VerificationError::MissingCatalog(0)))
            })
            .expect_err("verification failure is fatal");
        assert_eq!(calls, 1);
        assert!(is_verification_failure(&err));
    }
}
