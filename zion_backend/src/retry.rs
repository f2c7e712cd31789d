//! Bounded retry with corrective feedback.
//!
//! Each attempt receives the corrections produced by earlier attempts and reports
//! whether it was accepted, needs a correction, failed transiently or must abort.

use std::future::Future;

/// What a single attempt concluded.
#[derive(Debug)]
pub enum Attempt<T> {
    Accept(T),
    /// A validator rejected the result; `correction` is fed to the next attempt.
    Correct { reason: String, correction: String },
    /// Transient failure; retried without feedback.
    Fail(String),
    /// Stop immediately (cancellation).
    Abort(String),
}

#[derive(Debug, PartialEq)]
pub enum RetryOutcome<T> {
    Success(T),
    /// Accepted after at least one corrective retry.
    Corrected { value: T, corrections: Vec<String> },
    Exhausted {
        last_error: String,
        corrections: Vec<String>,
    },
    Aborted(String),
}

impl<T> RetryOutcome<T> {
    pub fn value(self) -> Option<T> {
        match self {
            RetryOutcome::Success(value) | RetryOutcome::Corrected { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Run `attempt` up to `max_attempts` times. The closure gets the zero-based
/// attempt number and the corrections collected so far.
pub async fn retry_with_corrections<T, F, Fut>(max_attempts: usize, mut attempt: F) -> RetryOutcome<T>
where
    F: FnMut(usize, Vec<String>) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut corrections: Vec<String> = Vec::new();
    let mut last_error = String::from("no attempts made");

    for n in 0..max_attempts {
        if n > 0 {
            tracing::debug!("Retrying ({}/{})", n + 1, max_attempts);
        }
        match attempt(n, corrections.clone()).await {
            Attempt::Accept(value) => {
                return if corrections.is_empty() {
                    RetryOutcome::Success(value)
                } else {
                    RetryOutcome::Corrected { value, corrections }
                };
            }
            Attempt::Correct { reason, correction } => {
                tracing::warn!("Attempt {} rejected: {}", n + 1, reason);
                last_error = reason;
                corrections.push(correction);
            }
            Attempt::Fail(error) => {
                tracing::warn!("Attempt {} failed: {}", n + 1, error);
                last_error = error;
            }
            Attempt::Abort(reason) => return RetryOutcome::Aborted(reason),
        }
    }

    RetryOutcome::Exhausted {
        last_error,
        corrections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_success_is_plain() {
        let outcome = retry_with_corrections(3, |_, _| async { Attempt::Accept(7) }).await;
        assert_eq!(outcome, RetryOutcome::Success(7));
    }

    #[tokio::test]
    async fn corrections_are_threaded_through() {
        let outcome = retry_with_corrections(3, |n, seen: Vec<String>| async move {
            if n == 0 {
                Attempt::Correct {
                    reason: "simulation".into(),
                    correction: "use the tool".into(),
                }
            } else {
                assert_eq!(seen, vec!["use the tool".to_string()]);
                Attempt::Accept("ok")
            }
        })
        .await;
        assert_eq!(
            outcome,
            RetryOutcome::Corrected {
                value: "ok",
                corrections: vec!["use the tool".into()]
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error() {
        let outcome: RetryOutcome<()> = retry_with_corrections(3, |n, _| async move {
            Attempt::Fail(format!("timeout {}", n))
        })
        .await;
        match outcome {
            RetryOutcome::Exhausted { last_error, corrections } => {
                assert_eq!(last_error, "timeout 2");
                assert!(corrections.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn abort_stops_immediately() {
        let mut calls = 0;
        let outcome: RetryOutcome<()> = retry_with_corrections(3, |_, _| {
            calls += 1;
            async { Attempt::Abort("cancelled".into()) }
        })
        .await;
        assert_eq!(outcome, RetryOutcome::Aborted("cancelled".into()));
        assert_eq!(calls, 1);
    }
}
