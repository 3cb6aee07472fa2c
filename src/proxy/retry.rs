//! Credential rotation for a single inbound request.
//!
//! [`rotate_credentials`] walks a sampled key order sequentially:
//! - each attempt is bounded by a per-attempt timeout
//! - the first `Success` ends the walk
//! - `Retryable` failures are recorded and the next key is tried
//! - a `Fatal` failure ends the walk immediately
//!
//! When every key fails the last error is reported as exhaustion.

use std::future::Future;
use std::time::Duration;

use crate::config::ApiKey;
use crate::upstream::UpstreamError;

/// Tagged result of one upstream attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Retryable(E),
    Fatal(E),
}

impl<T> AttemptOutcome<T, UpstreamError> {
    /// Classify an upstream call result.
    pub fn classify(result: Result<T, UpstreamError>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) if e.is_fatal() => AttemptOutcome::Fatal(e),
            Err(e) => AttemptOutcome::Retryable(e),
        }
    }
}

/// Trait for building an error out of an elapsed attempt timeout.
///
/// Lets the rotation loop stay generic over the attempt's error type.
pub trait FromTimeout {
    fn from_timeout(limit: Duration) -> Self;
}

impl FromTimeout for UpstreamError {
    fn from_timeout(limit: Duration) -> Self {
        UpstreamError::Timeout(limit)
    }
}

/// Record of a single failed attempt, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedAttempt {
    pub key_suffix: String,
    pub message: String,
}

/// Why the rotation ended without a success.
#[derive(Debug)]
pub enum RotationError<E> {
    /// No key was available to try.
    NoCandidates,
    /// A failure no other key can fix.
    Fatal(E),
    /// Every sampled key failed; carries the last failure.
    Exhausted(E),
}

/// A successful attempt and the key that produced it.
#[derive(Debug)]
pub struct Served<T> {
    pub value: T,
    pub key: ApiKey,
}

/// Outcome of the full rotation.
pub struct RotationOutcome<T, E> {
    pub result: std::result::Result<Served<T>, RotationError<E>>,
    pub failed: Vec<FailedAttempt>,
}

/// Try `attempt` with each key in `keys` until one succeeds.
///
/// Invokes `attempt` at most `keys.len()` times, one key at a time; callers
/// truncate `keys` to the attempt cap before calling.
pub async fn rotate_credentials<T, E, F, Fut>(
    keys: &[ApiKey],
    attempt_timeout: Duration,
    mut attempt: F,
) -> RotationOutcome<T, E>
where
    E: FromTimeout + std::fmt::Display,
    F: FnMut(ApiKey) -> Fut,
    Fut: Future<Output = AttemptOutcome<T, E>>,
{
    let mut failed = Vec::new();
    let mut last_error: Option<E> = None;

    for (index, key) in keys.iter().enumerate() {
        let outcome = match tokio::time::timeout(attempt_timeout, attempt(key.clone())).await {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Retryable(E::from_timeout(attempt_timeout)),
        };

        match outcome {
            AttemptOutcome::Success(value) => {
                tracing::debug!(key = %key.suffix(), attempt = index + 1, "Upstream attempt succeeded");
                return RotationOutcome {
                    result: Ok(Served {
                        value,
                        key: key.clone(),
                    }),
                    failed,
                };
            }
            AttemptOutcome::Fatal(err) => {
                tracing::warn!(key = %key.suffix(), error = %err, "Upstream attempt failed fatally");
                failed.push(FailedAttempt {
                    key_suffix: key.suffix(),
                    message: err.to_string(),
                });
                return RotationOutcome {
                    result: Err(RotationError::Fatal(err)),
                    failed,
                };
            }
            AttemptOutcome::Retryable(err) => {
                tracing::warn!(
                    key = %key.suffix(),
                    attempt = index + 1,
                    of = keys.len(),
                    error = %err,
                    "Upstream attempt failed, rotating key"
                );
                failed.push(FailedAttempt {
                    key_suffix: key.suffix(),
                    message: err.to_string(),
                });
                last_error = Some(err);
            }
        }
    }

    let result = match last_error {
        Some(err) => Err(RotationError::Exhausted(err)),
        None => Err(RotationError::NoCandidates),
    };
    RotationOutcome { result, failed }
}
