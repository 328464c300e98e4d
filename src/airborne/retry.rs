//! C7 — retry policy. Classifies errors retryable/fatal, exponential backoff, per-attempt
//! timeouts.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-attempt retry budget (§4.7: "capped by a per-attempt limit of 3").
pub const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 1000;

/// Cooperative cancellation signal for the "outer context" §4.7/§5 describes: cloned onto every
/// `GenerateParams` built for a request, set once by whichever caller gives up on it, and
/// observed by `run_with_retry` before each attempt and each backoff sleep so an abandoned
/// request stops spending its retry budget.
#[derive(Clone, Debug)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        CancellationFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// `IsRetryable(err) → bool`, classified against the free-text patterns named in §4.7/§7: HTTP
/// 429/5xx, timeouts, and explicit overloaded/rate-limit phrases are retryable; malformed
/// request, authentication, and content-policy rejections are not.
pub fn is_retryable(message: &str, http_status: Option<u16>) -> bool {
    if let Some(status) = http_status {
        if status == 429 || (500..600).contains(&status) {
            return true;
        }
        if status == 400 || status == 401 || status == 403 || status == 422 {
            return false;
        }
    }
    let lower = message.to_lowercase();
    if lower.contains("malformed")
        || lower.contains("authentication")
        || lower.contains("content policy")
        || lower.contains("content_policy")
        || lower.contains("unauthorized")
    {
        return false;
    }
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("overloaded")
        || lower.contains("resource exhausted")
        || lower.contains("resource_exhausted")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
}

/// Exponential backoff starting at ~1s with full jitter, indexed by zero-based attempt number.
pub fn backoff_duration(attempt: u32) -> Duration {
    let exp_ms = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(16));
    let jittered = rand::thread_rng().gen_range(0..=exp_ms);
    Duration::from_millis(jittered.max(1))
}

/// Sleep for the computed backoff duration unless the outer context is already cancelled, in
/// which case return immediately so the caller can fail fast with a context error.
pub async fn sleep_with_backoff(attempt: u32, cancelled: impl Fn() -> bool) {
    if cancelled() {
        return;
    }
    tokio::time::sleep(backoff_duration(attempt)).await;
}

/// Run `op` under the retry policy: up to [`MAX_ATTEMPTS`] attempts, sleeping with backoff
/// between retryable failures, bailing immediately on a fatal error. Checked against `cancelled`
/// before every attempt and before every backoff sleep; a cancelled context fails fast with a
/// `"cancelled"` error instead of spending the remaining attempt budget (§4.7/§5).
pub async fn run_with_retry<T, F, Fut>(
    mut op: F,
    is_retryable_err: impl Fn(&str) -> bool,
    cancelled: &CancellationFlag,
) -> Result<T, String>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, String>>,
{
    let mut last_err = String::from("no attempts made");
    for attempt in 0..MAX_ATTEMPTS {
        if cancelled.is_cancelled() {
            return Err("cancelled".to_string());
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = e;
                if attempt + 1 < MAX_ATTEMPTS && is_retryable_err(&last_err) {
                    sleep_with_backoff(attempt, || cancelled.is_cancelled()).await;
                    continue;
                } else {
                    return Err(last_err);
                }
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_http_429_and_5xx() {
        assert!(is_retryable("", Some(429)));
        assert!(is_retryable("", Some(500)));
        assert!(is_retryable("", Some(503)));
    }

    #[test]
    fn does_not_retry_auth_or_malformed() {
        assert!(!is_retryable("", Some(401)));
        assert!(!is_retryable("malformed request body", None));
        assert!(!is_retryable("authentication failed", None));
    }

    #[test]
    fn retries_free_text_overload_phrases() {
        assert!(is_retryable("the model is currently overloaded", None));
        assert!(is_retryable("rate limit exceeded, try again", None));
        assert!(is_retryable("resource exhausted", None));
    }

    #[tokio::test]
    async fn run_with_retry_stops_on_fatal_error() {
        let mut calls = 0;
        let result: Result<(), String> = run_with_retry(
            |_attempt| {
                calls += 1;
                async { Err("authentication failed".to_string()) }
            },
            |msg| is_retryable(msg, None),
            &CancellationFlag::new(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn run_with_retry_exhausts_attempt_budget() {
        let mut calls = 0;
        let result: Result<(), String> = run_with_retry(
            |_attempt| {
                calls += 1;
                async { Err("503 overloaded".to_string()) }
            },
            |msg| is_retryable(msg, None),
            &CancellationFlag::new(),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn run_with_retry_succeeds_after_transient_failure() {
        let mut calls = 0;
        let result = run_with_retry(
            |_attempt| {
                calls += 1;
                async move {
                    if calls < 2 {
                        Err("503 overloaded".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |msg| is_retryable(msg, None),
            &CancellationFlag::new(),
        )
        .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn run_with_retry_stops_spending_attempts_once_cancelled() {
        let flag = CancellationFlag::new();
        flag.cancel();
        let mut calls = 0;
        let result: Result<(), String> = run_with_retry(
            |_attempt| {
                calls += 1;
                async { Err("503 overloaded".to_string()) }
            },
            |msg| is_retryable(msg, None),
            &flag,
        )
        .await;
        assert_eq!(result, Err("cancelled".to_string()));
        assert_eq!(calls, 0, "a pre-cancelled context must not run the operation at all");
    }

    #[tokio::test]
    async fn run_with_retry_does_not_sleep_once_cancelled_mid_loop() {
        let flag = CancellationFlag::new();
        let mut calls = 0;
        let result: Result<(), String> = run_with_retry(
            |_attempt| {
                calls += 1;
                flag.cancel();
                async { Err("503 overloaded".to_string()) }
            },
            |msg| is_retryable(msg, None),
            &flag,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1, "cancellation observed at the top of the loop must cut the retry short");
    }
}
