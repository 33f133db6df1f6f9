//! Retry engine for transaction submission.
//!
//! Wraps a fallible asynchronous operation and re-runs it while the error is
//! classified as retriable, sleeping between attempts with an exponential delay
//! capped at a maximum interval. Retrying is sequential and every call starts
//! from a fresh backoff state; dropping the returned future cancels any pending
//! delay.

use backoff::backoff::Backoff;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry policy for transaction submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
	/// Delay before the first retry, in milliseconds.
	#[serde(default = "default_initial_interval_ms")]
	pub initial_interval_ms: u64,
	/// Upper bound of the delay between two attempts, in milliseconds.
	#[serde(default = "default_max_interval_ms")]
	pub max_interval_ms: u64,
	/// Maximum number of retries after the first attempt.
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
}

fn default_initial_interval_ms() -> u64 {
	1000
}

fn default_max_interval_ms() -> u64 {
	2000
}

fn default_max_retries() -> u32 {
	50
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			initial_interval_ms: default_initial_interval_ms(),
			max_interval_ms: default_max_interval_ms(),
			max_retries: default_max_retries(),
		}
	}
}

/// Exponential backoff without jitter.
///
/// The n-th retry (starting at 0) waits `min(2^n * initial, max)`. Once
/// `max_retries` delays have been handed out the backoff is exhausted.
#[derive(Debug, Clone)]
pub struct CappedExponentialBackoff {
	initial: Duration,
	max: Duration,
	max_retries: u32,
	attempt: u32,
}

impl CappedExponentialBackoff {
	pub fn new(config: &RetryConfig) -> Self {
		Self {
			initial: Duration::from_millis(config.initial_interval_ms),
			max: Duration::from_millis(config.max_interval_ms),
			max_retries: config.max_retries,
			attempt: 0,
		}
	}

	fn delay(&self, attempt: u32) -> Duration {
		let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
		self.initial
			.checked_mul(multiplier)
			.unwrap_or(self.max)
			.min(self.max)
	}
}

impl Backoff for CappedExponentialBackoff {
	fn next_backoff(&mut self) -> Option<Duration> {
		if self.attempt >= self.max_retries {
			return None;
		}
		let delay = self.delay(self.attempt);
		self.attempt += 1;
		Some(delay)
	}

	fn reset(&mut self) {
		self.attempt = 0;
	}
}

/// Runs `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the retry budget is spent.
///
/// The error of the last attempt is returned unmodified. Every retry and the
/// final exhaustion are logged as warnings.
pub async fn with_retry<T, E, Op, Fut, R>(
	config: &RetryConfig,
	should_retry: R,
	mut operation: Op,
) -> Result<T, E>
where
	Op: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	R: Fn(&E) -> bool,
	E: Display,
{
	let classify = &should_retry;
	let mut retries = 0u32;

	let result = backoff::future::retry_notify(
		CappedExponentialBackoff::new(config),
		move || {
			let attempt = operation();
			async move {
				attempt.await.map_err(|e| {
					if classify(&e) {
						backoff::Error::transient(e)
					} else {
						backoff::Error::permanent(e)
					}
				})
			}
		},
		|error: E, delay: Duration| {
			retries += 1;
			tracing::warn!(
				retry = retries,
				delay_ms = delay.as_millis() as u64,
				error = %error,
				"Operation failed with retriable error, retrying"
			);
		},
	)
	.await;

	if let Err(error) = &result {
		if should_retry(error) {
			tracing::warn!(
				max_retries = config.max_retries,
				error = %error,
				"Operation failed with retriable error, max retry number reached"
			);
		}
	}

	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	#[derive(Debug, PartialEq)]
	enum TestError {
		Transient(u32),
		Fatal(u32),
	}

	impl Display for TestError {
		fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
			write!(f, "{:?}", self)
		}
	}

	fn is_transient(e: &TestError) -> bool {
		matches!(e, TestError::Transient(_))
	}

	fn config(max_retries: u32) -> RetryConfig {
		RetryConfig {
			initial_interval_ms: 100,
			max_interval_ms: 250,
			max_retries,
		}
	}

	/// Fails with a transient error on the first `failures` attempts.
	fn flaky(
		attempts: Arc<AtomicU32>,
		failures: u32,
	) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, TestError>>>> {
		move || {
			let attempts = attempts.clone();
			Box::pin(async move {
				let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
				if n <= failures {
					Err(TestError::Transient(n))
				} else {
					Ok(n)
				}
			})
		}
	}

	#[test]
	fn test_backoff_delays_are_capped() {
		let mut backoff = CappedExponentialBackoff::new(&RetryConfig {
			initial_interval_ms: 1000,
			max_interval_ms: 2000,
			max_retries: 4,
		});

		assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
		assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2000)));
		assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2000)));
		assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(2000)));
		assert_eq!(backoff.next_backoff(), None);

		backoff.reset();
		assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1000)));
	}

	#[test]
	fn test_backoff_does_not_overflow() {
		let backoff = CappedExponentialBackoff::new(&RetryConfig {
			initial_interval_ms: 1000,
			max_interval_ms: 2000,
			max_retries: 100,
		});
		assert_eq!(backoff.delay(64), Duration::from_millis(2000));
	}

	#[test]
	fn test_default_config() {
		let config = RetryConfig::default();
		assert_eq!(config.initial_interval_ms, 1000);
		assert_eq!(config.max_interval_ms, 2000);
		assert_eq!(config.max_retries, 50);
	}

	#[tokio::test(start_paused = true)]
	async fn test_succeeds_within_budget() {
		let attempts = Arc::new(AtomicU32::new(0));
		let start = tokio::time::Instant::now();

		let result = with_retry(&config(3), is_transient, flaky(attempts.clone(), 3)).await;

		assert_eq!(result, Ok(4));
		assert_eq!(attempts.load(Ordering::SeqCst), 4);
		// 100 + 200 + 250 (capped)
		assert!(start.elapsed() >= Duration::from_millis(550));
	}

	#[tokio::test(start_paused = true)]
	async fn test_exhaustion_returns_last_error() {
		let attempts = Arc::new(AtomicU32::new(0));

		let result = with_retry(&config(3), is_transient, flaky(attempts.clone(), 10)).await;

		assert_eq!(result, Err(TestError::Transient(4)));
		assert_eq!(attempts.load(Ordering::SeqCst), 4);
	}

	#[tokio::test(start_paused = true)]
	async fn test_non_retriable_error_is_not_retried() {
		let attempts = Arc::new(AtomicU32::new(0));
		let counter = attempts.clone();

		let result: Result<(), TestError> = with_retry(&config(5), is_transient, move || {
			let counter = counter.clone();
			async move { Err(TestError::Fatal(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
		})
		.await;

		assert_eq!(result, Err(TestError::Fatal(1)));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_zero_retries_runs_once() {
		let attempts = Arc::new(AtomicU32::new(0));

		let result = with_retry(&config(0), is_transient, flaky(attempts.clone(), 1)).await;

		assert_eq!(result, Err(TestError::Transient(1)));
		assert_eq!(attempts.load(Ordering::SeqCst), 1);
	}
}
