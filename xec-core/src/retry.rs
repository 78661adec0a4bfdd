use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};
use crate::result::ExecutionResult;

/// Computes delay as `min(max_delay, initial_delay * backoff_multiplier^attempt)`,
/// optionally jittered by a uniform factor in `[0.5, 1.5]` (§4.9).
#[derive(Debug, Clone)]
pub struct RetryOptions {
  pub max_retries: usize,
  pub initial_delay: Duration,
  pub max_delay: Duration,
  pub backoff_multiplier: f64,
  pub jitter: bool,
}

impl Default for RetryOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      initial_delay: Duration::from_millis(200),
      max_delay: Duration::from_secs(30),
      backoff_multiplier: 2.0,
      jitter: true,
    }
  }
}

impl RetryOptions {
  fn delay_for(&self, attempt: u32) -> Duration {
    let scaled = self.initial_delay.as_secs_f64()
      * self.backoff_multiplier.powi(attempt as i32);
    let capped = scaled.min(self.max_delay.as_secs_f64());
    let factor = if self.jitter {
      rand::rng().random_range(0.5..1.5)
    } else {
      1.0
    };
    Duration::from_secs_f64((capped * factor).max(0.0))
  }
}

/// Retries `f` until it returns `Ok` satisfying `is_retryable`'s negation
/// criteria are no longer met, or `max_retries` is exhausted. The default
/// predicate (used when none is supplied) is [`Error::is_retryable_default`]
/// for `Err` outcomes, and "retry iff exit_code != 0" for `Ok` outcomes.
pub async fn retry<F, Fut>(
  mut f: F,
  opts: &RetryOptions,
  is_retryable: impl Fn(&std::result::Result<ExecutionResult, Error>) -> bool,
) -> Result<ExecutionResult>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<ExecutionResult>>,
{
  let mut results = Vec::new();
  let mut last_result: Option<ExecutionResult> = None;

  for attempt in 0..=opts.max_retries {
    let outcome = f().await;
    if let Ok(result) = &outcome {
      results.push(result.clone());
      last_result = Some(result.clone());
    }

    let retryable = is_retryable(&outcome);
    if !retryable {
      return outcome;
    }

    if attempt == opts.max_retries {
      return Err(Error::Retry {
        attempts: attempt + 1,
        last_result: last_result.map(Box::new),
        results,
      });
    }

    tokio::time::sleep(opts.delay_for(attempt as u32)).await;
  }

  unreachable!("loop always returns before exhausting its range")
}

pub fn default_is_retryable(
  outcome: &std::result::Result<ExecutionResult, Error>,
) -> bool {
  match outcome {
    Ok(result) => result.exit_code != Some(0) && result.exit_code != Some(255),
    Err(e) => e.is_retryable_default(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration as StdDuration;

  fn ok_result(exit_code: i32) -> ExecutionResult {
    ExecutionResult {
      command: "test".to_string(),
      stdout: Vec::new(),
      stderr: Vec::new(),
      exit_code: Some(exit_code),
      signal: None,
      duration: StdDuration::ZERO,
      cwd: None,
      host: "localhost".to_string(),
    }
  }

  #[tokio::test]
  async fn succeeds_without_retry_when_first_attempt_succeeds() {
    let calls = AtomicUsize::new(0);
    let opts = RetryOptions { jitter: false, ..Default::default() };
    let result = retry(
      || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(ok_result(0)) }
      },
      &opts,
      default_is_retryable,
    )
    .await
    .unwrap();
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn exhausts_retries_on_persistent_nonzero_exit() {
    let opts = RetryOptions {
      max_retries: 2,
      initial_delay: StdDuration::from_millis(1),
      max_delay: StdDuration::from_millis(1),
      jitter: false,
      ..Default::default()
    };
    let err = retry(
      || async { Ok(ok_result(1)) },
      &opts,
      default_is_retryable,
    )
    .await
    .unwrap_err();
    match err {
      Error::Retry { attempts, results, .. } => {
        assert_eq!(attempts, 3);
        assert_eq!(results.len(), 3);
      }
      other => panic!("expected Error::Retry, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn exhausts_retries_on_persistent_errors() {
    let opts = RetryOptions {
      max_retries: 2,
      initial_delay: StdDuration::from_millis(1),
      max_delay: StdDuration::from_millis(1),
      jitter: false,
      ..Default::default()
    };
    let err = retry(
      || async { Err(Error::Connection("refused".to_string())) },
      &opts,
      default_is_retryable,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Retry { attempts: 3, .. }));
  }
}
