use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::result::ExecutionResult;

#[derive(Debug, Clone)]
pub struct ParallelOptions {
  pub max_concurrency: usize,
  pub stop_on_error: bool,
}

impl Default for ParallelOptions {
  fn default() -> Self {
    Self { max_concurrency: 8, stop_on_error: false }
  }
}

#[derive(Debug, Clone)]
pub struct ParallelResult<R> {
  pub succeeded: Vec<R>,
  pub failed: Vec<Error>,
  pub results: Vec<std::result::Result<R, Error>>,
  pub duration: Duration,
}

#[derive(Clone)]
pub struct ParallelRunner {
  opts: ParallelOptions,
}

impl ParallelRunner {
  pub fn new(opts: ParallelOptions) -> Self {
    Self { opts }
  }

  /// `all`: every item must succeed when `stop_on_error`; otherwise every
  /// item runs regardless of earlier failures and results are partitioned.
  pub async fn all<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> Result<ParallelResult<R>>
  where
    T: Send + 'static,
    R: Clone + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let start = Instant::now();
    let settled = self.run_settled(items, f, self.opts.stop_on_error).await;
    let failed: Vec<&Error> = settled.iter().filter_map(|r| r.as_ref().err()).collect();

    if self.opts.stop_on_error {
      if let Some(e) = failed.into_iter().next() {
        return Err(clone_error(e));
      }
    }

    let succeeded = settled.iter().filter_map(|r| r.as_ref().ok().cloned()).collect();
    let failed = settled
      .iter()
      .filter_map(|r| r.as_ref().err())
      .map(clone_error)
      .collect();

    Ok(ParallelResult { succeeded, failed, results: settled, duration: start.elapsed() })
  }

  /// `settled`: never rejects; every outcome (success or failure) is
  /// reported in `results`, position-ordered to match `items`.
  pub async fn settled<T, R, F, Fut>(
    &self,
    items: Vec<T>,
    f: F,
  ) -> Vec<std::result::Result<R, Error>>
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    self.run_settled(items, f, false).await
  }

  /// Shared worker behind `all`/`settled`/`some`/`every`/`filter`. When
  /// `cancel_on_error` is set, the first task to resolve `Err` cancels a
  /// token shared by every other spawned task; each task races its own
  /// future against that token, so work still in flight is dropped instead
  /// of being waited on to completion only to have its result discarded
  /// (§5's "in-flight work is signaled to cancel" on `stop_on_error`).
  async fn run_settled<T, R, F, Fut>(
    &self,
    items: Vec<T>,
    f: F,
    cancel_on_error: bool,
  ) -> Vec<std::result::Result<R, Error>>
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let semaphore = Arc::new(Semaphore::new(self.opts.max_concurrency.max(1)));
    let f = Arc::new(f);
    let cancel = CancellationToken::new();
    let mut tasks = FuturesUnordered::new();

    for (index, item) in items.into_iter().enumerate() {
      let semaphore = semaphore.clone();
      let f = f.clone();
      let cancel = cancel.clone();
      tasks.push(tokio::spawn(async move {
        let _permit = semaphore.acquire_owned().await;
        let result = tokio::select! {
          _ = cancel.cancelled() => Err(Error::Cancellation { stdout: Vec::new(), stderr: Vec::new() }),
          result = f(item) => result,
        };
        (index, result)
      }));
    }

    let mut indexed: Vec<(usize, std::result::Result<R, Error>)> = Vec::new();
    while let Some(joined) = tasks.next().await {
      match joined {
        Ok((index, result)) => {
          if cancel_on_error && result.is_err() {
            cancel.cancel();
          }
          indexed.push((index, result));
        }
        Err(e) => indexed.push((
          indexed.len(),
          Err(Error::Adapter(format!("task panicked: {e}"))),
        )),
      }
    }
    indexed.sort_by_key(|(i, _)| *i);
    indexed.into_iter().map(|(_, r)| r).collect()
  }

  /// `race`: resolves with the first completion, success or failure.
  pub async fn race<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> Result<R>
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let f = Arc::new(f);
    let mut tasks = FuturesUnordered::new();
    for item in items {
      let f = f.clone();
      tasks.push(tokio::spawn(async move { f(item).await }));
    }
    match tasks.next().await {
      Some(Ok(result)) => result,
      Some(Err(e)) => Err(Error::Adapter(format!("task panicked: {e}"))),
      None => Err(Error::Validation("race called with no items".to_string())),
    }
  }

  /// `some`: resolves `true` on first success, `false` once every item fails.
  pub async fn some<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> bool
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    self.run_settled(items, f, false).await.iter().any(|r| r.is_ok())
  }

  /// `every`: resolves `true` only if every item succeeds.
  pub async fn every<T, R, F, Fut>(&self, items: Vec<T>, f: F) -> bool
  where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    self.run_settled(items, f, false).await.iter().all(|r| r.is_ok())
  }

  /// `map`: turns each `item` (with its index) into a `C` via `to_command`,
  /// then runs every produced value through `execute` the way `all` does.
  /// Matches the table's "apply fn(item,i) to produce commands, then all".
  pub async fn map<T, C, R, ToCmd, F, Fut>(
    &self,
    items: Vec<T>,
    to_command: ToCmd,
    execute: F,
  ) -> Result<ParallelResult<R>>
  where
    T: Send + 'static,
    C: Send + 'static,
    R: Clone + Send + 'static,
    ToCmd: Fn(&T, usize) -> C,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    let commands: Vec<C> = items.iter().enumerate().map(|(i, item)| to_command(item, i)).collect();
    self.all(commands, execute).await
  }

  /// `filter`: runs each `item`'s produced command and keeps the original
  /// item wherever execution succeeded with `exit_code == Some(0)`; items
  /// whose command failed or exited non-zero are dropped. Position-ordered
  /// to match `items`, same as every other operator here.
  pub async fn filter<T, C, ToCmd, F, Fut>(
    &self,
    items: Vec<T>,
    to_command: ToCmd,
    execute: F,
  ) -> Vec<T>
  where
    T: Send + 'static,
    C: Send + 'static,
    ToCmd: Fn(&T, usize) -> C,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ExecutionResult>> + Send + 'static,
  {
    let commands: Vec<C> = items.iter().enumerate().map(|(i, item)| to_command(item, i)).collect();
    let settled = self.run_settled(commands, execute, false).await;
    items
      .into_iter()
      .zip(settled)
      .filter_map(|(item, r)| match r {
        Ok(result) if result.exit_code == Some(0) => Some(item),
        _ => None,
      })
      .collect()
  }
}

fn clone_error(e: &Error) -> Error {
  Error::Adapter(e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration as StdDuration;

  #[tokio::test]
  async fn settled_preserves_input_order() {
    let runner = ParallelRunner::new(ParallelOptions { max_concurrency: 3, stop_on_error: false });
    let items = vec![5u64, 1, 3, 2, 4];
    let results: Vec<std::result::Result<u64, Error>> = runner
      .settled(items, |n| async move {
        tokio::time::sleep(StdDuration::from_millis(n)).await;
        Ok(n)
      })
      .await;
    let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, vec![5, 1, 3, 2, 4]);
  }

  #[tokio::test]
  async fn bounded_concurrency_never_exceeds_limit() {
    let runner = ParallelRunner::new(ParallelOptions { max_concurrency: 2, stop_on_error: false });
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let items: Vec<usize> = (0..6).collect();
    let _: Vec<std::result::Result<(), Error>> = runner
      .settled(items, {
        let in_flight = in_flight.clone();
        let max_seen = max_seen.clone();
        move |_| {
          let in_flight = in_flight.clone();
          let max_seen = max_seen.clone();
          async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
          }
        }
      })
      .await;
    assert!(max_seen.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn every_is_false_when_any_item_fails() {
    let runner = ParallelRunner::new(ParallelOptions::default());
    let items = vec![1, 2, 3];
    let ok = runner
      .every(items, |n| async move {
        if n == 2 {
          Err(Error::Validation("bad".to_string()))
        } else {
          Ok(n)
        }
      })
      .await;
    assert!(!ok);
  }

  #[tokio::test]
  async fn some_is_true_when_one_item_succeeds() {
    let runner = ParallelRunner::new(ParallelOptions::default());
    let items = vec![1, 2, 3];
    let ok = runner
      .some(items, |n| async move {
        if n == 2 {
          Ok(n)
        } else {
          Err(Error::Validation("bad".to_string()))
        }
      })
      .await;
    assert!(ok);
  }

  #[tokio::test]
  async fn map_produces_commands_and_runs_all() {
    let runner = ParallelRunner::new(ParallelOptions::default());
    let items = vec!["a".to_string(), "b".to_string()];
    let result = runner
      .map(
        items,
        |item, i| format!("{item}-{i}"),
        |cmd| async move { Ok::<_, Error>(cmd.to_uppercase()) },
      )
      .await
      .unwrap();
    assert_eq!(result.succeeded, vec!["A-0".to_string(), "B-1".to_string()]);
  }

  #[tokio::test]
  async fn filter_keeps_only_zero_exit_items() {
    let runner = ParallelRunner::new(ParallelOptions::default());
    let items = vec![0, 1, 2];
    let kept = runner
      .filter(
        items,
        |item, _i| *item,
        |code| async move {
          Ok(ExecutionResult {
            command: "x".to_string(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(code),
            signal: None,
            duration: StdDuration::from_millis(0),
            cwd: None,
            host: "local".to_string(),
          })
        },
      )
      .await;
    assert_eq!(kept, vec![0]);
  }
}
