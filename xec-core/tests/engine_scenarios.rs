//! Cross-module scenarios exercising `Engine` end to end against the local
//! adapter, the one transport these tests can drive without external
//! network/process dependencies (SSH/Docker/K8s scenarios from the same
//! table are exercised at the unit level inside their own modules).

use std::time::Duration;

use xec_core::{Engine, Error, ParallelOptions, PoolPolicy};

fn engine() -> Engine {
  Engine::new(PoolPolicy::default(), Duration::from_secs(5))
}

#[tokio::test]
async fn local_echo_returns_stdout_and_zero_exit() {
  let engine = engine();
  let cmd = engine.build_command("echo").arg("hello").build();
  let result = engine.run(cmd).await.unwrap();
  assert_eq!(result.stdout_str(), "hello\n");
  assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn parallel_bounded_runs_every_item_within_the_limit() {
  let engine = engine();
  let cmds: Vec<_> = (1..=5)
    .map(|n| engine.build_command("echo").arg(n.to_string()).build())
    .collect();
  let opts = ParallelOptions { max_concurrency: 2, stop_on_error: false };
  let result = engine.parallel(cmds, opts).await.unwrap();
  assert_eq!(result.succeeded.len(), 5);
  assert!(result.failed.is_empty());
}

#[tokio::test]
async fn retry_exhausts_after_persistent_nonzero_exit() {
  let engine = engine();
  let opts = xec_core::RetryOptions {
    max_retries: 2,
    initial_delay: Duration::from_millis(1),
    max_delay: Duration::from_millis(1),
    jitter: false,
    ..Default::default()
  };
  let err = engine
    .retry(opts, None, || {
      engine.build_command("sh").arg("-c").arg("exit 1").shell(false).throw_on_nonzero(false).build()
    })
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
async fn throw_on_nonzero_false_never_throws_for_exit_code_reasons() {
  let engine = engine();
  let cmd = engine
    .build_command("sh")
    .arg("-c")
    .arg("exit 3")
    .throw_on_nonzero(false)
    .build();
  let result = engine.run(cmd).await.unwrap();
  assert_eq!(result.exit_code, Some(3));
}

#[tokio::test]
async fn dispose_rejects_every_subsequent_call_and_is_idempotent() {
  let engine = engine();
  engine.dispose().await.unwrap();
  engine.dispose().await.unwrap();
  let cmd = engine.build_command("echo").build();
  assert!(matches!(engine.run(cmd).await, Err(Error::Disposed)));
}

#[tokio::test]
async fn pipe_threads_stdout_through_every_stage() {
  let engine = engine();
  let cmds = vec![
    engine.build_command("echo").arg("hello world").build(),
    engine.build_command("cat").build(),
    engine.build_command("wc").arg("-w").build(),
  ];
  let result = engine.pipe(cmds).await.unwrap();
  assert_eq!(result.stdout_str().trim(), "2");
}

#[tokio::test]
async fn map_applies_fn_then_runs_all_commands() {
  let engine = engine();
  let items = vec!["one".to_string(), "two".to_string()];
  let result = engine
    .map(items, ParallelOptions::default(), |item, _i| {
      engine.build_command("echo").arg(item.clone()).build()
    })
    .await
    .unwrap();
  let mut stdouts: Vec<String> = result.succeeded.iter().map(|r| r.stdout_str().trim().to_string()).collect();
  stdouts.sort();
  assert_eq!(stdouts, vec!["one".to_string(), "two".to_string()]);
}

#[tokio::test]
async fn filter_keeps_only_commands_exiting_zero() {
  let engine = engine();
  let items = vec![0, 1, 0, 2];
  let kept = engine
    .filter(items, ParallelOptions::default(), |code, _i| {
      engine.build_command("sh").arg("-c").arg(format!("exit {code}")).throw_on_nonzero(false).build()
    })
    .await
    .unwrap();
  assert_eq!(kept, vec![0, 0]);
}
