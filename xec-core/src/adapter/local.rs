use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;

use crate::adapter::Adapter;
use crate::command::{Command, Stdin};
use crate::error::{Error, Result, TimeoutPhase};
use crate::result::ExecutionResult;

/// Grace period between SIGTERM and SIGKILL when a command outlives its
/// `timeout`.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Spawns commands with the host OS process API, matching komodo's
/// `run_command::async_run_command` in spirit but implemented directly so
/// it can honor per-command `cwd`/`env`/`timeout`/`stdin`/`max_buffer`
/// rather than delegating to a crate built for a single fixed shape of
/// "run this string, capture everything."
pub struct LocalAdapter;

impl LocalAdapter {
  pub fn new() -> Self {
    Self
  }
}

impl Default for LocalAdapter {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Adapter for LocalAdapter {
  #[tracing::instrument(skip(self, cmd), fields(command = %cmd.command))]
  async fn execute(&self, cmd: &Command) -> Result<ExecutionResult> {
    let argv = cmd.resolve_argv();
    let mut builder = TokioCommand::new(&argv[0]);
    builder.args(&argv[1..]);
    builder.stdin(Stdio::piped());
    builder.stdout(Stdio::piped());
    builder.stderr(Stdio::piped());
    if let Some(cwd) = &cmd.cwd {
      builder.current_dir(cwd);
    }
    if !cmd.inherit_env {
      builder.env_clear();
    }
    if !cmd.env.is_empty() {
      builder.envs(cmd.env.iter());
    }

    let start = Instant::now();
    let mut child = builder
      .spawn()
      .map_err(|e| Error::Adapter(format!("failed to spawn: {e}")))?;

    if let Stdin::Bytes(bytes) = &cmd.stdin {
      if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(bytes).await;
      }
    } else {
      drop(child.stdin.take());
    }

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let max_buffer = cmd.max_buffer;
    let cancel = cmd.cancellation.as_ref();
    let read_stdout = read_capped_cancelable(&mut stdout, max_buffer, cancel);
    let read_stderr = read_capped_cancelable(&mut stderr, max_buffer, cancel);

    let wait = async {
      let (out, err) = tokio::join!(read_stdout, read_stderr);
      let status = child.wait().await;
      (out, err, status)
    };

    let (out_res, err_res, status) = match cmd.timeout {
      Some(timeout) => match tokio::time::timeout(timeout, wait).await {
        Ok(v) => v,
        Err(_) => {
          terminate(&mut child).await;
          return Err(Error::Timeout { phase: TimeoutPhase::Execution });
        }
      },
      None => wait.await,
    };

    let out_outcome = out_res?;
    let err_outcome = err_res?;
    if out_outcome.is_cancelled() || err_outcome.is_cancelled() {
      terminate(&mut child).await;
      return Err(Error::Cancellation {
        stdout: out_outcome.into_buf(),
        stderr: err_outcome.into_buf(),
      });
    }
    let stdout = out_outcome.into_buf();
    let stderr = err_outcome.into_buf();
    let status = status.map_err(|e| Error::Adapter(format!("wait failed: {e}")))?;

    let result = ExecutionResult {
      command: cmd.command.clone(),
      stdout,
      stderr,
      exit_code: status.code(),
      signal: unix_signal_name(&status),
      duration: start.elapsed(),
      cwd: cmd.cwd.clone(),
      host: "localhost".to_string(),
    };

    if cmd.throw_on_nonzero && !result.success() {
      return Err(Error::Execution {
        exit_code: result.exit_code,
        signal: result.signal.clone(),
        stdout: result.stdout_str(),
        stderr: result.stderr_str(),
      });
    }

    Ok(result)
  }

  async fn dispose(&self) -> Result<()> {
    Ok(())
  }
}

/// Whether a capped read finished normally or was cut short by
/// cancellation; either way the bytes accumulated before that point are
/// preserved so a cancelled command can still report partial output (§5).
enum ReadOutcome {
  Done(Vec<u8>),
  Cancelled(Vec<u8>),
}

impl ReadOutcome {
  fn is_cancelled(&self) -> bool {
    matches!(self, ReadOutcome::Cancelled(_))
  }

  fn into_buf(self) -> Vec<u8> {
    match self {
      ReadOutcome::Done(buf) | ReadOutcome::Cancelled(buf) => buf,
    }
  }
}

async fn read_capped_cancelable(
  reader: &mut (impl tokio::io::AsyncRead + Unpin),
  max_buffer: usize,
  cancel: Option<&tokio_util::sync::CancellationToken>,
) -> Result<ReadOutcome> {
  let mut buf = Vec::new();
  let mut chunk = [0u8; 8192];
  loop {
    let n = match cancel {
      Some(cancel) => {
        tokio::select! {
          _ = cancel.cancelled() => return Ok(ReadOutcome::Cancelled(buf)),
          n = reader.read(&mut chunk) => n.map_err(|e| Error::Adapter(format!("read failed: {e}")))?,
        }
      }
      None => reader
        .read(&mut chunk)
        .await
        .map_err(|e| Error::Adapter(format!("read failed: {e}")))?,
    };
    if n == 0 {
      break;
    }
    if buf.len() + n > max_buffer {
      return Err(Error::BufferOverflow { limit: max_buffer });
    }
    buf.extend_from_slice(&chunk[..n]);
  }
  Ok(ReadOutcome::Done(buf))
}

async fn terminate(child: &mut tokio::process::Child) {
  if let Some(pid) = child.id() {
    send_signal(pid, libc::SIGTERM);
  }
  if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
    if let Some(pid) = child.id() {
      send_signal(pid, libc::SIGKILL);
    }
    let _ = child.wait().await;
  }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) {
  unsafe {
    libc::kill(pid as i32, signal);
  }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: i32) {}

#[cfg(unix)]
fn unix_signal_name(status: &std::process::ExitStatus) -> Option<String> {
  use std::os::unix::process::ExitStatusExt;
  status.signal().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn unix_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn echo_returns_stdout() {
    let adapter = LocalAdapter::new();
    let cmd = Command::builder("echo").arg("hello").build();
    let result = adapter.execute(&cmd).await.unwrap();
    assert_eq!(result.stdout_str().trim(), "hello");
    assert_eq!(result.exit_code, Some(0));
  }

  #[tokio::test]
  async fn nonzero_exit_throws_by_default() {
    let adapter = LocalAdapter::new();
    let cmd = Command::builder("sh").arg("-c").arg("exit 3").build();
    let err = adapter.execute(&cmd).await.unwrap_err();
    assert!(matches!(err, Error::Execution { exit_code: Some(3), .. }));
  }

  #[tokio::test]
  async fn nonzero_exit_does_not_throw_when_disabled() {
    let adapter = LocalAdapter::new();
    let cmd = Command::builder("sh")
      .arg("-c")
      .arg("exit 3")
      .throw_on_nonzero(false)
      .build();
    let result = adapter.execute(&cmd).await.unwrap();
    assert_eq!(result.exit_code, Some(3));
  }

  #[tokio::test]
  async fn timeout_kills_long_running_command() {
    let adapter = LocalAdapter::new();
    let cmd = Command::builder("sleep")
      .arg("10")
      .timeout(Duration::from_millis(50))
      .build();
    let err = adapter.execute(&cmd).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { phase: TimeoutPhase::Execution }));
  }

  #[tokio::test]
  async fn cancellation_stops_a_running_command() {
    let adapter = LocalAdapter::new();
    let token = tokio_util::sync::CancellationToken::new();
    let cmd = Command::builder("sleep")
      .arg("10")
      .cancellation(token.clone())
      .build();
    let run = tokio::spawn(async move { adapter.execute(&cmd).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancellation { .. }));
  }
}
