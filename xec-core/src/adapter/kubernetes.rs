use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;

use crate::adapter::{Adapter, LogStreamOptions, LogStreaming};
use crate::command::{AdapterDescriptor, Command, Stdin};
use crate::error::{Error, Result, TimeoutPhase};
use crate::events::{Event, EventBus};
use crate::result::ExecutionResult;

/// Wraps the `kubectl` binary rather than linking a Kubernetes API client:
/// every operation here (`exec`, `logs`, `cp`, `port-forward`) is a
/// subprocess spawn with the same "spawn a child, read its pipes" shape as
/// [`crate::adapter::local::LocalAdapter`], keeping the adapter's
/// dependency surface aligned with the rest of this crate instead of
/// adding a full cluster client for one transport.
pub struct KubernetesAdapter {
  kubectl_path: String,
  events: EventBus,
}

impl KubernetesAdapter {
  pub fn new() -> Self {
    Self::with_events(EventBus::default())
  }

  pub fn with_events(events: EventBus) -> Self {
    Self { kubectl_path: "kubectl".to_string(), events }
  }

  pub fn with_kubectl_path(path: impl Into<String>) -> Self {
    Self { kubectl_path: path.into(), events: EventBus::default() }
  }
}

impl Default for KubernetesAdapter {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Adapter for KubernetesAdapter {
  #[tracing::instrument(skip(self, cmd), fields(command = %cmd.command))]
  async fn execute(&self, cmd: &Command) -> Result<ExecutionResult> {
    let (pod, namespace, container, exec_flags, tty, stdin_flag) = match &cmd.adapter {
      AdapterDescriptor::Kubernetes {
        pod,
        namespace,
        container,
        exec_flags,
        tty,
        stdin,
      } => (pod, namespace, container, exec_flags, *tty, *stdin),
      _ => {
        return Err(Error::Validation(
          "KubernetesAdapter requires an AdapterDescriptor::Kubernetes".to_string(),
        ))
      }
    };
    if pod.is_empty() {
      return Err(Error::Validation(
        "Pod name or selector is required".to_string(),
      ));
    }

    let mut argv = vec!["exec".to_string()];
    if let Some(ns) = namespace {
      argv.push("-n".to_string());
      argv.push(ns.clone());
    }
    if let Some(c) = container {
      argv.push("-c".to_string());
      argv.push(c.clone());
    }
    if tty {
      argv.push("--tty".to_string());
    }
    if stdin_flag {
      argv.push("--stdin".to_string());
    }
    argv.extend(exec_flags.iter().cloned());
    argv.push(pod.clone());
    argv.push("--".to_string());
    argv.push("sh".to_string());
    argv.push("-c".to_string());
    argv.push(cmd.shell_line());

    let start = Instant::now();
    let mut child = TokioCommand::new(&self.kubectl_path)
      .args(&argv)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|e| Error::Adapter(format!("failed to spawn kubectl: {e}")))?;

    if let Stdin::Bytes(bytes) = &cmd.stdin {
      if let Some(mut child_stdin) = child.stdin.take() {
        let _ = child_stdin.write_all(bytes).await;
      }
    } else {
      drop(child.stdin.take());
    }

    let cancel = cmd.cancellation.as_ref();
    let wait = async {
      let out = child.stdout.take().expect("piped stdout");
      let err = child.stderr.take().expect("piped stderr");
      let (out, err) = tokio::join!(
        read_all_capped(out, cmd.max_buffer, cancel),
        read_all_capped(err, cmd.max_buffer, cancel)
      );
      let status = child.wait().await;
      (out, err, status)
    };

    let (out, err, status) = match cmd.timeout {
      Some(timeout) => match tokio::time::timeout(timeout, wait).await {
        Ok(v) => v,
        Err(_) => {
          let _ = child.kill().await;
          return Err(Error::Timeout { phase: TimeoutPhase::Execution });
        }
      },
      None => wait.await,
    };

    let out_outcome = out?;
    let err_outcome = err?;
    if out_outcome.is_cancelled() || err_outcome.is_cancelled() {
      let _ = child.kill().await;
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
      signal: None,
      duration: start.elapsed(),
      cwd: cmd.cwd.clone(),
      host: pod.clone(),
    };

    if cmd.throw_on_nonzero && !result.success() {
      return Err(Error::Execution {
        exit_code: result.exit_code,
        signal: None,
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
/// cancellation, mirroring [`crate::adapter::local`]'s read outcome so a
/// cancelled `kubectl exec` can still report partial output (§5).
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

async fn read_all_capped(
  mut reader: impl tokio::io::AsyncRead + Unpin,
  max_buffer: usize,
  cancel: Option<&tokio_util::sync::CancellationToken>,
) -> Result<ReadOutcome> {
  use tokio::io::AsyncReadExt;
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

/// Handle for a `kubectl logs -f`/`port-forward` child process. `stop()`
/// kills the child; subsequent calls are a no-op.
pub struct LogStreamHandle {
  child: Arc<Mutex<Option<Child>>>,
}

impl LogStreamHandle {
  pub async fn stop(&self) {
    if let Some(mut child) = self.child.lock().await.take() {
      let _ = child.kill().await;
    }
  }
}

#[async_trait]
impl LogStreaming for KubernetesAdapter {
  async fn stream_logs(
    &self,
    opts: LogStreamOptions,
    on_data: Box<dyn Fn(Vec<u8>) + Send + Sync>,
  ) -> Result<LogStreamHandle> {
    let pod = opts.pod.clone();
    let namespace = opts.namespace.clone();
    let container = opts.container.clone();
    self
      .stream_logs_for_pod(Some(&pod), namespace.as_deref(), container.as_deref(), opts, on_data)
      .await
  }
}

impl KubernetesAdapter {
  pub async fn stream_logs_for_pod(
    &self,
    pod: Option<&str>,
    namespace: Option<&str>,
    container: Option<&str>,
    opts: LogStreamOptions,
    on_data: Box<dyn Fn(Vec<u8>) + Send + Sync>,
  ) -> Result<LogStreamHandle> {
    let pod = pod.ok_or_else(|| {
      Error::Validation("Pod name or selector is required".to_string())
    })?;
    let mut argv = vec!["logs".to_string()];
    if let Some(ns) = namespace {
      argv.push("-n".to_string());
      argv.push(ns.to_string());
    }
    if let Some(c) = container {
      argv.push("-c".to_string());
      argv.push(c.to_string());
    }
    if opts.follow {
      argv.push("-f".to_string());
    }
    if let Some(tail) = opts.tail {
      argv.push(format!("--tail={tail}"));
    }
    if opts.previous {
      argv.push("--previous".to_string());
    }
    if opts.timestamps {
      argv.push("--timestamps".to_string());
    }
    argv.push(pod.to_string());

    let mut child = TokioCommand::new(&self.kubectl_path)
      .args(&argv)
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .spawn()
      .map_err(|e| Error::Adapter(format!("failed to spawn kubectl logs: {e}")))?;

    let stdout = child.stdout.take().expect("piped stdout");
    tokio::spawn(async move {
      let mut lines = BufReader::new(stdout).lines();
      while let Ok(Some(line)) = lines.next_line().await {
        on_data(line.into_bytes());
      }
    });

    Ok(LogStreamHandle { child: Arc::new(Mutex::new(Some(child))) })
  }

  /// Spawns `kubectl cp` for a single file or directory. `direction`
  /// decides whether `pod_path` is the source (pod -> local) or the
  /// destination (local -> pod).
  pub async fn copy_files(
    &self,
    direction: CopyDirection,
    local_path: &str,
    pod: &str,
    pod_path: &str,
    namespace: Option<&str>,
    container: Option<&str>,
  ) -> Result<()> {
    let pod_spec = match container {
      Some(c) => format!("{pod}:{pod_path}:{c}"),
      None => format!("{pod}:{pod_path}"),
    };
    let (src, dst) = match direction {
      CopyDirection::PodToLocal => (pod_spec, local_path.to_string()),
      CopyDirection::LocalToPod => (local_path.to_string(), pod_spec),
    };
    let mut argv = vec!["cp".to_string(), src, dst];
    if let Some(ns) = namespace {
      argv.push("-n".to_string());
      argv.push(ns.to_string());
    }
    let status = TokioCommand::new(&self.kubectl_path)
      .args(&argv)
      .status()
      .await
      .map_err(|e| Error::Adapter(format!("failed to spawn kubectl cp: {e}")))?;
    if !status.success() {
      return Err(Error::Adapter(format!(
        "kubectl cp exited with {:?}",
        status.code()
      )));
    }
    Ok(())
  }

  /// Spawns `kubectl port-forward pod local_port:remote_port` and waits for
  /// its "Forwarding from" banner before returning, so the handle's
  /// `local_port` always reflects the port the child actually bound -
  /// `local_port == 0` asks kubectl to pick one (kubectl itself delegates
  /// that to the OS the same way [`crate::adapter::ssh::tunnel::open_tunnel`]
  /// does for SSH tunnels).
  pub async fn port_forward(
    &self,
    pod: &str,
    namespace: Option<&str>,
    local_port: u16,
    remote_port: u16,
  ) -> Result<PortForwardHandle> {
    if pod.is_empty() {
      return Err(Error::Validation(
        "Pod name or selector is required".to_string(),
      ));
    }
    let mut argv = vec!["port-forward".to_string()];
    if let Some(ns) = namespace {
      argv.push("-n".to_string());
      argv.push(ns.to_string());
    }
    argv.push(pod.to_string());
    argv.push(format!("{local_port}:{remote_port}"));

    let mut child = TokioCommand::new(&self.kubectl_path)
      .args(&argv)
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .spawn()
      .map_err(|e| Error::Adapter(format!("failed to spawn kubectl port-forward: {e}")))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();
    let bound_port = tokio::time::timeout(Duration::from_secs(10), async {
      while let Ok(Some(line)) = lines.next_line().await {
        if let Some(port) = parse_forwarded_port(&line) {
          return Some(port);
        }
      }
      None
    })
    .await
    .map_err(|_| Error::Timeout { phase: TimeoutPhase::Connect })?
    .ok_or_else(|| {
      Error::Connection("kubectl port-forward closed before forwarding started".to_string())
    })?;

    tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    self.events.publish(Event::K8sPortForwardCreated {
      pod: pod.to_string(),
      local_port: bound_port,
      remote_port,
    });

    Ok(PortForwardHandle {
      pod: pod.to_string(),
      local_port: bound_port,
      remote_port,
      child: Arc::new(Mutex::new(Some(child))),
      events: self.events.clone(),
    })
  }
}

fn parse_forwarded_port(line: &str) -> Option<u16> {
  let after = line.strip_prefix("Forwarding from ")?;
  let addr = after.split(" -> ").next()?;
  addr.rsplit_once(':')?.1.trim().parse().ok()
}

/// Handle for a live `kubectl port-forward` child process, returned by
/// [`KubernetesAdapter::port_forward`]. `close` kills the child; subsequent
/// calls are a no-op.
pub struct PortForwardHandle {
  pub pod: String,
  pub local_port: u16,
  pub remote_port: u16,
  child: Arc<Mutex<Option<Child>>>,
  events: EventBus,
}

impl PortForwardHandle {
  pub async fn is_open(&self) -> bool {
    self.child.lock().await.is_some()
  }

  pub async fn close(&self) {
    if let Some(mut child) = self.child.lock().await.take() {
      let _ = child.kill().await;
      self.events.publish(Event::K8sPortForwardClosed {
        pod: self.pod.clone(),
        local_port: self.local_port,
        remote_port: self.remote_port,
      });
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
  PodToLocal,
  LocalToPod,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn execute_rejects_missing_pod_name() {
    let adapter = KubernetesAdapter::new();
    let cmd = Command::builder("echo")
      .adapter(AdapterDescriptor::Kubernetes {
        pod: String::new(),
        namespace: None,
        container: None,
        exec_flags: vec![],
        tty: false,
        stdin: false,
      })
      .build();
    let err = adapter.execute(&cmd).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[test]
  fn parses_forwarded_port_from_kubectl_banner() {
    assert_eq!(
      parse_forwarded_port("Forwarding from 127.0.0.1:38765 -> 8080"),
      Some(38765)
    );
    assert_eq!(
      parse_forwarded_port("Forwarding from [::1]:38765 -> 8080"),
      Some(38765)
    );
    assert_eq!(parse_forwarded_port("Handling connection for 38765"), None);
  }

  #[tokio::test]
  async fn port_forward_rejects_missing_pod_name() {
    let adapter = KubernetesAdapter::new();
    let err = adapter
      .port_forward("", None, 0, 8080)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }
}
