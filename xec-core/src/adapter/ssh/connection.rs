use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Config, Handle};
use russh::ChannelMsg;
use tokio::sync::Mutex;

use crate::adapter::ssh::auth::{authenticate, ClientHandler};
use crate::command::{Command, SshAuth, Stdin};
use crate::error::{Error, Result, TimeoutPhase};
use crate::pool::PoolableSession;
use crate::result::ExecutionResult;

/// One live SSH session. Exec channels are opened per-command on the same
/// underlying transport; `Mutex` serializes the handful of operations that
/// need exclusive access to the `Handle` itself (channel creation), while
/// the channels it returns are driven independently and concurrently.
pub struct SshSession {
  handle: Mutex<Handle<ClientHandler>>,
  pub host: String,
  pub port: u16,
}

impl SshSession {
  pub async fn connect(
    host: &str,
    port: u16,
    user: &str,
    auth: &SshAuth,
    connect_timeout: Duration,
  ) -> Result<Self> {
    let config = Arc::new(Config {
      inactivity_timeout: Some(connect_timeout),
      ..Default::default()
    });
    let handler = ClientHandler { host: host.to_string() };
    let mut handle = tokio::time::timeout(
      connect_timeout,
      russh::client::connect(config, (host, port), handler),
    )
    .await
    .map_err(|_| Error::Timeout { phase: TimeoutPhase::Connect })?
    .map_err(|e| Error::Connection(format!("ssh connect to {host}:{port} failed: {e}")))?;

    authenticate(&mut handle, user, auth).await?;

    Ok(Self { handle: Mutex::new(handle), host: host.to_string(), port })
  }

  pub async fn execute(&self, cmd: &Command) -> Result<ExecutionResult> {
    let start = std::time::Instant::now();
    let line = cmd.shell_line();

    let mut channel = {
      let handle = self.handle.lock().await;
      handle
        .channel_open_session()
        .await
        .map_err(|e| Error::Connection(format!("failed to open channel: {e}")))?
    };

    channel
      .exec(true, line.as_bytes())
      .await
      .map_err(|e| Error::Adapter(format!("exec request failed: {e}")))?;

    if let Stdin::Bytes(bytes) = &cmd.stdin {
      channel
        .data(&bytes[..])
        .await
        .map_err(|e| Error::Adapter(format!("failed to write stdin: {e}")))?;
    }
    channel
      .eof()
      .await
      .map_err(|e| Error::Adapter(format!("failed to close stdin: {e}")))?;

    let drain = drain_channel(channel, cmd.max_buffer, cmd.cancellation.as_ref());
    let (stdout, stderr, exit_code) = match cmd.timeout {
      Some(timeout) => tokio::time::timeout(timeout, drain)
        .await
        .map_err(|_| Error::Timeout { phase: TimeoutPhase::Execution })??,
      None => drain.await?,
    };

    let result = ExecutionResult {
      command: cmd.command.clone(),
      stdout,
      stderr,
      exit_code,
      signal: None,
      duration: start.elapsed(),
      cwd: cmd.cwd.clone(),
      host: self.host.clone(),
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

  pub(crate) async fn handle_mut(&self) -> tokio::sync::MutexGuard<'_, Handle<ClientHandler>> {
    self.handle.lock().await
  }
}

async fn drain_channel(
  mut channel: russh::Channel<russh::client::Msg>,
  max_buffer: usize,
  cancel: Option<&tokio_util::sync::CancellationToken>,
) -> Result<(Vec<u8>, Vec<u8>, Option<i32>)> {
  let mut stdout = Vec::new();
  let mut stderr = Vec::new();
  let mut exit_code = None;

  loop {
    let msg = match cancel {
      Some(cancel) => {
        tokio::select! {
          _ = cancel.cancelled() => {
            return Err(Error::Cancellation { stdout, stderr });
          }
          msg = channel.wait() => msg,
        }
      }
      None => channel.wait().await,
    };
    let Some(msg) = msg else { break };
    match msg {
      ChannelMsg::Data { data } => {
        append_capped(&mut stdout, &data, max_buffer)?;
      }
      ChannelMsg::ExtendedData { data, ext: 1 } => {
        append_capped(&mut stderr, &data, max_buffer)?;
      }
      ChannelMsg::ExitStatus { exit_status } => {
        exit_code = Some(exit_status as i32);
      }
      ChannelMsg::Eof | ChannelMsg::Close => break,
      _ => {}
    }
  }
  Ok((stdout, stderr, exit_code))
}

fn append_capped(buf: &mut Vec<u8>, chunk: &[u8], max_buffer: usize) -> Result<()> {
  if buf.len() + chunk.len() > max_buffer {
    return Err(Error::BufferOverflow { limit: max_buffer });
  }
  buf.extend_from_slice(chunk);
  Ok(())
}

#[async_trait]
impl PoolableSession for SshSession {
  async fn check_alive(&self) -> bool {
    let handle = self.handle.lock().await;
    handle
      .channel_open_session()
      .await
      .map(|_| true)
      .unwrap_or(false)
  }

  async fn close(&self) {
    let handle = self.handle.lock().await;
    let _ = handle
      .disconnect(russh::Disconnect::ByApplication, "", "")
      .await;
  }
}
