use std::time::Instant;

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;

use crate::adapter::Adapter;
use crate::command::{AdapterDescriptor, Command};
use crate::error::{Error, Result};
use crate::result::ExecutionResult;

/// Execs into a running container via the Docker Engine API
/// (`create_exec`/`start_exec`), the same `bollard` entry points komodo's
/// own periphery binary uses for container introspection, rather than
/// shelling out to the `docker` CLI.
pub struct DockerAdapter {
  docker: Docker,
}

impl DockerAdapter {
  pub fn connect_with_local_defaults() -> Result<Self> {
    let docker = Docker::connect_with_local_defaults()
      .map_err(|e| Error::Connection(format!("docker connect failed: {e}")))?;
    Ok(Self { docker })
  }

  pub fn from_docker(docker: Docker) -> Self {
    Self { docker }
  }
}

#[async_trait]
impl Adapter for DockerAdapter {
  #[tracing::instrument(skip(self, cmd), fields(command = %cmd.command))]
  async fn execute(&self, cmd: &Command) -> Result<ExecutionResult> {
    let (container, container_user) = match &cmd.adapter {
      AdapterDescriptor::Docker { container, container_user } => {
        (container, container_user)
      }
      _ => {
        return Err(Error::Validation(
          "DockerAdapter requires an AdapterDescriptor::Docker".to_string(),
        ))
      }
    };
    if container.is_empty() {
      return Err(Error::Validation("Container name is required".to_string()));
    }

    let argv = cmd.resolve_argv();
    let env: Vec<String> =
      cmd.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let options = CreateExecOptions {
      cmd: Some(argv),
      attach_stdin: Some(matches!(cmd.stdin, crate::command::Stdin::Bytes(_))),
      attach_stdout: Some(true),
      attach_stderr: Some(true),
      env: Some(env),
      working_dir: cmd.cwd.clone(),
      user: container_user.clone(),
      ..Default::default()
    };

    let start = Instant::now();
    let exec = self
      .docker
      .create_exec(container, options)
      .await
      .map_err(|e| Error::Adapter(format!("create_exec failed: {e}")))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let cancel = cmd.cancellation.clone();

    let exec_future = async {
      match self
        .docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| Error::Adapter(format!("start_exec failed: {e}")))?
      {
        StartExecResults::Attached { mut output, .. } => {
          loop {
            let chunk = match &cancel {
              Some(cancel) => {
                tokio::select! {
                  _ = cancel.cancelled() => return Err(Error::Cancellation {
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                  }),
                  chunk = output.next() => chunk,
                }
              }
              None => output.next().await,
            };
            let Some(chunk) = chunk else { break };
            let chunk =
              chunk.map_err(|e| Error::Adapter(format!("exec stream error: {e}")))?;
            match chunk {
              bollard::container::LogOutput::StdOut { message } => {
                append_capped(&mut stdout, &message, cmd.max_buffer)?;
              }
              bollard::container::LogOutput::StdErr { message } => {
                append_capped(&mut stderr, &message, cmd.max_buffer)?;
              }
              _ => {}
            }
          }
          Ok(())
        }
        StartExecResults::Detached => Ok(()),
      }
    };

    match cmd.timeout {
      Some(timeout) => tokio::time::timeout(timeout, exec_future)
        .await
        .map_err(|_| Error::Timeout { phase: crate::error::TimeoutPhase::Execution })??,
      None => exec_future.await?,
    }

    let inspect = self
      .docker
      .inspect_exec(&exec.id)
      .await
      .map_err(|e| Error::Adapter(format!("inspect_exec failed: {e}")))?;
    let exit_code = inspect.exit_code.map(|c| c as i32);

    let result = ExecutionResult {
      command: cmd.command.clone(),
      stdout,
      stderr,
      exit_code,
      signal: None,
      duration: start.elapsed(),
      cwd: cmd.cwd.clone(),
      host: container.clone(),
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

fn append_capped(
  buf: &mut Vec<u8>,
  chunk: &bytes::Bytes,
  max_buffer: usize,
) -> Result<()> {
  if buf.len() + chunk.len() > max_buffer {
    return Err(Error::BufferOverflow { limit: max_buffer });
  }
  buf.extend_from_slice(chunk);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_missing_container_name() {
    let cmd = Command::builder("echo")
      .adapter(AdapterDescriptor::Docker {
        container: String::new(),
        container_user: None,
      })
      .build();
    assert!(matches!(&cmd.adapter, AdapterDescriptor::Docker { container, .. } if container.is_empty()));
  }
}
