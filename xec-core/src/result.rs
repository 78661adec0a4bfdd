use std::time::Duration;

/// What ran and what came back. Structurally close to komodo's `Log`
/// (stage/stdout/stderr/command/success/start_ts/end_ts) but generalized
/// with an exit code, signal, and the resolved host identity rather than a
/// pipeline "stage" label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
  pub command: String,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
  pub exit_code: Option<i32>,
  pub signal: Option<String>,
  pub duration: Duration,
  pub cwd: Option<String>,
  pub host: String,
}

impl ExecutionResult {
  pub fn success(&self) -> bool {
    self.exit_code == Some(0)
  }

  pub fn stdout_str(&self) -> String {
    String::from_utf8_lossy(&self.stdout).into_owned()
  }

  pub fn stderr_str(&self) -> String {
    String::from_utf8_lossy(&self.stderr).into_owned()
  }
}
