use crate::result::ExecutionResult;

/// The tagged error kinds every engine operation can fail with (§7).
///
/// Adapter-internal failures (an `io::Error` from a child process, a russh
/// transport error, a bollard API error) are wrapped rather than matched on
/// directly, so adding a new transport never changes this enum's shape.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("validation failed: {0}")]
  Validation(String),

  #[error("connection failed: {0}")]
  Connection(String),

  #[error("authentication failed: {0}")]
  Authentication(String),

  #[error("timed out during {phase}")]
  Timeout { phase: TimeoutPhase },

  #[error("operation cancelled")]
  Cancellation { stdout: Vec<u8>, stderr: Vec<u8> },

  #[error("command exited non-zero: {exit_code:?}")]
  Execution {
    exit_code: Option<i32>,
    signal: Option<String>,
    stdout: String,
    stderr: String,
  },

  #[error("output exceeded max_buffer of {limit} bytes")]
  BufferOverflow { limit: usize },

  #[error("adapter error: {0}")]
  Adapter(String),

  #[error("retry exhausted after {attempts} attempts")]
  Retry {
    attempts: usize,
    last_result: Option<Box<ExecutionResult>>,
    results: Vec<ExecutionResult>,
  },

  #[error("handler has been disposed")]
  Disposed,

  #[error("{0} errors occurred")]
  Aggregate(Vec<Error>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
  Checkout,
  Execution,
  Connect,
}

impl std::fmt::Display for TimeoutPhase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      TimeoutPhase::Checkout => "checkout",
      TimeoutPhase::Execution => "execution",
      TimeoutPhase::Connect => "connect",
    };
    f.write_str(s)
  }
}

pub type Result<T> = ::core::result::Result<T, Error>;

impl Error {
  pub fn is_retryable_default(&self) -> bool {
    match self {
      Error::Execution { exit_code: Some(255), .. } => false,
      Error::Execution { .. } => true,
      Error::Connection(_) | Error::Timeout { .. } => true,
      Error::Validation(_)
      | Error::Authentication(_)
      | Error::Cancellation { .. }
      | Error::BufferOverflow { .. }
      | Error::Disposed => false,
      Error::Adapter(_) => true,
      Error::Retry { .. } | Error::Aggregate(_) => false,
    }
  }
}
