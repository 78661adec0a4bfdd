pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod ssh;

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::result::ExecutionResult;
use crate::tunnel::Tunnel;
use crate::Command;

/// The capability every transport must provide. Optional capabilities
/// (file transfer, tunneling, log streaming) are separate traits rather
/// than `Option<fn>` fields on this one: Rust has no `instanceof` to test
/// "does this adapter support uploads" at the call site the way the
/// source's duck-typed `(adapter as any).uploadFile` does, so the registry
/// queries for the additional trait object explicitly instead
/// (REDESIGN FLAGS, inheritance hierarchies).
#[async_trait]
pub trait Adapter: Send + Sync {
  async fn execute(&self, cmd: &Command) -> Result<ExecutionResult>;

  /// Idempotent. Errors are logged by the caller and never propagated past
  /// `Engine::dispose`, so implementations are free to report real failures.
  async fn dispose(&self) -> Result<()>;
}

#[async_trait]
pub trait FileTransfer: Send + Sync {
  async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;
  async fn download_file(&self, remote: &str, local: &Path) -> Result<()>;
  async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()>;
  async fn download_directory(&self, remote: &str, local: &Path) -> Result<()>;
}

#[async_trait]
pub trait Tunneling: Send + Sync {
  async fn tunnel(&self, opts: TunnelOptions) -> Result<Tunnel>;
  async fn list_tunnels(&self) -> Vec<crate::tunnel::TunnelHandle>;
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
  pub local_host: String,
  pub local_port: u16,
  pub remote_host: String,
  pub remote_port: u16,
}

#[async_trait]
pub trait LogStreaming: Send + Sync {
  async fn stream_logs(
    &self,
    opts: LogStreamOptions,
    on_data: Box<dyn Fn(Vec<u8>) + Send + Sync>,
  ) -> Result<crate::adapter::kubernetes::LogStreamHandle>;
}

#[derive(Debug, Clone, Default)]
pub struct LogStreamOptions {
  /// Pod name or selector to stream logs from. Required by every adapter
  /// that implements this trait; `stream_logs` validates it, mirroring
  /// `Adapter::execute`'s own pod-name validation.
  pub pod: String,
  pub namespace: Option<String>,
  pub container: Option<String>,
  pub follow: bool,
  pub tail: Option<u32>,
  pub previous: bool,
  pub timestamps: bool,
}
