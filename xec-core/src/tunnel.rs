use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A locally-bound TCP listener whose accepted connections are piped over an
/// SSH `direct-tcpip` channel to `remote_host:remote_port`. Closing drops
/// every in-flight piped connection and stops accepting new ones.
pub struct Tunnel {
  pub local_host: String,
  pub local_port: u16,
  pub remote_host: String,
  pub remote_port: u16,
  cancel: CancellationToken,
  closed: Arc<Notify>,
}

impl Tunnel {
  pub(crate) fn new(
    local_host: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
    closed: Arc<Notify>,
  ) -> Self {
    Self {
      local_host,
      local_port,
      remote_host,
      remote_port,
      cancel,
      closed,
    }
  }

  pub fn is_open(&self) -> bool {
    !self.cancel.is_cancelled()
  }

  /// A clone of the `Notify` the listener task wakes once it has stopped
  /// accepting, for callers (e.g. [`crate::adapter::ssh::SshAdapter`])
  /// that want to react to a tunnel closing without being the one who
  /// called [`Tunnel::close`] - untracking it from `active_tunnels` and
  /// emitting `ssh:tunnel-closed` regardless of which path triggered the
  /// close.
  pub(crate) fn closed_notify(&self) -> Arc<Notify> {
    self.closed.clone()
  }

  pub fn handle(&self) -> TunnelHandle {
    TunnelHandle {
      local_host: self.local_host.clone(),
      local_port: self.local_port,
      remote_host: self.remote_host.clone(),
      remote_port: self.remote_port,
      cancel: self.cancel.clone(),
    }
  }

  /// Stops accepting new local connections and terminates every live piped
  /// channel. Waits for the listener task to acknowledge shutdown so a
  /// `connect` to `local_port` immediately after `close()` reliably fails.
  pub async fn close(&self) {
    if self.cancel.is_cancelled() {
      return;
    }
    self.cancel.cancel();
    self.closed.notified().await;
  }
}

/// A cheap, cloneable reference to a live tunnel, returned by
/// `Tunneling::list_tunnels` for observability without exposing the
/// listener task itself.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
  pub local_host: String,
  pub local_port: u16,
  pub remote_host: String,
  pub remote_port: u16,
  cancel: CancellationToken,
}

impl TunnelHandle {
  pub fn is_open(&self) -> bool {
    !self.cancel.is_cancelled()
  }

  pub fn key(&self) -> String {
    format!(
      "{}-{}:{}",
      self.local_port, self.remote_host, self.remote_port
    )
  }

  /// Fire-and-forget cancellation, used when only a [`TunnelHandle`] is
  /// available (e.g. from an adapter's `dispose()`), where there is no
  /// `Notify` to await acknowledgement on the way [`Tunnel::close`] has.
  pub fn close(&self) {
    self.cancel.cancel();
  }
}
