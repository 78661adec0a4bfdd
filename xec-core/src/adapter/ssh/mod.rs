pub mod auth;
pub mod connection;
pub mod tunnel;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;

use crate::adapter::{Adapter, FileTransfer, TunnelOptions, Tunneling};
use crate::command::{AdapterDescriptor, Command, SshAuth, SudoMethod, Stdin};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, TunnelKind};
use crate::pool::{ConnectionFactory, ConnectionKey, ConnectionPool, PoolPolicy};
use crate::result::ExecutionResult;
use crate::secure_password::SecurePasswordHandler;
use crate::tunnel::TunnelHandle;

use connection::SshSession;

/// Every tunnel this adapter currently tracks, plus whether the adapter has
/// started disposing. Guarded by one lock so `tunnel()` can check-and-insert
/// and `dispose()` can check-and-drain atomically against each other - no
/// window where `dispose()` runs between a tunnel accepting connections and
/// its handle landing in the map.
#[derive(Default)]
struct TunnelRegistry {
  tunnels: HashMap<String, TunnelHandle>,
  disposed: bool,
}

#[derive(Clone)]
struct ConnectParams {
  host: String,
  port: u16,
  user: String,
  auth: SshAuth,
}

struct SshConnectionFactory {
  params: ConnectParams,
  connect_timeout: Duration,
}

#[async_trait]
impl ConnectionFactory for SshConnectionFactory {
  type Session = SshSession;

  async fn connect(&self, _key: &ConnectionKey) -> Result<SshSession> {
    SshSession::connect(
      &self.params.host,
      self.params.port,
      &self.params.user,
      &self.params.auth,
      self.connect_timeout,
    )
    .await
  }
}

/// Executes over SSH against one bound target `(host, port, user, auth)`,
/// pooling however many concurrent sessions that target needs (§4.5) and
/// tracking every tunnel opened through it so [`Adapter::dispose`] can
/// close them all together. An engine that talks to several hosts holds
/// one `SshAdapter` per host, the way its registry resolves a target
/// descriptor to a specific adapter instance (§4.2).
pub struct SshAdapter {
  target: ConnectionKey,
  pool: Arc<ConnectionPool<SshConnectionFactory>>,
  connect_timeout: Duration,
  active_tunnels: Arc<Mutex<TunnelRegistry>>,
  askpass: SecurePasswordHandler,
  events: EventBus,
  keep_alive_cancel: CancellationToken,
}

impl SshAdapter {
  pub fn new(
    host: impl Into<String>,
    port: u16,
    user: impl Into<String>,
    auth: SshAuth,
    policy: PoolPolicy,
    connect_timeout: Duration,
  ) -> Result<Self> {
    Self::with_events(host, port, user, auth, policy, connect_timeout, EventBus::default())
  }

  pub fn with_events(
    host: impl Into<String>,
    port: u16,
    user: impl Into<String>,
    auth: SshAuth,
    policy: PoolPolicy,
    connect_timeout: Duration,
    events: EventBus,
  ) -> Result<Self> {
    let host = host.into();
    let user = user.into();
    if host.is_empty() || user.is_empty() {
      return Err(Error::Validation(
        "SSH adapter requires both host and username".to_string(),
      ));
    }
    if port == 0 {
      return Err(Error::Validation("SSH port must be in 1..=65535".to_string()));
    }
    let target = ConnectionKey::new(&user, &host, port, &auth);
    let factory = SshConnectionFactory {
      params: ConnectParams { host, port, user, auth },
      connect_timeout,
    };
    let keep_alive = policy.keep_alive;
    let keep_alive_interval = policy.keep_alive_interval;
    let pool = ConnectionPool::new(policy, factory);
    let keep_alive_cancel = CancellationToken::new();
    if keep_alive {
      let pool = pool.clone();
      let cancel = keep_alive_cancel.clone();
      tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keep_alive_interval);
        ticker.tick().await; // first tick fires immediately
        loop {
          tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => pool.sweep_keep_alive().await,
          }
        }
      });
    }
    Ok(Self {
      target,
      pool,
      connect_timeout,
      active_tunnels: Arc::new(Mutex::new(TunnelRegistry::default())),
      askpass: SecurePasswordHandler::new(),
      events,
      keep_alive_cancel,
    })
  }

  fn validate_descriptor(cmd: &Command) -> Result<()> {
    match &cmd.adapter {
      AdapterDescriptor::Ssh { host, user, port, .. } => {
        if host.is_empty() || user.is_empty() {
          return Err(Error::Validation(
            "SSH adapter requires both host and username".to_string(),
          ));
        }
        if *port == 0 {
          return Err(Error::Validation("SSH port must be in 1..=65535".to_string()));
        }
        Ok(())
      }
      _ => Err(Error::Validation(
        "SshAdapter requires an AdapterDescriptor::Ssh".to_string(),
      )),
    }
  }

  /// Rewrites `cmd` into a `sudo`-escalated form when `cmd.sudo` is set,
  /// returning the askpass script path so the caller can remove it once the
  /// invocation finishes. SSH `exec` channels don't propagate the client's
  /// environment to the remote shell unless the server's `AcceptEnv` allows
  /// it (rare in practice), so both methods fold what the remote `sudo`
  /// needs directly into the one-liner rather than relying on channel env
  /// requests (§4.4).
  async fn with_sudo(&self, cmd: &Command) -> Result<(Command, Option<std::path::PathBuf>)> {
    let Some(sudo) = &cmd.sudo else {
      return Ok((cmd.clone(), None));
    };
    match sudo.method {
      SudoMethod::Askpass => {
        let script = self.askpass.create_askpass_script(sudo.password.clone()).await?;
        let env = self.askpass.create_secure_env(&script, None).await?;
        let mut prefix = String::new();
        for (k, v) in &env {
          prefix.push_str(k);
          prefix.push('=');
          prefix.push_str(&shell_escape::escape(std::borrow::Cow::Borrowed(v.as_str())));
          prefix.push(' ');
        }
        let mut escalated = cmd.clone();
        escalated.sudo = None;
        escalated.raw = true;
        escalated.command = format!("{prefix}sudo -A -- {}", cmd.shell_line());
        escalated.args = Vec::new();
        Ok((escalated, Some(script)))
      }
      SudoMethod::Stdin => {
        let mut stdin_bytes = format!("{}\n", sudo.password).into_bytes();
        if let Stdin::Bytes(existing) = &cmd.stdin {
          stdin_bytes.extend_from_slice(existing);
        }
        let mut escalated = cmd.clone();
        escalated.sudo = None;
        escalated.raw = true;
        escalated.stdin = Stdin::Bytes(stdin_bytes);
        escalated.command = format!("sudo -S -- {}", cmd.shell_line());
        escalated.args = Vec::new();
        Ok((escalated, None))
      }
    }
  }

  async fn sftp(&self) -> Result<SftpSession> {
    let session = self
      .pool
      .peek_session(&self.target)
      .await
      .ok_or_else(|| Error::Connection("No SSH connection available".to_string()))?;
    let handle = session.handle_mut().await;
    let channel = handle
      .channel_open_session()
      .await
      .map_err(|e| Error::Connection(format!("failed to open sftp channel: {e}")))?;
    drop(handle);
    channel
      .request_subsystem(true, "sftp")
      .await
      .map_err(|e| Error::Adapter(format!("sftp subsystem request failed: {e}")))?;
    SftpSession::new(channel.into_stream())
      .await
      .map_err(|e| Error::Adapter(format!("sftp session init failed: {e}")))
  }
}

#[async_trait]
impl Adapter for SshAdapter {
  #[tracing::instrument(skip(self, cmd), fields(command = %cmd.command, host = %self.target.host))]
  async fn execute(&self, cmd: &Command) -> Result<ExecutionResult> {
    Self::validate_descriptor(cmd)?;
    let (resolved, askpass_script) = self.with_sudo(cmd).await?;
    let lease = self.pool.checkout(&self.target, self.connect_timeout).await?;
    self.events.publish(if lease.reused() {
      Event::SshConnectionReused { host: self.target.host.clone(), port: self.target.port }
    } else {
      Event::SshConnectionCreated { host: self.target.host.clone(), port: self.target.port }
    });
    let result = lease.session().execute(&resolved).await;
    if result.is_err() {
      lease.mark_broken();
      self.events.publish(Event::SshConnectionClosed {
        host: self.target.host.clone(),
        port: self.target.port,
      });
    }
    if let Some(script) = askpass_script {
      let _ = self.askpass.remove_script(&script).await;
    }
    result
  }

  async fn dispose(&self) -> Result<()> {
    self.keep_alive_cancel.cancel();
    {
      let mut registry = self.active_tunnels.lock().await;
      registry.disposed = true;
      for (_, handle) in registry.tunnels.drain() {
        handle.close();
      }
    }
    self.pool.dispose().await;
    let _ = self.askpass.dispose().await;
    Ok(())
  }
}

#[async_trait]
impl Tunneling for SshAdapter {
  async fn tunnel(&self, opts: TunnelOptions) -> Result<crate::tunnel::Tunnel> {
    let session = self
      .pool
      .peek_session(&self.target)
      .await
      .ok_or_else(|| Error::Connection("No SSH connection available".to_string()))?;

    // Held across `open_tunnel` (which spawns the accept-loop task before
    // returning) through the insert below, so a concurrent `dispose()` can
    // never run in the gap between the listener starting to accept and its
    // handle landing in `active_tunnels` - it either runs first and flips
    // `disposed` before we get here, or it blocks on this same lock until
    // the handle is tracked and can be closed.
    let mut registry = self.active_tunnels.lock().await;
    if registry.disposed {
      return Err(Error::Disposed);
    }
    let t = tunnel::open_tunnel(session, opts).await?;
    let key = t.handle().key();
    registry.tunnels.insert(key.clone(), t.handle());
    drop(registry);

    self.events.publish(Event::SshTunnelCreated {
      local_port: t.local_port,
      remote_host: t.remote_host.clone(),
      remote_port: t.remote_port,
    });
    self.events.publish(Event::TunnelCreated {
      local_port: t.local_port,
      remote_host: t.remote_host.clone(),
      remote_port: t.remote_port,
      kind: TunnelKind::Ssh,
    });

    // Watches for the tunnel closing from any path (the caller's own
    // `close()`, or the adapter's `dispose()` closing it via `TunnelHandle`)
    // so `active_tunnels` and `ssh:tunnel-closed` stay accurate regardless
    // of who triggered the close.
    let closed = t.closed_notify();
    let active_tunnels = self.active_tunnels.clone();
    let events = self.events.clone();
    let (local_port, remote_host, remote_port) =
      (t.local_port, t.remote_host.clone(), t.remote_port);
    tokio::spawn(async move {
      closed.notified().await;
      active_tunnels.lock().await.tunnels.remove(&key);
      events.publish(Event::SshTunnelClosed { local_port, remote_host, remote_port });
    });

    Ok(t)
  }

  async fn list_tunnels(&self) -> Vec<TunnelHandle> {
    self.active_tunnels.lock().await.tunnels.values().cloned().collect()
  }
}

#[async_trait]
impl FileTransfer for SshAdapter {
  async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
    let sftp = self.sftp().await?;
    let data = tokio::fs::read(local)
      .await
      .map_err(|e| Error::Adapter(format!("failed to read local file: {e}")))?;
    let mode = local_file_mode(local).await;
    let tmp = format!("{remote}.tmp");
    {
      use tokio::io::AsyncWriteExt;
      let mut file = sftp
        .create(&tmp)
        .await
        .map_err(|e| Error::Adapter(format!("sftp create failed: {e}")))?;
      file
        .write_all(&data)
        .await
        .map_err(|e| Error::Adapter(format!("sftp write failed: {e}")))?;
      file
        .flush()
        .await
        .map_err(|e| Error::Adapter(format!("sftp flush failed: {e}")))?;
      // Closes the remote handle so the server has fully committed the
      // write before we rename over it - not every server supports the
      // `fsync@openssh.com` extension below, but every server honors close.
      file
        .shutdown()
        .await
        .map_err(|e| Error::Adapter(format!("sftp close failed: {e}")))?;
    }
    if let Err(e) = sftp.sync(&tmp).await {
      tracing::debug!("sftp fsync extension unavailable for {tmp}: {e}");
    }
    sftp
      .rename(&tmp, remote)
      .await
      .map_err(|e| Error::Adapter(format!("sftp rename failed: {e}")))?;
    if let Some(mode) = mode {
      let attrs = FileAttributes { permissions: Some(mode), ..Default::default() };
      if let Err(e) = sftp.set_metadata(remote, attrs).await {
        tracing::warn!("failed to preserve file mode on {remote}: {e}");
      }
    }
    Ok(())
  }

  async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
    let sftp = self.sftp().await?;
    use tokio::io::AsyncReadExt;
    let mut file = sftp
      .open(remote)
      .await
      .map_err(|e| Error::Adapter(format!("sftp open failed: {e}")))?;
    let mut data = Vec::new();
    file
      .read_to_end(&mut data)
      .await
      .map_err(|e| Error::Adapter(format!("sftp read failed: {e}")))?;
    tokio::fs::write(local, data)
      .await
      .map_err(|e| Error::Adapter(format!("failed to write local file: {e}")))?;
    Ok(())
  }

  async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()> {
    let mut entries = tokio::fs::read_dir(local)
      .await
      .map_err(|e| Error::Adapter(format!("failed to read local directory: {e}")))?;
    let sftp = self.sftp().await?;
    let _ = sftp.create_dir(remote).await;
    while let Some(entry) = entries
      .next_entry()
      .await
      .map_err(|e| Error::Adapter(format!("failed to read directory entry: {e}")))?
    {
      let path = entry.path();
      let name = entry.file_name().to_string_lossy().into_owned();
      let remote_path = format!("{remote}/{name}");
      if path.is_dir() {
        Box::pin(self.upload_directory(&path, &remote_path)).await?;
      } else {
        self.upload_file(&path, &remote_path).await?;
      }
    }
    Ok(())
  }

  async fn download_directory(&self, remote: &str, local: &Path) -> Result<()> {
    tokio::fs::create_dir_all(local)
      .await
      .map_err(|e| Error::Adapter(format!("failed to create local directory: {e}")))?;
    let sftp = self.sftp().await?;
    let entries = sftp
      .read_dir(remote)
      .await
      .map_err(|e| Error::Adapter(format!("sftp readdir failed: {e}")))?;
    for entry in entries {
      let name = entry.file_name();
      if name == "." || name == ".." {
        continue;
      }
      let remote_path = format!("{remote}/{name}");
      let local_path = local.join(&name);
      if entry.file_type().is_dir() {
        Box::pin(self.download_directory(&remote_path, &local_path)).await?;
      } else {
        self.download_file(&remote_path, &local_path).await?;
      }
    }
    Ok(())
  }
}

#[cfg(unix)]
async fn local_file_mode(local: &Path) -> Option<u32> {
  use std::os::unix::fs::PermissionsExt;
  tokio::fs::metadata(local).await.ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
async fn local_file_mode(_local: &Path) -> Option<u32> {
  None
}
