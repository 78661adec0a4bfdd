use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::adapter::ssh::connection::SshSession;
use crate::adapter::TunnelOptions;
use crate::error::{Error, Result};
use crate::tunnel::Tunnel;

/// Binds a local TCP listener and, for every accepted connection, opens a
/// `direct-tcpip` channel on `session` to `remote_host:remote_port`, then
/// pipes bytes both ways until either side closes (§4.4). The listener
/// registers itself as "accepting" (via the returned `CancellationToken`,
/// shared with the caller's tracking map) before the accept loop starts, so
/// there is no window where a bound-but-untracked socket could outlive a
/// concurrent `dispose()` (DESIGN.md open question).
pub async fn open_tunnel(
  session: Arc<SshSession>,
  opts: TunnelOptions,
) -> Result<Tunnel> {
  let listener = TcpListener::bind((opts.local_host.as_str(), opts.local_port))
    .await
    .map_err(|e| Error::Connection(format!("failed to bind tunnel listener: {e}")))?;
  let local_port = listener
    .local_addr()
    .map_err(|e| Error::Connection(format!("failed to read bound port: {e}")))?
    .port();

  let cancel = CancellationToken::new();
  let closed = Arc::new(Notify::new());

  let accept_cancel = cancel.clone();
  let accept_closed = closed.clone();
  let remote_host = opts.remote_host.clone();
  let remote_port = opts.remote_port;

  tokio::spawn(async move {
    loop {
      tokio::select! {
        _ = accept_cancel.cancelled() => break,
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, _addr)) => {
              let session = session.clone();
              let remote_host = remote_host.clone();
              let child_cancel = accept_cancel.clone();
              tokio::spawn(async move {
                if let Err(e) = pipe_connection(session, stream, &remote_host, remote_port, child_cancel).await {
                  tracing::warn!("tunnel connection failed: {e}");
                }
              });
            }
            Err(e) => {
              tracing::warn!("tunnel accept failed: {e}");
              break;
            }
          }
        }
      }
    }
    accept_closed.notify_waiters();
  });

  Ok(Tunnel::new(
    opts.local_host,
    local_port,
    opts.remote_host,
    opts.remote_port,
    cancel,
    closed,
  ))
}

async fn pipe_connection(
  session: Arc<SshSession>,
  mut local: tokio::net::TcpStream,
  remote_host: &str,
  remote_port: u16,
  cancel: CancellationToken,
) -> Result<()> {
  let handle = session.handle_mut().await;
  let mut channel = handle
    .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
    .await
    .map_err(|e| Error::Connection(format!("direct-tcpip open failed: {e}")))?;
  drop(handle);

  let mut buf = [0u8; 8192];
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      n = local.read(&mut buf) => {
        let n = n.map_err(|e| Error::Adapter(format!("tunnel read failed: {e}")))?;
        if n == 0 {
          let _ = channel.eof().await;
          break;
        }
        channel
          .data(&buf[..n])
          .await
          .map_err(|e| Error::Adapter(format!("tunnel write to remote failed: {e}")))?;
      }
      msg = channel.wait() => {
        match msg {
          Some(russh::ChannelMsg::Data { data }) => {
            local
              .write_all(&data)
              .await
              .map_err(|e| Error::Adapter(format!("tunnel write to local failed: {e}")))?;
          }
          Some(russh::ChannelMsg::Eof) | Some(russh::ChannelMsg::Close) | None => break,
          _ => {}
        }
      }
    }
  }
  Ok(())
}
