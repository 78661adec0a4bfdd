use tokio::sync::broadcast;

/// Typed replacement for the source's stringly-typed `EventEmitter`
/// (REDESIGN FLAGS): one enum variant per event, fanned out over a bounded
/// `tokio::sync::broadcast` channel so a slow subscriber lags rather than
/// blocking producers.
#[derive(Debug, Clone)]
pub enum Event {
  SshConnectionCreated { host: String, port: u16 },
  SshConnectionClosed { host: String, port: u16 },
  SshConnectionReused { host: String, port: u16 },
  SshTunnelCreated { local_port: u16, remote_host: String, remote_port: u16 },
  SshTunnelClosed { local_port: u16, remote_host: String, remote_port: u16 },
  TunnelCreated { local_port: u16, remote_host: String, remote_port: u16, kind: TunnelKind },
  K8sPortForwardCreated { pod: String, local_port: u16, remote_port: u16 },
  K8sPortForwardClosed { pod: String, local_port: u16, remote_port: u16 },
  MemorySnapshot { rss_bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
  Ssh,
  KubernetesPortForward,
}

const DEFAULT_CAPACITY: usize = 256;

/// Shared by every adapter and the engine. Cloning an `EventBus` shares the
/// same underlying channel; each clone gets its own `subscribe()` handle.
#[derive(Clone)]
pub struct EventBus {
  sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(DEFAULT_CAPACITY)
  }
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (sender, _) = broadcast::channel(capacity);
    Self { sender }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<Event> {
    self.sender.subscribe()
  }

  /// Best-effort publish. An event is silently dropped when there are no
  /// subscribers, matching `broadcast::Sender::send`'s own semantics.
  pub fn publish(&self, event: Event) {
    let _ = self.sender.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn subscriber_receives_published_event() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    bus.publish(Event::SshConnectionCreated { host: "h".into(), port: 22 });
    let event = rx.recv().await.unwrap();
    assert!(matches!(event, Event::SshConnectionCreated { .. }));
  }

  #[test]
  fn publish_without_subscribers_does_not_panic() {
    let bus = EventBus::default();
    bus.publish(Event::SshConnectionClosed { host: "h".into(), port: 22 });
  }
}
