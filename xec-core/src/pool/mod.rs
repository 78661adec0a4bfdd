pub mod key;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

pub use key::ConnectionKey;

use crate::error::{Error, Result, TimeoutPhase};

/// A live session a pool slot wraps. `check_alive` backs the keep-alive
/// sweep (§4.5); `close` is called on eviction and on pool disposal.
#[async_trait]
pub trait PoolableSession: Send + Sync + 'static {
  async fn check_alive(&self) -> bool;
  async fn close(&self);
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
  type Session: PoolableSession;
  async fn connect(&self, key: &ConnectionKey) -> Result<Self::Session>;
}

#[derive(Debug, Clone)]
pub struct PoolPolicy {
  pub enabled: bool,
  pub max_connections: usize,
  pub idle_timeout: Duration,
  pub max_lifetime: Duration,
  pub keep_alive: bool,
  pub keep_alive_interval: Duration,
  pub auto_reconnect: bool,
  pub error_threshold: u32,
}

impl Default for PoolPolicy {
  fn default() -> Self {
    Self {
      enabled: true,
      max_connections: 10,
      idle_timeout: Duration::from_secs(300),
      max_lifetime: Duration::from_secs(3600),
      keep_alive: true,
      keep_alive_interval: Duration::from_secs(30),
      auto_reconnect: true,
      error_threshold: 3,
    }
  }
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
  pub connections_created: AtomicU64,
  pub connections_destroyed: AtomicU64,
  pub connection_reuses: AtomicU64,
}

impl PoolMetrics {
  pub fn snapshot(&self, total_connections: usize) -> PoolMetricsSnapshot {
    PoolMetricsSnapshot {
      connections_created: self.connections_created.load(Ordering::Relaxed),
      connections_destroyed: self.connections_destroyed.load(Ordering::Relaxed),
      connection_reuses: self.connection_reuses.load(Ordering::Relaxed),
      total_connections,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
  pub connections_created: u64,
  pub connections_destroyed: u64,
  pub connection_reuses: u64,
  /// Live sessions currently held by the pool (idle + busy), i.e.
  /// `active_connections() + idle_connections()` at the moment of the snapshot.
  pub total_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Idle,
  Busy,
  Broken,
}

struct Slot<S> {
  session: Arc<S>,
  created_at: Instant,
  last_used_at: Instant,
  use_count: u64,
  error_count: u32,
  state: State,
}

/// A keyed reservoir of reusable sessions with keep-alive, idle eviction,
/// max-lifetime eviction, and an error threshold past which a connection is
/// retired rather than reused (§4.5). Always used behind an `Arc` so a
/// checked-out [`Lease`] can release itself from its `Drop` impl without
/// borrowing the pool.
pub struct ConnectionPool<F: ConnectionFactory> {
  policy: PoolPolicy,
  factory: F,
  slots: Mutex<HashMap<ConnectionKey, Vec<Slot<F::Session>>>>,
  total: AtomicUsize,
  waiters: Notify,
  metrics: PoolMetrics,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
  pub fn new(policy: PoolPolicy, factory: F) -> Arc<Self> {
    Arc::new(Self {
      policy,
      factory,
      slots: Mutex::new(HashMap::new()),
      total: AtomicUsize::new(0),
      waiters: Notify::new(),
      metrics: PoolMetrics::default(),
    })
  }

  pub fn metrics(&self) -> PoolMetricsSnapshot {
    self.metrics.snapshot(self.total.load(Ordering::Relaxed))
  }

  pub async fn active_connections(&self) -> usize {
    let slots = self.slots.lock().await;
    slots
      .values()
      .flatten()
      .filter(|s| s.state == State::Busy)
      .count()
  }

  pub async fn idle_connections(&self) -> usize {
    let slots = self.slots.lock().await;
    slots
      .values()
      .flatten()
      .filter(|s| s.state == State::Idle)
      .count()
  }

  /// Returns a clone of any non-broken session pooled for `key`, regardless
  /// of whether it is currently checked out. Used for operations that open
  /// an additional multiplexed channel on an existing connection (e.g. an
  /// SSH tunnel's `direct-tcpip` channel) rather than requiring exclusive
  /// use the way [`ConnectionPool::checkout`] does.
  pub async fn peek_session(&self, key: &ConnectionKey) -> Option<Arc<F::Session>> {
    let slots = self.slots.lock().await;
    slots
      .get(key)?
      .iter()
      .find(|s| s.state != State::Broken)
      .map(|s| s.session.clone())
  }

  /// Checks out a session for `key`, reusing an idle non-expired,
  /// non-broken slot when one exists, creating a fresh one when the pool
  /// has room, or waiting FIFO for a slot to free otherwise. `connect_timeout`
  /// bounds the whole operation, including any wait.
  pub async fn checkout(
    self: &Arc<Self>,
    key: &ConnectionKey,
    connect_timeout: Duration,
  ) -> Result<Lease<F>> {
    tokio::time::timeout(connect_timeout, self.checkout_inner(key))
      .await
      .map_err(|_| Error::Timeout { phase: TimeoutPhase::Checkout })?
  }

  async fn checkout_inner(self: &Arc<Self>, key: &ConnectionKey) -> Result<Lease<F>> {
    loop {
      {
        let mut slots = self.slots.lock().await;
        self.evict_expired_locked(&mut slots, key).await;

        if let Some(bucket) = slots.get_mut(key) {
          if let Some(slot) = bucket.iter_mut().find(|s| s.state == State::Idle) {
            slot.state = State::Busy;
            slot.last_used_at = Instant::now();
            slot.use_count += 1;
            self.metrics.connection_reuses.fetch_add(1, Ordering::Relaxed);
            let session = slot.session.clone();
            return Ok(Lease { pool: self.clone(), key: key.clone(), session, reused: true });
          }
        }

        if self.total.load(Ordering::Relaxed) < self.policy.max_connections {
          self.total.fetch_add(1, Ordering::Relaxed);
        } else {
          drop(slots);
          self.waiters.notified().await;
          continue;
        }
      }

      match self.factory.connect(key).await {
        Ok(session) => {
          let session = Arc::new(session);
          let mut slots = self.slots.lock().await;
          slots.entry(key.clone()).or_default().push(Slot {
            session: session.clone(),
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            use_count: 1,
            error_count: 0,
            state: State::Busy,
          });
          self.metrics.connections_created.fetch_add(1, Ordering::Relaxed);
          return Ok(Lease { pool: self.clone(), key: key.clone(), session, reused: false });
        }
        Err(e) => {
          self.total.fetch_sub(1, Ordering::Relaxed);
          self.waiters.notify_one();
          return Err(e);
        }
      }
    }
  }

  async fn evict_expired_locked(
    &self,
    slots: &mut HashMap<ConnectionKey, Vec<Slot<F::Session>>>,
    key: &ConnectionKey,
  ) {
    let now = Instant::now();
    if let Some(bucket) = slots.get_mut(key) {
      let mut i = 0;
      while i < bucket.len() {
        let expired = bucket[i].state == State::Idle
          && (now.duration_since(bucket[i].created_at) >= self.policy.max_lifetime
            || now.duration_since(bucket[i].last_used_at) >= self.policy.idle_timeout);
        let broken = bucket[i].state == State::Broken;
        if expired || broken {
          let slot = bucket.remove(i);
          slot.session.close().await;
          self.total.fetch_sub(1, Ordering::Relaxed);
          self.metrics.connections_destroyed.fetch_add(1, Ordering::Relaxed);
          self.waiters.notify_one();
        } else {
          i += 1;
        }
      }
    }
  }

  /// Runs one keep-alive sweep over every idle connection. Call on a
  /// periodic timer when `policy.keep_alive` is set; a failed check bumps
  /// `error_count` and marks the slot broken once `error_threshold` is hit.
  pub async fn sweep_keep_alive(&self) {
    if !self.policy.keep_alive {
      return;
    }
    let sessions: Vec<(ConnectionKey, Arc<F::Session>)> = {
      let slots = self.slots.lock().await;
      slots
        .iter()
        .flat_map(|(k, bucket)| {
          bucket
            .iter()
            .filter(|s| s.state == State::Idle)
            .map(|s| (k.clone(), s.session.clone()))
        })
        .collect()
    };
    for (key, session) in sessions {
      let alive = session.check_alive().await;
      if !alive {
        let mut slots = self.slots.lock().await;
        if let Some(bucket) = slots.get_mut(&key) {
          for slot in bucket.iter_mut() {
            if Arc::ptr_eq(&slot.session, &session) {
              slot.error_count += 1;
              if slot.error_count >= self.policy.error_threshold {
                slot.state = State::Broken;
              }
            }
          }
        }
      }
    }
  }

  fn release(self: &Arc<Self>, key: &ConnectionKey, session: &Arc<F::Session>, broke: bool) {
    let pool = self.clone();
    let key = key.clone();
    let session = session.clone();
    tokio::spawn(async move {
      let mut slots = pool.slots.lock().await;
      if let Some(bucket) = slots.get_mut(&key) {
        for slot in bucket.iter_mut() {
          if Arc::ptr_eq(&slot.session, &session) {
            slot.state = if broke { State::Broken } else { State::Idle };
          }
        }
      }
      drop(slots);
      pool.waiters.notify_one();
    });
  }

  /// Cancels keep-alive, closes every connection best-effort, clears the
  /// map. Errors from individual closes are swallowed; disposal never
  /// fails loudly (§4.5, §5 disposal discipline).
  pub async fn dispose(&self) {
    let mut slots = self.slots.lock().await;
    for (_, bucket) in slots.drain() {
      for slot in bucket {
        slot.session.close().await;
        self.metrics.connections_destroyed.fetch_add(1, Ordering::Relaxed);
      }
    }
    self.total.store(0, Ordering::Relaxed);
  }
}

/// A checked-out session. Marks its slot idle again on drop unless
/// [`Lease::mark_broken`] was called, in which case the slot becomes
/// `Broken` and is evicted on the next checkout for its key.
pub struct Lease<F: ConnectionFactory> {
  pool: Arc<ConnectionPool<F>>,
  key: ConnectionKey,
  session: Arc<F::Session>,
  reused: bool,
}

impl<F: ConnectionFactory> Lease<F> {
  pub fn session(&self) -> &F::Session {
    &self.session
  }

  /// Whether this lease was handed an idle connection already in the pool
  /// (`true`) rather than one freshly created for this checkout (`false`),
  /// matching the pool's own `connections_created`/`connection_reuses`
  /// metrics split (§4.5). Callers that emit `ssh:connection-created` vs.
  /// `ssh:connection-reused` key off this.
  pub fn reused(&self) -> bool {
    self.reused
  }

  pub fn mark_broken(self) {
    self.pool.release(&self.key, &self.session, true);
    std::mem::forget(self);
  }
}

impl<F: ConnectionFactory> Drop for Lease<F> {
  fn drop(&mut self) {
    self.pool.release(&self.key, &self.session, false);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicBool;

  struct FakeSession {
    alive: AtomicBool,
  }

  #[async_trait]
  impl PoolableSession for FakeSession {
    async fn check_alive(&self) -> bool {
      self.alive.load(Ordering::Relaxed)
    }
    async fn close(&self) {}
  }

  struct FakeFactory {
    created: AtomicU64,
  }

  #[async_trait]
  impl ConnectionFactory for FakeFactory {
    type Session = FakeSession;
    async fn connect(&self, _key: &ConnectionKey) -> Result<FakeSession> {
      self.created.fetch_add(1, Ordering::Relaxed);
      Ok(FakeSession { alive: AtomicBool::new(true) })
    }
  }

  fn key() -> ConnectionKey {
    ConnectionKey::new("u", "h", 22, &crate::command::SshAuth::Agent)
  }

  #[tokio::test]
  async fn reuses_idle_connection() {
    let pool = ConnectionPool::new(
      PoolPolicy::default(),
      FakeFactory { created: AtomicU64::new(0) },
    );
    let k = key();
    let lease = pool.checkout(&k, Duration::from_secs(1)).await.unwrap();
    drop(lease);
    // give the spawned release task a chance to run
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let _lease2 = pool.checkout(&k, Duration::from_secs(1)).await.unwrap();
    let metrics = pool.metrics();
    assert_eq!(metrics.connections_created, 1);
    assert_eq!(metrics.connection_reuses, 1);
  }

  #[tokio::test]
  async fn respects_max_connections_by_queueing() {
    let mut policy = PoolPolicy::default();
    policy.max_connections = 1;
    let pool = ConnectionPool::new(policy, FakeFactory { created: AtomicU64::new(0) });
    let k = key();
    let lease = pool.checkout(&k, Duration::from_secs(1)).await.unwrap();
    let pool2 = pool.clone();
    let k2 = k.clone();
    let waiter = tokio::spawn(async move {
      pool2.checkout(&k2, Duration::from_secs(2)).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    drop(lease);
    let result = waiter.await.unwrap();
    assert!(result.is_ok());
  }
}
