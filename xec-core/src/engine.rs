use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::command::{AdapterDescriptor, Command, CommandBuilder, SshAuth, Stdin};
use crate::config::{self, ConfiguredTargets};
use crate::context::{self, ContextOverlay};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::parallel::{ParallelOptions, ParallelResult, ParallelRunner};
use crate::pool::PoolPolicy;
use crate::registry::Registry;
use crate::result::ExecutionResult;
use crate::retry::{self, RetryOptions};

/// The top-level façade (§4.1): holds defaults, resolves adapters through a
/// shared [`Registry`], and layers scoped context over every command it
/// builds. Cloning an `Engine` (via [`Engine::with`]) shares the same
/// registry and event bus - only the overlay differs - so two engines
/// derived from one root still pool connections and fan out events
/// together.
#[derive(Clone)]
pub struct Engine {
  registry: Arc<Registry>,
  overlay: ContextOverlay,
  events: EventBus,
  disposed: Arc<AtomicBool>,
  targets: Arc<ConfiguredTargets>,
}

impl Engine {
  pub fn new(pool_policy: PoolPolicy, connect_timeout: Duration) -> Self {
    let events = EventBus::default();
    Self {
      registry: Arc::new(Registry::new(pool_policy, connect_timeout, events.clone())),
      overlay: ContextOverlay::default(),
      events,
      disposed: Arc::new(AtomicBool::new(false)),
      targets: Arc::new(ConfiguredTargets::default()),
    }
  }

  /// Builds an engine from a typed [`xec_config::EngineConfig`] (§6): named
  /// hosts/containers/pods/profiles/aliases all become reachable through
  /// [`Engine::host`]/[`Engine::container`]/[`Engine::pod`]/[`Engine::profile`]
  /// and through alias expansion in [`Engine::build_command`], and
  /// `config.defaults` seeds the base overlay with `XEC_TIMEOUT`/
  /// `XEC_SHELL`/`XEC_CWD`/`XEC_PROFILE` applied on top.
  pub async fn from_config(
    cfg: &xec_config::EngineConfig,
    pool_policy: PoolPolicy,
    connect_timeout: Duration,
  ) -> Result<Self> {
    let targets = ConfiguredTargets::from_config(cfg).await?;
    let overlay = config::resolve_base_overlay(cfg)?;
    let events = EventBus::default();
    Ok(Self {
      registry: Arc::new(Registry::new(pool_policy, connect_timeout, events.clone())),
      overlay,
      events,
      disposed: Arc::new(AtomicBool::new(false)),
      targets: Arc::new(targets),
    })
  }

  pub fn events(&self) -> &EventBus {
    &self.events
  }

  fn check_disposed(&self) -> Result<()> {
    if self.disposed.load(Ordering::Acquire) {
      return Err(Error::Disposed);
    }
    Ok(())
  }

  /// Merges this engine's overlay with whatever `within()` scope is
  /// currently active and seeds a [`CommandBuilder`] from the result, the
  /// way `Engine::run` expects every command it's handed to already reflect
  /// §4.1's "scopes inherit configuration across async boundaries".
  pub fn build_command(&self, line: impl Into<String>) -> CommandBuilder {
    let merged = self.overlay.merge(&context::current_scope());
    let line = self.targets.expand_alias(&line.into());
    let mut builder = CommandBuilder::new(line).adapter(merged.adapter.unwrap_or(AdapterDescriptor::Local));
    if let Some(timeout) = merged.timeout {
      builder = builder.timeout(timeout);
    }
    if let Some(shell) = merged.shell {
      builder = builder.shell(shell);
    }
    if let Some(cwd) = merged.cwd {
      builder = builder.cwd(cwd);
    }
    if let Some(throw) = merged.throw_on_nonzero {
      builder = builder.throw_on_nonzero(throw);
    }
    if let Some(encoding) = merged.encoding {
      builder = builder.encoding(encoding);
    }
    if !merged.env.is_empty() {
      builder = builder.envs(merged.env);
    }
    builder
  }

  /// Resolves `cmd.adapter` to a live adapter and executes it.
  pub async fn run(&self, cmd: Command) -> Result<ExecutionResult> {
    self.check_disposed()?;
    let handle = self.registry.resolve(&cmd.adapter)?;
    handle.as_adapter().execute(&cmd).await
  }

  /// Skips shell-escaping of `cmd.args` before sending it to the adapter -
  /// the escape hatch for callers who have already built a trusted,
  /// pre-quoted command line themselves.
  pub async fn raw(&self, mut cmd: Command) -> Result<ExecutionResult> {
    cmd.raw = true;
    self.run(cmd).await
  }

  /// Returns a clone of this engine whose every subsequent command merges
  /// `overlay` over the current one. Scalars last-writer-wins, `env` merges
  /// key-wise, `exec_flags` concatenates (§4.1).
  pub fn with(&self, overlay: ContextOverlay) -> Engine {
    Engine {
      registry: self.registry.clone(),
      overlay: self.overlay.merge(&overlay),
      events: self.events.clone(),
      disposed: self.disposed.clone(),
      targets: self.targets.clone(),
    }
  }

  /// Runs `fut` with `overlay` pushed onto the task-local dynamic scope
  /// stack (see [`crate::context::scoped`]), so every `Engine` clone -
  /// including ones captured before this call - sees it for the duration of
  /// `fut`. Distinct from [`Engine::with`], which only affects the returned
  /// clone.
  pub async fn within<F, T>(&self, overlay: ContextOverlay, fut: F) -> T
  where
    F: std::future::Future<Output = T>,
  {
    context::scoped(overlay, fut).await
  }

  /// Runs `cmds` with bounded concurrency, position-ordering results to
  /// match (§4.8).
  pub async fn parallel(
    &self,
    cmds: Vec<Command>,
    opts: ParallelOptions,
  ) -> Result<ParallelResult<ExecutionResult>> {
    self.check_disposed()?;
    let runner = ParallelRunner::new(opts);
    let engine = self.clone();
    runner.all(cmds, move |cmd| {
      let engine = engine.clone();
      async move { engine.run(cmd).await }
    }).await
  }

  /// Applies `to_command(item, index)` to every item of `items`, then runs
  /// the produced commands the way [`Engine::parallel`] does.
  pub async fn map<T, ToCmd>(
    &self,
    items: Vec<T>,
    opts: ParallelOptions,
    to_command: ToCmd,
  ) -> Result<ParallelResult<ExecutionResult>>
  where
    T: Send + 'static,
    ToCmd: Fn(&T, usize) -> Command,
  {
    self.check_disposed()?;
    let runner = ParallelRunner::new(opts);
    let engine = self.clone();
    runner
      .map(items, to_command, move |cmd| {
        let engine = engine.clone();
        async move { engine.run(cmd).await }
      })
      .await
  }

  /// Keeps items of `items` whose produced command exits zero, dropping the
  /// rest (§4.8).
  pub async fn filter<T, ToCmd>(
    &self,
    items: Vec<T>,
    opts: ParallelOptions,
    to_command: ToCmd,
  ) -> Result<Vec<T>>
  where
    T: Send + 'static,
    ToCmd: Fn(&T, usize) -> Command,
  {
    self.check_disposed()?;
    let runner = ParallelRunner::new(opts);
    let engine = self.clone();
    Ok(
      runner
        .filter(items, to_command, move |cmd| {
          let engine = engine.clone();
          async move { engine.run(cmd).await }
        })
        .await,
    )
  }

  /// Retries `build_and_run` under `opts`, using `default_is_retryable`
  /// when `is_retryable` is `None` (§4.9).
  pub async fn retry<F>(
    &self,
    opts: RetryOptions,
    is_retryable: Option<fn(&std::result::Result<ExecutionResult, Error>) -> bool>,
    mut build_and_run: F,
  ) -> Result<ExecutionResult>
  where
    F: FnMut() -> Command,
  {
    self.check_disposed()?;
    let engine = self.clone();
    let predicate = is_retryable.unwrap_or(retry::default_is_retryable);
    retry::retry(
      move || {
        let engine = engine.clone();
        let cmd = build_and_run();
        async move { engine.run(cmd).await }
      },
      &opts,
      predicate,
    )
    .await
  }

  /// Runs `cmds` in sequence, piping each command's stdout into the next
  /// command's stdin. Returns the last command's result.
  pub async fn pipe(&self, cmds: Vec<Command>) -> Result<ExecutionResult> {
    self.check_disposed()?;
    let mut last: Option<ExecutionResult> = None;
    for (i, mut cmd) in cmds.into_iter().enumerate() {
      if i > 0 {
        let prev = last.as_ref().expect("previous stage already ran");
        cmd.stdin = Stdin::Bytes(prev.stdout.clone());
      }
      last = Some(self.run(cmd).await?);
    }
    last.ok_or_else(|| Error::Validation("pipe requires at least one command".to_string()))
  }

  /// Idempotent. Disposes every resolved adapter in parallel, best-effort,
  /// then aggregates whatever errors surfaced into a single
  /// `Error::Aggregate` instead of propagating the first one, so a caller
  /// awaiting `dispose()` learns about every failed adapter, not just
  /// whichever happened to be first in the registry.
  pub async fn dispose(&self) -> Result<()> {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let errors = self.registry.dispose().await;
    if errors.is_empty() {
      Ok(())
    } else {
      Err(Error::Aggregate(errors))
    }
  }

  pub fn local(&self) -> Engine {
    self.with(ContextOverlay { adapter: Some(AdapterDescriptor::Local), ..Default::default() })
  }

  pub fn ssh(
    &self,
    host: impl Into<String>,
    port: u16,
    user: impl Into<String>,
    auth: SshAuth,
  ) -> Result<Engine> {
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
    Ok(self.with(ContextOverlay {
      adapter: Some(AdapterDescriptor::Ssh { host, port, user, auth }),
      ..Default::default()
    }))
  }

  pub fn docker(&self, container: impl Into<String>, container_user: Option<String>) -> Result<Engine> {
    let container = container.into();
    if container.is_empty() {
      return Err(Error::Validation("Container name is required".to_string()));
    }
    Ok(self.with(ContextOverlay {
      adapter: Some(AdapterDescriptor::Docker { container, container_user }),
      ..Default::default()
    }))
  }

  pub fn k8s(
    &self,
    pod: impl Into<String>,
    namespace: Option<String>,
    container: Option<String>,
  ) -> Result<Engine> {
    let pod = pod.into();
    if pod.is_empty() {
      return Err(Error::Validation("Pod name or selector is required".to_string()));
    }
    Ok(self.with(ContextOverlay {
      adapter: Some(AdapterDescriptor::Kubernetes {
        pod,
        namespace,
        container,
        exec_flags: Vec::new(),
        tty: false,
        stdin: false,
      }),
      ..Default::default()
    }))
  }

  /// Targets the host named `name` in the configuration this engine was
  /// built from via [`Engine::from_config`] (§6).
  pub fn host(&self, name: &str) -> Result<Engine> {
    let adapter = self.targets.host(name)?;
    Ok(self.with(ContextOverlay { adapter: Some(adapter), ..Default::default() }))
  }

  /// Targets the container named `name` in the configuration this engine
  /// was built from via [`Engine::from_config`] (§6).
  pub fn container(&self, name: &str) -> Result<Engine> {
    let adapter = self.targets.container(name)?;
    Ok(self.with(ContextOverlay { adapter: Some(adapter), ..Default::default() }))
  }

  /// Targets the pod named `name` in the configuration this engine was
  /// built from via [`Engine::from_config`] (§6).
  pub fn pod(&self, name: &str) -> Result<Engine> {
    let adapter = self.targets.pod(name)?;
    Ok(self.with(ContextOverlay { adapter: Some(adapter), ..Default::default() }))
  }

  /// Applies the named profile's resolved overlay (its `extends` chain
  /// already flattened) on top of this engine's current overlay.
  pub fn profile(&self, name: &str) -> Result<Engine> {
    let overlay = self.targets.profile(name)?;
    Ok(self.with(overlay))
  }

  /// Spawns a background task that publishes an `Event::MemorySnapshot`
  /// every `interval`, for long-lived processes wanting to observe this
  /// engine's own RSS alongside its event stream rather than reaching for a
  /// separate metrics exporter. Stops once `dispose()` has run.
  pub fn spawn_memory_snapshots(&self, interval: Duration) -> JoinHandle<()> {
    let events = self.events.clone();
    let disposed = self.disposed.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        if disposed.load(Ordering::Acquire) {
          break;
        }
        events.publish(Event::MemorySnapshot { rss_bytes: current_rss_bytes() });
      }
    })
  }
}

/// Best-effort resident set size in bytes, read from `/proc/self/statm` on
/// Linux. Returns `0` on any other platform or on read failure rather than
/// failing the caller - this is an observability aid, not a correctness
/// dependency.
#[cfg(target_os = "linux")]
fn current_rss_bytes() -> u64 {
  let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
  std::fs::read_to_string("/proc/self/statm")
    .ok()
    .and_then(|s| s.split_whitespace().nth(1).map(str::to_string))
    .and_then(|pages| pages.parse::<u64>().ok())
    .map(|pages| pages * page_size)
    .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> u64 {
  0
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration as StdDuration;

  fn test_engine() -> Engine {
    Engine::new(PoolPolicy::default(), StdDuration::from_secs(5))
  }

  #[tokio::test]
  async fn run_executes_local_command() {
    let engine = test_engine();
    let cmd = engine.build_command("echo").arg("hi").build();
    let result = engine.run(cmd).await.unwrap();
    assert!(result.success());
    assert_eq!(result.stdout_str().trim(), "hi");
  }

  #[tokio::test]
  async fn with_overlay_changes_subsequent_cwd() {
    let engine = test_engine();
    let scoped = engine.with(ContextOverlay { cwd: Some("/tmp".into()), ..Default::default() });
    let cmd = scoped.build_command("pwd").build();
    assert_eq!(cmd.cwd.as_deref(), Some("/tmp"));
  }

  #[tokio::test]
  async fn ssh_rejects_empty_host() {
    let engine = test_engine();
    let err = engine.ssh("", 22, "user", SshAuth::Password("p".into())).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[tokio::test]
  async fn docker_rejects_empty_container() {
    let engine = test_engine();
    let err = engine.docker("", None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[tokio::test]
  async fn k8s_rejects_empty_pod() {
    let engine = test_engine();
    let err = engine.k8s("", None, None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[tokio::test]
  async fn pipe_feeds_stdout_into_next_stdin() {
    let engine = test_engine();
    let first = engine.build_command("echo").arg("hello").build();
    let second = engine.build_command("cat").build();
    let result = engine.pipe(vec![first, second]).await.unwrap();
    assert_eq!(result.stdout_str().trim(), "hello");
  }

  #[tokio::test]
  async fn dispose_is_idempotent_and_rejects_further_use() {
    let engine = test_engine();
    engine.dispose().await.unwrap();
    engine.dispose().await.unwrap();
    let cmd = engine.build_command("echo").build();
    assert!(matches!(engine.run(cmd).await, Err(Error::Disposed)));
  }

  #[tokio::test]
  async fn parallel_runs_every_command() {
    let engine = test_engine();
    let cmds = vec![
      engine.build_command("echo").arg("1").build(),
      engine.build_command("echo").arg("2").build(),
    ];
    let result = engine.parallel(cmds, ParallelOptions::default()).await.unwrap();
    assert_eq!(result.succeeded.len(), 2);
  }
}
