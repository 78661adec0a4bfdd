use std::collections::HashMap;
use std::time::Duration;

/// Which transport a [`Command`] targets and the fields that transport needs.
/// Mirrors `xec_config::AdapterDescriptorConfig` but carries resolved,
/// already-validated values rather than raw config strings.
#[derive(Debug, Clone)]
pub enum AdapterDescriptor {
  Local,
  Ssh {
    host: String,
    port: u16,
    user: String,
    auth: SshAuth,
  },
  Docker {
    container: String,
    container_user: Option<String>,
  },
  Kubernetes {
    pod: String,
    namespace: Option<String>,
    container: Option<String>,
    exec_flags: Vec<String>,
    tty: bool,
    stdin: bool,
  },
}

#[derive(Debug, Clone)]
pub enum SshAuth {
  Password(String),
  PrivateKey { key: String, passphrase: Option<String> },
  Agent,
}

#[derive(Debug, Clone, Default)]
pub enum Stdin {
  #[default]
  None,
  Bytes(Vec<u8>),
}

/// How a `sudo`-escalated [`Command`] supplies its password to the child
/// process, mirrored onto the wire-level `sudo.method` field §4.4 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SudoMethod {
  /// `SUDO_ASKPASS` points at a generated script; `sudo -A` invokes it.
  Askpass,
  /// The password is written to the child's stdin ahead of any real
  /// stdin payload; `sudo -S` reads it from there.
  Stdin,
}

#[derive(Debug, Clone)]
pub struct SudoOptions {
  pub method: SudoMethod,
  pub password: String,
}

/// An immutable, fully-resolved execution request. Built via [`CommandBuilder`]
/// rather than constructed field-by-field, since most fields have sensible
/// engine-wide defaults that only a scoped overlay should override.
#[derive(Debug, Clone)]
pub struct Command {
  pub command: String,
  pub args: Vec<String>,
  pub stdin: Stdin,
  pub cwd: Option<String>,
  pub env: HashMap<String, String>,
  /// Whether `env` is layered onto the adapter's full inherited environment
  /// (`true`, the default) or onto a cleared one, so `env` is the entire
  /// environment the command sees (`false`). Only the local adapter can
  /// honor this in the strict sense - the others already hand the remote
  /// shell a blank slate and fold `env` into the invocation line itself.
  pub inherit_env: bool,
  pub timeout: Option<Duration>,
  pub shell: bool,
  pub throw_on_nonzero: bool,
  pub encoding: String,
  pub max_buffer: usize,
  pub adapter: AdapterDescriptor,
  /// When set, skips shell-quoting of `args` when building the command
  /// line — the escape hatch `Engine::raw` enables (§4.1).
  pub raw: bool,
  pub sudo: Option<SudoOptions>,
  /// Cooperative cancellation bound to the current scope (§5). Long-running
  /// adapter operations race this against their I/O and fail with
  /// `Error::Cancellation` carrying whatever output was captured so far.
  pub cancellation: Option<tokio_util::sync::CancellationToken>,
}

pub const DEFAULT_MAX_BUFFER: usize = 10 * 1024 * 1024;

impl Command {
  pub fn builder(command: impl Into<String>) -> CommandBuilder {
    CommandBuilder::new(command)
  }

  /// The shell-quoted (or, when `raw`, unquoted) `command args...` line
  /// used by adapters that always invoke a remote shell regardless of
  /// `self.shell` (SSH exec, `kubectl exec ... sh -c`).
  pub fn shell_line(&self) -> String {
    let mut line = self.command.clone();
    for a in &self.args {
      line.push(' ');
      if self.raw {
        line.push_str(a);
      } else {
        line.push_str(&shell_escape::escape(std::borrow::Cow::Borrowed(a.as_str())));
      }
    }
    line
  }

  /// The full argv this command resolves to: `[command, ...args]` when not
  /// shelling out, or `["sh", "-c", "command args..."]` when `shell=true`.
  pub fn resolve_argv(&self) -> Vec<String> {
    if self.shell {
      vec!["sh".to_string(), "-c".to_string(), self.shell_line()]
    } else {
      let mut argv = vec![self.command.clone()];
      argv.extend(self.args.iter().cloned());
      argv
    }
  }
}

pub struct CommandBuilder {
  command: String,
  args: Vec<String>,
  stdin: Stdin,
  cwd: Option<String>,
  env: HashMap<String, String>,
  inherit_env: bool,
  timeout: Option<Duration>,
  shell: bool,
  throw_on_nonzero: bool,
  encoding: String,
  max_buffer: usize,
  adapter: AdapterDescriptor,
  raw: bool,
  sudo: Option<SudoOptions>,
  cancellation: Option<tokio_util::sync::CancellationToken>,
}

impl CommandBuilder {
  pub fn new(command: impl Into<String>) -> Self {
    Self {
      command: command.into(),
      args: Vec::new(),
      stdin: Stdin::None,
      cwd: None,
      env: HashMap::new(),
      inherit_env: true,
      timeout: None,
      shell: false,
      throw_on_nonzero: true,
      encoding: "utf-8".to_string(),
      max_buffer: DEFAULT_MAX_BUFFER,
      adapter: AdapterDescriptor::Local,
      raw: false,
      sudo: None,
      cancellation: None,
    }
  }

  pub fn arg(mut self, arg: impl Into<String>) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args.extend(args.into_iter().map(Into::into));
    self
  }

  pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
    self.stdin = Stdin::Bytes(bytes);
    self
  }

  pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  pub fn envs(mut self, env: HashMap<String, String>) -> Self {
    self.env.extend(env);
    self
  }

  /// Whether `env` adds onto the adapter's full inherited environment
  /// (`true`, the default) or replaces it outright (`false`).
  pub fn inherit_env(mut self, inherit_env: bool) -> Self {
    self.inherit_env = inherit_env;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn shell(mut self, shell: bool) -> Self {
    self.shell = shell;
    self
  }

  pub fn throw_on_nonzero(mut self, throw: bool) -> Self {
    self.throw_on_nonzero = throw;
    self
  }

  pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
    self.encoding = encoding.into();
    self
  }

  pub fn max_buffer(mut self, max_buffer: usize) -> Self {
    self.max_buffer = max_buffer;
    self
  }

  pub fn adapter(mut self, adapter: AdapterDescriptor) -> Self {
    self.adapter = adapter;
    self
  }

  pub fn raw(mut self, raw: bool) -> Self {
    self.raw = raw;
    self
  }

  pub fn sudo(mut self, method: SudoMethod, password: impl Into<String>) -> Self {
    self.sudo = Some(SudoOptions { method, password: password.into() });
    self
  }

  pub fn cancellation(mut self, token: tokio_util::sync::CancellationToken) -> Self {
    self.cancellation = Some(token);
    self
  }

  pub fn build(self) -> Command {
    Command {
      command: self.command,
      args: self.args,
      stdin: self.stdin,
      cwd: self.cwd,
      env: self.env,
      inherit_env: self.inherit_env,
      timeout: self.timeout,
      shell: self.shell,
      throw_on_nonzero: self.throw_on_nonzero,
      encoding: self.encoding,
      max_buffer: self.max_buffer,
      adapter: self.adapter,
      raw: self.raw,
      sudo: self.sudo,
      cancellation: self.cancellation,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resolves_argv_without_shell() {
    let cmd = Command::builder("echo").arg("hello").build();
    assert_eq!(cmd.resolve_argv(), vec!["echo", "hello"]);
  }

  #[test]
  fn resolves_argv_with_shell_escaping() {
    let cmd = Command::builder("echo")
      .arg("hello world")
      .shell(true)
      .build();
    let argv = cmd.resolve_argv();
    assert_eq!(argv[0], "sh");
    assert_eq!(argv[1], "-c");
    assert!(argv[2].contains("echo"));
  }

  #[test]
  fn defaults_to_local_adapter_and_throws_on_nonzero() {
    let cmd = Command::builder("true").build();
    assert!(matches!(cmd.adapter, AdapterDescriptor::Local));
    assert!(cmd.throw_on_nonzero);
  }
}
