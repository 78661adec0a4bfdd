//! Resolves the typed `xec_config::EngineConfig` schema (§6) into the live
//! values `xec-core` actually runs with: named hosts/containers/pods become
//! [`AdapterDescriptor`]s, named profiles become [`ContextOverlay`]s with
//! their `extends` chains already flattened, and aliases expand the first
//! word of a command line before it reaches an adapter.

use std::path::Path;

use xec_config::{Defaults, EngineConfig, HostConfig, Overlay};

use crate::command::{AdapterDescriptor, SshAuth};
use crate::context::ContextOverlay;
use crate::error::{Error, Result};

/// Named targets and profiles resolved out of an [`EngineConfig`]. Built once
/// by [`crate::engine::Engine::from_config`] and held by the engine so
/// `engine.host("db")`/`engine.profile("prod")` stay cheap lookups rather
/// than re-resolving the config on every call.
#[derive(Debug, Default)]
pub struct ConfiguredTargets {
  hosts: std::collections::HashMap<String, AdapterDescriptor>,
  containers: std::collections::HashMap<String, AdapterDescriptor>,
  pods: std::collections::HashMap<String, AdapterDescriptor>,
  profiles: std::collections::HashMap<String, ContextOverlay>,
  aliases: std::collections::HashMap<String, String>,
}

impl ConfiguredTargets {
  pub async fn from_config(config: &EngineConfig) -> Result<Self> {
    let mut hosts = std::collections::HashMap::new();
    for (name, host) in &config.hosts {
      hosts.insert(name.clone(), host_to_descriptor(host).await?);
    }

    let mut containers = std::collections::HashMap::new();
    for (name, container) in &config.containers {
      containers.insert(
        name.clone(),
        AdapterDescriptor::Docker {
          container: container.container.clone(),
          container_user: container.user.clone(),
        },
      );
    }

    let mut pods = std::collections::HashMap::new();
    for (name, pod) in &config.pods {
      pods.insert(
        name.clone(),
        AdapterDescriptor::Kubernetes {
          pod: pod.pod.clone(),
          namespace: pod.namespace.clone(),
          container: pod.container.clone(),
          exec_flags: Vec::new(),
          tty: false,
          stdin: false,
        },
      );
    }

    let mut profiles = std::collections::HashMap::new();
    for name in config.profiles.keys() {
      let resolved = xec_config::resolve_profile(&config.profiles, name)
        .map_err(|e| Error::Validation(e.to_string()))?;
      let overlay = ContextOverlay::from_config(&resolved)
        .map_err(|e| Error::Validation(e.to_string()))?;
      profiles.insert(name.clone(), overlay);
    }

    Ok(Self { hosts, containers, pods, profiles, aliases: config.aliases.clone() })
  }

  pub fn host(&self, name: &str) -> Result<AdapterDescriptor> {
    self
      .hosts
      .get(name)
      .cloned()
      .ok_or_else(|| Error::Validation(format!("no host named {name:?} in configuration")))
  }

  pub fn container(&self, name: &str) -> Result<AdapterDescriptor> {
    self
      .containers
      .get(name)
      .cloned()
      .ok_or_else(|| Error::Validation(format!("no container named {name:?} in configuration")))
  }

  pub fn pod(&self, name: &str) -> Result<AdapterDescriptor> {
    self
      .pods
      .get(name)
      .cloned()
      .ok_or_else(|| Error::Validation(format!("no pod named {name:?} in configuration")))
  }

  pub fn profile(&self, name: &str) -> Result<ContextOverlay> {
    self
      .profiles
      .get(name)
      .cloned()
      .ok_or_else(|| Error::Validation(format!("no profile named {name:?} in configuration")))
  }

  /// Expands `line`'s first word through `aliases` if it names one,
  /// `cmd args...` -> `expansion args...`. Leaves `line` untouched when its
  /// first word isn't an alias.
  pub fn expand_alias(&self, line: &str) -> String {
    let mut parts = line.splitn(2, ' ');
    let head = parts.next().unwrap_or("");
    match self.aliases.get(head) {
      Some(expansion) => match parts.next() {
        Some(rest) => format!("{expansion} {rest}"),
        None => expansion.clone(),
      },
      None => line.to_string(),
    }
  }
}

/// Resolves one configured host's auth material into a live
/// [`AdapterDescriptor::Ssh`]. Exactly one of `password`/`private_key`/
/// `private_key_path` must be set (§6); `private_key_path` is read from disk
/// here so the rest of the engine only ever deals in key material, never paths.
async fn host_to_descriptor(host: &HostConfig) -> Result<AdapterDescriptor> {
  let set = [host.password.is_some(), host.private_key.is_some(), host.private_key_path.is_some()];
  if set.iter().filter(|s| **s).count() != 1 {
    return Err(Error::Validation(format!(
      "host {:?} must set exactly one of password, private_key, private_key_path",
      host.host
    )));
  }
  let auth = if let Some(password) = &host.password {
    SshAuth::Password(password.clone())
  } else if let Some(key) = &host.private_key {
    SshAuth::PrivateKey { key: key.clone(), passphrase: None }
  } else {
    let path = host.private_key_path.as_ref().expect("exactly one auth field is set");
    let key = tokio::fs::read_to_string(path)
      .await
      .map_err(|e| Error::Validation(format!("failed to read private_key_path {path:?}: {e}")))?;
    SshAuth::PrivateKey { key, passphrase: None }
  };
  if host.port == 0 {
    return Err(Error::Validation("SSH port must be in 1..=65535".to_string()));
  }
  Ok(AdapterDescriptor::Ssh {
    host: host.host.clone(),
    port: host.port,
    user: host.username.clone(),
    auth,
  })
}

/// `Defaults` and `Overlay` carry the same scalar fields under different
/// names (`Overlay` additionally has `exec_flags`/`adapter`, which defaults
/// have no use for); this lets `apply_env_overrides`/`resolve_profile`, which
/// both only know about `Overlay`, apply on top of engine-wide defaults too.
fn defaults_to_overlay(defaults: &Defaults) -> Overlay {
  Overlay {
    timeout: defaults.timeout.clone(),
    shell: defaults.shell,
    cwd: defaults.cwd.clone(),
    env: defaults.env.clone(),
    throw_on_nonzero: defaults.throw_on_nonzero,
    encoding: defaults.encoding.clone(),
    exec_flags: Vec::new(),
    adapter: None,
  }
}

/// Loads an [`EngineConfig`] from `explicit_path`, or from `XEC_CONFIG` when
/// `explicit_path` is `None` (§6). `path` may be a single file or a
/// directory of `.toml`/`.json` fragments, merged the way
/// [`xec_config::ConfigLoader`] merges any other config directory.
pub fn load_engine_config(explicit_path: Option<&Path>) -> Result<EngineConfig> {
  let env_path;
  let path: &Path = if let Some(p) = explicit_path {
    p
  } else {
    env_path = std::env::var("XEC_CONFIG")
      .map_err(|_| Error::Validation("XEC_CONFIG is not set and no path was provided".to_string()))?;
    Path::new(&env_path)
  };
  xec_config::ConfigLoader {
    paths: &[path],
    match_wildcards: &["*.toml", "*.json"],
    include_file_name: ".include",
    merge_nested: true,
    extend_array: true,
    debug_print: false,
  }
  .load::<EngineConfig>()
  .map_err(|e| Error::Validation(e.to_string()))
}

/// Folds `config.defaults` into a base [`ContextOverlay`], applying
/// `XEC_TIMEOUT`/`XEC_SHELL`/`XEC_CWD` env overrides and, when `XEC_PROFILE`
/// names a configured profile, merging that profile on top (§6's five
/// environment variables, minus `XEC_CONFIG` which selects the file itself).
pub fn resolve_base_overlay(config: &EngineConfig) -> Result<ContextOverlay> {
  let mut overlay = defaults_to_overlay(&config.defaults);
  let env: std::collections::HashMap<String, String> = std::env::vars().collect();
  overlay = xec_config::apply_env_overrides(overlay, &env);

  if let Ok(profile_name) = std::env::var("XEC_PROFILE") {
    let resolved = xec_config::resolve_profile(&config.profiles, &profile_name)
      .map_err(|e| Error::Validation(e.to_string()))?;
    overlay = xec_config::merge_overlay(&overlay, &resolved);
  }

  ContextOverlay::from_config(&overlay).map_err(|e| Error::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use indexmap::IndexMap;

  fn host(password: Option<&str>, private_key: Option<&str>) -> HostConfig {
    HostConfig {
      host: "db.internal".to_string(),
      port: 22,
      username: "deploy".to_string(),
      password: password.map(str::to_string),
      private_key: private_key.map(str::to_string),
      private_key_path: None,
    }
  }

  #[tokio::test]
  async fn host_with_password_resolves_to_password_auth() {
    let descriptor = host_to_descriptor(&host(Some("hunter2"), None)).await.unwrap();
    assert!(matches!(
      descriptor,
      AdapterDescriptor::Ssh { auth: SshAuth::Password(p), .. } if p == "hunter2"
    ));
  }

  #[tokio::test]
  async fn host_with_no_auth_set_is_rejected() {
    let err = host_to_descriptor(&host(None, None)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[tokio::test]
  async fn host_with_two_auth_methods_is_rejected() {
    let err = host_to_descriptor(&host(Some("p"), Some("key"))).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[tokio::test]
  async fn resolves_named_hosts_containers_pods_and_aliases() {
    let mut config = EngineConfig::default();
    config.hosts.insert("db".to_string(), host(Some("hunter2"), None));
    config.aliases.insert("ll".to_string(), "ls -la".to_string());
    let targets = ConfiguredTargets::from_config(&config).await.unwrap();
    assert!(matches!(targets.host("db").unwrap(), AdapterDescriptor::Ssh { .. }));
    assert!(targets.host("missing").is_err());
    assert_eq!(targets.expand_alias("ll /tmp"), "ls -la /tmp");
    assert_eq!(targets.expand_alias("echo hi"), "echo hi");
  }

  #[test]
  fn profile_not_found_surfaces_as_validation_error() {
    let config = EngineConfig::default();
    // no XEC_PROFILE set in test env, so this just exercises the defaults path
    let overlay = resolve_base_overlay(&config).unwrap();
    assert!(overlay.adapter.is_none());
  }

  #[test]
  fn load_engine_config_without_path_or_env_var_errors() {
    std::env::remove_var("XEC_CONFIG");
    let err = load_engine_config(None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
  }

  #[test]
  #[allow(unused)]
  fn indexmap_import_is_unused_placeholder() {
    let _: IndexMap<String, HostConfig> = IndexMap::new();
  }
}
