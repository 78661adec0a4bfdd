use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Engine-wide defaults, overridable per-call via an [`Overlay`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
  /// Accepts `NNN`, `NNNms`, `Ns`, `Nm`, `Nh` - parsed with [`crate::parse_timeout`].
  pub timeout: Option<String>,
  pub shell: Option<bool>,
  pub cwd: Option<String>,
  pub env: HashMap<String, String>,
  pub throw_on_nonzero: Option<bool>,
  pub encoding: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
  pub host: String,
  #[serde(default = "default_ssh_port")]
  pub port: u16,
  pub username: String,
  pub password: Option<String>,
  pub private_key: Option<String>,
  pub private_key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
  22
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
  pub container: String,
  pub user: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodConfig {
  pub pod: String,
  pub namespace: Option<String>,
  pub container: Option<String>,
}

/// A partial overlay, same shape as [`Overlay`] but every field optional so
/// it can be merged with [`crate::merge_overlay`]. `extends` names another
/// profile whose overlay is applied first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
  pub extends: Option<String>,
  #[serde(flatten)]
  pub overlay: Overlay,
}

pub type Aliases = HashMap<String, String>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
  pub name: String,
  pub path: Option<String>,
}

/// The descriptor a [`Overlay`] can pin a call to. Mirrors the tagged
/// `adapter_descriptor` union carried on every `Command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterDescriptorConfig {
  Local,
  Ssh {
    host: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    user: String,
  },
  Docker {
    container: String,
    container_user: Option<String>,
  },
  Kubernetes {
    pod: String,
    namespace: Option<String>,
    container: Option<String>,
  },
}

/// A partial option set applied on top of engine defaults for every call
/// made through a scoped engine. Composition rule (not configurable,
/// unlike [`crate::merge_objects`]'s `merge_nested`/`extend_array` flags):
/// scalars last-writer-wins, `env` merges key-wise, `exec_flags` concatenates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Overlay {
  pub timeout: Option<String>,
  pub shell: Option<bool>,
  pub cwd: Option<String>,
  pub env: HashMap<String, String>,
  pub throw_on_nonzero: Option<bool>,
  pub encoding: Option<String>,
  pub exec_flags: Vec<String>,
  pub adapter: Option<AdapterDescriptorConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub defaults: Defaults,
  pub hosts: IndexMap<String, HostConfig>,
  pub containers: IndexMap<String, ContainerConfig>,
  pub pods: IndexMap<String, PodConfig>,
  pub profiles: IndexMap<String, Profile>,
  pub aliases: Aliases,
  pub plugins: Vec<PluginConfig>,
}
