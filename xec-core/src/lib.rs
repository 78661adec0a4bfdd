//! Universal command execution engine: one `Engine` façade dispatching
//! `Command`s to the local machine, SSH hosts, Docker containers, and
//! Kubernetes pods behind a single pluggable `Adapter` contract.

pub mod adapter;
pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod parallel;
pub mod pool;
pub mod registry;
pub mod result;
pub mod retry;
pub mod secure_password;
pub mod tunnel;

pub use adapter::docker::DockerAdapter;
pub use adapter::kubernetes::KubernetesAdapter;
pub use adapter::local::LocalAdapter;
pub use adapter::ssh::SshAdapter;
pub use adapter::{Adapter, FileTransfer, LogStreamOptions, LogStreaming, TunnelOptions, Tunneling};
pub use command::{
  AdapterDescriptor, Command, CommandBuilder, Stdin, SshAuth, SudoMethod, SudoOptions,
};
pub use config::{load_engine_config, ConfiguredTargets};
pub use context::ContextOverlay;
pub use engine::Engine;
pub use error::{Error, Result, TimeoutPhase};
pub use events::{Event, EventBus, TunnelKind};
pub use parallel::{ParallelOptions, ParallelResult, ParallelRunner};
pub use pool::{ConnectionKey, PoolPolicy};
pub use registry::{AdapterHandle, Registry};
pub use result::ExecutionResult;
pub use retry::{RetryOptions, retry, default_is_retryable};
pub use tunnel::{Tunnel, TunnelHandle};
