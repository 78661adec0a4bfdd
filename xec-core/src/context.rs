use std::collections::HashMap;
use std::time::Duration;

use xec_config::Overlay;

use crate::command::AdapterDescriptor;

/// An engine-side overlay, structurally identical to `xec_config::Overlay`
/// but with `timeout` already parsed to a `Duration` and `adapter` already
/// resolved to a live [`AdapterDescriptor`] rather than a config-time
/// descriptor, since by the time a caller builds a `.with()`/`.within()`
/// scope the auth material (password, key) has to be real, not a string
/// pulled straight out of a TOML file.
#[derive(Debug, Clone, Default)]
pub struct ContextOverlay {
  pub timeout: Option<Duration>,
  pub shell: Option<bool>,
  pub cwd: Option<String>,
  pub env: HashMap<String, String>,
  pub throw_on_nonzero: Option<bool>,
  pub encoding: Option<String>,
  pub exec_flags: Vec<String>,
  pub adapter: Option<AdapterDescriptor>,
}

impl ContextOverlay {
  /// Same composition rule as `xec_config::merge_overlay`: scalars
  /// last-writer-wins favoring `patch`, `env` merges key-wise, `exec_flags`
  /// concatenates base-then-patch.
  pub fn merge(&self, patch: &ContextOverlay) -> ContextOverlay {
    let mut env = self.env.clone();
    env.extend(patch.env.clone());

    let mut exec_flags = self.exec_flags.clone();
    exec_flags.extend(patch.exec_flags.clone());

    ContextOverlay {
      timeout: patch.timeout.or(self.timeout),
      shell: patch.shell.or(self.shell),
      cwd: patch.cwd.clone().or_else(|| self.cwd.clone()),
      env,
      throw_on_nonzero: patch.throw_on_nonzero.or(self.throw_on_nonzero),
      encoding: patch.encoding.clone().or_else(|| self.encoding.clone()),
      exec_flags,
      adapter: patch.adapter.clone().or_else(|| self.adapter.clone()),
    }
  }

  pub fn from_config(overlay: &Overlay) -> anyhow::Result<ContextOverlay> {
    let timeout = overlay
      .timeout
      .as_deref()
      .map(xec_config::parse_timeout)
      .transpose()?
      .map(Duration::from_millis);
    Ok(ContextOverlay {
      timeout,
      shell: overlay.shell,
      cwd: overlay.cwd.clone(),
      env: overlay.env.clone(),
      throw_on_nonzero: overlay.throw_on_nonzero,
      encoding: overlay.encoding.clone(),
      exec_flags: overlay.exec_flags.clone(),
      adapter: None,
    })
  }
}

tokio::task_local! {
  static SCOPE_STACK: std::cell::RefCell<Vec<ContextOverlay>>;
}

/// Runs `fut` with `overlay` pushed onto the current task's dynamic scope
/// stack, popping it when `fut` completes. This is what `Engine::within`
/// is built on: unlike `Engine::with`, it doesn't hand back a new `Engine`
/// value, it changes what every call made *during* `fut` sees, including
/// calls made through an `Engine` captured before this function ran -
/// the async-local analogue of the source's async-local `within`.
pub async fn scoped<F, T>(overlay: ContextOverlay, fut: F) -> T
where
  F: std::future::Future<Output = T>,
{
  let mut stack = current_stack_snapshot();
  stack.push(overlay);
  SCOPE_STACK.scope(std::cell::RefCell::new(stack), fut).await
}

fn current_stack_snapshot() -> Vec<ContextOverlay> {
  SCOPE_STACK
    .try_with(|stack| stack.borrow().clone())
    .unwrap_or_default()
}

/// Folds every overlay currently on the task-local scope stack, outermost
/// first, so the innermost `within()` call wins ties.
pub fn current_scope() -> ContextOverlay {
  let stack = current_stack_snapshot();
  let mut merged = ContextOverlay::default();
  for overlay in &stack {
    merged = merged.merge(overlay);
  }
  merged
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn merge_prefers_patch_scalars() {
    let base = ContextOverlay { cwd: Some("/base".into()), ..Default::default() };
    let patch = ContextOverlay { cwd: Some("/patch".into()), ..Default::default() };
    let merged = base.merge(&patch);
    assert_eq!(merged.cwd.as_deref(), Some("/patch"));
  }

  #[tokio::test]
  async fn scoped_overlay_is_visible_inside_and_cleared_outside() {
    assert!(current_scope().cwd.is_none());
    let overlay = ContextOverlay { cwd: Some("/scoped".into()), ..Default::default() };
    scoped(overlay, async {
      assert_eq!(current_scope().cwd.as_deref(), Some("/scoped"));
    })
    .await;
  }

  #[tokio::test]
  async fn nested_scopes_compose_innermost_wins() {
    let outer = ContextOverlay { cwd: Some("/outer".into()), ..Default::default() };
    scoped(outer, async {
      let inner = ContextOverlay { cwd: Some("/inner".into()), ..Default::default() };
      scoped(inner, async {
        assert_eq!(current_scope().cwd.as_deref(), Some("/inner"));
      })
      .await;
      assert_eq!(current_scope().cwd.as_deref(), Some("/outer"));
    })
    .await;
  }
}
