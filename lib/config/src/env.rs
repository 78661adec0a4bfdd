use std::collections::HashMap;

use crate::types::Overlay;

/// Applies `XEC_TIMEOUT`, `XEC_SHELL`, `XEC_CWD` on top of `overlay`.
/// `XEC_CONFIG`/`XEC_PROFILE` select *which* config file/profile to load in
/// the first place and are read by the caller before this point, not here.
pub fn apply_env_overrides(
  overlay: Overlay,
  env: &HashMap<String, String>,
) -> Overlay {
  let mut overlay = overlay;
  if let Some(timeout) = env.get("XEC_TIMEOUT") {
    overlay.timeout = Some(timeout.clone());
  }
  if let Some(shell) = env.get("XEC_SHELL") {
    overlay.shell = Some(matches!(shell.as_str(), "1" | "true" | "yes"));
  }
  if let Some(cwd) = env.get("XEC_CWD") {
    overlay.cwd = Some(cwd.clone());
  }
  overlay
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn overrides_only_set_vars() {
    let mut env = HashMap::new();
    env.insert("XEC_TIMEOUT".to_string(), "30s".to_string());
    let overlay = apply_env_overrides(Overlay::default(), &env);
    assert_eq!(overlay.timeout.as_deref(), Some("30s"));
    assert_eq!(overlay.cwd, None);
  }

  #[test]
  fn shell_accepts_truthy_strings() {
    let mut env = HashMap::new();
    env.insert("XEC_SHELL".to_string(), "true".to_string());
    let overlay = apply_env_overrides(Overlay::default(), &env);
    assert_eq!(overlay.shell, Some(true));
  }
}
