use crate::types::Overlay;

/// Composes `patch` over `base`: scalars last-writer-wins (`patch` wins when
/// set), `env` merges key-wise (`patch` keys override `base` keys of the same
/// name), `exec_flags` concatenates (`base` then `patch`). This is the fixed
/// rule `.with()`/`.within()` overlays use - distinct from the configurable
/// `merge_nested`/`extend_array` toggles in [`crate::merge_objects`], which
/// govern merging config *files* rather than per-call overlays.
pub fn merge_overlay(base: &Overlay, patch: &Overlay) -> Overlay {
  let mut env = base.env.clone();
  env.extend(patch.env.clone());

  let mut exec_flags = base.exec_flags.clone();
  exec_flags.extend(patch.exec_flags.clone());

  Overlay {
    timeout: patch.timeout.clone().or_else(|| base.timeout.clone()),
    shell: patch.shell.or(base.shell),
    cwd: patch.cwd.clone().or_else(|| base.cwd.clone()),
    env,
    throw_on_nonzero: patch.throw_on_nonzero.or(base.throw_on_nonzero),
    encoding: patch.encoding.clone().or_else(|| base.encoding.clone()),
    exec_flags,
    adapter: patch.adapter.clone().or_else(|| base.adapter.clone()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::AdapterDescriptorConfig;
  use std::collections::HashMap;

  #[test]
  fn scalars_are_last_writer_wins() {
    let base = Overlay {
      cwd: Some("/base".into()),
      timeout: Some("10s".into()),
      ..Default::default()
    };
    let patch = Overlay {
      cwd: Some("/patch".into()),
      ..Default::default()
    };
    let merged = merge_overlay(&base, &patch);
    assert_eq!(merged.cwd.as_deref(), Some("/patch"));
    // patch did not set timeout, base value survives
    assert_eq!(merged.timeout.as_deref(), Some("10s"));
  }

  #[test]
  fn env_maps_merge_key_wise() {
    let mut base_env = HashMap::new();
    base_env.insert("A".to_string(), "1".to_string());
    base_env.insert("B".to_string(), "1".to_string());
    let mut patch_env = HashMap::new();
    patch_env.insert("B".to_string(), "2".to_string());
    patch_env.insert("C".to_string(), "2".to_string());

    let base = Overlay { env: base_env, ..Default::default() };
    let patch = Overlay { env: patch_env, ..Default::default() };
    let merged = merge_overlay(&base, &patch);

    assert_eq!(merged.env.get("A").unwrap(), "1");
    assert_eq!(merged.env.get("B").unwrap(), "2");
    assert_eq!(merged.env.get("C").unwrap(), "2");
  }

  #[test]
  fn exec_flags_concatenate() {
    let base = Overlay { exec_flags: vec!["-it".into()], ..Default::default() };
    let patch = Overlay { exec_flags: vec!["--privileged".into()], ..Default::default() };
    let merged = merge_overlay(&base, &patch);
    assert_eq!(merged.exec_flags, vec!["-it".to_string(), "--privileged".to_string()]);
  }

  #[test]
  fn adapter_descriptor_last_writer_wins() {
    let base = Overlay {
      adapter: Some(AdapterDescriptorConfig::Local),
      ..Default::default()
    };
    let patch = Overlay {
      adapter: Some(AdapterDescriptorConfig::Docker {
        container: "web".into(),
        container_user: None,
      }),
      ..Default::default()
    };
    let merged = merge_overlay(&base, &patch);
    assert!(matches!(
      merged.adapter,
      Some(AdapterDescriptorConfig::Docker { .. })
    ));
  }
}
