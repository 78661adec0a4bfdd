use indexmap::IndexMap;

use crate::{
  overlay::merge_overlay, types::Overlay, types::Profile, Error, Result,
};

/// Resolves a named profile's overlay, walking its `extends` chain (parent
/// applied first, so the named profile's own fields win). Errors on an
/// unknown profile name or a cycle in `extends`.
pub fn resolve_profile(
  profiles: &IndexMap<String, Profile>,
  name: &str,
) -> Result<Overlay> {
  let mut seen = Vec::new();
  resolve_inner(profiles, name, &mut seen)
}

fn resolve_inner(
  profiles: &IndexMap<String, Profile>,
  name: &str,
  seen: &mut Vec<String>,
) -> Result<Overlay> {
  if seen.iter().any(|s| s == name) {
    seen.push(name.to_string());
    return Err(Error::ProfileExtendsCycle(seen.join(" -> ")));
  }
  seen.push(name.to_string());

  let profile = profiles
    .get(name)
    .ok_or_else(|| Error::ProfileNotFound(name.to_string()))?;

  let base = match &profile.extends {
    Some(parent) => resolve_inner(profiles, parent, seen)?,
    None => Overlay::default(),
  };

  Ok(merge_overlay(&base, &profile.overlay))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn profiles_with(
    pairs: &[(&str, Option<&str>, Option<&str>)],
  ) -> IndexMap<String, Profile> {
    pairs
      .iter()
      .map(|(name, extends, cwd)| {
        (
          name.to_string(),
          Profile {
            extends: extends.map(str::to_string),
            overlay: Overlay {
              cwd: cwd.map(str::to_string),
              ..Default::default()
            },
          },
        )
      })
      .collect()
  }

  #[test]
  fn resolves_single_profile() {
    let profiles = profiles_with(&[("base", None, Some("/base"))]);
    let overlay = resolve_profile(&profiles, "base").unwrap();
    assert_eq!(overlay.cwd.as_deref(), Some("/base"));
  }

  #[test]
  fn child_overrides_parent() {
    let profiles = profiles_with(&[
      ("base", None, Some("/base")),
      ("child", Some("base"), Some("/child")),
    ]);
    let overlay = resolve_profile(&profiles, "child").unwrap();
    assert_eq!(overlay.cwd.as_deref(), Some("/child"));
  }

  #[test]
  fn detects_cycles() {
    let profiles = profiles_with(&[
      ("a", Some("b"), None),
      ("b", Some("a"), None),
    ]);
    assert!(matches!(
      resolve_profile(&profiles, "a"),
      Err(Error::ProfileExtendsCycle(_))
    ));
  }

  #[test]
  fn missing_profile_errors() {
    let profiles = profiles_with(&[("base", None, None)]);
    assert!(matches!(
      resolve_profile(&profiles, "missing"),
      Err(Error::ProfileNotFound(_))
    ));
  }
}
