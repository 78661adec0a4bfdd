use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// One generated askpass script: the password it emits, zeroized on drop,
/// and the path of the script that was written to disk for it.
struct Entry {
  password: Zeroizing<String>,
  script_path: PathBuf,
}

/// In-memory, scrubbable store for `sudo -A` passwords (§4.10). Every
/// password is keyed by a random id that also appears in its generated
/// askpass script's filename (`askpass-<id>.sh`); the script reads the
/// password back out of `SUDO_PASS_<id>`, set via [`create_secure_env`],
/// rather than embedding the literal password text in the script body -
/// this sidesteps shell-quoting the password at all and keeps the two
/// artifacts (script, env) only meaningful together.
pub struct SecurePasswordHandler {
  entries: Mutex<HashMap<String, Entry>>,
  disposed: AtomicBool,
}

impl Default for SecurePasswordHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl SecurePasswordHandler {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      disposed: AtomicBool::new(false),
    }
  }

  fn check_disposed(&self) -> Result<()> {
    if self.disposed.load(Ordering::Acquire) {
      return Err(Error::Disposed);
    }
    Ok(())
  }

  /// Writes a mode-`0o700` askpass script under the system temp directory
  /// that prints `$SUDO_PASS_<id>` when invoked, and remembers `password`
  /// under that id. Returns the script's path.
  pub async fn create_askpass_script(&self, password: impl Into<String>) -> Result<PathBuf> {
    self.check_disposed()?;
    let id = random_id();
    let script_path = std::env::temp_dir().join(format!("askpass-{id}.sh"));
    let script = format!("#!/bin/sh\nprintf '%s\\n' \"$SUDO_PASS_{id}\"\n");

    tokio::fs::write(&script_path, script)
      .await
      .map_err(|e| Error::Adapter(format!("failed to write askpass script: {e}")))?;
    set_executable(&script_path).await?;

    let mut entries = self.entries.lock().await;
    entries.insert(
      id,
      Entry {
        password: Zeroizing::new(password.into()),
        script_path: script_path.clone(),
      },
    );
    Ok(script_path)
  }

  /// Builds the environment a `sudo -A` child process needs: `SUDO_ASKPASS`
  /// pointing at `askpass_path`, plus the `SUDO_PASS_<id>` variable that
  /// script reads its password from. Merges over `base_env` when given.
  pub async fn create_secure_env(
    &self,
    askpass_path: &std::path::Path,
    base_env: Option<HashMap<String, String>>,
  ) -> Result<HashMap<String, String>> {
    self.check_disposed()?;
    let id = id_from_path(askpass_path).ok_or_else(|| {
      Error::Validation(format!(
        "{} is not a path produced by create_askpass_script",
        askpass_path.display()
      ))
    })?;
    let entries = self.entries.lock().await;
    let entry = entries
      .get(&id)
      .ok_or_else(|| Error::Validation(format!("no password stored for askpass id {id}")))?;

    let mut env = base_env.unwrap_or_default();
    env.insert(
      "SUDO_ASKPASS".to_string(),
      askpass_path.display().to_string(),
    );
    env.insert(format!("SUDO_PASS_{id}"), entry.password.to_string());
    Ok(env)
  }

  /// Unlinks the single script `askpass_path` refers to and forgets its
  /// password, without touching any other script this handler is tracking.
  /// Used once a single sudo invocation that used it has finished, so two
  /// concurrent `sudo` calls sharing a handler don't clean up each other's
  /// in-flight scripts the way a blanket [`SecurePasswordHandler::cleanup`]
  /// would.
  pub async fn remove_script(&self, askpass_path: &std::path::Path) -> Result<()> {
    self.check_disposed()?;
    let Some(id) = id_from_path(askpass_path) else {
      return Ok(());
    };
    let mut entries = self.entries.lock().await;
    if let Some(entry) = entries.remove(&id) {
      let _ = tokio::fs::remove_file(&entry.script_path).await;
    }
    Ok(())
  }

  /// Unlinks every generated script and drops every stored password,
  /// zeroizing each buffer as it goes out of scope.
  pub async fn cleanup(&self) -> Result<()> {
    self.check_disposed()?;
    let mut entries = self.entries.lock().await;
    for (_, entry) in entries.drain() {
      let _ = tokio::fs::remove_file(&entry.script_path).await;
    }
    Ok(())
  }

  /// Idempotent: the first call cleans up every script and password; later
  /// calls are a no-op. Every other method fails with [`Error::Disposed`]
  /// once this has run.
  pub async fn dispose(&self) -> Result<()> {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let mut entries = self.entries.lock().await;
    for (_, entry) in entries.drain() {
      let _ = tokio::fs::remove_file(&entry.script_path).await;
    }
    Ok(())
  }
}

fn id_from_path(path: &std::path::Path) -> Option<String> {
  let name = path.file_stem()?.to_str()?;
  name.strip_prefix("askpass-").map(str::to_string)
}

fn random_id() -> String {
  let bytes: [u8; 8] = rand::rng().random();
  hex::encode(bytes)
}

#[cfg(unix)]
async fn set_executable(path: &std::path::Path) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  let perms = std::fs::Permissions::from_mode(0o700);
  tokio::fs::set_permissions(path, perms)
    .await
    .map_err(|e| Error::Adapter(format!("failed to chmod askpass script: {e}")))
}

#[cfg(not(unix))]
async fn set_executable(_path: &std::path::Path) -> Result<()> {
  Ok(())
}

/// Replaces every occurrence of `password` in `text` with `***MASKED***`.
/// Plain substring replacement rather than a regex, so characters that
/// would otherwise need escaping in a pattern (`.`, `*`, `(`, …) are
/// matched literally either way.
pub fn mask_password(text: &str, password: &str) -> String {
  if password.is_empty() {
    return text.to_string();
  }
  text.replace(password, "***MASKED***")
}

/// Generates a password of `len` characters drawn from upper/lower/digit/
/// symbol classes, guaranteeing at least one of each when `len >= 8`.
pub fn generate_password(len: usize) -> String {
  const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
  const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
  const DIGIT: &[u8] = b"0123456789";
  const SYMBOL: &[u8] = b"!@#$%^&*()-_=+";
  let classes: [&[u8]; 4] = [UPPER, LOWER, DIGIT, SYMBOL];

  let mut rng = rand::rng();
  let mut chars: Vec<u8> = Vec::with_capacity(len.max(classes.len()));

  if len >= 8 {
    for class in classes {
      chars.push(class[rng.random_range(0..class.len())]);
    }
  }
  while chars.len() < len {
    let class = classes[rng.random_range(0..classes.len())];
    chars.push(class[rng.random_range(0..class.len())]);
  }
  chars.shuffle(&mut rng);
  String::from_utf8(chars).expect("all character classes are ASCII")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn askpass_script_is_executable_and_reads_password() {
    let handler = SecurePasswordHandler::new();
    let path = handler.create_askpass_script("s3cr3t").await.unwrap();
    assert!(path.file_name().unwrap().to_str().unwrap().starts_with("askpass-"));
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      let mode = std::fs::metadata(&path).unwrap().permissions().mode();
      assert_eq!(mode & 0o777, 0o700);
    }
    handler.cleanup().await.unwrap();
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn secure_env_carries_askpass_and_password() {
    let handler = SecurePasswordHandler::new();
    let path = handler.create_askpass_script("s3cr3t").await.unwrap();
    let env = handler.create_secure_env(&path, None).await.unwrap();
    assert_eq!(env.get("SUDO_ASKPASS").unwrap(), &path.display().to_string());
    let password_key = env
      .keys()
      .find(|k| k.starts_with("SUDO_PASS_"))
      .expect("password env var present");
    assert_eq!(env.get(password_key).unwrap(), "s3cr3t");
    handler.cleanup().await.unwrap();
  }

  #[tokio::test]
  async fn disposed_handler_rejects_every_operation() {
    let handler = SecurePasswordHandler::new();
    handler.dispose().await.unwrap();
    assert!(matches!(
      handler.create_askpass_script("x").await,
      Err(Error::Disposed)
    ));
    // second dispose is a no-op, not an error
    handler.dispose().await.unwrap();
  }

  #[test]
  fn mask_password_replaces_every_occurrence() {
    let masked = mask_password("user:s3cr3t@host s3cr3t again", "s3cr3t");
    assert!(!masked.contains("s3cr3t"));
    assert_eq!(masked, "user:***MASKED***@host ***MASKED*** again");
  }

  #[test]
  fn mask_password_handles_regex_special_characters() {
    let password = "p@ss(word).*+";
    let text = format!("login with {password} please");
    let masked = mask_password(&text, password);
    assert!(!masked.contains(password));
    assert!(masked.contains("***MASKED***"));
  }

  #[test]
  fn generate_password_guarantees_all_classes_above_length_8() {
    let password = generate_password(16);
    assert_eq!(password.len(), 16);
    assert!(password.chars().any(|c| c.is_ascii_uppercase()));
    assert!(password.chars().any(|c| c.is_ascii_lowercase()));
    assert!(password.chars().any(|c| c.is_ascii_digit()));
    assert!(password.chars().any(|c| !c.is_ascii_alphanumeric()));
  }
}
