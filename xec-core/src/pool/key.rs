use std::fmt;

use sha2::{Digest, Sha256};

use crate::command::SshAuth;

/// Identity used to look up a pooled connection (§3: "two commands with the
/// same key share a connection"). `auth_fingerprint` is a hash of the auth
/// material rather than the material itself, so the key can be logged and
/// used as a map key without risking a credential leak.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
  pub user: String,
  pub host: String,
  pub port: u16,
  pub auth_fingerprint: String,
}

impl ConnectionKey {
  pub fn new(user: &str, host: &str, port: u16, auth: &SshAuth) -> Self {
    Self {
      user: user.to_string(),
      host: host.to_string(),
      port,
      auth_fingerprint: fingerprint(auth),
    }
  }
}

impl fmt::Display for ConnectionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}:{}", self.user, self.host, self.port)
  }
}

fn fingerprint(auth: &SshAuth) -> String {
  let mut hasher = Sha256::new();
  match auth {
    SshAuth::Password(p) => {
      hasher.update(b"password:");
      hasher.update(p.as_bytes());
    }
    SshAuth::PrivateKey { key, passphrase } => {
      hasher.update(b"key:");
      hasher.update(key.as_bytes());
      if let Some(p) = passphrase {
        hasher.update(p.as_bytes());
      }
    }
    SshAuth::Agent => {
      hasher.update(b"agent");
    }
  }
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_credentials_produce_same_key() {
    let a = ConnectionKey::new("u", "h", 22, &SshAuth::Password("p".into()));
    let b = ConnectionKey::new("u", "h", 22, &SshAuth::Password("p".into()));
    assert_eq!(a, b);
  }

  #[test]
  fn different_password_produces_different_key() {
    let a = ConnectionKey::new("u", "h", 22, &SshAuth::Password("p1".into()));
    let b = ConnectionKey::new("u", "h", 22, &SshAuth::Password("p2".into()));
    assert_ne!(a, b);
  }
}
