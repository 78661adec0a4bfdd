use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Handle;
use russh::keys::PrivateKeyWithHashAlg;

use crate::command::SshAuth;
use crate::error::{Error, Result};

/// `russh`'s `client::Handler` trait is how a connection verifies the
/// server's host key. This crate has no local `known_hosts` store to check
/// against, so every presented key is accepted and logged - the same
/// trust-on-first-use posture most scripting-oriented SSH tooling takes
/// when it isn't also acting as an interactive terminal client.
pub struct ClientHandler {
  pub host: String,
}

#[async_trait]
impl russh::client::Handler for ClientHandler {
  type Error = russh::Error;

  async fn check_server_key(
    &mut self,
    server_public_key: &russh::keys::ssh_key::PublicKey,
  ) -> std::result::Result<bool, Self::Error> {
    tracing::debug!(
      host = %self.host,
      fingerprint = %server_public_key.fingerprint(Default::default()),
      "accepting ssh host key"
    );
    Ok(true)
  }
}

/// Authenticates `handle` for `user` using `auth`, mapping every failure
/// into [`Error::Authentication`] rather than the transport-level
/// `Error::Connection`, since a rejected credential is a distinct failure
/// mode callers may want to handle differently (e.g. not retrying).
pub async fn authenticate(
  handle: &mut Handle<ClientHandler>,
  user: &str,
  auth: &SshAuth,
) -> Result<()> {
  let result = match auth {
    SshAuth::Password(password) => handle
      .authenticate_password(user, password)
      .await
      .map_err(|e| Error::Authentication(format!("password auth failed: {e}")))?,
    SshAuth::PrivateKey { key, passphrase } => {
      let key_pair = russh::keys::decode_secret_key(key, passphrase.as_deref())
        .map_err(|e| Error::Authentication(format!("invalid private key: {e}")))?;
      handle
        .authenticate_publickey(
          user,
          PrivateKeyWithHashAlg::new(Arc::new(key_pair), handle.best_supported_rsa_hash().await.ok().flatten()),
        )
        .await
        .map_err(|e| Error::Authentication(format!("publickey auth failed: {e}")))?
    }
    SshAuth::Agent => authenticate_with_agent(handle, user).await?,
  };

  if !result.success() {
    return Err(Error::Authentication(
      "server rejected the supplied credentials".to_string(),
    ));
  }
  Ok(())
}

/// Authenticates via a running `ssh-agent`, connecting over `SSH_AUTH_SOCK`
/// and trying each identity the agent offers in turn until one succeeds.
async fn authenticate_with_agent(
  handle: &mut Handle<ClientHandler>,
  user: &str,
) -> Result<russh::client::AuthResult> {
  let mut agent = russh::keys::agent::client::AgentClient::connect_env()
    .await
    .map_err(|e| Error::Authentication(format!("failed to connect to ssh-agent: {e}")))?;
  let identities = agent
    .request_identities()
    .await
    .map_err(|e| Error::Authentication(format!("ssh-agent has no identities: {e}")))?;
  if identities.is_empty() {
    return Err(Error::Authentication(
      "ssh-agent reported no identities".to_string(),
    ));
  }
  for identity in identities {
    let (result, returned_agent) = handle
      .authenticate_publickey_with(user, identity, None, agent)
      .await
      .map_err(|e| Error::Authentication(format!("agent auth failed: {e}")))?;
    agent = returned_agent;
    if result.success() {
      return Ok(result);
    }
  }
  Err(Error::Authentication(
    "server rejected every identity offered by ssh-agent".to_string(),
  ))
}
