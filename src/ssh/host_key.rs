// ABOUTME: Host key verification policy for outgoing connections.
// ABOUTME: Either accepts any key (insecure) or checks against a known_hosts file.

use super::config::Target;
use super::error::{Error, Result};
use russh::keys::known_hosts::known_host_keys_path;
use russh::keys::ssh_key;
use std::path::{Path, PathBuf};

/// How the server's host key is checked during the handshake.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Accept every host key. Unsafe outside of development and testing.
    Insecure,
    /// Accept only keys listed for the target in a known_hosts file.
    KnownHosts {
        path: PathBuf,
        keys: Vec<ssh_key::PublicKey>,
    },
}

impl HostKeyPolicy {
    /// Locate and read the known_hosts store before anything else happens.
    ///
    /// Returns `None` in insecure mode. In verified mode a missing or
    /// unreadable store fails the connect before the target is even looked at.
    pub fn open_store(insecure: bool, known_hosts: Option<&Path>) -> Result<Option<PathBuf>> {
        if insecure {
            return Ok(None);
        }

        let path = match known_hosts {
            Some(path) => path.to_path_buf(),
            None => default_known_hosts_path()?,
        };

        std::fs::read_to_string(&path).map_err(|e| Error::HostKeyStore {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        Ok(Some(path))
    }

    /// Build the policy for `target` from a store returned by [`open_store`](Self::open_store).
    pub fn resolve(store: Option<PathBuf>, target: &Target) -> Result<Self> {
        let Some(path) = store else {
            return Ok(HostKeyPolicy::Insecure);
        };

        let keys = known_host_keys_path(&target.host, target.port, &path)
            .map_err(|e| Error::HostKeyStore {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .into_iter()
            .map(|(_line, key)| key)
            .collect::<Vec<_>>();

        tracing::debug!(
            "loaded {} known host key(s) for {} from {}",
            keys.len(),
            target,
            path.display()
        );

        Ok(HostKeyPolicy::KnownHosts { path, keys })
    }

    /// Decide whether the server key presented for `target` is acceptable.
    pub fn accepts(&self, target: &Target, server_key: &ssh_key::PublicKey) -> bool {
        match self {
            HostKeyPolicy::Insecure => {
                tracing::warn!("accepting unverified host key for {}", target);
                true
            }
            HostKeyPolicy::KnownHosts { path, keys } => {
                let known = keys
                    .iter()
                    .any(|key| key.key_data() == server_key.key_data());
                if !known {
                    tracing::warn!(
                        "host key for {} not found in {}",
                        target,
                        path.display()
                    );
                }
                known
            }
        }
    }
}

fn default_known_hosts_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").map_err(|_| Error::HostKeyStore {
        path: PathBuf::from("~/.ssh/known_hosts"),
        reason: "HOME not set".to_string(),
    })?;
    Ok(PathBuf::from(home).join(".ssh").join("known_hosts"))
}
