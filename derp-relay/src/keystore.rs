//! Node identity persistence.
//!
//! The identity file is JSON holding the node private key:
//!
//! ```json
//! {"PrivateKey":"privkey:<64 hex digits>"}
//! ```
//!
//! It is read once at startup and only written when it does not exist yet.

use derp_types::NodePrivate;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Key path used when running as root without an explicit `config_path`.
pub const DEFAULT_ROOT_PATH: &str = "/var/lib/derper/derper.key";

/// Persisted relay identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// The node's long-term private key.
    #[serde(rename = "PrivateKey")]
    pub private_key: NodePrivate,
}

/// Key store errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// Reading the identity file failed.
    #[error("failed to read identity {path}: {source}")]
    Read {
        /// The identity file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The identity file exists but does not parse.
    #[error("failed to parse identity {path}: {source}")]
    Parse {
        /// The identity file.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// Creating the directory or writing the file failed.
    #[error("failed to write identity {path}: {source}")]
    Write {
        /// The path being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Load the identity at `path`, creating a fresh one if the file does not exist.
///
/// A file that exists but fails to parse is an error: regenerating would
/// change the relay's identity under its peers.
pub async fn load_or_create(path: &Path) -> Result<NodeIdentity, KeyStoreError> {
    match tokio::fs::read(path).await {
        Ok(content) => serde_json::from_slice(&content).map_err(|e| KeyStoreError::Parse {
            path: path.to_path_buf(),
            source: e,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => create(path).await,
        Err(e) => Err(KeyStoreError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Resolve the identity path: the configured one, else the root default.
pub fn resolve_path(configured: Option<&Path>) -> Option<PathBuf> {
    match configured {
        Some(path) if !path.as_os_str().is_empty() => Some(path.to_path_buf()),
        _ if running_as_root() => Some(PathBuf::from(DEFAULT_ROOT_PATH)),
        _ => None,
    }
}

async fn create(path: &Path) -> Result<NodeIdentity, KeyStoreError> {
    let identity = NodeIdentity {
        private_key: NodePrivate::generate(),
    };
    let write_err = |p: &Path| {
        let p = p.to_path_buf();
        move |source| KeyStoreError::Write { path: p, source }
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(write_err(dir))?;
    }

    let content = serde_json::to_vec(&identity).map_err(|e| KeyStoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    // Write a sibling file and rename it into place so readers never see a
    // partial identity.
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &content).await.map_err(write_err(&tmp))?;
    set_file_permissions_0600(&tmp).await.map_err(write_err(&tmp))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_err(path)(e));
    }

    tracing::info!(
        "Created node identity {} at {}",
        identity.private_key.public(),
        path.display()
    );
    Ok(identity)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Set file permissions to 0600 (owner only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
