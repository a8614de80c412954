//! On-disk gateway state: identity keypair and the desktop trust binding.
//!
//! Layout:
//!
//! ```text
//! <state-dir>/
//!   gateway.key   # base64 Ed25519 seed, mode 0600 on POSIX
//!   desktop.pub   # base64 Ed25519 public key, present iff claimed
//! ```
//!
//! Writes go to a temp sibling, are fsynced, then renamed into place, so a
//! crash never leaves a partially written file observable as committed.

use phb_core::crypto::{self, Keypair};
use phb_core::{GatewayError, GwResult};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

const GATEWAY_KEY_FILE: &str = "gateway.key";
const DESKTOP_PUB_FILE: &str = "desktop.pub";

/// Process-wide persistent state. The desktop binding is one-shot: readers
/// see the pre- or post-claim snapshot atomically.
pub struct StateStore {
    dir: PathBuf,
    identity: Keypair,
    desktop: RwLock<Option<String>>,
}

impl StateStore {
    /// Open the state directory, creating it and a fresh identity if needed.
    /// Idempotent across restarts. A corrupt key or binding file is an error;
    /// the operator resolves it by deleting the state directory.
    pub fn load_or_init(dir: &Path) -> GwResult<Self> {
        std::fs::create_dir_all(dir)?;

        let key_path = dir.join(GATEWAY_KEY_FILE);
        let identity = if key_path.exists() {
            let raw = std::fs::read_to_string(&key_path)?;
            Keypair::from_seed_b64(raw.trim())
                .map_err(|e| GatewayError::State(format!("corrupt {}: {e}", key_path.display())))?
        } else {
            let identity = Keypair::generate();
            atomic_write(&key_path, identity.seed_b64().as_bytes(), true)?;
            info!(path = %key_path.display(), "generated new gateway identity");
            identity
        };

        let desktop_path = dir.join(DESKTOP_PUB_FILE);
        let desktop = if desktop_path.exists() {
            let raw = std::fs::read_to_string(&desktop_path)?;
            let key = raw.trim().to_string();
            if !crypto::is_valid_public_key_b64(&key) {
                return Err(GatewayError::State(format!(
                    "corrupt {}: not a valid Ed25519 public key",
                    desktop_path.display()
                )));
            }
            Some(key)
        } else {
            None
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            identity,
            desktop: RwLock::new(desktop),
        })
    }

    pub fn identity(&self) -> &Keypair {
        &self.identity
    }

    pub fn gateway_public_key_b64(&self) -> String {
        self.identity.public_key_b64()
    }

    pub async fn is_claimed(&self) -> bool {
        self.desktop.read().await.is_some()
    }

    pub async fn desktop_public_key(&self) -> Option<String> {
        self.desktop.read().await.clone()
    }

    /// Bind the desktop public key. One-shot: fails once a binding exists.
    pub async fn bind_desktop(&self, public_key_b64: &str) -> GwResult<()> {
        if !crypto::is_valid_public_key_b64(public_key_b64) {
            return Err(GatewayError::Auth("invalid desktop public key".into()));
        }
        let mut guard = self.desktop.write().await;
        if guard.is_some() {
            return Err(GatewayError::AlreadyClaimed);
        }
        atomic_write(&self.dir.join(DESKTOP_PUB_FILE), public_key_b64.as_bytes(), false)?;
        *guard = Some(public_key_b64.to_string());
        info!("desktop claimed the gateway");
        Ok(())
    }
}

/// Write to a temp sibling, fsync, then rename into place.
fn atomic_write(path: &Path, contents: &[u8], private: bool) -> GwResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut opts = std::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        if private {
            restrict_mode(&mut opts);
        }
        let mut file = opts.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_mode(opts: &mut std::fs::OpenOptions) {
    use std::os::unix::fs::OpenOptionsExt;
    opts.mode(0o600);
}

// Windows has no POSIX modes; the key file inherits directory ACLs.
#[cfg(not(unix))]
fn restrict_mode(_opts: &mut std::fs::OpenOptions) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_or_init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = StateStore::load_or_init(dir.path()).unwrap();
        let second = StateStore::load_or_init(dir.path()).unwrap();
        assert_eq!(first.gateway_public_key_b64(), second.gateway_public_key_b64());
        assert!(!second.is_claimed().await);
    }

    #[tokio::test]
    async fn bind_desktop_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load_or_init(dir.path()).unwrap();
        let desktop = Keypair::generate();
        store.bind_desktop(&desktop.public_key_b64()).await.unwrap();
        assert!(store.is_claimed().await);
        assert_eq!(store.desktop_public_key().await, Some(desktop.public_key_b64()));

        let other = Keypair::generate();
        let err = store.bind_desktop(&other.public_key_b64()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyClaimed));
        // Re-presenting the same key is rejected too.
        let err = store.bind_desktop(&desktop.public_key_b64()).await.unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyClaimed));
    }

    #[tokio::test]
    async fn binding_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = Keypair::generate();
        {
            let store = StateStore::load_or_init(dir.path()).unwrap();
            store.bind_desktop(&desktop.public_key_b64()).await.unwrap();
        }
        let store = StateStore::load_or_init(dir.path()).unwrap();
        assert_eq!(store.desktop_public_key().await, Some(desktop.public_key_b64()));
    }

    #[tokio::test]
    async fn rejects_garbage_desktop_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::load_or_init(dir.path()).unwrap();
        assert!(store.bind_desktop("not a key").await.is_err());
        assert!(!store.is_claimed().await);
        assert!(!dir.path().join(DESKTOP_PUB_FILE).exists());
    }

    #[test]
    fn corrupt_gateway_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(GATEWAY_KEY_FILE), "@@@ garbage @@@").unwrap();
        assert!(StateStore::load_or_init(dir.path()).is_err());
    }

    #[test]
    fn corrupt_desktop_binding_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        StateStore::load_or_init(dir.path()).unwrap();
        std::fs::write(dir.path().join(DESKTOP_PUB_FILE), "AAAA").unwrap();
        assert!(StateStore::load_or_init(dir.path()).is_err());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        StateStore::load_or_init(dir.path()).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        StateStore::load_or_init(dir.path()).unwrap();
        let mode = std::fs::metadata(dir.path().join(GATEWAY_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
