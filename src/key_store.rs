//! Process-wide signing key store: a map from `certificate_id` to private
//! key, populated once at startup and treated as immutable thereafter
//! (spec §5, "Shared resources").
//!
//! Keys are PEM-encoded SEC1 `EC PRIVATE KEY` files under
//! `<storage_root>/keys/<certificate_id>.pem`, directory mode 0700, file
//! mode 0600 (spec §6). The directory is initialized exactly once
//! (`init-once` semantics) via [`tokio::sync::OnceCell`].

use p256::ecdsa::SigningKey;
use p256::elliptic_curve::pkcs8::DecodePrivateKey as _;
use p256::elliptic_curve::sec1::{DecodeEcPrivateKey as _, EncodeEcPrivateKey as _};
use p256::pkcs8::LineEnding;
use p256::SecretKey;
use rand_core::OsRng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

use crate::error::{OtaError, Result};

pub const DEFAULT_KEY_ID: &str = "default";
pub const SIGNATURE_ALGORITHM: &str = "ecdsa-secp256r1";

pub struct KeyStore {
    dir: PathBuf,
    keys: RwLock<HashMap<String, Arc<SigningKey>>>,
    init: OnceCell<()>,
}

impl KeyStore {
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            dir: storage_root.as_ref().join("keys"),
            keys: RwLock::new(HashMap::new()),
            init: OnceCell::new(),
        }
    }

    /// Initializes the key directory exactly once, generating the default
    /// key if absent.
    pub async fn ensure_initialized(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                tokio::fs::create_dir_all(&self.dir).await?;
                set_dir_mode(&self.dir)?;
                self.load_or_generate(DEFAULT_KEY_ID).await?;
                Ok::<(), OtaError>(())
            })
            .await?;
        Ok(())
    }

    async fn load_or_generate(&self, certificate_id: &str) -> Result<Arc<SigningKey>> {
        let path = self.dir.join(format!("{certificate_id}.pem"));
        let key = if path.exists() {
            let pem = tokio::fs::read_to_string(&path).await?;
            SecretKey::from_pkcs8_pem(&pem)
                .or_else(|_| SecretKey::from_sec1_pem(&pem))
                .map_err(|e| OtaError::StoreError(format!("invalid signing key PEM: {e}")))?
        } else {
            let secret = SecretKey::random(&mut OsRng);
            let pem = secret
                .to_sec1_pem(LineEnding::LF)
                .map_err(|e| OtaError::StoreError(format!("failed to encode signing key: {e}")))?;
            tokio::fs::write(&path, pem.as_bytes()).await?;
            set_file_mode(&path)?;
            info!(certificate_id, "Generated new signing key");
            secret
        };

        let signing_key = Arc::new(SigningKey::from(key));
        self.keys
            .write()
            .await
            .insert(certificate_id.to_string(), Arc::clone(&signing_key));
        Ok(signing_key)
    }

    /// Returns the signing key for `certificate_id`, loading/generating it
    /// if this is the first reference to it this process.
    pub async fn get_or_create(&self, certificate_id: &str) -> Result<Arc<SigningKey>> {
        if let Some(key) = self.keys.read().await.get(certificate_id) {
            return Ok(Arc::clone(key));
        }
        self.load_or_generate(certificate_id).await
    }

    pub async fn get(&self, certificate_id: &str) -> Option<Arc<SigningKey>> {
        self.keys.read().await.get(certificate_id).cloned()
    }
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_default_key_on_first_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.ensure_initialized().await.unwrap();
        assert!(store.get(DEFAULT_KEY_ID).await.is_some());
        assert!(dir.path().join("keys").join("default.pem").exists());
    }

    #[tokio::test]
    async fn reloads_same_key_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = KeyStore::new(dir.path());
        store_a.ensure_initialized().await.unwrap();
        let key_a = store_a.get(DEFAULT_KEY_ID).await.unwrap();

        let store_b = KeyStore::new(dir.path());
        store_b.ensure_initialized().await.unwrap();
        let key_b = store_b.get(DEFAULT_KEY_ID).await.unwrap();

        use p256::ecdsa::signature::Signer;
        let sig_a: p256::ecdsa::Signature = key_a.sign(b"hello");
        let sig_b: p256::ecdsa::Signature = key_b.sign(b"hello");
        assert_eq!(sig_a.to_bytes(), sig_b.to_bytes());
    }
}
